//! Telemetry message envelope and sinks.
//!
//! Every frame on the telemetry bus is a self-describing map with a `type`
//! key and a uniform envelope (`time`, `test`, `runner_id`, `journey`,
//! `context_id`, `scenario_id`, `data_id`, `transaction`). Components that
//! emit messages hold a [`SharedSink`], a cheap, cloneable send callback with
//! no back-reference to its owner.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known message types. User journeys may send additional ad-hoc types.
pub mod kind {
    pub const START: &str = "start";
    pub const END: &str = "end";
    pub const ERROR: &str = "error";
    pub const EXCEPTION: &str = "exception";
    pub const HTTP_CURL_METRICS: &str = "http_curl_metrics";
    pub const CONTROLLER_REPORT: &str = "controller_report";
    pub const DATA_CREATED: &str = "data_created";
}

/// A single telemetry frame.
///
/// Envelope fields that do not apply to a given type (`controller_report` has
/// no `runner_id`) are omitted from the encoded map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,

    /// Wall-clock seconds since the Unix epoch.
    pub time: f64,

    pub test: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_id: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journey: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_id: Option<u64>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub transaction: String,

    /// Type-specific payload, flattened into the top-level map.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Message {
    pub fn new(kind: impl Into<String>, test: impl Into<String>) -> Self {
        Message {
            kind: kind.into(),
            time: wall_time(),
            test: test.into(),
            runner_id: None,
            journey: None,
            context_id: None,
            scenario_id: None,
            data_id: None,
            transaction: String::new(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

/// Wall-clock seconds since the Unix epoch, as emitted in `Message::time`.
pub fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Receiving end of a send callback. Implementations must tolerate being
/// called from any task; sends never block the caller.
pub trait MessageSink: Send + Sync {
    fn send(&self, msg: Message);
}

pub type SharedSink = Arc<dyn MessageSink>;

/// Fans a message out to several sinks (stats + collector + bus, say).
pub struct SinkSet {
    sinks: Vec<SharedSink>,
}

impl SinkSet {
    pub fn new(sinks: Vec<SharedSink>) -> Self {
        SinkSet { sinks }
    }
}

impl MessageSink for SinkSet {
    fn send(&self, msg: Message) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.send(msg.clone());
            }
            last.send(msg);
        }
    }
}

/// Discards everything. Placeholder where telemetry is switched off.
pub struct NullSink;

impl MessageSink for NullSink {
    fn send(&self, _msg: Message) {}
}

/// Buffers messages in memory. Used by the test suites to assert on emitted
/// telemetry without a bus.
#[derive(Default)]
pub struct MemorySink {
    messages: Mutex<Vec<Message>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(MemorySink::default())
    }

    pub fn drain(&self) -> Vec<Message> {
        std::mem::take(&mut self.messages.lock().unwrap())
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    pub fn count_kind(&self, kind: &str) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.kind == kind)
            .count()
    }
}

impl MessageSink for MemorySink {
    fn send(&self, msg: Message) {
        self.messages.lock().unwrap().push(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_skips_absent_identity_fields() {
        let msg = Message::new(kind::CONTROLLER_REPORT, "t").with_field("num_runners", 3);
        let encoded = serde_json::to_value(&msg).unwrap();

        assert_eq!(encoded["type"], "controller_report");
        assert_eq!(encoded["num_runners"], 3);
        assert!(encoded.get("runner_id").is_none());
        assert!(encoded.get("transaction").is_none());
    }

    #[test]
    fn fields_flatten_and_round_trip() {
        let mut msg = Message::new(kind::ERROR, "t");
        msg.runner_id = Some(7);
        msg.transaction = "login".to_string();
        msg.fields.insert("status_code".into(), 500.into());

        let bytes = rmp_serde::to_vec_named(&msg).unwrap();
        let back: Message = rmp_serde::from_slice(&bytes).unwrap();

        assert_eq!(back.runner_id, Some(7));
        assert_eq!(back.transaction, "login");
        assert_eq!(back.fields["status_code"], 500);
    }

    #[test]
    fn sink_set_fans_out() {
        let a = MemorySink::new();
        let b = MemorySink::new();
        let set = SinkSet::new(vec![a.clone(), b.clone()]);

        set.send(Message::new(kind::START, "t"));

        assert_eq!(a.count_kind(kind::START), 1);
        assert_eq!(b.count_kind(kind::START), 1);
    }
}
