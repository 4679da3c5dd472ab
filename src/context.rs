//! Per-journey execution context.
//!
//! A [`Context`] is the handle passed to journey code: it enriches and
//! forwards telemetry, exposes config and capabilities, and hosts the
//! transaction stack. The send callback is owned by value — a context never
//! refers back to the runner that built it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tracing::debug;

use crate::config::RunnerConfig;
use crate::errors::JourneyError;
use crate::messages::{kind, wall_time, Message, SharedSink};
use crate::session::SessionPool;

/// The implicit transaction wrapped around every journey invocation.
pub const ROOT_TRANSACTION: &str = "__root__";

/// Immutable identity stamped on every message a context sends.
#[derive(Debug, Clone)]
pub struct IdData {
    pub test: String,
    pub runner_id: u64,
    pub journey: String,
    pub context_id: u64,
    pub scenario_id: u64,
    pub data_id: Option<u64>,
}

/// Typed capabilities injected at context construction.
#[derive(Clone, Default)]
pub struct Capabilities {
    pub http: Option<SessionPool>,
}

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    sink: SharedSink,
    config: RunnerConfig,
    id: IdData,
    transactions: Mutex<Vec<String>>,
    should_stop: Arc<AtomicBool>,
    capabilities: Capabilities,
    debug: bool,
}

impl Context {
    pub fn new(
        sink: SharedSink,
        config: RunnerConfig,
        id: IdData,
        should_stop: Arc<AtomicBool>,
        capabilities: Capabilities,
        debug: bool,
    ) -> Self {
        Context {
            inner: Arc::new(ContextInner {
                sink,
                config,
                id,
                transactions: Mutex::new(Vec::new()),
                should_stop,
                capabilities,
                debug,
            }),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }

    pub fn id(&self) -> &IdData {
        &self.inner.id
    }

    /// True once the controller has told this runner to stop; long-running
    /// journeys should poll it and wind down.
    pub fn should_stop(&self) -> bool {
        self.inner.should_stop.load(Ordering::Relaxed)
    }

    pub fn debug_enabled(&self) -> bool {
        self.inner.debug
    }

    /// The HTTP capability, when one was granted at construction.
    pub fn http(&self) -> Result<&SessionPool, JourneyError> {
        self.inner
            .capabilities
            .http
            .as_ref()
            .ok_or_else(|| JourneyError::failure("context has no HTTP capability"))
    }

    fn current_transaction(&self) -> String {
        self.inner
            .transactions
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or_default()
    }

    fn enriched(&self, msg_kind: &str, fields: Map<String, Value>) -> Message {
        let id = &self.inner.id;
        Message {
            kind: msg_kind.to_string(),
            time: wall_time(),
            test: id.test.clone(),
            runner_id: Some(id.runner_id),
            journey: Some(id.journey.clone()),
            context_id: Some(id.context_id),
            scenario_id: Some(id.scenario_id),
            data_id: id.data_id,
            transaction: self.current_transaction(),
            fields,
        }
    }

    /// Send an ad-hoc message, enriched with the context's identity, the
    /// current transaction name, and the wall time.
    pub fn send(&self, msg_kind: &str, fields: Map<String, Value>) {
        self.inner.sink.send(self.enriched(msg_kind, fields));
    }

    fn start_transaction(&self, name: &str) {
        self.inner
            .transactions
            .lock()
            .unwrap()
            .push(name.to_string());
        self.send(kind::START, Map::new());
    }

    fn end_transaction(&self) {
        self.send(kind::END, Map::new());
        self.inner.transactions.lock().unwrap().pop();
    }

    fn report_error(&self, err: &JourneyError) {
        match err {
            JourneyError::Error { message, fields } => {
                let mut out = fields.clone();
                out.insert("message".to_string(), Value::String(message.clone()));
                self.send(kind::ERROR, out);
            }
            JourneyError::Failure {
                message,
                ex_type,
                location,
                stacktrace,
            } => {
                let mut out = Map::new();
                out.insert("message".to_string(), Value::String(message.clone()));
                out.insert("ex_type".to_string(), Value::String(ex_type.clone()));
                out.insert("location".to_string(), Value::String(location.clone()));
                out.insert("stacktrace".to_string(), Value::String(stacktrace.clone()));
                self.send(kind::EXCEPTION, out);
            }
            JourneyError::Handled => {}
        }
    }

    /// Run `fut` inside a named transaction scope.
    ///
    /// Emits `start` on entry and `end` on exit. A domain error is reported
    /// as `error`, any other failure as `exception`; both are then converted
    /// to [`JourneyError::Handled`] so enclosing scopes emit nothing further.
    pub async fn transaction<T, F>(&self, name: &str, fut: F) -> Result<T, JourneyError>
    where
        F: std::future::Future<Output = Result<T, JourneyError>>,
    {
        self.start_transaction(name);
        let result = fut.await;
        match result {
            Ok(value) => {
                self.end_transaction();
                Ok(value)
            }
            Err(JourneyError::Handled) => {
                self.end_transaction();
                Err(JourneyError::Handled)
            }
            Err(err) => {
                debug!(
                    transaction = name,
                    journey = %self.inner.id.journey,
                    error = %err,
                    "transaction failed"
                );
                self.report_error(&err);
                self.end_transaction();
                Err(JourneyError::Handled)
            }
        }
    }
}
