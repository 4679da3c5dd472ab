//! Telemetry aggregation and the Prometheus exposition endpoint.
//!
//! A [`StatsCollector`] listens to the message stream and maintains counters
//! keyed by `(test, journey, transaction)` for starts, ends, errors and
//! exceptions, gauges fed by `controller_report`, and HDR-histogram
//! percentiles of transaction durations. [`serve_metrics`] exposes the lot as
//! Prometheus text.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use hdrhistogram::Histogram;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::{error, info, warn};

use crate::messages::{kind, Message};
use crate::wire::MessageListener;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    static ref TXN_MESSAGES: IntCounterVec = {
        let vec = IntCounterVec::new(
            Opts::new(
                "stampede_transactions_total",
                "Transaction start/end frames by test, journey and transaction",
            ),
            &["test", "journey", "transaction", "type"],
        )
        .unwrap();
        REGISTRY.register(Box::new(vec.clone())).unwrap();
        vec
    };
    static ref ERROR_MESSAGES: IntCounterVec = {
        let vec = IntCounterVec::new(
            Opts::new(
                "stampede_errors_total",
                "Error and exception frames by test, journey and transaction",
            ),
            &["test", "journey", "transaction", "type"],
        )
        .unwrap();
        REGISTRY.register(Box::new(vec.clone())).unwrap();
        vec
    };
    static ref RUNNER_COUNT: IntGauge = {
        let gauge = IntGauge::new("stampede_runners", "Active runner count").unwrap();
        REGISTRY.register(Box::new(gauge.clone())).unwrap();
        gauge
    };
    static ref SCENARIO_REQUIRED: IntGaugeVec = {
        let vec = IntGaugeVec::new(
            Opts::new(
                "stampede_scenario_required",
                "Required concurrent population per scenario",
            ),
            &["scenario_id"],
        )
        .unwrap();
        REGISTRY.register(Box::new(vec.clone())).unwrap();
        vec
    };
    static ref SCENARIO_ACTUAL: IntGaugeVec = {
        let vec = IntGaugeVec::new(
            Opts::new(
                "stampede_scenario_actual",
                "Tracked concurrent population per scenario",
            ),
            &["scenario_id"],
        )
        .unwrap();
        REGISTRY.register(Box::new(vec.clone())).unwrap();
        vec
    };
}

/// Key identifying one open transaction occurrence.
type OpenKey = (u64, u64, String);

#[derive(Default)]
struct StatsState {
    /// Start times of open transactions, for duration measurement.
    open: HashMap<OpenKey, f64>,
    /// Transaction-duration histograms (microseconds), keyed journey:transaction.
    durations: HashMap<String, Histogram<u64>>,
}

#[derive(Default)]
pub struct StatsCollector {
    state: Mutex<StatsState>,
}

impl StatsCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(StatsCollector::default())
    }

    fn labels<'a>(msg: &'a Message) -> (&'a str, &'a str, &'a str) {
        (
            msg.test.as_str(),
            msg.journey.as_deref().unwrap_or(""),
            msg.transaction.as_str(),
        )
    }

    fn open_key(msg: &Message) -> Option<OpenKey> {
        Some((
            msg.runner_id?,
            msg.context_id?,
            msg.transaction.clone(),
        ))
    }

    fn record(&self, msg: &Message) {
        let (test, journey, transaction) = Self::labels(msg);
        match msg.kind.as_str() {
            kind::START => {
                TXN_MESSAGES
                    .with_label_values(&[test, journey, transaction, "start"])
                    .inc();
                if let Some(key) = Self::open_key(msg) {
                    self.state.lock().unwrap().open.insert(key, msg.time);
                }
            }
            kind::END => {
                TXN_MESSAGES
                    .with_label_values(&[test, journey, transaction, "end"])
                    .inc();
                if let Some(key) = Self::open_key(msg) {
                    let mut state = self.state.lock().unwrap();
                    if let Some(started) = state.open.remove(&key) {
                        let micros = ((msg.time - started).max(0.0) * 1e6) as u64;
                        let histogram = state
                            .durations
                            .entry(format!("{}:{}", journey, transaction))
                            .or_insert_with(|| {
                                Histogram::new_with_bounds(1, 3_600_000_000, 3)
                                    .expect("histogram bounds are static")
                            });
                        if histogram.record(micros.max(1)).is_err() {
                            warn!(micros, "transaction duration out of histogram range");
                        }
                    }
                }
            }
            kind::ERROR | kind::EXCEPTION => {
                ERROR_MESSAGES
                    .with_label_values(&[test, journey, transaction, msg.kind.as_str()])
                    .inc();
            }
            kind::CONTROLLER_REPORT => {
                if let Some(n) = msg.fields.get("num_runners").and_then(|v| v.as_i64()) {
                    RUNNER_COUNT.set(n);
                }
                for (field, gauge) in [
                    ("required", &*SCENARIO_REQUIRED),
                    ("actual", &*SCENARIO_ACTUAL),
                ] {
                    if let Some(map) = msg.fields.get(field).and_then(|v| v.as_object()) {
                        for (scenario_id, count) in map {
                            if let Some(count) = count.as_i64() {
                                gauge.with_label_values(&[scenario_id.as_str()]).set(count);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Render the full Prometheus text exposition, percentiles included.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
            error!(error = %e, "failed to encode metrics");
        }
        let mut out = String::from_utf8(buffer).unwrap_or_default();

        let state = self.state.lock().unwrap();
        if !state.durations.is_empty() {
            out.push_str(
                "# HELP stampede_transaction_seconds Transaction duration quantiles\n\
                 # TYPE stampede_transaction_seconds summary\n",
            );
            for (label, histogram) in &state.durations {
                for (quantile, value) in [
                    ("0.5", histogram.value_at_quantile(0.5)),
                    ("0.95", histogram.value_at_quantile(0.95)),
                    ("0.99", histogram.value_at_quantile(0.99)),
                ] {
                    out.push_str(&format!(
                        "stampede_transaction_seconds{{transaction=\"{}\",quantile=\"{}\"}} {}\n",
                        label,
                        quantile,
                        value as f64 / 1e6
                    ));
                }
                out.push_str(&format!(
                    "stampede_transaction_seconds_count{{transaction=\"{}\"}} {}\n",
                    label,
                    histogram.len()
                ));
            }
        }
        out
    }
}

impl MessageListener for StatsCollector {
    fn on_message(&self, msg: &Message) {
        self.record(msg);
    }
}

impl crate::messages::MessageSink for StatsCollector {
    fn send(&self, msg: Message) {
        self.record(&msg);
    }
}

async fn metrics_handler(
    req: Request<Body>,
    stats: Arc<StatsCollector>,
) -> Result<Response<Body>, Infallible> {
    if req.uri().path() != "/metrics" {
        return Ok(Response::builder()
            .status(404)
            .body(Body::from("not found"))
            .unwrap());
    }
    Ok(Response::builder()
        .status(200)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(Body::from(stats.render()))
        .unwrap())
}

/// Serve `GET /metrics` until the process exits.
pub async fn serve_metrics(addr: SocketAddr, stats: Arc<StatsCollector>) {
    let make_svc = make_service_fn(move |_conn| {
        let stats = stats.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let stats = stats.clone();
                metrics_handler(req, stats)
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(%addr, "metrics endpoint started — GET /metrics");
    if let Err(e) = server.await {
        error!(error = %e, "metrics server error");
    }
}
