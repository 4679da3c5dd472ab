//! The runner: a cooperative journey executor.
//!
//! One runner owns one execution loop: hello the controller, then repeatedly
//! request work, spawn granted journeys, and report completions, pacing
//! itself between `loop_wait_min` and `loop_wait_max`. When the controller
//! says stop the runner keeps draining until every in-flight task has
//! finished naturally, then says bye.
//!
//! Journeys run inside an exception barrier: a pathological journey can fail
//! or panic without taking the runner down, and its `(scenario_id, data_id)`
//! completion is reported either way so data items are never leaked on
//! user-code errors.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::context::{Capabilities, Context, IdData, ROOT_TRANSACTION};
use crate::messages::SharedSink;
use crate::registry::{JourneyFn, Registry};
use crate::scenario::Grant;
use crate::wire::{RunnerTransport, TransportError, WorkRequest};

/// How long a failed journey task lingers before finishing, so a journey that
/// fails instantly cannot spin the grant loop at full speed.
const FAILURE_BACKOFF: Duration = Duration::from_secs(1);

/// Transient transport failures tolerated before the runner gives up and
/// assumes the controller is gone.
const MAX_TRANSPORT_FAILURES: u32 = 3;

type Completion = (u64, Option<u64>);

pub struct RunnerOptions {
    pub loop_wait_min: Duration,
    pub loop_wait_max: Duration,
    /// Cap on concurrently in-flight journeys; surfaced to the controller.
    pub max_work: Option<u64>,
    pub debug: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        RunnerOptions {
            loop_wait_min: Duration::from_millis(10),
            loop_wait_max: Duration::from_millis(500),
            max_work: None,
            debug: false,
        }
    }
}

pub struct Runner {
    transport: Box<dyn RunnerTransport>,
    sink: SharedSink,
    registry: Arc<Registry>,
    capabilities: Capabilities,
    executor: Handle,
    options: RunnerOptions,

    config: RunnerConfig,
    stop_flag: Arc<AtomicBool>,
    current_work: HashMap<u64, u64>,
    tasks: JoinSet<Completion>,
    /// Fallback mapping so a completion is recoverable even if a task is
    /// torn down abnormally.
    task_index: HashMap<tokio::task::Id, Completion>,
    next_context_id: u64,
}

impl Runner {
    pub fn new(
        transport: Box<dyn RunnerTransport>,
        sink: SharedSink,
        registry: Arc<Registry>,
        capabilities: Capabilities,
        executor: Handle,
        options: RunnerOptions,
    ) -> Self {
        Runner {
            transport,
            sink,
            registry,
            capabilities,
            executor,
            options,
            config: RunnerConfig::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            current_work: HashMap::new(),
            tasks: JoinSet::new(),
            task_index: HashMap::new(),
            next_context_id: 0,
        }
    }

    fn in_flight(&self) -> u64 {
        self.current_work.values().sum()
    }

    /// Remaining task capacity to advertise, or `None` for unlimited.
    fn capacity(&self) -> Option<u64> {
        self.options
            .max_work
            .map(|cap| cap.saturating_sub(self.in_flight()))
    }

    /// The main execution loop. Returns when the test has fully drained.
    pub async fn run(mut self) -> Result<(), TransportError> {
        let hello = self.transport.hello().await?;
        let runner_id = hello.runner_id;
        let test_name = hello.test_name;
        self.config.apply(hello.config);
        info!(runner_id, test = %test_name, "runner loop starting");

        let mut completed: Vec<(u64, u64)> = Vec::new();
        let mut transport_failures = 0u32;
        let mut stopped = false;

        while !stopped {
            let req = WorkRequest {
                runner_id,
                current_work: self.current_work.clone(),
                completed: completed.clone(),
                max_work: self.capacity(),
            };
            match self.transport.request_work(req).await {
                Ok(reply) => {
                    transport_failures = 0;
                    completed.clear();
                    self.config.apply(reply.config);
                    stopped = reply.stop;
                    for grant in reply.grants {
                        self.spawn_grant(grant, runner_id, &test_name);
                    }
                }
                Err(e) => {
                    transport_failures += 1;
                    if transport_failures >= MAX_TRANSPORT_FAILURES {
                        return Err(e);
                    }
                    warn!(error = %e, "request_work failed, retrying next tick");
                }
            }
            completed.extend(self.wait_for_completions().await);
        }

        self.stop_flag.store(true, Ordering::Relaxed);
        info!(runner_id, in_flight = self.in_flight(), "stop received, draining");

        // Drain: no new grants, keep reporting progress until idle.
        while self.in_flight() > 0 {
            let req = WorkRequest {
                runner_id,
                current_work: self.current_work.clone(),
                completed: completed.clone(),
                max_work: Some(0),
            };
            match self.transport.request_work(req).await {
                Ok(reply) => {
                    completed.clear();
                    self.config.apply(reply.config);
                }
                Err(e) => warn!(error = %e, "request_work failed while draining"),
            }
            completed.extend(self.wait_for_completions().await);
        }

        // One last report so the final batch of completions is checked in.
        let req = WorkRequest {
            runner_id,
            current_work: self.current_work.clone(),
            completed,
            max_work: Some(0),
        };
        if let Err(e) = self.transport.request_work(req).await {
            warn!(error = %e, "final request_work failed");
        }
        self.transport.bye(runner_id).await?;
        info!(runner_id, "runner loop finished");
        Ok(())
    }

    fn spawn_grant(&mut self, grant: Grant, runner_id: u64, test_name: &str) {
        let journey = match self.registry.journey(&grant.journey_spec) {
            Ok(journey) => journey,
            Err(e) => {
                // A grant we cannot execute still has to be completed,
                // otherwise its data item would leak.
                warn!(error = %e, "dropping grant for unknown journey");
                if let Some(data_id) = grant.data_id {
                    // Completion is reported without ever incrementing
                    // current_work, on the next request_work.
                    self.report_orphan_completion(grant.scenario_id, data_id);
                }
                return;
            }
        };

        self.next_context_id += 1;
        let ctx = Context::new(
            self.sink.clone(),
            self.config.clone(),
            IdData {
                test: test_name.to_string(),
                runner_id,
                journey: grant.journey_spec.clone(),
                context_id: self.next_context_id,
                scenario_id: grant.scenario_id,
                data_id: grant.data_id,
            },
            self.stop_flag.clone(),
            self.capabilities.clone(),
            self.options.debug,
        );

        *self.current_work.entry(grant.scenario_id).or_insert(0) += 1;
        let completion: Completion = (grant.scenario_id, grant.data_id);
        let handle = self.tasks.spawn_on(
            execute_journey(ctx, journey, grant.args, completion),
            &self.executor,
        );
        self.task_index.insert(handle.id(), completion);
        debug!(
            scenario_id = grant.scenario_id,
            context_id = self.next_context_id,
            journey = %grant.journey_spec,
            "journey task spawned"
        );
    }

    fn report_orphan_completion(&mut self, scenario_id: u64, data_id: u64) {
        // Track it as a synthetic in-flight unit so the normal completion
        // bookkeeping returns the data item on the next loop tick.
        *self.current_work.entry(scenario_id).or_insert(0) += 1;
        let handle = self
            .tasks
            .spawn_on(async move { (scenario_id, Some(data_id)) }, &self.executor);
        self.task_index.insert(handle.id(), (scenario_id, Some(data_id)));
    }

    /// The leaky-bucket wait: never returns before `loop_wait_min`, never
    /// stalls past `loop_wait_max`, wakes as soon as any task completes in
    /// between. Returns the `(scenario_id, data_id)` pairs collected.
    async fn wait_for_completions(&mut self) -> Vec<(u64, u64)> {
        tokio::time::sleep(self.options.loop_wait_min).await;

        let remainder = self
            .options
            .loop_wait_max
            .saturating_sub(self.options.loop_wait_min);
        let mut done: Vec<Completion> = Vec::new();

        if self.tasks.is_empty() {
            tokio::time::sleep(remainder).await;
        } else {
            let joined = tokio::select! {
                joined = self.tasks.join_next_with_id() => joined,
                _ = tokio::time::sleep(remainder) => None,
            };
            if let Some(result) = joined {
                done.push(self.resolve_joined(result));
            }
            // Sweep everything else that is already finished.
            while let Some(result) = self.tasks.try_join_next_with_id() {
                done.push(self.resolve_joined(result));
            }
        }

        let mut completed = Vec::new();
        for (scenario_id, data_id) in done {
            match self.current_work.get_mut(&scenario_id) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    self.current_work.remove(&scenario_id);
                }
                None => warn!(scenario_id, "completion for untracked scenario"),
            }
            if let Some(data_id) = data_id {
                completed.push((scenario_id, data_id));
            }
        }
        completed
    }

    fn resolve_joined(
        &mut self,
        result: Result<(tokio::task::Id, Completion), tokio::task::JoinError>,
    ) -> Completion {
        match result {
            Ok((task_id, completion)) => {
                self.task_index.remove(&task_id);
                completion
            }
            Err(join_err) => {
                // The barrier catches journey panics, so this is the
                // runtime tearing a task down. Recover the completion from
                // the index so the data item still comes home.
                warn!(error = %join_err, "journey task aborted");
                self.task_index
                    .remove(&join_err.id())
                    .unwrap_or((0, None))
            }
        }
    }
}

/// The exception barrier around one journey invocation.
///
/// The journey runs inside the implicit root transaction, which reports
/// domain errors and failures exactly once. Panics are caught here, reported
/// as exceptions, and absorbed. The completion pair is always returned.
async fn execute_journey(
    ctx: Context,
    journey: JourneyFn,
    args: Option<Value>,
    completion: Completion,
) -> Completion {
    let journey_ctx = ctx.clone();
    let result = AssertUnwindSafe(async move {
        let inner = journey_ctx.clone();
        journey_ctx
            .transaction(ROOT_TRANSACTION, journey(inner, args))
            .await
    })
    .catch_unwind()
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            // The root transaction reported anything real already; anything
            // else here is the handled marker.
            if !err.is_handled() {
                warn!(error = %err, "journey error escaped the root transaction");
            }
            tokio::time::sleep(FAILURE_BACKOFF).await;
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            ctx.send(
                crate::messages::kind::EXCEPTION,
                serde_json::Map::from_iter([
                    ("message".to_string(), Value::String(message.clone())),
                    ("ex_type".to_string(), Value::String("panic".to_string())),
                    ("location".to_string(), Value::String(String::new())),
                    ("stacktrace".to_string(), Value::String(String::new())),
                ]),
            );
            warn!(message = %message, "journey panicked");
            tokio::time::sleep(FAILURE_BACKOFF).await;
        }
    }
    completion
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "journey panicked".to_string()
    }
}
