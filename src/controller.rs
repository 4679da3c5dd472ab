//! The controller: the single coordination point of a test.
//!
//! Serves three RPCs — hello, request_work, bye — each handled atomically
//! with respect to all shared state (the transport layer serializes access).
//! Owns the scenario manager, the work/runner trackers, and the versioned
//! config store.

use std::collections::HashMap;

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::config::ConfigManager;
use crate::messages::{kind, Message, MessageSink};
use crate::scenario::{Grant, ScenarioManager};
use crate::tracker::{RunnerTracker, WorkTracker};
use crate::wire::{HelloReply, WorkReply, WorkRequest};

pub struct Controller {
    test_name: String,
    scenario_manager: ScenarioManager,
    config: ConfigManager,
    work_tracker: WorkTracker,
    runner_tracker: RunnerTracker,
    next_runner_id: u64,
}

impl Controller {
    pub fn new(
        test_name: impl Into<String>,
        scenario_manager: ScenarioManager,
        config: ConfigManager,
        runner_timeout: tokio::time::Duration,
    ) -> Self {
        Controller {
            test_name: test_name.into(),
            scenario_manager,
            config,
            work_tracker: WorkTracker::new(),
            runner_tracker: RunnerTracker::new(runner_timeout),
            next_runner_id: 0,
        }
    }

    /// Register a new runner: fresh id, test name, full config snapshot.
    pub fn hello(&mut self) -> HelloReply {
        self.next_runner_id += 1;
        let runner_id = self.next_runner_id;
        self.config.mark_current(runner_id);
        info!(runner_id, test = %self.test_name, "runner joined");
        HelloReply {
            runner_id,
            test_name: self.test_name.clone(),
            config: self.config.snapshot(),
        }
    }

    /// The work-granting RPC. Trusts the runner's `current_work` snapshot,
    /// returns completed data items, computes a clamped grant batch,
    /// pre-credits it, and attaches any pending config delta.
    pub fn request_work(&mut self, req: WorkRequest) -> WorkReply {
        self.work_tracker
            .set_actual(req.runner_id, req.current_work.clone());
        self.runner_tracker.update(req.runner_id);
        self.scenario_manager.checkin_data(&req.completed);

        let active = self.runner_tracker.get_active();
        let current_total = self.work_tracker.get_total_work(&active);
        let runner_total = self.work_tracker.get_runner_total(req.runner_id);
        let hit_rate = self.runner_tracker.get_hit_rate();

        let (grants, scenario_volume_map) = self.scenario_manager.get_work(
            &current_total,
            runner_total,
            active.len(),
            req.max_work,
            hit_rate,
        );
        self.work_tracker
            .add_assumed(req.runner_id, &scenario_volume_map);

        let config_delta = self.config.changes_for_runner(req.runner_id);
        let stop = !self.scenario_manager.is_active();
        debug!(
            runner_id = req.runner_id,
            granted = grants.len(),
            config_delta = config_delta.len(),
            stop,
            "request_work served"
        );
        WorkReply {
            grants,
            config: config_delta,
            stop,
        }
    }

    /// Remove a departing runner from all tracking.
    pub fn bye(&mut self, runner_id: u64) {
        info!(runner_id, "runner left");
        self.work_tracker.remove_runner(runner_id);
        self.runner_tracker.remove(runner_id);
        self.config.forget_runner(runner_id);
    }

    /// True once no scenario remains and no runner is still active.
    pub fn should_stop(&mut self) -> bool {
        !self.scenario_manager.is_active() && self.runner_tracker.get_active_count() == 0
    }

    pub fn config_mut(&mut self) -> &mut ConfigManager {
        &mut self.config
    }

    pub fn scenario_manager_mut(&mut self) -> &mut ScenarioManager {
        &mut self.scenario_manager
    }

    /// Emit a `controller_report` message: required vs actual per scenario
    /// and the live runner count.
    pub fn report(&mut self, sink: &dyn MessageSink) {
        let active = self.runner_tracker.get_active();
        let actual = self.work_tracker.get_total_work(&active);
        let required = self.scenario_manager.required_snapshot();

        let mut fields = Map::new();
        fields.insert("required".to_string(), scenario_map_json(&required));
        fields.insert("actual".to_string(), scenario_map_json(&actual));
        fields.insert("num_runners".to_string(), json!(active.len()));

        let mut msg = Message::new(kind::CONTROLLER_REPORT, self.test_name.clone());
        msg.fields = fields;
        sink.send(msg);
    }
}

fn scenario_map_json(map: &HashMap<u64, u64>) -> Value {
    Value::Object(
        map.iter()
            .map(|(scenario_id, count)| (scenario_id.to_string(), json!(count)))
            .collect(),
    )
}
