//! Scenario ownership and work-grant computation.
//!
//! The [`ScenarioManager`] owns every live scenario and its data pool. It
//! turns volume models into per-period required populations, and required
//! populations into concrete per-runner grant batches, clamped by fair share,
//! by the runner's own concurrency cap, and by the global spawn-rate ceiling,
//! smallest winning.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::datapool::{Checkout, DataPool};
use crate::tracker::RateLimiter;
use crate::volume::{Volume, VolumeModel};

/// One authorized journey execution, possibly bound to a loaned data item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    pub scenario_id: u64,
    pub data_id: Option<u64>,
    pub journey_spec: String,
    pub args: Option<Value>,
}

struct Scenario {
    journey_spec: String,
    datapool: Option<Box<dyn DataPool>>,
    volume_model: Box<dyn VolumeModel>,
}

pub struct ScenarioManager {
    scenarios: HashMap<u64, Scenario>,
    next_scenario_id: u64,
    required: HashMap<u64, u64>,
    period: f64,
    current_period_end: f64,
    start_delay: f64,
    in_start_delay: bool,
    started_at: Instant,
    limiter: RateLimiter,
}

impl ScenarioManager {
    pub fn new(start_delay: f64, period: f64, min_period: f64, spawn_rate: Option<f64>) -> Self {
        ScenarioManager {
            scenarios: HashMap::new(),
            next_scenario_id: 0,
            required: HashMap::new(),
            period,
            current_period_end: 0.0,
            start_delay,
            in_start_delay: start_delay > 0.0,
            started_at: Instant::now(),
            limiter: RateLimiter::new(spawn_rate, min_period),
        }
    }

    /// One-second period, no start delay, no spawn ceiling.
    pub fn with_defaults() -> Self {
        ScenarioManager::new(0.0, 1.0, 0.01, None)
    }

    fn now(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// Register a scenario. Ids are monotonic and never reused.
    pub fn add_scenario(
        &mut self,
        journey_spec: impl Into<String>,
        datapool: Option<Box<dyn DataPool>>,
        volume_model: Box<dyn VolumeModel>,
    ) -> u64 {
        self.next_scenario_id += 1;
        let scenario_id = self.next_scenario_id;
        let journey_spec = journey_spec.into();
        info!(scenario_id, journey = %journey_spec, "added scenario");
        self.scenarios.insert(
            scenario_id,
            Scenario {
                journey_spec,
                datapool,
                volume_model,
            },
        );
        scenario_id
    }

    fn update_required_and_period(&mut self, period_start: f64, period_end: f64) {
        let mut required = HashMap::new();
        let mut stopped = Vec::new();
        for (scenario_id, scenario) in &self.scenarios {
            match scenario.volume_model.volume(period_start, period_end) {
                Volume::Required(n) => {
                    required.insert(*scenario_id, n);
                }
                Volume::Stop => stopped.push(*scenario_id),
            }
        }
        for scenario_id in stopped {
            info!(scenario_id, "removed scenario: volume model signaled stop");
            self.scenarios.remove(&scenario_id);
        }
        self.current_period_end = period_end;
        self.required = required;
        debug!(period_end = self.current_period_end, required = ?self.required, "rolled scheduling period");
    }

    /// Required concurrent population per scenario, rolling the period window
    /// forward when the clock has passed its end. Empty during start delay.
    pub fn get_required_work(&mut self) -> &HashMap<u64, u64> {
        if self.in_start_delay {
            if self.now() > self.start_delay {
                // The first period's clock begins when the delay ends.
                self.in_start_delay = false;
                self.started_at = Instant::now();
            } else {
                return &self.required;
            }
        }
        let now = self.now();
        if now >= self.current_period_end {
            self.update_required_and_period(self.current_period_end, now + self.period);
        }
        &self.required
    }

    /// Build a grant batch for one runner.
    ///
    /// `current_total` is the tracker's per-scenario view across live runners;
    /// `runner_current_total` and `runner_self_limit` describe the asking
    /// runner; `hit_rate` feeds the spawn-rate ceiling. Returns the grants and
    /// a per-scenario count of what was issued.
    pub fn get_work(
        &mut self,
        current_total: &HashMap<u64, u64>,
        runner_current_total: u64,
        n_runners: usize,
        runner_self_limit: Option<u64>,
        hit_rate: f64,
    ) -> (Vec<Grant>, HashMap<u64, u64>) {
        self.get_required_work();
        let required = &self.required;
        let required_total: u64 = required.values().sum();

        // Diff of required over current, positive part only.
        let mut slots: Vec<u64> = Vec::new();
        for (scenario_id, required_count) in required {
            let current = current_total.get(scenario_id).copied().unwrap_or(0);
            for _ in current..*required_count {
                slots.push(*scenario_id);
            }
        }

        let n_runners = n_runners.max(1) as u64;
        let fair_share = required_total.div_ceil(n_runners);
        let mut limit = fair_share.saturating_sub(runner_current_total);
        if let Some(self_limit) = runner_self_limit {
            limit = limit.min(self_limit);
        }
        let spawn_limit = self.limiter.grant_ceiling(n_runners as usize, hit_rate);
        if let Some(spawn_limit) = spawn_limit {
            limit = limit.min(spawn_limit);
        }

        slots.shuffle(&mut rand::thread_rng());

        let mut grants = Vec::new();
        let mut scenario_volume_map: HashMap<u64, u64> = HashMap::new();
        for scenario_id in slots {
            if grants.len() as u64 >= limit {
                break;
            }
            // Skips slots whose scenario was removed earlier in this batch.
            let Some(scenario) = self.scenarios.get_mut(&scenario_id) else {
                continue;
            };
            let journey_spec = scenario.journey_spec.clone();
            let checkout = scenario.datapool.as_mut().map(|pool| pool.checkout());
            let pulled = match checkout {
                None => None,
                Some(Checkout::Item(item)) => Some(item),
                Some(Checkout::Empty) => continue,
                Some(Checkout::Exhausted) => {
                    info!(scenario_id, "removed scenario: data pool exhausted");
                    self.scenarios.remove(&scenario_id);
                    self.required.remove(&scenario_id);
                    continue;
                }
            };
            grants.push(Grant {
                scenario_id,
                data_id: pulled.as_ref().map(|item| item.id),
                journey_spec,
                args: pulled.map(|item| item.data),
            });
            *scenario_volume_map.entry(scenario_id).or_insert(0) += 1;
        }

        debug!(
            required = required_total,
            limit,
            fair_share,
            runner_current_total,
            ?runner_self_limit,
            ?spawn_limit,
            granted = grants.len(),
            "built grant batch"
        );
        (grants, scenario_volume_map)
    }

    /// Return loaned data items. Items for scenarios that no longer exist are
    /// silently dropped.
    pub fn checkin_data(&mut self, pairs: &[(u64, u64)]) {
        for (scenario_id, data_id) in pairs {
            if let Some(scenario) = self.scenarios.get_mut(scenario_id) {
                if let Some(pool) = &mut scenario.datapool {
                    pool.checkin(*data_id);
                }
            }
        }
    }

    /// True while in start delay or while at least one scenario remains.
    pub fn is_active(&self) -> bool {
        self.in_start_delay || !self.scenarios.is_empty()
    }

    pub fn scenario_count(&self) -> usize {
        self.scenarios.len()
    }

    /// Current required populations without rolling the window (reporting).
    pub fn required_snapshot(&self) -> HashMap<u64, u64> {
        self.required.clone()
    }
}
