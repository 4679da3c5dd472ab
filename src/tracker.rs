//! Controller-side tracking: who is alive, what they are running, and how
//! fast new work may be spawned.

use std::collections::{HashMap, HashSet, VecDeque};

use rand::Rng;
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Per-runner work counts with a lazily maintained total.
///
/// `set_actual` installs the runner's own snapshot (the authoritative view);
/// `add_assumed` pre-credits freshly issued grants so the next runner's fair
/// share does not double-dip before the first runner reports back. Any write
/// invalidates the cached totals.
#[derive(Default)]
pub struct WorkTracker {
    all_work: HashMap<u64, HashMap<u64, u64>>,
    cached_total: Option<HashMap<u64, u64>>,
}

impl WorkTracker {
    pub fn new() -> Self {
        WorkTracker::default()
    }

    /// Overwrite a runner's entry with its reported snapshot.
    pub fn set_actual(&mut self, runner_id: u64, work: HashMap<u64, u64>) {
        self.all_work.insert(runner_id, work);
        self.cached_total = None;
    }

    /// Pre-credit issued grants on top of the runner's current entry.
    pub fn add_assumed(&mut self, runner_id: u64, delta: &HashMap<u64, u64>) {
        if delta.is_empty() {
            return;
        }
        let entry = self.all_work.entry(runner_id).or_default();
        for (scenario_id, count) in delta {
            *entry.entry(*scenario_id).or_insert(0) += count;
        }
        self.cached_total = None;
    }

    /// Total work per scenario over `active` runners, reaping any tracked
    /// runner that is no longer in the active set.
    pub fn get_total_work(&mut self, active: &HashSet<u64>) -> HashMap<u64, u64> {
        let before = self.all_work.len();
        self.all_work.retain(|runner_id, _| active.contains(runner_id));
        if self.all_work.len() != before {
            debug!(
                reaped = before - self.all_work.len(),
                "reaped inactive runners from work tracker"
            );
            self.cached_total = None;
        }

        if self.cached_total.is_none() {
            let mut totals: HashMap<u64, u64> = HashMap::new();
            for work in self.all_work.values() {
                for (scenario_id, count) in work {
                    *totals.entry(*scenario_id).or_insert(0) += count;
                }
            }
            self.cached_total = Some(totals);
        }
        self.cached_total.clone().unwrap_or_default()
    }

    pub fn get_runner_total(&self, runner_id: u64) -> u64 {
        self.all_work
            .get(&runner_id)
            .map(|work| work.values().sum())
            .unwrap_or(0)
    }

    pub fn remove_runner(&mut self, runner_id: u64) {
        if self.all_work.remove(&runner_id).is_some() {
            self.cached_total = None;
        }
    }
}

/// Runner liveness: last-seen stamps plus a sliding window of contact times
/// used to estimate the cluster-wide request_work rate.
pub struct RunnerTracker {
    last_seen: HashMap<u64, Instant>,
    hits: VecDeque<Instant>,
    timeout: Duration,
    created_at: Instant,
}

impl RunnerTracker {
    pub fn new(timeout: Duration) -> Self {
        RunnerTracker {
            last_seen: HashMap::new(),
            hits: VecDeque::new(),
            timeout,
            created_at: Instant::now(),
        }
    }

    pub fn update(&mut self, runner_id: u64) {
        let now = Instant::now();
        self.last_seen.insert(runner_id, now);
        self.hits.push_back(now);
        self.prune_hits(now);
    }

    fn prune_hits(&mut self, now: Instant) {
        while let Some(front) = self.hits.front() {
            if now.duration_since(*front) > self.timeout {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    /// Runners seen within the timeout window.
    pub fn get_active(&self) -> HashSet<u64> {
        let now = Instant::now();
        self.last_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) < self.timeout)
            .map(|(runner_id, _)| *runner_id)
            .collect()
    }

    pub fn get_active_count(&self) -> usize {
        self.get_active().len()
    }

    /// request_work calls per second over the trailing timeout window.
    ///
    /// While the tracker is younger than the window, the divisor is its
    /// actual age (floored at one second) rather than the full window.
    /// A full-window divisor at cold start under-estimates the poll rate and
    /// lets the spawn-rate clamp burst far past its ceiling.
    pub fn get_hit_rate(&mut self) -> f64 {
        let now = Instant::now();
        self.prune_hits(now);
        let full = self.timeout.as_secs_f64();
        let age = now.duration_since(self.created_at).as_secs_f64();
        let window = age.min(full).max(full.min(1.0));
        self.hits.len() as f64 / window
    }

    pub fn remove(&mut self, runner_id: u64) {
        self.last_seen.remove(&runner_id);
    }
}

/// System-wide ceiling on new journey starts per unit time, turned into a
/// per-batch grant ceiling.
///
/// Each request_work may grant at most `spawn_rate / hit_rate` items, so that
/// `hit_rate` polls per second add up to `spawn_rate` starts per second. The
/// fractional remainder is dithered (granted with probability equal to the
/// remainder), keeping the long-run average on target without per-runner
/// quantization error.
pub struct RateLimiter {
    spawn_rate: Option<f64>,
    min_period: f64,
}

impl RateLimiter {
    pub fn new(spawn_rate: Option<f64>, min_period: f64) -> Self {
        RateLimiter {
            spawn_rate,
            min_period,
        }
    }

    /// Grant ceiling for one batch; `None` means unlimited.
    pub fn grant_ceiling(&self, n_runners: usize, hit_rate: f64) -> Option<u64> {
        let spawn_rate = self.spawn_rate?;
        let polls_per_sec = if hit_rate > 0.0 {
            hit_rate
        } else {
            n_runners.max(1) as f64 / self.min_period
        };
        let ceiling = spawn_rate / polls_per_sec;
        let mut granted = ceiling.floor() as u64;
        if ceiling.fract() > rand::thread_rng().gen::<f64>() {
            granted += 1;
        }
        Some(granted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work(pairs: &[(u64, u64)]) -> HashMap<u64, u64> {
        pairs.iter().copied().collect()
    }

    fn active(ids: &[u64]) -> HashSet<u64> {
        ids.iter().copied().collect()
    }

    #[test]
    fn totals_sum_over_runners() {
        let mut tracker = WorkTracker::new();
        tracker.set_actual(1, work(&[(10, 3), (11, 1)]));
        tracker.set_actual(2, work(&[(10, 2)]));

        let totals = tracker.get_total_work(&active(&[1, 2]));
        assert_eq!(totals[&10], 5);
        assert_eq!(totals[&11], 1);
        assert_eq!(tracker.get_runner_total(1), 4);
        assert_eq!(tracker.get_runner_total(2), 2);
    }

    #[test]
    fn set_actual_supersedes_assumed() {
        let mut tracker = WorkTracker::new();
        tracker.set_actual(1, work(&[(10, 1)]));
        tracker.add_assumed(1, &work(&[(10, 4)]));
        assert_eq!(tracker.get_total_work(&active(&[1]))[&10], 5);

        // The runner's own report is authoritative.
        tracker.set_actual(1, work(&[(10, 2)]));
        assert_eq!(tracker.get_total_work(&active(&[1]))[&10], 2);
    }

    #[test]
    fn cache_invalidated_on_every_write() {
        let mut tracker = WorkTracker::new();
        tracker.set_actual(1, work(&[(10, 1)]));
        let all = active(&[1, 2]);
        assert_eq!(tracker.get_total_work(&all)[&10], 1);

        tracker.add_assumed(2, &work(&[(10, 2)]));
        assert_eq!(tracker.get_total_work(&all)[&10], 3);

        tracker.remove_runner(2);
        assert_eq!(tracker.get_total_work(&all)[&10], 1);
    }

    #[test]
    fn inactive_runners_reaped_lazily() {
        let mut tracker = WorkTracker::new();
        tracker.set_actual(1, work(&[(10, 3)]));
        tracker.set_actual(2, work(&[(10, 4)]));

        let totals = tracker.get_total_work(&active(&[1]));
        assert_eq!(totals[&10], 3);
        assert_eq!(tracker.get_runner_total(2), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn runner_tracker_expires_after_timeout() {
        let mut tracker = RunnerTracker::new(Duration::from_secs(10));
        tracker.update(1);
        tracker.update(2);
        assert_eq!(tracker.get_active_count(), 2);

        tokio::time::sleep(Duration::from_secs(6)).await;
        tracker.update(2);
        tokio::time::sleep(Duration::from_secs(6)).await;

        let alive = tracker.get_active();
        assert!(!alive.contains(&1));
        assert!(alive.contains(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn hit_rate_counts_window_updates() {
        let mut tracker = RunnerTracker::new(Duration::from_secs(10));
        for _ in 0..20 {
            tracker.update(1);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        // 10s window, one update every 0.5s -> ~2 hits/sec.
        let rate = tracker.get_hit_rate();
        assert!((1.5..=2.5).contains(&rate), "hit rate {}", rate);
    }

    #[test]
    fn rate_limiter_unlimited_without_spawn_rate() {
        let limiter = RateLimiter::new(None, 0.01);
        assert_eq!(limiter.grant_ceiling(4, 2.0), None);
    }

    #[test]
    fn rate_limiter_dithers_around_fraction() {
        let limiter = RateLimiter::new(Some(10.0), 0.01);
        // 10 spawns/sec over 4 polls/sec -> 2.5 per batch on average.
        let total: u64 = (0..2000)
            .map(|_| limiter.grant_ceiling(1, 4.0).unwrap())
            .sum();
        let mean = total as f64 / 2000.0;
        assert!((2.3..=2.7).contains(&mean), "mean ceiling {}", mean);
    }

    #[test]
    fn rate_limiter_falls_back_to_min_period() {
        let limiter = RateLimiter::new(Some(100.0), 0.5);
        // No hit-rate history: 2 runners / 0.5s min period -> 4 polls/sec.
        let ceiling = limiter.grant_ceiling(2, 0.0).unwrap();
        assert!(ceiling == 25 || ceiling == 26);
    }
}
