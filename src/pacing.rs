//! Pacing helpers for journeys that must keep a minimum separation between
//! iterations. A [`Separation`] records its start time at construction; when
//! completed it sleeps for whatever remains of the target interval, so the
//! enclosed work plus the sleep never takes less than the target.

use rand::Rng;
use tokio::time::{Duration, Instant};

pub struct Separation {
    target: Duration,
    started: Instant,
}

impl Separation {
    /// Fixed separation: the scope lasts at least `target`.
    pub fn fixed(target: Duration) -> Self {
        Separation {
            target,
            started: Instant::now(),
        }
    }

    /// Separation drawn uniformly from `mean ± plus_minus` at entry.
    /// `plus_minus` defaults to a quarter of the mean.
    pub fn averaged(mean: Duration, plus_minus: Option<Duration>) -> Self {
        let spread = plus_minus.unwrap_or(mean / 4).as_secs_f64();
        let jitter = rand::thread_rng().gen_range(-spread..=spread);
        let target = Duration::from_secs_f64((mean.as_secs_f64() + jitter).max(0.0));
        Self::fixed(target)
    }

    /// Sleep out the remainder of the target interval, if any.
    pub async fn complete(self) {
        let elapsed = self.started.elapsed();
        if elapsed < self.target {
            tokio::time::sleep(self.target - elapsed).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleeps_out_the_remainder() {
        let sep = Separation::fixed(Duration::from_secs(2));
        let before = Instant::now();
        tokio::time::sleep(Duration::from_millis(500)).await;
        sep.complete().await;
        assert!(before.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn no_sleep_when_work_ran_long() {
        let sep = Separation::fixed(Duration::from_millis(100));
        tokio::time::sleep(Duration::from_secs(1)).await;
        let before = Instant::now();
        sep.complete().await;
        assert!(before.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn averaged_target_stays_in_band() {
        for _ in 0..50 {
            let sep = Separation::averaged(Duration::from_secs(4), Some(Duration::from_secs(1)));
            let secs = sep.target.as_secs_f64();
            assert!((3.0..=5.0).contains(&secs), "target {} out of band", secs);
        }
    }
}
