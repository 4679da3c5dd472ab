//! Volume models: time → required concurrent journey population.
//!
//! A volume model is consulted once per scheduling period with the period's
//! `(start, end)` bounds (seconds since the test began) and answers with the
//! population it wants, or [`Volume::Stop`] to end its scenario.

/// Answer from a volume model for one scheduling period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Volume {
    /// Required concurrent journey population for the period.
    Required(u64),
    /// End the scenario.
    Stop,
}

pub trait VolumeModel: Send + Sync {
    fn volume(&self, period_start: f64, period_end: f64) -> Volume;
}

/// Constant population, optionally stopping after a fixed duration.
#[derive(Debug, Clone)]
pub struct ConstantVolume {
    volume: u64,
    duration: Option<f64>,
}

impl ConstantVolume {
    pub fn new(volume: u64) -> Self {
        ConstantVolume {
            volume,
            duration: None,
        }
    }

    pub fn lasting(volume: u64, duration_secs: f64) -> Self {
        ConstantVolume {
            volume,
            duration: Some(duration_secs),
        }
    }
}

impl VolumeModel for ConstantVolume {
    fn volume(&self, period_start: f64, _period_end: f64) -> Volume {
        match self.duration {
            Some(d) if period_start >= d => Volume::Stop,
            _ => Volume::Required(self.volume),
        }
    }
}

/// Linear ramp pattern over a fixed duration, split into thirds:
/// ramp up from `min` to `max`, sustain at `max`, ramp back down to `min`.
/// Stops once the duration has elapsed.
#[derive(Debug, Clone)]
pub struct RampVolume {
    min: u64,
    max: u64,
    duration: f64,
}

impl RampVolume {
    pub fn new(min: u64, max: u64, duration_secs: f64) -> Self {
        RampVolume {
            min,
            max,
            duration: duration_secs,
        }
    }

    fn interpolate(from: f64, to: f64, elapsed: f64, span: f64) -> f64 {
        if span <= 0.0 {
            return to;
        }
        from + (to - from) * (elapsed / span)
    }
}

impl VolumeModel for RampVolume {
    fn volume(&self, period_start: f64, _period_end: f64) -> Volume {
        if self.duration <= 0.0 || period_start >= self.duration {
            return Volume::Stop;
        }
        let third = self.duration / 3.0;
        let (min, max) = (self.min as f64, self.max as f64);
        let v = if period_start <= third {
            Self::interpolate(min, max, period_start, third)
        } else if period_start <= 2.0 * third {
            max
        } else {
            Self::interpolate(max, min, period_start - 2.0 * third, third).max(min)
        };
        Volume::Required(v.round() as u64)
    }
}

/// Adapter over a closure, for tests and embedders.
pub struct VolumeFn<F>(pub F);

impl<F> VolumeModel for VolumeFn<F>
where
    F: Fn(f64, f64) -> Volume + Send + Sync,
{
    fn volume(&self, period_start: f64, period_end: f64) -> Volume {
        (self.0)(period_start, period_end)
    }
}
