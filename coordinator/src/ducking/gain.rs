//! Per-talkgroup gain stage. The engine only schedules time-stamped linear
//! ramps; evaluation happens against the audio clock, so nothing here blocks
//! or allocates on the hot path.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Clock the ramps are expressed against. Production uses a monotonic clock
/// anchored at engine creation; tests step a manual one.
pub trait AudioClock: Send + Sync {
    fn now_secs(&self) -> f64;
}

#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { origin: Instant::now() }
    }
}

impl AudioClock for MonotonicClock {
    fn now_secs(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Manually stepped clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn set(&self, secs: f64) {
        *self.now.lock().unwrap() = secs;
    }
}

impl AudioClock for ManualClock {
    fn now_secs(&self) -> f64 {
        *self.now.lock().unwrap()
    }
}

/// Sanitize a user-supplied volume: NaN collapses to 0, everything else is
/// clamped into [0, 1].
pub fn clamp_volume(v: f32) -> f32 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Ramp {
    start_secs: f64,
    start_value: f32,
    target: f32,
    duration_secs: f64,
}

/// One audio gain stage. Holds the most recently scheduled ramp; scheduling a
/// new ramp cancels the previous one, restarting from the value the old ramp
/// had reached at that instant.
#[derive(Debug, Clone, PartialEq)]
pub struct GainController {
    ramp: Ramp,
}

impl GainController {
    pub fn new(initial: f32) -> Self {
        Self {
            ramp: Ramp {
                start_secs: 0.0,
                start_value: clamp_volume(initial),
                target: clamp_volume(initial),
                duration_secs: 0.0,
            },
        }
    }

    pub fn schedule(&mut self, target: f32, ramp: Duration, now_secs: f64) {
        let start_value = self.value_at(now_secs);
        self.ramp = Ramp {
            start_secs: now_secs,
            start_value,
            target: clamp_volume(target),
            duration_secs: ramp.as_secs_f64(),
        };
    }

    /// The value the schedule is heading towards.
    pub fn target(&self) -> f32 {
        self.ramp.target
    }

    /// Gain at an instant on the audio clock: linear interpolation of the
    /// active ramp, flat before its start and after its end.
    pub fn value_at(&self, t_secs: f64) -> f32 {
        let r = &self.ramp;
        if r.duration_secs <= 0.0 {
            return if t_secs >= r.start_secs { r.target } else { r.start_value };
        }
        if t_secs <= r.start_secs {
            return r.start_value;
        }
        let progress = (t_secs - r.start_secs) / r.duration_secs;
        if progress >= 1.0 {
            return r.target;
        }
        r.start_value + (r.target - r.start_value) * progress as f32
    }

    /// Apply the scheduled gain to one block of samples starting at
    /// `block_start_secs`. This is the surface an audio runtime evaluates.
    pub fn apply(&self, samples: &mut [f32], block_start_secs: f64, sample_rate: u32) {
        if samples.is_empty() || sample_rate == 0 {
            return;
        }
        let dt = 1.0 / sample_rate as f64;
        for (i, sample) in samples.iter_mut().enumerate() {
            *sample *= self.value_at(block_start_secs + i as f64 * dt);
        }
    }
}
