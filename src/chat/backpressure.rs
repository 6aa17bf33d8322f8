//! Audio overlap backpressure.
//!
//! A session that talks faster than its audio can play would make every listener hear
//! a pile-up of overlapping clips. Each session remembers when its last admitted clip is
//! expected to finish; a new clip is attached only when it would end within the grace
//! period. Text is always delivered.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::AudioConfig;

#[derive(Debug, Clone, Copy)]
pub struct AudioGate {
    grace: Duration,
    bits_per_sec: u64,
}

impl AudioGate {
    pub fn new(grace: Duration, bits_per_sec: u64) -> Self {
        Self {
            grace,
            bits_per_sec: bits_per_sec.max(1),
        }
    }

    pub fn from_config(config: &AudioConfig) -> Self {
        Self::new(Duration::from_millis(config.grace_period_ms), config.estimate_bits_per_sec)
    }

    /// Estimated playback time of an encoded clip of `len` bytes.
    pub fn playback(&self, len: usize) -> Duration {
        Duration::from_secs_f64(len as f64 * 8.0 / self.bits_per_sec as f64)
    }

    /// Decide whether a clip of `len` bytes may be attached, advancing `scheduled_end`
    /// when it is.
    pub fn admit(&self, scheduled_end: &mut Instant, len: usize, now: Instant) -> bool {
        let candidate = (*scheduled_end).max(now) + self.playback(len);
        if candidate < now + self.grace {
            *scheduled_end = candidate;
            true
        } else {
            false
        }
    }
}
