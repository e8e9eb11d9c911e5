//! Exponential retry backoff with a cap and jitter.

use rand::Rng;
use std::time::Duration;

/// Backoff between attempts of one occurrence.
///
/// The delay after the Nth failed attempt is `2^(N-1)` seconds, capped,
/// with uniform jitter in `[0.5x, 1.0x]` of that value so a burst of
/// failing jobs does not retry in lockstep.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base_delay_secs: u64,
    cap_secs: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 1,
            cap_secs: 64,
        }
    }
}

impl BackoffPolicy {
    pub fn new(cap_secs: u64) -> Self {
        Self {
            base_delay_secs: 1,
            cap_secs,
        }
    }

    /// The pre-jitter delay after `attempt` (1-based) has failed.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let secs = self
            .base_delay_secs
            .saturating_mul(1u64 << exponent)
            .min(self.cap_secs);
        Duration::from_secs(secs)
    }

    /// The jittered delay after `attempt` (1-based) has failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay(attempt).as_millis() as u64;
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(base_ms / 2..=base_ms))
    }
}
