//! Reconnect backoff policy

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter for reconnect blackouts.
///
/// The delay for the n-th consecutive failure is `base * 2^(n-1)`, capped at
/// `max`, then scaled by a uniform jitter in `[0.8, 1.2]` so a fleet of
/// clients does not reconnect in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Compute the blackout for the given consecutive-failure count.
    ///
    /// Zero failures means no blackout.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        // Cap the exponent so the shift cannot overflow
        let exp = (failures - 1).min(20);
        let delay = self
            .base
            .saturating_mul(1u32 << exp)
            .min(self.max);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        delay.mul_f64(jitter)
    }
}
