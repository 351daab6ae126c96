//! Exponential reconnect backoff.

use std::time::Duration;

/// Doubling delay: `initial, 2*initial, 4*initial, ...` capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.attempt = self.attempt.saturating_add(1).min(31);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
