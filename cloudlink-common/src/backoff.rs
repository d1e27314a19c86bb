//! Delay schedule between reconnect attempts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Escalating delay between successive connect attempts.
///
/// The delay after attempt `n` (0-based) is `initial * factor^n`, capped at
/// `max`. A factor of 1 gives a constant delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay after the first failed attempt.
    pub initial: Duration,
    /// Growth factor per attempt.
    pub factor: u32,
    /// Upper bound for any single delay.
    pub max: Duration,
}

impl Backoff {
    /// Doubling backoff starting at `initial`, capped at `max`.
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            factor: 2,
            max,
        }
    }

    /// The same delay after every attempt.
    pub fn constant(delay: Duration) -> Self {
        Self {
            initial: delay,
            factor: 1,
            max: delay,
        }
    }

    /// Delay to wait after the given failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let scale = self.factor.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(scale)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(30))
    }
}
