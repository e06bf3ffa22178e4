//! Exponential backoff bookkeeping for the uploader.

use std::time::Duration;

/// Delay before the first retry, and the unit the exponent scales.
pub const BASE_DELAY: Duration = Duration::from_secs(1);

/// Default cap on the backoff delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Consecutive-failure counter driving `min(base * 2^failures, max)`.
///
/// A success resets the counter to zero; every failed delivery attempt
/// increments it by exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffState {
    consecutive_failures: u32,
    base: Duration,
    max: Duration,
}

impl BackoffState {
    /// Create a backoff state with the given base delay and cap.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            base,
            max,
        }
    }

    /// Record one failed delivery attempt and return the new streak length.
    pub fn record_failure(&mut self) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_failures
    }

    /// Clear the failure streak after a successful delivery.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Current delay: `min(base * 2^consecutive_failures, max)`.
    pub fn current_delay(&self) -> Duration {
        let factor = 1u32 << self.consecutive_failures.min(31);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }
}

impl Default for BackoffState {
    fn default() -> Self {
        Self::new(BASE_DELAY, DEFAULT_MAX_BACKOFF)
    }
}
