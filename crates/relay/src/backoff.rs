//! Retry schedule for failed publishes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use stock_store::PublishFailure;

/// Bounded exponential backoff with a dead-letter threshold.
///
/// The delay before attempt `n + 1` is `base * 2^(n - 1)`, capped at
/// `max_backoff`. After `max_attempts` failures the row is dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 31) as u32;
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Returns true once `attempt` failures exhaust the retry budget.
    pub fn is_exhausted(&self, attempt: i32) -> bool {
        attempt >= self.max_attempts
    }

    /// Builds the failure record for the `attempt`-th failed publish.
    pub fn failure(&self, attempt: i32, error: String, now: DateTime<Utc>) -> PublishFailure {
        let delay = chrono::Duration::from_std(self.delay_for(attempt))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max_backoff.as_secs() as i64));
        PublishFailure {
            error,
            next_attempt_at: now + delay,
            dead_letter: self.is_exhausted(attempt),
        }
    }
}
