//! Bounded retry for writes that race a schema upgrade.
//!
//! A session caches its store handle. When another session adds a namespace,
//! the manager closes that handle and reopens the store one generation up;
//! writes issued against the old handle fail with
//! [`PersistError::Stale`](crate::PersistError::Stale). Those writes are
//! retried against a refreshed handle with capped exponential backoff:
//!
//! ```text
//! attempt:  1    2    3    4     5     6     7     8
//! delay:    2ms  4ms  8ms  16ms  32ms  64ms  128ms 250ms (cap)
//! ```

use std::time::Duration;

/// Backoff policy for stale-handle retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt before the write is surfaced as failed
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << shift);
        delay.min(self.max_delay)
    }

    /// Whether another retry is allowed after `attempt` retries so far.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}
