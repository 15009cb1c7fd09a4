//! Retry policy: attempt number -> backoff delay and give-up decision

use crate::link;
use std::time::Duration;

/// Linear backoff with a hard attempt cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: link::MAX_RETRIES,
            step: Duration::from_millis(link::BACKOFF_STEP_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt `attempt`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.step * attempt
    }

    /// Whether another attempt follows failed attempt `attempt`
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// [`RetryPolicy::backoff_delay`] with the default policy
pub fn backoff_delay(attempt: u32) -> Duration {
    RetryPolicy::default().backoff_delay(attempt)
}

/// [`RetryPolicy::should_retry`] with the default policy
pub fn should_retry(attempt: u32) -> bool {
    RetryPolicy::default().should_retry(attempt)
}
