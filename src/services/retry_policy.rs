use crate::config::{QueueSettings, UploadSettings};
use std::time::Duration;

/// Exponential backoff for in-run upload attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per task, first try included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl From<&UploadSettings> for RetryPolicy {
    fn from(settings: &UploadSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms.max(settings.base_delay_ms)),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based): base * 2^(attempt-1), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    pub fn has_attempts_left(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Wait before a queued task is tried again by the resync sweep: doubles per
/// recorded retry, capped, with up to 10% random jitter so tasks queued
/// together do not all fire at once.
pub fn queue_backoff(settings: &QueueSettings, retries: u32) -> Duration {
    let base = settings.backoff_base_secs.max(1);
    let exponent = retries.saturating_sub(1).min(16);
    let secs = base
        .saturating_mul(1u64 << exponent)
        .min(settings.backoff_max_secs.max(base));
    let jitter_range = (secs * 1000 / 10).max(1);
    let jitter_ms = rand::random::<u64>() % jitter_range;
    Duration::from_millis(secs * 1000 + jitter_ms)
}
