//! Retry utilities with exponential backoff, cap, and jitter.
//!
//! Optimistic-concurrency conflicts are the one storage failure worth
//! retrying: the caller re-reads the current snapshot and tries again.
//! Backoff schedules come from `backon`.

use std::time::Duration;

use backon::ExponentialBuilder;
use serde::Deserialize;

use crate::storage::StoreError;

/// Configuration for retry behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap, in milliseconds.
    pub max_delay_ms: u64,
    /// Maximum number of retry attempts (0 = no retries, just initial attempt).
    pub max_retries: usize,
    /// Randomize delays so competing writers drift apart.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 10,
            max_delay_ms: 2_000,
            max_retries: 10,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms))
    }

    /// Exponential backoff schedule: base * 2^attempt, capped at max delay.
    pub fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.base_delay())
            .with_max_delay(self.max_delay())
            .with_max_times(self.max_retries);
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}

/// Determines if a storage error is retryable (stale snapshot token only).
///
/// `NotFound`, `Integrity` and transport failures will not change on a
/// re-read and are returned to the caller as-is.
pub fn is_retryable(err: &StoreError) -> bool {
    err.is_conflict()
}
