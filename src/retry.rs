//! Retry and backoff policy for failed retrieval attempts.

use crate::{config::RetryConfig, RetrievalError};
use std::time::Duration;

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Give up; the job becomes FAILED.
    NoRetry,
    /// Re-enqueue after the given delay.
    RetryAfter(Duration),
}

/// Exponential backoff with a cap: `base * 2^(attempt-1)`, at most `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the attempt following `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(exp).min(self.max_delay)
    }

    /// `attempts` is the number of attempts already made, including the one
    /// that just failed.
    pub fn decide(&self, attempts: u32, max_attempts: u32, error: &RetrievalError) -> RetryDecision {
        if !error.is_retryable() || attempts >= max_attempts {
            return RetryDecision::NoRetry;
        }
        RetryDecision::RetryAfter(self.backoff(attempts))
    }
}
