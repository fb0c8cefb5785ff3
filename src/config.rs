use crate::Error;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff parameters for transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the second attempt; doubles for each further attempt.
    pub base_delay_ms: u64,
    /// Upper bound on any single backoff delay.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of workers, i.e. the cap on concurrently active jobs.
    pub max_concurrent: usize,
    /// Default retry ceiling, counting the first attempt.
    pub max_attempts: u32,
    pub retry: RetryConfig,
    /// Default per-job wall-clock limit. `None` means unlimited.
    pub job_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            max_attempts: 3,
            retry: RetryConfig::default(),
            job_timeout: None,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry = RetryConfig {
            base_delay_ms: saturating_millis(base),
            max_delay_ms: saturating_millis(max),
        };
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_concurrent == 0 {
            return Err(Error::InvalidConfig("max_concurrent must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfig("max_attempts must be at least 1".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(Error::InvalidConfig(format!(
                "retry base delay ({}ms) exceeds max delay ({}ms)",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            )));
        }
        if self.job_timeout == Some(Duration::ZERO) {
            return Err(Error::InvalidConfig("job_timeout must be positive".into()));
        }
        Ok(())
    }
}
