use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};
use uuid::Uuid;

pub mod config;
pub mod error;
pub mod pool;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod retriever;
pub mod retry;
pub mod scheduler;
pub mod telemetry;
mod worker;

pub use config::{RetryConfig, SchedulerConfig};
pub use error::{Error, RetrievalError};
pub use pool::PoolStatus;
pub use progress::{
    ObserverHandle, ProgressObserver, ProgressSink, ProgressSnapshot, ProgressStatus, ProgressTable,
};
pub use retriever::{RetrievalResult, Retriever};
pub use scheduler::{JobEvent, Scheduler};

pub type JobId = Uuid;

/// Retrieval options, handed to the retriever untouched.
pub type Options = serde_json::Map<String, serde_json::Value>;

/// Dispatch tier. Declaration order is dispatch order, lowest first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        };
        f.write_str(name)
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(Error::InvalidInput(format!("unknown priority `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Active,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }
}

/// A request to retrieve one URL, before it has been accepted by the scheduler.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub url: String,
    pub options: Options,
    pub priority: Priority,
    /// Overrides the scheduler's default retry ceiling.
    pub max_attempts: Option<u32>,
    /// Overall wall-clock limit, measured from submission.
    pub timeout: Option<Duration>,
}

impl JobRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            options: Options::new(),
            priority: Priority::default(),
            max_attempts: None,
            timeout: None,
        }
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Rejects requests that must never reach the queue.
    pub fn validate(&self) -> Result<(), Error> {
        if self.url.trim().is_empty() {
            return Err(Error::InvalidInput("url must not be empty".into()));
        }
        if let Some(key) = self.options.keys().find(|key| key.trim().is_empty()) {
            return Err(Error::InvalidInput(format!(
                "option names must not be blank, got `{key}`"
            )));
        }
        if self.max_attempts == Some(0) {
            return Err(Error::InvalidInput("max_attempts must be at least 1".into()));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(Error::InvalidInput("timeout must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub url: String,
    pub options: Options,
    pub priority: Priority,
    /// Queue order within a priority tier; reassigned on every enqueue.
    pub sequence: u64,
    pub status: Status,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<RetrievalResult>,
    pub timeout: Option<Duration>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub(crate) fn new(request: JobRequest, default_max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: request.url,
            options: request.options,
            priority: request.priority,
            sequence: 0,
            status: Status::Queued,
            attempts: 0,
            max_attempts: request.max_attempts.unwrap_or(default_max_attempts),
            last_error: None,
            result: None,
            timeout: request.timeout,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub(crate) fn begin_attempt(&mut self) {
        self.status = Status::Active;
        self.attempts += 1;
        self.last_error = None;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn retrying(&mut self, error: String) {
        self.status = Status::Retrying;
        self.last_error = Some(error);
    }

    pub(crate) fn complete(&mut self, result: RetrievalResult) {
        self.status = Status::Completed;
        self.last_error = None;
        self.result = Some(result);
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, error: String) {
        self.status = Status::Failed;
        self.last_error = Some(error);
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn cancel(&mut self) {
        self.status = Status::Cancelled;
        self.last_error = None;
        self.finished_at = Some(Utc::now());
    }
}
