use crate::JobId;
use thiserror::Error;

/// Errors surfaced to callers of the scheduler.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("no progress recorded for {0}")]
    ProgressNotFound(String),
    #[error("scheduler is shutting down")]
    PoolShutdown,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Failure reported by a [`Retriever`](crate::Retriever). The retriever owns
/// the classification; the worker pool only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetrievalError {
    /// Network errors, throttling, temporary server failures.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Unsupported source, bad URL, authorization denied.
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("retrieval cancelled")]
    Cancelled,
}

impl RetrievalError {
    pub fn transient(msg: impl Into<String>) -> Self {
        RetrievalError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        RetrievalError::Permanent(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RetrievalError::Transient(_))
    }
}
