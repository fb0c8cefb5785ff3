//! Boundary to the media retrieval engine.

use crate::{Options, ProgressSink, RetrievalError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// What a successful retrieval produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    /// Where the media ended up, if the engine wrote a file.
    pub filename: Option<String>,
    /// Engine-specific metadata (title, duration, extractor, ...).
    pub info: Options,
}

impl RetrievalResult {
    pub fn with_filename(filename: impl Into<String>) -> Self {
        Self {
            filename: Some(filename.into()),
            info: Options::new(),
        }
    }
}

/// Performs one retrieval attempt.
///
/// Implementations report progress through `progress` as often as they like
/// and should return [`RetrievalError::Cancelled`] soon after `cancel` fires.
/// Cooperation is optional: the worker stops waiting on cancellation either
/// way and discards whatever the attempt eventually returns.
#[async_trait]
pub trait Retriever: Send + Sync + 'static {
    async fn retrieve(
        &self,
        url: &str,
        options: &Options,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<RetrievalResult, RetrievalError>;
}
