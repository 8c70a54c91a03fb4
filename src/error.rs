//! Error types for context assembly

use thiserror::Error;

/// Errors raised while assembling a context.
///
/// Clone-able so a coalesced build can hand the same failure to every
/// caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContextError {
    /// Target node is missing. The only hard failure of a build.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Transient failure reading from the node store
    #[error("Node store unavailable: {0}")]
    StoreUnavailable(String),

    /// Scoring or allocation could not complete
    #[error("Weighting degraded: {0}")]
    WeightingDegraded(String),

    /// Cache backend failure
    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ContextError {
    fn from(e: serde_json::Error) -> Self {
        ContextError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ContextError>;

/// Which background job produced a [`BackgroundError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundTask {
    CacheWrite,
    Warmup,
}

/// Failure reported by a background task on its error channel
#[derive(Debug, Clone)]
pub struct BackgroundError {
    pub task: BackgroundTask,
    pub key: String,
    pub error: ContextError,
}
