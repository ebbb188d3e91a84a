//! Error types for the pattern engine

use thiserror::Error;

/// Errors that can occur in the pattern engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Incoming event is missing required fields
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// The pattern store could not be reached
    #[error("Pattern store unavailable: {0}")]
    StoreUnavailable(String),

    /// A stored row violates an invariant (e.g. duplicate key)
    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    /// Configuration value out of range or unparsable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Pattern, scene or link not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Review status change outside the lifecycle
    #[error("Cannot move {key} from {from:?} to {to:?}")]
    InvalidTransition {
        key: String,
        from: crate::model::PatternStatus,
        to: crate::model::PatternStatus,
    },

    /// Batch pass was cancelled
    #[error("Batch pass cancelled")]
    Cancelled,

    /// Batch pass exceeded its time budget
    #[error("Batch pass timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// IO error (persistence)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether retrying the same operation may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Io(_))
    }
}
