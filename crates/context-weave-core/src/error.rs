//! Engine error taxonomy.
//!
//! | Class | Variant | Surfaced as |
//! |-------|---------|-------------|
//! | input | [`EngineError::InvalidInput`] | rejected synchronously, never retried |
//! | source | [`EngineError::Source`] | recorded per source in the response |
//! | degradation | [`EngineError::Degraded`] | lower-quality path, flagged in the response |
//! | corruption | [`EngineError::Corruption`] | full rescan of the affected root |
//! | fatal | [`EngineError::ServiceUnavailable`] | returned to the caller, no partial results |
//!
//! [`EngineError::DeadlineExceeded`] covers caller cancellation by deadline;
//! partial federation state is discarded.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("source '{name}' failed: {message}")]
    Source { name: String, message: String },

    #[error("degraded: {0}")]
    Degraded(String),

    #[error("index root '{root}' is corrupt: {reason}")]
    Corruption { root: String, reason: String },

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("request deadline exceeded")]
    DeadlineExceeded,
}

impl EngineError {
    pub fn source_failed(name: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Source {
            name: name.into(),
            message: err.to_string(),
        }
    }

    /// Whether a later request may reasonably succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Source { .. } | Self::ServiceUnavailable(_))
    }
}
