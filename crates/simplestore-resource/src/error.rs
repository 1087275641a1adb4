//! Error types for the resource layer.

use simplestore_core::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResourceError {
    /// Bad key arity, separator inside a key part, unknown field, bad prefix
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Environment missing, not initialized, or unusable
    #[error("Environment error: {0}")]
    Environment(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored bytes could not be turned back into a value (or a key)
    #[error("Codec error: {0}")]
    Codec(String),

    /// Failure reported by the storage engine, passed through unchanged
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ResourceError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub(crate) fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Whether the same operation might succeed when retried (lock timeouts).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_retryable())
    }
}

pub type ResourceResult<T> = Result<T, ResourceError>;
