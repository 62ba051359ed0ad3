//! Error types for replicated documents.

use thiserror::Error;

/// Result type for replica operations.
pub type CrdtResult<T> = Result<T, CrdtError>;

/// Errors that can occur while reading or mutating a replica.
#[derive(Debug, Error)]
pub enum CrdtError {
    /// Update or state-vector bytes could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A decoded update could not be integrated.
    #[error("apply error: {0}")]
    Apply(String),

    /// The replica refused a new observer.
    #[error("observe error: {0}")]
    Observe(String),

    /// A sub-structure exists under the key but has a different shape.
    #[error("unexpected structure at {key}: expected {expected}")]
    Structure { key: String, expected: &'static str },

    /// Invalid logical document name.
    #[error("invalid document name: {0}")]
    InvalidName(String),

    /// JSON encoding of a structured value failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
