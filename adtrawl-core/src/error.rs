//! Core error types for adtrawl.

use thiserror::Error;

/// Core error type for adtrawl operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Caller supplied an out-of-range search parameter.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A raw payload could not be turned into a domain record.
    #[error("Invalid record data: {0}")]
    InvalidData(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with message.
    #[error("{0}")]
    Other(String),
}
