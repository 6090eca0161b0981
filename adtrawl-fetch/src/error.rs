//! Fetch error types.

use thiserror::Error;

/// Error type for session and collection operations.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Bootstrap could not establish a usable session. Refreshable.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The refresh ceiling was exceeded; a new client is required.
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// The identity pool is exhausted or misconfigured.
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// HTTP request failed at the transport level.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Response body was not what the protocol promises.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Core error, including invalid caller parameters.
    #[error("Core error: {0}")]
    Core(#[from] adtrawl_core::CoreError),

    /// IO error (proxy list files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// True if this error came from a connection-level failure worth
    /// retrying (connect refused, timeout).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }
}
