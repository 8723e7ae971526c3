//! Error types for the rewriting core.

use thiserror::Error;

/// Errors that can occur in the rewriting core.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (credential file operations).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Credential storage error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Candidate API key rejected by validation.
    #[error("Invalid API key: expected at least {min} characters")]
    InvalidApiKey {
        /// Minimum accepted length after trimming.
        min: usize,
    },
}

/// Result type alias using `ProxyError`.
pub type Result<T> = std::result::Result<T, ProxyError>;
