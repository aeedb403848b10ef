//! Error types for rule compilation and request handling

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for jambox operations
#[derive(Debug, Error)]
pub enum JamboxError {
    /// Malformed configuration (missing target, bad status, ...)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A URL in the configuration could not be parsed or resolved
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// A stub references a file that cannot be read
    #[error("Stub file '{}' could not be read: {source}", path.display())]
    StubFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A committed entry disappeared between matcher and handler
    #[error("Cache retrieval failed for key {0}")]
    CacheMiss(String),

    /// Network-related errors
    #[error("Network error: {0}")]
    Network(String),

    /// Certificate-related errors
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// HTTP processing errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// Event or config (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl JamboxError {
    pub(crate) fn invalid_url(url: impl Into<String>, reason: impl ToString) -> Self {
        JamboxError::InvalidUrl {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}
