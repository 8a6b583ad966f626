//! Error types for the Strata daemon.

use thiserror::Error;

/// Result type for daemon operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a Strata node.
#[derive(Debug, Error)]
pub enum Error {
    /// Overlay protocol error
    #[error(transparent)]
    Overlay(#[from] strata_overlay::Error),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration value
    #[error("Invalid {name}: {reason}")]
    Config { name: &'static str, reason: String },

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<Error> for strata_overlay::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Overlay(inner) => inner,
            other => strata_overlay::Error::Store(other.to_string()),
        }
    }
}
