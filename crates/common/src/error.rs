//! Common error types for Relay components.

use std::fmt;

/// A specialized Result type for Relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Relay operations.
///
/// Check failures are not errors: a failed probe resolves to a status code
/// and a health transition. `Error` is reserved for misuse and bad
/// configuration.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Check error: {0}")]
    Check(String),

    #[error("Pattern error: {0}")]
    Pattern(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new check error.
    pub fn check(msg: impl fmt::Display) -> Self {
        Error::Check(msg.to_string())
    }

    /// Create a new pattern error.
    pub fn pattern(msg: impl fmt::Display) -> Self {
        Error::Pattern(msg.to_string())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new other error.
    pub fn other(msg: impl fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }
}
