//! Error types for Warden.

use thiserror::Error;

/// Main error type for Warden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limiter or table was constructed with unusable parameters
    #[error("Invalid limit for {bin}: {reason}")]
    InvalidLimit { bin: String, reason: String },

    /// Background tasks need a Tokio runtime to be spawned on
    #[error("No Tokio runtime available to drive background tasks")]
    NoRuntime,

    /// A modal prompt referenced a handler nobody registered
    #[error("Unknown modal handler: {0}")]
    UnknownHandler(String),
}

impl From<config::ConfigError> for WardenError {
    fn from(err: config::ConfigError) -> Self {
        WardenError::Config(err.to_string())
    }
}

/// Result type alias for Warden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
