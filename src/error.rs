//! Error types for the RuralGuru throttle.

use thiserror::Error;

/// Main error type for throttle operations.
#[derive(Error, Debug)]
pub enum ThrottleError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared store errors that are not Redis-specific
    #[error("Store error: {0}")]
    Store(String),

    /// Redis backend errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for ThrottleError {
    fn from(err: ::config::ConfigError) -> Self {
        ThrottleError::Config(err.to_string())
    }
}

/// Result type alias for throttle operations.
pub type Result<T> = std::result::Result<T, ThrottleError>;
