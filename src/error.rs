//! Error types for ratewatch.

use thiserror::Error;

/// Main error type for ratewatch operations.
#[derive(Error, Debug)]
pub enum RatewatchError {
    /// Invalid constructor parameters or a self-referential task
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for RatewatchError {
    fn from(err: ::config::ConfigError) -> Self {
        RatewatchError::Config(err.to_string())
    }
}

/// Result type alias for ratewatch operations.
pub type Result<T> = std::result::Result<T, RatewatchError>;
