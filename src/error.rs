//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// Only configuration can fail. A denied admission check is a normal
/// outcome reported as `false`, never as an error.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// The configured limit was zero
    #[error("Invalid limit {0}: limit must be positive")]
    InvalidLimit(u64),

    /// The configured refill interval was zero
    #[error("Invalid interval: interval must be positive")]
    InvalidInterval,

    /// The eviction sweep settings were unusable
    #[error("Invalid sweep configuration: {0}")]
    InvalidSweep(String),

    /// The limiter was built outside of a Tokio runtime
    #[error("No Tokio runtime available to run the eviction sweep")]
    NoRuntime,

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for TollgateError {
    fn from(err: ::config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
