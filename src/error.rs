//! Error types for the gate service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for service setup and runtime operations.
///
/// Request-level outcomes are not errors; they are reported as
/// [`Denial`](crate::ratelimit::Denial)s.
#[derive(Error, Debug)]
pub enum GateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store errors outside the request path (migrations, cleanup)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for GateError {
    fn from(err: config::ConfigError) -> Self {
        GateError::Config(err.to_string())
    }
}

/// Result type alias for gate operations.
pub type Result<T> = std::result::Result<T, GateError>;
