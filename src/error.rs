//! Error types for Fleetrate.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Fleetrate operations.
#[derive(Error, Debug)]
pub enum FleetrateError {
    /// A rate, permit count or setting was out of range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The lock could not be obtained before the configured deadline
    #[error("Lock for '{key}' unavailable after {waited:?}")]
    LockUnavailable { key: String, waited: Duration },

    /// The shared store could not be reached
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The shared store answered with an error or an unexpected reply
    #[error("Store protocol error: {0}")]
    Protocol(String),

    /// A persisted limiter field is present but unreadable
    #[error("Corrupt state in '{key}': field {field} = {value:?}")]
    CorruptState {
        key: String,
        field: &'static str,
        value: String,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetrateError {
    /// Whether the caller may reasonably retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetrateError::LockUnavailable { .. } | FleetrateError::StoreUnavailable(_)
        )
    }
}

impl From<config::ConfigError> for FleetrateError {
    fn from(err: config::ConfigError) -> Self {
        FleetrateError::Config(err.to_string())
    }
}

impl From<redis::RedisError> for FleetrateError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_timeout()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
        {
            FleetrateError::StoreUnavailable(err.to_string())
        } else {
            FleetrateError::Protocol(err.to_string())
        }
    }
}

/// Result type alias for Fleetrate operations.
pub type Result<T> = std::result::Result<T, FleetrateError>;
