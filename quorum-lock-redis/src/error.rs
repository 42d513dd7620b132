//! Redis store error types.

use thiserror::Error;

/// Result type for Redis store operations.
pub type Result<T> = std::result::Result<T, RedisStoreError>;

/// Redis store errors.
///
/// These never reach lock callers: the [`LockStore`](quorum_lock_core::LockStore)
/// implementation logs them and reports the store as not holding the slot.
#[derive(Debug, Error)]
pub enum RedisStoreError {
    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout error.
    #[error("Operation timed out")]
    Timeout,

    /// Underlying Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl RedisStoreError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout => true,
            Self::Redis(err) => err.is_io_error() || err.is_timeout() || err.is_connection_dropped(),
            Self::Config(_) => false,
        }
    }

    /// Check if this error indicates connection loss.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Redis(err) => err.is_connection_refusal() || err.is_connection_dropped(),
            _ => false,
        }
    }
}
