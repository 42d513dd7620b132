//! Error types for the quorum-lock CLI.

use quorum_lock_core::LockError;
use quorum_lock_redis::RedisStoreError;
use thiserror::Error;

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

/// CLI error types.
#[derive(Debug, Error)]
pub enum CliError {
    /// IO error (reading config files, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration values
    #[error("Configuration error: {0}")]
    Config(String),

    /// Config file could not be parsed
    #[error("Parse error in {path}: {message}")]
    Parse { path: String, message: String },

    /// Lock protocol error
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Store setup error
    #[error("Store error: {0}")]
    Store(#[from] RedisStoreError),

    /// Logging could not be installed
    #[error("Logging error: {0}")]
    Logging(String),
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) | CliError::Parse { .. } => 2,
            CliError::Lock(
                LockError::InvalidConfig(_) | LockError::InvalidTtl { .. } | LockError::NoStores,
            ) => 2,
            CliError::Store(RedisStoreError::Config(_)) => 2,
            _ => 1,
        }
    }
}
