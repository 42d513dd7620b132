//! Lock error types.

use std::time::Duration;
use thiserror::Error;

use crate::acquire::AttemptFailure;
use crate::retry::LockState;

/// Result type for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;

/// Distributed lock errors
#[derive(Debug, Error)]
pub enum LockError {
    /// Every permitted attempt ended in a quorum miss or a budget miss.
    #[error("Failed to acquire lock '{key}' after {attempts} attempts: {last_failure}")]
    AttemptsExhausted {
        key: String,
        attempts: u32,
        last_failure: AttemptFailure,
    },

    #[error("No stores configured")]
    NoStores,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The TTL is too short to leave any validity once the drift margin is subtracted.
    #[error("TTL {ttl:?} leaves no validity window after drift margin {drift:?}")]
    InvalidTtl { ttl: Duration, drift: Duration },

    #[error("Failed to extend lock '{key}': {reason}")]
    ExtendFailed { key: String, reason: AttemptFailure },

    /// `acquire_until` was cancelled while backing off between attempts.
    #[error("Acquisition of lock '{key}' cancelled after {attempts} attempts")]
    Cancelled { key: String, attempts: u32 },

    #[error("Invalid lock state transition: {from} -> {to}")]
    InvalidTransition { from: LockState, to: LockState },
}

impl LockError {
    /// Check if the caller may reasonably try the same call again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AttemptsExhausted { .. } | Self::ExtendFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_message_names_cause() {
        let err = LockError::AttemptsExhausted {
            key: "orders".to_string(),
            attempts: 3,
            last_failure: AttemptFailure::QuorumMiss {
                accepted: 1,
                required: 3,
            },
        };

        let message = err.to_string();
        assert!(message.contains("orders"));
        assert!(message.contains("3 attempts"));
        assert!(message.contains("1/3"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_misuse_is_not_retryable() {
        assert!(!LockError::NoStores.is_retryable());
        assert!(!LockError::InvalidConfig("bad".into()).is_retryable());
        assert!(
            !LockError::Cancelled {
                key: "orders".into(),
                attempts: 1
            }
            .is_retryable()
        );
    }
}
