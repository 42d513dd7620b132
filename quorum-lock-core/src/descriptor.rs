//! Lock descriptors and fencing tokens.

use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Opaque fencing token written as the value of the lock key.
///
/// A fresh token is minted for every acquisition attempt, so a write that
/// lands late from an abandoned attempt can never be mistaken for the
/// current holder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Mint a new random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LockToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifies one acquisition attempt: resource key, fencing token and TTL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDescriptor {
    key: String,
    token: LockToken,
    ttl: Duration,
}

impl LockDescriptor {
    /// Describe a new attempt on `key` with a freshly minted token.
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            token: LockToken::generate(),
            ttl,
        }
    }

    /// Same key and token, different TTL. Used when a held lock is extended.
    pub fn with_ttl(&self, ttl: Duration) -> Self {
        Self {
            key: self.key.clone(),
            token: self.token.clone(),
            ttl,
        }
    }

    /// Get the lock key
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_attempt_gets_fresh_token() {
        let first = LockDescriptor::new("resource", Duration::from_secs(10));
        let second = LockDescriptor::new("resource", Duration::from_secs(10));

        assert_eq!(first.key(), second.key());
        assert_ne!(first.token(), second.token());
    }

    #[test]
    fn test_with_ttl_keeps_token() {
        let descriptor = LockDescriptor::new("resource", Duration::from_secs(10));
        let extended = descriptor.with_ttl(Duration::from_secs(30));

        assert_eq!(descriptor.token(), extended.token());
        assert_eq!(extended.ttl(), Duration::from_secs(30));
    }
}
