// quorum-lock - Redlock-style distributed locks for Rust
//
// This library acquires a lock by writing a random token to a majority of
// independent key/value stores within a bounded time budget.

// Re-export the protocol core
pub use quorum_lock_core::*;

// Re-export optional store adapters
#[cfg(feature = "redis")]
pub use quorum_lock_redis;

#[cfg(feature = "redis")]
pub use quorum_lock_redis::{RedisClusterConfig, RedisStore, RedisStoreConfig, connect_all};
