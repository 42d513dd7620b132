//! # Quorum Lock Redis
//!
//! Redis instances as lock stores for `quorum-lock-core`.
//!
//! Each [`RedisStore`] talks to one independent Redis server:
//!
//! - acquire: `SET key token NX PX ttl`
//! - release: Lua compare-and-delete, so only the token holder clears the key
//! - extend: Lua compare-and-`PEXPIRE`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use quorum_lock_core::{LockConfig, Redlock};
//! use quorum_lock_redis::{connect_all, RedisClusterConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stores = connect_all(&RedisClusterConfig::from_env())?;
//!     let redlock = Redlock::new(stores, LockConfig::default())?;
//!
//!     let lock = redlock.acquire("my_lock_key", Duration::from_secs(10)).await?;
//!     // critical section
//!     lock.release().await;
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod store;

pub use config::*;
pub use error::*;
pub use store::{RedisStore, connect_all};
