//! Quorum Locks for Independent Stores
//!
//! A Redlock-style distributed mutual-exclusion lock over N independent,
//! unreliable key/value stores.
//!
//! ## Features
//!
//! - **Quorum Acquisition** - A lock is held only when `N/2 + 1` stores accept
//! - **Time Budget** - Validity is the TTL minus acquisition time and clock drift
//! - **Fencing Tokens** - A fresh random token per attempt; release is compare-and-delete
//! - **Bounded Retry** - Explicit state machine with jittered, seedable backoff
//! - **RAII Pattern** - Best-effort release when a handle is dropped
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use quorum_lock_core::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let redlock = LockBuilder::new()
//!         .stores((0..5).map(|i| Arc::new(MemoryStore::new(format!("mem-{}", i))) as _))
//!         .config(LockConfig::default())
//!         .build()?;
//!
//!     let handle = redlock.acquire("my-resource", Duration::from_secs(10)).await?;
//!
//!     // Critical section, valid for handle.remaining_validity()
//!     println!("Lock acquired on {} stores", handle.acquired_stores().len());
//!
//!     redlock.release(handle).await;
//!     Ok(())
//! }
//! ```

pub mod acquire;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod lock;
pub mod release;
pub mod retry;
pub mod store;

pub use acquire::{AcquisitionOutcome, AttemptFailure, QuorumAcquirer, Verdict, quorum};
pub use config::{BackoffConfig, LockConfig, LockConfigBuilder, STORE_TIMEOUT_TTL_DIVISOR};
pub use descriptor::{LockDescriptor, LockToken};
pub use error::{LockError, Result};
pub use lock::{LockBuilder, LockHandle, Redlock};
pub use release::{ReleaseCoordinator, ReleaseReport};
pub use retry::{LockState, RetryDecision, RetryScheduler};
pub use store::{Fault, LockStore, MemoryStore, StoreHandle, StoreId};
