//! Store adapters.
//!
//! A [`LockStore`] is one independent key/value backend. The protocol only
//! needs three atomic primitives from it, and collapses every communication
//! failure into `false`: a store that could not be reached and a store that
//! refused the write both mean "this store's slot is not ours".

mod memory;

pub use memory::{Fault, MemoryStore};

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Capability over a single backing store.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Name used in logs (typically the endpoint address).
    fn name(&self) -> &str;

    /// Set `key` to `token` with expiry `ttl`, only if `key` is absent.
    ///
    /// Returns `true` only if this call created the entry.
    async fn try_set(&self, key: &str, token: &str, ttl: Duration) -> bool;

    /// Delete `key`, only if its current value equals `token`.
    ///
    /// The comparison and the delete must execute as one indivisible step
    /// at the store.
    async fn try_clear(&self, key: &str, token: &str) -> bool;

    /// Reset the expiry of `key` to `ttl`, only if its current value equals `token`.
    async fn try_extend(&self, key: &str, token: &str, ttl: Duration) -> bool;
}

/// Position of a store in the configured set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreId(pub usize);

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store-{}", self.0)
    }
}

/// One configured store together with its identifier.
#[derive(Clone)]
pub struct StoreHandle {
    id: StoreId,
    store: Arc<dyn LockStore>,
}

impl StoreHandle {
    pub fn new(id: StoreId, store: Arc<dyn LockStore>) -> Self {
        Self { id, store }
    }

    /// Number every store by its position.
    pub fn enumerate(stores: Vec<Arc<dyn LockStore>>) -> Vec<StoreHandle> {
        stores
            .into_iter()
            .enumerate()
            .map(|(index, store)| StoreHandle::new(StoreId(index), store))
            .collect()
    }

    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    pub fn store(&self) -> &dyn LockStore {
        self.store.as_ref()
    }
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("id", &self.id)
            .field("name", &self.store.name())
            .finish()
    }
}
