//! Best-effort release.
//!
//! Release never fails from the caller's point of view: a store that cannot
//! be cleared keeps its entry until the TTL lapses.

use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::descriptor::LockDescriptor;
use crate::store::{StoreHandle, StoreId};

/// What a release call achieved on each targeted store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    /// Stores where this token's entry was deleted.
    pub cleared: BTreeSet<StoreId>,
    /// Stores that did not hold the token, could not be reached, or timed out.
    pub not_cleared: BTreeSet<StoreId>,
}

impl ReleaseReport {
    /// Whether any targeted store still held the token.
    pub fn released_anything(&self) -> bool {
        !self.cleared.is_empty()
    }
}

/// Issues compare-and-delete against the configured stores.
#[derive(Clone)]
pub struct ReleaseCoordinator {
    stores: Arc<[StoreHandle]>,
    store_timeout: Duration,
}

impl ReleaseCoordinator {
    pub fn new(stores: Arc<[StoreHandle]>, store_timeout: Duration) -> Self {
        Self {
            stores,
            store_timeout,
        }
    }

    /// Clear the descriptor's entry on every configured store.
    pub async fn release_all(&self, descriptor: &LockDescriptor) -> ReleaseReport {
        let targets: BTreeSet<StoreId> = self.stores.iter().map(StoreHandle::id).collect();
        self.release(descriptor, &targets).await
    }

    /// Clear the descriptor's entry on the given stores.
    ///
    /// Idempotent: stores that no longer hold this token are left untouched.
    pub async fn release(
        &self,
        descriptor: &LockDescriptor,
        targets: &BTreeSet<StoreId>,
    ) -> ReleaseReport {
        let key = descriptor.key();
        let token = descriptor.token().as_str();

        let calls = self
            .stores
            .iter()
            .filter(|handle| targets.contains(&handle.id()))
            .map(|handle| async move {
                let result = timeout(self.store_timeout, handle.store().try_clear(key, token)).await;
                (handle, result)
            });

        let mut report = ReleaseReport::default();
        for (handle, result) in join_all(calls).await {
            match result {
                Ok(true) => {
                    report.cleared.insert(handle.id());
                }
                Ok(false) => {
                    debug!(key, store = handle.name(), "release: entry not held by token");
                    report.not_cleared.insert(handle.id());
                }
                Err(_) => {
                    warn!(
                        key,
                        store = handle.name(),
                        "release timed out, entry left to expire"
                    );
                    report.not_cleared.insert(handle.id());
                }
            }
        }

        debug!(
            key,
            cleared = report.cleared.len(),
            not_cleared = report.not_cleared.len(),
            "release finished"
        );

        report
    }
}
