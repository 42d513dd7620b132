//! Quorum acquisition.
//!
//! One attempt issues the conditional write to every store at once, each
//! call bounded by a timeout, and tallies who accepted. The attempt succeeds
//! only if a majority accepted *and* enough of the TTL is left to be useful.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::descriptor::LockDescriptor;
use crate::store::{LockStore, StoreHandle, StoreId};

/// Minimum number of stores whose agreement guarantees that any two
/// agreeing sets overlap.
pub fn quorum(store_count: usize) -> usize {
    store_count / 2 + 1
}

/// Why an attempt did not produce a usable lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    /// Fewer than `required` stores accepted the write.
    QuorumMiss { accepted: usize, required: usize },
    /// Quorum was reached but the attempt consumed the whole validity window.
    BudgetExceeded { elapsed: Duration, ttl: Duration },
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QuorumMiss { accepted, required } => {
                write!(f, "quorum miss ({}/{} stores accepted)", accepted, required)
            }
            Self::BudgetExceeded { elapsed, ttl } => {
                write!(f, "budget exceeded ({:?} elapsed of {:?} ttl)", elapsed, ttl)
            }
        }
    }
}

/// Decision reached by one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The lock is held for `validity` from the end of the attempt.
    Acquired { validity: Duration },
    Failed(AttemptFailure),
}

/// Result of one pass over the store set.
#[derive(Debug, Clone)]
pub struct AcquisitionOutcome {
    /// Stores that applied the operation.
    pub accepted: BTreeSet<StoreId>,
    /// Stores that answered and refused.
    pub rejected: BTreeSet<StoreId>,
    /// Stores that timed out or whose call was cancelled. Their write may
    /// still land.
    pub unresponsive: BTreeSet<StoreId>,
    /// Wall-clock time the attempt took.
    pub elapsed: Duration,
    pub started_at: Instant,
    pub verdict: Verdict,
}

impl AcquisitionOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self.verdict, Verdict::Acquired { .. })
    }

    pub fn validity(&self) -> Option<Duration> {
        match self.verdict {
            Verdict::Acquired { validity } => Some(validity),
            Verdict::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&AttemptFailure> {
        match &self.verdict {
            Verdict::Acquired { .. } => None,
            Verdict::Failed(failure) => Some(failure),
        }
    }

    /// Stores that may hold an entry written by this attempt.
    pub fn cleanup_targets(&self) -> BTreeSet<StoreId> {
        self.accepted.union(&self.unresponsive).copied().collect()
    }
}

/// Drives one acquisition attempt across all configured stores.
#[derive(Clone)]
pub struct QuorumAcquirer {
    stores: Arc<[StoreHandle]>,
    config: LockConfig,
}

impl QuorumAcquirer {
    pub fn new(stores: Arc<[StoreHandle]>, config: LockConfig) -> Self {
        Self { stores, config }
    }

    /// Number of stores that must accept for an attempt to succeed.
    pub fn quorum(&self) -> usize {
        quorum(self.stores.len())
    }

    /// Try to write the descriptor's token to every store.
    pub async fn acquire_once(&self, descriptor: &LockDescriptor) -> AcquisitionOutcome {
        let key = descriptor.key();
        let token = descriptor.token().as_str();
        let ttl = descriptor.ttl();

        self.run(descriptor, "acquire", |store| store.try_set(key, token, ttl))
            .await
    }

    /// Push the expiry of an entry this descriptor's token already holds.
    ///
    /// Succeeds under the same rule as acquisition: a quorum of stores must
    /// confirm, with validity left over.
    pub async fn extend_once(&self, descriptor: &LockDescriptor) -> AcquisitionOutcome {
        let key = descriptor.key();
        let token = descriptor.token().as_str();
        let ttl = descriptor.ttl();

        self.run(descriptor, "extend", |store| store.try_extend(key, token, ttl))
            .await
    }

    async fn run<'a, F>(
        &'a self,
        descriptor: &LockDescriptor,
        operation: &'static str,
        call: F,
    ) -> AcquisitionOutcome
    where
        F: Fn(&'a dyn LockStore) -> BoxFuture<'a, bool>,
    {
        let started_at = Instant::now();
        let ttl = descriptor.ttl();
        let drift = self.config.drift_margin(ttl);
        let per_store_timeout = self.config.store_timeout_for(ttl);

        let total = self.stores.len();
        let required = quorum(total);
        let tolerated = total - required;

        let mut pending: FuturesUnordered<_> = self
            .stores
            .iter()
            .map(|handle| {
                let call = call(handle.store());
                async move { (handle.id(), timeout(per_store_timeout, call).await) }
            })
            .collect();

        let mut accepted = BTreeSet::new();
        let mut rejected = BTreeSet::new();
        let mut unresponsive = BTreeSet::new();

        while let Some((id, result)) = pending.next().await {
            match result {
                Ok(true) => {
                    accepted.insert(id);
                }
                Ok(false) => {
                    rejected.insert(id);
                }
                Err(_) => {
                    warn!(
                        key = descriptor.key(),
                        store = self.name_of(id),
                        timeout_ms = per_store_timeout.as_millis() as u64,
                        "{} call timed out",
                        operation
                    );
                    unresponsive.insert(id);
                }
            }

            if rejected.len() + unresponsive.len() > tolerated {
                break;
            }
        }

        // Quorum is out of reach: drop whatever is still in flight.
        drop(pending);
        for handle in self.stores.iter() {
            let id = handle.id();
            if !accepted.contains(&id) && !rejected.contains(&id) && unresponsive.insert(id) {
                debug!(
                    key = descriptor.key(),
                    store = handle.name(),
                    "{} call cancelled, quorum unreachable",
                    operation
                );
            }
        }

        let elapsed = started_at.elapsed();
        let verdict = if accepted.len() < required {
            Verdict::Failed(AttemptFailure::QuorumMiss {
                accepted: accepted.len(),
                required,
            })
        } else if elapsed + drift >= ttl {
            Verdict::Failed(AttemptFailure::BudgetExceeded { elapsed, ttl })
        } else {
            Verdict::Acquired {
                validity: ttl - elapsed - drift,
            }
        };

        debug!(
            key = descriptor.key(),
            operation,
            accepted = accepted.len(),
            rejected = rejected.len(),
            unresponsive = unresponsive.len(),
            required,
            elapsed_ms = elapsed.as_millis() as u64,
            "attempt finished"
        );

        AcquisitionOutcome {
            accepted,
            rejected,
            unresponsive,
            elapsed,
            started_at,
            verdict,
        }
    }

    /// Names of the given stores, for log output.
    pub fn names_of<'a>(&self, ids: impl IntoIterator<Item = &'a StoreId>) -> Vec<String> {
        ids.into_iter()
            .map(|id| self.name_of(*id).to_string())
            .collect()
    }

    fn name_of(&self, id: StoreId) -> &str {
        self.stores
            .get(id.0)
            .map(|handle| handle.name())
            .unwrap_or("unknown")
    }
}
