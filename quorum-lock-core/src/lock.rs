//! Quorum lock over independent stores

use futures::future::{self, Either};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::acquire::{AcquisitionOutcome, QuorumAcquirer, Verdict};
use crate::config::LockConfig;
use crate::descriptor::{LockDescriptor, LockToken};
use crate::error::{LockError, Result};
use crate::release::{ReleaseCoordinator, ReleaseReport};
use crate::retry::{LockState, RetryDecision, RetryScheduler};
use crate::store::{LockStore, StoreHandle, StoreId};

/// A held lock.
///
/// The handle owns the retry scheduler that won it, left in `Holding`;
/// releasing moves it back to `Idle`.
///
/// Dropping an unreleased handle spawns a best-effort release on the
/// current tokio runtime; without a runtime the entries are left to expire.
/// A process about to exit should call [`LockHandle::release`] instead.
pub struct LockHandle {
    descriptor: LockDescriptor,
    acquired_stores: BTreeSet<StoreId>,
    acquired_at: Instant,
    valid_until: Instant,
    releaser: ReleaseCoordinator,
    scheduler: RetryScheduler,
    released: bool,
}

impl LockHandle {
    fn new(
        descriptor: LockDescriptor,
        outcome: &AcquisitionOutcome,
        validity: Duration,
        releaser: ReleaseCoordinator,
        scheduler: RetryScheduler,
    ) -> Self {
        let acquired_at = outcome.started_at + outcome.elapsed;
        Self {
            descriptor,
            acquired_stores: outcome.accepted.clone(),
            acquired_at,
            valid_until: acquired_at + validity,
            releaser,
            scheduler,
            released: false,
        }
    }

    pub fn descriptor(&self) -> &LockDescriptor {
        &self.descriptor
    }

    /// Get the lock key
    pub fn key(&self) -> &str {
        self.descriptor.key()
    }

    pub fn token(&self) -> &LockToken {
        self.descriptor.token()
    }

    pub fn ttl(&self) -> Duration {
        self.descriptor.ttl()
    }

    /// Stores that accepted the write for this token.
    pub fn acquired_stores(&self) -> &BTreeSet<StoreId> {
        &self.acquired_stores
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// Instant after which this process must assume it no longer holds the lock.
    pub fn valid_until(&self) -> Instant {
        self.valid_until
    }

    /// Time left before the lock must be considered lost.
    pub fn remaining_validity(&self) -> Duration {
        self.valid_until.saturating_duration_since(Instant::now())
    }

    pub fn is_valid(&self) -> bool {
        Instant::now() < self.valid_until
    }

    /// Lifecycle state of the acquisition that produced this handle.
    pub fn state(&self) -> LockState {
        self.scheduler.state()
    }

    /// Attempts it took to win the lock.
    pub fn attempts(&self) -> u32 {
        self.scheduler.attempts()
    }

    /// Release the lock on every store.
    pub async fn release(mut self) -> ReleaseReport {
        self.release_entries().await
    }

    async fn release_entries(&mut self) -> ReleaseReport {
        self.released = true;
        let report = self.releaser.release_all(&self.descriptor).await;
        if let Err(e) = self.scheduler.on_released() {
            warn!(key = self.descriptor.key(), error = %e, "Unexpected lock state on release");
        }
        info!(
            key = self.descriptor.key(),
            cleared = report.cleared.len(),
            "Released lock"
        );
        report
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.descriptor.key())
            .field("state", &self.state())
            .field("acquired_stores", &self.acquired_stores)
            .field("remaining_validity", &self.remaining_validity())
            .finish()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let descriptor = self.descriptor.clone();
        let releaser = self.releaser.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    releaser.release_all(&descriptor).await;
                });
            }
            Err(_) => {
                warn!(
                    key = descriptor.key(),
                    "Lock handle dropped outside a runtime; entries will expire by TTL"
                );
            }
        }
    }
}

/// Redlock-style lock manager over N independent stores.
pub struct Redlock {
    stores: Arc<[StoreHandle]>,
    config: LockConfig,
    acquirer: QuorumAcquirer,
    releaser: ReleaseCoordinator,
    rng: Mutex<StdRng>,
}

impl Redlock {
    /// Create a lock manager.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use quorum_lock_core::{LockConfig, MemoryStore, Redlock};
    /// use std::sync::Arc;
    ///
    /// let stores = (0..5)
    ///     .map(|i| Arc::new(MemoryStore::new(format!("mem-{}", i))) as _)
    ///     .collect();
    /// let redlock = Redlock::new(stores, LockConfig::default())?;
    /// ```
    pub fn new(stores: Vec<Arc<dyn LockStore>>, config: LockConfig) -> Result<Self> {
        Self::with_rng(stores, config, StdRng::from_os_rng())
    }

    /// Create a lock manager whose backoff delays derive from `rng`.
    pub fn with_rng(
        stores: Vec<Arc<dyn LockStore>>,
        config: LockConfig,
        rng: StdRng,
    ) -> Result<Self> {
        if stores.is_empty() {
            return Err(LockError::NoStores);
        }
        config.validate()?;

        let stores: Arc<[StoreHandle]> = StoreHandle::enumerate(stores).into();
        Ok(Self {
            acquirer: QuorumAcquirer::new(stores.clone(), config.clone()),
            releaser: ReleaseCoordinator::new(stores.clone(), config.store_timeout),
            stores,
            config,
            rng: Mutex::new(rng),
        })
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn store_count(&self) -> usize {
        self.stores.len()
    }

    pub fn quorum(&self) -> usize {
        self.acquirer.quorum()
    }

    /// Acquire `key` for `ttl`, retrying with jittered backoff up to
    /// `max_attempts` times.
    pub async fn acquire(&self, key: impl Into<String>, ttl: Duration) -> Result<LockHandle> {
        self.acquire_until(key, ttl, future::pending()).await
    }

    /// Like [`Redlock::acquire`], but gives up with [`LockError::Cancelled`]
    /// once `cancel` completes.
    ///
    /// `cancel` is only raced against the backoff sleeps. An attempt that
    /// has started runs to the end, rollback included, so cancelling never
    /// leaves entries behind on the stores. If that attempt wins, the handle
    /// is returned and releasing it is up to the caller.
    pub async fn acquire_until(
        &self,
        key: impl Into<String>,
        ttl: Duration,
        cancel: impl Future<Output = ()>,
    ) -> Result<LockHandle> {
        let key = key.into();
        self.check_ttl(ttl)?;
        let mut cancel = pin!(cancel);

        let mut scheduler = self.scheduler(self.config.max_attempts);
        loop {
            let attempt = scheduler.begin_attempt()?;
            let descriptor = LockDescriptor::new(key.clone(), ttl);
            debug!(key = %key, attempt, "Attempting to acquire lock");

            let outcome = self.acquirer.acquire_once(&descriptor).await;
            let failure = match &outcome.verdict {
                Verdict::Acquired { validity } => {
                    scheduler.on_acquired()?;
                    info!(
                        key = %key,
                        attempt,
                        stores = outcome.accepted.len(),
                        validity_ms = validity.as_millis() as u64,
                        "Acquired lock"
                    );
                    return Ok(LockHandle::new(
                        descriptor,
                        &outcome,
                        *validity,
                        self.releaser.clone(),
                        scheduler,
                    ));
                }
                Verdict::Failed(failure) => failure.clone(),
            };

            self.roll_back(&descriptor, &outcome).await;

            match scheduler.on_attempt_failed(failure.clone())? {
                RetryDecision::Retry { delay } => {
                    warn!(
                        key = %key,
                        attempt,
                        cause = %failure,
                        rejected = ?self.acquirer.names_of(&outcome.rejected),
                        unresponsive = ?self.acquirer.names_of(&outcome.unresponsive),
                        delay_ms = delay.as_millis() as u64,
                        "Lock attempt failed, backing off"
                    );
                    let sleep = pin!(tokio::time::sleep(delay));
                    if let Either::Right(_) = future::select(sleep, cancel.as_mut()).await {
                        info!(key = %key, attempt, "Lock acquisition cancelled");
                        return Err(LockError::Cancelled {
                            key,
                            attempts: attempt,
                        });
                    }
                }
                RetryDecision::GiveUp {
                    attempts,
                    last_failure,
                } => {
                    warn!(key = %key, attempts, cause = %last_failure, "Giving up on lock");
                    return Err(LockError::AttemptsExhausted {
                        key,
                        attempts,
                        last_failure,
                    });
                }
            }
        }
    }

    /// Make exactly one attempt. Partial writes are rolled back on failure.
    pub async fn try_acquire(
        &self,
        key: impl Into<String>,
        ttl: Duration,
    ) -> Result<Option<LockHandle>> {
        let key = key.into();
        self.check_ttl(ttl)?;

        let mut scheduler = self.scheduler(1);
        scheduler.begin_attempt()?;
        let descriptor = LockDescriptor::new(key, ttl);
        let outcome = self.acquirer.acquire_once(&descriptor).await;

        match &outcome.verdict {
            Verdict::Acquired { validity } => {
                scheduler.on_acquired()?;
                info!(key = descriptor.key(), "Acquired lock");
                let validity = *validity;
                Ok(Some(LockHandle::new(
                    descriptor,
                    &outcome,
                    validity,
                    self.releaser.clone(),
                    scheduler,
                )))
            }
            Verdict::Failed(failure) => {
                debug!(key = descriptor.key(), cause = %failure, "Failed to acquire lock");
                self.roll_back(&descriptor, &outcome).await;
                Ok(None)
            }
        }
    }

    /// Release a held lock. Never fails; unreachable stores keep their
    /// entry until the TTL lapses.
    pub async fn release(&self, handle: LockHandle) -> ReleaseReport {
        handle.release().await
    }

    /// Reset the lock's TTL on the stores, keeping the same token.
    ///
    /// On failure the handle is left unchanged and the caller should treat
    /// the lock as lost once its current validity runs out.
    pub async fn extend(&self, handle: &mut LockHandle, ttl: Duration) -> Result<()> {
        self.check_ttl(ttl)?;

        let descriptor = handle.descriptor.with_ttl(ttl);
        let outcome = self.acquirer.extend_once(&descriptor).await;

        match outcome.verdict {
            Verdict::Acquired { validity } => {
                let renewed_at = outcome.started_at + outcome.elapsed;
                handle.descriptor = descriptor;
                handle.acquired_stores = outcome.accepted;
                handle.valid_until = renewed_at + validity;
                debug!(key = handle.key(), validity_ms = validity.as_millis() as u64, "Extended lock");
                Ok(())
            }
            Verdict::Failed(reason) => {
                warn!(key = handle.key(), cause = %reason, "Failed to extend lock");
                Err(LockError::ExtendFailed {
                    key: handle.key().to_string(),
                    reason,
                })
            }
        }
    }

    async fn roll_back(&self, descriptor: &LockDescriptor, outcome: &AcquisitionOutcome) {
        let targets = outcome.cleanup_targets();
        if targets.is_empty() {
            return;
        }

        let report = self.releaser.release(descriptor, &targets).await;
        if !report.not_cleared.is_empty() {
            debug!(
                key = descriptor.key(),
                not_cleared = ?self.acquirer.names_of(&report.not_cleared),
                "Partial acquisition not fully rolled back; entries will expire"
            );
        }
    }

    fn check_ttl(&self, ttl: Duration) -> Result<()> {
        let drift = self.config.drift_margin(ttl);
        if ttl <= drift {
            return Err(LockError::InvalidTtl { ttl, drift });
        }
        Ok(())
    }

    fn scheduler(&self, max_attempts: u32) -> RetryScheduler {
        let rng = StdRng::from_rng(&mut *self.rng.lock());
        RetryScheduler::new(max_attempts, self.config.backoff.clone()).with_rng(rng)
    }
}

/// Builder for a [`Redlock`].
pub struct LockBuilder {
    stores: Vec<Arc<dyn LockStore>>,
    config: LockConfig,
    seed: Option<u64>,
}

impl LockBuilder {
    /// Create new lock builder
    pub fn new() -> Self {
        Self {
            stores: Vec::new(),
            config: LockConfig::default(),
            seed: None,
        }
    }

    /// Add a store.
    pub fn store(mut self, store: Arc<dyn LockStore>) -> Self {
        self.stores.push(store);
        self
    }

    /// Add several stores.
    pub fn stores(mut self, stores: impl IntoIterator<Item = Arc<dyn LockStore>>) -> Self {
        self.stores.extend(stores);
        self
    }

    pub fn config(mut self, config: LockConfig) -> Self {
        self.config = config;
        self
    }

    /// Seed the backoff random source.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Build the lock manager
    pub fn build(self) -> Result<Redlock> {
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Redlock::with_rng(self.stores, self.config, rng)
    }
}

impl Default for LockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::store::{Fault, MemoryStore};

    const TTL: Duration = Duration::from_secs(10);

    fn cluster(n: usize, config: LockConfig) -> (Vec<Arc<MemoryStore>>, Redlock) {
        let stores: Vec<Arc<MemoryStore>> = (0..n)
            .map(|i| Arc::new(MemoryStore::new(format!("mem-{}", i))))
            .collect();
        let redlock = LockBuilder::new()
            .stores(stores.iter().map(|s| s.clone() as Arc<dyn LockStore>))
            .config(config)
            .seed(1)
            .build()
            .unwrap();
        (stores, redlock)
    }

    fn fast_config(max_attempts: u32) -> LockConfig {
        LockConfig::builder()
            .max_attempts(max_attempts)
            .backoff(BackoffConfig::new(
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(5),
            ))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_rejects_empty_store_set() {
        assert!(matches!(LockBuilder::new().build(), Err(LockError::NoStores)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_and_release() {
        let (stores, redlock) = cluster(5, fast_config(3));

        let handle = redlock.acquire("orders", TTL).await.unwrap();
        assert_eq!(handle.acquired_stores().len(), 5);
        assert!(handle.is_valid());
        for store in &stores {
            assert_eq!(store.value("orders").as_deref(), Some(handle.token().as_str()));
        }

        let report = redlock.release(handle).await;
        assert_eq!(report.cleared.len(), 5);
        for store in &stores {
            assert_eq!(store.value("orders"), None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_contender_exhausts_attempts() {
        let (stores, redlock) = cluster(3, fast_config(4));
        let held = redlock.acquire("orders", TTL).await.unwrap();

        let err = redlock.acquire("orders", TTL).await.unwrap_err();
        match err {
            LockError::AttemptsExhausted {
                key,
                attempts,
                last_failure,
            } => {
                assert_eq!(key, "orders");
                assert_eq!(attempts, 4);
                assert_eq!(
                    last_failure,
                    crate::acquire::AttemptFailure::QuorumMiss {
                        accepted: 0,
                        required: 2,
                    }
                );
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(stores[0].value("orders").as_deref(), Some(held.token().as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempt_rolls_back_partial_writes() {
        let (stores, redlock) = cluster(5, fast_config(1));
        // Held elsewhere on three stores, so we can reach at most two.
        for store in &stores[2..] {
            store.insert("orders", "other", TTL);
        }

        assert!(redlock.try_acquire("orders", TTL).await.unwrap().is_none());

        assert_eq!(stores[0].value("orders"), None);
        assert_eq!(stores[1].value("orders"), None);
        assert_eq!(stores[2].value("orders").as_deref(), Some("other"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_once_holder_expires() {
        let (stores, redlock) = cluster(3, fast_config(50));
        for store in &stores {
            store.insert("orders", "other", Duration::from_millis(100));
        }

        let handle = redlock.acquire("orders", TTL).await.unwrap();
        assert!(handle.is_valid());
        assert_eq!(stores[0].value("orders").as_deref(), Some(handle.token().as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_shorter_than_drift_rejected() {
        let (_, redlock) = cluster(3, fast_config(3));
        let err = redlock.acquire("orders", Duration::from_millis(1)).await.unwrap_err();
        assert!(matches!(err, LockError::InvalidTtl { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_pushes_validity() {
        let (stores, redlock) = cluster(3, fast_config(3));
        let mut handle = redlock.acquire("orders", TTL).await.unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(handle.remaining_validity() < Duration::from_secs(2));

        redlock.extend(&mut handle, TTL).await.unwrap();
        assert!(handle.remaining_validity() > Duration::from_secs(9));
        assert_eq!(stores[0].remaining_ttl("orders"), Some(TTL));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_after_loss_fails() {
        let (stores, redlock) = cluster(3, fast_config(3));
        let mut handle = redlock.acquire("orders", TTL).await.unwrap();
        let valid_until = handle.valid_until();

        tokio::time::advance(TTL).await;
        for store in &stores {
            store.insert("orders", "other", TTL);
        }

        let err = redlock.extend(&mut handle, TTL).await.unwrap_err();
        assert!(matches!(err, LockError::ExtendFailed { .. }));
        assert_eq!(handle.valid_until(), valid_until);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_in_background() {
        let (stores, redlock) = cluster(3, fast_config(3));
        let handle = redlock.acquire("orders", TTL).await.unwrap();
        drop(handle);

        // Let the spawned release run.
        tokio::time::sleep(Duration::from_millis(1)).await;
        for store in &stores {
            assert_eq!(store.value("orders"), None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_returns_scheduler_to_idle() {
        let (stores, redlock) = cluster(3, fast_config(5));
        for store in &stores {
            store.insert("orders", "other", Duration::from_millis(5));
        }

        // Backoff is at least 10ms, so the second attempt finds the stores free.
        let mut handle = redlock.acquire("orders", TTL).await.unwrap();
        assert_eq!(handle.state(), LockState::Holding);
        assert_eq!(handle.attempts(), 2);

        handle.release_entries().await;
        assert_eq!(handle.state(), LockState::Idle);
        assert_eq!(handle.attempts(), 0);
        assert!(stores.iter().all(|s| s.value("orders").is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_handle_is_holding() {
        let (_, redlock) = cluster(3, fast_config(5));
        let handle = redlock.try_acquire("orders", TTL).await.unwrap().unwrap();
        assert_eq!(handle.state(), LockState::Holding);
        assert_eq!(handle.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_leaves_stores_clean() {
        let (stores, redlock) = cluster(5, fast_config(100));
        for store in &stores[..3] {
            store.insert("orders", "other", TTL);
        }

        let err = redlock
            .acquire_until("orders", TTL, tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap_err();

        match err {
            LockError::Cancelled { key, attempts } => {
                assert_eq!(key, "orders");
                assert!(attempts >= 2);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(stores[3].value("orders"), None);
        assert_eq!(stores[4].value("orders"), None);
        assert_eq!(stores[0].value("orders").as_deref(), Some("other"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_until_returns_handle_when_uncontended() {
        let (_, redlock) = cluster(3, fast_config(3));
        let handle = redlock
            .acquire_until("orders", TTL, std::future::pending())
            .await
            .unwrap();
        assert_eq!(handle.acquired_stores().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_survives_minority_outage() {
        let (stores, redlock) = cluster(5, fast_config(1));
        stores[0].set_fault(Fault::Unavailable);
        stores[1].set_fault(Fault::Hang);

        let handle = redlock.acquire("orders", TTL).await.unwrap();
        assert_eq!(handle.acquired_stores().len(), 3);
        assert!(!handle.acquired_stores().contains(&StoreId(0)));
    }
}
