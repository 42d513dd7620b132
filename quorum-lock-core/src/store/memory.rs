//! In-process store with TTL expiry and fault injection.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::LockStore;

/// Simulated failure mode of a [`MemoryStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fault {
    /// Behave normally.
    #[default]
    None,
    /// Fail every call immediately, as a refused connection would.
    Unavailable,
    /// Never answer.
    Hang,
    /// Answer after a random delay in `[min, max]`. Writes apply when the
    /// delay has elapsed.
    Latency { min: Duration, max: Duration },
}

#[derive(Debug)]
struct Entry {
    token: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Key/value store held in memory.
///
/// Expiry is measured on the tokio clock, so tests running with a paused
/// runtime see TTLs lapse as virtual time advances.
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    entries: Mutex<HashMap<String, Entry>>,
    fault: Mutex<Fault>,
    set_calls: AtomicUsize,
    clear_calls: AtomicUsize,
    extend_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
            fault: Mutex::new(Fault::None),
            set_calls: AtomicUsize::new(0),
            clear_calls: AtomicUsize::new(0),
            extend_calls: AtomicUsize::new(0),
        }
    }

    /// Create a store that starts with the given fault.
    pub fn with_fault(name: impl Into<String>, fault: Fault) -> Self {
        let store = Self::new(name);
        store.set_fault(fault);
        store
    }

    pub fn set_fault(&self, fault: Fault) {
        *self.fault.lock() = fault;
    }

    pub fn fault(&self) -> Fault {
        *self.fault.lock()
    }

    /// Current live value of `key`, if any.
    pub fn value(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.token.clone())
    }

    /// Remaining time before `key` expires.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.expires_at - now)
    }

    /// Write an entry directly, bypassing faults. Simulates another holder.
    pub fn insert(&self, key: impl Into<String>, token: impl Into<String>, ttl: Duration) {
        self.entries.lock().insert(
            key.into(),
            Entry {
                token: token.into(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn clear_calls(&self) -> usize {
        self.clear_calls.load(Ordering::SeqCst)
    }

    pub fn extend_calls(&self) -> usize {
        self.extend_calls.load(Ordering::SeqCst)
    }

    /// Apply the configured fault. Returns `false` when the call must fail.
    async fn reach(&self) -> bool {
        let fault = self.fault();
        match fault {
            Fault::None => true,
            Fault::Unavailable => false,
            Fault::Hang => std::future::pending().await,
            Fault::Latency { min, max } => {
                let spread = max.saturating_sub(min);
                let extra = if spread.is_zero() {
                    Duration::ZERO
                } else {
                    let micros = u64::try_from(spread.as_micros()).unwrap_or(u64::MAX);
                    Duration::from_micros(rand::rng().random_range(0..=micros))
                };
                tokio::time::sleep(min + extra).await;
                true
            }
        }
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_set(&self, key: &str, token: &str, ttl: Duration) -> bool {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        if !self.reach().await {
            trace!(store = %self.name, key, "simulated SET failure");
            return false;
        }

        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return false;
        }

        entries.insert(
            key.to_string(),
            Entry {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        true
    }

    async fn try_clear(&self, key: &str, token: &str) -> bool {
        self.clear_calls.fetch_add(1, Ordering::SeqCst);
        if !self.reach().await {
            trace!(store = %self.name, key, "simulated clear failure");
            return false;
        }

        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) && entry.token == token => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    async fn try_extend(&self, key: &str, token: &str, ttl: Duration) -> bool {
        self.extend_calls.fetch_add(1, Ordering::SeqCst);
        if !self.reach().await {
            trace!(store = %self.name, key, "simulated extend failure");
            return false;
        }

        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) && entry.token == token => {
                entry.expires_at = now + ttl;
                true
            }
            _ => false,
        }
    }
}
