//! Redis-backed lock store.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use quorum_lock_core::LockStore;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::{RedisClusterConfig, RedisStoreConfig, RedisStoreError, Result};

/// Delete the key only if it still holds our token.
static CLEAR_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
        if redis.call("GET", KEYS[1]) == ARGV[1] then
            return redis.call("DEL", KEYS[1])
        else
            return 0
        end
        "#,
    )
});

/// Reset the expiry only if the key still holds our token.
static EXTEND_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
        if redis.call("GET", KEYS[1]) == ARGV[1] then
            return redis.call("PEXPIRE", KEYS[1], ARGV[2])
        else
            return 0
        end
        "#,
    )
});

/// Connection slot filled by a dial running in its own task.
///
/// Lock calls are bounded by the acquirer's per-store timeout, which can be
/// shorter than a TLS or AUTH handshake. The dial is never cancelled with
/// them: it runs to `connection_timeout` and the result is kept for the
/// next call.
struct Dialer {
    name: String,
    client: redis::Client,
    connection_timeout: Duration,
    conn: Mutex<Option<ConnectionManager>>,
    last_error: Mutex<Option<String>>,
    dialing: AtomicBool,
    dialed: Notify,
}

impl Dialer {
    fn current(&self) -> Option<ConnectionManager> {
        self.conn.lock().clone()
    }

    /// Spawn a dial unless one is in flight or no runtime is running.
    fn start(self: &Arc<Self>) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        if self.dialing.swap(true, Ordering::AcqRel) {
            return true;
        }

        let dialer = self.clone();
        runtime.spawn(async move {
            let result = tokio::time::timeout(
                dialer.connection_timeout,
                ConnectionManager::new(dialer.client.clone()),
            )
            .await;

            match result {
                Ok(Ok(conn)) => {
                    info!(store = %dialer.name, "connected to redis");
                    *dialer.conn.lock() = Some(conn);
                    *dialer.last_error.lock() = None;
                }
                Ok(Err(e)) => {
                    warn!(store = %dialer.name, error = %e, "failed to connect to redis");
                    *dialer.last_error.lock() = Some(e.to_string());
                }
                Err(_) => {
                    warn!(
                        store = %dialer.name,
                        timeout_ms = dialer.connection_timeout.as_millis() as u64,
                        "redis connect timed out"
                    );
                    *dialer.last_error.lock() = Some(format!(
                        "connect timed out after {:?}",
                        dialer.connection_timeout
                    ));
                }
            }

            dialer.dialing.store(false, Ordering::Release);
            dialer.dialed.notify_waiters();
        });
        true
    }

    async fn connection(self: &Arc<Self>) -> Result<ConnectionManager> {
        if let Some(conn) = self.current() {
            return Ok(conn);
        }

        // Register before dialing so the wakeup cannot be missed.
        let dialed = self.dialed.notified();
        if let Some(conn) = self.current() {
            return Ok(conn);
        }
        if !self.start() {
            return Err(RedisStoreError::Connection(
                "no tokio runtime to dial from".to_string(),
            ));
        }
        dialed.await;

        self.current().ok_or_else(|| {
            let message = self
                .last_error
                .lock()
                .clone()
                .unwrap_or_else(|| "connection not established".to_string());
            RedisStoreError::Connection(message)
        })
    }
}

/// One independent Redis instance.
///
/// The connection is dialed in the background on first use (or by
/// [`connect_all`]) and re-established by the [`ConnectionManager`] after
/// drops. Any Redis or connection error is logged and reported to the lock
/// layer as "did not hold".
pub struct RedisStore {
    config: RedisStoreConfig,
    dialer: Arc<Dialer>,
}

impl RedisStore {
    /// Create a store without connecting.
    pub fn new(config: RedisStoreConfig) -> Result<Self> {
        config.validate()?;
        let client = redis::Client::open(config.connection_url())
            .map_err(|e| RedisStoreError::Config(e.to_string()))?;

        let dialer = Dialer {
            name: config.display_name(),
            client,
            connection_timeout: config.connection_timeout,
            conn: Mutex::new(None),
            last_error: Mutex::new(None),
            dialing: AtomicBool::new(false),
            dialed: Notify::new(),
        };
        Ok(Self {
            config,
            dialer: Arc::new(dialer),
        })
    }

    /// Create a store and open its connection.
    pub async fn connect(config: RedisStoreConfig) -> Result<Self> {
        let store = Self::new(config)?;
        store.connection().await?;
        Ok(store)
    }

    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    /// Whether a connection has been established.
    pub fn is_connected(&self) -> bool {
        self.dialer.current().is_some()
    }

    /// Start dialing in the background if not connected yet. Does nothing
    /// outside a tokio runtime.
    pub fn start_connecting(&self) {
        if !self.is_connected() {
            self.dialer.start();
        }
    }

    /// Check if the instance answers PING.
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| RedisStoreError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        self.dialer.connection().await
    }

    async fn set_nx(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn clear_if_owner(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let deleted: i64 = CLEAR_SCRIPT
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn extend_if_owner(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let extended: i64 = EXTEND_SCRIPT
            .key(key)
            .arg(token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    fn report(&self, op: &'static str, key: &str, result: Result<bool>) -> bool {
        match result {
            Ok(done) => {
                debug!(store = %self.dialer.name, op, key, done, "redis lock op");
                done
            }
            Err(e) => {
                warn!(
                    store = %self.dialer.name,
                    op,
                    key,
                    error = %e,
                    retryable = e.is_retryable(),
                    "redis lock op failed"
                );
                false
            }
        }
    }
}

#[async_trait]
impl LockStore for RedisStore {
    fn name(&self) -> &str {
        &self.dialer.name
    }

    async fn try_set(&self, key: &str, token: &str, ttl: Duration) -> bool {
        let result = self.set_nx(key, token, ttl).await;
        self.report("set", key, result)
    }

    async fn try_clear(&self, key: &str, token: &str) -> bool {
        let result = self.clear_if_owner(key, token).await;
        self.report("clear", key, result)
    }

    async fn try_extend(&self, key: &str, token: &str, ttl: Duration) -> bool {
        let result = self.extend_if_owner(key, token, ttl).await;
        self.report("extend", key, result)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("name", &self.dialer.name)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

// PX rejects zero.
fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Build one store per endpoint.
///
/// Inside a tokio runtime each store starts dialing in the background right
/// away. Nothing is awaited, so unreachable instances surface later as
/// unresponsive stores rather than as a startup failure.
pub fn connect_all(config: &RedisClusterConfig) -> Result<Vec<Arc<dyn LockStore>>> {
    config.validate()?;
    config
        .store_configs()
        .into_iter()
        .map(|store_config| {
            let store = RedisStore::new(store_config)?;
            store.start_connecting();
            Ok(Arc::new(store) as Arc<dyn LockStore>)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(10)), 10_000);
    }

    #[test]
    fn test_new_rejects_invalid_url() {
        assert!(RedisStore::new(RedisStoreConfig::new("http://localhost")).is_err());
    }

    #[test]
    fn test_connect_all_builds_one_store_per_endpoint() {
        let config = RedisClusterConfig::new(["redis://10.1.0.1:6379", "redis://10.1.0.2:6379"]);
        let stores = connect_all(&config).unwrap();
        let names: Vec<_> = stores.iter().map(|s| s.name().to_string()).collect();
        assert_eq!(names, vec!["10.1.0.1:6379", "10.1.0.2:6379"]);
    }

    #[tokio::test]
    async fn test_unreachable_instance_reports_false() {
        // Port 1 on loopback refuses connections.
        let config = RedisStoreConfig::builder()
            .url("redis://127.0.0.1:1")
            .connection_timeout(Duration::from_millis(200))
            .build();
        let store = RedisStore::new(config).unwrap();

        assert!(!store.try_set("k", "t", Duration::from_secs(1)).await);
        assert!(!store.try_clear("k", "t").await);
        assert!(!store.try_extend("k", "t", Duration::from_secs(1)).await);
        assert!(store.health_check().await.is_err());
        assert!(!store.is_connected());
    }

    #[test]
    fn test_no_dial_outside_runtime() {
        let store = RedisStore::new(RedisStoreConfig::new("redis://127.0.0.1:1")).unwrap();
        store.start_connecting();
        assert!(!store.dialer.dialing.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_dial_survives_caller_timeout() {
        // Accepts the connection but never answers, so the handshake hangs.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        let config = RedisStoreConfig::builder()
            .url(format!("redis://127.0.0.1:{}", port))
            .connection_timeout(Duration::from_secs(5))
            .build();
        let store = RedisStore::new(config).unwrap();

        let call = tokio::time::timeout(
            Duration::from_millis(20),
            store.try_set("k", "t", Duration::from_secs(1)),
        );
        assert!(call.await.is_err());
        // The dial outlives the cancelled call.
        assert!(store.dialer.dialing.load(Ordering::Acquire) || store.is_connected());

        server.abort();
    }

    fn live_store() -> RedisStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        RedisStore::new(RedisStoreConfig::new(url)).unwrap()
    }

    #[tokio::test]
    #[ignore = "requires Redis server"]
    async fn test_set_nx_and_owner_checks() {
        let store = live_store();
        let key = format!("quorum-lock-test:{}", std::process::id());
        let ttl = Duration::from_secs(5);

        assert!(store.try_set(&key, "a", ttl).await);
        assert!(!store.try_set(&key, "b", ttl).await);

        assert!(!store.try_clear(&key, "b").await);
        assert!(!store.try_extend(&key, "b", ttl).await);
        assert!(store.try_extend(&key, "a", ttl).await);

        assert!(store.try_clear(&key, "a").await);
        assert!(!store.try_clear(&key, "a").await);
        assert!(store.try_set(&key, "b", ttl).await);
        assert!(store.try_clear(&key, "b").await);
    }

    #[tokio::test]
    #[ignore = "requires Redis server"]
    async fn test_slot_expires() {
        let store = live_store();
        let key = format!("quorum-lock-expiry:{}", std::process::id());

        assert!(store.try_set(&key, "a", Duration::from_millis(100)).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.try_set(&key, "b", Duration::from_secs(1)).await);
        assert!(store.try_clear(&key, "b").await);
    }
}
