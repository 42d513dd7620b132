//! Run command
//!
//! One contender: acquire, do some work, release, and go again.

use quorum_lock_core::{LockError, Redlock};
use quorum_lock_redis::connect_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::future::Future;
use std::pin::{Pin, pin};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::CliResult;

/// Rounds completed by a contender.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Rounds in which the lock was held and released.
    pub held: u64,
    /// Rounds in which `acquire` gave up.
    pub failed: u64,
}

impl RunSummary {
    pub fn rounds(&self) -> u64 {
        self.held + self.failed
    }
}

/// Connect to the configured Redis instances and contend until Ctrl-C or
/// until `rounds` rounds have finished.
pub async fn execute(instance: &str, config: &AppConfig, rounds: Option<u64>) -> CliResult<()> {
    config.validate()?;

    let stores = connect_all(&config.redis)?;
    let redlock = Redlock::new(stores, config.lock.clone())?;
    info!(
        instance,
        key = %config.key,
        stores = redlock.store_count(),
        quorum = redlock.quorum(),
        "Starting contender"
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    let summary = contend(
        &redlock,
        instance,
        config,
        rounds,
        StdRng::from_os_rng(),
        shutdown,
    )
    .await?;

    info!(
        instance,
        held = summary.held,
        failed = summary.failed,
        "Contender stopped"
    );
    Ok(())
}

/// How a round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundEnd {
    Held { interrupted: bool },
    Failed { interrupted: bool },
    /// Shutdown arrived while backing off inside `acquire_until`.
    Cancelled,
}

/// The contender loop.
///
/// `shutdown` only interrupts sleeps. A lock held when it fires is released
/// before this returns, so nothing is left for the runtime to finish.
pub async fn contend(
    redlock: &Redlock,
    instance: &str,
    config: &AppConfig,
    rounds: Option<u64>,
    mut rng: StdRng,
    shutdown: impl Future<Output = ()>,
) -> CliResult<RunSummary> {
    let mut summary = RunSummary::default();
    let mut shutdown = pin!(shutdown);

    while rounds.is_none_or(|limit| summary.rounds() < limit) {
        let interrupted = match round(redlock, instance, config, &mut rng, shutdown.as_mut()).await? {
            RoundEnd::Held { interrupted } => {
                summary.held += 1;
                interrupted
            }
            RoundEnd::Failed { interrupted } => {
                summary.failed += 1;
                interrupted
            }
            RoundEnd::Cancelled => true,
        };

        if interrupted {
            info!(instance, "Shutdown requested");
            break;
        }
    }

    Ok(summary)
}

async fn round<S>(
    redlock: &Redlock,
    instance: &str,
    config: &AppConfig,
    rng: &mut StdRng,
    mut shutdown: Pin<&mut S>,
) -> CliResult<RoundEnd>
where
    S: Future<Output = ()>,
{
    let acquired = redlock
        .acquire_until(config.key.as_str(), config.ttl, shutdown.as_mut())
        .await;

    let handle = match acquired {
        Ok(handle) => handle,
        Err(LockError::Cancelled { .. }) => return Ok(RoundEnd::Cancelled),
        Err(e) if e.is_retryable() => {
            let delay = config.lock.backoff.sample(rng);
            warn!(
                instance,
                error = %e,
                delay_ms = delay.as_millis() as u64,
                "Failed to acquire lock, retrying"
            );
            let interrupted = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = shutdown.as_mut() => true,
            };
            return Ok(RoundEnd::Failed { interrupted });
        }
        Err(e) => return Err(e.into()),
    };

    info!(
        instance,
        key = handle.key(),
        token = %handle.token(),
        validity_ms = handle.remaining_validity().as_millis() as u64,
        "Lock acquired"
    );

    let work = work_duration(config, rng);
    let interrupted = tokio::select! {
        _ = tokio::time::sleep(work) => false,
        _ = shutdown.as_mut() => true,
    };
    if interrupted {
        info!(instance, "Shutdown requested while holding the lock, releasing");
    } else if !handle.is_valid() {
        warn!(
            instance,
            work_ms = work.as_millis() as u64,
            "Lock validity ran out during work"
        );
    }

    let report = handle.release().await;
    info!(
        instance,
        cleared = report.cleared.len(),
        not_cleared = report.not_cleared.len(),
        "Lock released"
    );
    Ok(RoundEnd::Held { interrupted })
}

fn work_duration(config: &AppConfig, rng: &mut StdRng) -> Duration {
    let min = config.work_min.as_millis() as u64;
    let max = config.work_max.as_millis() as u64;
    Duration::from_millis(rng.random_range(min..=max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_lock_core::{BackoffConfig, LockConfig, LockStore, MemoryStore};
    use std::sync::Arc;

    fn cluster() -> Vec<Arc<MemoryStore>> {
        (0..5)
            .map(|i| Arc::new(MemoryStore::new(format!("mem-{}", i))))
            .collect()
    }

    fn redlock(stores: &[Arc<MemoryStore>], max_attempts: u32) -> Redlock {
        let config = LockConfig {
            max_attempts,
            backoff: BackoffConfig::new(
                Duration::from_millis(100),
                Duration::from_millis(500),
                Duration::from_millis(100),
            ),
            ..LockConfig::default()
        };
        let stores = stores
            .iter()
            .map(|s| s.clone() as Arc<dyn LockStore>)
            .collect();
        Redlock::new(stores, config).unwrap()
    }

    fn app_config() -> AppConfig {
        AppConfig {
            ttl: Duration::from_secs(10),
            work_min: Duration::from_millis(200),
            work_max: Duration::from_millis(800),
            ..AppConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_rounds_release_each_time() {
        let stores = cluster();
        let redlock = redlock(&stores, 3);
        let config = app_config();

        let summary = contend(
            &redlock,
            "a",
            &config,
            Some(3),
            StdRng::seed_from_u64(1),
            std::future::pending(),
        )
        .await
        .unwrap();

        assert_eq!(summary, RunSummary { held: 3, failed: 0 });
        assert!(stores.iter().all(|s| s.value(&config.key).is_none()));
        assert!(stores.iter().all(|s| s.clear_calls() == 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_contenders_both_make_progress() {
        let stores = cluster();
        let a = redlock(&stores, 50);
        let b = redlock(&stores, 50);
        let config = app_config();

        let (first, second) = tokio::join!(
            contend(&a, "a", &config, Some(4), StdRng::seed_from_u64(1), std::future::pending()),
            contend(&b, "b", &config, Some(4), StdRng::seed_from_u64(2), std::future::pending()),
        );

        assert_eq!(first.unwrap().held, 4);
        assert_eq!(second.unwrap().held, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_round_counts_and_continues() {
        let stores = cluster();
        for store in &stores[..3] {
            store.set_fault(quorum_lock_core::Fault::Unavailable);
        }
        let redlock = redlock(&stores, 1);

        let summary = contend(
            &redlock,
            "a",
            &app_config(),
            Some(2),
            StdRng::seed_from_u64(1),
            std::future::pending(),
        )
        .await
        .unwrap();

        assert_eq!(summary, RunSummary { held: 0, failed: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_the_loop() {
        let stores = cluster();
        let redlock = redlock(&stores, 3);

        let summary = contend(
            &redlock,
            "a",
            &app_config(),
            None,
            StdRng::seed_from_u64(1),
            tokio::time::sleep(Duration::from_secs(5)),
        )
        .await
        .unwrap();

        assert!(summary.held >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_holding_releases_before_returning() {
        let stores = cluster();
        let redlock = redlock(&stores, 3);
        let config = app_config();

        // Work takes at least 200ms, so the lock is held when shutdown fires.
        let summary = contend(
            &redlock,
            "a",
            &config,
            None,
            StdRng::seed_from_u64(1),
            tokio::time::sleep(Duration::from_millis(100)),
        )
        .await
        .unwrap();

        assert_eq!(summary, RunSummary { held: 1, failed: 0 });
        assert!(stores.iter().all(|s| s.value(&config.key).is_none()));
        assert!(stores.iter().all(|s| s.clear_calls() == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_contending_leaves_other_holder_alone() {
        let stores = cluster();
        for store in &stores {
            store.insert("my_lock_key", "other", Duration::from_secs(60));
        }
        let redlock = redlock(&stores, 100);

        let summary = contend(
            &redlock,
            "a",
            &app_config(),
            None,
            StdRng::seed_from_u64(1),
            tokio::time::sleep(Duration::from_secs(2)),
        )
        .await
        .unwrap();

        assert_eq!(summary, RunSummary::default());
        assert!(
            stores
                .iter()
                .all(|s| s.value("my_lock_key").as_deref() == Some("other"))
        );
    }

    #[test]
    fn test_lock_released_even_when_runtime_drops_right_after() {
        let stores: Vec<_> = (0..5)
            .map(|i| {
                Arc::new(MemoryStore::with_fault(
                    format!("mem-{}", i),
                    quorum_lock_core::Fault::Latency {
                        min: Duration::from_millis(2),
                        max: Duration::from_millis(2),
                    },
                ))
            })
            .collect();
        let config = app_config();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();

        let summary = runtime
            .block_on(async {
                let redlock = redlock(&stores, 3);
                contend(
                    &redlock,
                    "a",
                    &config,
                    None,
                    StdRng::seed_from_u64(1),
                    tokio::time::sleep(Duration::from_millis(100)),
                )
                .await
            })
            .unwrap();
        drop(runtime);

        assert_eq!(summary, RunSummary { held: 1, failed: 0 });
        assert!(stores.iter().all(|s| s.value(&config.key).is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_ttl_is_fatal() {
        let stores = cluster();
        let redlock = redlock(&stores, 3);
        let config = AppConfig {
            ttl: Duration::from_millis(1),
            ..app_config()
        };

        let result = contend(
            &redlock,
            "a",
            &config,
            None,
            StdRng::seed_from_u64(1),
            std::future::pending(),
        )
        .await;

        assert!(result.is_err());
    }
}
