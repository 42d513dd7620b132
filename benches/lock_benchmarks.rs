//! Lock Benchmarks
//!
//! Benchmarks for quorum acquisition, release, and backoff sampling.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use quorum_lock::{BackoffConfig, LockBuilder, LockStore, MemoryStore, quorum};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

fn stores(n: usize) -> Vec<Arc<dyn LockStore>> {
    (0..n)
        .map(|i| Arc::new(MemoryStore::new(format!("mem-{}", i))) as Arc<dyn LockStore>)
        .collect()
}

// =============================================================================
// Acquire / Release Benchmarks
// =============================================================================

fn bench_acquire_release(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("acquire_release");

    for n in [1, 3, 5, 7] {
        let redlock = LockBuilder::new().stores(stores(n)).seed(1).build().unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.to_async(&rt).iter(|| async {
                let handle = redlock
                    .acquire("bench", Duration::from_secs(10))
                    .await
                    .unwrap();
                black_box(handle.release().await)
            })
        });
    }

    group.finish();
}

fn bench_contended_try_acquire(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let shared = stores(5);
    let holder = LockBuilder::new().stores(shared.clone()).build().unwrap();
    let contender = LockBuilder::new().stores(shared).build().unwrap();

    let _held = rt
        .block_on(holder.acquire("bench", Duration::from_secs(3600)))
        .unwrap();

    c.bench_function("try_acquire_contended", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(
                contender
                    .try_acquire("bench", Duration::from_secs(10))
                    .await
                    .unwrap(),
            )
        })
    });
}

// =============================================================================
// Backoff Benchmarks
// =============================================================================

fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff");
    let backoff = BackoffConfig::default();

    group.bench_function("sample", |b| {
        let mut rng = StdRng::seed_from_u64(42);
        b.iter(|| black_box(backoff.sample(&mut rng)))
    });

    group.bench_function("quorum", |b| b.iter(|| quorum(black_box(5))));

    group.finish();
}

criterion_group!(
    benches,
    bench_acquire_release,
    bench_contended_try_acquire,
    bench_backoff
);
criterion_main!(benches);
