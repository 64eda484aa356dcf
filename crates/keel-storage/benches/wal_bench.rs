//! Benchmarks for Write-Ahead Log operations.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use keel_storage::{Position, WalConfig, WalStore};
use std::hint::black_box;
use tempfile::TempDir;

/// Benchmark WAL append operations (target: < 1μs).
fn bench_wal_append(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();

    c.bench_function("wal_append", |b| {
        let mut store = WalStore::open(WalConfig::new(temp_dir.path())).unwrap();

        b.iter(|| store.append(black_box(b"test_record_with_some_data")).unwrap());
    });

    // Also benchmark with varied record sizes
    let mut group = c.benchmark_group("wal_append_sizes");

    for size in [16, 64, 256, 1024, 4096] {
        group.bench_function(format!("{}B", size), |b| {
            let dir = TempDir::new().unwrap();
            let mut store = WalStore::open(WalConfig::new(dir.path())).unwrap();
            let record = vec![0u8; size];

            b.iter(|| store.append(black_box(&record)).unwrap());
        });
    }

    group.finish();
}

/// Benchmark WAL sync operations (target: < 10ms).
fn bench_wal_sync(c: &mut Criterion) {
    c.bench_function("wal_sync", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let mut store = WalStore::open(WalConfig::new(dir.path())).unwrap();
                // Write some data to make sync meaningful
                for _ in 0..100 {
                    store.append(&vec![0u8; 128]).unwrap();
                }
                (store, dir)
            },
            |(mut store, _dir)| {
                store.sync().unwrap();
                black_box(());
            },
            BatchSize::SmallInput,
        );
    });
}

/// Benchmark WAL replay for recovery scenarios.
fn bench_wal_replay(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let config = WalConfig::new(temp_dir.path());

    // Pre-populate the log
    let mut store = WalStore::open(config.clone()).unwrap();
    for _ in 0..1000 {
        store.append(&vec![0u8; 128]).unwrap();
    }
    store.sync().unwrap();

    c.bench_function("wal_replay_1k_records", |b| {
        b.iter(|| {
            let reader = store.open_for_replay(Position::ZERO).unwrap();
            let count = reader.count();
            assert_eq!(count, 1000);
        });
    });
}

criterion_group!(benches, bench_wal_append, bench_wal_sync, bench_wal_replay);
criterion_main!(benches);
