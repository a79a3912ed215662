//! Buffer pool benchmarks.

use campipe::Timeout;
use campipe::memory::{AllocatorRegistry, BufferManager, BufferSource, PoolConfig};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::sync::Arc;

fn bench_acquire_return(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_acquire_return");
    let registry = AllocatorRegistry::with_defaults().unwrap();
    let manager = BufferManager::new();

    for count in [4, 16, 64] {
        let pool = manager.create_pool();
        pool.init(PoolConfig::new(320, 240, count), &registry).unwrap();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(count), &pool, |b, pool| {
            b.iter(|| {
                let buffer = pool
                    .acquire_buffer(Timeout::Immediate)
                    .expect("pool not exhausted");
                pool.return_buffer(buffer).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_memfd_acquire_return(c: &mut Criterion) {
    let registry = AllocatorRegistry::with_defaults().unwrap();
    let manager = BufferManager::new();
    let pool = manager.create_pool();
    pool.init(
        PoolConfig::new(1920, 1080, 8).source(BufferSource::Memfd),
        &registry,
    )
    .unwrap();

    c.bench_function("memfd_acquire_return", |b| {
        b.iter(|| {
            let buffer = pool.acquire_buffer(Timeout::Immediate).unwrap();
            std::hint::black_box(buffer.fd());
            pool.return_buffer(buffer).unwrap();
        });
    });
}

fn bench_pool_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_contended");
    let registry = AllocatorRegistry::with_defaults().unwrap();
    let manager = BufferManager::new();
    let pool = manager.create_pool();
    pool.init(PoolConfig::new(320, 240, 4), &registry).unwrap();

    group.throughput(Throughput::Elements(400));
    group.bench_function("4_threads_100_ops_each", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let pool = Arc::clone(&pool);
                    std::thread::spawn(move || {
                        for _ in 0..100 {
                            if let Some(buffer) = pool.acquire_buffer(Timeout::Forever) {
                                std::hint::black_box(buffer.index());
                                pool.return_buffer(buffer).unwrap();
                            }
                        }
                    })
                })
                .collect();

            for h in handles {
                h.join().unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_acquire_return,
    bench_memfd_acquire_return,
    bench_pool_contended
);
criterion_main!(benches);
