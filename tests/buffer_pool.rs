//! Integration tests for buffer pools and the pool registry.

use campipe::Timeout;
use campipe::buffer::PoolId;
use campipe::memory::{AllocatorRegistry, BufferManager, BufferSource, PoolConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// idle + busy stays equal to the configured count under contention.
#[test]
fn test_pool_count_invariant_under_contention() {
    let registry = AllocatorRegistry::with_defaults().unwrap();
    let manager = BufferManager::new();
    let pool = manager.create_pool();
    pool.init(PoolConfig::new(32, 32, 6), &registry).unwrap();

    let running = Arc::new(AtomicBool::new(true));
    let checker = {
        let pool = Arc::clone(&pool);
        let running = Arc::clone(&running);
        thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                assert_eq!(pool.count(), 6);
                thread::yield_now();
            }
        })
    };

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                for _ in 0..500 {
                    let buffer = pool
                        .acquire_buffer(Timeout::After(Duration::from_secs(1)))
                        .expect("buffer within a second");
                    assert_eq!(buffer.pool_id(), pool.id());
                    pool.return_buffer(buffer).unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    running.store(false, Ordering::Relaxed);
    checker.join().unwrap();

    assert_eq!(pool.idle_count(), 6);
    assert_eq!(pool.busy_count(), 0);
    let stats = pool.stats();
    assert!(stats.acquisitions >= 2000);
}

/// A stopped pool wakes every blocked acquirer.
#[test]
fn test_stop_wakes_waiters() {
    let registry = AllocatorRegistry::with_defaults().unwrap();
    let manager = BufferManager::new();
    let pool = manager.create_pool();
    pool.init(PoolConfig::new(16, 16, 1), &registry).unwrap();
    let held = pool.acquire_buffer(Timeout::Immediate).unwrap();

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire_buffer(Timeout::Forever))
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    pool.notify_stop();
    for waiter in waiters {
        assert!(waiter.join().unwrap().is_none());
    }

    pool.notify_start();
    pool.return_buffer(held).unwrap();
    assert!(pool.acquire_buffer(Timeout::Immediate).is_some());
}

/// Concurrent lookups of one id see one pool while it is held.
#[test]
fn test_manager_identity_across_threads() {
    let manager = Arc::new(BufferManager::new());
    let id = PoolId(42);
    let holder = manager.get_or_create(id);

    let seen: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.get_or_create(id))
        })
        .map(|h| h.join().unwrap())
        .collect();

    assert!(seen.iter().all(|p| Arc::ptr_eq(p, &holder)));
    assert_eq!(holder.generation(), 0);

    drop(seen);
    drop(holder);
    assert!(manager.lookup(id).is_none());

    let fresh = manager.get_or_create(id);
    assert_eq!(fresh.generation(), 1);

    // Generated ids never collide with the caller-chosen one.
    let generated = manager.create_pool();
    assert!(generated.id().0 > id.0);
}

/// memfd pools hand out buffers with a file descriptor.
#[test]
fn test_memfd_pool_buffers_have_fds() {
    let registry = AllocatorRegistry::with_defaults().unwrap();
    let manager = BufferManager::new();
    let pool = manager.create_pool();
    pool.init(
        PoolConfig::new(64, 48, 2).source(BufferSource::Memfd),
        &registry,
    )
    .unwrap();

    let a = pool.acquire_buffer(Timeout::Immediate).unwrap();
    let b = pool.acquire_buffer(Timeout::Immediate).unwrap();
    assert!(a.fd().is_some());
    assert!(b.fd().is_some());
    assert_ne!(a.index(), b.index());
    assert!(pool.acquire_buffer(Timeout::Immediate).is_none());

    pool.return_buffer(a).unwrap();
    pool.return_buffer(b).unwrap();
    pool.clear_buffers().unwrap();
    assert_eq!(pool.count(), 0);
}
