//! Per-stream rotating buffer pool.
//!
//! A [`BufferPool`] owns a fixed set of [`Buffer`]s for one stream and
//! rotates them between an idle list and a busy set:
//!
//! - `acquire_buffer` moves a buffer idle → busy and hands it to the caller
//! - `return_buffer` moves it busy → idle and wakes one waiter
//!
//! Every buffer the pool produced is at all times either idle or busy
//! (busy meaning held by whoever acquired it), so
//! `idle_count() + busy_count() == count()` always holds.
//!
//! # Example
//!
//! ```rust
//! use campipe::memory::{AllocatorRegistry, BufferPool, PoolConfig};
//! use campipe::buffer::PoolId;
//! use campipe::Timeout;
//!
//! let registry = AllocatorRegistry::with_defaults().unwrap();
//! let pool = BufferPool::new(PoolId(1));
//! pool.init(PoolConfig::new(64, 48, 4), &registry).unwrap();
//!
//! let buffer = pool.acquire_buffer(Timeout::Immediate).unwrap();
//! assert_eq!(pool.busy_count(), 1);
//! pool.return_buffer(buffer).unwrap();
//! assert_eq!(pool.idle_count(), 4);
//! ```

use super::{AllocatorRegistry, BufferAllocator, BufferSource};
use crate::buffer::{Buffer, BufferLayout, BufferUsage, PixelFormat, PoolId};
use crate::error::{Error, Result};
use crate::observability;
use crate::sync::{Timeout, lock, wait, wait_until};
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Geometry and sizing of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Usage flags requested from the allocator.
    pub usage: BufferUsage,
    /// Pixel format.
    pub format: PixelFormat,
    /// Number of buffers to preallocate (expected count for external pools).
    pub count: usize,
    /// Allocation backend tag.
    pub source: BufferSource,
}

impl PoolConfig {
    /// NV12 heap pool with the given geometry.
    pub fn new(width: u32, height: u32, count: usize) -> Self {
        Self {
            width,
            height,
            usage: BufferUsage::CPU_READ | BufferUsage::CAMERA_WRITE,
            format: PixelFormat::Nv12,
            count,
            source: BufferSource::Heap,
        }
    }

    /// Set the pixel format.
    pub fn format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the usage flags.
    pub fn usage(mut self, usage: BufferUsage) -> Self {
        self.usage = usage;
        self
    }

    /// Set the source tag.
    pub fn source(mut self, source: BufferSource) -> Self {
        self.source = source;
        self
    }

    /// Memory layout of each buffer.
    pub fn layout(&self) -> BufferLayout {
        BufferLayout::new(self.width, self.height, self.format, self.usage)
    }

    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidConfig(format!(
                "pool dimensions must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.count == 0 && !self.source.is_external() {
            return Err(Error::InvalidConfig(
                "internal pool needs at least one buffer".into(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of pool usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers owned by the pool.
    pub count: usize,
    /// Buffers on the idle list.
    pub idle: usize,
    /// Buffers handed out and not yet returned.
    pub busy: usize,
    /// Successful acquisitions.
    pub acquisitions: u64,
    /// Acquisitions that had to wait.
    pub waits: u64,
    /// Acquisitions that gave up (timeout, stop, or empty with no wait).
    pub misses: u64,
}

struct PoolState {
    config: Option<PoolConfig>,
    allocator: Option<Arc<dyn BufferAllocator>>,
    idle: VecDeque<Buffer>,
    busy: BTreeSet<u32>,
    next_index: u32,
    stopped: bool,
}

/// A stream's rotating set of buffers.
pub struct BufferPool {
    id: PoolId,
    generation: u64,
    state: Mutex<PoolState>,
    available: Condvar,
    tracking_id: AtomicU64,
    acquisitions: AtomicU64,
    waits: AtomicU64,
    misses: AtomicU64,
}

impl BufferPool {
    /// Create an empty, uninitialized pool.
    pub fn new(id: PoolId) -> Self {
        Self::with_generation(id, 0)
    }

    pub(crate) fn with_generation(id: PoolId, generation: u64) -> Self {
        Self {
            id,
            generation,
            state: Mutex::new(PoolState {
                config: None,
                allocator: None,
                idle: VecDeque::new(),
                busy: BTreeSet::new(),
                next_index: 0,
                stopped: false,
            }),
            available: Condvar::new(),
            tracking_id: AtomicU64::new(0),
            acquisitions: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Pool id.
    #[inline]
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// How many times the manager has recreated a pool under this id.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Configure the pool and preallocate its buffers.
    ///
    /// Internal sources allocate `config.count` buffers from the registry's
    /// allocator. External sources allocate nothing and wait for
    /// [`add_buffer`](Self::add_buffer). Re-initializing frees the previous
    /// buffers first and fails while any buffer is still busy.
    pub fn init(&self, config: PoolConfig, registry: &AllocatorRegistry) -> Result<()> {
        config.validate()?;

        let allocator = if config.source.is_external() {
            None
        } else {
            Some(registry.get(config.source).ok_or_else(|| {
                Error::InvalidConfig(format!("no allocator for {:?}", config.source))
            })?)
        };

        let mut state = lock(&self.state);
        if !state.busy.is_empty() {
            return Err(Error::state(format!(
                "{} has {} busy buffers, cannot re-initialize",
                self.id,
                state.busy.len()
            )));
        }
        Self::free_idle(&mut state);

        let mut idle = VecDeque::with_capacity(config.count);
        if let Some(allocator) = &allocator {
            let layout = config.layout();
            for index in 0..config.count {
                match allocator.alloc_buffer(&layout) {
                    Ok(mut buffer) => {
                        buffer.set_identity(self.id, index as u32);
                        idle.push_back(buffer);
                    }
                    Err(e) => {
                        for buffer in idle.drain(..) {
                            let _ = allocator.free_buffer(buffer);
                        }
                        return Err(e);
                    }
                }
            }
        }

        state.next_index = idle.len() as u32;
        state.idle = idle;
        state.allocator = allocator;
        state.config = Some(config);
        state.stopped = false;

        tracing::debug!(
            pool = %self.id,
            width = config.width,
            height = config.height,
            count = state.idle.len(),
            source = ?config.source,
            "pool initialized"
        );
        observability::record_pool_idle(self.id, state.idle.len());
        Ok(())
    }

    /// Add an externally supplied buffer to the idle list.
    pub fn add_buffer(&self, mut buffer: Buffer) -> Result<()> {
        let mut state = lock(&self.state);
        match state.config {
            Some(config) if config.source.is_external() => {}
            Some(_) => {
                return Err(Error::state(format!(
                    "{} allocates internally, cannot add buffers",
                    self.id
                )));
            }
            None => return Err(Error::state(format!("{} is not initialized", self.id))),
        }

        let index = state.next_index;
        state.next_index += 1;
        buffer.set_identity(self.id, index);
        buffer.reset_for_reuse();
        state.idle.push_back(buffer);
        drop(state);

        self.available.notify_one();
        Ok(())
    }

    /// Take an idle buffer.
    ///
    /// `Forever` blocks until a buffer is idle or the pool is stopped,
    /// `Immediate` never blocks, `After(d)` blocks at most `d`. Returns
    /// `None` on timeout, on an empty pool with `Immediate`, or when stopped.
    pub fn acquire_buffer(&self, timeout: Timeout) -> Option<Buffer> {
        let deadline = timeout.deadline();
        let mut state = lock(&self.state);
        let mut waited = false;

        loop {
            if state.stopped {
                break;
            }
            if let Some(buffer) = state.idle.pop_front() {
                state.busy.insert(buffer.index());
                let idle = state.idle.len();
                drop(state);

                self.acquisitions.fetch_add(1, Ordering::Relaxed);
                if waited {
                    self.waits.fetch_add(1, Ordering::Relaxed);
                }
                observability::record_buffer_acquired(self.id);
                observability::record_pool_idle(self.id, idle);
                return Some(buffer);
            }

            waited = true;
            state = match deadline {
                None => wait(&self.available, state),
                Some(deadline) => {
                    let (guard, timed_out) = wait_until(&self.available, state, deadline);
                    if timed_out && guard.idle.is_empty() {
                        state = guard;
                        break;
                    }
                    guard
                }
            };
        }

        drop(state);
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Give a busy buffer back.
    ///
    /// Fails if the buffer does not belong to this pool or is not busy.
    pub fn return_buffer(&self, mut buffer: Buffer) -> Result<()> {
        let mut state = lock(&self.state);
        if buffer.pool_id() != self.id || !state.busy.remove(&buffer.index()) {
            return Err(Error::BufferNotBusy {
                pool: self.id.0,
                index: buffer.index(),
            });
        }

        buffer.reset_for_reuse();
        state.idle.push_back(buffer);
        let idle = state.idle.len();
        drop(state);

        self.available.notify_one();
        observability::record_buffer_returned(self.id);
        observability::record_pool_idle(self.id, idle);
        Ok(())
    }

    /// Unblock every waiter; acquisitions fail until [`notify_start`](Self::notify_start).
    pub fn notify_stop(&self) {
        lock(&self.state).stopped = true;
        self.available.notify_all();
    }

    /// Re-enable acquisitions after a stop.
    pub fn notify_start(&self) {
        lock(&self.state).stopped = false;
    }

    /// Whether the pool is stopped.
    pub fn is_stopped(&self) -> bool {
        lock(&self.state).stopped
    }

    /// Unmap and free every buffer.
    ///
    /// Only valid while no buffer is busy.
    pub fn clear_buffers(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.busy.is_empty() {
            return Err(Error::state(format!(
                "{} has {} busy buffers, cannot clear",
                self.id,
                state.busy.len()
            )));
        }
        let freed = state.idle.len();
        Self::free_idle(&mut state);
        state.next_index = 0;
        drop(state);

        tracing::debug!(pool = %self.id, freed, "pool cleared");
        observability::record_pool_idle(self.id, 0);
        Ok(())
    }

    /// Write back CPU caches for a buffer from this pool.
    pub fn flush_cache(&self, buffer: &Buffer) -> Result<()> {
        match self.allocator() {
            Some(allocator) => allocator.flush_cache(buffer),
            None => Ok(()),
        }
    }

    /// Invalidate CPU caches for a buffer from this pool.
    pub fn invalidate_cache(&self, buffer: &Buffer) -> Result<()> {
        match self.allocator() {
            Some(allocator) => allocator.invalidate_cache(buffer),
            None => Ok(()),
        }
    }

    fn allocator(&self) -> Option<Arc<dyn BufferAllocator>> {
        lock(&self.state).allocator.clone()
    }

    fn free_idle(state: &mut PoolState) {
        let allocator = state.allocator.clone();
        for mut buffer in state.idle.drain(..) {
            match &allocator {
                Some(allocator) => {
                    if let Err(e) = allocator.free_buffer(buffer) {
                        tracing::warn!("failed to free buffer: {}", e);
                    }
                }
                None => {
                    buffer.take_memory();
                }
            }
        }
    }

    /// Current configuration, if initialized.
    pub fn config(&self) -> Option<PoolConfig> {
        lock(&self.state).config
    }

    /// Buffers owned by the pool (idle + busy).
    pub fn count(&self) -> usize {
        let state = lock(&self.state);
        state.idle.len() + state.busy.len()
    }

    /// Buffers on the idle list.
    pub fn idle_count(&self) -> usize {
        lock(&self.state).idle.len()
    }

    /// Buffers currently handed out.
    pub fn busy_count(&self) -> usize {
        lock(&self.state).busy.len()
    }

    /// Usage statistics.
    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.state);
        PoolStats {
            count: state.idle.len() + state.busy.len(),
            idle: state.idle.len(),
            busy: state.busy.len(),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Attach an opaque tracking id (for correlating with a host object).
    pub fn set_tracking_id(&self, tracking_id: Option<u64>) {
        self.tracking_id
            .store(tracking_id.unwrap_or(0), Ordering::Relaxed);
    }

    /// Tracking id, if set.
    pub fn tracking_id(&self) -> Option<u64> {
        match self.tracking_id.load(Ordering::Relaxed) {
            0 => None,
            id => Some(id),
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if !state.busy.is_empty() {
            tracing::warn!(
                pool = %self.id,
                busy = state.busy.len(),
                "pool dropped with buffers still busy"
            );
        }
        Self::free_idle(&mut state);
        drop(state);
        self.available.notify_all();
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("BufferPool")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("idle", &stats.idle)
            .field("busy", &stats.busy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferStatus;
    use crate::memory::HeapAllocator;
    use std::thread;
    use std::time::{Duration, Instant};

    fn registry() -> AllocatorRegistry {
        AllocatorRegistry::with_defaults().unwrap()
    }

    fn pool_with(count: usize) -> Arc<BufferPool> {
        let pool = Arc::new(BufferPool::new(PoolId(1)));
        pool.init(PoolConfig::new(32, 32, count), &registry()).unwrap();
        pool
    }

    #[test]
    fn test_pool_init_preallocates() {
        let pool = pool_with(4);
        assert_eq!(pool.count(), 4);
        assert_eq!(pool.idle_count(), 4);
        assert_eq!(pool.busy_count(), 0);
    }

    #[test]
    fn test_init_rejects_bad_config() {
        let pool = BufferPool::new(PoolId(1));
        assert!(pool.init(PoolConfig::new(0, 32, 4), &registry()).is_err());
        assert!(pool.init(PoolConfig::new(32, 32, 0), &registry()).is_err());
        assert!(
            pool.init(PoolConfig::new(32, 32, 2), &AllocatorRegistry::new())
                .is_err()
        );
    }

    #[test]
    fn test_acquire_return_invariant() {
        let pool = pool_with(3);
        let mut held = Vec::new();

        for _ in 0..3 {
            held.push(pool.acquire_buffer(Timeout::Immediate).unwrap());
            assert_eq!(pool.idle_count() + pool.busy_count(), 3);
        }
        assert!(pool.acquire_buffer(Timeout::Immediate).is_none());

        let mut indices: Vec<_> = held.iter().map(|b| b.index()).collect();
        indices.sort();
        indices.dedup();
        assert_eq!(indices.len(), 3, "a buffer was handed out twice");

        for buffer in held {
            pool.return_buffer(buffer).unwrap();
            assert_eq!(pool.idle_count() + pool.busy_count(), 3);
        }
        assert_eq!(pool.idle_count(), 3);
    }

    #[test]
    fn test_return_foreign_buffer_fails() {
        let pool = pool_with(1);
        let other = pool_with(1);
        let buffer = other.acquire_buffer(Timeout::Immediate).unwrap();

        // Same id (both PoolId(1)) but index 0 is not busy here
        let err = pool.return_buffer(buffer).unwrap_err();
        assert!(matches!(err, Error::BufferNotBusy { index: 0, .. }));
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_double_return_fails() {
        let pool = pool_with(1);
        let buffer = pool.acquire_buffer(Timeout::Immediate).unwrap();
        let index = buffer.index();
        pool.return_buffer(buffer).unwrap();

        let mut fake = Buffer::new(PoolConfig::new(32, 32, 1).layout(), None);
        fake.set_identity(PoolId(1), index);
        assert!(pool.return_buffer(fake).is_err());
        assert_eq!(pool.count(), 1);
    }

    #[test]
    fn test_return_resets_status() {
        let pool = pool_with(1);
        let mut buffer = pool.acquire_buffer(Timeout::Immediate).unwrap();
        buffer.set_status(BufferStatus::Invalid);
        pool.return_buffer(buffer).unwrap();

        let buffer = pool.acquire_buffer(Timeout::Immediate).unwrap();
        assert_eq!(buffer.status(), BufferStatus::Ok);
    }

    #[test]
    fn test_acquire_timeout() {
        let pool = pool_with(1);
        let _held = pool.acquire_buffer(Timeout::Forever).unwrap();

        let start = Instant::now();
        let result = pool.acquire_buffer(Timeout::After(Duration::from_millis(20)));
        assert!(result.is_none());
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert_eq!(pool.stats().misses, 1);
    }

    #[test]
    fn test_blocking_acquire_wakes_on_return() {
        let pool = pool_with(1);
        let buffer = pool.acquire_buffer(Timeout::Immediate).unwrap();

        let pool2 = pool.clone();
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let buffer = pool2.acquire_buffer(Timeout::Forever);
            (buffer.is_some(), start.elapsed())
        });

        thread::sleep(Duration::from_millis(50));
        pool.return_buffer(buffer).unwrap();

        let (got, elapsed) = handle.join().unwrap();
        assert!(got);
        assert!(elapsed >= Duration::from_millis(40));
    }

    #[test]
    fn test_unrepresentable_timeout_waits_for_return() {
        let pool = pool_with(1);
        let buffer = pool.acquire_buffer(Timeout::Immediate).unwrap();

        let pool2 = pool.clone();
        let handle =
            thread::spawn(move || pool2.acquire_buffer(Timeout::After(Duration::MAX)).is_some());

        thread::sleep(Duration::from_millis(20));
        pool.return_buffer(buffer).unwrap();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_notify_stop_unblocks_waiters() {
        let pool = pool_with(1);
        let _held = pool.acquire_buffer(Timeout::Immediate).unwrap();

        let pool2 = pool.clone();
        let handle = thread::spawn(move || pool2.acquire_buffer(Timeout::Forever).is_none());

        thread::sleep(Duration::from_millis(20));
        pool.notify_stop();
        assert!(handle.join().unwrap());

        // Buffers are kept across a stop
        assert_eq!(pool.count(), 1);
        pool.notify_start();
        assert!(!pool.is_stopped());
    }

    #[test]
    fn test_clear_requires_no_busy() {
        let pool = pool_with(2);
        let buffer = pool.acquire_buffer(Timeout::Immediate).unwrap();
        assert!(pool.clear_buffers().is_err());

        pool.return_buffer(buffer).unwrap();
        pool.clear_buffers().unwrap();
        assert_eq!(pool.count(), 0);
    }

    #[test]
    fn test_clear_frees_through_allocator() {
        let heap = Arc::new(HeapAllocator::new());
        let mut registry = AllocatorRegistry::new();
        registry.register(BufferSource::Heap, heap.clone()).unwrap();

        let pool = BufferPool::new(PoolId(5));
        pool.init(PoolConfig::new(16, 16, 3), &registry).unwrap();
        assert_eq!(heap.live_buffers(), 3);

        pool.clear_buffers().unwrap();
        assert_eq!(heap.live_buffers(), 0);
    }

    #[test]
    fn test_external_pool_add_buffer() {
        let pool = BufferPool::new(PoolId(2));
        let config = PoolConfig::new(16, 16, 2).source(BufferSource::External);
        pool.init(config, &AllocatorRegistry::new()).unwrap();
        assert_eq!(pool.count(), 0);
        assert!(pool.acquire_buffer(Timeout::Immediate).is_none());

        let layout = config.layout();
        pool.add_buffer(Buffer::new(layout, None)).unwrap();
        pool.add_buffer(Buffer::new(layout, None)).unwrap();
        assert_eq!(pool.count(), 2);

        let buffer = pool.acquire_buffer(Timeout::Immediate).unwrap();
        assert_eq!(buffer.pool_id(), PoolId(2));
        pool.return_buffer(buffer).unwrap();
    }

    #[test]
    fn test_internal_pool_rejects_add_buffer() {
        let pool = pool_with(1);
        let buffer = Buffer::new(PoolConfig::new(32, 32, 1).layout(), None);
        assert!(pool.add_buffer(buffer).is_err());
    }

    #[test]
    fn test_reinit_with_busy_fails() {
        let pool = pool_with(2);
        let _held = pool.acquire_buffer(Timeout::Immediate).unwrap();
        assert!(pool.init(PoolConfig::new(64, 64, 2), &registry()).is_err());
    }

    #[test]
    fn test_tracking_id() {
        let pool = pool_with(1);
        assert_eq!(pool.tracking_id(), None);
        pool.set_tracking_id(Some(77));
        assert_eq!(pool.tracking_id(), Some(77));
    }

    #[test]
    fn test_pool_concurrent() {
        let pool = pool_with(4);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let buffer = pool.acquire_buffer(Timeout::Forever).unwrap();
                        assert_eq!(pool.count(), 4);
                        pool.return_buffer(buffer).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.idle_count(), 4);
        assert_eq!(pool.stats().acquisitions, 400);
    }
}
