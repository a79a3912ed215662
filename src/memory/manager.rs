//! Registry of buffer pools keyed by generated id.
//!
//! The manager holds pools weakly: a pool lives as long as some stream (or
//! offline pipeline) holds it. Stale entries are pruned on every lookup.
//! Recreating a pool under an existing id bumps its generation, so holders
//! can tell a fresh pool from the one they originally saw. The last
//! generation of a pruned or released id is remembered, so the count keeps
//! rising across prunes.

use super::BufferPool;
use crate::buffer::PoolId;
use crate::sync::lock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

struct Entry {
    pool: Weak<BufferPool>,
    generation: u64,
}

#[derive(Default)]
struct Registry {
    live: HashMap<PoolId, Entry>,
    /// Last generation handed out for ids no longer in `live`.
    retired: HashMap<PoolId, u64>,
}

impl Registry {
    fn retire(&mut self, id: PoolId, entry: Entry) {
        self.retired.insert(id, entry.generation);
    }

    fn prune(&mut self) -> usize {
        let expired: Vec<PoolId> = self
            .live
            .iter()
            .filter(|(_, entry)| entry.pool.strong_count() == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(entry) = self.live.remove(id) {
                self.retire(*id, entry);
            }
        }
        expired.len()
    }

    fn next_generation(&self, id: PoolId) -> u64 {
        match self.live.get(&id) {
            Some(entry) => entry.generation.saturating_add(1),
            None => self
                .retired
                .get(&id)
                .map_or(0, |generation| generation.saturating_add(1)),
        }
    }
}

/// Maps pool ids to weakly-held pools.
pub struct BufferManager {
    pools: Mutex<Registry>,
    next_id: AtomicU64,
}

impl BufferManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a pool under a freshly generated id.
    pub fn create_pool(&self) -> Arc<BufferPool> {
        let id = PoolId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let pool = Arc::new(BufferPool::new(id));

        let mut pools = lock(&self.pools);
        pools.prune();
        pools.live.insert(
            id,
            Entry {
                pool: Arc::downgrade(&pool),
                generation: 0,
            },
        );
        drop(pools);

        tracing::debug!(pool = %id, "pool created");
        pool
    }

    /// The live pool for `id`, or `None` if it was never created or has
    /// been dropped by every holder.
    pub fn lookup(&self, id: PoolId) -> Option<Arc<BufferPool>> {
        let mut pools = lock(&self.pools);
        pools.prune();
        pools.live.get(&id).and_then(|entry| entry.pool.upgrade())
    }

    /// The live pool for `id`, constructing a fresh one if none is alive.
    ///
    /// While any holder keeps the pool alive, every call returns the same
    /// instance.
    pub fn get_or_create(&self, id: PoolId) -> Arc<BufferPool> {
        let mut pools = lock(&self.pools);

        if let Some(pool) = pools.live.get(&id).and_then(|entry| entry.pool.upgrade()) {
            return pool;
        }
        let generation = pools.next_generation(id);
        pools.prune();
        pools.retired.remove(&id);

        let pool = Arc::new(BufferPool::with_generation(id, generation));
        pools.live.insert(
            id,
            Entry {
                pool: Arc::downgrade(&pool),
                generation,
            },
        );
        drop(pools);

        // Keep generated ids clear of caller-chosen ones
        self.next_id
            .fetch_max(id.0.saturating_add(1), Ordering::Relaxed);
        tracing::debug!(pool = %id, generation, "pool constructed on lookup");
        pool
    }

    /// Forget `id`. Live holders keep their pool.
    pub fn release(&self, id: PoolId) -> bool {
        let mut pools = lock(&self.pools);
        match pools.live.remove(&id) {
            Some(entry) => {
                pools.retire(id, entry);
                true
            }
            None => false,
        }
    }

    /// Drop entries whose pools have expired; returns how many were removed.
    pub fn prune(&self) -> usize {
        lock(&self.pools).prune()
    }

    /// Number of registered entries (live or not yet pruned).
    pub fn len(&self) -> usize {
        lock(&self.pools).live.len()
    }

    /// Whether no entries are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every entry. Generations keep counting from where they were.
    pub fn clear(&self) {
        let mut pools = lock(&self.pools);
        let live: Vec<(PoolId, Entry)> = pools.live.drain().collect();
        for (id, entry) in live {
            pools.retire(id, entry);
        }
    }
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("entries", &self.len())
            .finish()
    }
}
