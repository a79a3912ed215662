//! Pluggable buffer allocation backends.
//!
//! A pool never allocates memory itself: it asks the [`BufferAllocator`]
//! registered for its [`BufferSource`] tag. Two backends ship with the crate:
//!
//! - [`HeapAllocator`]: plain heap memory, no file handle
//! - [`MemfdAllocator`]: memfd-backed shared memory carrying a file handle
//!
//! Externally supplied buffers (`BufferSource::External`) have no allocator;
//! they enter a pool through `BufferPool::add_buffer`.

use super::{HeapSegment, MemfdSegment, MemorySegment};
use crate::buffer::{Buffer, BufferLayout};
use crate::error::{Error, Result};
use rustix::mm::MsyncFlags;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Where a pool's buffers come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BufferSource {
    /// Allocated internally from the heap.
    #[default]
    Heap,
    /// Allocated internally as shareable memfd memory.
    Memfd,
    /// Supplied from outside; the pool allocates nothing.
    External,
}

impl BufferSource {
    /// Whether buffers are supplied from outside the pool.
    #[inline]
    pub fn is_external(&self) -> bool {
        matches!(self, BufferSource::External)
    }
}

/// Allocation/mapping strategy for one memory backend.
pub trait BufferAllocator: Send + Sync {
    /// Backend name (for logging).
    fn name(&self) -> &str;

    /// One-time backend setup, run at registration.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Allocate and map one buffer with the given layout.
    fn alloc_buffer(&self, layout: &BufferLayout) -> Result<Buffer>;

    /// Unmap and release a buffer's memory.
    fn free_buffer(&self, buffer: Buffer) -> Result<()>;

    /// Make the buffer's memory CPU-visible.
    fn map_buffer(&self, buffer: &mut Buffer) -> Result<()>;

    /// Drop the CPU mapping.
    fn unmap_buffer(&self, buffer: &mut Buffer) -> Result<()>;

    /// Write back CPU caches so devices observe CPU writes.
    fn flush_cache(&self, _buffer: &Buffer) -> Result<()> {
        Ok(())
    }

    /// Discard CPU caches so the CPU observes device writes.
    fn invalidate_cache(&self, _buffer: &Buffer) -> Result<()> {
        Ok(())
    }

    /// Number of buffers currently allocated and not freed.
    fn live_buffers(&self) -> usize;
}

fn map_common(buffer: &mut Buffer) -> Result<()> {
    if buffer.memory().is_none() {
        return Err(Error::state("cannot map a buffer without memory"));
    }
    buffer.set_mapped(true);
    Ok(())
}

/// Heap allocation backend.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    live: AtomicUsize,
}

impl HeapAllocator {
    /// Create a heap allocator.
    pub fn new() -> Self {
        Self::default()
    }
}

impl BufferAllocator for HeapAllocator {
    fn name(&self) -> &str {
        "heap"
    }

    fn alloc_buffer(&self, layout: &BufferLayout) -> Result<Buffer> {
        let segment: Arc<dyn MemorySegment> = Arc::new(HeapSegment::new(layout.size)?);
        let mut buffer = Buffer::new(*layout, Some(segment));
        self.map_buffer(&mut buffer)?;
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(buffer)
    }

    fn free_buffer(&self, mut buffer: Buffer) -> Result<()> {
        self.unmap_buffer(&mut buffer)?;
        if buffer.take_memory().is_some() {
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn map_buffer(&self, buffer: &mut Buffer) -> Result<()> {
        map_common(buffer)
    }

    fn unmap_buffer(&self, buffer: &mut Buffer) -> Result<()> {
        buffer.set_mapped(false);
        Ok(())
    }

    fn live_buffers(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

/// Shared-memory allocation backend (memfd + mmap).
#[derive(Debug, Default)]
pub struct MemfdAllocator {
    live: AtomicUsize,
    counter: AtomicU64,
}

impl MemfdAllocator {
    /// Create a memfd allocator.
    pub fn new() -> Self {
        Self::default()
    }

    fn sync(buffer: &Buffer, flags: MsyncFlags) -> Result<()> {
        let Some(memory) = buffer.memory() else {
            return Ok(());
        };
        if !buffer.is_mapped() {
            return Err(Error::state("cache maintenance on an unmapped buffer"));
        }
        unsafe {
            rustix::mm::msync(memory.as_ptr() as *mut _, memory.len(), flags)?;
        }
        Ok(())
    }
}

impl BufferAllocator for MemfdAllocator {
    fn name(&self) -> &str {
        "memfd"
    }

    fn alloc_buffer(&self, layout: &BufferLayout) -> Result<Buffer> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("campipe-buf-{}", n);
        let segment: Arc<dyn MemorySegment> = Arc::new(MemfdSegment::new(&name, layout.size)?);
        let mut buffer = Buffer::new(*layout, Some(segment));
        self.map_buffer(&mut buffer)?;
        self.live.fetch_add(1, Ordering::Relaxed);
        Ok(buffer)
    }

    fn free_buffer(&self, mut buffer: Buffer) -> Result<()> {
        self.unmap_buffer(&mut buffer)?;
        if buffer.take_memory().is_some() {
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn map_buffer(&self, buffer: &mut Buffer) -> Result<()> {
        map_common(buffer)
    }

    fn unmap_buffer(&self, buffer: &mut Buffer) -> Result<()> {
        buffer.set_mapped(false);
        Ok(())
    }

    fn flush_cache(&self, buffer: &Buffer) -> Result<()> {
        Self::sync(buffer, MsyncFlags::SYNC)
    }

    fn invalidate_cache(&self, buffer: &Buffer) -> Result<()> {
        Self::sync(buffer, MsyncFlags::SYNC | MsyncFlags::INVALIDATE)
    }

    fn live_buffers(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

/// Allocators keyed by source tag.
///
/// Constructed once and shared by reference; there is no global instance.
#[derive(Clone, Default)]
pub struct AllocatorRegistry {
    allocators: HashMap<BufferSource, Arc<dyn BufferAllocator>>,
}

impl AllocatorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the heap and memfd backends registered.
    pub fn with_defaults() -> Result<Self> {
        let mut registry = Self::new();
        registry.register(BufferSource::Heap, Arc::new(HeapAllocator::new()))?;
        registry.register(BufferSource::Memfd, Arc::new(MemfdAllocator::new()))?;
        Ok(registry)
    }

    /// Register (or replace) the allocator for a source tag.
    pub fn register(
        &mut self,
        source: BufferSource,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Result<()> {
        if source.is_external() {
            return Err(Error::InvalidConfig(
                "external buffers cannot have an allocator".into(),
            ));
        }
        allocator.init()?;
        tracing::debug!(?source, backend = allocator.name(), "registered allocator");
        self.allocators.insert(source, allocator);
        Ok(())
    }

    /// Allocator for a source tag.
    pub fn get(&self, source: BufferSource) -> Option<Arc<dyn BufferAllocator>> {
        self.allocators.get(&source).cloned()
    }
}

impl std::fmt::Debug for AllocatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatorRegistry")
            .field("sources", &self.allocators.keys().collect::<Vec<_>>())
            .finish()
    }
}
