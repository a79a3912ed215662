//! Frame memory: backends, allocators, pools and the pool registry.
//!
//! # Architecture
//!
//! - [`MemorySegment`]: Trait for memory backends (heap, memfd)
//! - [`BufferAllocator`]: Allocation/mapping strategy, registered per [`BufferSource`]
//! - [`BufferPool`]: A stream's idle/busy rotation of buffers
//! - [`BufferManager`]: Id → pool registry holding pools weakly
//!
//! # Example
//!
//! ```rust
//! use campipe::memory::{AllocatorRegistry, BufferManager, PoolConfig};
//!
//! let registry = AllocatorRegistry::with_defaults().unwrap();
//! let manager = BufferManager::new();
//!
//! let pool = manager.create_pool();
//! pool.init(PoolConfig::new(640, 480, 4), &registry).unwrap();
//! assert!(std::sync::Arc::ptr_eq(&pool, &manager.lookup(pool.id()).unwrap()));
//! ```

mod allocator;
mod buffer_pool;
mod heap;
mod manager;
mod memfd;
mod segment;

pub use allocator::{AllocatorRegistry, BufferAllocator, BufferSource, HeapAllocator, MemfdAllocator};
pub use buffer_pool::{BufferPool, PoolConfig, PoolStats};
pub use heap::HeapSegment;
pub use manager::BufferManager;
pub use memfd::MemfdSegment;
pub use segment::{MemorySegment, MemoryType};
