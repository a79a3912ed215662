//! Memory segment trait and types.

use std::os::unix::io::RawFd;

/// Type of memory backing a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryType {
    /// Process heap (single-process, no file handle).
    Heap,
    /// Anonymous shared memory (memfd + mmap), shareable by fd.
    Memfd,
    /// Memory owned by an external producer (tunnel endpoint, host process).
    External,
}

impl MemoryType {
    /// Can this memory be handed to another process by file handle?
    #[inline]
    pub fn supports_ipc(&self) -> bool {
        match self {
            MemoryType::Heap => false,
            MemoryType::Memfd => true,
            MemoryType::External => false,
        }
    }
}

/// Trait for memory segment backends.
///
/// A segment is the contiguous memory behind exactly one [`Buffer`](crate::buffer::Buffer).
///
/// # Safety
///
/// Implementations must ensure that:
/// - Pointers remain valid for the lifetime of the segment
/// - Thread-safety requirements are met (Send + Sync)
pub trait MemorySegment: Send + Sync {
    /// Get a raw pointer to the start of this segment.
    fn as_ptr(&self) -> *const u8;

    /// Get a mutable pointer to the start of this segment.
    ///
    /// Returns `None` if the segment is read-only.
    fn as_mut_ptr(&self) -> Option<*mut u8>;

    /// Total size of the segment in bytes.
    fn len(&self) -> usize;

    /// Returns true if the segment has zero length.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The type of memory backing this segment.
    fn memory_type(&self) -> MemoryType;

    /// File handle for sharing, when the backend has one.
    fn fd(&self) -> Option<RawFd> {
        None
    }

    /// Device-visible address, zero when the backend has none.
    fn phys_addr(&self) -> u64 {
        0
    }

    /// Get the segment as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure no mutable references exist to this memory.
    unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: Caller guarantees no mutable references exist.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }
}
