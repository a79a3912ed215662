//! Heap-backed memory segment.

use super::{MemorySegment, MemoryType};
use crate::error::{Error, Result};
use std::ptr::NonNull;

/// A memory segment backed by a zeroed heap allocation.
///
/// # Example
///
/// ```rust
/// use campipe::memory::{HeapSegment, MemorySegment};
///
/// let segment = HeapSegment::new(1024).unwrap();
/// assert_eq!(segment.len(), 1024);
/// ```
pub struct HeapSegment {
    ptr: NonNull<u8>,
    len: usize,
}

impl HeapSegment {
    /// Create a new zero-initialized heap segment.
    ///
    /// # Errors
    ///
    /// Returns an error if size is 0.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }

        let data: Box<[u8]> = vec![0u8; size].into_boxed_slice();
        let ptr = NonNull::from(Box::leak(data)).cast::<u8>();

        Ok(Self { ptr, len: size })
    }
}

impl MemorySegment for HeapSegment {
    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn as_mut_ptr(&self) -> Option<*mut u8> {
        Some(self.ptr.as_ptr())
    }

    fn len(&self) -> usize {
        self.len
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::Heap
    }
}

impl Drop for HeapSegment {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        // SAFETY: ptr/len came from Box::leak of a boxed slice in `new`.
        drop(unsafe { Box::from_raw(slice) });
    }
}

// SAFETY: the allocation is owned exclusively by this segment; access
// discipline is enforced by the Buffer descriptor that wraps it.
unsafe impl Send for HeapSegment {}
unsafe impl Sync for HeapSegment {}
