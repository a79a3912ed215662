//! Buffer-queue endpoints a tunnel-mode stream exchanges buffers with.
//!
//! In tunnel mode a stream takes empty buffers from the consumer's queue
//! instead of its own pool and hands finished buffers straight back. A
//! buffer returned with OK status is *flushed* (queued for the consumer);
//! any other status *cancels* it (back to the free list).

use crate::buffer::{Buffer, BufferLayout, BufferStatus};
use crate::error::{Error, Result};
use crate::memory::{BufferAllocator, HeapAllocator};
use crate::sync::{Timeout, deadline_after, lock, wait, wait_deadline, wait_until};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// External buffer-queue endpoint.
pub trait BufferQueue: Send + Sync {
    /// Take an empty buffer, blocking per `timeout` until one is free or
    /// the queue is stopped.
    fn get_buffer(&self, timeout: Timeout) -> Option<Buffer>;

    /// Return a buffer: flushed to the consumer if OK, cancelled otherwise.
    fn put_buffer(&self, buffer: Buffer) -> Result<()>;

    /// Size the queue.
    fn set_buffer_count(&self, count: usize) -> Result<()>;

    /// Wait until every buffer taken with `get_buffer` has been put back.
    ///
    /// Returns `false` on timeout.
    fn wait_for_all_buffer_returned(&self, timeout: Duration) -> bool;

    /// Unblock `get_buffer` callers; later calls return `None`.
    fn stop(&self);

    /// Re-enable `get_buffer` after [`stop`](Self::stop).
    fn start(&self);
}

#[derive(Default)]
struct QueueState {
    free: VecDeque<Buffer>,
    flushed: VecDeque<Buffer>,
    dequeued: usize,
    total: usize,
    cancelled: u64,
    stopped: bool,
}

/// In-process [`BufferQueue`] backed by heap buffers.
///
/// The consumer side drains flushed buffers with
/// [`take_flushed`](Self::take_flushed) and gives them back with
/// [`release`](Self::release).
pub struct MemoryBufferQueue {
    layout: BufferLayout,
    allocator: HeapAllocator,
    state: Mutex<QueueState>,
    changed: Condvar,
}

impl MemoryBufferQueue {
    /// Queue of buffers with the given layout; empty until sized.
    pub fn new(layout: BufferLayout) -> Self {
        Self {
            layout,
            allocator: HeapAllocator::new(),
            state: Mutex::new(QueueState::default()),
            changed: Condvar::new(),
        }
    }

    /// Oldest flushed buffer, for the consumer.
    pub fn take_flushed(&self) -> Option<Buffer> {
        lock(&self.state).flushed.pop_front()
    }

    /// Give a consumed buffer back to the free list.
    pub fn release(&self, mut buffer: Buffer) {
        buffer.reset_for_reuse();
        lock(&self.state).free.push_back(buffer);
        self.changed.notify_all();
    }

    /// Buffers waiting for the consumer.
    pub fn flushed_count(&self) -> usize {
        lock(&self.state).flushed.len()
    }

    /// Buffers returned with a non-OK status so far.
    pub fn cancelled_count(&self) -> u64 {
        lock(&self.state).cancelled
    }

    /// Buffers free for the producer.
    pub fn free_count(&self) -> usize {
        lock(&self.state).free.len()
    }

    /// Buffers currently held by the producer.
    pub fn dequeued_count(&self) -> usize {
        lock(&self.state).dequeued
    }
}

impl BufferQueue for MemoryBufferQueue {
    fn get_buffer(&self, timeout: Timeout) -> Option<Buffer> {
        let deadline = timeout.deadline();
        let mut state = lock(&self.state);
        loop {
            if state.stopped {
                return None;
            }
            if let Some(buffer) = state.free.pop_front() {
                state.dequeued += 1;
                return Some(buffer);
            }
            state = match deadline {
                None => wait(&self.changed, state),
                Some(deadline) => {
                    let (guard, timed_out) = wait_until(&self.changed, state, deadline);
                    if timed_out && guard.free.is_empty() {
                        return None;
                    }
                    guard
                }
            };
        }
    }

    fn put_buffer(&self, buffer: Buffer) -> Result<()> {
        let mut state = lock(&self.state);
        if state.dequeued == 0 {
            return Err(Error::state("tunnel buffer returned but none was dequeued"));
        }
        state.dequeued -= 1;
        if buffer.status() == BufferStatus::Ok {
            state.flushed.push_back(buffer);
        } else {
            let mut buffer = buffer;
            buffer.reset_for_reuse();
            state.cancelled += 1;
            state.free.push_back(buffer);
        }
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn set_buffer_count(&self, count: usize) -> Result<()> {
        let mut state = lock(&self.state);
        while state.total < count {
            let mut buffer = self.allocator.alloc_buffer(&self.layout)?;
            buffer.reset_for_reuse();
            state.free.push_back(buffer);
            state.total += 1;
        }
        // Shrinking only reclaims buffers that are currently free
        while state.total > count {
            let Some(buffer) = state.free.pop_back() else {
                break;
            };
            self.allocator.free_buffer(buffer)?;
            state.total -= 1;
        }
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn wait_for_all_buffer_returned(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        let mut state = lock(&self.state);
        while state.dequeued > 0 {
            let (guard, timed_out) = wait_deadline(&self.changed, state, deadline);
            state = guard;
            if timed_out && state.dequeued > 0 {
                return false;
            }
        }
        true
    }

    fn stop(&self) {
        lock(&self.state).stopped = true;
        self.changed.notify_all();
    }

    fn start(&self) {
        lock(&self.state).stopped = false;
    }
}

impl std::fmt::Debug for MemoryBufferQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MemoryBufferQueue")
            .field("total", &state.total)
            .field("free", &state.free.len())
            .field("flushed", &state.flushed.len())
            .field("dequeued", &state.dequeued)
            .finish()
    }
}
