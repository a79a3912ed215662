//! Metrics collection using metrics-rs.
//!
//! Recording is a no-op until the application installs a recorder.

use crate::buffer::{BufferStatus, PoolId, StreamId};
use metrics::{Counter, Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const BUFFERS_ACQUIRED: &str = "campipe_buffers_acquired";
const BUFFERS_RETURNED: &str = "campipe_buffers_returned";
const BUFFERS_DROPPED: &str = "campipe_buffers_dropped";
const BUFFERS_INVALID: &str = "campipe_buffers_invalid";
const REQUESTS_DISPATCHED: &str = "campipe_requests_dispatched";
const REQUESTS_COMPLETED: &str = "campipe_requests_completed";
const POOL_IDLE: &str = "campipe_pool_idle";
const BARRIER_WAIT_NS: &str = "campipe_barrier_wait_ns";
const MESSAGES_MERGED: &str = "campipe_messages_merged";

/// Initialize metrics descriptions.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        BUFFERS_ACQUIRED,
        Unit::Count,
        "Buffers moved from idle to busy"
    );
    metrics::describe_counter!(
        BUFFERS_RETURNED,
        Unit::Count,
        "Buffers moved from busy back to idle"
    );
    metrics::describe_counter!(
        BUFFERS_DROPPED,
        Unit::Count,
        "Result buffers that came back with DROP status"
    );
    metrics::describe_counter!(
        BUFFERS_INVALID,
        Unit::Count,
        "Result buffers that matched no in-flight request"
    );
    metrics::describe_counter!(
        REQUESTS_DISPATCHED,
        Unit::Count,
        "Capture requests submitted to a pipeline"
    );
    metrics::describe_counter!(
        REQUESTS_COMPLETED,
        Unit::Count,
        "Capture requests whose result phase completed"
    );
    metrics::describe_gauge!(POOL_IDLE, Unit::Count, "Idle buffers in a pool");
    metrics::describe_histogram!(
        BARRIER_WAIT_NS,
        Unit::Nanoseconds,
        "Time an owner spent waiting at a capture barrier"
    );
    metrics::describe_counter!(
        MESSAGES_MERGED,
        Unit::Count,
        "Merged capture notifications released"
    );
}

/// Record a buffer acquisition.
#[inline]
pub fn record_buffer_acquired(pool: PoolId) {
    counter!(BUFFERS_ACQUIRED, "pool" => pool.0.to_string()).increment(1);
}

/// Record a buffer return.
#[inline]
pub fn record_buffer_returned(pool: PoolId) {
    counter!(BUFFERS_RETURNED, "pool" => pool.0.to_string()).increment(1);
}

/// Record the idle-buffer count of a pool.
#[inline]
pub fn record_pool_idle(pool: PoolId, idle: usize) {
    gauge!(POOL_IDLE, "pool" => pool.0.to_string()).set(idle as f64);
}

/// Record time spent at a barrier.
#[inline]
pub fn record_barrier_wait(phase: &'static str, waited: Duration) {
    histogram!(BARRIER_WAIT_NS, "phase" => phase).record(waited.as_nanos() as f64);
}

/// Record a merged notification.
#[inline]
pub fn record_messages_merged(kind: &'static str, group_size: usize) {
    counter!(MESSAGES_MERGED, "kind" => kind).increment(1);
    histogram!("campipe_message_group_size", "kind" => kind).record(group_size as f64);
}

/// Per-stream counters with pre-configured labels.
#[derive(Clone)]
pub struct StreamMetrics {
    dispatched: Counter,
    completed: Counter,
    dropped: Counter,
    invalid: Counter,
}

impl StreamMetrics {
    /// Create counters labelled with the stream id.
    pub fn new(stream: StreamId) -> Self {
        let label = stream.0.to_string();
        Self {
            dispatched: counter!(REQUESTS_DISPATCHED, "stream" => label.clone()),
            completed: counter!(REQUESTS_COMPLETED, "stream" => label.clone()),
            dropped: counter!(BUFFERS_DROPPED, "stream" => label.clone()),
            invalid: counter!(BUFFERS_INVALID, "stream" => label),
        }
    }

    /// Record a request submitted to the pipeline.
    #[inline]
    pub fn record_dispatched(&self) {
        self.dispatched.increment(1);
    }

    /// Record a completed result phase.
    #[inline]
    pub fn record_completed(&self) {
        self.completed.increment(1);
    }

    /// Record the status of a buffer coming back from the pipeline.
    #[inline]
    pub fn record_status(&self, status: BufferStatus) {
        match status {
            BufferStatus::Ok => {}
            BufferStatus::Drop => self.dropped.increment(1),
            BufferStatus::Invalid => self.invalid.increment(1),
        }
    }
}
