//! Observability features: metrics and tracing.
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `campipe_buffers_acquired` | Counter | Buffers moved idle → busy |
//! | `campipe_buffers_returned` | Counter | Buffers moved busy → idle |
//! | `campipe_buffers_dropped` | Counter | Results with DROP status |
//! | `campipe_buffers_invalid` | Counter | Results matching no request |
//! | `campipe_requests_dispatched` | Counter | Requests submitted to a pipeline |
//! | `campipe_requests_completed` | Counter | Requests whose result phase completed |
//! | `campipe_pool_idle` | Gauge | Idle buffers per pool |
//! | `campipe_barrier_wait_ns` | Histogram | Time spent at capture barriers |
//! | `campipe_messages_merged` | Counter | Merged notifications released |

mod metrics;
mod tracing_support;

pub use metrics::{
    StreamMetrics, init_metrics, record_barrier_wait, record_buffer_acquired,
    record_buffer_returned, record_messages_merged, record_pool_idle,
};
pub use tracing_support::{span_offline, span_pipeline_worker, span_request, span_stream};
