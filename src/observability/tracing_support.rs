//! Span helpers for structured logging.

use crate::buffer::{CaptureId, StreamId};
use tracing::{Level, Span, span};

/// Span for a stream's request worker.
#[inline]
pub fn span_stream(stream: StreamId, intent: &str) -> Span {
    span!(Level::INFO, "stream", id = stream.0, intent = %intent)
}

/// Span for the pipeline worker executing one stream's node sequence.
#[inline]
pub fn span_pipeline_worker(stream: StreamId) -> Span {
    span!(Level::DEBUG, "pipeline", stream = stream.0)
}

/// Span for an offline pipeline's forwarding worker.
#[inline]
pub fn span_offline(stream: StreamId) -> Span {
    span!(Level::INFO, "offline", stream = stream.0)
}

/// Span for one capture request on one stream.
#[inline]
pub fn span_request(stream: StreamId, capture: CaptureId) -> Span {
    span!(
        Level::DEBUG,
        "request",
        stream = stream.0,
        capture = capture.0
    )
}
