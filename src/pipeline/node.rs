//! Node roles and the processor trait behind each node.

use crate::buffer::{Buffer, BufferStatus, CaptureId, StreamId};
use crate::error::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Role of a node in a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// No inputs; buffers delivered by a stream enter here.
    Source,
    /// Inputs and outputs.
    Process,
    /// No outputs; results leave here.
    Sink,
}

/// Per-capture parameters pushed through the pipeline before a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureParams {
    /// Stream being configured.
    pub stream: StreamId,
    /// Capture about to be issued.
    pub capture_id: CaptureId,
    /// First request since the stream started.
    pub first_request: bool,
    /// Repeating request.
    pub continuous: bool,
}

/// Work done by one node.
///
/// Every hook defaults to a no-op so processors only implement what they
/// need. Hooks run with the node's lock held; `process` runs on the owning
/// stream's pipeline worker.
pub trait NodeProcessor: Send {
    /// Processor name (for logging).
    fn name(&self) -> &str;

    /// Allocate per-stream resources.
    fn prepare(&mut self, _stream: StreamId) -> Result<()> {
        Ok(())
    }

    /// Begin accepting work for `stream`.
    fn start(&mut self, _stream: StreamId) -> Result<()> {
        Ok(())
    }

    /// Apply parameters for the next capture.
    fn config(&mut self, _params: &CaptureParams) -> Result<()> {
        Ok(())
    }

    /// A capture is about to be issued.
    fn capture(&mut self, _stream: StreamId, _capture: CaptureId) -> Result<()> {
        Ok(())
    }

    /// Transform a buffer in flight.
    ///
    /// An error drops the buffer (status `Drop`) and skips later nodes.
    fn process(&mut self, _buffer: &mut Buffer) -> Result<()> {
        Ok(())
    }

    /// A capture was cancelled.
    fn cancel_capture(&mut self, _stream: StreamId, _capture: CaptureId) -> Result<()> {
        Ok(())
    }

    /// Discard queued work for `stream`.
    fn flush(&mut self, _stream: StreamId) -> Result<()> {
        Ok(())
    }

    /// Stop accepting work for `stream`.
    fn stop(&mut self, _stream: StreamId) -> Result<()> {
        Ok(())
    }
}

/// Forwards buffers unchanged.
#[derive(Debug, Default)]
pub struct PassThrough;

impl PassThrough {
    /// Create a pass-through processor.
    pub fn new() -> Self {
        Self
    }
}

impl NodeProcessor for PassThrough {
    fn name(&self) -> &str {
        "passthrough"
    }
}

/// Shared switch for a [`StatusGate`].
#[derive(Debug, Clone)]
pub struct GateHandle(Arc<AtomicBool>);

impl GateHandle {
    /// Gate starts open.
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// Let buffers through with their status unchanged.
    pub fn open(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Mark every buffer passing through as dropped.
    pub fn close(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Whether the gate is open.
    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for GateHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks buffers as dropped while its gate is closed, and optionally every
/// n-th frame.
#[derive(Debug)]
pub struct StatusGate {
    gate: GateHandle,
    drop_every: Option<u64>,
}

impl StatusGate {
    /// Gate controlled by `gate`.
    pub fn new(gate: GateHandle) -> Self {
        Self {
            gate,
            drop_every: None,
        }
    }

    /// Also drop frames whose number is a multiple of `n`.
    pub fn drop_every(mut self, n: u64) -> Self {
        self.drop_every = (n > 0).then_some(n);
        self
    }
}

impl NodeProcessor for StatusGate {
    fn name(&self) -> &str {
        "statusgate"
    }

    fn process(&mut self, buffer: &mut Buffer) -> Result<()> {
        let periodic = self
            .drop_every
            .is_some_and(|n| buffer.frame_number() % n == 0);
        if !self.gate.is_open() || periodic {
            buffer.set_status(BufferStatus::Drop);
        }
        Ok(())
    }
}
