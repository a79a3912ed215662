//! # campipe
//!
//! Buffer pooling and capture synchronization for multi-stream camera
//! pipelines.
//!
//! A capture request can span several streams (preview, video, still). Each
//! stream runs its own worker, pulls frame buffers from its own pool, and
//! pushes them through its node sequence of a shared processing graph. Two
//! rendezvous barriers per request make every participating stream dispatch
//! together and report its result together, and per-stream lifecycle
//! messages are merged into one notification per event.
//!
//! ## Features
//!
//! - **Buffer pools**: fixed idle/busy rotation per stream, heap or memfd
//!   backed, with a weak id registry that recreates expired pools
//! - **Capture barriers**: dispatch and result rendezvous with an explicit
//!   disable escape hatch for teardown
//! - **Node graphs**: mode-keyed DAGs walked per stream, source-first or
//!   sink-first depending on the operation
//! - **Offline hand-off**: still captures keep completing after their stream
//!   stops
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use campipe::prelude::*;
//!
//! let spec = PipelineSpec::new()
//!     .with_mode("preview", GraphSpec::direct(&[StreamIntent::Preview]));
//! let session = CaptureSession::new(SessionConfig::default(), spec)?;
//!
//! let preview = session.create_stream(StreamIntent::Preview);
//! session.commit_stream(preview, StreamConfig::preview(1280, 720))?;
//! session.build_pipeline("preview")?;
//!
//! let capture = session.capture(&[preview], CaptureOptions::repeating())?;
//! // ...
//! session.cancel_capture(capture)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod capture;
pub mod clock;
pub mod error;
pub mod memory;
pub mod observability;
pub mod offline;
pub mod pipeline;
pub mod session;
pub mod stream;
mod sync;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::{Buffer, BufferStatus, CaptureId, PixelFormat, StreamId};
    pub use crate::capture::{CaptureOptions, CaptureRequest, MessageKind};
    pub use crate::error::{Error, Result};
    pub use crate::memory::{BufferManager, BufferPool, PoolConfig};
    pub use crate::pipeline::{GraphSpec, NodeFactory, NodeSpec, PipelineSpec};
    pub use crate::session::{CaptureNotification, CaptureSession, SessionConfig};
    pub use crate::stream::{StreamConfig, StreamIntent, StreamState};
    pub use crate::sync::Timeout;
}

pub use error::{Error, Result};
pub use sync::Timeout;
