//! Capture streams.
//!
//! - [`StreamConfig`]: what a stream produces and how many buffers it rotates
//! - [`Stream`]: state machine, request queue and worker
//! - [`BufferQueue`]: external endpoint a tunnel-mode stream exchanges
//!   buffers with, with [`MemoryBufferQueue`] as the in-process version
//!
//! # Example
//!
//! ```rust,ignore
//! let stream = Stream::new(StreamId(0), StreamIntent::Preview, context);
//! stream.commit(StreamConfig::preview(1280, 720))?;
//!
//! let request = CaptureRequest::new(CaptureId(1), 1, CaptureOptions::repeating());
//! let owner: Arc<dyn RequestOwner> = stream.clone();
//! request.add_owner(&owner);
//! stream.add_request(request.clone())?;
//! // ...
//! request.cancel();
//! stream.stop_stream()?;
//! ```

mod config;
#[allow(clippy::module_inception)]
mod stream;
mod tunnel;

pub use config::{StreamConfig, StreamIntent, StreamState};
pub use stream::{Stream, StreamContext};
pub use tunnel::{BufferQueue, MemoryBufferQueue};
