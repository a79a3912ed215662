//! Capture requests and their cross-stream synchronization.
//!
//! - [`Rendezvous`]: reusable barrier releasing all owners together
//! - [`CaptureRequest`]: one shutter event with dispatch and result barriers
//! - [`CaptureMessageOperator`]: merges per-owner notifications into one
//!
//! # Ordering
//!
//! For every owner the dispatch barrier strictly precedes the result
//! barrier. Both barriers block without a timeout; teardown must call
//! [`CaptureRequest::disable_sync`] (or [`CaptureRequest::cancel`]) before
//! an owner leaves, or its siblings wait forever.

mod barrier;
mod message;
mod request;

pub use barrier::Rendezvous;
pub use message::{CaptureMessage, CaptureMessageOperator, MergeFn, MessageKind};
pub use request::{CaptureOptions, CaptureRequest, RequestKind, RequestOwner};
