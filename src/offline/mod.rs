//! Offline continuation of still streams.
//!
//! When a still stream is taken offline its worker stops, but captures
//! already in transit keep running through the pipeline. An
//! [`OfflinePipeline`] receives their results in the background and
//! completes them without barrier sync; the [`OfflineManager`] keeps at most
//! one per stream.

mod manager;
mod pipeline;

pub use manager::OfflineManager;
pub use pipeline::{OfflineForward, OfflinePipeline};
