//! Registry of offline pipelines, one per stream.

use super::OfflinePipeline;
use crate::buffer::{CaptureId, StreamId};
use crate::sync::lock;
use std::collections::HashMap;
use std::sync::Mutex;

/// Holds at most one [`OfflinePipeline`] per stream id.
///
/// Pipelines are flushed when removed or replaced, always outside the
/// registry lock.
#[derive(Debug, Default)]
pub struct OfflineManager {
    pipelines: Mutex<HashMap<StreamId, OfflinePipeline>>,
}

impl OfflineManager {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pipeline`, flushing any previous one of the same stream.
    pub fn insert(&self, pipeline: OfflinePipeline) {
        let stream = pipeline.stream();
        let previous = lock(&self.pipelines).insert(stream, pipeline);
        if previous.is_some() {
            tracing::debug!(%stream, "replacing offline pipeline");
        }
        drop(previous);
    }

    /// Flush and remove `stream`'s pipeline. Returns whether one existed.
    pub fn remove(&self, stream: StreamId) -> bool {
        let removed = lock(&self.pipelines).remove(&stream);
        removed.is_some()
    }

    /// Whether `stream` has an offline pipeline.
    pub fn contains(&self, stream: StreamId) -> bool {
        lock(&self.pipelines).contains_key(&stream)
    }

    /// Cancel `capture` in whichever pipeline caches it.
    pub fn cancel_capture(&self, capture: CaptureId) -> bool {
        lock(&self.pipelines)
            .values()
            .fold(false, |found, p| p.cancel_capture(capture) || found)
    }

    /// Captures cached by `stream`'s pipeline.
    pub fn cached_ids(&self, stream: StreamId) -> Vec<CaptureId> {
        lock(&self.pipelines)
            .get(&stream)
            .map(OfflinePipeline::cached_ids)
            .unwrap_or_default()
    }

    /// Flush and remove every pipeline whose captures have all drained.
    pub fn reap_idle(&self) -> usize {
        let idle: Vec<OfflinePipeline> = {
            let mut pipelines = lock(&self.pipelines);
            let streams: Vec<StreamId> = pipelines
                .iter()
                .filter(|(_, p)| p.is_idle())
                .map(|(s, _)| *s)
                .collect();
            streams
                .iter()
                .filter_map(|s| pipelines.remove(s))
                .collect()
        };
        let reaped = idle.len();
        drop(idle);
        if reaped > 0 {
            tracing::debug!(reaped, "idle offline pipelines reaped");
        }
        reaped
    }

    /// Number of registered pipelines.
    pub fn len(&self) -> usize {
        lock(&self.pipelines).len()
    }

    /// Whether no pipeline is registered.
    pub fn is_empty(&self) -> bool {
        lock(&self.pipelines).is_empty()
    }

    /// Flush and remove every pipeline.
    pub fn clear(&self) {
        let all: Vec<OfflinePipeline> = lock(&self.pipelines).drain().map(|(_, p)| p).collect();
        drop(all);
    }
}
