//! Host-facing facade over streams, pipelines and offline hand-off.
//!
//! A [`CaptureSession`] owns every shared collaborator (allocator registry,
//! pool manager, dispatcher, message operator, offline manager) and hands
//! them to the streams it creates. Merged capture events come out as
//! [`CaptureNotification`]s on a channel.
//!
//! # Example
//!
//! ```rust,ignore
//! use campipe::prelude::*;
//!
//! let spec = PipelineSpec::new().with_mode("photo", GraphSpec::direct(&[
//!     StreamIntent::Preview,
//!     StreamIntent::Still,
//! ]));
//! let session = CaptureSession::new(SessionConfig::default(), spec)?;
//!
//! let preview = session.create_stream(StreamIntent::Preview);
//! let still = session.create_stream(StreamIntent::Still);
//! session.commit_stream(preview, StreamConfig::preview(1280, 720))?;
//! session.commit_stream(still, StreamConfig::still(4000, 3000))?;
//! session.build_pipeline("photo")?;
//!
//! let capture = session.capture(&[preview, still], CaptureOptions::still())?;
//! for note in session.notifications() {
//!     println!("{:?} {} on {:?}", note.kind, note.capture_id, note.streams);
//! }
//! ```

use crate::buffer::{BufferStatus, CaptureId, StreamId};
use crate::capture::{
    CaptureMessage, CaptureMessageOperator, CaptureOptions, CaptureRequest, MessageKind,
    RequestOwner,
};
use crate::clock::ClockTime;
use crate::error::{Error, Result};
use crate::memory::{AllocatorRegistry, BufferManager};
use crate::observability;
use crate::offline::OfflineManager;
use crate::pipeline::{NodeFactory, PipelineDispatcher, PipelineGraph, PipelineSpec};
use crate::stream::{BufferQueue, Stream, StreamConfig, StreamContext, StreamIntent, StreamState};
use crate::sync::lock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Session-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// How long stopping a stream waits for its buffers to come back.
    pub stop_timeout: Duration,
    /// Purge message groups that stay incomplete this long. `None` waits
    /// forever.
    pub message_eviction: Option<Duration>,
    /// Prefix for every worker thread name.
    pub worker_name_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(2),
            message_eviction: None,
            worker_name_prefix: "campipe".to_string(),
        }
    }
}

impl SessionConfig {
    /// Set the stop timeout.
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Enable eviction of incomplete message groups.
    pub fn message_eviction(mut self, age: Duration) -> Self {
        self.message_eviction = Some(age);
        self
    }

    /// Set the worker thread name prefix.
    pub fn worker_name_prefix(mut self, prefix: &str) -> Self {
        self.worker_name_prefix = prefix.to_string();
        self
    }
}

/// One merged capture event, reported once every owner has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureNotification {
    /// Event kind.
    pub kind: MessageKind,
    /// Capture the event belongs to.
    pub capture_id: CaptureId,
    /// Shared event timestamp.
    pub timestamp: ClockTime,
    /// Reporting streams, in arrival order.
    pub streams: Vec<StreamId>,
    /// Buffer status per reporting stream.
    pub statuses: Vec<BufferStatus>,
}

impl CaptureNotification {
    fn from_group(kind: MessageKind, group: Vec<CaptureMessage>) -> Option<Self> {
        let first = group.first()?;
        Some(Self {
            kind,
            capture_id: first.capture_id,
            timestamp: first.timestamp,
            streams: group.iter().map(|m| m.stream_id).collect(),
            statuses: group.iter().map(|m| m.status).collect(),
        })
    }

    /// Whether every stream reported OK.
    pub fn is_ok(&self) -> bool {
        self.statuses.iter().all(|s| *s == BufferStatus::Ok)
    }
}

/// Streams, their shared pipeline and the capture requests issued on them.
pub struct CaptureSession {
    spec: PipelineSpec,
    factory: NodeFactory,
    context: StreamContext,
    offline: OfflineManager,
    streams: Mutex<BTreeMap<StreamId, Arc<Stream>>>,
    captures: Mutex<HashMap<CaptureId, Weak<CaptureRequest>>>,
    next_stream: AtomicU32,
    next_capture: AtomicU64,
    notifications: kanal::Receiver<CaptureNotification>,
    shut_down: AtomicBool,
}

impl CaptureSession {
    /// Create a session with the built-in node processors.
    pub fn new(config: SessionConfig, spec: PipelineSpec) -> Result<Self> {
        Self::with_factory(config, spec, NodeFactory::new())
    }

    /// Create a session building nodes with `factory`.
    pub fn with_factory(config: SessionConfig, spec: PipelineSpec, factory: NodeFactory) -> Result<Self> {
        observability::init_metrics();
        let (tx, rx) = kanal::unbounded::<CaptureNotification>();
        let merge = Box::new(move |kind: MessageKind, group: Vec<CaptureMessage>| {
            if let Some(note) = CaptureNotification::from_group(kind, group) {
                let _ = tx.send(note);
            }
        });
        let messages = CaptureMessageOperator::with_eviction(
            merge,
            config.message_eviction,
            &format!("{}-msg", config.worker_name_prefix),
        )?;

        let context = StreamContext {
            registry: Arc::new(AllocatorRegistry::with_defaults()?),
            manager: Arc::new(BufferManager::new()),
            dispatcher: Arc::new(PipelineDispatcher::new(&config.worker_name_prefix)),
            messages: Arc::new(messages),
            stop_timeout: config.stop_timeout,
            thread_prefix: config.worker_name_prefix.clone(),
        };
        tracing::debug!(modes = ?spec.modes(), "capture session created");

        Ok(Self {
            spec,
            factory,
            context,
            offline: OfflineManager::new(),
            streams: Mutex::new(BTreeMap::new()),
            captures: Mutex::new(HashMap::new()),
            next_stream: AtomicU32::new(0),
            next_capture: AtomicU64::new(1),
            notifications: rx,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Create an idle stream.
    pub fn create_stream(&self, intent: StreamIntent) -> StreamId {
        let id = StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed));
        let stream = Stream::new(id, intent, self.context.clone());
        lock(&self.streams).insert(id, stream);
        tracing::debug!(stream = %id, %intent, "stream created");
        id
    }

    /// Look up a stream.
    pub fn stream(&self, id: StreamId) -> Option<Arc<Stream>> {
        lock(&self.streams).get(&id).cloned()
    }

    fn require(&self, id: StreamId) -> Result<Arc<Stream>> {
        self.stream(id)
            .ok_or_else(|| Error::NotFound(format!("no stream {}", id)))
    }

    /// Ids of every live stream.
    pub fn stream_ids(&self) -> Vec<StreamId> {
        lock(&self.streams).keys().copied().collect()
    }

    /// Commit a configuration, flushing any offline pipeline the stream left.
    pub fn commit_stream(&self, id: StreamId, config: StreamConfig) -> Result<()> {
        let stream = self.require(id)?;
        if self.offline.remove(id) {
            tracing::debug!(stream = %id, "offline pipeline flushed on recommit");
        }
        stream.commit(config)
    }

    /// Build the graph of `mode` and install it in the dispatcher.
    ///
    /// Sinks are bound to the live stream of their intent.
    pub fn build_pipeline(&self, mode: &str) -> Result<()> {
        let graph_spec = self
            .spec
            .mode(mode)
            .ok_or_else(|| Error::NotFound(format!("no pipeline mode '{}'", mode)))?;

        let streams: Vec<Arc<Stream>> = lock(&self.streams).values().cloned().collect();
        if let Some(busy) = streams.iter().find(|s| s.state() == StreamState::Busy) {
            return Err(Error::state(format!(
                "cannot rebuild the pipeline while {} is busy",
                busy.id()
            )));
        }

        let mut bindings = HashMap::new();
        for stream in &streams {
            if let Some(previous) = bindings.insert(stream.intent(), stream.id()) {
                tracing::warn!(
                    intent = %stream.intent(),
                    replaced = %previous,
                    stream = %stream.id(),
                    "several streams share an intent, binding the newest"
                );
            }
        }

        let graph = PipelineGraph::build(mode, graph_spec, &self.factory, &bindings)?;
        tracing::debug!(
            mode,
            nodes = graph.node_count(),
            links = graph.edge_count(),
            "pipeline built"
        );
        self.context.dispatcher.update(graph)
    }

    /// Release a stream and everything it holds.
    pub fn release_stream(&self, id: StreamId) -> Result<()> {
        let stream = lock(&self.streams)
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("no stream {}", id)))?;
        self.offline.remove(id);
        stream.release()
    }

    /// Attach a buffer-queue endpoint to a tunnel-mode stream.
    pub fn attach_tunnel(&self, id: StreamId, queue: Arc<dyn BufferQueue>) -> Result<()> {
        self.require(id)?.attach_tunnel(queue)
    }

    /// Detach a stream's buffer-queue endpoint.
    pub fn detach_tunnel(&self, id: StreamId) -> Result<Option<Arc<dyn BufferQueue>>> {
        self.require(id)?.detach_tunnel()
    }

    /// Issue one capture request across `streams`.
    ///
    /// # Errors
    ///
    /// Fails for an empty or duplicated stream list, an unknown stream, or a
    /// stream that cannot accept requests; the request is then cancelled on
    /// every stream that already queued it.
    pub fn capture(&self, streams: &[StreamId], options: CaptureOptions) -> Result<CaptureId> {
        if streams.is_empty() {
            return Err(Error::InvalidConfig("capture needs at least one stream".into()));
        }
        let mut owners: Vec<Arc<Stream>> = Vec::with_capacity(streams.len());
        for id in streams {
            if owners.iter().any(|s| s.id() == *id) {
                return Err(Error::InvalidConfig(format!("{} listed twice", id)));
            }
            owners.push(self.require(*id)?);
        }

        let id = CaptureId(self.next_capture.fetch_add(1, Ordering::Relaxed));
        let request = CaptureRequest::new(id, owners.len(), options);
        for stream in &owners {
            let owner: Arc<dyn RequestOwner> = stream.clone();
            request.add_owner(&owner);
        }

        for stream in &owners {
            if let Err(err) = stream.add_request(request.clone()) {
                tracing::warn!(capture = %id, stream = %stream.id(), %err, "capture rejected");
                request.cancel();
                return Err(err);
            }
        }

        let mut captures = lock(&self.captures);
        captures.retain(|_, r| r.strong_count() > 0);
        captures.insert(id, Arc::downgrade(&request));
        drop(captures);

        tracing::debug!(capture = %id, streams = ?streams, kind = ?options.kind, "capture issued");
        Ok(id)
    }

    /// Cancel a capture, live or offline.
    ///
    /// # Errors
    ///
    /// `NotFound` if no stream or offline pipeline still holds the capture.
    pub fn cancel_capture(&self, id: CaptureId) -> Result<()> {
        let live = lock(&self.captures).remove(&id).and_then(|r| r.upgrade());
        let found_live = match live {
            Some(request) => {
                request.cancel();
                true
            }
            None => false,
        };
        let found_offline = self.offline.cancel_capture(id);
        if !found_live && !found_offline {
            return Err(Error::NotFound(format!("no pending {}", id)));
        }
        tracing::debug!(capture = %id, found_live, found_offline, "capture cancelled");
        Ok(())
    }

    /// Take a still stream offline, keeping its in-transit captures running.
    pub fn switch_to_offline(&self, id: StreamId) -> Result<()> {
        let stream = self.require(id)?;
        let pipeline = stream.change_to_offline()?;
        self.offline.insert(pipeline);
        Ok(())
    }

    /// Captures still cached by `id`'s offline pipeline.
    pub fn offline_captures(&self, id: StreamId) -> Vec<CaptureId> {
        self.offline.cached_ids(id)
    }

    /// Flush offline pipelines whose work has drained.
    pub fn reap_offline(&self) -> usize {
        self.offline.reap_idle()
    }

    /// Stop a stream; it needs a recommit to accept requests again.
    pub fn stop_stream(&self, id: StreamId) -> Result<()> {
        self.require(id)?.stop_stream()
    }

    /// Merged capture events.
    pub fn notifications(&self) -> kanal::Receiver<CaptureNotification> {
        self.notifications.clone()
    }

    /// Release every stream and stop every worker. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let streams: Vec<Arc<Stream>> = {
            let mut streams = lock(&self.streams);
            let all = streams.values().cloned().collect();
            streams.clear();
            all
        };
        for stream in streams {
            if let Err(err) = stream.release() {
                tracing::warn!(stream = %stream.id(), %err, "stream release failed");
            }
        }
        self.offline.clear();
        self.context.messages.shutdown();
        self.context.dispatcher.shutdown();
        self.context.manager.clear();
        lock(&self.captures).clear();
        tracing::debug!("capture session shut down");
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("streams", &self.stream_ids())
            .field("offline", &self.offline.len())
            .finish()
    }
}
