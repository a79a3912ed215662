//! Per-stream node sequencing and buffer execution.
//!
//! [`PipelineDispatcher::update`] walks back from every stream-bound sink
//! to build that stream's node sequence, ordered source-first. Lifecycle
//! calls then fan out across the sequence:
//!
//! | Operation | Order |
//! |-----------|-------|
//! | `prepare`, `start`, `config`, `flush`, `stop` | source first |
//! | `capture`, `cancel_capture` | sink first |
//!
//! Buffers delivered by a stream wait at the sequence's source until a
//! capture claims one. The claimed buffer then runs through every node's
//! `process` on the stream's own pipeline worker thread and is handed to the
//! stream's result callback.

use super::graph::{NodeId, PipelineGraph};
use super::node::{CaptureParams, NodeKind, NodeProcessor};
use crate::buffer::{Buffer, BufferStatus, CaptureId, StreamId};
use crate::clock;
use crate::error::{Error, Result};
use crate::observability;
use crate::sync::lock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Receives every buffer leaving a stream's sequence.
pub type ResultCallback = Arc<dyn Fn(Buffer) + Send + Sync>;

/// A node found by [`PipelineDispatcher::get_node`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    /// Node id in the current graph.
    pub id: NodeId,
    /// Node name.
    pub name: String,
    /// Node role.
    pub kind: NodeKind,
}

enum Job {
    Run {
        graph: Arc<PipelineGraph>,
        nodes: Arc<[NodeId]>,
        buffer: Buffer,
    },
    Stop,
}

struct Worker {
    jobs: kanal::Sender<Job>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn stop(self, stream: StreamId) {
        let _ = self.jobs.send(Job::Stop);
        if self.handle.join().is_err() {
            tracing::error!(%stream, "pipeline worker panicked");
        }
    }
}

struct Sequence {
    nodes: Arc<[NodeId]>,
    pending: VecDeque<Buffer>,
    worker: Option<Worker>,
    frame_number: u64,
}

#[derive(Default)]
struct Shared {
    callbacks: Mutex<HashMap<StreamId, ResultCallback>>,
    cancelled: Mutex<HashSet<(StreamId, CaptureId)>>,
}

impl Shared {
    fn emit(&self, stream: StreamId, buffer: Buffer) {
        let callback = lock(&self.callbacks).get(&stream).cloned();
        match callback {
            Some(callback) => callback(buffer),
            None => tracing::warn!(
                %stream,
                index = buffer.index(),
                "no result callback registered, buffer discarded"
            ),
        }
    }

    fn is_cancelled(&self, stream: StreamId, capture: CaptureId) -> bool {
        lock(&self.cancelled).contains(&(stream, capture))
    }
}

/// Fans lifecycle operations across each stream's node sequence.
pub struct PipelineDispatcher {
    graph: Mutex<Option<Arc<PipelineGraph>>>,
    sequences: Mutex<HashMap<StreamId, Sequence>>,
    shared: Arc<Shared>,
    next_sequence: AtomicU64,
    thread_prefix: String,
}

impl PipelineDispatcher {
    /// Create a dispatcher; worker threads are named `<prefix>-pipe-<stream>`.
    pub fn new(thread_prefix: &str) -> Self {
        Self {
            graph: Mutex::new(None),
            sequences: Mutex::new(HashMap::new()),
            shared: Arc::new(Shared::default()),
            next_sequence: AtomicU64::new(0),
            thread_prefix: thread_prefix.to_string(),
        }
    }

    /// Install a new graph and rebuild every stream's sequence.
    ///
    /// Workers of the previous graph are drained and stopped; buffers still
    /// waiting at a source come back with `Drop` status.
    pub fn update(&self, graph: PipelineGraph) -> Result<()> {
        let mut fresh: HashMap<StreamId, Sequence> = HashMap::new();
        for sink in graph.sinks() {
            let Some(stream) = graph.node(sink).and_then(|n| n.stream()) else {
                continue;
            };
            if fresh.contains_key(&stream) {
                return Err(Error::pipeline(format!(
                    "{} is bound to more than one sink",
                    stream
                )));
            }
            let nodes: Arc<[NodeId]> = graph.sequence_to(sink).into();
            fresh.insert(
                stream,
                Sequence {
                    nodes,
                    pending: VecDeque::new(),
                    worker: None,
                    frame_number: 0,
                },
            );
        }

        tracing::debug!(
            mode = graph.mode(),
            streams = fresh.len(),
            "dispatcher updated"
        );

        let old = {
            let mut sequences = lock(&self.sequences);
            *lock(&self.graph) = Some(Arc::new(graph));
            std::mem::replace(&mut *sequences, fresh)
        };
        for (stream, sequence) in old {
            self.retire(stream, sequence);
        }
        Ok(())
    }

    fn retire(&self, stream: StreamId, mut sequence: Sequence) {
        if let Some(worker) = sequence.worker.take() {
            worker.stop(stream);
        }
        for mut buffer in sequence.pending.drain(..) {
            buffer.set_status(BufferStatus::Drop);
            self.shared.emit(stream, buffer);
        }
    }

    /// Streams with a sequence in the current graph.
    pub fn streams(&self) -> Vec<StreamId> {
        let mut streams: Vec<_> = lock(&self.sequences).keys().copied().collect();
        streams.sort();
        streams
    }

    /// Whether `stream` has a sequence.
    pub fn contains(&self, stream: StreamId) -> bool {
        lock(&self.sequences).contains_key(&stream)
    }

    /// Node names of `stream`'s sequence, source first.
    pub fn sequence(&self, stream: StreamId) -> Option<Vec<String>> {
        let (graph, nodes) = self.snapshot(stream).ok()?;
        Some(
            nodes
                .iter()
                .filter_map(|id| graph.node(*id))
                .map(|n| n.name().to_string())
                .collect(),
        )
    }

    fn snapshot(&self, stream: StreamId) -> Result<(Arc<PipelineGraph>, Arc<[NodeId]>)> {
        let sequences = lock(&self.sequences);
        let sequence = sequences
            .get(&stream)
            .ok_or_else(|| Error::NotFound(format!("no pipeline sequence for {}", stream)))?;
        let graph = lock(&self.graph)
            .clone()
            .ok_or_else(|| Error::pipeline("no graph installed"))?;
        Ok((graph, sequence.nodes.clone()))
    }

    fn for_each<F>(&self, stream: StreamId, sink_first: bool, op: &str, mut f: F) -> Result<()>
    where
        F: FnMut(&mut dyn NodeProcessor) -> Result<()>,
    {
        let (graph, nodes) = self.snapshot(stream)?;
        let mut visit = |id: &NodeId| -> Result<()> {
            let Some(node) = graph.node(*id) else {
                return Ok(());
            };
            let mut processor = node.processor();
            f(&mut **processor).map_err(|e| {
                Error::pipeline(format!("{} failed at node '{}': {}", op, node.name(), e))
            })
        };
        if sink_first {
            nodes.iter().rev().try_for_each(&mut visit)
        } else {
            nodes.iter().try_for_each(&mut visit)
        }
    }

    /// Allocate node resources, source first.
    pub fn prepare(&self, stream: StreamId) -> Result<()> {
        self.for_each(stream, false, "prepare", |p| p.prepare(stream))
    }

    /// Start every node, source first, and the stream's pipeline worker.
    pub fn start(&self, stream: StreamId) -> Result<()> {
        self.for_each(stream, false, "start", |p| p.start(stream))?;
        self.ensure_worker(stream)
    }

    /// Push per-capture parameters, source first.
    pub fn config(&self, stream: StreamId, params: &CaptureParams) -> Result<()> {
        self.for_each(stream, false, "config", |p| p.config(params))
    }

    /// Issue a capture, sink first, and send one waiting buffer through the
    /// sequence.
    ///
    /// # Errors
    ///
    /// Fails if no buffer was delivered to the sequence's source.
    pub fn capture(&self, stream: StreamId, capture: CaptureId) -> Result<()> {
        self.for_each(stream, true, "capture", |p| p.capture(stream, capture))?;
        self.ensure_worker(stream)?;

        let graph = lock(&self.graph)
            .clone()
            .ok_or_else(|| Error::pipeline("no graph installed"))?;
        let mut sequences = lock(&self.sequences);
        let sequence = sequences
            .get_mut(&stream)
            .ok_or_else(|| Error::NotFound(format!("no pipeline sequence for {}", stream)))?;
        let mut buffer = sequence
            .pending
            .pop_front()
            .ok_or_else(|| Error::pipeline(format!("no buffer delivered for {}", stream)))?;

        sequence.frame_number += 1;
        buffer.set_capture_id(Some(capture));
        buffer.set_stream_id(Some(stream));
        buffer.set_frame_number(sequence.frame_number);
        buffer.set_sequence(self.next_sequence.fetch_add(1, Ordering::Relaxed));
        buffer.set_timestamp(clock::now());

        tracing::trace!(
            %stream,
            %capture,
            frame = sequence.frame_number,
            index = buffer.index(),
            "buffer submitted"
        );

        let job = Job::Run {
            graph,
            nodes: sequence.nodes.clone(),
            buffer,
        };
        match sequence.worker.as_ref() {
            Some(worker) => worker
                .jobs
                .send(job)
                .map_err(|_| Error::pipeline(format!("pipeline worker for {} has exited", stream))),
            None => Err(Error::pipeline(format!("no pipeline worker for {}", stream))),
        }
    }

    /// Cancel a capture, sink first.
    ///
    /// Buffers of the capture still in flight come back with `Drop` status.
    pub fn cancel_capture(&self, stream: StreamId, capture: CaptureId) -> Result<()> {
        lock(&self.shared.cancelled).insert((stream, capture));
        self.for_each(stream, true, "cancel", |p| p.cancel_capture(stream, capture))
    }

    /// Flush every node, source first, and hand back waiting buffers with
    /// `Drop` status.
    pub fn flush(&self, stream: StreamId) -> Result<()> {
        let hooks = self.for_each(stream, false, "flush", |p| p.flush(stream));
        let returned = self.return_pending(stream);
        tracing::debug!(%stream, returned, "pipeline flushed");
        hooks
    }

    /// Hand buffers waiting at `stream`'s source back to the result callback
    /// with `Drop` status, without running any node hook.
    ///
    /// Returns how many buffers were handed back.
    pub fn return_pending(&self, stream: StreamId) -> usize {
        let pending: Vec<Buffer> = lock(&self.sequences)
            .get_mut(&stream)
            .map(|s| s.pending.drain(..).collect())
            .unwrap_or_default();
        let returned = pending.len();
        for mut buffer in pending {
            buffer.set_status(BufferStatus::Drop);
            self.shared.emit(stream, buffer);
        }
        returned
    }

    /// Stop every node, source first, then drain and stop the worker.
    pub fn stop(&self, stream: StreamId) -> Result<()> {
        let hooks = self.for_each(stream, false, "stop", |p| p.stop(stream));

        let worker = lock(&self.sequences)
            .get_mut(&stream)
            .and_then(|s| s.worker.take());
        if let Some(worker) = worker {
            worker.stop(stream);
        }
        lock(&self.shared.cancelled).retain(|(s, _)| *s != stream);
        hooks
    }

    /// Drop `stream`'s sequence and result callback.
    ///
    /// Unknown streams are ignored.
    pub fn destroy(&self, stream: StreamId) {
        let sequence = lock(&self.sequences).remove(&stream);
        if let Some(sequence) = sequence {
            self.retire(stream, sequence);
            tracing::debug!(%stream, "pipeline sequence destroyed");
        }
        lock(&self.shared.callbacks).remove(&stream);
        lock(&self.shared.cancelled).retain(|(s, _)| *s != stream);
    }

    /// Queue a buffer at the source of `stream`'s sequence.
    ///
    /// # Errors
    ///
    /// Without a sequence the buffer is handed straight back to the result
    /// callback with `Drop` status and `NotFound` is returned.
    pub fn deliver_buffer(&self, stream: StreamId, mut buffer: Buffer) -> Result<()> {
        {
            let mut sequences = lock(&self.sequences);
            if let Some(sequence) = sequences.get_mut(&stream) {
                sequence.pending.push_back(buffer);
                return Ok(());
            }
        }
        buffer.set_status(BufferStatus::Drop);
        self.shared.emit(stream, buffer);
        Err(Error::NotFound(format!("no pipeline sequence for {}", stream)))
    }

    /// Buffers waiting at `stream`'s source.
    pub fn pending_count(&self, stream: StreamId) -> usize {
        lock(&self.sequences)
            .get(&stream)
            .map_or(0, |s| s.pending.len())
    }

    /// Node of `stream`'s sequence whose name starts with `prefix`, nearest
    /// the sink when several match.
    pub fn get_node(&self, stream: StreamId, prefix: &str) -> Option<NodeRef> {
        let (graph, nodes) = self.snapshot(stream).ok()?;
        nodes.iter().rev().find_map(|id| {
            let node = graph.node(*id)?;
            node.name().starts_with(prefix).then(|| NodeRef {
                id: *id,
                name: node.name().to_string(),
                kind: node.kind(),
            })
        })
    }

    /// Route buffers leaving `stream`'s sequence to `callback`.
    ///
    /// Replaces any previous callback; buffers already in flight go to the
    /// new one.
    pub fn set_result_callback(&self, stream: StreamId, callback: ResultCallback) {
        lock(&self.shared.callbacks).insert(stream, callback);
    }

    /// Remove `stream`'s result callback.
    pub fn clear_result_callback(&self, stream: StreamId) {
        lock(&self.shared.callbacks).remove(&stream);
    }

    /// Remove `stream`'s result callback only if it is still `callback`.
    ///
    /// Returns `true` if it was removed.
    pub fn clear_result_callback_if(&self, stream: StreamId, callback: &ResultCallback) -> bool {
        let mut callbacks = lock(&self.shared.callbacks);
        match callbacks.get(&stream) {
            Some(current) if Arc::ptr_eq(current, callback) => {
                callbacks.remove(&stream);
                true
            }
            _ => false,
        }
    }

    /// Whether `stream` has a result callback.
    pub fn has_result_callback(&self, stream: StreamId) -> bool {
        lock(&self.shared.callbacks).contains_key(&stream)
    }

    fn ensure_worker(&self, stream: StreamId) -> Result<()> {
        let mut sequences = lock(&self.sequences);
        let sequence = sequences
            .get_mut(&stream)
            .ok_or_else(|| Error::NotFound(format!("no pipeline sequence for {}", stream)))?;
        if sequence.worker.is_some() {
            return Ok(());
        }

        let (jobs, rx) = kanal::unbounded::<Job>();
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{}-pipe-{}", self.thread_prefix, stream.0))
            .spawn(move || run_worker(stream, rx, shared))?;
        sequence.worker = Some(Worker { jobs, handle });
        tracing::debug!(%stream, "pipeline worker started");
        Ok(())
    }

    /// Destroy every sequence.
    pub fn shutdown(&self) {
        let sequences: Vec<_> = lock(&self.sequences).drain().collect();
        for (stream, sequence) in sequences {
            self.retire(stream, sequence);
        }
        lock(&self.shared.callbacks).clear();
        lock(&self.shared.cancelled).clear();
    }
}

impl Default for PipelineDispatcher {
    fn default() -> Self {
        Self::new("campipe")
    }
}

impl Drop for PipelineDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for PipelineDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineDispatcher")
            .field("streams", &self.streams())
            .finish()
    }
}

fn run_worker(stream: StreamId, jobs: kanal::Receiver<Job>, shared: Arc<Shared>) {
    let span = observability::span_pipeline_worker(stream);
    let _guard = span.enter();

    while let Ok(job) = jobs.recv() {
        let Job::Run {
            graph,
            nodes,
            mut buffer,
        } = job
        else {
            break;
        };

        for id in nodes.iter() {
            let Some(node) = graph.node(*id) else {
                continue;
            };
            if let Err(e) = node.processor().process(&mut buffer) {
                tracing::warn!(node = node.name(), error = %e, "node failed, dropping buffer");
                buffer.set_status(BufferStatus::Drop);
                break;
            }
        }

        if let Some(capture) = buffer.capture_id() {
            if shared.is_cancelled(stream, capture) {
                buffer.set_status(BufferStatus::Drop);
            }
        }
        shared.emit(stream, buffer);
    }
    tracing::debug!("pipeline worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferLayout, BufferUsage, PixelFormat};
    use crate::pipeline::factory::NodeFactory;
    use crate::pipeline::spec::{GraphSpec, NodeSpec};
    use crate::stream::StreamIntent;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: String,
        log: Log,
    }

    impl NodeProcessor for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn start(&mut self, _stream: StreamId) -> Result<()> {
            lock(&self.log).push(format!("start:{}", self.name));
            Ok(())
        }

        fn capture(&mut self, _stream: StreamId, _capture: CaptureId) -> Result<()> {
            lock(&self.log).push(format!("capture:{}", self.name));
            Ok(())
        }

        fn process(&mut self, _buffer: &mut Buffer) -> Result<()> {
            lock(&self.log).push(format!("process:{}", self.name));
            Ok(())
        }
    }

    fn recording_factory(log: &Log) -> NodeFactory {
        let mut factory = NodeFactory::new();
        let log = log.clone();
        factory.register("recorder", move |spec| {
            Ok(Box::new(Recorder {
                name: spec.name.clone(),
                log: log.clone(),
            }))
        });
        factory
    }

    fn linear_graph(factory: &NodeFactory) -> PipelineGraph {
        let spec = GraphSpec::new()
            .node(NodeSpec::source("A", "recorder"))
            .node(NodeSpec::process("B", "recorder"))
            .node(NodeSpec::sink("Sink", "recorder", StreamIntent::Still))
            .link("A", "B")
            .link("B", "Sink");
        let streams = HashMap::from([(StreamIntent::Still, StreamId(1))]);
        PipelineGraph::build("still", &spec, factory, &streams).unwrap()
    }

    fn buffer() -> Buffer {
        Buffer::new(
            BufferLayout::new(4, 4, PixelFormat::Nv12, BufferUsage::CPU_READ),
            None,
        )
    }

    fn collector(dispatcher: &PipelineDispatcher, stream: StreamId) -> kanal::Receiver<Buffer> {
        let (tx, rx) = kanal::unbounded();
        dispatcher.set_result_callback(
            stream,
            Arc::new(move |buffer| {
                let _ = tx.send(buffer);
            }),
        );
        rx
    }

    #[test]
    fn test_sequence_and_traversal_order() {
        let log: Log = Arc::default();
        let dispatcher = PipelineDispatcher::default();
        dispatcher.update(linear_graph(&recording_factory(&log))).unwrap();
        let stream = StreamId(1);
        let _rx = collector(&dispatcher, stream);

        assert_eq!(
            dispatcher.sequence(stream).unwrap(),
            vec!["A", "B", "Sink"]
        );

        dispatcher.start(stream).unwrap();
        dispatcher.deliver_buffer(stream, buffer()).unwrap();
        dispatcher.capture(stream, CaptureId(1)).unwrap();
        dispatcher.stop(stream).unwrap();

        let log = lock(&log).clone();
        let starts: Vec<_> = log.iter().filter(|l| l.starts_with("start:")).collect();
        let captures: Vec<_> = log.iter().filter(|l| l.starts_with("capture:")).collect();
        assert_eq!(starts, vec!["start:A", "start:B", "start:Sink"]);
        assert_eq!(captures, vec!["capture:Sink", "capture:B", "capture:A"]);
    }

    #[test]
    fn test_capture_runs_buffer_through_nodes() {
        let log: Log = Arc::default();
        let dispatcher = PipelineDispatcher::default();
        dispatcher.update(linear_graph(&recording_factory(&log))).unwrap();
        let stream = StreamId(1);
        let rx = collector(&dispatcher, stream);

        dispatcher.start(stream).unwrap();
        dispatcher.deliver_buffer(stream, buffer()).unwrap();
        assert_eq!(dispatcher.pending_count(stream), 1);
        dispatcher.capture(stream, CaptureId(9)).unwrap();

        let out = rx.recv().unwrap();
        assert_eq!(out.capture_id(), Some(CaptureId(9)));
        assert_eq!(out.stream_id(), Some(stream));
        assert_eq!(out.frame_number(), 1);
        assert_eq!(out.status(), BufferStatus::Ok);
        assert!(lock(&log).iter().any(|l| l == "process:Sink"));
    }

    #[test]
    fn test_capture_without_buffer_fails() {
        let dispatcher = PipelineDispatcher::default();
        dispatcher
            .update(linear_graph(&recording_factory(&Arc::default())))
            .unwrap();
        assert!(dispatcher.capture(StreamId(1), CaptureId(1)).is_err());
    }

    #[test]
    fn test_flush_returns_pending_as_dropped() {
        let dispatcher = PipelineDispatcher::default();
        dispatcher
            .update(linear_graph(&recording_factory(&Arc::default())))
            .unwrap();
        let stream = StreamId(1);
        let rx = collector(&dispatcher, stream);

        dispatcher.deliver_buffer(stream, buffer()).unwrap();
        dispatcher.deliver_buffer(stream, buffer()).unwrap();
        dispatcher.flush(stream).unwrap();

        for _ in 0..2 {
            assert_eq!(rx.recv().unwrap().status(), BufferStatus::Drop);
        }
        assert_eq!(dispatcher.pending_count(stream), 0);
    }

    #[test]
    fn test_cancelled_capture_comes_back_dropped() {
        let dispatcher = PipelineDispatcher::default();
        dispatcher
            .update(linear_graph(&recording_factory(&Arc::default())))
            .unwrap();
        let stream = StreamId(1);
        let rx = collector(&dispatcher, stream);

        dispatcher.start(stream).unwrap();
        dispatcher.cancel_capture(stream, CaptureId(4)).unwrap();
        dispatcher.deliver_buffer(stream, buffer()).unwrap();
        dispatcher.capture(stream, CaptureId(4)).unwrap();

        let out = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(out.status(), BufferStatus::Drop);
    }

    #[test]
    fn test_clear_result_callback_only_if_current() {
        let dispatcher = PipelineDispatcher::default();
        let stream = StreamId(2);
        let first: ResultCallback = Arc::new(|_| {});
        let second: ResultCallback = Arc::new(|_| {});

        dispatcher.set_result_callback(stream, first.clone());
        dispatcher.set_result_callback(stream, second.clone());
        assert!(!dispatcher.clear_result_callback_if(stream, &first));
        assert!(dispatcher.has_result_callback(stream));
        assert!(dispatcher.clear_result_callback_if(stream, &second));
        assert!(!dispatcher.has_result_callback(stream));
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let dispatcher = PipelineDispatcher::default();
        dispatcher
            .update(linear_graph(&recording_factory(&Arc::default())))
            .unwrap();
        dispatcher.destroy(StreamId(1));
        dispatcher.destroy(StreamId(1));
        dispatcher.destroy(StreamId(42));
        assert!(dispatcher.streams().is_empty());
    }

    #[test]
    fn test_deliver_to_unknown_stream_returns_buffer() {
        let dispatcher = PipelineDispatcher::default();
        let rx = collector(&dispatcher, StreamId(3));
        assert!(dispatcher.deliver_buffer(StreamId(3), buffer()).is_err());
        assert_eq!(rx.recv().unwrap().status(), BufferStatus::Drop);
    }

    #[test]
    fn test_get_node_prefers_nearest_sink() {
        let spec = GraphSpec::new()
            .node(NodeSpec::source("sensor", "passthrough"))
            .node(NodeSpec::process("scale_1", "passthrough"))
            .node(NodeSpec::process("scale_2", "passthrough"))
            .node(NodeSpec::sink("out", "passthrough", StreamIntent::Preview))
            .link("sensor", "scale_1")
            .link("scale_1", "scale_2")
            .link("scale_2", "out");
        let streams = HashMap::from([(StreamIntent::Preview, StreamId(0))]);
        let graph = PipelineGraph::build("p", &spec, &NodeFactory::new(), &streams).unwrap();

        let dispatcher = PipelineDispatcher::default();
        dispatcher.update(graph).unwrap();
        let found = dispatcher.get_node(StreamId(0), "scale").unwrap();
        assert_eq!(found.name, "scale_2");
        assert_eq!(found.kind, NodeKind::Process);
        assert!(dispatcher.get_node(StreamId(0), "jpeg").is_none());
        assert!(dispatcher.get_node(StreamId(7), "scale").is_none());
    }
}
