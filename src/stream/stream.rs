//! Per-stream state machine and request worker.
//!
//! ```text
//!            commit            first request
//!   Idle ─────────────▶ Active ─────────────▶ Busy
//!    ▲                                         │
//!    └──────────────── stop_stream ◀───────────┤
//!                                              │ change_to_offline (still only)
//!                                              ▼
//!                                           Offline
//! ```
//!
//! The worker thread turns queued [`CaptureRequest`]s into pipeline work:
//! dispatch barrier, buffer delivery, node configuration, capture. Results
//! come back on the stream's pipeline worker through
//! [`Stream::handle_result`], which correlates them with the in-transit
//! list, runs the result barrier and recycles the buffer.
//!
//! A continuous request at the head of the queue is re-issued every
//! iteration without being popped, so one-shot requests queued behind it
//! wait until it is cancelled.

use super::config::{StreamConfig, StreamIntent, StreamState};
use super::tunnel::BufferQueue;
use crate::buffer::{Buffer, BufferStatus, StreamId};
use crate::capture::{
    CaptureMessage, CaptureMessageOperator, CaptureRequest, MessageKind, RequestOwner,
};
use crate::clock::{self, ClockTime};
use crate::error::{Error, Result};
use crate::memory::{AllocatorRegistry, BufferManager, BufferPool, PoolConfig};
use crate::observability::{self, StreamMetrics};
use crate::offline::{OfflineForward, OfflinePipeline};
use crate::pipeline::{CaptureParams, PipelineDispatcher, ResultCallback};
use crate::sync::{Timeout, deadline_after, lock, wait, wait_deadline};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// Collaborators shared by every stream of a session.
#[derive(Clone)]
pub struct StreamContext {
    /// Allocators for pool initialization.
    pub registry: Arc<AllocatorRegistry>,
    /// Pool registry.
    pub manager: Arc<BufferManager>,
    /// Node sequences of the current pipeline graph.
    pub dispatcher: Arc<PipelineDispatcher>,
    /// Fan-in of per-stream lifecycle messages.
    pub messages: Arc<CaptureMessageOperator>,
    /// How long `stop_stream` waits for outstanding buffers.
    pub stop_timeout: Duration,
    /// Worker thread name prefix.
    pub thread_prefix: String,
}

#[derive(Default)]
struct RequestQueue {
    waiting: VecDeque<Arc<CaptureRequest>>,
    /// Request the worker is servicing but has not yet put in transit.
    current: Option<Arc<CaptureRequest>>,
}

/// One capture use case: its pool, request queue and worker.
pub struct Stream {
    id: StreamId,
    intent: StreamIntent,
    context: StreamContext,
    me: Weak<Stream>,
    state: Mutex<StreamState>,
    config: Mutex<Option<StreamConfig>>,
    pool: Mutex<Arc<BufferPool>>,
    tunnel: Mutex<Option<Arc<dyn BufferQueue>>>,
    queue: Mutex<RequestQueue>,
    work: Condvar,
    in_transit: Mutex<Vec<Arc<CaptureRequest>>>,
    outstanding: Mutex<usize>,
    returned: Condvar,
    exit: AtomicBool,
    first_pending: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    metrics: StreamMetrics,
}

impl Stream {
    /// Create an idle stream with a fresh, uninitialized pool.
    pub fn new(id: StreamId, intent: StreamIntent, context: StreamContext) -> Arc<Self> {
        let pool = context.manager.create_pool();
        Arc::new_cyclic(|me| Self {
            id,
            intent,
            context,
            me: me.clone(),
            state: Mutex::new(StreamState::Idle),
            config: Mutex::new(None),
            pool: Mutex::new(pool),
            tunnel: Mutex::new(None),
            queue: Mutex::new(RequestQueue::default()),
            work: Condvar::new(),
            in_transit: Mutex::new(Vec::new()),
            outstanding: Mutex::new(0),
            returned: Condvar::new(),
            exit: AtomicBool::new(false),
            first_pending: AtomicBool::new(false),
            worker: Mutex::new(None),
            metrics: StreamMetrics::new(id),
        })
    }

    /// Stream id.
    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Use case.
    #[inline]
    pub fn intent(&self) -> StreamIntent {
        self.intent
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        *lock(&self.state)
    }

    /// Committed configuration.
    pub fn config(&self) -> Option<StreamConfig> {
        *lock(&self.config)
    }

    /// The stream's current pool.
    pub fn pool(&self) -> Arc<BufferPool> {
        lock(&self.pool).clone()
    }

    /// Whether a tunnel endpoint is attached.
    pub fn has_tunnel(&self) -> bool {
        lock(&self.tunnel).is_some()
    }

    /// Requests queued and not yet dispatched.
    pub fn waiting_count(&self) -> usize {
        lock(&self.queue).waiting.len()
    }

    /// Dispatched requests still waiting for their result.
    pub fn in_transit_count(&self) -> usize {
        lock(&self.in_transit).len()
    }

    /// Buffers handed to the pipeline and not yet back.
    pub fn outstanding_buffers(&self) -> usize {
        *lock(&self.outstanding)
    }

    /// Commit a configuration: size the pool and register for results.
    ///
    /// Valid from every state but `Busy`.
    pub fn commit(&self, config: StreamConfig) -> Result<()> {
        config.validate()?;

        let mut state = lock(&self.state);
        if *state == StreamState::Busy {
            return Err(Error::state(format!("cannot commit {} while busy", self.id)));
        }

        self.pool()
            .init(PoolConfig::from(&config), &self.context.registry)?;
        if config.tunnel_mode {
            if let Some(tunnel) = lock(&self.tunnel).as_ref() {
                tunnel.set_buffer_count(config.buffer_count)?;
            }
        }

        let me = self.me.clone();
        let callback: ResultCallback = Arc::new(move |buffer| match me.upgrade() {
            Some(stream) => stream.handle_result(buffer),
            None => tracing::trace!("stream gone, result buffer released"),
        });
        self.context.dispatcher.set_result_callback(self.id, callback);

        *lock(&self.config) = Some(config);
        *state = StreamState::Active;
        tracing::debug!(
            stream = %self.id,
            intent = %self.intent,
            width = config.width,
            height = config.height,
            buffers = config.buffer_count,
            tunnel = config.tunnel_mode,
            "stream committed"
        );
        Ok(())
    }

    /// Attach the external buffer-queue endpoint used in tunnel mode.
    pub fn attach_tunnel(&self, queue: Arc<dyn BufferQueue>) -> Result<()> {
        let state = lock(&self.state);
        if *state == StreamState::Busy {
            return Err(Error::state(format!(
                "cannot attach a tunnel to {} while busy",
                self.id
            )));
        }
        if let Some(config) = *lock(&self.config) {
            queue.set_buffer_count(config.buffer_count)?;
        }
        *lock(&self.tunnel) = Some(queue);
        tracing::debug!(stream = %self.id, "tunnel attached");
        Ok(())
    }

    /// Detach the tunnel endpoint, returning it.
    pub fn detach_tunnel(&self) -> Result<Option<Arc<dyn BufferQueue>>> {
        let state = lock(&self.state);
        if *state == StreamState::Busy {
            return Err(Error::state(format!(
                "cannot detach the tunnel of {} while busy",
                self.id
            )));
        }
        Ok(lock(&self.tunnel).take())
    }

    /// Queue a request; the first one starts the worker.
    ///
    /// # Errors
    ///
    /// Fails unless the stream is `Active` or `Busy`, or if the worker
    /// cannot be started.
    pub fn add_request(&self, request: Arc<CaptureRequest>) -> Result<()> {
        let state = self.state();
        if !matches!(state, StreamState::Active | StreamState::Busy) {
            return Err(Error::state(format!(
                "{} cannot accept requests while {:?}",
                self.id, state
            )));
        }

        lock(&self.queue).waiting.push_back(request.clone());
        self.work.notify_all();
        tracing::trace!(stream = %self.id, capture = %request.id(), "request queued");

        if state == StreamState::Active {
            if let Err(err) = self.start_stream() {
                self.discard(&request);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Start the pipeline and spawn the worker. No-op while `Busy`.
    pub fn start_stream(&self) -> Result<()> {
        let mut state = lock(&self.state);
        match *state {
            StreamState::Busy => return Ok(()),
            StreamState::Active => {}
            other => {
                return Err(Error::state(format!(
                    "cannot start {} from {:?}",
                    self.id, other
                )));
            }
        }

        let config = (*lock(&self.config))
            .ok_or_else(|| Error::state(format!("{} has no committed configuration", self.id)))?;
        let tunnel = lock(&self.tunnel).clone();
        if config.tunnel_mode && tunnel.is_none() {
            return Err(Error::InvalidConfig(format!(
                "{} is in tunnel mode without an attached buffer queue",
                self.id
            )));
        }
        let this = self
            .me
            .upgrade()
            .ok_or_else(|| Error::state("stream is being dropped"))?;

        self.context.dispatcher.prepare(self.id)?;
        self.context.dispatcher.start(self.id)?;
        self.pool().notify_start();
        if let Some(tunnel) = &tunnel {
            tunnel.start();
        }
        self.exit.store(false, Ordering::SeqCst);
        self.first_pending.store(true, Ordering::SeqCst);

        let handle = std::thread::Builder::new()
            .name(format!("{}-stream-{}", self.context.thread_prefix, self.id.0))
            .spawn(move || this.run())?;
        *lock(&self.worker) = Some(handle);
        *state = StreamState::Busy;
        tracing::debug!(stream = %self.id, "stream started");
        Ok(())
    }

    fn run(&self) {
        let span = observability::span_stream(self.id, self.intent.as_str());
        let _guard = span.enter();
        tracing::debug!("stream worker running");

        while let Some(request) = self.next_request() {
            self.service(&request);
            lock(&self.queue).current = None;
        }
        tracing::debug!("stream worker exiting");
    }

    fn next_request(&self) -> Option<Arc<CaptureRequest>> {
        let mut queue = lock(&self.queue);
        loop {
            if self.exit.load(Ordering::SeqCst) {
                return None;
            }
            queue.waiting.retain(|r| !r.is_cancelled());
            let next = match queue.waiting.front() {
                Some(front) if front.is_continuous() => Some(front.clone()),
                Some(_) => queue.waiting.pop_front(),
                None => None,
            };
            if let Some(request) = next {
                queue.current = Some(request.clone());
                return Some(request);
            }
            queue = wait(&self.work, queue);
        }
    }

    fn service(&self, request: &Arc<CaptureRequest>) {
        let span = observability::span_request(self.id, request.id());
        let _guard = span.enter();

        let begin = match request.process(self.id) {
            Ok(begin) => begin,
            Err(err) => {
                tracing::debug!(%err, "request not dispatched");
                self.discard(request);
                return;
            }
        };
        if self.exit.load(Ordering::SeqCst) || request.is_cancelled() {
            tracing::trace!("request dropped after dispatch barrier");
            return;
        }
        let Some(config) = self.config() else {
            return;
        };

        if request.needs_shutter() {
            self.send(CaptureMessage::new(
                MessageKind::Shutter,
                request.id(),
                self.id,
                begin,
                peers(request),
            ));
        }

        if !self.deliver_buffers(request, &config) {
            if self.exit.load(Ordering::SeqCst) || request.is_cancelled() {
                tracing::trace!("no buffer delivered, capture skipped");
                return;
            }
            // No result will follow, so siblings must not wait for one
            tracing::warn!("no buffer delivered, request released");
            request.disable_sync();
            self.discard(request);
            self.send(
                CaptureMessage::new(MessageKind::Error, request.id(), self.id, clock::now(), 1)
                    .with_status(BufferStatus::Drop),
            );
            return;
        }

        let first = self.first_pending.swap(false, Ordering::SeqCst);
        if first {
            request.mark_first();
        }
        let params = CaptureParams {
            stream: self.id,
            capture_id: request.id(),
            first_request: first,
            continuous: request.is_continuous(),
        };
        let dispatcher = &self.context.dispatcher;
        if let Err(err) = dispatcher.config(self.id, &params) {
            tracing::warn!(%err, "pipeline config failed");
        }

        lock(&self.in_transit).push(request.clone());
        if request.is_cancelled() {
            let _ = dispatcher.cancel_capture(self.id, request.id());
        }

        match dispatcher.capture(self.id, request.id()) {
            Ok(()) => self.metrics.record_dispatched(),
            Err(err) => {
                tracing::error!(%err, "capture dispatch failed");
                self.remove_in_transit(request);
                request.disable_sync();
                self.discard(request);
                self.send(
                    CaptureMessage::new(MessageKind::Error, request.id(), self.id, clock::now(), 1)
                        .with_status(BufferStatus::Drop),
                );
            }
        }
    }

    /// Hand buffers to the pipeline for `request`.
    ///
    /// A one-shot request tops the pipeline up to the full buffer count; a
    /// continuous one delivers a single buffer. Blocks (retrying) only while
    /// the pipeline has nothing to capture into. Returns `false` if the
    /// capture should be skipped.
    fn deliver_buffers(&self, request: &CaptureRequest, config: &StreamConfig) -> bool {
        let dispatcher = &self.context.dispatcher;
        let wanted = if request.is_continuous() {
            1
        } else {
            config
                .buffer_count
                .saturating_sub(dispatcher.pending_count(self.id))
        };

        for _ in 0..wanted {
            loop {
                let starved = dispatcher.pending_count(self.id) == 0;
                let timeout = if starved {
                    Timeout::After(config.acquire_timeout)
                } else {
                    Timeout::Immediate
                };
                match self.acquire(config, timeout) {
                    Some(buffer) => {
                        *lock(&self.outstanding) += 1;
                        if let Err(err) = dispatcher.deliver_buffer(self.id, buffer) {
                            tracing::warn!(%err, "buffer delivery failed");
                            return false;
                        }
                        break;
                    }
                    None if !starved => return true,
                    None => {
                        if self.exit.load(Ordering::SeqCst) || request.is_cancelled() {
                            return false;
                        }
                        tracing::trace!("no free buffer, retrying");
                    }
                }
            }
        }
        dispatcher.pending_count(self.id) > 0
    }

    fn acquire(&self, config: &StreamConfig, timeout: Timeout) -> Option<Buffer> {
        if config.tunnel_mode {
            let tunnel = lock(&self.tunnel).clone()?;
            return tunnel.get_buffer(timeout);
        }
        self.pool().acquire_buffer(timeout)
    }

    /// Result path for every buffer leaving this stream's pipeline.
    ///
    /// Runs on the pipeline worker. A buffer whose capture id matches no
    /// in-transit request is marked `Invalid` and recycled.
    pub fn handle_result(&self, mut buffer: Buffer) {
        self.metrics.record_status(buffer.status());

        let matched = buffer.capture_id().and_then(|id| {
            lock(&self.in_transit)
                .iter()
                .find(|r| r.id() == id)
                .cloned()
        });

        match matched {
            Some(request) => self.complete(&request, buffer),
            None => {
                if let Some(capture) = buffer.capture_id() {
                    tracing::warn!(
                        stream = %self.id,
                        %capture,
                        index = buffer.index(),
                        "returned buffer matches no in-transit request"
                    );
                    self.metrics.record_status(BufferStatus::Invalid);
                }
                buffer.set_status(BufferStatus::Invalid);
                self.recycle(buffer);
            }
        }

        let mut outstanding = lock(&self.outstanding);
        *outstanding = outstanding.saturating_sub(1);
        drop(outstanding);
        self.returned.notify_all();
    }

    fn complete(&self, request: &Arc<CaptureRequest>, buffer: Buffer) {
        let status = buffer.status();
        let frame_number = buffer.frame_number();

        if let Err(buffer) = request.attach_result(self.id, buffer) {
            self.remove_in_transit(request);
            self.recycle(buffer);
            return;
        }
        // Stays in transit until the barrier releases so teardown can disable it
        let end = request.on_result(self.id).unwrap_or_else(|err| {
            tracing::warn!(%err, capture = %request.id(), "result barrier failed");
            clock::now()
        });
        self.remove_in_transit(request);
        let result = request.take_result(self.id);

        self.send(
            CaptureMessage::new(MessageKind::Result, request.id(), self.id, end, peers(request))
                .with_status(status)
                .with_frame_number(frame_number),
        );
        if status != BufferStatus::Ok {
            self.send(
                CaptureMessage::new(MessageKind::Error, request.id(), self.id, end, 1)
                    .with_status(status)
                    .with_frame_number(frame_number),
            );
        }
        self.metrics.record_completed();
        tracing::trace!(
            stream = %self.id,
            capture = %request.id(),
            ?status,
            frame_number,
            "result completed"
        );

        if let Some(buffer) = result {
            self.recycle(buffer);
        }
    }

    fn recycle(&self, buffer: Buffer) {
        let tunnel_mode = self.config().is_some_and(|c| c.tunnel_mode);
        let tunnel = if tunnel_mode {
            lock(&self.tunnel).clone()
        } else {
            None
        };
        let pool = self.context.manager.lookup(buffer.pool_id());
        return_buffer(self.id, buffer, tunnel.as_ref(), pool.as_deref());
    }

    fn send(&self, message: CaptureMessage) {
        if let Err(err) = self.context.messages.send_message(message) {
            tracing::debug!(stream = %self.id, %err, "message not delivered");
        }
    }

    fn discard(&self, request: &Arc<CaptureRequest>) {
        lock(&self.queue)
            .waiting
            .retain(|r| !Arc::ptr_eq(r, request));
    }

    fn remove_in_transit(&self, request: &Arc<CaptureRequest>) {
        let mut in_transit = lock(&self.in_transit);
        if let Some(position) = in_transit.iter().position(|r| Arc::ptr_eq(r, request)) {
            in_transit.remove(position);
        }
    }

    /// Requests the worker still references, deduplicated.
    fn live_requests(&self) -> Vec<Arc<CaptureRequest>> {
        let mut requests: Vec<Arc<CaptureRequest>> = {
            let queue = lock(&self.queue);
            queue
                .waiting
                .iter()
                .chain(queue.current.iter())
                .cloned()
                .collect()
        };
        requests.extend(lock(&self.in_transit).iter().cloned());
        let mut unique: Vec<Arc<CaptureRequest>> = Vec::with_capacity(requests.len());
        for request in requests {
            if !unique.iter().any(|r| Arc::ptr_eq(r, &request)) {
                unique.push(request);
            }
        }
        unique
    }

    /// Flag the worker to exit; returns whether it was already flagged.
    fn signal_exit(&self) -> bool {
        let queue = lock(&self.queue);
        let already = self.exit.swap(true, Ordering::SeqCst);
        drop(queue);
        self.work.notify_all();
        already
    }

    fn join_worker(&self) {
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(stream = %self.id, "stream worker panicked");
            }
        }
    }

    fn wait_returned(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        let mut outstanding = lock(&self.outstanding);
        while *outstanding > 0 {
            let (guard, timed_out) = wait_deadline(&self.returned, outstanding, deadline);
            outstanding = guard;
            if timed_out && *outstanding > 0 {
                return false;
            }
        }
        true
    }

    /// Stop the worker and drain the pipeline.
    ///
    /// Continuous requests are cancelled, every other request this stream
    /// holds is released with barrier sync disabled. Returns to `Idle` with
    /// every pool buffer idle. Idempotent.
    pub fn stop_stream(&self) -> Result<()> {
        if *lock(&self.state) != StreamState::Busy || self.signal_exit() {
            return Ok(());
        }
        let span = observability::span_stream(self.id, self.intent.as_str());
        let _guard = span.enter();
        tracing::debug!("stopping stream");

        let requests = self.live_requests();
        for request in &requests {
            request.disable_sync();
        }
        for request in requests.iter().filter(|r| r.is_continuous()) {
            request.cancel();
        }

        let pool = self.pool();
        pool.notify_stop();
        let tunnel = lock(&self.tunnel).clone();
        if let Some(tunnel) = &tunnel {
            tunnel.stop();
        }
        self.join_worker();

        let dispatcher = &self.context.dispatcher;
        if let Err(err) = dispatcher.flush(self.id) {
            tracing::warn!(%err, "pipeline flush failed");
        }
        if !self.wait_returned(self.context.stop_timeout) {
            tracing::warn!(
                outstanding = self.outstanding_buffers(),
                "timed out waiting for buffers to return"
            );
        }
        if let Err(err) = dispatcher.stop(self.id) {
            tracing::warn!(%err, "pipeline stop failed");
        }
        if let Some(tunnel) = &tunnel {
            if !tunnel.wait_for_all_buffer_returned(self.context.stop_timeout) {
                tracing::warn!("tunnel buffers still outstanding");
            }
        }

        let leftovers = {
            let mut queue = lock(&self.queue);
            let mut leftovers: Vec<_> = queue.waiting.drain(..).collect();
            leftovers.extend(queue.current.take());
            leftovers
        };
        let in_transit: Vec<_> = lock(&self.in_transit).drain(..).collect();
        for request in leftovers.iter().chain(in_transit.iter()) {
            request.remove_owner(self.id);
        }

        pool.notify_start();
        *lock(&self.state) = StreamState::Idle;
        tracing::debug!(
            idle = pool.idle_count(),
            count = pool.count(),
            released = leftovers.len() + in_transit.len(),
            "stream stopped"
        );
        Ok(())
    }

    /// Stop, free the pool and leave the dispatcher. Idempotent.
    pub fn release(&self) -> Result<()> {
        self.stop_stream()?;

        let pool = self.pool();
        if let Err(err) = pool.clear_buffers() {
            tracing::warn!(stream = %self.id, %err, "pool not cleared");
        }
        self.context.dispatcher.destroy(self.id);
        lock(&self.tunnel).take();
        self.context.manager.release(pool.id());
        *lock(&self.config) = None;
        *lock(&self.state) = StreamState::Idle;
        tracing::debug!(stream = %self.id, "stream released");
        Ok(())
    }

    /// Hand in-transit still captures to an offline pipeline.
    ///
    /// The worker stops, queued requests are released, and the stream gets a
    /// fresh pool; the old pool and tunnel live on in the offline pipeline
    /// until its work drains. A recommit brings the stream back.
    pub fn change_to_offline(&self) -> Result<OfflinePipeline> {
        if self.intent != StreamIntent::Still {
            return Err(Error::state(format!(
                "{} is a {} stream, only still streams go offline",
                self.id, self.intent
            )));
        }
        let state = self.state();
        if !matches!(state, StreamState::Active | StreamState::Busy) {
            return Err(Error::state(format!(
                "cannot take {} offline from {:?}",
                self.id, state
            )));
        }
        let config = self
            .config()
            .ok_or_else(|| Error::state(format!("{} has no committed configuration", self.id)))?;

        self.signal_exit();
        for request in self.live_requests() {
            request.disable_sync();
        }

        let old_pool = self.pool();
        old_pool.notify_stop();
        let tunnel = lock(&self.tunnel).take();
        if let Some(tunnel) = &tunnel {
            tunnel.stop();
        }
        self.join_worker();

        let queued = {
            let mut queue = lock(&self.queue);
            let mut queued: Vec<_> = queue.waiting.drain(..).collect();
            queued.extend(queue.current.take());
            queued
        };
        let in_transit: Vec<_> = lock(&self.in_transit).drain(..).collect();
        for request in &queued {
            if !in_transit.iter().any(|r| Arc::ptr_eq(r, request)) {
                request.remove_owner(self.id);
            }
        }
        let handed_over = in_transit.len();

        // Results keep flowing into the old pool through the offline pipeline
        old_pool.notify_start();
        let tunnel = tunnel.filter(|_| config.tunnel_mode);
        let forward = offline_forwarder(
            self.id,
            self.context.messages.clone(),
            old_pool.clone(),
            tunnel,
        );
        let offline = OfflinePipeline::new(
            self.id,
            in_transit,
            Arc::downgrade(&self.context.dispatcher),
            forward,
            &self.context.thread_prefix,
        );

        *lock(&self.pool) = self.context.manager.create_pool();
        *lock(&self.outstanding) = 0;
        self.returned.notify_all();

        let offline = match offline {
            Ok(offline) => offline,
            Err(err) => {
                *lock(&self.state) = StreamState::Idle;
                return Err(err);
            }
        };
        *lock(&self.state) = StreamState::Offline;
        tracing::debug!(stream = %self.id, handed_over, "stream switched to offline");
        Ok(offline)
    }
}

impl RequestOwner for Stream {
    fn owner_id(&self) -> StreamId {
        self.id
    }

    fn drop_request(&self, request: &Arc<CaptureRequest>) {
        let removed = {
            let mut queue = lock(&self.queue);
            let before = queue.waiting.len();
            queue.waiting.retain(|r| !Arc::ptr_eq(r, request));
            before != queue.waiting.len()
        };
        self.work.notify_all();

        let in_transit = lock(&self.in_transit)
            .iter()
            .any(|r| Arc::ptr_eq(r, request));
        if in_transit {
            if let Err(err) = self.context.dispatcher.cancel_capture(self.id, request.id()) {
                tracing::debug!(stream = %self.id, %err, "pipeline cancel failed");
            }
        }

        if request.is_continuous() {
            self.send(CaptureMessage::new(
                MessageKind::Ended,
                request.id(),
                self.id,
                request.cancel_timestamp(),
                request.expected_owners(),
            ));
        }
        tracing::debug!(
            stream = %self.id,
            capture = %request.id(),
            removed,
            in_transit,
            "request dropped"
        );
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("intent", &self.intent)
            .field("state", &self.state())
            .field("waiting", &self.waiting_count())
            .field("in_transit", &self.in_transit_count())
            .finish()
    }
}

fn peers(request: &CaptureRequest) -> usize {
    if request.is_sync_disabled() {
        1
    } else {
        request.expected_owners()
    }
}

fn return_buffer(
    stream: StreamId,
    buffer: Buffer,
    tunnel: Option<&Arc<dyn BufferQueue>>,
    pool: Option<&BufferPool>,
) {
    let result = match (tunnel, pool) {
        (Some(tunnel), _) => tunnel.put_buffer(buffer),
        (None, Some(pool)) => pool.return_buffer(buffer),
        (None, None) => {
            tracing::warn!(%stream, pool = %buffer.pool_id(), "owning pool is gone, buffer freed");
            Ok(())
        }
    };
    if let Err(err) = result {
        tracing::warn!(%stream, %err, "buffer not recycled");
    }
}

/// Result path of an offline pipeline: complete the request for `stream`
/// without barriers and recycle into the snapshotted pool or tunnel.
fn offline_forwarder(
    stream: StreamId,
    messages: Arc<CaptureMessageOperator>,
    pool: Arc<BufferPool>,
    tunnel: Option<Arc<dyn BufferQueue>>,
) -> OfflineForward {
    Box::new(move |request: Option<Arc<CaptureRequest>>, mut buffer: Buffer| {
        let Some(request) = request else {
            if let Some(capture) = buffer.capture_id() {
                tracing::warn!(%stream, %capture, "offline buffer matches no cached request");
            }
            buffer.set_status(BufferStatus::Invalid);
            return_buffer(stream, buffer, tunnel.as_ref(), Some(&pool));
            return;
        };

        let status = buffer.status();
        let frame_number = buffer.frame_number();
        if let Err(buffer) = request.attach_result(stream, buffer) {
            return_buffer(stream, buffer, tunnel.as_ref(), Some(&pool));
            return;
        }
        let end: ClockTime = request.on_result(stream).unwrap_or_else(|_| clock::now());
        let result = request.take_result(stream);

        let send = |message: CaptureMessage| {
            if let Err(err) = messages.send_message(message) {
                tracing::debug!(%stream, %err, "offline message not delivered");
            }
        };
        send(
            CaptureMessage::new(MessageKind::Result, request.id(), stream, end, 1)
                .with_status(status)
                .with_frame_number(frame_number),
        );
        if status != BufferStatus::Ok {
            send(
                CaptureMessage::new(MessageKind::Error, request.id(), stream, end, 1)
                    .with_status(status)
                    .with_frame_number(frame_number),
            );
        }
        if let Some(buffer) = result {
            return_buffer(stream, buffer, tunnel.as_ref(), Some(&pool));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferLayout, BufferUsage, CaptureId, PixelFormat};
    use crate::capture::{CaptureOptions, MergeFn};
    use crate::pipeline::{GraphSpec, NodeFactory, PipelineGraph};
    use crate::stream::MemoryBufferQueue;
    use std::collections::HashMap;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(5);

    type Events = kanal::Receiver<(MessageKind, Vec<CaptureMessage>)>;

    fn context(stop_timeout: Duration) -> (StreamContext, Events) {
        let (tx, rx) = kanal::unbounded();
        let merge: MergeFn = Box::new(move |kind, group| {
            let _ = tx.send((kind, group));
        });
        let context = StreamContext {
            registry: Arc::new(AllocatorRegistry::with_defaults().unwrap()),
            manager: Arc::new(BufferManager::new()),
            dispatcher: Arc::new(PipelineDispatcher::new("test")),
            messages: Arc::new(CaptureMessageOperator::new(merge).unwrap()),
            stop_timeout,
            thread_prefix: "test".into(),
        };
        (context, rx)
    }

    /// One pass-through chain per stream.
    fn install(context: &StreamContext, streams: &[&Arc<Stream>]) {
        let intents: Vec<StreamIntent> = streams.iter().map(|s| s.intent()).collect();
        let bound: HashMap<StreamIntent, StreamId> =
            streams.iter().map(|s| (s.intent(), s.id())).collect();
        let graph = PipelineGraph::build(
            "test",
            &GraphSpec::direct(&intents),
            &NodeFactory::new(),
            &bound,
        )
        .unwrap();
        context.dispatcher.update(graph).unwrap();
    }

    fn request(id: u64, options: CaptureOptions, owners: &[&Arc<Stream>]) -> Arc<CaptureRequest> {
        let request = CaptureRequest::new(CaptureId(id), owners.len(), options);
        for stream in owners {
            let owner: Arc<dyn RequestOwner> = (*stream).clone();
            request.add_owner(&owner);
        }
        request
    }

    /// First group of `kind` for `capture` that `stream` reported in.
    fn wait_for(events: &Events, kind: MessageKind, capture: u64, stream: StreamId) -> Vec<CaptureMessage> {
        let deadline = Instant::now() + WAIT;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let (got, group) = events
                .recv_timeout(left)
                .expect("message group arrived before the deadline");
            if got == kind
                && group
                    .iter()
                    .any(|m| m.capture_id == CaptureId(capture) && m.stream_id == stream)
            {
                return group;
            }
        }
    }

    fn eventually(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    /// A committed still stream whose worker is servicing a repeating
    /// request.
    fn busy_still(context: &StreamContext) -> (Arc<Stream>, Arc<CaptureRequest>) {
        let stream = Stream::new(StreamId(2), StreamIntent::Still, context.clone());
        install(context, &[&stream]);
        stream.commit(StreamConfig::still(64, 48)).unwrap();
        let repeating = request(1, CaptureOptions::repeating(), &[&stream]);
        stream.add_request(repeating.clone()).unwrap();
        assert_eq!(stream.state(), StreamState::Busy);
        (stream, repeating)
    }

    #[test]
    fn test_unmatched_result_goes_back_to_pool() {
        let (context, _events) = context(Duration::from_secs(1));
        let stream = Stream::new(StreamId(1), StreamIntent::Preview, context);
        stream
            .commit(StreamConfig::preview(32, 32).buffer_count(2))
            .unwrap();

        let pool = stream.pool();
        let mut buffer = pool.acquire_buffer(Timeout::Immediate).unwrap();
        buffer.set_capture_id(Some(CaptureId(99)));
        *lock(&stream.outstanding) += 1;

        stream.handle_result(buffer);
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.busy_count(), 0);
        assert_eq!(stream.outstanding_buffers(), 0);
    }

    #[test]
    fn test_unmatched_result_is_marked_invalid() {
        let (context, _events) = context(Duration::from_secs(1));
        let stream = Stream::new(StreamId(1), StreamIntent::Preview, context);
        let queue = Arc::new(MemoryBufferQueue::new(BufferLayout::new(
            32,
            32,
            PixelFormat::Nv12,
            BufferUsage::CAMERA_WRITE,
        )));
        stream.attach_tunnel(queue.clone()).unwrap();
        stream
            .commit(StreamConfig::preview(32, 32).buffer_count(2).tunnel_mode(true))
            .unwrap();

        let mut buffer = queue.get_buffer(Timeout::Immediate).unwrap();
        buffer.set_capture_id(Some(CaptureId(99)));
        *lock(&stream.outstanding) += 1;

        stream.handle_result(buffer);
        // A non-OK buffer is cancelled back to the free list, never flushed
        assert_eq!(queue.cancelled_count(), 1);
        assert_eq!(queue.flushed_count(), 0);
        assert_eq!(queue.free_count(), 2);
        assert_eq!(stream.outstanding_buffers(), 0);
    }

    #[test]
    fn test_stop_while_waiting_on_starved_sibling() {
        let (context, events) = context(Duration::from_secs(1));
        let preview = Stream::new(StreamId(1), StreamIntent::Preview, context.clone());
        let still = Stream::new(StreamId(2), StreamIntent::Still, context.clone());
        install(&context, &[&preview, &still]);
        preview.commit(StreamConfig::preview(32, 32)).unwrap();
        still.commit(StreamConfig::still(32, 32)).unwrap();

        // The repeating request holds the still queue, so the still stream
        // never reaches the shared request's dispatch barrier
        let repeating = request(1, CaptureOptions::repeating(), &[&still]);
        let shared = request(2, CaptureOptions::still(), &[&preview, &still]);
        still.add_request(repeating.clone()).unwrap();
        still.add_request(shared.clone()).unwrap();
        preview.add_request(shared.clone()).unwrap();

        eventually(|| lock(&preview.queue).current.is_some());
        std::thread::sleep(Duration::from_millis(20));

        preview.stop_stream().unwrap();
        assert_eq!(preview.state(), StreamState::Idle);
        assert!(shared.is_sync_disabled());
        let pool = preview.pool();
        assert_eq!(pool.idle_count(), pool.count());

        repeating.cancel();
        let group = wait_for(&events, MessageKind::Result, 2, still.id());
        assert_eq!(group.len(), 1);

        still.stop_stream().unwrap();
        assert_eq!(still.state(), StreamState::Idle);
    }

    #[test]
    fn test_failed_delivery_releases_siblings() {
        let (context, events) = context(Duration::from_secs(1));
        let preview = Stream::new(StreamId(1), StreamIntent::Preview, context.clone());
        let still = Stream::new(StreamId(2), StreamIntent::Still, context.clone());
        install(&context, &[&preview, &still]);
        preview.commit(StreamConfig::preview(32, 32)).unwrap();
        still.commit(StreamConfig::still(32, 32)).unwrap();

        let warmup = request(1, CaptureOptions::default(), &[&preview]);
        preview.add_request(warmup).unwrap();
        wait_for(&events, MessageKind::Result, 1, preview.id());

        // Pull the preview sequence out from under the running worker
        context.dispatcher.destroy(preview.id());
        let weak = Arc::downgrade(&preview);
        context.dispatcher.set_result_callback(
            preview.id(),
            Arc::new(move |buffer| {
                if let Some(stream) = weak.upgrade() {
                    stream.handle_result(buffer);
                }
            }),
        );

        let shared = request(2, CaptureOptions::still(), &[&preview, &still]);
        preview.add_request(shared.clone()).unwrap();
        still.add_request(shared.clone()).unwrap();

        let error = wait_for(&events, MessageKind::Error, 2, preview.id());
        assert_eq!(error[0].status, BufferStatus::Drop);
        wait_for(&events, MessageKind::Result, 2, still.id());

        assert!(shared.is_sync_disabled());
        assert_eq!(preview.waiting_count(), 0);
        eventually(|| preview.outstanding_buffers() == 0);
        let pool = preview.pool();
        assert_eq!(pool.idle_count(), pool.count());

        preview.stop_stream().unwrap();
        still.stop_stream().unwrap();
    }

    #[test]
    fn test_stop_with_unbounded_timeout() {
        let (context, events) = context(Duration::MAX);
        let (stream, _repeating) = busy_still(&context);
        wait_for(&events, MessageKind::Result, 1, stream.id());

        stream.stop_stream().unwrap();
        assert_eq!(stream.state(), StreamState::Idle);
        assert_eq!(stream.outstanding_buffers(), 0);
        let pool = stream.pool();
        assert_eq!(pool.idle_count(), pool.count());
    }

    #[test]
    fn test_commit_while_busy_fails() {
        let (context, _events) = context(Duration::from_secs(1));
        let (stream, _repeating) = busy_still(&context);

        let err = stream.commit(StreamConfig::still(128, 96)).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert_eq!(stream.config().map(|c| c.width), Some(64));

        stream.stop_stream().unwrap();
        stream.commit(StreamConfig::still(128, 96)).unwrap();
        assert_eq!(stream.state(), StreamState::Active);
    }

    #[test]
    fn test_tunnel_changes_while_busy_fail() {
        let (context, _events) = context(Duration::from_secs(1));
        let (stream, _repeating) = busy_still(&context);
        let queue = Arc::new(MemoryBufferQueue::new(BufferLayout::new(
            64,
            48,
            PixelFormat::Jpeg,
            BufferUsage::CAMERA_WRITE,
        )));

        assert!(matches!(
            stream.attach_tunnel(queue.clone()),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(stream.detach_tunnel(), Err(Error::InvalidState(_))));
        assert!(!stream.has_tunnel());

        stream.stop_stream().unwrap();
        stream.attach_tunnel(queue).unwrap();
        assert!(stream.detach_tunnel().unwrap().is_some());
    }

    #[test]
    fn test_offline_needs_committed_still_stream() {
        let (context, _events) = context(Duration::from_secs(1));
        let still = Stream::new(StreamId(2), StreamIntent::Still, context.clone());
        assert!(matches!(
            still.change_to_offline(),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(still.state(), StreamState::Idle);

        let preview = Stream::new(StreamId(1), StreamIntent::Preview, context);
        preview.commit(StreamConfig::preview(32, 32)).unwrap();
        assert!(preview.change_to_offline().is_err());
        assert_eq!(preview.state(), StreamState::Active);
    }
}
