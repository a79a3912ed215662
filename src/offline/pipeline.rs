//! Background continuation of a still stream's in-transit captures.

use crate::buffer::{Buffer, BufferStatus, CaptureId, StreamId};
use crate::capture::CaptureRequest;
use crate::error::Result;
use crate::observability;
use crate::pipeline::{PipelineDispatcher, ResultCallback};
use crate::sync::lock;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

/// Receives every buffer the offline pipeline drains, with the cached
/// request it belongs to (`None` if it matches none).
pub type OfflineForward = Box<dyn FnMut(Option<Arc<CaptureRequest>>, Buffer) + Send + 'static>;

type Entry = (Arc<CaptureRequest>, usize);

#[derive(Default)]
struct Cache {
    live: HashMap<CaptureId, Entry>,
    cancelled: HashMap<CaptureId, Entry>,
}

impl Cache {
    /// Claim one expected buffer of `capture`; the flag is `true` if the
    /// capture was cancelled.
    fn claim(&mut self, capture: CaptureId) -> Option<(Arc<CaptureRequest>, bool)> {
        let (map, cancelled) = if self.live.contains_key(&capture) {
            (&mut self.live, false)
        } else if self.cancelled.contains_key(&capture) {
            (&mut self.cancelled, true)
        } else {
            return None;
        };
        let entry = map.get_mut(&capture)?;
        entry.1 = entry.1.saturating_sub(1);
        let request = entry.0.clone();
        if entry.1 == 0 {
            map.remove(&capture);
        }
        Some((request, cancelled))
    }
}

enum Job {
    Buffer(Buffer),
    Stop,
}

/// Drains results of captures a stream accepted before going offline.
///
/// Buffers leaving the stream's pipeline sequence are queued to a dedicated
/// worker, which forwards them in batches. Dropping the pipeline flushes it.
pub struct OfflinePipeline {
    stream: StreamId,
    dispatcher: Weak<PipelineDispatcher>,
    callback: ResultCallback,
    cache: Arc<Mutex<Cache>>,
    jobs: Mutex<Option<kanal::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OfflinePipeline {
    /// Take over `requests` (the stream's in-transit list) and start
    /// receiving the stream's pipeline results.
    ///
    /// Barrier sync is disabled on every request. Buffers still waiting at
    /// the sequence's source are handed back with `Drop` status.
    pub fn new(
        stream: StreamId,
        requests: Vec<Arc<CaptureRequest>>,
        dispatcher: Weak<PipelineDispatcher>,
        mut forward: OfflineForward,
        thread_prefix: &str,
    ) -> Result<Self> {
        let mut cache = Cache::default();
        for request in requests {
            request.disable_sync();
            cache
                .live
                .entry(request.id())
                .or_insert_with(|| (request.clone(), 0))
                .1 += 1;
        }
        let cached = cache.live.len();
        let cache = Arc::new(Mutex::new(cache));

        let (tx, rx) = kanal::unbounded::<Job>();
        let worker_cache = cache.clone();
        let worker = std::thread::Builder::new()
            .name(format!("{}-offline-{}", thread_prefix, stream.0))
            .spawn(move || {
                let span = observability::span_offline(stream);
                let _guard = span.enter();

                while let Ok(job) = rx.recv() {
                    let mut batch: SmallVec<[Buffer; 4]> = SmallVec::new();
                    let mut stop = false;
                    let mut push = |job: Job| match job {
                        Job::Buffer(buffer) => batch.push(buffer),
                        Job::Stop => stop = true,
                    };
                    push(job);
                    while let Ok(Some(job)) = rx.try_recv() {
                        push(job);
                    }

                    tracing::trace!(size = batch.len(), "offline batch");
                    for mut buffer in batch {
                        let claimed = buffer
                            .capture_id()
                            .and_then(|id| lock(&worker_cache).claim(id));
                        match claimed {
                            Some((request, cancelled)) => {
                                if cancelled {
                                    buffer.set_status(BufferStatus::Drop);
                                }
                                forward(Some(request), buffer);
                            }
                            None => forward(None, buffer),
                        }
                    }
                    if stop {
                        break;
                    }
                }
                tracing::debug!("offline worker exiting");
            })?;

        let sender = tx.clone();
        let callback: ResultCallback = Arc::new(move |buffer| {
            if sender.send(Job::Buffer(buffer)).is_err() {
                tracing::warn!(%stream, "offline pipeline closed, buffer freed");
            }
        });

        if let Some(dispatcher) = dispatcher.upgrade() {
            dispatcher.set_result_callback(stream, callback.clone());
            let reclaimed = dispatcher.return_pending(stream);
            tracing::debug!(%stream, cached, reclaimed, "offline pipeline started");
        } else {
            tracing::debug!(%stream, cached, "offline pipeline started without a dispatcher");
        }

        Ok(Self {
            stream,
            dispatcher,
            callback,
            cache,
            jobs: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stream this pipeline continues.
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Cancel a cached capture: its buffers come back with `Drop` status.
    ///
    /// Returns `false` for an id that is not cached.
    pub fn cancel_capture(&self, capture: CaptureId) -> bool {
        {
            let mut cache = lock(&self.cache);
            let Some(entry) = cache.live.remove(&capture) else {
                return false;
            };
            cache.cancelled.insert(capture, entry);
        }
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            if let Err(err) = dispatcher.cancel_capture(self.stream, capture) {
                tracing::debug!(stream = %self.stream, %err, "pipeline cancel failed");
            }
        }
        tracing::debug!(stream = %self.stream, %capture, "offline capture cancelled");
        true
    }

    /// Captures still expecting buffers, cancelled ones excluded.
    pub fn cached_ids(&self) -> Vec<CaptureId> {
        let mut ids: Vec<_> = lock(&self.cache).live.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Whether every cached capture has drained.
    pub fn is_idle(&self) -> bool {
        let cache = lock(&self.cache);
        cache.live.is_empty() && cache.cancelled.is_empty()
    }

    /// Cancel everything, drain the pipeline and stop the worker.
    ///
    /// Idempotent; also run on drop.
    pub fn flush(&self) {
        let Some(jobs) = lock(&self.jobs).take() else {
            return;
        };
        for capture in self.cached_ids() {
            self.cancel_capture(capture);
        }

        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.return_pending(self.stream);
            if let Err(err) = dispatcher.stop(self.stream) {
                tracing::debug!(stream = %self.stream, %err, "pipeline stop failed");
            }
        }

        let _ = jobs.send(Job::Stop);
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                tracing::error!(stream = %self.stream, "offline worker panicked");
            }
        }

        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.clear_result_callback_if(self.stream, &self.callback);
        }
        let lost = {
            let mut cache = lock(&self.cache);
            let lost = cache.cancelled.len();
            cache.cancelled.clear();
            lost
        };
        tracing::debug!(stream = %self.stream, lost, "offline pipeline flushed");
    }
}

impl Drop for OfflinePipeline {
    fn drop(&mut self) {
        self.flush();
    }
}

impl std::fmt::Debug for OfflinePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflinePipeline")
            .field("stream", &self.stream)
            .field("cached", &self.cached_ids())
            .finish()
    }
}
