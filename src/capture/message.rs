//! Fan-in of per-owner lifecycle messages.
//!
//! Every owner of a capture request reports its own shutter, result, error
//! and ended events. The [`CaptureMessageOperator`] buckets those reports by
//! kind and by timestamp (peers reporting the same event share the barrier
//! timestamp) and, once a bucket holds as many messages as the peer count
//! carried by its first message, hands the whole group to a merge function
//! on a dedicated handler thread.
//!
//! Buckets that never fill are kept forever unless an eviction age is
//! configured.

use crate::buffer::{BufferStatus, CaptureId, StreamId};
use crate::clock::ClockTime;
use crate::error::{Error, Result};
use crate::observability;
use crate::sync::lock;
use std::collections::HashMap;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Dispatch barrier released.
    Shutter,
    /// Result buffer delivered with OK status.
    Result,
    /// Result buffer delivered with DROP or INVALID status.
    Error,
    /// Request cancelled while in flight.
    Ended,
}

impl MessageKind {
    /// Lowercase name for logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Shutter => "shutter",
            MessageKind::Result => "result",
            MessageKind::Error => "error",
            MessageKind::Ended => "ended",
        }
    }
}

/// One owner's report of a lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureMessage {
    /// Event kind.
    pub kind: MessageKind,
    /// Request the event belongs to.
    pub capture_id: CaptureId,
    /// Reporting stream.
    pub stream_id: StreamId,
    /// Shared event timestamp.
    pub timestamp: ClockTime,
    /// Number of owners expected to report this event.
    pub peer_count: usize,
    /// Status of the buffer behind the event.
    pub status: BufferStatus,
    /// Frame number stamped on the buffer, 0 if none.
    pub frame_number: u64,
}

impl CaptureMessage {
    /// Build a message with OK status and no frame number.
    pub fn new(
        kind: MessageKind,
        capture_id: CaptureId,
        stream_id: StreamId,
        timestamp: ClockTime,
        peer_count: usize,
    ) -> Self {
        Self {
            kind,
            capture_id,
            stream_id,
            timestamp,
            peer_count,
            status: BufferStatus::Ok,
            frame_number: 0,
        }
    }

    /// Set the buffer status.
    pub fn with_status(mut self, status: BufferStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the frame number.
    pub fn with_frame_number(mut self, frame_number: u64) -> Self {
        self.frame_number = frame_number;
        self
    }
}

/// Receives one complete group per event.
pub type MergeFn = Box<dyn FnMut(MessageKind, Vec<CaptureMessage>) + Send + 'static>;

struct Bucket {
    timestamp: ClockTime,
    peer_count: usize,
    messages: Vec<CaptureMessage>,
    opened: Instant,
}

enum Job {
    Merge(MessageKind, Vec<CaptureMessage>),
    Stop,
}

/// Order-independent, at-most-once aggregator of owner messages.
pub struct CaptureMessageOperator {
    buckets: Mutex<HashMap<MessageKind, Vec<Bucket>>>,
    sender: Mutex<Option<kanal::Sender<Job>>>,
    handler: Mutex<Option<JoinHandle<()>>>,
    eviction: Option<Duration>,
}

impl CaptureMessageOperator {
    /// Start an operator whose buckets wait indefinitely.
    pub fn new(merge: MergeFn) -> Result<Self> {
        Self::with_eviction(merge, None, "campipe-msg")
    }

    /// Start an operator, optionally purging buckets older than `eviction`.
    pub fn with_eviction(
        mut merge: MergeFn,
        eviction: Option<Duration>,
        thread_name: &str,
    ) -> Result<Self> {
        let (tx, rx) = kanal::unbounded::<Job>();
        let handler = std::thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    match job {
                        Job::Merge(kind, group) => {
                            tracing::trace!(kind = kind.as_str(), size = group.len(), "merging group");
                            observability::record_messages_merged(kind.as_str(), group.len());
                            merge(kind, group);
                        }
                        Job::Stop => break,
                    }
                }
                tracing::debug!("message handler exiting");
            })?;

        Ok(Self {
            buckets: Mutex::new(HashMap::new()),
            sender: Mutex::new(Some(tx)),
            handler: Mutex::new(Some(handler)),
            eviction,
        })
    }

    /// Add one owner's message; releases its group once complete.
    ///
    /// A peer count of zero is treated as one.
    ///
    /// # Errors
    ///
    /// Fails after [`shutdown`](Self::shutdown).
    pub fn send_message(&self, message: CaptureMessage) -> Result<()> {
        let Some(sender) = lock(&self.sender).clone() else {
            return Err(Error::state("message operator is shut down"));
        };

        let kind = message.kind;
        let complete = {
            let mut buckets = lock(&self.buckets);
            let list = buckets.entry(kind).or_default();
            if let Some(age) = self.eviction {
                Self::evict(kind, list, age);
            }

            let position = match list.iter().position(|b| b.timestamp == message.timestamp) {
                Some(position) => position,
                None => {
                    list.push(Bucket {
                        timestamp: message.timestamp,
                        peer_count: message.peer_count.max(1),
                        messages: Vec::new(),
                        opened: Instant::now(),
                    });
                    list.len() - 1
                }
            };

            let bucket = &mut list[position];
            bucket.messages.push(message);
            if bucket.messages.len() >= bucket.peer_count {
                Some(list.swap_remove(position).messages)
            } else {
                None
            }
        };

        if let Some(group) = complete {
            sender
                .send(Job::Merge(kind, group))
                .map_err(|_| Error::state("message handler has exited"))?;
        }
        Ok(())
    }

    fn evict(kind: MessageKind, list: &mut Vec<Bucket>, age: Duration) {
        list.retain(|bucket| {
            let keep = bucket.opened.elapsed() < age;
            if !keep {
                tracing::warn!(
                    kind = kind.as_str(),
                    timestamp = %bucket.timestamp,
                    received = bucket.messages.len(),
                    expected = bucket.peer_count,
                    "evicting incomplete message group"
                );
            }
            keep
        });
    }

    /// Incomplete buckets across all kinds.
    pub fn pending_count(&self) -> usize {
        lock(&self.buckets).values().map(Vec::len).sum()
    }

    /// Stop the handler after it drains already-released groups.
    ///
    /// Idempotent. Incomplete buckets are discarded.
    pub fn shutdown(&self) {
        if let Some(sender) = lock(&self.sender).take() {
            let _ = sender.send(Job::Stop);
        }
        if let Some(handle) = lock(&self.handler).take() {
            if handle.join().is_err() {
                tracing::error!("message handler panicked");
            }
        }
        let dropped = {
            let mut buckets = lock(&self.buckets);
            let n = buckets.values().map(Vec::len).sum::<usize>();
            buckets.clear();
            n
        };
        if dropped > 0 {
            tracing::debug!(dropped, "discarded incomplete message groups");
        }
    }
}

impl Drop for CaptureMessageOperator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn collecting() -> (MergeFn, kanal::Receiver<(MessageKind, Vec<CaptureMessage>)>) {
        let (tx, rx) = kanal::unbounded();
        let merge: MergeFn = Box::new(move |kind, group| {
            let _ = tx.send((kind, group));
        });
        (merge, rx)
    }

    fn msg(kind: MessageKind, stream: u32, ts: u64, peers: usize) -> CaptureMessage {
        CaptureMessage::new(
            kind,
            CaptureId(1),
            StreamId(stream),
            ClockTime::from_nanos(ts),
            peers,
        )
    }

    #[test]
    fn test_group_released_when_full() {
        let (merge, rx) = collecting();
        let operator = CaptureMessageOperator::new(merge).unwrap();

        operator.send_message(msg(MessageKind::Result, 2, 100, 3)).unwrap();
        operator.send_message(msg(MessageKind::Result, 0, 100, 3)).unwrap();
        assert_eq!(operator.pending_count(), 1);
        operator.send_message(msg(MessageKind::Result, 1, 100, 3)).unwrap();

        let (kind, group) = rx.recv().unwrap();
        assert_eq!(kind, MessageKind::Result);
        let mut streams: Vec<_> = group.iter().map(|m| m.stream_id.0).collect();
        streams.sort();
        assert_eq!(streams, vec![0, 1, 2]);
        assert_eq!(operator.pending_count(), 0);
    }

    #[test]
    fn test_kinds_and_timestamps_bucket_separately() {
        let (merge, rx) = collecting();
        let operator = CaptureMessageOperator::new(merge).unwrap();

        operator.send_message(msg(MessageKind::Shutter, 0, 100, 2)).unwrap();
        operator.send_message(msg(MessageKind::Result, 1, 100, 2)).unwrap();
        operator.send_message(msg(MessageKind::Shutter, 1, 200, 2)).unwrap();
        assert_eq!(operator.pending_count(), 3);
        assert!(!matches!(rx.try_recv(), Ok(Some(_))));

        operator.send_message(msg(MessageKind::Shutter, 1, 100, 2)).unwrap();
        let (kind, group) = rx.recv().unwrap();
        assert_eq!(kind, MessageKind::Shutter);
        assert!(group.iter().all(|m| m.timestamp == ClockTime::from_nanos(100)));
    }

    #[test]
    fn test_single_peer_released_immediately() {
        let (merge, rx) = collecting();
        let operator = CaptureMessageOperator::new(merge).unwrap();
        operator.send_message(msg(MessageKind::Ended, 0, 5, 0)).unwrap();
        let (_, group) = rx.recv().unwrap();
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn test_concurrent_senders_merge_once() {
        let (merge, rx) = collecting();
        let operator = Arc::new(CaptureMessageOperator::new(merge).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let operator = operator.clone();
                std::thread::spawn(move || {
                    operator.send_message(msg(MessageKind::Result, i, 42, 8)).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let (_, group) = rx.recv().unwrap();
        assert_eq!(group.len(), 8);
        operator.shutdown();
        assert!(!matches!(rx.try_recv(), Ok(Some(_))));
    }

    #[test]
    fn test_eviction_purges_stale_buckets() {
        let (merge, _rx) = collecting();
        let operator = CaptureMessageOperator::with_eviction(
            merge,
            Some(Duration::from_millis(10)),
            "test-msg",
        )
        .unwrap();

        operator.send_message(msg(MessageKind::Result, 0, 1, 2)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        operator.send_message(msg(MessageKind::Result, 0, 2, 2)).unwrap();
        assert_eq!(operator.pending_count(), 1);
    }

    #[test]
    fn test_send_after_shutdown_fails() {
        let (merge, _rx) = collecting();
        let operator = CaptureMessageOperator::new(merge).unwrap();
        operator.shutdown();
        operator.shutdown();
        assert!(operator.send_message(msg(MessageKind::Result, 0, 1, 1)).is_err());
    }
}
