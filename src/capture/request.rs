//! One logical shutter event shared by one or more streams.
//!
//! A request is built with the number of streams that will service it. Each
//! owner then calls [`CaptureRequest::process`] before submitting work to its
//! pipeline and [`CaptureRequest::on_result`] once its result buffer is
//! attached. Both calls rendezvous across all owners, so the dispatch phase
//! and the result phase each observe a single shared timestamp.
//!
//! # Example
//!
//! ```rust,ignore
//! let request = CaptureRequest::new(CaptureId(7), 2, CaptureOptions::default());
//! request.add_owner(&preview);
//! request.add_owner(&still);
//!
//! // on each owner's worker thread:
//! let begin = request.process(owner_id)?;
//! // ... later, on the result path:
//! if let Err(buffer) = request.attach_result(owner_id, buffer) {
//!     return recycle(buffer);
//! }
//! let end = request.on_result(owner_id)?;
//! ```

use super::Rendezvous;
use crate::buffer::{Buffer, CaptureId, StreamId};
use crate::clock::{self, ClockTime};
use crate::error::{Error, Result};
use crate::sync::lock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// A participant in a capture request.
pub trait RequestOwner: Send + Sync {
    /// Stream id of this owner.
    fn owner_id(&self) -> StreamId;

    /// Drop `request` from this owner's queues.
    ///
    /// Called by [`CaptureRequest::cancel`] after the request is flagged
    /// cancelled and its barriers disabled.
    fn drop_request(&self, request: &Arc<CaptureRequest>);
}

/// Single-shot or repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestKind {
    /// Serviced once by each owner.
    #[default]
    Single,
    /// Re-serviced every worker iteration until cancelled.
    Continuous,
}

/// Caller-visible knobs of a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureOptions {
    /// Single-shot or repeating.
    pub kind: RequestKind,
    /// Emit a shutter notification when the dispatch barrier releases.
    pub needs_shutter: bool,
}

impl CaptureOptions {
    /// Single-shot capture with a shutter notification.
    pub fn still() -> Self {
        Self {
            kind: RequestKind::Single,
            needs_shutter: true,
        }
    }

    /// Repeating capture without shutter notifications.
    pub fn repeating() -> Self {
        Self {
            kind: RequestKind::Continuous,
            needs_shutter: false,
        }
    }
}

#[derive(Default)]
struct PhaseLedger {
    /// Owners that completed at least one dispatch phase.
    processed: HashSet<StreamId>,
    /// Dispatch phases not yet matched by a result phase.
    outstanding: HashMap<StreamId, u32>,
    /// Result buffers attached but not yet taken back.
    results: HashMap<StreamId, Buffer>,
}

/// A capture request shared by its owning streams.
pub struct CaptureRequest {
    id: CaptureId,
    options: CaptureOptions,
    owners: Mutex<BTreeMap<StreamId, Weak<dyn RequestOwner>>>,
    dispatch: Rendezvous,
    result: Rendezvous,
    ledger: Mutex<PhaseLedger>,
    cancelled: AtomicBool,
    cancel_time: AtomicU64,
    first: AtomicBool,
}

impl CaptureRequest {
    /// Build a request serviced by `expected_owners` streams.
    pub fn new(id: CaptureId, expected_owners: usize, options: CaptureOptions) -> Arc<Self> {
        Arc::new(Self {
            id,
            options,
            owners: Mutex::new(BTreeMap::new()),
            dispatch: Rendezvous::new("dispatch", expected_owners),
            result: Rendezvous::new("result", expected_owners),
            ledger: Mutex::new(PhaseLedger::default()),
            cancelled: AtomicBool::new(false),
            cancel_time: AtomicU64::new(ClockTime::NONE.nanos()),
            first: AtomicBool::new(false),
        })
    }

    /// Capture id.
    #[inline]
    pub fn id(&self) -> CaptureId {
        self.id
    }

    /// Single-shot or repeating.
    #[inline]
    pub fn kind(&self) -> RequestKind {
        self.options.kind
    }

    /// Whether the request repeats every iteration.
    #[inline]
    pub fn is_continuous(&self) -> bool {
        self.options.kind == RequestKind::Continuous
    }

    /// Whether owners emit a shutter notification on dispatch.
    #[inline]
    pub fn needs_shutter(&self) -> bool {
        self.options.needs_shutter
    }

    /// Owner count the barriers were built for.
    pub fn expected_owners(&self) -> usize {
        self.dispatch.expected()
    }

    /// Register a participant.
    pub fn add_owner(&self, owner: &Arc<dyn RequestOwner>) {
        let id = owner.owner_id();
        let mut owners = lock(&self.owners);
        if owners.insert(id, Arc::downgrade(owner)).is_none() && owners.len() > self.expected_owners() {
            tracing::warn!(
                capture = %self.id,
                owners = owners.len(),
                expected = self.expected_owners(),
                "more owners than expected"
            );
        }
    }

    /// Unregister a participant.
    ///
    /// The remaining owners can no longer reach the expected count, so
    /// barrier sync is disabled.
    pub fn remove_owner(&self, owner: StreamId) -> bool {
        let removed = lock(&self.owners).remove(&owner).is_some();
        if removed {
            self.disable_sync();
        }
        removed
    }

    /// Ids of the currently registered owners.
    pub fn owner_ids(&self) -> Vec<StreamId> {
        lock(&self.owners).keys().copied().collect()
    }

    /// Whether `owner` participates.
    pub fn has_owner(&self, owner: StreamId) -> bool {
        lock(&self.owners).contains_key(&owner)
    }

    /// Dispatch phase: block until every owner has arrived.
    ///
    /// Returns the begin timestamp shared by all owners of this cycle.
    ///
    /// # Errors
    ///
    /// Fails for an unregistered owner, a cancelled request, or a second
    /// dispatch of a single-shot request by the same owner.
    pub fn process(&self, owner: StreamId) -> Result<ClockTime> {
        if !self.has_owner(owner) {
            return Err(Error::state(format!("{} does not own {}", owner, self.id)));
        }
        if self.is_cancelled() {
            return Err(Error::state(format!("{} is cancelled", self.id)));
        }
        {
            let ledger = lock(&self.ledger);
            if !self.is_continuous() && ledger.processed.contains(&owner) {
                return Err(Error::state(format!(
                    "{} already dispatched {}",
                    owner, self.id
                )));
            }
        }

        let begin = self.dispatch.arrive(owner)?;

        let mut ledger = lock(&self.ledger);
        ledger.processed.insert(owner);
        *ledger.outstanding.entry(owner).or_insert(0) += 1;
        Ok(begin)
    }

    /// Attach the result buffer produced for `owner`.
    ///
    /// # Errors
    ///
    /// Hands the buffer back if `owner` has no dispatch outstanding or
    /// already attached a result this cycle.
    pub fn attach_result(&self, owner: StreamId, buffer: Buffer) -> std::result::Result<(), Buffer> {
        let mut ledger = lock(&self.ledger);
        if ledger.outstanding.get(&owner).copied().unwrap_or(0) == 0 {
            tracing::warn!(%owner, capture = %self.id, "result attached before dispatch");
            return Err(buffer);
        }
        if ledger.results.contains_key(&owner) {
            tracing::warn!(%owner, capture = %self.id, "result already attached");
            return Err(buffer);
        }
        ledger.results.insert(owner, buffer);
        Ok(())
    }

    /// Result phase: block until every owner has a result attached.
    ///
    /// Returns the end timestamp shared by all owners of this cycle.
    pub fn on_result(&self, owner: StreamId) -> Result<ClockTime> {
        {
            let ledger = lock(&self.ledger);
            if !ledger.results.contains_key(&owner) {
                return Err(Error::state(format!(
                    "{} has no result attached to {}",
                    owner, self.id
                )));
            }
        }

        let end = self.result.arrive(owner)?;

        let mut ledger = lock(&self.ledger);
        if let Some(n) = ledger.outstanding.get_mut(&owner) {
            *n = n.saturating_sub(1);
        }
        Ok(end)
    }

    /// Take back the attached result buffer of `owner`.
    pub fn take_result(&self, owner: StreamId) -> Option<Buffer> {
        lock(&self.ledger).results.remove(&owner)
    }

    /// Dispatch phases of `owner` still waiting for their result phase.
    pub fn outstanding(&self, owner: StreamId) -> u32 {
        lock(&self.ledger)
            .outstanding
            .get(&owner)
            .copied()
            .unwrap_or(0)
    }

    /// Whether every owner finished the result phase at least once and has
    /// nothing outstanding.
    pub fn is_complete(&self) -> bool {
        let owners = self.owner_ids();
        let ledger = lock(&self.ledger);
        !owners.is_empty()
            && owners.iter().all(|owner| {
                ledger.processed.contains(owner)
                    && ledger.outstanding.get(owner).copied().unwrap_or(0) == 0
            })
    }

    /// Flag the request cancelled and ask every owner to drop it.
    ///
    /// Barriers are disabled first so no owner stays blocked on a sibling
    /// that will never arrive. Calling twice is a no-op.
    pub fn cancel(self: &Arc<Self>) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_time
            .store(clock::now().nanos(), Ordering::SeqCst);
        self.disable_sync();

        let owners: Vec<_> = lock(&self.owners)
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        tracing::debug!(capture = %self.id, owners = owners.len(), "request cancelled");
        for owner in owners {
            owner.drop_request(self);
        }
    }

    /// Whether [`cancel`](Self::cancel) was called.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// When the request was cancelled, shared by all owners.
    pub fn cancel_timestamp(&self) -> ClockTime {
        ClockTime::from_nanos(self.cancel_time.load(Ordering::SeqCst))
    }

    /// Degrade both barriers to no-ops.
    pub fn disable_sync(&self) {
        self.dispatch.disable();
        self.result.disable();
    }

    /// Whether barrier sync was disabled.
    pub fn is_sync_disabled(&self) -> bool {
        self.dispatch.is_disabled()
    }

    /// Begin timestamp of the latest dispatch cycle.
    pub fn begin_timestamp(&self) -> ClockTime {
        self.dispatch.timestamp()
    }

    /// End timestamp of the latest result cycle.
    pub fn end_timestamp(&self) -> ClockTime {
        self.result.timestamp()
    }

    /// Mark as the first request serviced since its stream started.
    pub fn mark_first(&self) {
        self.first.store(true, Ordering::Relaxed);
    }

    /// Whether this was the first request since its stream started.
    pub fn is_first(&self) -> bool {
        self.first.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CaptureRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureRequest")
            .field("id", &self.id)
            .field("kind", &self.options.kind)
            .field("owners", &self.owner_ids())
            .field("cancelled", &self.is_cancelled())
            .field("sync_disabled", &self.is_sync_disabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferLayout, BufferUsage, PixelFormat};
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    struct TestOwner {
        id: StreamId,
        dropped: AtomicUsize,
    }

    impl TestOwner {
        fn new(id: u32) -> Arc<Self> {
            Arc::new(Self {
                id: StreamId(id),
                dropped: AtomicUsize::new(0),
            })
        }
    }

    impl RequestOwner for TestOwner {
        fn owner_id(&self) -> StreamId {
            self.id
        }

        fn drop_request(&self, _request: &Arc<CaptureRequest>) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn buffer() -> Buffer {
        Buffer::new(
            BufferLayout::new(4, 4, PixelFormat::Nv12, BufferUsage::CPU_READ),
            None,
        )
    }

    fn request_with(owners: &[Arc<TestOwner>], options: CaptureOptions) -> Arc<CaptureRequest> {
        let request = CaptureRequest::new(CaptureId(1), owners.len(), options);
        for owner in owners {
            let owner: Arc<dyn RequestOwner> = owner.clone();
            request.add_owner(&owner);
        }
        request
    }

    #[test]
    fn test_single_owner_full_cycle() {
        let owner = TestOwner::new(0);
        let request = request_with(&[owner.clone()], CaptureOptions::still());

        let begin = request.process(StreamId(0)).unwrap();
        request.attach_result(StreamId(0), buffer()).unwrap();
        let end = request.on_result(StreamId(0)).unwrap();

        assert!(end > begin);
        assert!(request.take_result(StreamId(0)).is_some());
        assert!(request.is_complete());
    }

    #[test]
    fn test_result_before_process_fails() {
        let owner = TestOwner::new(0);
        let request = request_with(&[owner], CaptureOptions::default());
        let mut early = buffer();
        early.set_frame_number(5);
        let returned = request.attach_result(StreamId(0), early).unwrap_err();
        assert_eq!(returned.frame_number(), 5);
        assert!(request.on_result(StreamId(0)).is_err());
    }

    #[test]
    fn test_single_shot_process_once() {
        let owner = TestOwner::new(0);
        let request = request_with(&[owner], CaptureOptions::default());
        request.process(StreamId(0)).unwrap();
        assert!(request.process(StreamId(0)).is_err());
    }

    #[test]
    fn test_continuous_processes_repeatedly() {
        let owner = TestOwner::new(0);
        let request = request_with(&[owner], CaptureOptions::repeating());
        for _ in 0..3 {
            request.process(StreamId(0)).unwrap();
            request.attach_result(StreamId(0), buffer()).unwrap();
            request.on_result(StreamId(0)).unwrap();
            request.take_result(StreamId(0));
        }
        assert_eq!(request.outstanding(StreamId(0)), 0);
    }

    #[test]
    fn test_unknown_owner_rejected() {
        let owner = TestOwner::new(0);
        let request = request_with(&[owner], CaptureOptions::default());
        assert!(request.process(StreamId(9)).is_err());
    }

    #[test]
    fn test_two_owners_share_timestamps() {
        let a = TestOwner::new(0);
        let b = TestOwner::new(1);
        let request = request_with(&[a, b], CaptureOptions::still());

        let r2 = request.clone();
        let other = thread::spawn(move || {
            let begin = r2.process(StreamId(1)).unwrap();
            r2.attach_result(StreamId(1), buffer()).unwrap();
            let end = r2.on_result(StreamId(1)).unwrap();
            (begin, end)
        });

        let begin = request.process(StreamId(0)).unwrap();
        request.attach_result(StreamId(0), buffer()).unwrap();
        let end = request.on_result(StreamId(0)).unwrap();

        assert_eq!(other.join().unwrap(), (begin, end));
        assert_eq!(request.begin_timestamp(), begin);
        assert_eq!(request.end_timestamp(), end);
    }

    #[test]
    fn test_cancel_notifies_owners_once_and_unblocks() {
        let a = TestOwner::new(0);
        let b = TestOwner::new(1);
        let request = request_with(&[a.clone(), b.clone()], CaptureOptions::default());

        let r2 = request.clone();
        let waiter = thread::spawn(move || r2.process(StreamId(0)));
        thread::sleep(Duration::from_millis(20));

        request.cancel();
        request.cancel();
        assert!(waiter.join().unwrap().is_ok());
        assert!(request.is_cancelled());
        assert!(!request.cancel_timestamp().is_none());
        assert_eq!(a.dropped.load(Ordering::SeqCst), 1);
        assert_eq!(b.dropped.load(Ordering::SeqCst), 1);
        assert!(request.process(StreamId(1)).is_err());
    }

    #[test]
    fn test_remove_owner_disables_sync() {
        let a = TestOwner::new(0);
        let b = TestOwner::new(1);
        let request = request_with(&[a, b], CaptureOptions::default());

        assert!(request.remove_owner(StreamId(1)));
        assert!(request.is_sync_disabled());
        // Would block forever without the disabled barrier
        request.process(StreamId(0)).unwrap();
    }
}
