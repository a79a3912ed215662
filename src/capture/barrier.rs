//! Multi-owner rendezvous.
//!
//! A [`Rendezvous`] releases its waiters only once every expected owner has
//! arrived. The last arrival stamps a timestamp that every released owner
//! observes, then the barrier resets for the next cycle (continuous requests
//! pass through the same barrier every iteration).
//!
//! An owner that never arrives blocks its siblings forever. [`disable`]
//! turns the barrier into a no-op and releases everyone currently waiting;
//! teardown paths call it before letting an owner go.
//!
//! [`disable`]: Rendezvous::disable

use crate::buffer::StreamId;
use crate::clock::{self, ClockTime};
use crate::error::{Error, Result};
use crate::observability;
use crate::sync::{lock, wait};
use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex};
use std::time::Instant;

struct RendezvousState {
    expected: usize,
    arrived: BTreeSet<StreamId>,
    generation: u64,
    timestamp: ClockTime,
    disabled: bool,
}

/// Reusable barrier for a fixed set of owners.
pub struct Rendezvous {
    phase: &'static str,
    state: Mutex<RendezvousState>,
    released: Condvar,
}

impl Rendezvous {
    /// Barrier expecting `expected` owners per cycle.
    pub fn new(phase: &'static str, expected: usize) -> Self {
        Self {
            phase,
            state: Mutex::new(RendezvousState {
                expected: expected.max(1),
                arrived: BTreeSet::new(),
                generation: 0,
                timestamp: ClockTime::NONE,
                disabled: false,
            }),
            released: Condvar::new(),
        }
    }

    /// Arrive and block until all expected owners have arrived.
    ///
    /// Returns the timestamp recorded by the last arrival, identical for
    /// every owner released in the same cycle. A disabled barrier returns
    /// immediately with a fresh timestamp.
    ///
    /// # Errors
    ///
    /// Arriving twice in the same cycle is an error.
    pub fn arrive(&self, owner: StreamId) -> Result<ClockTime> {
        let start = Instant::now();
        let mut state = lock(&self.state);

        if state.disabled {
            return Ok(clock::now());
        }
        if !state.arrived.insert(owner) {
            return Err(Error::state(format!(
                "{} already waiting at {} barrier",
                owner, self.phase
            )));
        }

        if state.arrived.len() >= state.expected {
            let timestamp = Self::release(&mut state);
            drop(state);
            self.released.notify_all();
            tracing::trace!(phase = self.phase, %owner, "barrier released by last owner");
            return Ok(timestamp);
        }

        let generation = state.generation;
        tracing::trace!(
            phase = self.phase,
            %owner,
            arrived = state.arrived.len(),
            expected = state.expected,
            "waiting at barrier"
        );
        while state.generation == generation && !state.disabled {
            state = wait(&self.released, state);
        }

        let timestamp = if state.generation != generation {
            state.timestamp
        } else {
            clock::now()
        };
        drop(state);

        observability::record_barrier_wait(self.phase, start.elapsed());
        Ok(timestamp)
    }

    fn release(state: &mut RendezvousState) -> ClockTime {
        let timestamp = clock::now();
        state.timestamp = timestamp;
        state.generation += 1;
        state.arrived.clear();
        timestamp
    }

    /// Make the barrier a no-op and release current waiters.
    pub fn disable(&self) {
        let mut state = lock(&self.state);
        state.disabled = true;
        state.arrived.clear();
        drop(state);
        self.released.notify_all();
    }

    /// Whether [`disable`](Self::disable) was called.
    pub fn is_disabled(&self) -> bool {
        lock(&self.state).disabled
    }

    /// Change the expected owner count.
    ///
    /// If the owners already waiting now satisfy the count, they are released.
    pub fn set_expected(&self, expected: usize) {
        let mut state = lock(&self.state);
        state.expected = expected.max(1);
        if !state.disabled && !state.arrived.is_empty() && state.arrived.len() >= state.expected {
            Self::release(&mut state);
            drop(state);
            self.released.notify_all();
        }
    }

    /// Expected owners per cycle.
    pub fn expected(&self) -> usize {
        lock(&self.state).expected
    }

    /// Owners currently waiting.
    pub fn waiting(&self) -> usize {
        lock(&self.state).arrived.len()
    }

    /// Completed cycles.
    pub fn generation(&self) -> u64 {
        lock(&self.state).generation
    }

    /// Timestamp of the last release, `NONE` before the first.
    pub fn timestamp(&self) -> ClockTime {
        lock(&self.state).timestamp
    }
}

impl std::fmt::Debug for Rendezvous {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Rendezvous")
            .field("phase", &self.phase)
            .field("expected", &state.expected)
            .field("arrived", &state.arrived.len())
            .field("generation", &state.generation)
            .field("disabled", &state.disabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_single_owner_passes_through() {
        let barrier = Rendezvous::new("dispatch", 1);
        let ts = barrier.arrive(StreamId(0)).unwrap();
        assert!(!ts.is_none());
        assert_eq!(barrier.generation(), 1);
        assert_eq!(barrier.timestamp(), ts);
    }

    #[test]
    fn test_all_owners_released_together_with_same_timestamp() {
        let barrier = Arc::new(Rendezvous::new("dispatch", 3));
        let released = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let barrier = barrier.clone();
                let released = released.clone();
                thread::spawn(move || {
                    let ts = barrier.arrive(StreamId(i)).unwrap();
                    released.fetch_add(1, Ordering::SeqCst);
                    ts
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(released.load(Ordering::SeqCst), 0);
        assert_eq!(barrier.waiting(), 2);

        let last = barrier.arrive(StreamId(2)).unwrap();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), last);
        }
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_duplicate_arrival_fails() {
        let barrier = Arc::new(Rendezvous::new("result", 2));
        let b2 = barrier.clone();
        let waiter = thread::spawn(move || b2.arrive(StreamId(1)));

        while barrier.waiting() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(barrier.arrive(StreamId(1)).is_err());

        barrier.arrive(StreamId(2)).unwrap();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_disable_releases_waiters() {
        let barrier = Arc::new(Rendezvous::new("dispatch", 2));
        let b2 = barrier.clone();
        let waiter = thread::spawn(move || b2.arrive(StreamId(0)).is_ok());

        thread::sleep(Duration::from_millis(20));
        barrier.disable();
        assert!(waiter.join().unwrap());

        // Later arrivals pass straight through
        barrier.arrive(StreamId(5)).unwrap();
        assert!(barrier.is_disabled());
        assert_eq!(barrier.generation(), 0);
    }

    #[test]
    fn test_barrier_is_reusable() {
        let barrier = Arc::new(Rendezvous::new("dispatch", 2));
        for _ in 0..3 {
            let b2 = barrier.clone();
            let other = thread::spawn(move || b2.arrive(StreamId(1)).unwrap());
            let mine = barrier.arrive(StreamId(0)).unwrap();
            assert_eq!(other.join().unwrap(), mine);
        }
        assert_eq!(barrier.generation(), 3);
    }

    #[test]
    fn test_lowering_expected_releases_waiters() {
        let barrier = Arc::new(Rendezvous::new("dispatch", 3));
        let b2 = barrier.clone();
        let waiter = thread::spawn(move || b2.arrive(StreamId(0)).unwrap());

        while barrier.waiting() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        barrier.set_expected(1);
        let ts = waiter.join().unwrap();
        assert_eq!(ts, barrier.timestamp());
    }
}
