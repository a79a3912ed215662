//! Lock helpers shared by the pool, barrier and stream workers.
//!
//! A worker that panics while holding a lock must not wedge teardown, so
//! poisoned guards are recovered rather than propagated.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[inline]
pub(crate) fn wait<'a, T>(cond: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

/// Wait until `deadline`; returns the guard and whether the deadline passed.
pub(crate) fn wait_until<'a, T>(
    cond: &Condvar,
    guard: MutexGuard<'a, T>,
    deadline: Instant,
) -> (MutexGuard<'a, T>, bool) {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return (guard, true);
    }
    let (guard, result) = cond
        .wait_timeout(guard, remaining)
        .unwrap_or_else(PoisonError::into_inner);
    (guard, result.timed_out())
}

/// [`wait_until`] with an optional deadline; `None` waits for a notification.
pub(crate) fn wait_deadline<'a, T>(
    cond: &Condvar,
    guard: MutexGuard<'a, T>,
    deadline: Option<Instant>,
) -> (MutexGuard<'a, T>, bool) {
    match deadline {
        Some(deadline) => wait_until(cond, guard, deadline),
        None => (wait(cond, guard), false),
    }
}

/// `now + timeout`, or `None` when the instant is not representable.
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Block until the condition holds or the waiter is stopped.
    #[default]
    Forever,
    /// Do not block.
    Immediate,
    /// Block at most this long.
    After(Duration),
}

impl Timeout {
    /// Map a signed millisecond count: negative blocks forever, zero returns
    /// immediately, positive waits that long.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            ms if ms < 0 => Timeout::Forever,
            0 => Timeout::Immediate,
            ms => Timeout::After(Duration::from_millis(ms as u64)),
        }
    }

    /// `None` means no deadline: `Forever`, or a wait too long to represent.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        match self {
            Timeout::Forever => None,
            Timeout::Immediate => Some(Instant::now()),
            Timeout::After(d) => deadline_after(*d),
        }
    }
}
