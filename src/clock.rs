//! Capture timestamps.
//!
//! - [`ClockTime`]: A nanosecond timestamp type (8 bytes, Copy)
//! - [`now`]: Process-wide monotonic clock used to stamp barrier releases
//!
//! Timestamps returned by [`now`] are strictly increasing across the whole
//! process. Capture messages are grouped by timestamp equality, so two
//! different barrier releases must never share a value.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Time in nanoseconds since the process clock epoch (8 bytes, Copy).
///
/// # Special Values
///
/// - `ClockTime::ZERO`: Zero time
/// - `ClockTime::NONE`: Invalid/unset time (sentinel value)
///
/// # Examples
///
/// ```rust
/// use campipe::clock::ClockTime;
///
/// let t = ClockTime::from_millis(1500);
/// assert_eq!(t.millis(), 1500);
/// assert_eq!(format!("{}", t), "1.500s");
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ClockTime(u64);

impl ClockTime {
    /// Zero time.
    pub const ZERO: Self = Self(0);

    /// Invalid/unset time (sentinel value).
    pub const NONE: Self = Self(u64::MAX);

    /// Create from nanoseconds.
    #[inline]
    pub const fn from_nanos(ns: u64) -> Self {
        Self(ns)
    }

    /// Create from milliseconds.
    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms.saturating_mul(1_000_000))
    }

    /// Get as nanoseconds.
    #[inline]
    pub const fn nanos(self) -> u64 {
        self.0
    }

    /// Get as milliseconds (truncated).
    #[inline]
    pub const fn millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Get as seconds (truncated).
    #[inline]
    pub const fn secs(self) -> u64 {
        self.0 / 1_000_000_000
    }

    /// Check if this is the NONE sentinel value.
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    /// Convert to Option, returning None for the NONE sentinel.
    #[inline]
    pub const fn to_option(self) -> Option<Self> {
        if self.is_none() { None } else { Some(self) }
    }

    /// Elapsed duration from `earlier` to `self`, zero if `earlier` is later.
    pub fn duration_since(self, earlier: Self) -> Duration {
        if self.is_none() || earlier.is_none() {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl std::fmt::Display for ClockTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            let secs = self.secs();
            let ms = (self.0 / 1_000_000) % 1000;
            write!(f, "{}.{:03}s", secs, ms)
        }
    }
}

static EPOCH: OnceLock<Instant> = OnceLock::new();
static LAST: AtomicU64 = AtomicU64::new(0);

/// Current process-monotonic time.
///
/// Never returns the same value twice.
pub fn now() -> ClockTime {
    let epoch = EPOCH.get_or_init(Instant::now);
    // +1 keeps the first reading distinct from ClockTime::ZERO
    let elapsed = epoch.elapsed().as_nanos() as u64 + 1;

    let mut last = LAST.load(Ordering::Relaxed);
    loop {
        let next = elapsed.max(last + 1);
        match LAST.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return ClockTime(next),
            Err(current) => last = current,
        }
    }
}
