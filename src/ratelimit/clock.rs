//! Monotonic time sources used for all window math.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Milliseconds on a monotonic timeline.
pub type Timestamp = u64;

/// Convert a duration into timestamp units.
pub fn millis(duration: Duration) -> Timestamp {
    duration.as_millis().min(u64::MAX as u128) as Timestamp
}

/// Source of the current time for the rate limiter.
///
/// Abstracted so tests and replays can drive the engine deterministically.
pub trait TimeSource: Send + Sync {
    /// Returns the current timestamp in milliseconds.
    fn now(&self) -> Timestamp;
}

/// Monotonic clock measuring milliseconds since its creation.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn now(&self) -> Timestamp {
        millis(self.origin.elapsed())
    }
}

/// Manually driven clock.
#[derive(Debug, Default)]
pub struct ManualClock {
    time: AtomicU64,
}

impl ManualClock {
    /// Create a clock starting at `initial` milliseconds.
    pub fn new(initial: Timestamp) -> Self {
        Self {
            time: AtomicU64::new(initial),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.time.fetch_add(millis(by), Ordering::SeqCst);
    }

    /// Set the clock to an absolute timestamp.
    ///
    /// Setting it backwards is allowed but the rate limiter clamps
    /// regressions to keep its windows ordered.
    pub fn set(&self, time: Timestamp) {
        self.time.store(time, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Timestamp {
        self.time.load(Ordering::SeqCst)
    }
}
