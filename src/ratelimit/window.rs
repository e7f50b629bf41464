//! Exact sliding window counter.

use std::collections::VecDeque;
use std::time::Duration;

use super::clock::{millis, Timestamp};

/// Named window granularity used by the limit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeWindow {
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
        }
    }

    /// Length of the window in whole seconds, used as a retry hint.
    pub fn as_secs(&self) -> u64 {
        self.duration().as_secs()
    }

    pub fn label(&self) -> &'static str {
        match self {
            TimeWindow::Minute => "min",
            TimeWindow::Hour => "hour",
        }
    }
}

/// Longest window any caller queries. Timestamps older than this are dropped.
pub const RETENTION_HORIZON: Duration = Duration::from_secs(3600);

/// Request timestamps for a single scope key, oldest first.
///
/// One window serves every granularity for its key: eviction only happens at
/// the retention horizon, and shorter windows are counted by binary search
/// over the retained suffix.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    timestamps: VecDeque<Timestamp>,
    horizon: Timestamp,
}

impl SlidingWindow {
    /// Create an empty window retaining one hour of history.
    pub fn new() -> Self {
        Self::with_horizon(RETENTION_HORIZON)
    }

    /// Create an empty window retaining `horizon` of history.
    pub fn with_horizon(horizon: Duration) -> Self {
        Self {
            timestamps: VecDeque::new(),
            horizon: millis(horizon),
        }
    }

    /// Append a request timestamp.
    ///
    /// A timestamp older than the newest recorded one is clamped to it, so
    /// the sequence stays non-decreasing even if an injected clock regresses.
    pub fn record(&mut self, now: Timestamp) {
        let at = match self.timestamps.back() {
            Some(&last) if now < last => last,
            _ => now,
        };
        self.timestamps.push_back(at);
    }

    /// Count requests with `now - window <= t <= now`.
    ///
    /// Evicts everything that fell out of the retention horizon first.
    pub fn count_in_window(&mut self, window: Duration, now: Timestamp) -> usize {
        self.evict(now);

        let lower = now.saturating_sub(millis(window));
        let start = self.timestamps.partition_point(|&t| t < lower);
        let end = self.timestamps.partition_point(|&t| t <= now);
        debug_assert!(start <= end, "sliding window is out of order");
        end - start
    }

    /// Drop timestamps older than the retention horizon.
    ///
    /// Returns the number of timestamps removed.
    pub fn evict(&mut self, now: Timestamp) -> usize {
        let cutoff = now.saturating_sub(self.horizon);
        let mut removed = 0;
        while self.timestamps.front().is_some_and(|&t| t < cutoff) {
            self.timestamps.pop_front();
            removed += 1;
        }
        removed
    }

    /// Number of retained timestamps.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new()
    }
}
