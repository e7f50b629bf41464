//! Background reclamation of stale rate limiter state.
//!
//! The reclaimer periodically evicts timestamps older than the retention
//! horizon, drops scope keys whose windows become empty, and retires expired
//! blocks (decaying violation counts). It takes the rate limiter's lock once
//! per batch of keys and yields to the runtime between batches so a large
//! registry never starves concurrent evaluations.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::limiter::RateLimiter;

/// Scope keys reclaimed per lock acquisition.
pub const DEFAULT_RECLAIM_BATCH: usize = 512;

/// Default time between sweeps.
pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(300);

/// What a sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub evicted_timestamps: usize,
    pub removed_scopes: usize,
    pub expired_blocks: usize,
    pub decayed_violations: usize,
    pub forgotten_violators: usize,
}

impl ReclaimReport {
    /// Add another report's totals to this one.
    pub fn absorb(&mut self, other: ReclaimReport) {
        self.evicted_timestamps += other.evicted_timestamps;
        self.removed_scopes += other.removed_scopes;
        self.expired_blocks += other.expired_blocks;
        self.decayed_violations += other.decayed_violations;
        self.forgotten_violators += other.forgotten_violators;
    }
}

/// Periodic sweeper for a shared [`RateLimiter`].
pub struct Reclaimer;

impl Reclaimer {
    /// Spawn the reclaimer on the current tokio runtime.
    ///
    /// The first sweep runs one `interval` after spawning.
    pub fn spawn(
        limiter: Arc<RateLimiter>,
        interval: Duration,
        batch_size: usize,
    ) -> ReclaimerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let sweeps = Arc::new(AtomicU64::new(0));
        let completed = sweeps.clone();

        info!(
            interval_secs = interval.as_secs(),
            batch_size = batch_size,
            "Starting reclaimer"
        );

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = Self::sweep(&limiter, batch_size).await;
                        completed.fetch_add(1, Ordering::SeqCst);
                        debug!(
                            evicted = report.evicted_timestamps,
                            removed_scopes = report.removed_scopes,
                            expired_blocks = report.expired_blocks,
                            decayed = report.decayed_violations,
                            forgotten = report.forgotten_violators,
                            "Reclaim sweep finished"
                        );
                    }
                    // Fires on an explicit shutdown or when the handle is dropped.
                    _ = shutdown_rx.changed() => break,
                }
            }

            info!("Reclaimer stopped");
        });

        ReclaimerHandle {
            shutdown: shutdown_tx,
            task,
            sweeps,
        }
    }

    /// Run one full sweep, yielding to the runtime between batches.
    pub async fn sweep(limiter: &RateLimiter, batch_size: usize) -> ReclaimReport {
        let mut report = ReclaimReport::default();
        for batch in limiter.reclaim_batches(batch_size) {
            report.absorb(batch);
            tokio::task::yield_now().await;
        }
        report
    }
}

/// Handle to a running reclaimer. Dropping it stops the task.
pub struct ReclaimerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    sweeps: Arc<AtomicU64>,
}

impl ReclaimerHandle {
    /// Number of sweeps completed so far.
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::SeqCst)
    }

    /// Stop the reclaimer and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}
