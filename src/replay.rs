//! Traffic drivers used by the CLI.
//!
//! Both drivers read JSON-lines request records. [`Replayer`] evaluates a
//! recorded log against simulated time, so a day of traffic replays in
//! milliseconds with the same verdicts it would have produced live.
//! [`run_stream`] evaluates records as they arrive using the monotonic clock
//! and a background [`Reclaimer`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::io::{BufRead, Write};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::config::GuardConfig;
use crate::error::Result;
use crate::ratelimit::{
    millis, resolve_client_ip, DenialKind, GuardStats, ManualClock, RateLimiter, Reclaimer,
    TimeSource, Timestamp, Verdict,
};

/// One request in a traffic log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficRecord {
    /// Milliseconds since the start of the log. Ignored when streaming.
    #[serde(default)]
    pub offset_ms: u64,
    /// Raw `X-Forwarded-For` header value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_for: Option<String>,
    /// Raw `X-Real-IP` header value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_ip: Option<String>,
    /// Transport peer address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl TrafficRecord {
    pub fn parse(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }

    pub fn client_ip(&self) -> String {
        resolve_client_ip(
            self.forwarded_for.as_deref(),
            self.real_ip.as_deref(),
            self.peer.as_deref(),
        )
    }
}

/// The verdict for one record, as written to the output.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset_ms: Option<u64>,
    pub client_ip: String,
    pub result: Verdict,
}

/// Running totals over a traffic run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrafficSummary {
    pub requests: u64,
    pub allowed: u64,
    pub denied: BTreeMap<DenialKind, u64>,
    pub malformed: u64,
    pub reclaim_sweeps: u64,
}

impl TrafficSummary {
    fn observe(&mut self, verdict: &Verdict) {
        self.requests += 1;
        match verdict.denial_kind() {
            None => self.allowed += 1,
            Some(kind) => *self.denied.entry(kind).or_insert(0) += 1,
        }
    }

    pub fn denied_total(&self) -> u64 {
        self.denied.values().sum()
    }
}

/// Final output of a run.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficReport {
    pub summary: TrafficSummary,
    pub stats: GuardStats,
}

/// Replays a traffic log against a simulated clock.
pub struct Replayer {
    limiter: RateLimiter,
    clock: Arc<ManualClock>,
    reclaim_interval: Timestamp,
    batch_size: usize,
    next_reclaim: Timestamp,
    summary: TrafficSummary,
}

impl Replayer {
    pub fn new(config: &GuardConfig) -> Self {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = RateLimiter::with_clock(config.policy.clone(), clock.clone());
        let reclaim_interval = millis(config.reclaimer.interval()).max(1);

        Self {
            limiter,
            clock,
            reclaim_interval,
            batch_size: config.reclaimer.batch_size,
            next_reclaim: reclaim_interval,
            summary: TrafficSummary::default(),
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn summary(&self) -> &TrafficSummary {
        &self.summary
    }

    /// Move simulated time to `offset_ms`, sweeping at the last reclaim
    /// boundary crossed on the way. Offsets behind the clock are evaluated
    /// at the current simulated time.
    fn advance_to(&mut self, offset_ms: Timestamp) -> Timestamp {
        let at = offset_ms.max(self.clock.now());

        if at >= self.next_reclaim {
            // Sweeps between two requests see no new traffic, so only the last one matters.
            let missed = (at - self.next_reclaim) / self.reclaim_interval;
            let tick = self
                .next_reclaim
                .saturating_add(missed.saturating_mul(self.reclaim_interval));

            self.clock.set(tick);
            let report = self.limiter.reclaim_in_batches(self.batch_size);
            self.summary.reclaim_sweeps += 1;
            debug!(
                at_ms = tick,
                removed_scopes = report.removed_scopes,
                expired_blocks = report.expired_blocks,
                "Replay reclaim sweep"
            );

            self.next_reclaim = tick.saturating_add(self.reclaim_interval);
        }

        self.clock.set(at);
        at
    }

    /// Evaluate a single record.
    pub fn process(&mut self, record: &TrafficRecord) -> Decision {
        let at = self.advance_to(record.offset_ms);
        let client_ip = record.client_ip();
        let verdict = self.limiter.evaluate(
            &client_ip,
            record.endpoint.as_deref(),
            record.user_id.as_deref(),
        );
        self.summary.observe(&verdict);

        Decision {
            offset_ms: Some(at),
            client_ip,
            result: verdict,
        }
    }

    /// Replay every record in `input`, writing one JSON decision per line
    /// to `output` when `emit_decisions` is set. Malformed lines are logged
    /// and skipped.
    pub fn run<R: BufRead, W: Write>(
        &mut self,
        input: R,
        output: &mut W,
        emit_decisions: bool,
    ) -> Result<()> {
        for (index, line) in input.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let record = match TrafficRecord::parse(trimmed) {
                Ok(record) => record,
                Err(e) => {
                    warn!(line = index + 1, error = %e, "Skipping malformed traffic record");
                    self.summary.malformed += 1;
                    continue;
                }
            };

            let decision = self.process(&record);
            if emit_decisions {
                serde_json::to_writer(&mut *output, &decision)?;
                output.write_all(b"\n")?;
            }
        }

        output.flush()?;
        info!(
            requests = self.summary.requests,
            denied = self.summary.denied_total(),
            "Replay finished"
        );
        Ok(())
    }

    pub fn report(&self) -> TrafficReport {
        TrafficReport {
            summary: self.summary.clone(),
            stats: self.limiter.get_stats(),
        }
    }
}

/// Evaluate records from `input` as they arrive until end of input or
/// until `shutdown` resolves.
pub async fn stream<R, W, S>(
    limiter: &RateLimiter,
    input: R,
    output: &mut W,
    shutdown: S,
) -> Result<TrafficSummary>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    let mut lines = input.lines();
    let mut summary = TrafficSummary::default();
    let mut line_no = 0usize;
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut shutdown => {
                info!("Stream interrupted");
                break;
            }
        };
        let Some(line) = line else {
            debug!("End of input");
            break;
        };
        line_no += 1;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record = match TrafficRecord::parse(trimmed) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed traffic record");
                summary.malformed += 1;
                continue;
            }
        };

        let client_ip = record.client_ip();
        let verdict = limiter.evaluate(
            &client_ip,
            record.endpoint.as_deref(),
            record.user_id.as_deref(),
        );
        summary.observe(&verdict);

        let mut encoded = serde_json::to_vec(&Decision {
            offset_ms: None,
            client_ip,
            result: verdict,
        })?;
        encoded.push(b'\n');
        output.write_all(&encoded).await?;
    }

    output.flush().await?;
    Ok(summary)
}

/// Stream records through a fresh limiter with a background reclaimer.
pub async fn run_stream<R, W, S>(
    config: &GuardConfig,
    input: R,
    output: &mut W,
    shutdown: S,
) -> Result<TrafficReport>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    let limiter = Arc::new(RateLimiter::new(config.policy.clone()));
    let reclaimer = Reclaimer::spawn(
        limiter.clone(),
        config.reclaimer.interval(),
        config.reclaimer.batch_size,
    );

    let result = stream(&limiter, input, output, shutdown).await;
    let sweeps = reclaimer.sweeps();
    reclaimer.shutdown().await;

    let mut summary = result?;
    summary.reclaim_sweeps = sweeps;
    Ok(TrafficReport {
        summary,
        stats: limiter.get_stats(),
    })
}
