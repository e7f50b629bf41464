//! Violation tracking and the escalating blocklist.

use std::collections::HashMap;
use std::time::Duration;

use super::clock::{millis, Timestamp};
use super::rules::BlockPolicy;
use super::verdict::DenialKind;

/// A temporary block on a client IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    /// When the block was created
    pub blocked_at: Timestamp,
    /// When the block stops applying
    pub expires_at: Timestamp,
    /// The denial that triggered the block
    pub reason: DenialKind,
    /// Violation count when the block was created
    pub violations: u32,
}

impl BlockEntry {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Time left until the block expires.
    pub fn remaining(&self, now: Timestamp) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now))
    }

    /// Time since the block was created.
    pub fn elapsed(&self, now: Timestamp) -> Duration {
        Duration::from_millis(now.saturating_sub(self.blocked_at))
    }

    /// Remaining time rounded up to whole seconds.
    pub fn remaining_secs(&self, now: Timestamp) -> u64 {
        self.expires_at.saturating_sub(now).div_ceil(1_000)
    }
}

/// Result of sweeping expired blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlocklistSweep {
    pub expired: usize,
    pub decayed: usize,
    /// Idle IPs whose violations were dropped
    pub forgotten: usize,
}

#[derive(Debug, Clone, Copy)]
struct ViolationRecord {
    count: u32,
    last_at: Timestamp,
}

/// Per-IP violation counts and the blocklist built from them.
#[derive(Debug)]
pub struct ViolationTracker {
    policy: BlockPolicy,
    violations: HashMap<String, ViolationRecord>,
    blocklist: HashMap<String, BlockEntry>,
}

impl ViolationTracker {
    pub fn new(policy: BlockPolicy) -> Self {
        Self {
            policy,
            violations: HashMap::new(),
            blocklist: HashMap::new(),
        }
    }

    /// Return the active block for an IP.
    ///
    /// An expired entry is deleted on the spot without decaying the IP's
    /// violations; decay only happens when a sweep retires the block.
    pub fn check_block(&mut self, ip: &str, now: Timestamp) -> Option<BlockEntry> {
        let entry = *self.blocklist.get(ip)?;
        if entry.is_expired(now) {
            self.blocklist.remove(ip);
            return None;
        }
        Some(entry)
    }

    /// Count a violation and block the IP once the threshold is reached.
    ///
    /// Returns the new block, if one was created or refreshed.
    pub fn record_violation(
        &mut self,
        ip: &str,
        reason: DenialKind,
        now: Timestamp,
    ) -> Option<BlockEntry> {
        let record = self
            .violations
            .entry(ip.to_string())
            .or_insert(ViolationRecord { count: 0, last_at: now });
        record.count = record.count.saturating_add(1);
        record.last_at = now;
        let count = record.count;

        if count < self.policy.violation_threshold {
            return None;
        }

        let duration = self.policy.block_duration(count - 1);
        let entry = BlockEntry {
            blocked_at: now,
            expires_at: now.saturating_add(millis(duration)),
            reason,
            violations: count,
        };
        self.blocklist.insert(ip.to_string(), entry);
        Some(entry)
    }

    /// Remove expired blocks, decaying each IP's violation count by one.
    ///
    /// Unblocked IPs whose last violation is older than the policy's forget
    /// window are dropped entirely.
    pub fn sweep_expired(&mut self, now: Timestamp) -> BlocklistSweep {
        let expired: Vec<String> = self
            .blocklist
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(ip, _)| ip.clone())
            .collect();

        let mut sweep = BlocklistSweep {
            expired: expired.len(),
            ..BlocklistSweep::default()
        };

        for ip in expired {
            self.blocklist.remove(&ip);
            if let Some(record) = self.violations.get_mut(&ip) {
                record.count = record.count.saturating_sub(1);
                sweep.decayed += 1;
                if record.count == 0 {
                    self.violations.remove(&ip);
                }
            }
        }

        let forget_after = millis(self.policy.forget_after());
        let blocklist = &self.blocklist;
        let before = self.violations.len();
        self.violations.retain(|ip, record| {
            blocklist.contains_key(ip) || now.saturating_sub(record.last_at) < forget_after
        });
        sweep.forgotten = before - self.violations.len();

        sweep
    }

    pub fn violations(&self, ip: &str) -> u32 {
        self.violations.get(ip).map_or(0, |record| record.count)
    }

    /// Lift a block without touching the violation count.
    pub fn unblock(&mut self, ip: &str) -> bool {
        self.blocklist.remove(ip).is_some()
    }

    /// Forget everything about an IP.
    pub fn reset(&mut self, ip: &str) {
        self.blocklist.remove(ip);
        self.violations.remove(ip);
    }

    pub fn total_violations(&self) -> u64 {
        self.violations.values().map(|r| u64::from(r.count)).sum()
    }

    /// IPs with the most violations, highest first; ties are ordered by IP.
    pub fn top_violators(&self, n: usize) -> Vec<(String, u32)> {
        let mut ranked: Vec<(String, u32)> = self
            .violations
            .iter()
            .map(|(ip, record)| (ip.clone(), record.count))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(n);
        ranked
    }

    pub fn blocked(&self) -> impl Iterator<Item = (&str, &BlockEntry)> {
        self.blocklist.iter().map(|(ip, entry)| (ip.as_str(), entry))
    }

    pub fn blocked_count(&self) -> usize {
        self.blocklist.len()
    }
}
