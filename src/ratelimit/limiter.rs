//! Core rate limiter implementation.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, trace};

use super::client::normalize_client_ip;
use super::clock::{MonotonicClock, TimeSource, Timestamp};
use super::reclaimer::{ReclaimReport, DEFAULT_RECLAIM_BATCH};
use super::rules::LimitPolicy;
use super::scope::{Scope, ScopeKey, ScopeRegistry};
use super::verdict::{Allowance, Denial, DenialKind, LimitsSnapshot, Usage, Verdict};
use super::violations::ViolationTracker;
use super::window::{SlidingWindow, TimeWindow};

/// Number of violators reported by [`RateLimiter::get_stats`].
pub const DEFAULT_TOP_VIOLATORS: usize = 10;

/// Mutable state guarded by the rate limiter's lock.
#[derive(Debug)]
struct LimiterState {
    scopes: ScopeRegistry,
    violations: ViolationTracker,
}

/// The abuse mitigation engine.
///
/// Every evaluation runs under a single lock, so the blocklist check, counter
/// updates and violation bookkeeping for one request are atomic with respect
/// to all other evaluations. Share it behind an `Arc`.
pub struct RateLimiter {
    policy: LimitPolicy,
    clock: Arc<dyn TimeSource>,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    /// Create a rate limiter using the monotonic system clock.
    pub fn new(policy: LimitPolicy) -> Self {
        Self::with_clock(policy, Arc::new(MonotonicClock::new()))
    }

    /// Create a rate limiter driven by the given time source.
    pub fn with_clock(policy: LimitPolicy, clock: Arc<dyn TimeSource>) -> Self {
        let violations = ViolationTracker::new(policy.blocking.clone());
        Self {
            policy,
            clock,
            state: Mutex::new(LimiterState {
                scopes: ScopeRegistry::new(),
                violations,
            }),
        }
    }

    pub fn policy(&self) -> &LimitPolicy {
        &self.policy
    }

    /// Evaluate one request against every applicable scope.
    ///
    /// Scopes are checked in a fixed order (blocklist, global, IP, user,
    /// endpoint) and the first exceeded limit decides the denial. An empty
    /// client IP is tracked as `"unknown"`.
    pub fn evaluate(
        &self,
        client_ip: &str,
        endpoint: Option<&str>,
        user_id: Option<&str>,
    ) -> Verdict {
        let ip = normalize_client_ip(client_ip);
        let endpoint = endpoint.filter(|e| !e.is_empty());
        let user_id = user_id.filter(|u| !u.is_empty());

        let result = {
            let mut state = self.state.lock();
            let now = self.clock.now();

            trace!(
                client_ip = %ip,
                endpoint = ?endpoint,
                user_id = ?user_id,
                now = now,
                "Evaluating request"
            );

            let result = self.evaluate_locked(&mut state, ip, endpoint, user_id, now);
            if let Err(denial) = &result {
                if denial.kind.is_violation() {
                    self.record_violation(&mut state, ip, denial.kind, now);
                }
            }
            result
        };

        match result {
            Ok(allowance) => Verdict::Allowed(allowance),
            Err(denial) => {
                info!(
                    client_ip = %ip,
                    endpoint = ?endpoint,
                    user_id = ?user_id,
                    kind = %denial.kind,
                    retry_after_secs = denial.retry_after_secs,
                    "Request denied"
                );
                Verdict::Denied(denial)
            }
        }
    }

    fn evaluate_locked(
        &self,
        state: &mut LimiterState,
        ip: &str,
        endpoint: Option<&str>,
        user_id: Option<&str>,
        now: Timestamp,
    ) -> Result<Allowance, Denial> {
        let policy = &self.policy;

        // 1. Blocked IPs are rejected before any counter is touched.
        if let Some(block) = state.violations.check_block(ip, now) {
            return Err(Denial::new(
                DenialKind::IpBlocked,
                block.remaining_secs(now),
                "IP temporarily blocked for excessive requests",
            ));
        }

        // 2. Global capacity. Not counted as a violation.
        let (global_minute, global_hour) = {
            let window = state.scopes.record(ScopeKey::Global, now);
            minute_and_hour(window, now)
        };
        let global = [
            (TimeWindow::Minute, global_minute),
            (TimeWindow::Hour, global_hour),
        ];
        for (window, count) in global {
            if count > policy.global.limit(window) {
                return Err(Denial::new(
                    DenialKind::GlobalLimitExceeded,
                    window.as_secs(),
                    format!(
                        "Service temporarily overloaded ({} requests/{}), try again later",
                        count,
                        window.label()
                    ),
                ));
            }
        }

        // 3. Per-IP burst, minute and hour limits. These are the only denials
        // that count as violations.
        let (ip_burst, ip_minute, ip_hour) = {
            let window = state.scopes.record(ScopeKey::ip(ip), now);
            let burst = window.count_in_window(policy.per_ip.burst_window(), now) as u64;
            let (minute, hour) = minute_and_hour(window, now);
            (burst, minute, hour)
        };

        if ip_burst > policy.per_ip.burst_limit {
            return Err(Denial::new(
                DenialKind::BurstLimitExceeded,
                policy.per_ip.burst_window_secs,
                format!(
                    "Too many requests in a short time ({} in {}s)",
                    ip_burst, policy.per_ip.burst_window_secs
                ),
            ));
        }

        for (window, count) in [(TimeWindow::Minute, ip_minute), (TimeWindow::Hour, ip_hour)] {
            if count > policy.per_ip.limit(window) {
                return Err(Denial::new(
                    DenialKind::RateLimitExceeded,
                    window.as_secs(),
                    format!("Request limit exceeded ({}/{})", count, window.label()),
                ));
            }
        }

        // 4. Per-user limits. Independent of the blocklist.
        let (user_minute, user_hour) = match user_id {
            Some(user) => {
                let window = state.scopes.record(ScopeKey::user(user), now);
                let (minute, hour) = minute_and_hour(window, now);

                for (window, count) in [(TimeWindow::Minute, minute), (TimeWindow::Hour, hour)] {
                    if count > policy.per_user.limit(window) {
                        return Err(Denial::new(
                            DenialKind::UserLimitExceeded,
                            window.as_secs(),
                            format!("User request limit exceeded ({}/{})", count, window.label()),
                        ));
                    }
                }
                (Some(minute), Some(hour))
            }
            None => (None, None),
        };

        // 5. Endpoint overrides, counted per IP.
        let endpoint_limits = endpoint.and_then(|path| policy.endpoint(path).map(|l| (path, l)));
        let (endpoint_minute, endpoint_hour) = match endpoint_limits {
            Some((path, limits)) => {
                let window = state.scopes.record(ScopeKey::endpoint(ip, path), now);
                let (minute, hour) = minute_and_hour(window, now);

                for (window, count) in [(TimeWindow::Minute, minute), (TimeWindow::Hour, hour)] {
                    if limits.limit(window).is_some_and(|limit| count > limit) {
                        return Err(Denial::new(
                            DenialKind::EndpointLimitExceeded,
                            window.as_secs(),
                            format!(
                                "Endpoint {} limit exceeded ({}/{})",
                                path,
                                count,
                                window.label()
                            ),
                        ));
                    }
                }
                (Some(minute), Some(hour))
            }
            None => (None, None),
        };

        // 6. Allowed.
        Ok(Allowance {
            client_ip: ip.to_string(),
            user_id: user_id.map(str::to_string),
            endpoint: endpoint.map(str::to_string),
            usage: Usage {
                ip_burst,
                ip_minute,
                ip_hour,
                user_minute,
                user_hour,
                global_minute,
                global_hour,
                endpoint_minute,
                endpoint_hour,
            },
            limits: LimitsSnapshot {
                ip_burst: policy.per_ip.burst_limit,
                ip_minute: policy.per_ip.requests_per_minute,
                ip_hour: policy.per_ip.requests_per_hour,
                user_minute: policy.per_user.requests_per_minute,
                user_hour: policy.per_user.requests_per_hour,
                global_minute: policy.global.requests_per_minute,
                global_hour: policy.global.requests_per_hour,
                endpoint_minute: endpoint_limits.and_then(|(_, l)| l.requests_per_minute),
                endpoint_hour: endpoint_limits.and_then(|(_, l)| l.requests_per_hour),
            },
        })
    }

    fn record_violation(
        &self,
        state: &mut LimiterState,
        ip: &str,
        reason: DenialKind,
        now: Timestamp,
    ) {
        if let Some(block) = state.violations.record_violation(ip, reason, now) {
            info!(
                client_ip = %ip,
                reason = %reason,
                violations = block.violations,
                block_secs = block.remaining(now).as_secs(),
                "IP blocked"
            );
        }
    }

    /// Whether an IP is currently blocked.
    pub fn is_blocked(&self, ip: &str) -> bool {
        let mut state = self.state.lock();
        let now = self.clock.now();
        state.violations.check_block(normalize_client_ip(ip), now).is_some()
    }

    pub fn violation_count(&self, ip: &str) -> u32 {
        self.state.lock().violations.violations(normalize_client_ip(ip))
    }

    /// Number of timestamps retained for a scope key.
    pub fn tracked_requests(&self, key: &ScopeKey) -> usize {
        self.state.lock().scopes.get(key).map_or(0, SlidingWindow::len)
    }

    /// Number of scope keys currently tracked.
    pub fn tracked_scopes(&self) -> usize {
        self.state.lock().scopes.len()
    }

    /// Lift a block early. Violations are kept.
    pub fn unblock(&self, ip: &str) -> bool {
        let ip = normalize_client_ip(ip);
        let removed = self.state.lock().violations.unblock(ip);
        if removed {
            info!(client_ip = %ip, "IP unblocked");
        }
        removed
    }

    /// Clear all counters, violations and blocks for an IP.
    pub fn reset(&self, ip: &str) {
        let ip = normalize_client_ip(ip);
        let mut state = self.state.lock();
        let scopes = state.scopes.remove_ip(ip);
        state.violations.reset(ip);
        debug!(client_ip = %ip, scopes = scopes, "IP state reset");
    }

    /// Snapshot of the tracked scope keys.
    pub fn scope_keys(&self) -> Vec<ScopeKey> {
        self.state.lock().scopes.keys()
    }

    /// Evict expired timestamps for a batch of keys under one lock hold.
    pub fn reclaim_scopes(&self, keys: &[ScopeKey]) -> ReclaimReport {
        let mut state = self.state.lock();
        let now = self.clock.now();
        let mut report = ReclaimReport::default();

        for key in keys {
            let outcome = state.scopes.reclaim(key, now);
            report.evicted_timestamps += outcome.evicted;
            if outcome.removed {
                report.removed_scopes += 1;
            }
        }

        report
    }

    /// Remove expired blocks, decay the affected violation counts and forget
    /// idle violators.
    pub fn reclaim_blocklist(&self) -> ReclaimReport {
        let mut state = self.state.lock();
        let now = self.clock.now();
        let sweep = state.violations.sweep_expired(now);

        ReclaimReport {
            expired_blocks: sweep.expired,
            decayed_violations: sweep.decayed,
            forgotten_violators: sweep.forgotten,
            ..ReclaimReport::default()
        }
    }

    /// Run a full reclaim sweep using the default batch size.
    pub fn reclaim(&self) -> ReclaimReport {
        self.reclaim_in_batches(DEFAULT_RECLAIM_BATCH)
    }

    /// Lazily reclaim the tracked keys in batches, then the blocklist.
    ///
    /// Each item takes the lock once, so callers can pause between items.
    pub fn reclaim_batches(&self, batch_size: usize) -> impl Iterator<Item = ReclaimReport> + '_ {
        let batch_size = batch_size.max(1);
        let mut keys = self.scope_keys().into_iter();

        std::iter::from_fn(move || {
            let batch: Vec<ScopeKey> = keys.by_ref().take(batch_size).collect();
            (!batch.is_empty()).then(|| self.reclaim_scopes(&batch))
        })
        .chain(std::iter::once_with(move || self.reclaim_blocklist()))
    }

    /// Run a full reclaim sweep, taking the lock once per batch of keys.
    pub fn reclaim_in_batches(&self, batch_size: usize) -> ReclaimReport {
        let mut report = ReclaimReport::default();
        for batch in self.reclaim_batches(batch_size) {
            report.absorb(batch);
        }

        debug!(
            evicted = report.evicted_timestamps,
            removed_scopes = report.removed_scopes,
            expired_blocks = report.expired_blocks,
            decayed = report.decayed_violations,
            forgotten = report.forgotten_violators,
            "Reclaim sweep finished"
        );
        report
    }

    /// Statistics with the default number of top violators.
    pub fn get_stats(&self) -> GuardStats {
        self.stats(DEFAULT_TOP_VIOLATORS)
    }

    /// Statistics for administrative views.
    pub fn stats(&self, top_n: usize) -> GuardStats {
        let mut state = self.state.lock();
        let now = self.clock.now();

        let global_requests_last_hour = state
            .scopes
            .get_mut(&ScopeKey::Global)
            .map_or(0, |w| w.count_in_window(TimeWindow::Hour.duration(), now));

        let wall_now = Utc::now();
        let mut blocked: Vec<BlockedIp> = state
            .violations
            .blocked()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(ip, entry)| BlockedIp {
                ip: ip.to_string(),
                reason: entry.reason,
                remaining_secs: entry.remaining_secs(now),
                blocked_since: chrono::Duration::from_std(entry.elapsed(now))
                    .ok()
                    .and_then(|d| wall_now.checked_sub_signed(d)),
                blocked_until: chrono::Duration::from_std(entry.remaining(now))
                    .ok()
                    .and_then(|d| wall_now.checked_add_signed(d)),
                violations: state.violations.violations(ip),
            })
            .collect();
        blocked.sort_by(|a, b| a.ip.cmp(&b.ip));

        GuardStats {
            active_ips: state.scopes.count_in_scope(Scope::Ip),
            active_users: state.scopes.count_in_scope(Scope::User),
            active_endpoint_scopes: state.scopes.count_in_scope(Scope::Endpoint),
            global_requests_last_hour,
            blocked_ips: blocked.len(),
            blocked,
            total_violations: state.violations.total_violations(),
            top_violators: state
                .violations
                .top_violators(top_n)
                .into_iter()
                .map(|(ip, violations)| Violator { ip, violations })
                .collect(),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(LimitPolicy::default())
    }
}

fn minute_and_hour(window: &mut SlidingWindow, now: Timestamp) -> (u64, u64) {
    let minute = window.count_in_window(TimeWindow::Minute.duration(), now) as u64;
    let hour = window.count_in_window(TimeWindow::Hour.duration(), now) as u64;
    (minute, hour)
}

/// Snapshot of the rate limiter for administrative views.
#[derive(Debug, Clone, Serialize)]
pub struct GuardStats {
    pub active_ips: usize,
    pub active_users: usize,
    pub active_endpoint_scopes: usize,
    pub global_requests_last_hour: usize,
    pub blocked_ips: usize,
    pub blocked: Vec<BlockedIp>,
    pub total_violations: u64,
    pub top_violators: Vec<Violator>,
}

/// An active blocklist entry.
#[derive(Debug, Clone, Serialize)]
pub struct BlockedIp {
    pub ip: String,
    pub reason: DenialKind,
    pub remaining_secs: u64,
    pub blocked_since: Option<DateTime<Utc>>,
    pub blocked_until: Option<DateTime<Utc>>,
    pub violations: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violator {
    pub ip: String,
    pub violations: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::rules::EndpointLimits;
    use std::time::Duration;

    const IP: &str = "203.0.113.10";

    fn limiter_with(policy: LimitPolicy) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (RateLimiter::with_clock(policy, clock.clone()), clock)
    }

    fn relaxed_burst() -> LimitPolicy {
        let mut policy = LimitPolicy::default();
        policy.per_ip.burst_limit = 1_000;
        policy
    }

    #[test]
    fn test_first_request_is_allowed_with_usage() {
        let (limiter, _clock) = limiter_with(LimitPolicy::default());

        let allowance = limiter
            .evaluate(IP, Some("/api/v1/data/upload"), Some("alice"))
            .into_result()
            .unwrap();

        assert_eq!(allowance.client_ip, IP);
        assert_eq!(allowance.usage.ip_minute, 1);
        assert_eq!(allowance.usage.ip_hour, 1);
        assert_eq!(allowance.usage.global_minute, 1);
        assert_eq!(allowance.usage.user_minute, Some(1));
        assert_eq!(allowance.usage.endpoint_minute, Some(1));
        assert_eq!(allowance.limits.ip_minute, 60);
        assert_eq!(allowance.limits.user_hour, 500);
        assert_eq!(allowance.limits.endpoint_minute, Some(2));
    }

    #[test]
    fn test_unknown_endpoint_and_anonymous_user() {
        let (limiter, _clock) = limiter_with(LimitPolicy::default());

        let allowance = limiter
            .evaluate(IP, Some("/api/v1/health"), None)
            .into_result()
            .unwrap();

        assert_eq!(allowance.usage.user_minute, None);
        assert_eq!(allowance.usage.endpoint_minute, None);
        assert_eq!(allowance.limits.endpoint_minute, None);
        assert_eq!(limiter.tracked_scopes(), 2); // global + ip
    }

    #[test]
    fn test_empty_ip_is_tracked_as_unknown() {
        let (limiter, _clock) = limiter_with(LimitPolicy::default());

        let allowance = limiter.evaluate("", None, None).into_result().unwrap();
        assert_eq!(allowance.client_ip, "unknown");
        assert_eq!(limiter.tracked_requests(&ScopeKey::ip("unknown")), 1);
    }

    #[test]
    fn test_burst_limit_denies_eleventh_request() {
        let (limiter, clock) = limiter_with(LimitPolicy::default());

        for i in 0..10 {
            let verdict = limiter.evaluate(IP, None, None);
            assert!(verdict.is_allowed(), "request {} should be allowed", i + 1);
            clock.advance(Duration::from_millis(90));
        }

        let verdict = limiter.evaluate(IP, None, None);
        let denial = verdict.denial().unwrap();
        assert_eq!(denial.kind, DenialKind::BurstLimitExceeded);
        assert_eq!(denial.retry_after_secs, 10);
        assert_eq!(limiter.violation_count(IP), 1);
    }

    #[test]
    fn test_repeated_bursts_block_the_ip() {
        let (limiter, _clock) = limiter_with(LimitPolicy::default());

        for _ in 0..10 {
            assert!(limiter.evaluate(IP, None, None).is_allowed());
        }
        for _ in 0..3 {
            assert_eq!(
                limiter.evaluate(IP, None, None).denial_kind(),
                Some(DenialKind::BurstLimitExceeded)
            );
        }

        assert!(limiter.is_blocked(IP));
        let denial = limiter.evaluate(IP, None, None).into_result().unwrap_err();
        assert_eq!(denial.kind, DenialKind::IpBlocked);
        // Two violations on record before the blocking one: 15 * 2^2 minutes.
        assert_eq!(denial.retry_after_secs, 60 * 60);
    }

    #[test]
    fn test_blocked_ip_does_not_touch_counters() {
        let (limiter, _clock) = limiter_with(LimitPolicy::default());
        for _ in 0..13 {
            limiter.evaluate(IP, None, None);
        }
        assert!(limiter.is_blocked(IP));

        let ip_before = limiter.tracked_requests(&ScopeKey::ip(IP));
        let global_before = limiter.tracked_requests(&ScopeKey::Global);

        for _ in 0..5 {
            assert_eq!(
                limiter.evaluate(IP, Some("/api/v1/data/upload"), Some("mallory")).denial_kind(),
                Some(DenialKind::IpBlocked)
            );
        }

        assert_eq!(limiter.tracked_requests(&ScopeKey::ip(IP)), ip_before);
        assert_eq!(limiter.tracked_requests(&ScopeKey::Global), global_before);
        assert_eq!(limiter.tracked_requests(&ScopeKey::user("mallory")), 0);
        assert_eq!(limiter.violation_count(IP), 3);
    }

    #[test]
    fn test_block_expires_and_sweep_decays() {
        let (limiter, clock) = limiter_with(LimitPolicy::default());
        for _ in 0..13 {
            limiter.evaluate(IP, None, None);
        }
        assert_eq!(limiter.violation_count(IP), 3);

        clock.advance(Duration::from_secs(61 * 60));
        let report = limiter.reclaim();

        assert_eq!(report.expired_blocks, 1);
        assert_eq!(report.decayed_violations, 1);
        assert_eq!(limiter.violation_count(IP), 2);
        assert!(!limiter.is_blocked(IP));
        assert!(limiter.evaluate(IP, None, None).is_allowed());
    }

    #[test]
    fn test_lazy_expiry_keeps_escalation() {
        let (limiter, clock) = limiter_with(LimitPolicy::default());
        for _ in 0..13 {
            limiter.evaluate(IP, None, None);
        }

        clock.advance(Duration::from_secs(61 * 60));
        assert!(limiter.evaluate(IP, None, None).is_allowed());
        assert_eq!(limiter.violation_count(IP), 3);

        for _ in 0..9 {
            assert!(limiter.evaluate(IP, None, None).is_allowed());
        }
        let denial = limiter.evaluate(IP, None, None).into_result().unwrap_err();
        assert_eq!(denial.kind, DenialKind::BurstLimitExceeded);

        let blocked = limiter.evaluate(IP, None, None).into_result().unwrap_err();
        assert_eq!(blocked.kind, DenialKind::IpBlocked);
        assert_eq!(blocked.retry_after_secs, 120 * 60);
    }

    #[test]
    fn test_ip_minute_limit() {
        let mut policy = relaxed_burst();
        policy.per_ip.requests_per_minute = 5;
        let (limiter, _clock) = limiter_with(policy);

        for _ in 0..5 {
            assert!(limiter.evaluate(IP, None, None).is_allowed());
        }
        let denial = limiter.evaluate(IP, None, None).into_result().unwrap_err();
        assert_eq!(denial.kind, DenialKind::RateLimitExceeded);
        assert_eq!(denial.retry_after_secs, 60);
        assert_eq!(limiter.violation_count(IP), 1);
    }

    #[test]
    fn test_ip_hour_limit() {
        let mut policy = relaxed_burst();
        policy.per_ip.requests_per_hour = 5;
        let (limiter, clock) = limiter_with(policy);

        for _ in 0..5 {
            assert!(limiter.evaluate(IP, None, None).is_allowed());
            clock.advance(Duration::from_secs(120));
        }
        let denial = limiter.evaluate(IP, None, None).into_result().unwrap_err();
        assert_eq!(denial.kind, DenialKind::RateLimitExceeded);
        assert_eq!(denial.retry_after_secs, 3600);
    }

    #[test]
    fn test_user_hour_limit() {
        let mut policy = relaxed_burst();
        policy.per_user.requests_per_hour = 4;
        let (limiter, clock) = limiter_with(policy);

        for _ in 0..4 {
            assert!(limiter.evaluate(IP, None, Some("alice")).is_allowed());
            clock.advance(Duration::from_secs(120));
        }
        let denial = limiter.evaluate(IP, None, Some("alice")).into_result().unwrap_err();
        assert_eq!(denial.kind, DenialKind::UserLimitExceeded);
        assert_eq!(denial.retry_after_secs, 3600);
        assert_eq!(limiter.violation_count(IP), 0);
    }

    #[test]
    fn test_endpoint_hour_limit() {
        let mut policy = relaxed_burst();
        policy.endpoints.insert(
            "/api/v1/export".to_string(),
            EndpointLimits {
                requests_per_minute: None,
                requests_per_hour: Some(3),
            },
        );
        let (limiter, clock) = limiter_with(policy);

        for _ in 0..3 {
            assert!(limiter.evaluate(IP, Some("/api/v1/export"), None).is_allowed());
            clock.advance(Duration::from_secs(120));
        }
        let denial = limiter
            .evaluate(IP, Some("/api/v1/export"), None)
            .into_result()
            .unwrap_err();
        assert_eq!(denial.kind, DenialKind::EndpointLimitExceeded);
        assert_eq!(denial.retry_after_secs, 3600);
        assert_eq!(limiter.violation_count(IP), 0);
    }

    #[test]
    fn test_global_limit_is_not_a_violation() {
        let mut policy = LimitPolicy::default();
        policy.global.requests_per_minute = 5;
        let (limiter, _clock) = limiter_with(policy);

        for i in 0..5 {
            assert!(limiter.evaluate(&format!("10.0.0.{}", i), None, None).is_allowed());
        }
        let denial = limiter.evaluate("10.0.0.99", None, None).into_result().unwrap_err();
        assert_eq!(denial.kind, DenialKind::GlobalLimitExceeded);
        assert_eq!(denial.retry_after_secs, 60);
        assert_eq!(limiter.violation_count("10.0.0.99"), 0);
        assert_eq!(limiter.tracked_requests(&ScopeKey::ip("10.0.0.99")), 0);
    }

    #[test]
    fn test_global_hour_limit() {
        let mut policy = LimitPolicy::default();
        policy.global.requests_per_hour = 3;
        let (limiter, clock) = limiter_with(policy);

        for i in 0..3 {
            assert!(limiter.evaluate(&format!("10.0.0.{}", i), None, None).is_allowed());
            clock.advance(Duration::from_secs(90));
        }
        let denial = limiter.evaluate("10.0.0.9", None, None).into_result().unwrap_err();
        assert_eq!(denial.kind, DenialKind::GlobalLimitExceeded);
        assert_eq!(denial.retry_after_secs, 3600);
    }

    #[test]
    fn test_user_limit_is_independent_of_ip_limit() {
        let mut policy = relaxed_burst();
        policy.per_user.requests_per_minute = 3;
        let (limiter, _clock) = limiter_with(policy);

        for _ in 0..3 {
            assert!(limiter.evaluate(IP, None, Some("alice")).is_allowed());
        }
        let denial = limiter.evaluate(IP, None, Some("alice")).into_result().unwrap_err();
        assert_eq!(denial.kind, DenialKind::UserLimitExceeded);
        assert_eq!(denial.retry_after_secs, 60);
        assert_eq!(limiter.violation_count(IP), 0);

        // Other users behind the same IP are unaffected.
        assert!(limiter.evaluate(IP, None, Some("bob")).is_allowed());
    }

    #[test]
    fn test_endpoint_override_isolation() {
        let mut policy = LimitPolicy::default();
        policy.endpoints.insert(
            "/api/v1/export".to_string(),
            EndpointLimits {
                requests_per_minute: Some(2),
                requests_per_hour: None,
            },
        );
        let (limiter, _clock) = limiter_with(policy);

        assert!(limiter.evaluate(IP, Some("/api/v1/export"), None).is_allowed());
        assert!(limiter.evaluate(IP, Some("/api/v1/export"), None).is_allowed());

        let denial = limiter
            .evaluate(IP, Some("/api/v1/export"), None)
            .into_result()
            .unwrap_err();
        assert_eq!(denial.kind, DenialKind::EndpointLimitExceeded);
        assert_eq!(denial.retry_after_secs, 60);
        assert_eq!(limiter.violation_count(IP), 0);

        // Same IP on other endpoints and another IP on this endpoint still pass.
        assert!(limiter.evaluate(IP, Some("/api/v1/other"), None).is_allowed());
        assert!(limiter.evaluate("198.51.100.1", Some("/api/v1/export"), None).is_allowed());
    }

    #[test]
    fn test_reclaim_bounds_memory() {
        let (limiter, clock) = limiter_with(relaxed_burst());

        for i in 0..1000 {
            limiter.evaluate(&format!("10.{}.{}.1", i / 256, i % 256), None, Some("user"));
        }
        assert_eq!(limiter.stats(0).active_ips, 1000);

        clock.advance(Duration::from_secs(3601));
        let report = limiter.reclaim_in_batches(64);

        assert_eq!(report.removed_scopes, 1002);
        assert_eq!(report.evicted_timestamps, 3000);
        assert_eq!(limiter.tracked_scopes(), 0);
    }

    #[test]
    fn test_reclaim_forgets_idle_violators() {
        let mut policy = relaxed_burst();
        policy.per_ip.requests_per_minute = 1;
        let (limiter, clock) = limiter_with(policy);

        limiter.evaluate(IP, None, None);
        limiter.evaluate(IP, None, None);
        assert_eq!(limiter.violation_count(IP), 1);

        clock.advance(Duration::from_secs(12 * 3600));
        assert_eq!(limiter.reclaim().forgotten_violators, 0);
        assert_eq!(limiter.violation_count(IP), 1);

        clock.advance(Duration::from_secs(12 * 3600));
        let report = limiter.reclaim();
        assert_eq!(report.forgotten_violators, 1);
        assert_eq!(limiter.violation_count(IP), 0);
        assert_eq!(limiter.tracked_scopes(), 0);
    }

    #[test]
    fn test_reclaim_keeps_recent_scopes() {
        let (limiter, clock) = limiter_with(LimitPolicy::default());
        limiter.evaluate("10.0.0.1", None, None);
        clock.advance(Duration::from_secs(3000));
        limiter.evaluate("10.0.0.2", None, None);
        clock.advance(Duration::from_secs(700));

        limiter.reclaim();

        assert_eq!(limiter.tracked_requests(&ScopeKey::ip("10.0.0.1")), 0);
        assert_eq!(limiter.tracked_requests(&ScopeKey::ip("10.0.0.2")), 1);
        assert_eq!(limiter.tracked_requests(&ScopeKey::Global), 1);
    }

    #[test]
    fn test_stats_report_blocks_and_violators() {
        let mut policy = relaxed_burst();
        policy.per_ip.requests_per_minute = 1;
        let (limiter, _clock) = limiter_with(policy);

        for _ in 0..4 {
            limiter.evaluate("10.0.0.1", None, None);
        }
        limiter.evaluate("10.0.0.2", None, None);
        limiter.evaluate("10.0.0.2", None, None);
        limiter.evaluate("10.0.0.3", None, Some("carol"));

        let stats = limiter.get_stats();
        assert_eq!(stats.active_ips, 3);
        assert_eq!(stats.active_users, 1);
        assert_eq!(stats.global_requests_last_hour, 7);
        assert_eq!(stats.total_violations, 4);
        assert_eq!(stats.blocked_ips, 1);
        assert_eq!(stats.blocked[0].ip, "10.0.0.1");
        assert_eq!(stats.blocked[0].violations, 3);
        assert_eq!(stats.blocked[0].remaining_secs, 60 * 60);
        let since = stats.blocked[0].blocked_since.unwrap();
        let until = stats.blocked[0].blocked_until.unwrap();
        assert_eq!((until - since).num_seconds(), 60 * 60);
        assert_eq!(
            stats.top_violators,
            vec![
                Violator { ip: "10.0.0.1".into(), violations: 3 },
                Violator { ip: "10.0.0.2".into(), violations: 1 },
            ]
        );
    }

    #[test]
    fn test_unblock_and_reset() {
        let (limiter, _clock) = limiter_with(LimitPolicy::default());
        for _ in 0..13 {
            limiter.evaluate(IP, Some("/api/v1/data/upload"), None);
        }
        assert!(limiter.is_blocked(IP));

        assert!(limiter.unblock(IP));
        assert!(!limiter.is_blocked(IP));
        assert_eq!(limiter.violation_count(IP), 3);

        limiter.reset(IP);
        assert_eq!(limiter.violation_count(IP), 0);
        assert_eq!(limiter.tracked_requests(&ScopeKey::ip(IP)), 0);
        assert_eq!(
            limiter.tracked_requests(&ScopeKey::endpoint(IP, "/api/v1/data/upload")),
            0
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_evaluations_are_all_counted() {
        let mut policy = LimitPolicy::default();
        policy.per_ip.burst_limit = 10_000;
        policy.per_ip.requests_per_minute = 10_000;
        policy.per_ip.requests_per_hour = 10_000;
        let limiter = Arc::new(RateLimiter::new(policy));

        let tasks = (0..8).map(|worker| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let ip = format!("10.0.0.{}", worker % 2);
                (0..50)
                    .filter(|_| limiter.evaluate(&ip, None, None).is_allowed())
                    .count()
            })
        });

        let allowed: usize = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .sum();

        assert_eq!(allowed, 400);
        assert_eq!(limiter.tracked_requests(&ScopeKey::Global), 400);
        assert_eq!(limiter.tracked_requests(&ScopeKey::ip("10.0.0.0")), 200);
    }
}
