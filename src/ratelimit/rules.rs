//! Limit policy configuration.
//!
//! This module holds the static thresholds the rate limiter enforces: per-IP,
//! per-user and global request rates, the per-IP burst limit, per-endpoint
//! overrides, and the escalating block policy. Policies can be loaded from
//! YAML and are immutable once handed to the rate limiter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::window::{TimeWindow, RETENTION_HORIZON};
use crate::error::{GuardError, Result};

/// The complete limit policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitPolicy {
    /// Limits applied to every client IP
    pub per_ip: IpLimits,
    /// Limits applied to authenticated users
    pub per_user: UserLimits,
    /// Limits applied to all traffic combined
    pub global: GlobalLimits,
    /// Per-endpoint overrides keyed by request path
    pub endpoints: BTreeMap<String, EndpointLimits>,
    /// Escalating block configuration
    pub blocking: BlockPolicy,
}

impl Default for LimitPolicy {
    fn default() -> Self {
        let endpoints = [
            ("/api/v1/data/upload", 2, 10),
            ("/api/v1/analysis/start", 5, 20),
            ("/api/v1/reservo/sync-data", 1, 5),
        ]
        .into_iter()
        .map(|(path, per_minute, per_hour)| {
            (
                path.to_string(),
                EndpointLimits {
                    requests_per_minute: Some(per_minute),
                    requests_per_hour: Some(per_hour),
                },
            )
        })
        .collect();

        Self {
            per_ip: IpLimits::default(),
            per_user: UserLimits::default(),
            global: GlobalLimits::default(),
            endpoints,
            blocking: BlockPolicy::default(),
        }
    }
}

/// Per-IP limits, including the short burst window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpLimits {
    pub requests_per_minute: u64,
    pub requests_per_hour: u64,
    /// Maximum requests inside the burst window
    pub burst_limit: u64,
    /// Length of the burst window in seconds
    pub burst_window_secs: u64,
}

impl Default for IpLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: 300,
            burst_limit: 10,
            burst_window_secs: 10,
        }
    }
}

impl IpLimits {
    pub fn limit(&self, window: TimeWindow) -> u64 {
        match window {
            TimeWindow::Minute => self.requests_per_minute,
            TimeWindow::Hour => self.requests_per_hour,
        }
    }

    pub fn burst_window(&self) -> Duration {
        Duration::from_secs(self.burst_window_secs)
    }
}

/// Per-user limits. Looser than per-IP since users may share an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserLimits {
    pub requests_per_minute: u64,
    pub requests_per_hour: u64,
}

impl Default for UserLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: 100,
            requests_per_hour: 500,
        }
    }
}

impl UserLimits {
    pub fn limit(&self, window: TimeWindow) -> u64 {
        match window {
            TimeWindow::Minute => self.requests_per_minute,
            TimeWindow::Hour => self.requests_per_hour,
        }
    }
}

/// Capacity limits across all clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalLimits {
    pub requests_per_minute: u64,
    pub requests_per_hour: u64,
}

impl Default for GlobalLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: 1000,
            requests_per_hour: 5000,
        }
    }
}

impl GlobalLimits {
    pub fn limit(&self, window: TimeWindow) -> u64 {
        match window {
            TimeWindow::Minute => self.requests_per_minute,
            TimeWindow::Hour => self.requests_per_hour,
        }
    }
}

/// Limits for one endpoint, counted per client IP.
///
/// A missing granularity is not limited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointLimits {
    #[serde(default)]
    pub requests_per_minute: Option<u64>,
    #[serde(default)]
    pub requests_per_hour: Option<u64>,
}

impl EndpointLimits {
    pub fn limit(&self, window: TimeWindow) -> Option<u64> {
        match window {
            TimeWindow::Minute => self.requests_per_minute,
            TimeWindow::Hour => self.requests_per_hour,
        }
    }
}

/// Escalating block configuration.
///
/// A block lasts `base_duration_minutes * escalation_factor ^ min(n, exponent_cap)`
/// minutes, where `n` is the IP's violation count before the violation that
/// triggered the block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockPolicy {
    /// Violations needed before an IP is blocked
    pub violation_threshold: u32,
    pub base_duration_minutes: u64,
    pub escalation_factor: u64,
    /// Largest exponent applied to the escalation factor
    pub exponent_cap: u32,
    /// Idle time after which an unblocked IP's violations are forgotten
    pub forget_after_minutes: u64,
}

impl Default for BlockPolicy {
    fn default() -> Self {
        Self {
            violation_threshold: 3,
            base_duration_minutes: 15,
            escalation_factor: 2,
            exponent_cap: 5,
            forget_after_minutes: 24 * 60,
        }
    }
}

impl BlockPolicy {
    /// Block length in minutes for an IP with `prior_violations` on record.
    pub fn block_minutes(&self, prior_violations: u32) -> u64 {
        let exponent = prior_violations.min(self.exponent_cap);
        self.base_duration_minutes
            .saturating_mul(self.escalation_factor.saturating_pow(exponent))
    }

    /// How long violations are kept after an IP's last offence.
    pub fn forget_after(&self) -> Duration {
        Duration::from_secs(self.forget_after_minutes.saturating_mul(60))
    }

    /// Block length for an IP with `prior_violations` on record.
    pub fn block_duration(&self, prior_violations: u32) -> Duration {
        Duration::from_secs(self.block_minutes(prior_violations).saturating_mul(60))
    }
}

impl LimitPolicy {
    /// Load a policy from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limit policy");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a policy from a YAML string and validate it.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let policy: LimitPolicy = serde_yaml::from_str(yaml)
            .map_err(|e| GuardError::Config(format!("Failed to parse limit policy: {}", e)))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Get the override for an endpoint, if one is configured.
    pub fn endpoint(&self, path: &str) -> Option<&EndpointLimits> {
        self.endpoints.get(path)
    }

    /// Check that every threshold is usable.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("per_ip.requests_per_minute", self.per_ip.requests_per_minute),
            ("per_ip.requests_per_hour", self.per_ip.requests_per_hour),
            ("per_ip.burst_limit", self.per_ip.burst_limit),
            ("per_ip.burst_window_secs", self.per_ip.burst_window_secs),
            ("per_user.requests_per_minute", self.per_user.requests_per_minute),
            ("per_user.requests_per_hour", self.per_user.requests_per_hour),
            ("global.requests_per_minute", self.global.requests_per_minute),
            ("global.requests_per_hour", self.global.requests_per_hour),
            ("blocking.escalation_factor", self.blocking.escalation_factor),
            ("blocking.forget_after_minutes", self.blocking.forget_after_minutes),
            (
                "blocking.violation_threshold",
                u64::from(self.blocking.violation_threshold),
            ),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(GuardError::Config(format!("{} must be greater than zero", name)));
        }

        if self.per_ip.burst_window() > RETENTION_HORIZON {
            return Err(GuardError::Config(format!(
                "per_ip.burst_window_secs must not exceed {}",
                RETENTION_HORIZON.as_secs()
            )));
        }

        for (path, limits) in &self.endpoints {
            if path.is_empty() {
                return Err(GuardError::Config("endpoint path must not be empty".into()));
            }
            match (limits.requests_per_minute, limits.requests_per_hour) {
                (None, None) => {
                    return Err(GuardError::Config(format!(
                        "endpoint {} must set at least one limit",
                        path
                    )))
                }
                (Some(0), _) | (_, Some(0)) => {
                    return Err(GuardError::Config(format!(
                        "endpoint {} limits must be greater than zero",
                        path
                    )))
                }
                _ => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_valid() {
        let policy = LimitPolicy::default();
        assert!(policy.validate().is_ok());
        assert_eq!(policy.per_ip.burst_window(), Duration::from_secs(10));
        assert_eq!(policy.endpoints.len(), 3);
    }

    #[test]
    fn test_block_duration_table() {
        let blocking = BlockPolicy::default();
        let table = [(0, 15), (1, 30), (2, 60), (3, 120), (4, 240), (5, 480), (6, 480), (50, 480)];

        for (violations, minutes) in table {
            assert_eq!(blocking.block_minutes(violations), minutes, "violations = {}", violations);
        }
        assert_eq!(blocking.block_duration(1), Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_block_duration_saturates() {
        let blocking = BlockPolicy {
            violation_threshold: 1,
            base_duration_minutes: u64::MAX / 2,
            escalation_factor: 10,
            exponent_cap: 30,
            ..BlockPolicy::default()
        };
        assert_eq!(blocking.block_minutes(30), u64::MAX);
        assert_eq!(blocking.block_duration(30), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_parse_partial_policy_keeps_defaults() {
        let yaml = r#"
per_ip:
  burst_limit: 5
per_user:
  requests_per_minute: 30
"#;
        let policy = LimitPolicy::from_yaml(yaml).unwrap();
        assert_eq!(policy.per_ip.burst_limit, 5);
        assert_eq!(policy.per_ip.requests_per_minute, 60);
        assert_eq!(policy.per_user.requests_per_minute, 30);
        assert_eq!(policy.per_user.requests_per_hour, 500);
        assert_eq!(policy.blocking, BlockPolicy::default());
    }

    #[test]
    fn test_parse_endpoint_overrides() {
        let yaml = r#"
endpoints:
  /api/v1/export:
    requests_per_minute: 3
  /api/v1/report:
    requests_per_hour: 7
"#;
        let policy = LimitPolicy::from_yaml(yaml).unwrap();
        assert_eq!(policy.endpoints.len(), 2);

        let export = policy.endpoint("/api/v1/export").unwrap();
        assert_eq!(export.limit(TimeWindow::Minute), Some(3));
        assert_eq!(export.limit(TimeWindow::Hour), None);

        let report = policy.endpoint("/api/v1/report").unwrap();
        assert_eq!(report.limit(TimeWindow::Hour), Some(7));
        assert!(policy.endpoint("/api/v1/data/upload").is_none());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut policy = LimitPolicy::default();
        policy.per_user.requests_per_hour = 0;

        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("per_user.requests_per_hour"));
    }

    #[test]
    fn test_validate_rejects_zero_forget_window() {
        let mut policy = LimitPolicy::default();
        policy.blocking.forget_after_minutes = 0;

        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("blocking.forget_after_minutes"));
        assert_eq!(
            BlockPolicy::default().forget_after(),
            Duration::from_secs(24 * 3600)
        );
    }

    #[test]
    fn test_validate_rejects_long_burst_window() {
        let mut policy = LimitPolicy::default();
        policy.per_ip.burst_window_secs = 7200;
        assert!(matches!(policy.validate(), Err(GuardError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_endpoint_override() {
        let yaml = r#"
endpoints:
  /api/v1/export: {}
"#;
        assert!(LimitPolicy::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let result = LimitPolicy::from_yaml("per_ip: [1, 2");
        assert!(matches!(result, Err(GuardError::Config(_))));
    }
}
