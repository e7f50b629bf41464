//! Evaluation outcomes returned by the rate limiter.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialKind {
    /// The client IP is on the blocklist
    IpBlocked,
    /// Overall capacity exceeded
    GlobalLimitExceeded,
    /// Too many requests from one IP in the burst window
    BurstLimitExceeded,
    /// Per-IP minute or hour limit exceeded
    RateLimitExceeded,
    /// Per-user minute or hour limit exceeded
    UserLimitExceeded,
    /// Endpoint-specific limit exceeded
    EndpointLimitExceeded,
}

impl DenialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialKind::IpBlocked => "ip_blocked",
            DenialKind::GlobalLimitExceeded => "global_limit_exceeded",
            DenialKind::BurstLimitExceeded => "burst_limit_exceeded",
            DenialKind::RateLimitExceeded => "rate_limit_exceeded",
            DenialKind::UserLimitExceeded => "user_limit_exceeded",
            DenialKind::EndpointLimitExceeded => "endpoint_limit_exceeded",
        }
    }

    /// Whether this denial counts as a violation against the client IP.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            DenialKind::BurstLimitExceeded | DenialKind::RateLimitExceeded
        )
    }
}

impl fmt::Display for DenialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A denied request with a retry hint for the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denial {
    pub kind: DenialKind,
    pub retry_after_secs: u64,
    pub message: String,
}

impl Denial {
    pub fn new(kind: DenialKind, retry_after_secs: u64, message: impl Into<String>) -> Self {
        Self {
            kind,
            retry_after_secs,
            message: message.into(),
        }
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} (retry after {}s)",
            self.kind, self.message, self.retry_after_secs
        )
    }
}

impl std::error::Error for Denial {}

/// Request counts observed while evaluating an allowed request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub ip_burst: u64,
    pub ip_minute: u64,
    pub ip_hour: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_minute: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_hour: Option<u64>,
    pub global_minute: u64,
    pub global_hour: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_minute: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_hour: Option<u64>,
}

/// Configured limits that applied to an allowed request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsSnapshot {
    pub ip_burst: u64,
    pub ip_minute: u64,
    pub ip_hour: u64,
    pub user_minute: u64,
    pub user_hour: u64,
    pub global_minute: u64,
    pub global_hour: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_minute: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_hour: Option<u64>,
}

/// An allowed request with telemetry for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allowance {
    pub client_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub usage: Usage,
    pub limits: LimitsSnapshot,
}

/// The outcome of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Allowed(Allowance),
    Denied(Denial),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed(_))
    }

    pub fn denial(&self) -> Option<&Denial> {
        match self {
            Verdict::Denied(denial) => Some(denial),
            Verdict::Allowed(_) => None,
        }
    }

    /// Kind of denial, or `None` when allowed.
    pub fn denial_kind(&self) -> Option<DenialKind> {
        self.denial().map(|d| d.kind)
    }

    pub fn into_result(self) -> Result<Allowance, Denial> {
        match self {
            Verdict::Allowed(allowance) => Ok(allowance),
            Verdict::Denied(denial) => Err(denial),
        }
    }
}
