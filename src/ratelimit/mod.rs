//! Rate limiting logic and state management.

mod client;
mod clock;
mod limiter;
mod reclaimer;
mod rules;
mod scope;
mod verdict;
mod violations;
mod window;

pub use client::{normalize_client_ip, resolve_client_ip, UNKNOWN_CLIENT};
pub use clock::{millis, ManualClock, MonotonicClock, TimeSource, Timestamp};
pub use limiter::{BlockedIp, GuardStats, RateLimiter, Violator, DEFAULT_TOP_VIOLATORS};
pub use reclaimer::{
    ReclaimReport, Reclaimer, ReclaimerHandle, DEFAULT_RECLAIM_BATCH, DEFAULT_RECLAIM_INTERVAL,
};
pub use rules::{BlockPolicy, EndpointLimits, GlobalLimits, IpLimits, LimitPolicy, UserLimits};
pub use scope::{Scope, ScopeKey, ScopeRegistry};
pub use verdict::{Allowance, Denial, DenialKind, LimitsSnapshot, Usage, Verdict};
pub use violations::{BlockEntry, ViolationTracker};
pub use window::{SlidingWindow, TimeWindow, RETENTION_HORIZON};
