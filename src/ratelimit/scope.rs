//! Scope keys and the registry of per-scope sliding windows.

use std::collections::HashMap;
use std::fmt;

use super::clock::Timestamp;
use super::window::SlidingWindow;

/// A dimension along which requests are counted independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Ip,
    User,
    Endpoint,
}

/// A key that uniquely identifies one tracked entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeKey {
    /// Every request, regardless of origin
    Global,
    /// A client IP literal
    Ip(String),
    /// An authenticated user identifier
    User(String),
    /// A client IP hitting an endpoint with its own limits
    Endpoint { ip: String, endpoint: String },
}

impl ScopeKey {
    pub fn ip(ip: &str) -> Self {
        ScopeKey::Ip(ip.to_string())
    }

    pub fn user(user_id: &str) -> Self {
        ScopeKey::User(user_id.to_string())
    }

    pub fn endpoint(ip: &str, endpoint: &str) -> Self {
        ScopeKey::Endpoint {
            ip: ip.to_string(),
            endpoint: endpoint.to_string(),
        }
    }

    /// The scope this key belongs to.
    pub fn scope(&self) -> Scope {
        match self {
            ScopeKey::Global => Scope::Global,
            ScopeKey::Ip(_) => Scope::Ip,
            ScopeKey::User(_) => Scope::User,
            ScopeKey::Endpoint { .. } => Scope::Endpoint,
        }
    }

    /// The client IP this key is attributed to, if any.
    pub fn client_ip(&self) -> Option<&str> {
        match self {
            ScopeKey::Ip(ip) | ScopeKey::Endpoint { ip, .. } => Some(ip),
            ScopeKey::Global | ScopeKey::User(_) => None,
        }
    }

    /// Convert the key to its string form.
    ///
    /// Endpoint keys use the composite `"<ip>:<endpoint>"` form.
    pub fn to_string_key(&self) -> String {
        match self {
            ScopeKey::Global => "global".to_string(),
            ScopeKey::Ip(ip) => ip.clone(),
            ScopeKey::User(user) => user.clone(),
            ScopeKey::Endpoint { ip, endpoint } => format!("{}:{}", ip, endpoint),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// Outcome of reclaiming a single scope key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeReclaim {
    /// Timestamps dropped from the key's window
    pub evicted: usize,
    /// Whether the key was removed because its window became empty
    pub removed: bool,
}

/// Mapping from scope key to its sliding window.
///
/// Windows are created lazily on first use and removed only by reclaiming.
#[derive(Debug, Default)]
pub struct ScopeRegistry {
    windows: HashMap<ScopeKey, SlidingWindow>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the window for a key, creating it if needed.
    pub fn window_mut(&mut self, key: ScopeKey) -> &mut SlidingWindow {
        self.windows.entry(key).or_default()
    }

    /// Get the window for a key without creating it.
    pub fn get(&self, key: &ScopeKey) -> Option<&SlidingWindow> {
        self.windows.get(key)
    }

    pub fn get_mut(&mut self, key: &ScopeKey) -> Option<&mut SlidingWindow> {
        self.windows.get_mut(key)
    }

    /// Record a request and return the key's window for counting.
    pub fn record(&mut self, key: ScopeKey, now: Timestamp) -> &mut SlidingWindow {
        let window = self.window_mut(key);
        window.record(now);
        window
    }

    /// Evict expired timestamps for one key, removing it once empty.
    pub fn reclaim(&mut self, key: &ScopeKey, now: Timestamp) -> ScopeReclaim {
        let Some(window) = self.windows.get_mut(key) else {
            return ScopeReclaim::default();
        };

        let evicted = window.evict(now);
        let removed = window.is_empty();
        if removed {
            self.windows.remove(key);
        }

        ScopeReclaim { evicted, removed }
    }

    /// Remove every window attributed to a client IP.
    pub fn remove_ip(&mut self, ip: &str) -> usize {
        let before = self.windows.len();
        self.windows.retain(|key, _| key.client_ip() != Some(ip));
        before - self.windows.len()
    }

    /// Snapshot of all tracked keys.
    pub fn keys(&self) -> Vec<ScopeKey> {
        self.windows.keys().cloned().collect()
    }

    /// Number of tracked keys in a scope.
    pub fn count_in_scope(&self, scope: Scope) -> usize {
        self.windows.keys().filter(|k| k.scope() == scope).count()
    }

    /// Total number of tracked keys.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
