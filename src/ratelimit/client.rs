//! Client address resolution.

/// Scope key used when no client address can be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Resolve the client IP for a request.
///
/// Trusts the first `X-Forwarded-For` entry, then `X-Real-IP`, then the
/// transport peer address. The value is not validated as an IP literal.
pub fn resolve_client_ip(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    peer: Option<&str>,
) -> String {
    forwarded_for
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| real_ip.map(str::trim).filter(|s| !s.is_empty()))
        .or_else(|| peer.map(str::trim).filter(|s| !s.is_empty()))
        .unwrap_or(UNKNOWN_CLIENT)
        .to_string()
}

/// Map an empty client IP to [`UNKNOWN_CLIENT`].
pub fn normalize_client_ip(ip: &str) -> &str {
    let ip = ip.trim();
    if ip.is_empty() {
        UNKNOWN_CLIENT
    } else {
        ip
    }
}
