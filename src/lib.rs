//! Abuse Guard - Request Rate Limiting and Abuse Mitigation
//!
//! This crate decides, per incoming request, whether it may proceed. Requests
//! are counted in sliding windows per client IP, per user, per endpoint and
//! globally. Repeated limit breaches from one IP escalate into temporary
//! blocks whose duration doubles with every further offence, and a background
//! reclaimer keeps memory bounded by evicting stale state.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod replay;
