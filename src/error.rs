//! Error types for the abuse guard.
//!
//! Rate limit denials are not errors; they are returned as
//! [`Verdict`](crate::ratelimit::Verdict) values.

use thiserror::Error;

/// Main error type for abuse guard operations.
#[derive(Error, Debug)]
pub enum GuardError {
    /// Invalid configuration or policy values
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered configuration could not be built or deserialized
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// YAML parse errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parse or encode errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for abuse guard operations.
pub type Result<T> = std::result::Result<T, GuardError>;
