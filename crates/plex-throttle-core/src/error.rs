//! Error types for the throttle core
//!
//! Startup-time failures (configuration, initial login) propagate out of the
//! process; everything that happens inside the control loop is logged and
//! absorbed by the caller.

use thiserror::Error;

/// Main error type for core operations
#[derive(Error, Debug)]
pub enum ThrottleError {
    /// Missing or invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// File access or I/O error
    #[error("File error: {0}")]
    Io(String),

    /// Configuration or state parsing error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Cooldown state could not be read or written
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Metrics registry rejected a collector
    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl ThrottleError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ThrottleError::Config(msg.into())
    }

    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        ThrottleError::Persistence(msg.into())
    }

    /// Whether this error should stop the process before the control loop starts
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ThrottleError::Config(_) | ThrottleError::Io(_) | ThrottleError::Parse(_)
        )
    }
}

impl From<std::io::Error> for ThrottleError {
    fn from(err: std::io::Error) -> Self {
        ThrottleError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ThrottleError {
    fn from(err: serde_json::Error) -> Self {
        ThrottleError::Parse(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for ThrottleError {
    fn from(err: serde_yaml::Error) -> Self {
        ThrottleError::Parse(format!("YAML error: {}", err))
    }
}

impl From<toml::de::Error> for ThrottleError {
    fn from(err: toml::de::Error) -> Self {
        ThrottleError::Parse(format!("TOML error: {}", err))
    }
}

impl From<prometheus::Error> for ThrottleError {
    fn from(err: prometheus::Error) -> Self {
        ThrottleError::Metrics(err.to_string())
    }
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, ThrottleError>;
