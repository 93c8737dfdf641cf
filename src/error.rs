//! Error types for the leakhunt engine
//!
//! This module provides error handling using thiserror for structured
//! error definitions and anyhow for propagation at the binary boundary.
//!
//! Only configuration problems are hard stops. Probe failures are carried
//! by [`crate::hunter::HuntError`] so the original failure survives untouched,
//! and classifier noise is never an error at all.

use thiserror::Error;

/// Main error type for leakhunt operations
#[derive(Error, Debug)]
pub enum LeakHuntError {
    /// Leak checking cannot be activated (bad token, missing capability)
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// A resource counter could not be read during a hunt
    #[error("Counter '{metric}' unavailable: {reason}")]
    CounterUnavailable { metric: String, reason: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid selection pattern
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias for leakhunt operations
pub type Result<T> = std::result::Result<T, LeakHuntError>;

/// Convert anyhow::Error to LeakHuntError
impl From<anyhow::Error> for LeakHuntError {
    fn from(err: anyhow::Error) -> Self {
        LeakHuntError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;

    #[test]
    fn test_error_display() {
        let err = LeakHuntError::CounterUnavailable {
            metric: "fds".to_string(),
            reason: "no /proc".to_string(),
        };
        assert_eq!(err.to_string(), "Counter 'fds' unavailable: no /proc");
    }

    #[test]
    fn test_error_conversion() {
        let config_err = ConfigError::InvalidToken {
            token: "x:y".to_string(),
            reason: "stab is not an integer".to_string(),
        };
        let err: LeakHuntError = config_err.into();
        assert!(matches!(err, LeakHuntError::Config(_)));
        assert!(err.to_string().starts_with("Configuration error:"));
    }
}
