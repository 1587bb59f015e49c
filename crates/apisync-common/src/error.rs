//! Error types shared by apisync crates

use thiserror::Error;

/// Result type alias for apisync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors raised while loading and validating run configuration
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("Unknown source: {0}")]
    UnknownSource(String),
}

impl SyncError {
    pub fn config(msg: impl Into<String>) -> Self {
        SyncError::Config(msg.into())
    }

    pub fn invalid_target(target: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::InvalidTarget {
            target: target.into(),
            reason: reason.into(),
        }
    }
}
