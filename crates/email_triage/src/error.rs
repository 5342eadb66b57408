//! Unified error type for the triage engine
//!
//! Errors are serializable so a front end can render them directly.
//! Messages should be actionable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Triage engine error type
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum TriageError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Mailbox error: {0}")]
    Mailbox(String),

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl TriageError {
    /// Whether the caller can retry the operation (or fall back to the queue).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Mailbox(_) | Self::Network(_) | Self::Classifier(_) | Self::Cancelled
        )
    }
}

impl From<std::io::Error> for TriageError {
    fn from(err: std::io::Error) -> Self {
        TriageError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for TriageError {
    fn from(err: toml::de::Error) -> Self {
        TriageError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for TriageError {
    fn from(err: serde_json::Error) -> Self {
        TriageError::Parse(err.to_string())
    }
}

impl From<rusqlite::Error> for TriageError {
    fn from(err: rusqlite::Error) -> Self {
        TriageError::Database(err.to_string())
    }
}

impl From<r2d2::Error> for TriageError {
    fn from(err: r2d2::Error) -> Self {
        TriageError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for TriageError {
    fn from(err: reqwest::Error) -> Self {
        TriageError::Network(err.to_string())
    }
}

impl From<String> for TriageError {
    fn from(err: String) -> Self {
        TriageError::Other(err)
    }
}

impl From<&str> for TriageError {
    fn from(err: &str) -> Self {
        TriageError::Other(err.to_string())
    }
}

/// Result type alias using TriageError
pub type Result<T> = std::result::Result<T, TriageError>;
