//! Error types for Meshplane

use thiserror::Error;

/// Result type alias using Meshplane Error
pub type Result<T> = std::result::Result<T, Error>;

/// Meshplane error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} with id {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("ACL for network {network} changed concurrently (expected version {expected}, found {found})")]
    Conflict {
        network: String,
        expected: u64,
        found: u64,
    },

    #[error("Node check failed: network {network} still has {nodes} node(s)")]
    NetworkInUse { network: String, nodes: usize },

    #[error("ACL migration failed for network {network}: {reason}")]
    Migration { network: String, reason: String },

    #[error("Peer update notification failed: {0}")]
    Notification(String),

    #[error("Operation timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// True when the error only signals a missing record
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True for faults raised by the persistence layer
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Database(_) | Error::Serialization(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Notification(e.to_string())
    }
}
