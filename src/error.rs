//! Error types for the weft frame model and sync engine.

use crate::types::Addr;
use thiserror::Error;

/// Backing-store adapter errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Backend capacity exceeded: {0}")]
    Capacity(String),

    #[error("Batch retries exhausted after {retries} attempts; {remaining} items unprocessed")]
    UnprocessedExhausted { retries: u32, remaining: usize },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serde(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serde(err.to_string())
    }
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Space-level errors: command validation, frame integrity, reconciliation
#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Integrity check failed: {}", .0.join("; "))]
    Integrity(Vec<String>),

    #[error("Addresses not found after exhausting retries: {}", .addrs.join(", "))]
    NotFound { addrs: Vec<Addr> },

    #[error("Could not acquire lock for scope {scope} after {attempts} attempts")]
    LockTimeout { scope: String, attempts: u32 },

    #[error("Sync saga {saga_id} aborted: {reason}")]
    SagaAborted { saga_id: String, reason: String },

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl SpaceError {
    /// Single-message validation error convenience.
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        SpaceError::Validation(vec![msg.into()])
    }
}
