//! Error types for the fleetroll state store and lease.

use thiserror::Error;

use crate::types::InstanceStatus;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency check failed: the stored record moved on.
    #[error("conflict on {key}: expected {expected}, found {}", describe(.found))]
    Conflict {
        key: String,
        expected: String,
        found: Option<InstanceStatus>,
    },
}

impl StateError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StateError::Conflict { .. })
    }
}

fn describe(found: &Option<InstanceStatus>) -> String {
    match found {
        Some(status) => status.to_string(),
        None => "no record".to_string(),
    }
}

/// Errors from the single-run lease.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {name} is held by run {holder} until {expires_at}")]
    AlreadyHeld {
        name: String,
        holder: String,
        expires_at: u64,
    },

    #[error("lock {name} expired or was taken over")]
    Expired { name: String },

    #[error(transparent)]
    Store(#[from] StateError),
}
