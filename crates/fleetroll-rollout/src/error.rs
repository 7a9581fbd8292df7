//! Rollout error types.

use std::path::PathBuf;

use thiserror::Error;

use fleetroll_core::ConfigError;
use fleetroll_state::{LockError, StateError};

/// Run-level errors. Per-instance failures never surface here; they are
/// recorded on the instance and reported in the summary.
#[derive(Debug, Error)]
pub enum RolloutError {
    /// Another run holds the lease. Nothing was written.
    #[error("another rollout is running: {holder} holds lock {name} until {expires_at}")]
    LockContention {
        name: String,
        holder: String,
        expires_at: u64,
    },

    #[error("lease {0} expired or was taken over")]
    LockLost(String),

    #[error("invalid rollout policy: {0}")]
    InvalidPolicy(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl From<LockError> for RolloutError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::AlreadyHeld {
                name,
                holder,
                expires_at,
            } => RolloutError::LockContention {
                name,
                holder,
                expires_at,
            },
            LockError::Expired { name } => RolloutError::LockLost(name),
            LockError::Store(e) => RolloutError::State(e),
        }
    }
}

pub type RolloutResult<T> = Result<T, RolloutError>;

/// Errors loading an inventory file.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse inventory {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
