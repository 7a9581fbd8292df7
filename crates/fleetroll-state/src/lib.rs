//! fleetroll-state: durable state for fleet rollouts.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for instance records, rollout runs, and the single-run lease.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Instance records are keyed `{region}/{instance_id}`, so a region's records
//! are contiguous and iterate in instance-id order.
//!
//! Every instance write the orchestrator performs is conditional: the stored
//! status (and optionally the owning run) is checked inside the same write
//! transaction that replaces the record. redb serialises write transactions,
//! which makes each check-and-write atomic.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. [`LockManager`] layers the TTL lease
//! on top of the same database.

pub mod error;
pub mod lock;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{LockError, StateError, StateResult};
pub use lock::{LockManager, LockToken};
pub use store::StateStore;
pub use types::*;
