//! redb table definitions for the fleetroll state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Instance records keyed by `{region}/{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Rollout runs keyed by `{run_id}`.
pub const RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

/// Leases keyed by lock name.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");
