//! Inventory import.
//!
//! The inventory lists every instance together with whether the command
//! service can reach it. Importing it creates missing records and moves
//! instances between `Unmanaged` and `Pending`; every other status belongs
//! to rollout runs and is left alone.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fleetroll_state::{epoch_millis, InstanceRecord, InstanceStatus, StateResult, StateStore};

use crate::error::InventoryError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub instance_id: String,
    pub region: String,
    pub account: String,
    /// Reachable by the command service.
    pub managed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub instances: Vec<InventoryEntry>,
}

impl Inventory {
    pub fn from_file(path: &Path) -> Result<Self, InventoryError> {
        let content = std::fs::read_to_string(path).map_err(|source| InventoryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| InventoryError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    pub added: u32,
    pub promoted: u32,
    pub demoted: u32,
    pub unchanged: u32,
}

/// Apply an inventory to the store.
pub fn import(store: &StateStore, inventory: &Inventory) -> StateResult<ImportStats> {
    let mut stats = ImportStats::default();

    for entry in &inventory.instances {
        let wanted = if entry.managed {
            InstanceStatus::Pending
        } else {
            InstanceStatus::Unmanaged
        };
        let key = fleetroll_state::instance_key(&entry.region, &entry.instance_id);

        let Some(existing) = store.get_instance(&key)? else {
            let record =
                InstanceRecord::new(&entry.instance_id, &entry.region, &entry.account, wanted);
            store.upsert_instance(&record, None)?;
            debug!(%key, status = %wanted, "instance added");
            stats.added += 1;
            continue;
        };

        let movable = matches!(
            (existing.status, wanted),
            (InstanceStatus::Unmanaged, InstanceStatus::Pending)
                | (InstanceStatus::Pending, InstanceStatus::Unmanaged)
        );
        if !movable {
            stats.unchanged += 1;
            continue;
        }

        let mut next = existing.clone();
        next.status = wanted;
        next.updated_at = epoch_millis();
        match store.upsert_instance(&next, Some(existing.status)) {
            Ok(()) if wanted == InstanceStatus::Pending => stats.promoted += 1,
            Ok(()) => stats.demoted += 1,
            Err(e) if e.is_conflict() => {
                warn!(%key, error = %e, "instance changed during import, left as is");
                stats.unchanged += 1;
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        added = stats.added,
        promoted = stats.promoted,
        demoted = stats.demoted,
        unchanged = stats.unchanged,
        "inventory imported"
    );
    Ok(stats)
}
