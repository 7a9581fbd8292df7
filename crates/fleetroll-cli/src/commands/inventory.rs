use std::path::Path;
use std::process::ExitCode;

use serde::Serialize;

use fleetroll_rollout::Inventory;
use fleetroll_state::{InstanceFilter, InstanceStatus};

use super::{load_config, open_store};

pub fn import(config_path: &Path, inventory_path: &Path) -> anyhow::Result<ExitCode> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    let inventory = Inventory::from_file(inventory_path)?;

    let stats = fleetroll_rollout::import(&store, &inventory)?;
    println!(
        "✓ Imported {} instances: {} added, {} promoted to pending, \
         {} marked unmanaged, {} unchanged",
        inventory.instances.len(),
        stats.added,
        stats.promoted,
        stats.demoted,
        stats.unchanged
    );
    Ok(ExitCode::SUCCESS)
}

#[derive(Serialize)]
struct Listed<'a> {
    instance_id: &'a str,
    region: &'a str,
    account: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_run_id: Option<&'a str>,
}

/// Print instances in `status` as JSON, one array for all regions.
pub fn list(
    config_path: &Path,
    status: InstanceStatus,
    regions: &[String],
) -> anyhow::Result<ExitCode> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;

    let filter = InstanceFilter {
        regions: regions.to_vec(),
        accounts: Vec::new(),
        statuses: vec![status],
    };
    let records = store.list_instances(&filter)?;
    let listed: Vec<Listed<'_>> = records
        .iter()
        .map(|r| Listed {
            instance_id: &r.instance_id,
            region: &r.region,
            account: &r.account,
            error: r.last_error.as_deref(),
            last_run_id: r.last_run_id.as_deref(),
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&listed)?);
    Ok(ExitCode::SUCCESS)
}
