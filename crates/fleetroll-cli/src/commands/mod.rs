pub mod inventory;
pub mod lock;
pub mod report;
pub mod run;

use std::path::Path;

use anyhow::Context;
use clap::ValueEnum;
use tracing::debug;

use fleetroll_core::FleetConfig;
use fleetroll_state::StateStore;

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub fn load_config(path: &Path) -> anyhow::Result<FleetConfig> {
    let config = FleetConfig::from_file(path)?;
    debug!(path = %path.display(), "config loaded");
    Ok(config)
}

/// Open the configured store, creating its directory on first use.
pub fn open_store(config: &FleetConfig) -> anyhow::Result<StateStore> {
    let path = &config.store.path;
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating state directory {}", dir.display()))?;
        }
    }
    let store = StateStore::open(path)
        .with_context(|| format!("opening state store {}", path.display()))?;
    Ok(store)
}

/// Write `content` to `output`, or stdout when no file is given.
pub fn emit(content: &str, output: Option<&Path>) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, content)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("✓ Wrote {}", path.display());
        }
        None => print!("{content}"),
    }
    Ok(())
}
