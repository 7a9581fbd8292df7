use std::path::Path;
use std::process::ExitCode;

use fleetroll_core::ConfigError;
use fleetroll_state::{epoch_millis, LockManager};

use super::{load_config, open_store};

pub fn status(config_path: &Path) -> anyhow::Result<ExitCode> {
    let config = load_config(config_path)?;
    let locks = LockManager::new(open_store(&config)?, &config.lock.name);

    match locks.inspect()? {
        None => println!("Lock {} is free.", locks.name()),
        Some(lock) if lock.is_expired(epoch_millis()) => println!(
            "Lock {} is free (lease of {} expired).",
            locks.name(),
            lock.holder_run_id
        ),
        Some(lock) => {
            let remaining = lock.expires_at.saturating_sub(epoch_millis()) / 1000;
            println!(
                "Lock {} held by {} for another {remaining}s.",
                locks.name(),
                lock.holder_run_id
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub fn release(config_path: &Path, force: bool) -> anyhow::Result<ExitCode> {
    if !force {
        return Err(ConfigError::Invalid(
            "refusing to break the lease without --force".to_string(),
        )
        .into());
    }

    let config = load_config(config_path)?;
    let locks = LockManager::new(open_store(&config)?, &config.lock.name);
    if locks.force_release()? {
        println!("✓ Lock {} released.", locks.name());
    } else {
        println!("Lock {} was not held.", locks.name());
    }
    Ok(ExitCode::SUCCESS)
}

pub fn reconcile(config_path: &Path) -> anyhow::Result<ExitCode> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    let locks = LockManager::new(store.clone(), &config.lock.name);

    let reclaimed = fleetroll_rollout::reconcile::reconcile(
        &store,
        &locks,
        config.lock.ttl()?,
        config.poll.instance_timeout()?,
    )?;

    if reclaimed.is_empty() {
        println!("No orphaned instances.");
    } else {
        println!("✓ Reclaimed {} orphaned instances:", reclaimed.len());
        for key in &reclaimed {
            println!("  {key}");
        }
    }
    Ok(ExitCode::SUCCESS)
}
