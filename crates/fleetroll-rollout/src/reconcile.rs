//! Orphan sweep.
//!
//! A run that dies mid-flight leaves `Dispatched` records behind. Once such
//! a record is older than the instance timeout, no live run can still be
//! waiting on it, so the sweep fails it and makes it eligible again.
//! Callers must hold the rollout lease.

use std::time::Duration;

use tracing::{info, warn};

use fleetroll_state::{
    epoch_millis, InstanceFilter, InstanceKey, InstanceStatus, LockManager, StateResult,
    StateStore,
};

use crate::error::RolloutResult;

/// Run a sweep outside of a rollout, under its own short-lived lease.
pub fn reconcile(
    store: &StateStore,
    locks: &LockManager,
    lock_ttl: Duration,
    stale_after: Duration,
) -> RolloutResult<Vec<InstanceKey>> {
    let holder = format!("reconcile-{}", epoch_millis());
    let token = locks.acquire(&holder, lock_ttl)?;
    let result = reclaim_orphans(store, stale_after, epoch_millis());
    if let Err(e) = locks.release(&token) {
        warn!(%holder, error = %e, "failed to release lease after sweep");
    }
    Ok(result?)
}

/// Fail `Dispatched` records whose last update is at least `stale_after` old.
///
/// Returns the keys that were reclaimed.
pub fn reclaim_orphans(
    store: &StateStore,
    stale_after: Duration,
    now: u64,
) -> StateResult<Vec<InstanceKey>> {
    let stale_ms = u64::try_from(stale_after.as_millis()).unwrap_or(u64::MAX);
    let filter = InstanceFilter::all().status(InstanceStatus::Dispatched);
    let dispatched = store.list_instances(&filter)?;

    let mut reclaimed = Vec::new();
    for record in dispatched {
        if now.saturating_sub(record.updated_at) < stale_ms {
            continue;
        }

        let key = record.table_key();
        let owner = record.last_run_id.clone().unwrap_or_default();
        let mut next = record.clone();
        next.status = InstanceStatus::Failed;
        next.last_error = Some(format!("orphaned: run {owner} never reported a result"));
        next.updated_at = epoch_millis();

        match store.upsert_instance(&next, Some(InstanceStatus::Dispatched)) {
            Ok(()) => {
                info!(%key, run_id = %owner, "reclaimed orphaned instance");
                reclaimed.push(key);
            }
            Err(e) if e.is_conflict() => {
                warn!(%key, error = %e, "orphan changed during sweep, leaving it");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(reclaimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetroll_state::InstanceRecord;

    #[test]
    fn only_stale_dispatched_records_are_reclaimed() {
        let store = StateStore::open_in_memory().unwrap();

        let mut stale = InstanceRecord::new("i-old", "r1", "prod", InstanceStatus::Dispatched);
        stale.last_run_id = Some("run-dead".to_string());
        stale.updated_at = 1_000;
        let mut fresh = InstanceRecord::new("i-new", "r1", "prod", InstanceStatus::Dispatched);
        fresh.updated_at = 500_000;
        let mut done = InstanceRecord::new("i-done", "r1", "prod", InstanceStatus::Succeeded);
        done.updated_at = 0;
        for r in [&stale, &fresh, &done] {
            store.upsert_instance(r, None).unwrap();
        }

        let reclaimed = reclaim_orphans(&store, Duration::from_secs(600), 601_000).unwrap();
        assert_eq!(reclaimed, vec![stale.table_key()]);

        let swept = store.get_instance(&stale.table_key()).unwrap().unwrap();
        assert_eq!(swept.status, InstanceStatus::Failed);
        assert!(swept.last_error.unwrap().contains("run-dead"));
        assert_eq!(
            store.get_instance(&fresh.table_key()).unwrap().unwrap().status,
            InstanceStatus::Dispatched
        );
        assert_eq!(
            store.get_instance(&done.table_key()).unwrap().unwrap().status,
            InstanceStatus::Succeeded
        );
    }

    #[test]
    fn reconcile_respects_running_rollout() {
        let store = StateStore::open_in_memory().unwrap();
        let locks = LockManager::new(store.clone(), "rollout");
        let held = locks.acquire("run-live", Duration::from_secs(60)).unwrap();

        let err = reconcile(&store, &locks, Duration::from_secs(60), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, crate::error::RolloutError::LockContention { .. }));

        locks.release(&held).unwrap();
        assert!(
            reconcile(&store, &locks, Duration::from_secs(60), Duration::from_secs(1))
                .unwrap()
                .is_empty()
        );
        assert!(locks.inspect().unwrap().is_none());
    }

    #[test]
    fn nothing_to_reclaim() {
        let store = StateStore::open_in_memory().unwrap();
        let reclaimed = reclaim_orphans(&store, Duration::from_secs(1), epoch_millis()).unwrap();
        assert!(reclaimed.is_empty());
    }
}
