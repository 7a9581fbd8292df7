//! Single-run lease on top of the state store.
//!
//! One well-known key holds at most one live [`LockRecord`]. Acquire, renew
//! and release are each a single redb write transaction, so two processes
//! racing on the same key observe a total order: exactly one acquire wins.
//! A lease whose holder stops renewing is free again once `expires_at`
//! passes; there is no manual unlock step on the happy path.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::LockError;
use crate::store::{LockWrite, StateStore};
use crate::types::{epoch_millis, LockRecord, RunId};

/// Proof of holding the lease, handed to the run that acquired it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub name: String,
    pub run_id: RunId,
    pub token: String,
    pub ttl: Duration,
    /// Unix timestamp (milliseconds) the lease currently runs until.
    pub expires_at: u64,
}

/// Acquire/renew/release for a named lease.
#[derive(Clone)]
pub struct LockManager {
    store: StateStore,
    name: String,
}

impl LockManager {
    pub fn new(store: StateStore, name: &str) -> Self {
        Self {
            store,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take the lease for `run_id`, or report who holds it.
    pub fn acquire(&self, run_id: &str, ttl: Duration) -> Result<LockToken, LockError> {
        self.acquire_at(run_id, ttl, epoch_millis())
    }

    /// [`acquire`](Self::acquire) against an explicit clock reading.
    pub fn acquire_at(
        &self,
        run_id: &str,
        ttl: Duration,
        now: u64,
    ) -> Result<LockToken, LockError> {
        let name = self.name.clone();
        let token = self.store.update_lock(&self.name, |current| {
            if let Some(existing) = current {
                if !existing.is_expired(now) {
                    return Err(LockError::AlreadyHeld {
                        name: name.clone(),
                        holder: existing.holder_run_id,
                        expires_at: existing.expires_at,
                    });
                }
                debug!(
                    lock = %name,
                    stale_holder = %existing.holder_run_id,
                    "taking over expired lease"
                );
            }

            let record = LockRecord {
                name: name.clone(),
                holder_run_id: run_id.to_string(),
                token: uuid::Uuid::new_v4().to_string(),
                acquired_at: now,
                expires_at: now.saturating_add(ttl_millis(ttl)),
            };
            let token = LockToken {
                name: name.clone(),
                run_id: run_id.to_string(),
                token: record.token.clone(),
                ttl,
                expires_at: record.expires_at,
            };
            Ok((LockWrite::Put(record), token))
        })?;

        info!(lock = %self.name, %run_id, expires_at = token.expires_at, "lease acquired");
        Ok(token)
    }

    /// Extend the lease by another TTL from now.
    ///
    /// Fails with `Expired` if the lease lapsed or another run took it over;
    /// the caller must then stop acting as the holder.
    pub fn renew(&self, token: &mut LockToken) -> Result<(), LockError> {
        self.renew_at(token, epoch_millis())
    }

    /// [`renew`](Self::renew) against an explicit clock reading.
    pub fn renew_at(&self, token: &mut LockToken, now: u64) -> Result<(), LockError> {
        let name = self.name.clone();
        let expires_at = self.store.update_lock(&self.name, |current| match current {
            Some(mut existing) if existing.token == token.token && !existing.is_expired(now) => {
                existing.expires_at = now.saturating_add(ttl_millis(token.ttl));
                let expires_at = existing.expires_at;
                Ok((LockWrite::Put(existing), expires_at))
            }
            _ => Err(LockError::Expired { name: name.clone() }),
        });

        match expires_at {
            Ok(expires_at) => {
                token.expires_at = expires_at;
                debug!(lock = %self.name, run_id = %token.run_id, expires_at, "lease renewed");
                Ok(())
            }
            Err(e) => {
                warn!(
                    lock = %self.name,
                    run_id = %token.run_id,
                    error = %e,
                    "lease renewal failed"
                );
                Err(e)
            }
        }
    }

    /// Give the lease back. A lease already lost to someone else is left alone.
    pub fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let released = self.store.update_lock(&self.name, |current| match current {
            Some(existing) if existing.token == token.token => Ok((LockWrite::Delete, true)),
            _ => Ok::<_, LockError>((LockWrite::Unchanged, false)),
        })?;

        if released {
            info!(lock = %self.name, run_id = %token.run_id, "lease released");
        } else {
            warn!(
                lock = %self.name,
                run_id = %token.run_id,
                "lease no longer held, nothing to release"
            );
        }
        Ok(())
    }

    /// The stored lease, if any, whether or not it has expired.
    pub fn inspect(&self) -> Result<Option<LockRecord>, LockError> {
        Ok(self.store.get_lock(&self.name)?)
    }

    /// Remove the lease regardless of holder. Returns true if one existed.
    pub fn force_release(&self) -> Result<bool, LockError> {
        let existed = self.store.update_lock(&self.name, |current| match current {
            Some(existing) => {
                warn!(lock = %self.name, holder = %existing.holder_run_id, "force-releasing lease");
                Ok::<_, LockError>((LockWrite::Delete, true))
            }
            None => Ok((LockWrite::Unchanged, false)),
        })?;
        Ok(existed)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    const TTL: Duration = Duration::from_secs(10);

    fn manager() -> LockManager {
        LockManager::new(StateStore::open_in_memory().unwrap(), "rollout")
    }

    #[test]
    fn acquire_then_contend() {
        let locks = manager();
        let token = locks.acquire_at("run-a", TTL, 1_000).unwrap();
        assert_eq!(token.expires_at, 11_000);

        match locks.acquire_at("run-b", TTL, 2_000) {
            Err(LockError::AlreadyHeld { holder, expires_at, .. }) => {
                assert_eq!(holder, "run-a");
                assert_eq!(expires_at, 11_000);
            }
            other => panic!("expected AlreadyHeld, got {other:?}"),
        }
    }

    #[test]
    fn expires_after_exactly_ttl() {
        let locks = manager();
        locks.acquire_at("run-a", TTL, 0).unwrap();

        // One millisecond short of the TTL: still held.
        assert!(matches!(
            locks.acquire_at("run-b", TTL, 9_999),
            Err(LockError::AlreadyHeld { .. })
        ));

        let token = locks.acquire_at("run-b", TTL, 10_000).unwrap();
        assert_eq!(token.run_id, "run-b");
        assert_eq!(locks.inspect().unwrap().unwrap().holder_run_id, "run-b");
    }

    #[test]
    fn renew_extends_lease() {
        let locks = manager();
        let mut token = locks.acquire_at("run-a", TTL, 0).unwrap();

        locks.renew_at(&mut token, 8_000).unwrap();
        assert_eq!(token.expires_at, 18_000);

        // The original expiry no longer frees the lease.
        assert!(locks.acquire_at("run-b", TTL, 12_000).is_err());
    }

    #[test]
    fn renew_after_expiry_fails() {
        let locks = manager();
        let mut token = locks.acquire_at("run-a", TTL, 0).unwrap();
        assert!(matches!(
            locks.renew_at(&mut token, 10_000),
            Err(LockError::Expired { .. })
        ));
    }

    #[test]
    fn renew_after_takeover_fails() {
        let locks = manager();
        let mut stale = locks.acquire_at("run-a", TTL, 0).unwrap();
        locks.acquire_at("run-b", TTL, 20_000).unwrap();

        assert!(matches!(
            locks.renew_at(&mut stale, 21_000),
            Err(LockError::Expired { .. })
        ));
    }

    #[test]
    fn release_frees_lease() {
        let locks = manager();
        let token = locks.acquire_at("run-a", TTL, 0).unwrap();
        locks.release(&token).unwrap();
        assert!(locks.inspect().unwrap().is_none());
        locks.acquire_at("run-b", TTL, 1).unwrap();
    }

    #[test]
    fn release_by_stale_holder_keeps_new_lease() {
        let locks = manager();
        let stale = locks.acquire_at("run-a", TTL, 0).unwrap();
        locks.acquire_at("run-b", TTL, 20_000).unwrap();

        locks.release(&stale).unwrap();
        assert_eq!(locks.inspect().unwrap().unwrap().holder_run_id, "run-b");
    }

    #[test]
    fn force_release() {
        let locks = manager();
        assert!(!locks.force_release().unwrap());
        locks.acquire("run-a", TTL).unwrap();
        assert!(locks.force_release().unwrap());
        assert!(locks.inspect().unwrap().is_none());
    }

    #[test]
    fn concurrent_acquire_has_single_winner() {
        let locks = manager();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = ["run-a", "run-b"]
            .into_iter()
            .map(|run_id| {
                let locks = locks.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    locks.acquire(run_id, TTL)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        let losers = results
            .iter()
            .filter(|r| matches!(r, Err(LockError::AlreadyHeld { .. })))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(losers, 1);
    }

    #[test]
    fn separate_names_do_not_contend() {
        let store = StateStore::open_in_memory().unwrap();
        let a = LockManager::new(store.clone(), "rollout");
        let b = LockManager::new(store, "maintenance");
        a.acquire_at("run-a", TTL, 0).unwrap();
        b.acquire_at("run-b", TTL, 0).unwrap();
    }
}
