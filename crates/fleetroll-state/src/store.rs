//! StateStore: redb-backed state persistence for fleetroll.
//!
//! Provides typed operations over instance records, rollout runs and leases.
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// What a lease update should do with the stored record.
pub(crate) enum LockWrite {
    Unchanged,
    Put(LockRecord),
    Delete,
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(RUNS).map_err(map_err!(Table))?;
        txn.open_table(LOCKS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Get an instance by its `{region}/{instance_id}` key.
    pub fn get_instance(&self, key: &str) -> StateResult<Option<InstanceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: InstanceRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List instances matching a filter, in key order (region, then id).
    pub fn list_instances(&self, filter: &InstanceFilter) -> StateResult<Vec<InstanceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: InstanceRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if filter.matches(&record) {
                results.push(record);
            }
        }
        Ok(results)
    }

    /// Insert or replace an instance record.
    ///
    /// With `expected` set, the write only happens if a stored record exists
    /// and its status equals `expected`; otherwise `StateError::Conflict`.
    /// `None` writes unconditionally (inventory import only).
    pub fn upsert_instance(
        &self,
        record: &InstanceRecord,
        expected: Option<InstanceStatus>,
    ) -> StateResult<()> {
        let key = record.table_key();
        self.write_instance(record, |current| match expected {
            None => Ok(()),
            Some(status) => match current {
                Some(stored) if stored.status == status => Ok(()),
                other => Err(StateError::Conflict {
                    key: key.clone(),
                    expected: status.to_string(),
                    found: other.map(|r| r.status),
                }),
            },
        })
    }

    /// Conditional write scoped to a run: the stored record must be in
    /// `expected` status *and* owned by `run_id`.
    pub fn upsert_instance_for_run(
        &self,
        record: &InstanceRecord,
        expected: InstanceStatus,
        run_id: &str,
    ) -> StateResult<()> {
        let key = record.table_key();
        self.write_instance(record, |current| match current {
            Some(stored)
                if stored.status == expected && stored.last_run_id.as_deref() == Some(run_id) =>
            {
                Ok(())
            }
            other => Err(StateError::Conflict {
                key: key.clone(),
                expected: format!("{expected} by {run_id}"),
                found: other.map(|r| r.status),
            }),
        })
    }

    /// Read-check-write of one instance inside a single write transaction.
    fn write_instance<F>(&self, record: &InstanceRecord, check: F) -> StateResult<()>
    where
        F: FnOnce(Option<&InstanceRecord>) -> StateResult<()>,
    {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
            let current: Option<InstanceRecord> =
                match table.get(key.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => Some(
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                    ),
                    None => None,
                };
            // Dropping an uncommitted transaction aborts it.
            check(current.as_ref())?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, status = %record.status, "instance stored");
        Ok(())
    }

    // ── Runs ───────────────────────────────────────────────────────

    /// Insert or update a rollout run.
    pub fn put_run(&self, run: &RolloutRun) -> StateResult<()> {
        let value = serde_json::to_vec(run).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RUNS).map_err(map_err!(Table))?;
            table
                .insert(run.run_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(run_id = %run.run_id, outcome = ?run.outcome, "run stored");
        Ok(())
    }

    /// Get a run by ID.
    pub fn get_run(&self, run_id: &str) -> StateResult<Option<RolloutRun>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUNS).map_err(map_err!(Table))?;
        match table.get(run_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let run: RolloutRun =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    /// List all runs, oldest first.
    pub fn list_runs(&self) -> StateResult<Vec<RolloutRun>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUNS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let run: RolloutRun =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(run);
        }
        results.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.run_id.cmp(&b.run_id)));
        Ok(results)
    }

    // ── Locks ──────────────────────────────────────────────────────

    /// Get a lease record by lock name, expired or not.
    pub fn get_lock(&self, name: &str) -> StateResult<Option<LockRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let lock: LockRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(lock))
            }
            None => Ok(None),
        }
    }

    /// Atomically read, decide on, and rewrite a lease record.
    ///
    /// `decide` runs inside the write transaction; returning `Err` aborts it.
    pub(crate) fn update_lock<T, E, F>(&self, name: &str, decide: F) -> Result<T, E>
    where
        E: From<StateError>,
        F: FnOnce(Option<LockRecord>) -> Result<(LockWrite, T), E>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let out;
        {
            let mut table = txn.open_table(LOCKS).map_err(map_err!(Table))?;
            let current: Option<LockRecord> = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            let (write, value) = decide(current)?;
            match write {
                LockWrite::Unchanged => {}
                LockWrite::Put(record) => {
                    let bytes = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                    table
                        .insert(name, bytes.as_slice())
                        .map_err(map_err!(Write))?;
                }
                LockWrite::Delete => {
                    table.remove(name).map_err(map_err!(Write))?;
                }
            }
            out = value;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(out)
    }
}
