//! Conditional instance transitions owned by one run.
//!
//! A conflict on any of these writes is retried once against a fresh read;
//! if the record still does not line up the write is abandoned and logged
//! as an anomaly. Only non-conflict store errors propagate.

use tracing::{debug, warn};

use fleetroll_state::{
    epoch_millis, InstanceRecord, InstanceStatus, RunId, StateResult, StateStore,
};

use crate::executor::InvocationHandle;

/// Outcome of claiming an instance for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// The record is now `Dispatched` and owned by this run.
    Claimed(InstanceRecord),
    /// Someone else moved the record; it must not be dispatched.
    Lost { found: Option<InstanceStatus> },
}

#[derive(Clone)]
pub struct Transitions {
    store: StateStore,
    run_id: RunId,
}

impl Transitions {
    pub fn new(store: StateStore, run_id: &str) -> Self {
        Self {
            store,
            run_id: run_id.to_string(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Move `observed` to `Dispatched` for this run.
    ///
    /// The write only lands if the stored status still equals the one seen
    /// at selection time. On conflict the record is re-read and, if it is
    /// still in one of the `eligible` statuses, the claim is retried once.
    pub fn claim(
        &self,
        observed: &InstanceRecord,
        eligible: &[InstanceStatus],
    ) -> StateResult<Claim> {
        let key = observed.table_key();
        let mut base = observed.clone();
        let mut retried = false;

        loop {
            let mut next = base.clone();
            next.status = InstanceStatus::Dispatched;
            next.last_run_id = Some(self.run_id.clone());
            next.last_error = None;
            next.invocation = None;
            next.updated_at = epoch_millis();

            match self.store.upsert_instance(&next, Some(base.status)) {
                Ok(()) => return Ok(Claim::Claimed(next)),
                Err(e) if e.is_conflict() => {
                    let fresh = self.store.get_instance(&key)?;
                    match fresh {
                        Some(fresh)
                            if !retried
                                && fresh.status != InstanceStatus::Dispatched
                                && eligible.contains(&fresh.status) =>
                        {
                            debug!(
                                %key,
                                from = %base.status,
                                to = %fresh.status,
                                "claim conflict, retrying"
                            );
                            base = fresh;
                            retried = true;
                        }
                        other => {
                            let found = other.map(|r| r.status);
                            warn!(
                                %key,
                                run_id = %self.run_id,
                                found = ?found,
                                "instance changed underneath the run, not dispatching"
                            );
                            return Ok(Claim::Lost { found });
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Record the invocation handle on a claimed instance.
    pub fn attach_invocation(
        &self,
        claimed: &InstanceRecord,
        handle: &InvocationHandle,
    ) -> StateResult<Option<InstanceRecord>> {
        self.rewrite_dispatched(claimed, |record| {
            record.invocation = Some(handle.0.clone());
        })
    }

    /// Move a claimed instance to its terminal status for this run.
    ///
    /// Returns `None` if the record no longer belongs to this run.
    pub fn finish(
        &self,
        claimed: &InstanceRecord,
        status: InstanceStatus,
        error: Option<String>,
        reported_version: Option<String>,
    ) -> StateResult<Option<InstanceRecord>> {
        self.rewrite_dispatched(claimed, |record| {
            record.status = status;
            record.last_error = if status == InstanceStatus::Failed {
                error.clone()
            } else {
                None
            };
            if reported_version.is_some() {
                record.reported_version = reported_version.clone();
            }
        })
    }

    /// Rewrite a record this run holds in `Dispatched`.
    fn rewrite_dispatched<F>(
        &self,
        base: &InstanceRecord,
        apply: F,
    ) -> StateResult<Option<InstanceRecord>>
    where
        F: Fn(&mut InstanceRecord),
    {
        let key = base.table_key();
        let mut base = base.clone();
        let mut retried = false;

        loop {
            let mut next = base.clone();
            apply(&mut next);
            next.updated_at = epoch_millis();

            match self
                .store
                .upsert_instance_for_run(&next, InstanceStatus::Dispatched, &self.run_id)
            {
                Ok(()) => return Ok(Some(next)),
                Err(e) if e.is_conflict() => {
                    let fresh = self.store.get_instance(&key)?;
                    match fresh {
                        Some(fresh)
                            if !retried
                                && fresh.status == InstanceStatus::Dispatched
                                && fresh.last_run_id.as_deref() == Some(self.run_id.as_str()) =>
                        {
                            base = fresh;
                            retried = true;
                        }
                        other => {
                            warn!(
                                %key,
                                run_id = %self.run_id,
                                found = ?other.map(|r| r.status),
                                "instance no longer dispatched by this run, update dropped"
                            );
                            return Ok(None);
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
