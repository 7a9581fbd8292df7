//! Command dispatch for a single instance.

use std::sync::Arc;

use tracing::{info, warn};

use fleetroll_state::{InstanceRecord, InstanceStatus, StateResult};

use crate::executor::{CommandExecutor, CommandSpec, CommandTarget, InvocationHandle};
use crate::transition::{Claim, Transitions};

/// What happened when an instance was handed to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Invocation accepted; the record is `Dispatched` with its handle.
    Submitted {
        record: InstanceRecord,
        handle: InvocationHandle,
    },
    /// Submission failed; the record is already `Failed`.
    Rejected { record: Option<InstanceRecord> },
    /// The record moved on before it could be claimed. Nothing was sent.
    NotClaimed { found: Option<InstanceStatus> },
}

/// Claims instances for a run and submits the install command.
///
/// The `Dispatched` write always lands before the command is submitted,
/// so a crash in between leaves a record the orphan sweep can reclaim,
/// never a running install the store knows nothing about.
#[derive(Clone)]
pub struct Dispatcher {
    transitions: Transitions,
    executor: Arc<dyn CommandExecutor>,
    spec: CommandSpec,
    eligible: Vec<InstanceStatus>,
}

impl Dispatcher {
    pub fn new(
        transitions: Transitions,
        executor: Arc<dyn CommandExecutor>,
        spec: CommandSpec,
        eligible: Vec<InstanceStatus>,
    ) -> Self {
        Self {
            transitions,
            executor,
            spec,
            eligible,
        }
    }

    pub async fn dispatch(&self, record: &InstanceRecord) -> StateResult<Dispatch> {
        let claimed = match self.transitions.claim(record, &self.eligible)? {
            Claim::Claimed(claimed) => claimed,
            Claim::Lost { found } => return Ok(Dispatch::NotClaimed { found }),
        };

        let target = CommandTarget::from(&claimed);
        let handle = match self.executor.submit(&target, &self.spec).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    instance = %claimed.instance_id,
                    region = %claimed.region,
                    error = %e,
                    "dispatch failed"
                );
                let record = self.transitions.finish(
                    &claimed,
                    InstanceStatus::Failed,
                    Some(e.to_string()),
                    None,
                )?;
                return Ok(Dispatch::Rejected { record });
            }
        };

        info!(
            instance = %claimed.instance_id,
            region = %claimed.region,
            %handle,
            mode = self.spec.mode(),
            "command dispatched"
        );

        let record = self
            .transitions
            .attach_invocation(&claimed, &handle)?
            .unwrap_or(claimed);
        Ok(Dispatch::Submitted { record, handle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{DispatchError, InvocationStatus, StatusError};
    use crate::selector::eligible_statuses;
    use async_trait::async_trait;
    use fleetroll_state::StateStore;

    struct FixedExecutor {
        reject: bool,
    }

    #[async_trait]
    impl CommandExecutor for FixedExecutor {
        async fn submit(
            &self,
            target: &CommandTarget,
            _spec: &CommandSpec,
        ) -> Result<InvocationHandle, DispatchError> {
            if self.reject {
                Err(DispatchError::Unreachable(target.instance_id.clone()))
            } else {
                Ok(InvocationHandle(format!("cmd-{}", target.instance_id)))
            }
        }

        async fn status(
            &self,
            _handle: &InvocationHandle,
        ) -> Result<InvocationStatus, StatusError> {
            Ok(InvocationStatus::Pending)
        }
    }

    fn setup(reject: bool) -> (StateStore, Dispatcher, InstanceRecord) {
        let store = StateStore::open_in_memory().unwrap();
        let record = InstanceRecord::new("i-1", "r1", "prod", InstanceStatus::Pending);
        store.upsert_instance(&record, None).unwrap();
        let spec = CommandSpec {
            script_url: "s3://b/install.sh".to_string(),
            installer_url: None,
            expected_version: "7.2.0".to_string(),
            test_mode: false,
        };
        let dispatcher = Dispatcher::new(
            Transitions::new(store.clone(), "run-1"),
            Arc::new(FixedExecutor { reject }),
            spec,
            eligible_statuses(false),
        );
        (store, dispatcher, record)
    }

    #[tokio::test]
    async fn submitted_records_handle() {
        let (store, dispatcher, record) = setup(false);
        let Dispatch::Submitted {
            record: stored,
            handle,
        } = dispatcher.dispatch(&record).await.unwrap()
        else {
            panic!("expected submission");
        };
        assert_eq!(handle.0, "cmd-i-1");
        assert_eq!(stored.status, InstanceStatus::Dispatched);
        assert_eq!(stored.invocation.as_deref(), Some("cmd-i-1"));
        assert_eq!(store.get_instance(&record.table_key()).unwrap().unwrap(), stored);
    }

    #[tokio::test]
    async fn rejected_submission_fails_instance() {
        let (store, dispatcher, record) = setup(true);
        assert!(matches!(
            dispatcher.dispatch(&record).await.unwrap(),
            Dispatch::Rejected { .. }
        ));
        let stored = store.get_instance(&record.table_key()).unwrap().unwrap();
        assert_eq!(stored.status, InstanceStatus::Failed);
        assert!(stored.last_error.unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn second_dispatch_in_same_run_is_refused() {
        let (_store, dispatcher, record) = setup(false);
        dispatcher.dispatch(&record).await.unwrap();
        assert_eq!(
            dispatcher.dispatch(&record).await.unwrap(),
            Dispatch::NotClaimed {
                found: Some(InstanceStatus::Dispatched)
            }
        );
    }
}
