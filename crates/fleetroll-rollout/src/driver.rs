//! Orchestrator: drives one rollout run end to end.
//!
//! ```text
//! Idle → LockAcquired → Selecting → Dispatching → Polling → Reporting → Released
//! ```
//!
//! Nothing is written before the lease is held, and the lease is released
//! on every exit path once acquired. Each selected instance gets its own
//! task that holds a regional and a global concurrency permit for its
//! whole dispatch-and-poll lifetime. A heartbeat task renews the lease from
//! acquisition until release; if renewal fails the run is aborted and
//! in-flight instances are failed as orphaned. The lease is checked once
//! more after confirmation, before anything is dispatched.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use fleetroll_core::{ConfigError, FleetConfig};
use fleetroll_state::{
    epoch_millis, InstanceRecord, InstanceStatus, LockManager, LockToken, RolloutRun, RunOutcome,
    StateError, StateResult, StateStore, TargetPolicy,
};

use crate::abort::{aborted, AbortHandle, AbortReason};
use crate::dispatcher::{Dispatch, Dispatcher};
use crate::error::{RolloutError, RolloutResult};
use crate::executor::{CommandExecutor, CommandSpec};
use crate::notify::{notify_best_effort, LogNotifier, Notifier};
use crate::poller::{PollSettings, Poller};
use crate::reconcile::reclaim_orphans;
use crate::reporter::{Reporter, Summary};
use crate::selector::{select_batch, validate_size, Selection};
use crate::transition::Transitions;

/// Driver state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverPhase {
    Idle,
    LockAcquired,
    Selecting,
    Dispatching,
    Polling,
    Reporting,
    Released,
}

/// Tunables for a run, resolved from [`FleetConfig`].
#[derive(Debug, Clone)]
pub struct RolloutSettings {
    pub lock_name: String,
    pub lock_ttl: Duration,
    pub renew_interval: Duration,
    pub global_concurrency: usize,
    pub region_concurrency: usize,
    pub poll: PollSettings,
    pub command: CommandSpec,
}

impl RolloutSettings {
    pub fn from_config(config: &FleetConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            lock_name: config.lock.name.clone(),
            lock_ttl: config.lock.ttl()?,
            renew_interval: config.lock.renew_interval()?,
            global_concurrency: config.dispatch.global_concurrency,
            region_concurrency: config.dispatch.region_concurrency,
            poll: PollSettings::from_config(&config.poll)?,
            command: CommandSpec::from_config(&config.command, false),
        })
    }
}

/// What to roll out.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub policy: TargetPolicy,
    /// Dispatch in test mode: nothing is installed, every reachable
    /// instance ends `Skipped`.
    pub dry_run: bool,
}

/// Everything known about a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run: RolloutRun,
    pub selection: Selection,
    pub summary: Summary,
    pub phases: Vec<DriverPhase>,
}

impl RunReport {
    /// Completed with no failed instance.
    pub fn is_clean(&self) -> bool {
        self.run.outcome == RunOutcome::Completed && self.summary.totals.failed == 0
    }
}

/// Called with the selection before anything is dispatched. Returning
/// `false` ends the run as aborted. Runs on the blocking pool, so it may
/// wait on a terminal.
pub type ConfirmFn = Arc<dyn Fn(&Selection) -> bool + Send + Sync>;

pub struct Orchestrator {
    store: StateStore,
    locks: LockManager,
    executor: Arc<dyn CommandExecutor>,
    notifier: Arc<dyn Notifier>,
    settings: RolloutSettings,
    abort: AbortHandle,
    confirm: Option<ConfirmFn>,
    phases: Vec<DriverPhase>,
}

impl Orchestrator {
    pub fn new(
        store: StateStore,
        executor: Arc<dyn CommandExecutor>,
        settings: RolloutSettings,
    ) -> Self {
        let locks = LockManager::new(store.clone(), &settings.lock_name);
        Self {
            store,
            locks,
            executor,
            notifier: Arc::new(LogNotifier),
            settings,
            abort: AbortHandle::new(),
            confirm: None,
            phases: vec![DriverPhase::Idle],
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_confirmation(mut self, confirm: ConfirmFn) -> Self {
        self.confirm = Some(confirm);
        self
    }

    /// Handle for stopping the current run from outside (e.g. on Ctrl-C).
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn phase(&self) -> DriverPhase {
        self.phases.last().copied().unwrap_or(DriverPhase::Idle)
    }

    fn enter(&mut self, phase: DriverPhase) {
        debug!(from = ?self.phase(), to = ?phase, "driver phase");
        self.phases.push(phase);
    }

    /// Execute one rollout run.
    ///
    /// Per-instance failures are recorded and summarised, not returned.
    /// Errors are lease contention (nothing written), invalid policy, a
    /// lease lost before dispatch, and store failures. Every error after
    /// the lease was taken is also sent to the notifier.
    pub async fn run(&mut self, request: RunRequest) -> RolloutResult<RunReport> {
        self.phases = vec![DriverPhase::Idle];
        validate_size(request.policy.size)?;

        let started_at = epoch_millis();
        let run_id = RolloutRun::generate_id(started_at);
        let token = match self.locks.acquire(&run_id, self.settings.lock_ttl) {
            Ok(token) => token,
            Err(e) => {
                let err = RolloutError::from(e);
                warn!(%run_id, error = %err, "rollout not started");
                return Err(err);
            }
        };
        self.enter(DriverPhase::LockAcquired);

        let (stop_tx, stop_rx) = watch::channel(false);
        let heartbeat = spawn_heartbeat(
            self.locks.clone(),
            token.clone(),
            self.settings.renew_interval,
            self.abort.clone(),
            stop_rx,
        );

        let result = self.run_locked(&run_id, started_at, &token, &request).await;

        let _ = stop_tx.send(true);
        if let Err(e) = heartbeat.await {
            warn!(%run_id, error = %e, "heartbeat task failed");
        }

        if let Err(e) = &result {
            error!(%run_id, error = %e, "rollout failed");
            let outcome = match e {
                RolloutError::LockLost(_) => RunOutcome::LockLost,
                _ => RunOutcome::Failed,
            };
            self.mark_run_failed(&run_id, outcome);
        }

        if let Err(e) = self.locks.release(&token) {
            error!(%run_id, error = %e, "failed to release lease; it will lapse after its TTL");
        }
        self.enter(DriverPhase::Released);
        self.abort.reset();

        let mut report = match result {
            Ok(report) => report,
            Err(e) => {
                self.notify_failure(&run_id, &e).await;
                return Err(e);
            }
        };
        report.phases = self.phases.clone();
        info!(
            %run_id,
            outcome = ?report.run.outcome,
            selected = report.selection.len(),
            succeeded = report.summary.totals.succeeded,
            failed = report.summary.totals.failed,
            skipped = report.summary.totals.skipped,
            "rollout finished"
        );
        notify_best_effort(self.notifier.as_ref(), report.run.outcome, &report.summary).await;
        Ok(report)
    }

    async fn run_locked(
        &mut self,
        run_id: &str,
        started_at: u64,
        token: &LockToken,
        request: &RunRequest,
    ) -> RolloutResult<RunReport> {
        let mut run = RolloutRun {
            run_id: run_id.to_string(),
            policy: request.policy.clone(),
            dry_run: request.dry_run,
            started_at,
            ended_at: None,
            lock_token: token.token.clone(),
            selected_instances: Vec::new(),
            shortfall: 0,
            outcome: RunOutcome::InFlight,
        };
        self.store.put_run(&run)?;

        let timeout = self.settings.poll.instance_timeout;
        let reclaimed = reclaim_orphans(&self.store, timeout, epoch_millis())?;
        if !reclaimed.is_empty() {
            warn!(
                %run_id,
                count = reclaimed.len(),
                "reclaimed orphaned instances from earlier runs"
            );
        }

        self.enter(DriverPhase::Selecting);
        let records = self.store.list_instances(&request.policy.filter())?;
        let selection = select_batch(&records, &request.policy)?;
        run.selected_instances = selection.keys();
        run.shortfall = selection.shortfall;
        self.store.put_run(&run)?;

        info!(
            %run_id,
            size = %request.policy.size,
            dry_run = request.dry_run,
            eligible = selection.eligible,
            selected = selection.len(),
            shortfall = selection.shortfall,
            "batch selected"
        );
        if selection.shortfall > 0 {
            warn!(
                %run_id,
                shortfall = selection.shortfall,
                "fewer eligible instances than requested"
            );
        }

        let confirmed = match self.confirm.clone() {
            Some(confirm) if !selection.is_empty() => {
                let shown = selection.clone();
                match tokio::task::spawn_blocking(move || confirm(&shown)).await {
                    Ok(answer) => answer,
                    Err(e) => {
                        warn!(%run_id, error = %e, "confirmation prompt failed");
                        false
                    }
                }
            }
            _ => true,
        };

        let outcome = if !confirmed {
            info!(%run_id, "rollout declined before dispatch");
            RunOutcome::Aborted
        } else if selection.is_empty() {
            RunOutcome::Completed
        } else {
            self.ensure_lease(token)?;
            self.execute(run_id, &selection, request.dry_run).await?
        };

        self.enter(DriverPhase::Reporting);
        run.ended_at = Some(epoch_millis());
        run.outcome = outcome;
        self.store.put_run(&run)?;
        let summary = Reporter::new(self.store.clone()).report_run(run_id)?;

        Ok(RunReport {
            run,
            selection,
            summary,
            phases: Vec::new(),
        })
    }

    /// Dispatch and poll every selected instance.
    async fn execute(
        &mut self,
        run_id: &str,
        selection: &Selection,
        dry_run: bool,
    ) -> RolloutResult<RunOutcome> {
        self.enter(DriverPhase::Dispatching);

        let mut spec = self.settings.command.clone();
        spec.test_mode = dry_run;
        let transitions = Transitions::new(self.store.clone(), run_id);
        let task = Arc::new(InstanceTask {
            dispatcher: Dispatcher::new(
                transitions.clone(),
                self.executor.clone(),
                spec.clone(),
                selection.eligible_statuses.clone(),
            ),
            poller: Poller::new(
                transitions,
                self.executor.clone(),
                self.settings.poll,
                &spec.expected_version,
                dry_run,
            ),
        });

        let global = Arc::new(Semaphore::new(self.settings.global_concurrency.max(1)));
        let mut regional: HashMap<String, Arc<Semaphore>> = HashMap::new();
        let mut tasks = JoinSet::new();
        for record in &selection.instances {
            let region = regional
                .entry(record.region.clone())
                .or_insert_with(|| {
                    Arc::new(Semaphore::new(self.settings.region_concurrency.max(1)))
                })
                .clone();
            tasks.spawn(run_instance(
                task.clone(),
                record.clone(),
                global.clone(),
                region,
                self.abort.subscribe(),
            ));
        }

        self.enter(DriverPhase::Polling);
        let mut tally = Tally::default();
        let mut fatal: Option<StateError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => tally.record(outcome),
                Ok(Err(e)) => {
                    error!(%run_id, error = %e, "state store failure, aborting run");
                    self.abort.signal(AbortReason::StoreFailure);
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    error!(%run_id, error = %e, "instance task panicked");
                    tally.dropped += 1;
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e.into());
        }

        debug!(
            %run_id,
            settled = tally.settled,
            failed = tally.failed,
            not_dispatched = tally.not_dispatched,
            dropped = tally.dropped,
            "all instance tasks finished"
        );

        Ok(match self.abort.current() {
            None => RunOutcome::Completed,
            Some(AbortReason::Operator) => RunOutcome::Aborted,
            Some(AbortReason::LockLost) => RunOutcome::LockLost,
            Some(AbortReason::StoreFailure) => RunOutcome::Failed,
        })
    }

    /// Fail fast if the lease lapsed or changed hands, e.g. while the
    /// operator was answering the prompt.
    fn ensure_lease(&self, token: &LockToken) -> RolloutResult<()> {
        if self.abort.current() == Some(AbortReason::LockLost) {
            return Err(RolloutError::LockLost(self.locks.name().to_string()));
        }
        let mut check = token.clone();
        self.locks.renew(&mut check)?;
        Ok(())
    }

    fn mark_run_failed(&self, run_id: &str, outcome: RunOutcome) {
        let result = self.store.get_run(run_id).and_then(|run| match run {
            Some(mut run) if run.ended_at.is_none() => {
                run.ended_at = Some(epoch_millis());
                run.outcome = outcome;
                self.store.put_run(&run)
            }
            _ => Ok(()),
        });
        if let Err(e) = result {
            warn!(%run_id, error = %e, "could not record run failure");
        }
    }

    /// Tell the notifier about a run that ended in an error. Uses whatever
    /// the store still has for the run.
    async fn notify_failure(&self, run_id: &str, err: &RolloutError) {
        let outcome = match err {
            RolloutError::LockLost(_) => RunOutcome::LockLost,
            _ => RunOutcome::Failed,
        };
        let summary = match Reporter::new(self.store.clone()).report_run(run_id) {
            Ok(summary) => summary,
            Err(e) => {
                debug!(%run_id, error = %e, "no run summary for failure notice");
                Summary::empty(Some(run_id.to_string()))
            }
        };
        notify_best_effort(self.notifier.as_ref(), outcome, &summary).await;
    }
}

struct InstanceTask {
    dispatcher: Dispatcher,
    poller: Poller,
}

enum TaskOutcome {
    Settled(InstanceStatus),
    NotDispatched,
    /// The record moved on underneath the run; nothing more was written.
    Dropped,
}

#[derive(Default)]
struct Tally {
    settled: u32,
    failed: u32,
    not_dispatched: u32,
    dropped: u32,
}

impl Tally {
    fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Settled(status) => {
                self.settled += 1;
                if status == InstanceStatus::Failed {
                    self.failed += 1;
                }
            }
            TaskOutcome::NotDispatched => self.not_dispatched += 1,
            TaskOutcome::Dropped => self.dropped += 1,
        }
    }
}

async fn run_instance(
    task: Arc<InstanceTask>,
    record: InstanceRecord,
    global: Arc<Semaphore>,
    regional: Arc<Semaphore>,
    mut abort: watch::Receiver<Option<AbortReason>>,
) -> StateResult<TaskOutcome> {
    let acquire = async {
        let regional = regional.acquire_owned().await.ok()?;
        let global = global.acquire_owned().await.ok()?;
        Some((regional, global))
    };
    let permits = tokio::select! {
        biased;
        _ = aborted(&mut abort) => None,
        permits = acquire => permits,
    };
    let Some(_permits) = permits else {
        debug!(instance = %record.instance_id, "run aborted before dispatch");
        return Ok(TaskOutcome::NotDispatched);
    };
    if abort.borrow().is_some() {
        return Ok(TaskOutcome::NotDispatched);
    }

    match task.dispatcher.dispatch(&record).await? {
        Dispatch::Submitted { record, handle } => {
            let status = task.poller.track(&record, &handle, &mut abort).await?;
            Ok(status.map_or(TaskOutcome::Dropped, TaskOutcome::Settled))
        }
        Dispatch::Rejected { record } => {
            Ok(record.map_or(TaskOutcome::Dropped, |r| TaskOutcome::Settled(r.status)))
        }
        Dispatch::NotClaimed { .. } => Ok(TaskOutcome::Dropped),
    }
}

/// Renew the lease every `every` until told to stop. A failed renewal
/// aborts the run.
fn spawn_heartbeat(
    locks: LockManager,
    mut token: LockToken,
    every: Duration,
    abort: AbortHandle,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = locks.renew(&mut token) {
                        error!(run_id = %token.run_id, error = %e, "lease lost, aborting run");
                        abort.signal(AbortReason::LockLost);
                        break;
                    }
                }
                _ = stop.changed() => break,
            }
        }
    })
}
