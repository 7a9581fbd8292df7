//! Outcome polling: waits for an invocation to finish and classifies it.
//!
//! Polls back off exponentially from `initial_interval` up to
//! `max_interval`. An invocation with no terminal status after
//! `instance_timeout` is failed. A successful invocation is only a
//! `Succeeded` instance if its health report says the agent is installed,
//! running and at the expected version.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use fleetroll_core::{ConfigError, PollConfig};
use fleetroll_state::{InstanceRecord, InstanceStatus, StateResult};

use crate::abort::{halted, AbortReason};
use crate::executor::{CommandExecutor, InvocationHandle, InvocationStatus, StatusError};
use crate::transition::Transitions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub instance_timeout: Duration,
}

impl PollSettings {
    pub fn from_config(config: &PollConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            initial_interval: config.initial_interval()?,
            max_interval: config.max_interval()?,
            instance_timeout: config.instance_timeout()?,
        })
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(30),
            instance_timeout: Duration::from_secs(600),
        }
    }
}

/// Doubling delay, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            initial,
            max: max.max(initial),
        }
    }

    /// The delay to wait now; the following one doubles.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

// ── Health report ─────────────────────────────────────────────────

/// Fields the install script prints on stdout as `key=value` lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub exit_code: Option<i32>,
    pub service_active: Option<bool>,
    pub process_present: Option<bool>,
    pub version: Option<String>,
}

impl HealthReport {
    /// Parse script output. Unknown lines are ignored; a repeated key
    /// keeps its last value.
    pub fn parse(output: &str) -> Self {
        let mut report = HealthReport::default();
        for line in output.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "exit_code" => report.exit_code = value.parse().ok(),
                "service_active" => report.service_active = parse_flag(value),
                "process_present" => report.process_present = parse_flag(value),
                "version" | "agent_version" if !value.is_empty() => {
                    report.version = Some(value.to_string())
                }
                _ => {}
            }
        }
        report
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "active" | "running" => Some(true),
        "false" | "no" | "0" | "inactive" | "stopped" => Some(false),
        _ => None,
    }
}

/// Classified result of a finished invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: InstanceStatus,
    pub error: Option<String>,
    pub version: Option<String>,
}

impl Verdict {
    fn failed(reason: impl Into<String>, version: Option<String>) -> Self {
        Self {
            status: InstanceStatus::Failed,
            error: Some(reason.into()),
            version,
        }
    }
}

/// Decide an instance's status from its health report.
///
/// In test mode only the script's exit code is checked and a clean run
/// is `Skipped`: nothing was installed.
pub fn classify(output: &str, expected_version: &str, test_mode: bool) -> Verdict {
    let report = HealthReport::parse(output);
    let version = report.version.clone();

    match report.exit_code {
        None => return Verdict::failed("health report missing exit_code", version),
        Some(0) => {}
        Some(code) => {
            return Verdict::failed(format!("install script exited with {code}"), version);
        }
    }

    if test_mode {
        return Verdict {
            status: InstanceStatus::Skipped,
            error: None,
            version,
        };
    }

    if report.service_active != Some(true) {
        return Verdict::failed("agent service not active", version);
    }
    if report.process_present != Some(true) {
        return Verdict::failed("agent process not running", version);
    }
    match &report.version {
        None => Verdict::failed("agent version not reported", version),
        Some(v) if v != expected_version => Verdict::failed(
            format!("version mismatch: expected {expected_version}, found {v}"),
            version,
        ),
        Some(_) => Verdict {
            status: InstanceStatus::Succeeded,
            error: None,
            version,
        },
    }
}

// ── Poller ────────────────────────────────────────────────────────

/// How waiting on an invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed(String),
    InvocationFailed(String),
    TimedOut(Duration),
    /// The run stopped owning the instance before the invocation finished.
    Orphaned(AbortReason),
}

#[derive(Clone)]
pub struct Poller {
    transitions: Transitions,
    executor: Arc<dyn CommandExecutor>,
    settings: PollSettings,
    expected_version: String,
    test_mode: bool,
}

impl Poller {
    pub fn new(
        transitions: Transitions,
        executor: Arc<dyn CommandExecutor>,
        settings: PollSettings,
        expected_version: &str,
        test_mode: bool,
    ) -> Self {
        Self {
            transitions,
            executor,
            settings,
            expected_version: expected_version.to_string(),
            test_mode,
        }
    }

    /// One status query.
    pub async fn poll(&self, handle: &InvocationHandle) -> Result<InvocationStatus, StatusError> {
        self.executor.status(handle).await
    }

    /// Poll with backoff until the invocation finishes, times out, or the
    /// run loses ownership. An operator abort does not stop the wait.
    pub async fn wait(
        &self,
        handle: &InvocationHandle,
        abort: &mut watch::Receiver<Option<AbortReason>>,
    ) -> PollOutcome {
        let timeout = self.settings.instance_timeout;
        let deadline = Instant::now() + timeout;
        let mut backoff = Backoff::new(self.settings.initial_interval, self.settings.max_interval);

        loop {
            match self.poll(handle).await {
                Ok(InvocationStatus::Pending) => {}
                Ok(InvocationStatus::Success(output)) => return PollOutcome::Completed(output),
                Ok(InvocationStatus::Failure(reason)) => {
                    return PollOutcome::InvocationFailed(reason);
                }
                Err(StatusError::Transient(e)) => {
                    debug!(%handle, error = %e, "status query failed, will retry");
                }
                Err(e) => return PollOutcome::InvocationFailed(e.to_string()),
            }

            let now = Instant::now();
            if now >= deadline {
                return PollOutcome::TimedOut(timeout);
            }
            let delay = backoff.next_delay().min(deadline - now);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                reason = halted(abort) => return PollOutcome::Orphaned(reason),
            }
        }
    }

    /// Wait for `handle` and write the instance's terminal status.
    ///
    /// Returns the status written, or `None` if the record was no longer
    /// this run's to update.
    pub async fn track(
        &self,
        record: &InstanceRecord,
        handle: &InvocationHandle,
        abort: &mut watch::Receiver<Option<AbortReason>>,
    ) -> StateResult<Option<InstanceStatus>> {
        let verdict = match self.wait(handle, abort).await {
            PollOutcome::Completed(output) => {
                classify(&output, &self.expected_version, self.test_mode)
            }
            PollOutcome::InvocationFailed(reason) => Verdict::failed(reason, None),
            PollOutcome::TimedOut(after) => Verdict::failed(
                format!("timeout: no terminal status within {}s", after.as_secs()),
                None,
            ),
            PollOutcome::Orphaned(reason) => {
                Verdict::failed(format!("orphaned: {reason}"), None)
            }
        };

        match &verdict.error {
            Some(error) => warn!(
                instance = %record.instance_id,
                region = %record.region,
                %handle,
                %error,
                "instance failed"
            ),
            None => info!(
                instance = %record.instance_id,
                region = %record.region,
                %handle,
                status = %verdict.status,
                "instance finished"
            ),
        }

        let written = self.transitions.finish(
            record,
            verdict.status,
            verdict.error,
            verdict.version,
        )?;
        Ok(written.map(|r| r.status))
    }
}
