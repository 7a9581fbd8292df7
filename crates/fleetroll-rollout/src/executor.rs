//! Remote command execution seam.
//!
//! [`CommandExecutor`] is the boundary to whatever actually runs the
//! install script on an instance. The orchestrator only ever submits an
//! invocation and later asks for its status; retries, transport and
//! credentials are the executor's business.

use std::collections::HashMap;
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use fleetroll_core::{CommandConfig, ExecutorConfig};
use fleetroll_state::InstanceRecord;

/// Opaque handle of one remote invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationHandle(pub String);

impl std::fmt::Display for InvocationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Instance the command is sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTarget {
    pub instance_id: String,
    pub region: String,
    pub account: String,
}

impl From<&InstanceRecord> for CommandTarget {
    fn from(record: &InstanceRecord) -> Self {
        Self {
            instance_id: record.instance_id.clone(),
            region: record.region.clone(),
            account: record.account.clone(),
        }
    }
}

/// What to run on every instance of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub script_url: String,
    pub installer_url: Option<String>,
    pub expected_version: String,
    /// Run the script in test mode: no install, just a reachability check.
    pub test_mode: bool,
}

impl CommandSpec {
    pub fn from_config(config: &CommandConfig, dry_run: bool) -> Self {
        Self {
            script_url: config.script_url.clone(),
            installer_url: config.installer_url.clone(),
            expected_version: config.expected_version.clone(),
            test_mode: dry_run,
        }
    }

    pub fn mode(&self) -> &'static str {
        if self.test_mode { "test" } else { "install" }
    }
}

/// Result of a status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationStatus {
    /// Still running.
    Pending,
    /// Finished; carries the command output.
    Success(String),
    /// Finished unsuccessfully.
    Failure(String),
}

/// Submission failures. Each becomes a `Failed` instance, never a run error.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("instance unreachable: {0}")]
    Unreachable(String),

    #[error("throttled by command service: {0}")]
    Throttled(String),

    #[error("command rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("unknown invocation {0}")]
    UnknownInvocation(String),

    /// Worth asking again later.
    #[error("status query failed: {0}")]
    Transient(String),
}

/// Submits commands to instances and reports on them.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn submit(
        &self,
        target: &CommandTarget,
        spec: &CommandSpec,
    ) -> Result<InvocationHandle, DispatchError>;

    async fn status(&self, handle: &InvocationHandle) -> Result<InvocationStatus, StatusError>;
}

// ── Process executor ──────────────────────────────────────────────

/// Runs a local program per instance, e.g. a wrapper around the cloud
/// provider's remote-command CLI.
///
/// Arguments and environment values may contain placeholders:
/// `{instance_id}`, `{region}`, `{account}`, `{script_url}`,
/// `{installer_url}`, `{version}` and `{mode}`. A zero exit status is a
/// success whose stdout is the health report; anything else is a failure.
/// A terminal status is returned once, after which the handle is forgotten.
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    next_id: AtomicU64,
    invocations: Arc<Mutex<HashMap<String, JoinHandle<std::io::Result<Output>>>>>,
}

impl ProcessExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            next_id: AtomicU64::new(1),
            invocations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn handle_for(&self, target: &CommandTarget) -> InvocationHandle {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        InvocationHandle(format!("proc-{n}-{}", target.instance_id))
    }
}

/// Substitute placeholders in one argument.
pub fn render_template(template: &str, target: &CommandTarget, spec: &CommandSpec) -> String {
    template
        .replace("{instance_id}", &target.instance_id)
        .replace("{region}", &target.region)
        .replace("{account}", &target.account)
        .replace("{script_url}", &spec.script_url)
        .replace("{installer_url}", spec.installer_url.as_deref().unwrap_or(""))
        .replace("{version}", &spec.expected_version)
        .replace("{mode}", spec.mode())
}

fn status_from_output(output: Output) -> InvocationStatus {
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return InvocationStatus::Success(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let detail = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("")
        .trim()
        .to_string();
    match output.status.code() {
        Some(code) => InvocationStatus::Failure(format!("command exited with {code}: {detail}")),
        None => InvocationStatus::Failure(format!("command killed by signal: {detail}")),
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn submit(
        &self,
        target: &CommandTarget,
        spec: &CommandSpec,
    ) -> Result<InvocationHandle, DispatchError> {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| render_template(a, target, spec))
            .collect();
        let env: Vec<(String, String)> = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), render_template(v, target, spec)))
            .collect();

        let child = tokio::process::Command::new(&self.program)
            .args(&args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DispatchError::Rejected(format!("cannot start {}: {e}", self.program))
            })?;

        let handle = self.handle_for(target);
        debug!(
            instance = %target.instance_id,
            %handle,
            program = %self.program,
            "command started"
        );

        let task = tokio::spawn(child.wait_with_output());
        self.invocations.lock().await.insert(handle.0.clone(), task);
        Ok(handle)
    }

    async fn status(&self, handle: &InvocationHandle) -> Result<InvocationStatus, StatusError> {
        let mut invocations = self.invocations.lock().await;
        let task = invocations
            .remove(&handle.0)
            .ok_or_else(|| StatusError::UnknownInvocation(handle.0.clone()))?;

        if !task.is_finished() {
            invocations.insert(handle.0.clone(), task);
            return Ok(InvocationStatus::Pending);
        }
        drop(invocations);

        let status = match task.await {
            Ok(Ok(output)) => status_from_output(output),
            Ok(Err(e)) => InvocationStatus::Failure(format!("command I/O error: {e}")),
            Err(e) => {
                warn!(%handle, error = %e, "command task did not complete");
                InvocationStatus::Failure(format!("command task failed: {e}"))
            }
        };
        Ok(status)
    }
}
