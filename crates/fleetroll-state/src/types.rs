//! Domain types for the fleetroll state store.
//!
//! These types represent the persisted state of instances, rollout runs and
//! the single-run lease. All types are serializable to/from JSON for storage
//! in redb tables.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Composite key of an instance record: `{region}/{instance_id}`.
pub type InstanceKey = String;

/// Unique identifier of a rollout run.
pub type RunId = String;

// ── Instance ──────────────────────────────────────────────────────

/// Rollout status of a single instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Known to the inventory but not reachable by the command service.
    Unmanaged,
    /// Reachable, never attempted.
    Pending,
    /// A run has an invocation outstanding against this instance.
    Dispatched,
    Succeeded,
    Failed,
    /// Selected but not installed (dry-run, abort, or unresolved conflict).
    Skipped,
}

impl InstanceStatus {
    pub const ALL: [InstanceStatus; 6] = [
        InstanceStatus::Unmanaged,
        InstanceStatus::Pending,
        InstanceStatus::Dispatched,
        InstanceStatus::Succeeded,
        InstanceStatus::Failed,
        InstanceStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Unmanaged => "unmanaged",
            InstanceStatus::Pending => "pending",
            InstanceStatus::Dispatched => "dispatched",
            InstanceStatus::Succeeded => "succeeded",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Skipped => "skipped",
        }
    }

    /// Terminal for the purposes of a single run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Succeeded | InstanceStatus::Failed | InstanceStatus::Skipped
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted rollout state of one compute instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub region: String,
    /// Production account that owns the instance.
    pub account: String,
    pub status: InstanceStatus,
    pub last_run_id: Option<RunId>,
    /// Populated only while `status` is `Failed`.
    pub last_error: Option<String>,
    /// Invocation handle of the most recent dispatch.
    #[serde(default)]
    pub invocation: Option<String>,
    /// Agent version reported by the last health check.
    #[serde(default)]
    pub reported_version: Option<String>,
    /// Unix timestamp (milliseconds) of the last status change.
    pub updated_at: u64,
}

impl InstanceRecord {
    /// A fresh record with no run history.
    pub fn new(instance_id: &str, region: &str, account: &str, status: InstanceStatus) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            region: region.to_string(),
            account: account.to_string(),
            status,
            last_run_id: None,
            last_error: None,
            invocation: None,
            reported_version: None,
            updated_at: epoch_millis(),
        }
    }

    /// Build the composite key for the instances table.
    pub fn table_key(&self) -> InstanceKey {
        instance_key(&self.region, &self.instance_id)
    }
}

/// Build an instance key from its parts.
pub fn instance_key(region: &str, instance_id: &str) -> InstanceKey {
    format!("{region}/{instance_id}")
}

/// Record filter for [`crate::StateStore::list_instances`].
///
/// Empty vectors match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFilter {
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub statuses: Vec<InstanceStatus>,
}

impl InstanceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn region(mut self, region: &str) -> Self {
        self.regions.push(region.to_string());
        self
    }

    pub fn account(mut self, account: &str) -> Self {
        self.accounts.push(account.to_string());
        self
    }

    pub fn status(mut self, status: InstanceStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn matches(&self, record: &InstanceRecord) -> bool {
        (self.regions.is_empty() || self.regions.iter().any(|r| *r == record.region))
            && (self.accounts.is_empty() || self.accounts.iter().any(|a| *a == record.account))
            && (self.statuses.is_empty() || self.statuses.contains(&record.status))
    }
}

// ── Rollout run ───────────────────────────────────────────────────

/// How many instances a run should target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RolloutSize {
    /// Absolute number of instances across all matching regions.
    Count(u32),
    /// Whole-number percentage of the eligible population.
    Percent(u32),
}

impl fmt::Display for RolloutSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RolloutSize::Count(n) => write!(f, "count={n}"),
            RolloutSize::Percent(p) => write!(f, "percent={p}"),
        }
    }
}

/// Target policy of a rollout run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetPolicy {
    pub size: RolloutSize,
    /// Restrict to these regions (empty = all).
    #[serde(default)]
    pub regions: Vec<String>,
    /// Restrict to these accounts (empty = all).
    #[serde(default)]
    pub accounts: Vec<String>,
    /// Include already-succeeded instances (e.g. after a version bump).
    #[serde(default)]
    pub redeploy: bool,
}

impl TargetPolicy {
    pub fn new(size: RolloutSize) -> Self {
        Self {
            size,
            regions: Vec::new(),
            accounts: Vec::new(),
            redeploy: false,
        }
    }

    pub fn filter(&self) -> InstanceFilter {
        InstanceFilter {
            regions: self.regions.clone(),
            accounts: self.accounts.clone(),
            statuses: Vec::new(),
        }
    }
}

/// Final disposition of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    InFlight,
    /// Every selected instance reached a terminal status.
    Completed,
    /// Stopped early by the operator.
    Aborted,
    /// Lease renewal failed mid-run.
    LockLost,
    /// A run-fatal store error.
    Failed,
}

/// One execution of the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutRun {
    pub run_id: RunId,
    pub policy: TargetPolicy,
    pub dry_run: bool,
    pub started_at: u64,
    pub ended_at: Option<u64>,
    pub lock_token: String,
    /// Instance keys in selection order.
    pub selected_instances: Vec<InstanceKey>,
    /// Requested minus selected, when the eligible pool was too small.
    pub shortfall: u32,
    pub outcome: RunOutcome,
}

impl RolloutRun {
    /// Generate a run id from the start timestamp plus a random suffix.
    pub fn generate_id(started_at: u64) -> RunId {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("run-{started_at}-{}", &suffix[..8])
    }

    pub fn is_in_flight(&self) -> bool {
        self.ended_at.is_none()
    }
}

// ── Lock ──────────────────────────────────────────────────────────

/// Persisted form of the single-run lease.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRecord {
    pub name: String,
    pub holder_run_id: RunId,
    pub token: String,
    /// Unix timestamp (milliseconds).
    pub acquired_at: u64,
    /// Unix timestamp (milliseconds). The lease is free once `now >= expires_at`.
    pub expires_at: u64,
}

impl LockRecord {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Current Unix time in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_all_by_default() {
        let record = InstanceRecord::new("i-1", "us-east-1", "prod-a", InstanceStatus::Pending);
        assert!(InstanceFilter::all().matches(&record));
    }

    #[test]
    fn filter_combines_dimensions() {
        let record = InstanceRecord::new("i-1", "us-east-1", "prod-a", InstanceStatus::Failed);
        let filter = InstanceFilter::all()
            .region("us-east-1")
            .status(InstanceStatus::Failed);
        assert!(filter.matches(&record));

        let wrong_account = filter.clone().account("prod-b");
        assert!(!wrong_account.matches(&record));

        let other_region = InstanceFilter::all().region("eu-west-1");
        assert!(!other_region.matches(&record));
    }

    #[test]
    fn run_ids_are_unique_and_timestamped() {
        let a = RolloutRun::generate_id(1_700_000_000_000);
        let b = RolloutRun::generate_id(1_700_000_000_000);
        assert!(a.starts_with("run-1700000000000-"));
        assert_ne!(a, b);
    }

    #[test]
    fn terminal_statuses() {
        assert!(InstanceStatus::Succeeded.is_terminal());
        assert!(InstanceStatus::Failed.is_terminal());
        assert!(InstanceStatus::Skipped.is_terminal());
        assert!(!InstanceStatus::Dispatched.is_terminal());
        assert!(!InstanceStatus::Pending.is_terminal());
    }

    #[test]
    fn lock_expiry_boundary() {
        let lock = LockRecord {
            name: "rollout".to_string(),
            holder_run_id: "run-1".to_string(),
            token: "t".to_string(),
            acquired_at: 0,
            expires_at: 1000,
        };
        assert!(!lock.is_expired(999));
        assert!(lock.is_expired(1000));
    }
}
