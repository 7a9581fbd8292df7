//! fleetroll rollout engine.
//!
//! Takes a batch of instances from the state store, sends each the agent
//! install command, waits for the outcome and writes it back, all under a
//! single-run lease.
//!
//! # Components
//!
//! - **`selector`**: deterministic, region-proportional batch selection
//! - **`executor`**: the remote-command seam ([`CommandExecutor`]) and a process-backed executor
//! - **`dispatcher`**: claims an instance (`Dispatched`) and submits the command
//! - **`poller`**: backoff polling, health report classification, terminal writes
//! - **`inventory`**: inventory import (managed vs unmanaged instances)
//! - **`reporter`**: per-region summaries of a run or of the fleet
//! - **`notify`**: best-effort end-of-run notification
//! - **`reconcile`**: fails `Dispatched` records abandoned by a dead run
//! - **`driver`**: the [`Orchestrator`] state machine tying it together

pub mod abort;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod executor;
pub mod inventory;
pub mod notify;
pub mod poller;
pub mod reconcile;
pub mod reporter;
pub mod selector;
pub mod transition;

pub use abort::{AbortHandle, AbortReason};
pub use dispatcher::{Dispatch, Dispatcher};
pub use driver::{DriverPhase, Orchestrator, RolloutSettings, RunReport, RunRequest};
pub use error::{InventoryError, RolloutError, RolloutResult};
pub use executor::{
    CommandExecutor, CommandSpec, CommandTarget, DispatchError, InvocationHandle,
    InvocationStatus, ProcessExecutor, StatusError,
};
pub use inventory::{import, ImportStats, Inventory, InventoryEntry};
pub use notify::{LogNotifier, Notifier, WebhookNotifier};
pub use poller::{classify, Backoff, HealthReport, PollSettings, Poller};
pub use reporter::{format_table, Reporter, StatusCounts, Summary};
pub use selector::{select_batch, Selection};
