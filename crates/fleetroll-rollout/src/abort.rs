//! Run-wide abort signal.
//!
//! A `watch` channel carries the most severe abort reason seen so far.
//! Instance tasks subscribe to it: any reason stops new dispatches, and
//! [`AbortReason::LockLost`] additionally stops in-flight polling.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// Operator asked to stop (Ctrl-C). In-flight invocations are still awaited.
    Operator,
    /// Lease renewal failed; this process may no longer act for the run.
    LockLost,
    /// The state store stopped accepting writes.
    StoreFailure,
}

impl AbortReason {
    fn severity(self) -> u8 {
        match self {
            AbortReason::Operator => 1,
            AbortReason::LockLost => 2,
            AbortReason::StoreFailure => 3,
        }
    }

    /// Whether in-flight polls must stop as well.
    pub fn halts_polling(self) -> bool {
        self != AbortReason::Operator
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AbortReason::Operator => "operator abort",
            AbortReason::LockLost => "lease lost",
            AbortReason::StoreFailure => "store failure",
        }
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cloneable sender side of the abort signal.
#[derive(Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<Option<AbortReason>>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Operator-initiated abort.
    pub fn abort(&self) {
        self.signal(AbortReason::Operator);
    }

    /// Raise the abort reason; a less severe reason never replaces a worse one.
    pub fn signal(&self, reason: AbortReason) {
        self.tx.send_if_modified(|current| match current {
            Some(existing) if existing.severity() >= reason.severity() => false,
            _ => {
                *current = Some(reason);
                true
            }
        });
    }

    pub fn current(&self) -> Option<AbortReason> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<AbortReason>> {
        self.tx.subscribe()
    }

    pub(crate) fn reset(&self) {
        self.tx.send_replace(None);
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve once any abort reason is set.
pub(crate) async fn aborted(rx: &mut watch::Receiver<Option<AbortReason>>) -> AbortReason {
    loop {
        let current = *rx.borrow_and_update();
        if let Some(reason) = current {
            return reason;
        }
        if rx.changed().await.is_err() {
            // Sender gone: no abort can arrive any more.
            std::future::pending::<()>().await;
        }
    }
}

/// Resolve once an abort that halts polling is set.
pub(crate) async fn halted(rx: &mut watch::Receiver<Option<AbortReason>>) -> AbortReason {
    loop {
        let current = *rx.borrow_and_update();
        if let Some(reason) = current {
            if reason.halts_polling() {
                return reason;
            }
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
