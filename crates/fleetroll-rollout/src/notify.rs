//! End-of-run notifications.
//!
//! Notification is best-effort: a failed or slow notifier is logged and
//! never changes the run's outcome.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use fleetroll_state::RunOutcome;

use crate::reporter::Summary;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, outcome: RunOutcome, summary: &Summary) -> anyhow::Result<()>;
}

/// One-line human summary of a run.
pub fn render_message(outcome: RunOutcome, summary: &Summary) -> String {
    let totals = &summary.totals;
    let run = summary.run_id.as_deref().unwrap_or("fleet");
    let marker = if outcome == RunOutcome::Completed && totals.failed == 0 {
        "✅"
    } else {
        "❌"
    };
    format!(
        "{marker} Agent rollout {run} {outcome:?}: {} selected, {} succeeded, {} failed, \
         {} skipped, {} still dispatched",
        totals.total(),
        totals.succeeded,
        totals.failed,
        totals.skipped,
        totals.dispatched,
    )
}

/// Writes the summary to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, outcome: RunOutcome, summary: &Summary) -> anyhow::Result<()> {
        info!(
            run_id = summary.run_id.as_deref().unwrap_or(""),
            outcome = ?outcome,
            succeeded = summary.totals.succeeded,
            failed = summary.totals.failed,
            skipped = summary.totals.skipped,
            "rollout summary"
        );
        Ok(())
    }
}

/// Posts `{"text": ...}` to a chat webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(NOTIFY_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, outcome: RunOutcome, summary: &Summary) -> anyhow::Result<()> {
        let body = serde_json::json!({ "text": render_message(outcome, summary) });
        self.client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Run a notifier, logging instead of failing.
pub async fn notify_best_effort(notifier: &dyn Notifier, outcome: RunOutcome, summary: &Summary) {
    match tokio::time::timeout(NOTIFY_TIMEOUT, notifier.notify(outcome, summary)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "notification failed"),
        Err(_) => warn!(timeout_secs = NOTIFY_TIMEOUT.as_secs(), "notification timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::StatusCounts;

    fn summary(failed: u32) -> Summary {
        Summary {
            run_id: Some("run-1".to_string()),
            generated_at: 0,
            regions: Vec::new(),
            totals: StatusCounts {
                succeeded: 5,
                failed,
                ..Default::default()
            },
        }
    }

    #[test]
    fn message_reflects_outcome() {
        let clean = render_message(RunOutcome::Completed, &summary(0));
        assert!(clean.starts_with("✅"));
        assert!(clean.contains("run-1"));
        assert!(clean.contains("5 succeeded"));

        assert!(render_message(RunOutcome::Completed, &summary(2)).starts_with("❌"));
        assert!(render_message(RunOutcome::Aborted, &summary(0)).starts_with("❌"));
    }

    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        async fn notify(&self, _outcome: RunOutcome, _summary: &Summary) -> anyhow::Result<()> {
            anyhow::bail!("webhook down")
        }
    }

    #[tokio::test]
    async fn failures_are_swallowed() {
        notify_best_effort(&Failing, RunOutcome::Completed, &summary(0)).await;
        notify_best_effort(&LogNotifier, RunOutcome::Completed, &summary(0)).await;
    }
}
