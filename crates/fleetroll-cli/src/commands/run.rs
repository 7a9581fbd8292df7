use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{info, warn};

use fleetroll_core::ConfigError;
use fleetroll_rollout::driver::ConfirmFn;
use fleetroll_rollout::{
    format_table, LogNotifier, Notifier, Orchestrator, ProcessExecutor, RolloutSettings,
    RunRequest, Selection, WebhookNotifier,
};
use fleetroll_state::{RolloutSize, TargetPolicy};

use super::{load_config, open_store};

pub struct RunArgs {
    pub regions: Vec<String>,
    pub accounts: Vec<String>,
    pub count: Option<u32>,
    pub percent: Option<u32>,
    pub dry_run: bool,
    pub redeploy: bool,
    pub yes: bool,
    pub output: Option<PathBuf>,
}

impl RunArgs {
    fn policy(&self) -> Result<TargetPolicy, ConfigError> {
        let size = match (self.count, self.percent) {
            (Some(n), None) => RolloutSize::Count(n),
            (None, Some(p)) => RolloutSize::Percent(p),
            _ => {
                return Err(ConfigError::Invalid(
                    "exactly one of --count or --percent is required".to_string(),
                ));
            }
        };
        Ok(TargetPolicy {
            size,
            regions: self.regions.clone(),
            accounts: self.accounts.clone(),
            redeploy: self.redeploy,
        })
    }
}

pub async fn run(config_path: &Path, args: RunArgs) -> anyhow::Result<ExitCode> {
    let config = load_config(config_path)?;
    let policy = args.policy()?;
    let executor_config = config.executor.as_ref().ok_or_else(|| {
        ConfigError::Invalid("an [executor] section is required to run a rollout".to_string())
    })?;

    let store = open_store(&config)?;
    let settings = RolloutSettings::from_config(&config)?;
    let executor = Arc::new(ProcessExecutor::new(executor_config));

    let webhook = config.notify.as_ref().and_then(|n| n.webhook_url.as_deref());
    let notifier: Arc<dyn Notifier> = match webhook {
        Some(url) => Arc::new(WebhookNotifier::new(url)?),
        None => Arc::new(LogNotifier),
    };

    let mut orchestrator = Orchestrator::new(store, executor, settings).with_notifier(notifier);
    if !args.yes {
        orchestrator = orchestrator.with_confirmation(prompt(args.dry_run));
    }

    let abort = orchestrator.abort_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight instances");
            abort.abort();
        }
    });

    let result = orchestrator
        .run(RunRequest {
            policy,
            dry_run: args.dry_run,
        })
        .await;
    ctrl_c.abort();
    let report = result?;

    print!("{}", format_table(&report.summary));
    if report.run.shortfall > 0 {
        println!(
            "\nNote: {} fewer instances than requested were eligible.",
            report.run.shortfall
        );
    }
    println!("Outcome: {:?}", report.run.outcome);

    if let Some(path) = &args.output {
        std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
        info!(path = %path.display(), "run report saved");
    }

    Ok(if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(crate::EXIT_FAILURE)
    })
}

/// Show the batch per region and ask before dispatching.
fn prompt(dry_run: bool) -> ConfirmFn {
    Arc::new(move |selection: &Selection| {
        println!("{}", describe(selection, dry_run));
        print!("Proceed? [y/N] ");
        let _ = std::io::stdout().flush();

        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    })
}

fn describe(selection: &Selection, dry_run: bool) -> String {
    let mode = if dry_run { "test-mode" } else { "install" };
    let mut lines = vec![format!(
        "About to {mode} {} of {} eligible instances:",
        selection.len(),
        selection.eligible
    )];
    for (region, quota) in &selection.quotas {
        if quota.selected > 0 {
            lines.push(format!("  {region}: {} of {}", quota.selected, quota.eligible));
        }
    }
    if selection.shortfall > 0 {
        lines.push(format!(
            "  ({} fewer than the {} requested)",
            selection.shortfall, selection.requested
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetroll_rollout::select_batch;
    use fleetroll_state::{InstanceRecord, InstanceStatus};

    fn args(count: Option<u32>, percent: Option<u32>) -> RunArgs {
        RunArgs {
            regions: vec!["r1".to_string()],
            accounts: Vec::new(),
            count,
            percent,
            dry_run: false,
            redeploy: true,
            yes: true,
            output: None,
        }
    }

    #[test]
    fn policy_from_args() {
        let policy = args(None, Some(25)).policy().unwrap();
        assert_eq!(policy.size, RolloutSize::Percent(25));
        assert_eq!(policy.regions, vec!["r1"]);
        assert!(policy.redeploy);

        assert!(args(None, None).policy().is_err());
        assert!(args(Some(1), Some(1)).policy().is_err());
    }

    #[test]
    fn describe_lists_regions_with_work() {
        let records = vec![
            InstanceRecord::new("i-1", "r1", "prod", InstanceStatus::Pending),
            InstanceRecord::new("i-2", "r1", "prod", InstanceStatus::Pending),
            InstanceRecord::new("i-3", "r2", "prod", InstanceStatus::Pending),
        ];
        let selection = select_batch(&records, &TargetPolicy::new(RolloutSize::Count(5))).unwrap();
        let text = describe(&selection, true);
        assert!(text.contains("test-mode 3 of 3"));
        assert!(text.contains("r1: 2 of 2"));
        assert!(text.contains("2 fewer than the 5 requested"));
    }
}
