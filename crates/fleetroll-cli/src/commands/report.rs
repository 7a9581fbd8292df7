use std::path::Path;
use std::process::ExitCode;

use fleetroll_rollout::{format_table, Reporter};
use fleetroll_state::{InstanceFilter, RolloutRun};

use super::{emit, load_config, open_store, OutputFormat};

pub fn report(
    config_path: &Path,
    run_id: Option<&str>,
    regions: &[String],
    format: OutputFormat,
    output: Option<&Path>,
) -> anyhow::Result<ExitCode> {
    let config = load_config(config_path)?;
    let reporter = Reporter::new(open_store(&config)?);

    let summary = match run_id {
        Some(run_id) => reporter.report_run(run_id)?,
        None => {
            let filter = InstanceFilter {
                regions: regions.to_vec(),
                ..InstanceFilter::default()
            };
            reporter.report_fleet(&filter)?
        }
    };

    let content = match format {
        OutputFormat::Json => format!("{}\n", summary.to_json()?),
        OutputFormat::Text => format_table(&summary),
    };
    emit(&content, output)?;
    Ok(ExitCode::SUCCESS)
}

pub fn runs(config_path: &Path, limit: usize) -> anyhow::Result<ExitCode> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;

    let mut runs = store.list_runs()?;
    runs.reverse();
    runs.truncate(limit);

    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(ExitCode::SUCCESS);
    }
    for run in &runs {
        println!("{}", describe(run));
    }
    Ok(ExitCode::SUCCESS)
}

fn describe(run: &RolloutRun) -> String {
    let mode = if run.dry_run { " (dry run)" } else { "" };
    format!(
        "{}  {:<10} {:>4} selected  {}{}",
        run.run_id,
        format!("{:?}", run.outcome),
        run.selected_instances.len(),
        run.policy.size,
        mode
    )
}
