//! fleetroll: staged agent rollouts across a multi-region fleet.
//!
//! # Usage
//!
//! ```text
//! fleetroll import inventory.json
//! fleetroll run --region eu-west-1 --percent 10
//! fleetroll report --run run-1760868900000-3f9c2a1b --format json
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::error;

use fleetroll_core::ConfigError;
use fleetroll_rollout::{InventoryError, RolloutError};

mod commands;

use commands::OutputFormat;

/// Exit status for a run with failed instances or a run-fatal error.
const EXIT_FAILURE: u8 = 1;
/// Another run holds the lease.
const EXIT_LOCK_HELD: u8 = 2;
/// Bad configuration or command line.
const EXIT_USAGE: u8 = 3;

#[derive(Parser)]
#[command(
    name = "fleetroll",
    about = "Fleet agent rollout orchestrator",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to the config file.
    #[arg(short, long, global = true, default_value = "/etc/fleetroll/fleetroll.toml")]
    config: PathBuf,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Roll the agent out to the next batch of instances.
    Run {
        /// Only target these regions (repeatable).
        #[arg(long)]
        region: Vec<String>,
        /// Only target these accounts (repeatable).
        #[arg(long)]
        account: Vec<String>,
        /// Number of instances across all selected regions.
        #[arg(long, conflicts_with = "percent", required_unless_present = "percent")]
        count: Option<u32>,
        /// Percentage of eligible instances.
        #[arg(long)]
        percent: Option<u32>,
        /// Run the install script in test mode; nothing is installed.
        #[arg(long)]
        dry_run: bool,
        /// Also target instances that already succeeded.
        #[arg(long)]
        redeploy: bool,
        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
        /// Also write the run report as JSON to this file.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Summarise a run, or the whole fleet when no run is given.
    Report {
        /// Run id to report on.
        #[arg(long)]
        run: Option<String>,
        /// Restrict a fleet report to these regions.
        #[arg(long)]
        region: Vec<String>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
        /// Write the report to this file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List recent runs.
    Runs {
        /// Show at most this many runs, newest first.
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Load the instance inventory (JSON).
    Import {
        /// Inventory file.
        path: PathBuf,
    },
    /// List failed instances with their last error.
    Failed {
        #[arg(long)]
        region: Vec<String>,
    },
    /// List instances the command service cannot reach.
    Unmanaged {
        #[arg(long)]
        region: Vec<String>,
    },
    /// Fail instances left `dispatched` by a run that died.
    Reconcile,
    /// Inspect or clear the rollout lease.
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
}

#[derive(Subcommand)]
enum LockAction {
    /// Show the current holder.
    Status,
    /// Remove the lease regardless of holder.
    Release {
        /// Required: confirms the lease should be broken.
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetroll=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let usage_error = e.use_stderr();
            let _ = e.print();
            return if usage_error {
                ExitCode::from(EXIT_USAGE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    init_tracing(cli.log_format);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "command failed");
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    let config_path = cli.config;
    match cli.command {
        Commands::Run {
            region,
            account,
            count,
            percent,
            dry_run,
            redeploy,
            yes,
            output,
        } => {
            let args = commands::run::RunArgs {
                regions: region,
                accounts: account,
                count,
                percent,
                dry_run,
                redeploy,
                yes,
                output,
            };
            commands::run::run(&config_path, args).await
        }
        Commands::Report {
            run,
            region,
            format,
            output,
        } => commands::report::report(
            &config_path,
            run.as_deref(),
            &region,
            format,
            output.as_deref(),
        ),
        Commands::Runs { limit } => commands::report::runs(&config_path, limit),
        Commands::Import { path } => commands::inventory::import(&config_path, &path),
        Commands::Failed { region } => commands::inventory::list(
            &config_path,
            fleetroll_state::InstanceStatus::Failed,
            &region,
        ),
        Commands::Unmanaged { region } => commands::inventory::list(
            &config_path,
            fleetroll_state::InstanceStatus::Unmanaged,
            &region,
        ),
        Commands::Reconcile => commands::lock::reconcile(&config_path),
        Commands::Lock { action } => match action {
            LockAction::Status => commands::lock::status(&config_path),
            LockAction::Release { force } => commands::lock::release(&config_path, force),
        },
    }
}

/// Map an error to the process exit status.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<RolloutError>() {
        return match e {
            RolloutError::LockContention { .. } => EXIT_LOCK_HELD,
            RolloutError::Config(_) | RolloutError::InvalidPolicy(_) => EXIT_USAGE,
            _ => EXIT_FAILURE,
        };
    }
    if let Some(fleetroll_state::LockError::AlreadyHeld { .. }) =
        err.downcast_ref::<fleetroll_state::LockError>()
    {
        return EXIT_LOCK_HELD;
    }
    if err.downcast_ref::<ConfigError>().is_some()
        || err.downcast_ref::<InventoryError>().is_some()
    {
        return EXIT_USAGE;
    }
    EXIT_FAILURE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn run_requires_a_size() {
        assert!(Cli::try_parse_from(["fleetroll", "run"]).is_err());
        let both = ["fleetroll", "run", "--count", "5", "--percent", "10"];
        assert!(Cli::try_parse_from(both).is_err());
        let percent = ["fleetroll", "run", "--percent", "10", "--region", "r1"];
        assert!(Cli::try_parse_from(percent).is_ok());
    }

    #[test]
    fn exit_codes() {
        let held = anyhow::Error::new(RolloutError::LockContention {
            name: "rollout".to_string(),
            holder: "run-1".to_string(),
            expires_at: 0,
        });
        assert_eq!(exit_code_for(&held), EXIT_LOCK_HELD);

        let config = anyhow::Error::new(ConfigError::Invalid("bad".to_string()));
        assert_eq!(exit_code_for(&config), EXIT_USAGE);

        let policy = anyhow::Error::new(RolloutError::InvalidPolicy(
            "count must be at least 1".to_string(),
        ));
        assert_eq!(exit_code_for(&policy), EXIT_USAGE);

        let inventory = anyhow::Error::new(InventoryError::Io {
            path: PathBuf::from("missing.json"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
        assert_eq!(exit_code_for(&inventory), EXIT_USAGE);

        assert_eq!(exit_code_for(&anyhow::anyhow!("boom")), EXIT_FAILURE);
    }
}
