//! apisync - API to PostgreSQL synchronisation tool

use anyhow::{Context, Result};
use apisync_common::logging::{init_logging, LogConfig, LogLevel};
use apisync_ingest::orchestrator::{Orchestrator, RunReport};
use apisync_ingest::pipeline::RunKind;
use apisync_ingest::settings::{Settings, DEFAULT_CONFIG_PATH};
use apisync_ingest::targets::load_targets;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "apisync")]
#[command(author, version, about = "Sync remote API data into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Settings file
    #[arg(short, long, global = true, env = "APISYNC_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Only sync this source
    #[arg(short, long, global = true)]
    source: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reload every target completely
    Full,

    /// Sync records changed in the last few days
    Incremental {
        /// Days to look back (0 = since midnight today)
        #[arg(short, long, default_value_t = 0)]
        days: u32,
    },

    /// Sync on a schedule and back up outside the active window
    Watch {
        /// Days to look back on each sync
        #[arg(short, long)]
        days: Option<u32>,

        /// Minutes between syncs
        #[arg(short, long)]
        interval_mins: Option<u64>,
    },

    /// Refresh snapshot tables
    Backup,

    /// Validate settings and target documents without syncing
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("apisync")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env()?;
    let _guard = init_logging(&log_config)?;

    let mut settings = Settings::load(&cli.config)?;
    if let Some(source) = &cli.source {
        settings.select_source(source)?;
    }

    match cli.command {
        Command::Check => check(&settings)?,
        Command::Full => {
            let orchestrator = Orchestrator::from_settings(&settings).await?;
            summarize(&orchestrator.run(RunKind::Full).await);
        }
        Command::Incremental { days } => {
            let orchestrator = Orchestrator::from_settings(&settings).await?;
            summarize(&orchestrator.run(RunKind::Incremental { days }).await);
        }
        Command::Watch {
            days,
            interval_mins,
        } => {
            if let Some(days) = days {
                settings.schedule.days = days;
            }
            if let Some(interval_mins) = interval_mins {
                settings.schedule.interval_mins = interval_mins;
            }
            settings.schedule.validate()?;

            let orchestrator = Orchestrator::from_settings(&settings).await?;
            orchestrator.watch(&settings.schedule).await;
        }
        Command::Backup => {
            let orchestrator = Orchestrator::from_settings(&settings).await?;
            let report = orchestrator.backup().await;
            if report.failures() > 0 {
                anyhow::bail!("{} snapshot(s) failed", report.failures());
            }
        }
    }

    Ok(())
}

fn check(settings: &Settings) -> Result<()> {
    for source in &settings.sources {
        let targets = load_targets(&source.targets)
            .with_context(|| format!("Invalid targets for source '{}'", source.name))?;
        info!(
            source = %source.name,
            targets = targets.len(),
            document = %source.targets.display(),
            "Targets valid"
        );
    }
    info!("Configuration is valid");
    Ok(())
}

fn summarize(report: &RunReport) {
    for outcome in &report.targets {
        match &outcome.result {
            Ok(target) => info!(
                source = %outcome.source,
                endpoint = %outcome.endpoint,
                fetched = target.fetched,
                committed = target.committed_rows(),
                skipped_batches = target.skipped_batches(),
                "Target summary"
            ),
            Err(e) => warn!(source = %outcome.source, endpoint = %outcome.endpoint, error = %e, "Target failed"),
        }
    }
}
