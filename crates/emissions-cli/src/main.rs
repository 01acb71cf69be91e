use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use emissions_core::format_month;
use emissions_storage::{ItemDetailsTable, TableError};
use emissions_sync::{
    SyncConfig, SyncPipeline, DEFAULT_LAKEHOUSE_DIR, DEFAULT_REPORTS_DIR, LAKEHOUSE_DIR_ENV,
    REPORTS_DIR_ENV,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "emissions-cli")]
#[command(about = "Incremental carbon emissions ingest")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest every missing partition of the current report window.
    Sync,
    /// Show the report window and the partitions a sync would fetch.
    Plan,
    /// List ingested partitions with their row counts.
    Partitions {
        #[arg(long, env = LAKEHOUSE_DIR_ENV, default_value = DEFAULT_LAKEHOUSE_DIR)]
        lakehouse_dir: PathBuf,
    },
    /// Summarize recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
        #[arg(long, env = REPORTS_DIR_ENV, default_value = DEFAULT_REPORTS_DIR)]
        reports_dir: PathBuf,
    },
    /// Run syncs on the configured cron schedule until Ctrl-C.
    Schedule,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = emissions_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} missing={} appended={} empty={} http_errors={} failed={} rows={} reports={}",
                summary.run_id,
                summary.gap_partitions,
                summary.appended,
                summary.empty,
                summary.http_errors,
                summary.failed,
                summary.rows_appended,
                summary.reports_dir.as_deref().unwrap_or("-")
            );
        }
        Commands::Plan => {
            let pipeline = SyncPipeline::new(SyncConfig::from_env()?)?;
            let plan = pipeline.plan(Utc::now().date_naive())?;
            let months = plan.months.iter().map(|m| format_month(*m)).collect::<Vec<_>>();
            println!("window: {}", months.join(", "));
            println!(
                "partitions: {} planned, {} stored, {} missing",
                plan.targets.len(),
                plan.targets.len() - plan.gaps.len(),
                plan.gaps.len()
            );
            for key in &plan.gaps {
                println!("missing {key}");
            }
        }
        Commands::Partitions { lakehouse_dir } => {
            let table = ItemDetailsTable::open(&lakehouse_dir);
            match table.partition_row_counts() {
                Ok(counts) => {
                    for ((month, scope), rows) in counts {
                        println!("{} {scope} rows={rows}", format_month(month));
                    }
                }
                Err(TableError::NotFound(path)) => {
                    println!("no table at {}", path.display());
                }
                Err(err) => return Err(err).context("listing partitions"),
            }
        }
        Commands::Report { runs, reports_dir } => {
            println!("{}", emissions_sync::report_recent_markdown(runs, &reports_dir)?);
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env()?;
            config.scheduler_enabled = true;
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
    }

    Ok(())
}
