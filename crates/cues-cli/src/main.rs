use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use cues_sync::{run_sync, SyncConfig};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cues")]
#[command(about = "Seoul cultural events sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the configured index span from the open API and reconcile it
    /// into the store.
    Sync(SyncArgs),
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// First 1-based record index to sync.
    #[arg(long)]
    start_index: Option<u32>,
    /// Last record index to sync, inclusive.
    #[arg(long)]
    end_index: Option<u32>,
    /// Records per source request (the source caps this at 1000).
    #[arg(long)]
    page_width: Option<u32>,
    /// Archive raw page bodies under this directory.
    #[arg(long)]
    artifacts_dir: Option<PathBuf>,
    /// Reconcile into an in-memory store instead of the database.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let Commands::Sync(args) = cli.command.unwrap_or(Commands::Sync(SyncArgs::default()));

    let mut config = SyncConfig::from_env();
    if let Some(v) = args.start_index {
        config.start_index = v;
    }
    if let Some(v) = args.end_index {
        config.end_index = v;
    }
    if let Some(v) = args.page_width {
        config.page_width = v;
    }
    if let Some(dir) = args.artifacts_dir {
        config.artifacts_dir = Some(dir);
    }

    let summary = run_sync(config, args.dry_run).await?;
    println!(
        "sync complete: run_id={} processed={} inserted={} updated={} failed={} batches={}/{}",
        summary.run_id,
        summary.processed,
        summary.inserted,
        summary.updated,
        summary.failed_records,
        summary.batches_committed,
        summary.batches_planned
    );

    Ok(())
}
