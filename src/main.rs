//! # Munin CLI (`munin`)
//!
//! The `munin` binary runs the log intake pipeline and the maintenance
//! commands around it.
//!
//! ## Usage
//!
//! ```bash
//! munin --config ./config/munin.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `munin init` | Create the directories and the store, run migrations |
//! | `munin run` | Watch the incoming directory until Ctrl-C |
//! | `munin purge` | Purge quarantine and enforce the storage quota once |
//! | `munin stats` | Print manifest, queue, store, and quarantine figures |
//!
//! Logging goes to stderr and is filtered with `RUST_LOG`
//! (default `munin_ingest=info,munin=info`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use munin_ingest::config::{self, Config};
use munin_ingest::db::Store;
use munin_ingest::migrate::run_migrations;
use munin_ingest::quarantine::QuarantineManager;
use munin_ingest::quota::QuotaEnforcer;
use munin_ingest::stats::{self, format_bytes};
use munin_ingest::watcher::run_pipeline;

/// Munin: watches a drop directory for log files, parses them into
/// normalized events, and delivers the events to a sink.
#[derive(Parser)]
#[command(
    name = "munin",
    about = "Munin: log file intake and delivery",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Relative paths inside the file resolve against its directory.
    /// `MUNIN_*` environment variables override file values.
    #[arg(long, global = true, default_value = "./config/munin.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the watch, processing, and quarantine directories and the
    /// store schema. Idempotent.
    Init,

    /// Run the pipeline until interrupted.
    ///
    /// Recovers files left in processing, ingests anything already waiting
    /// in the watch directory, then follows new arrivals.
    Run,

    /// Purge expired or excess quarantine files and enforce the store quota.
    Purge,

    /// Show pipeline statistics.
    Stats,
}

/// Initialise the tracing / logging subsystem.
fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "munin_ingest=info,munin=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => run_init(&cfg).await?,
        Commands::Run => {
            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received");
                    let _ = tx.send(true);
                }
            });
            run_pipeline(cfg, rx).await?;
        }
        Commands::Purge => run_purge(&cfg).await?,
        Commands::Stats => stats::run_stats(&cfg).await?,
    }

    Ok(())
}

async fn run_init(cfg: &Config) -> Result<()> {
    for dir in [
        &cfg.paths.watch_dir,
        &cfg.paths.processing_dir,
        &cfg.paths.quarantine_dir,
    ] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }
    let store = Store::connect(cfg).await?;
    run_migrations(&store).await?;
    store.close().await?;

    println!("Store initialized: {}", cfg.db.path.display());
    println!("Watching:          {}", cfg.paths.watch_dir.display());
    Ok(())
}

async fn run_purge(cfg: &Config) -> Result<()> {
    let store = Store::connect(cfg).await?;
    run_migrations(&store).await?;

    let quarantine =
        QuarantineManager::new(&cfg.paths.quarantine_dir, store.clone(), &cfg.quarantine);
    let purged = quarantine.purge().await?;
    println!(
        "Quarantine: {} expired, {} evicted, {} freed",
        purged.expired,
        purged.evicted,
        format_bytes(purged.bytes_freed)
    );

    let quota = QuotaEnforcer::new(store.clone(), &cfg.quota).enforce().await?;
    println!(
        "Store:      {} -> {} ({} events deleted){}",
        format_bytes(quota.size_before),
        format_bytes(quota.size_after),
        quota.rows_deleted,
        if quota.under_control {
            ""
        } else {
            ", still above high watermark"
        }
    );

    drop(quarantine);
    store.close().await?;
    Ok(())
}
