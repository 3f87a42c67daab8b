//! The long-running pipeline behind `munin run`.
//!
//! Start-up, in order:
//!
//! 1. create the incoming/processing/quarantine directories
//! 2. open and migrate the store
//! 3. purge quarantine
//! 4. re-run files left in the processing directory
//! 5. scan the incoming directory for files that arrived while stopped
//! 6. start the filesystem watch, the drain worker, and the periodic
//!    rescan/quota timers
//!
//! Failures in steps 1 and 2 are fatal. After that nothing stops the loop
//! except the shutdown signal: per-file errors are logged and intake moves
//! on.
//!
//! Notifications arrive on notify's own thread and are forwarded over a
//! channel to one task that runs intake sequentially, so at most one file
//! is processed at a time.

use anyhow::{Context, Result};
use notify::{EventKind, PollWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{Config, WatchMode};
use crate::db::Store;
use crate::intake::{Intake, IntakeOutcome};
use crate::migrate::run_migrations;
use crate::parsers::ParserRegistry;
use crate::queue::{spawn_drain_worker, RetryQueue};
use crate::sink::build_sink;

/// Everything `run_pipeline` wires together, exposed for tests and the CLI.
pub struct Pipeline {
    pub config: Arc<Config>,
    pub store: Store,
    pub queue: Arc<RetryQueue>,
    pub intake: Arc<Intake>,
}

impl Pipeline {
    /// Steps 1 and 2 of start-up plus component construction.
    pub async fn open(config: Config) -> Result<Self> {
        for dir in [
            &config.paths.watch_dir,
            &config.paths.processing_dir,
            &config.paths.quarantine_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }

        let store = Store::connect(&config).await?;
        run_migrations(&store).await?;

        let sink = build_sink(&config.sink, &store)?;
        let queue = Arc::new(RetryQueue::new(store.clone(), sink, &config.retry));
        let config = Arc::new(config);
        let intake = Arc::new(Intake::new(
            Arc::clone(&config),
            store.clone(),
            Arc::new(ParserRegistry::builtin()),
            Arc::clone(&queue),
        )?);

        Ok(Self {
            config,
            store,
            queue,
            intake,
        })
    }

    /// Steps 3 to 5: quarantine purge, processing recovery, incoming scan.
    pub async fn catch_up(&self) {
        if let Err(e) = self.intake.quarantine().purge().await {
            warn!(error = %format!("{:#}", e), "start-up quarantine purge failed");
        }
        match self.intake.recover_processing().await {
            Ok(outcomes) if !outcomes.is_empty() => {
                info!(files = outcomes.len(), "recovered files from processing")
            }
            Ok(_) => {}
            Err(e) => error!(error = %format!("{:#}", e), "processing recovery failed"),
        }
        if let Err(e) = self.intake.scan_incoming().await {
            error!(error = %format!("{:#}", e), "incoming scan failed");
        }
    }
}

/// Run until `shutdown` carries `true`, then stop the watch loop and the
/// drain worker, waiting at most `shutdown.timeout_secs` for each.
pub async fn run_pipeline(config: Config, shutdown: watch::Receiver<bool>) -> Result<()> {
    let pipeline = Pipeline::open(config).await?;
    let config = Arc::clone(&pipeline.config);
    info!(
        watch_dir = %config.paths.watch_dir.display(),
        sink = ?config.sink.kind,
        mode = ?config.intake.watch_mode,
        "pipeline starting"
    );

    pipeline.catch_up().await;

    let (tx, rx) = mpsc::unbounded_channel();
    let fs_watcher = start_fs_watcher(&config, tx)?;

    let drain = spawn_drain_worker(
        Arc::clone(&pipeline.queue),
        Duration::from_secs(config.retry.interval_secs),
        shutdown.clone(),
    );
    let watch_loop = spawn_watch_loop(
        Arc::clone(&pipeline.intake),
        Arc::clone(&config),
        rx,
        fs_watcher,
        shutdown.clone(),
    );

    let mut shutdown = shutdown;
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
    info!("shutting down");

    let timeout = Duration::from_secs(config.shutdown.timeout_secs);
    join_with_timeout("watch loop", watch_loop, timeout).await;
    join_with_timeout("drain worker", drain, timeout).await;

    let Pipeline {
        store,
        queue,
        intake,
        ..
    } = pipeline;
    drop(intake);
    drop(queue);
    store.close().await?;
    info!("pipeline stopped");
    Ok(())
}

async fn join_with_timeout(name: &str, handle: JoinHandle<()>, timeout: Duration) {
    let abort = handle.abort_handle();
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(())) => debug!(task = name, "stopped"),
        Ok(Err(e)) => error!(task = name, error = %e, "task panicked"),
        Err(_) => {
            warn!(task = name, "did not stop in time, aborting");
            abort.abort();
        }
    }
}

/// Start a native or polling watcher on the watch directory that forwards
/// created/modified paths to `tx`. A native watcher that cannot start
/// falls back to polling.
fn start_fs_watcher(
    config: &Config,
    tx: mpsc::UnboundedSender<PathBuf>,
) -> Result<Box<dyn Watcher + Send>> {
    let dir = &config.paths.watch_dir;
    let poll_interval = Duration::from_millis(config.intake.poll_interval_ms);

    let handler = move |res: notify::Result<notify::Event>| match res {
        Ok(event) => {
            if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                for path in event.paths {
                    let _ = tx.send(path);
                }
            }
        }
        Err(e) => warn!(error = %e, "watch error"),
    };

    let mut watcher = match config.intake.watch_mode {
        WatchMode::Poll => poll_watcher(handler, poll_interval)?,
        WatchMode::Native => match notify::recommended_watcher(handler.clone()) {
            Ok(w) => Box::new(w) as Box<dyn Watcher + Send>,
            Err(e) => {
                warn!(error = %e, "native watcher unavailable, polling instead");
                poll_watcher(handler, poll_interval)?
            }
        },
    };

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch {}", dir.display()))?;
    Ok(watcher)
}

fn poll_watcher<F>(handler: F, every: Duration) -> Result<Box<dyn Watcher + Send>>
where
    F: notify::EventHandler,
{
    let cfg = notify::Config::default().with_poll_interval(every);
    Ok(Box::new(PollWatcher::new(handler, cfg)?))
}

fn spawn_watch_loop(
    intake: Arc<Intake>,
    config: Arc<Config>,
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
    fs_watcher: Box<dyn Watcher + Send>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // Dropping the watcher stops notifications, so it lives here.
        let _fs_watcher = fs_watcher;
        let watch_dir = config.paths.watch_dir.clone();
        let canonical_dir = watch_dir.canonicalize().unwrap_or_else(|_| watch_dir.clone());

        let mut rescan = interval(Duration::from_secs(config.intake.rescan_interval_secs));
        rescan.set_missed_tick_behavior(MissedTickBehavior::Delay);
        rescan.tick().await;
        let mut quota = interval(Duration::from_secs(config.quota.check_interval_secs));
        quota.set_missed_tick_behavior(MissedTickBehavior::Delay);
        quota.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(path) = rx.recv() => {
                    handle_path(&intake, &watch_dir, &canonical_dir, &path).await;
                }
                _ = rescan.tick() => {
                    if let Err(e) = intake.scan_incoming().await {
                        error!(error = %format!("{:#}", e), "rescan failed");
                    }
                }
                _ = quota.tick() => {
                    if let Err(e) = intake.quota().enforce().await {
                        error!(error = %format!("{:#}", e), "periodic quota check failed");
                    }
                }
            }
        }
        debug!("watch loop stopped");
    })
}

/// Backends report paths in their own form (FSEvents canonicalizes), so
/// the parent is compared canonically and intake sees the configured form.
async fn handle_path(intake: &Intake, watch_dir: &Path, canonical_dir: &Path, path: &Path) {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return;
    };
    if parent != watch_dir && parent.canonicalize().ok().as_deref() != Some(canonical_dir) {
        return;
    }
    let path = watch_dir.join(name);
    match intake.process_incoming(&path).await {
        Ok(IntakeOutcome::Ignored) => {}
        Ok(outcome) => debug!(path = %path.display(), ?outcome, "intake finished"),
        Err(e) => error!(path = %path.display(), error = %format!("{:#}", e), "intake failed"),
    }
}
