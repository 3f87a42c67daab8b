//! File-intake state machine.
//!
//! ```text
//! discovered ─► stabilizing ─► moved-to-processing ─► hashed ─┬─► duplicate-dropped
//!      │              │                                       └─► parsed ─┬─► committed+deleted
//!      └─ ignored     └─ abandoned (vanished / still growing)             └─► quarantined
//! ```
//!
//! Once a file is moved into the processing directory it belongs to
//! intake alone until it is deleted or quarantined. A stale notification
//! for the original path finds nothing there and is dropped; concurrent
//! notifications for a path already being handled are rejected by the
//! in-flight guard.
//!
//! A crash mid-file leaves the file in the processing directory with its
//! record in `processing`. [`Intake::recover_processing`] runs at start-up
//! and pushes every such file through the same path again.

use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::Store;
use crate::fsutil::{self, IgnoreRules, Stability};
use crate::manifest::{self, NewFile};
use crate::models::{FileStatus, NormalizedEvent};
use crate::parsers::ParserRegistry;
use crate::quarantine::QuarantineManager;
use crate::queue::RetryQueue;
use crate::quota::QuotaEnforcer;
use crate::sniff::{self, Selection};

/// Quarantine reason for files that parse to nothing.
pub const NO_EVENTS_REASON: &str = "no events produced";

#[derive(Debug, Clone, Copy)]
enum IntakeState {
    Discovered,
    Stabilizing,
    MovedToProcessing,
    Hashed,
    Parsed,
}

/// Terminal result of handling one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Not a candidate: ignored suffix, not a regular file, or already in flight.
    Ignored,
    /// Vanished or never stopped growing; a later event may retry it.
    Abandoned,
    /// Same bytes were already ingested; the copy was deleted unparsed.
    DuplicateDropped { file_id: i64 },
    Committed { file_id: i64, events: u64 },
    Quarantined { reason: String },
}

pub struct Intake {
    config: Arc<Config>,
    store: Store,
    registry: Arc<ParserRegistry>,
    queue: Arc<RetryQueue>,
    quarantine: QuarantineManager,
    quota: QuotaEnforcer,
    ignore: IgnoreRules,
    in_flight: Mutex<HashSet<PathBuf>>,
}

/// Releases an in-flight claim on drop.
struct Claim<'a> {
    set: &'a Mutex<HashSet<PathBuf>>,
    path: PathBuf,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.path);
    }
}

impl Intake {
    pub fn new(
        config: Arc<Config>,
        store: Store,
        registry: Arc<ParserRegistry>,
        queue: Arc<RetryQueue>,
    ) -> Result<Self> {
        let ignore = IgnoreRules::new(&config.intake.ignore_globs)?;
        let quarantine = QuarantineManager::new(
            config.paths.quarantine_dir.clone(),
            store.clone(),
            &config.quarantine,
        );
        let quota = QuotaEnforcer::new(store.clone(), &config.quota);
        Ok(Self {
            config,
            store,
            registry,
            queue,
            quarantine,
            quota,
            ignore,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    pub fn quarantine(&self) -> &QuarantineManager {
        &self.quarantine
    }

    pub fn quota(&self) -> &QuotaEnforcer {
        &self.quota
    }

    fn claim(&self, path: &Path) -> Option<Claim<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(path.to_path_buf()) {
            return None;
        }
        Some(Claim {
            set: &self.in_flight,
            path: path.to_path_buf(),
        })
    }

    fn trace(&self, path: &Path, state: IntakeState) {
        debug!(path = %path.display(), ?state, "intake");
    }

    /// Handle a path reported in the watch directory.
    pub async fn process_incoming(&self, path: &Path) -> Result<IntakeOutcome> {
        self.trace(path, IntakeState::Discovered);
        if self.ignore.is_ignored(path) {
            return Ok(IntakeOutcome::Ignored);
        }
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Ok(IntakeOutcome::Ignored),
        }
        let Some(_claim) = self.claim(path) else {
            debug!(path = %path.display(), "already in flight");
            return Ok(IntakeOutcome::Ignored);
        };

        self.trace(path, IntakeState::Stabilizing);
        let intake = &self.config.intake;
        match fsutil::wait_until_stable(path, intake.stable_checks, intake.stable_interval()).await {
            Stability::Stable { .. } => {}
            Stability::Vanished => {
                debug!(path = %path.display(), "vanished before it settled");
                return Ok(IntakeOutcome::Abandoned);
            }
            Stability::Unstable => {
                info!(path = %path.display(), "still being written, will retry later");
                return Ok(IntakeOutcome::Abandoned);
            }
        }

        let moved = match fsutil::move_atomic(
            path,
            &self.config.paths.processing_dir,
            intake.move_retries,
            intake.move_retry_delay(),
        )
        .await
        {
            Ok(p) => p,
            Err(e) if !path.exists() => {
                debug!(path = %path.display(), error = %e, "vanished during move");
                return Ok(IntakeOutcome::Abandoned);
            }
            Err(e) => return Err(e),
        };
        self.trace(&moved, IntakeState::MovedToProcessing);

        let relative_path = file_name_of(path);
        self.process_owned(&moved, path, Some(relative_path)).await
    }

    /// Re-run a file already sitting in the processing directory.
    pub async fn process_in_place(&self, path: &Path) -> Result<IntakeOutcome> {
        let Some(_claim) = self.claim(path) else {
            return Ok(IntakeOutcome::Ignored);
        };
        self.process_owned(path, path, None).await
    }

    /// Everything after the move: hash, dedup, parse, commit or quarantine.
    /// `relative_path` of `None` means "reuse the recorded name if any".
    async fn process_owned(
        &self,
        path: &Path,
        original: &Path,
        relative_path: Option<String>,
    ) -> Result<IntakeOutcome> {
        let (meta, digest) = match tokio::fs::metadata(path).await {
            Ok(meta) => match fsutil::sha256_file(path).await {
                Ok(digest) => (meta, digest),
                Err(e) => return self.fail(None, path, original, format!("{:#}", e)).await,
            },
            Err(e) => {
                let err = anyhow::Error::new(e).context(format!("Failed to stat {}", path.display()));
                return self.fail(None, path, original, format!("{:#}", err)).await;
            }
        };
        self.trace(path, IntakeState::Hashed);

        let existing = manifest::find_by_hash(&self.store, &digest).await?;
        if let Some(record) = &existing {
            if record.status.is_ingested() {
                tokio::fs::remove_file(path)
                    .await
                    .with_context(|| format!("Failed to delete duplicate {}", path.display()))?;
                info!(
                    path = %original.display(),
                    file_id = record.id,
                    first_seen_as = %record.relative_path,
                    "duplicate dropped"
                );
                return Ok(IntakeOutcome::DuplicateDropped { file_id: record.id });
            }
        }

        let relative_path = relative_path
            .or_else(|| existing.as_ref().map(|r| r.relative_path.clone()))
            .unwrap_or_else(|| file_name_of(path));

        let file_id = match manifest::begin(
            &self.store,
            &NewFile {
                relative_path: relative_path.clone(),
                content_hash: digest,
                size_bytes: meta.len() as i64,
                modified_at: fsutil::modified_secs(&meta),
                source_host: self.config.intake.source_host.clone(),
                source_app: self.config.intake.source_app.clone(),
            },
        )
        .await
        {
            Ok(id) => id,
            Err(e) => return self.fail(None, path, original, format!("{:#}", e)).await,
        };

        match self.parse_and_enqueue(path, &relative_path).await {
            Ok(0) => self.fail(Some(file_id), path, original, NO_EVENTS_REASON.to_string()).await,
            Ok(events) => {
                self.trace(path, IntakeState::Parsed);
                self.commit(file_id, path, original, events).await
            }
            Err(e) => self.fail(Some(file_id), path, original, format!("{:#}", e)).await,
        }
    }

    async fn commit(
        &self,
        file_id: i64,
        path: &Path,
        original: &Path,
        events: u64,
    ) -> Result<IntakeOutcome> {
        manifest::mark(&self.store, file_id, FileStatus::Committed).await?;
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("Failed to delete ingested file {}", path.display()))?;
        manifest::mark(&self.store, file_id, FileStatus::Deleted).await?;
        info!(path = %original.display(), file_id, events, "committed");

        if let Err(e) = self.quota.enforce().await {
            error!(error = %format!("{:#}", e), "quota enforcement failed");
        }
        Ok(IntakeOutcome::Committed { file_id, events })
    }

    /// Quarantine `path` with `reason`, mark its record `error`, and purge.
    /// Problems in here are logged; the outcome is still `Quarantined`.
    async fn fail(
        &self,
        file_id: Option<i64>,
        path: &Path,
        original: &Path,
        reason: String,
    ) -> Result<IntakeOutcome> {
        if let Some(id) = file_id {
            if let Err(e) = manifest::mark(&self.store, id, FileStatus::Error).await {
                error!(file_id = id, error = %format!("{:#}", e), "could not mark record as error");
            }
        }
        if let Err(e) = self.quarantine.capture(path, original, &reason).await {
            error!(path = %path.display(), error = %format!("{:#}", e), "could not quarantine");
        }
        if let Err(e) = self.quarantine.purge().await {
            warn!(error = %format!("{:#}", e), "quarantine purge failed");
        }
        Ok(IntakeOutcome::Quarantined { reason })
    }

    /// Sniff, parse, and hand events to the queue in batches. Returns the
    /// number of events produced.
    async fn parse_and_enqueue(&self, path: &Path, source_path: &str) -> Result<u64> {
        let sample = sniff::read_sample(path, self.config.intake.sniff_lines).await?;
        let Some(selection) = sniff::select(&self.registry, &sample) else {
            return Ok(0);
        };
        debug!(path = %path.display(), selection = ?selection, "parser selected");

        let batch_size = self.config.intake.batch_size;
        match selection {
            Selection::Binary(parser) => {
                let (tx, mut rx) = mpsc::channel::<Vec<NormalizedEvent>>(1);
                let file = path.to_path_buf();
                let source = source_path.to_string();
                let reader = tokio::task::spawn_blocking(move || {
                    parser.parse_file(&file, &source, batch_size, &mut |batch| {
                        tx.blocking_send(batch)
                            .map_err(|_| anyhow!("event receiver closed"))
                    })
                });

                let mut enqueue_error = None;
                while let Some(batch) = rx.recv().await {
                    if let Err(e) = self.queue.enqueue(&batch).await {
                        enqueue_error = Some(e);
                        break;
                    }
                }
                drop(rx);

                let parsed = reader
                    .await
                    .with_context(|| format!("Parser task for {} failed", path.display()))?;
                if let Some(e) = enqueue_error {
                    return Err(e);
                }
                parsed
            }
            Selection::Text { mut parser, .. } => {
                let file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                let mut reader = BufReader::new(file);
                let mut buf = Vec::new();
                let mut batch: Vec<NormalizedEvent> = Vec::with_capacity(batch_size);
                let mut line_number = 0u64;
                let mut produced = 0u64;

                loop {
                    buf.clear();
                    let n = reader
                        .read_until(b'\n', &mut buf)
                        .await
                        .with_context(|| format!("Failed to read line {} of {}", line_number + 1, path.display()))?;
                    if n == 0 {
                        break;
                    }
                    line_number += 1;
                    let text = String::from_utf8_lossy(&buf);
                    let line = text.trim_end_matches(['\r', '\n']);
                    if let Some(event) = parser.parse_line(line, line_number, source_path) {
                        batch.push(event);
                        produced += 1;
                    }
                    if batch.len() >= batch_size {
                        self.queue.enqueue(&batch).await?;
                        batch.clear();
                    }
                }
                self.queue.enqueue(&batch).await?;
                Ok(produced)
            }
        }
    }

    /// Start-up recovery: re-run everything left in the processing directory.
    pub async fn recover_processing(&self) -> Result<Vec<IntakeOutcome>> {
        let mut outcomes = Vec::new();
        for path in fsutil::list_files(&self.config.paths.processing_dir)? {
            info!(path = %path.display(), "recovering file left in processing");
            match self.process_in_place(&path).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(path = %path.display(), error = %format!("{:#}", e), "recovery failed"),
            }
        }
        Ok(outcomes)
    }

    /// Offer every file currently in the watch directory to intake.
    pub async fn scan_incoming(&self) -> Result<Vec<IntakeOutcome>> {
        let mut outcomes = Vec::new();
        for path in fsutil::list_files(&self.config.paths.watch_dir)? {
            match self.process_incoming(&path).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(path = %path.display(), error = %format!("{:#}", e), "intake failed"),
            }
        }
        Ok(outcomes)
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
