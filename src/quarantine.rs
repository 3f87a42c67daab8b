//! Quarantine: where files that could not be ingested are kept for an
//! operator to look at.
//!
//! Every quarantined file has a sibling `<name>.reason.txt` note with the
//! failure reason, the original path, and the time of quarantine. The
//! note's mtime is the quarantine time used for purging, since a renamed
//! file keeps the mtime its writer gave it.
//!
//! Purging happens in two passes: files past the retention period go
//! first, then, if the directory is still over its size cap, the oldest
//! remaining files are evicted until it fits.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

use crate::alerts::{emit_alert, Alert, AlertCode};
use crate::config::QuarantineConfig;
use crate::db::Store;
use crate::fsutil::{list_files, move_atomic};
use crate::models::QuarantineEntry;

pub const REASON_SUFFIX: &str = ".reason.txt";

const MOVE_RETRIES: u32 = 5;
const MOVE_RETRY_DELAY: Duration = Duration::from_millis(50);
const SECS_PER_DAY: u64 = 86_400;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub expired: usize,
    pub evicted: usize,
    pub bytes_freed: u64,
}

/// A quarantined file and its note, as found on disk.
struct Held {
    path: PathBuf,
    note: PathBuf,
    bytes: u64,
    since: SystemTime,
}

pub struct QuarantineManager {
    dir: PathBuf,
    store: Store,
    retention: Duration,
    max_bytes: u64,
}

impl QuarantineManager {
    pub fn new(dir: impl Into<PathBuf>, store: Store, config: &QuarantineConfig) -> Self {
        Self {
            dir: dir.into(),
            store,
            retention: Duration::from_secs(u64::from(config.retention_days) * SECS_PER_DAY),
            max_bytes: config.max_bytes,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Move `path` into quarantine, write its reason note, record the
    /// entry, and raise `QUARANTINE_NEW`. `original` is where the file was
    /// first seen.
    pub async fn capture(&self, path: &Path, original: &Path, reason: &str) -> Result<QuarantineEntry> {
        let target = move_atomic(path, &self.dir, MOVE_RETRIES, MOVE_RETRY_DELAY)
            .await
            .with_context(|| format!("Failed to quarantine {}", path.display()))?;
        let filename = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let now = Utc::now();
        let note = format!(
            "reason: {}\noriginal: {}\nquarantined_at: {}\n",
            reason,
            original.display(),
            now.to_rfc3339()
        );
        tokio::fs::write(note_path(&target), note)
            .await
            .with_context(|| format!("Failed to write reason note for {}", target.display()))?;

        let entry = QuarantineEntry {
            filename,
            reason: reason.to_string(),
            quarantined_at: now.timestamp(),
        };
        {
            let mut conn = self.store.lock().await;
            sqlx::query(
                "INSERT INTO quarantine_entries (filename, reason, quarantined_at) VALUES (?, ?, ?)",
            )
            .bind(&entry.filename)
            .bind(&entry.reason)
            .bind(entry.quarantined_at)
            .execute(&mut *conn)
            .await?;
        }

        warn!(file = %entry.filename, original = %original.display(), reason, "quarantined");
        emit_alert(
            &self.store,
            Alert::new(
                AlertCode::QuarantineNew,
                format!("{} quarantined: {}", entry.filename, reason),
                json!({ "filename": entry.filename, "original": original.display().to_string() }),
            ),
        )
        .await?;

        Ok(entry)
    }

    /// Age purge, then size-cap eviction.
    pub async fn purge(&self) -> Result<PurgeReport> {
        let mut report = PurgeReport::default();
        let held = self.scan()?;

        let now = SystemTime::now();
        let (expired, mut kept): (Vec<Held>, Vec<Held>) = held.into_iter().partition(|h| {
            now.duration_since(h.since)
                .map(|age| age > self.retention)
                .unwrap_or(false)
        });
        for h in expired {
            report.bytes_freed += remove_pair(&h);
            report.expired += 1;
        }

        let mut total: u64 = kept.iter().map(|h| h.bytes).sum();
        if total > self.max_bytes {
            kept.sort_by_key(|h| h.since);
            for h in kept {
                if total <= self.max_bytes {
                    break;
                }
                total = total.saturating_sub(h.bytes);
                report.bytes_freed += remove_pair(&h);
                report.evicted += 1;
            }
        }

        if report.expired > 0 || report.evicted > 0 {
            info!(
                expired = report.expired,
                evicted = report.evicted,
                bytes_freed = report.bytes_freed,
                "quarantine purged"
            );
        }
        Ok(report)
    }

    /// `(files, bytes)` currently held, notes included in the byte count.
    pub fn usage(&self) -> Result<(usize, u64)> {
        let held = self.scan()?;
        Ok((held.len(), held.iter().map(|h| h.bytes).sum()))
    }

    fn scan(&self) -> Result<Vec<Held>> {
        let mut held = Vec::new();
        for path in list_files(&self.dir)? {
            if is_note(&path) {
                continue;
            }
            let Ok(meta) = std::fs::metadata(&path) else {
                continue;
            };
            let note = note_path(&path);
            let note_meta = std::fs::metadata(&note).ok();
            let since = note_meta
                .as_ref()
                .and_then(|m| m.modified().ok())
                .or_else(|| meta.modified().ok())
                .unwrap_or_else(SystemTime::now);
            held.push(Held {
                bytes: meta.len() + note_meta.map(|m| m.len()).unwrap_or(0),
                path,
                note,
                since,
            });
        }
        Ok(held)
    }
}

pub fn note_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(REASON_SUFFIX);
    PathBuf::from(name)
}

/// A note is `<held>.reason.txt` whose `<held>` exists. A file that has
/// a note of its own is held, whatever its name.
fn is_note(path: &Path) -> bool {
    let Some(held) = path
        .to_str()
        .and_then(|p| p.strip_suffix(REASON_SUFFIX))
        .filter(|held| !held.is_empty())
    else {
        return false;
    };
    Path::new(held).is_file() && !note_path(path).exists()
}

/// Delete a file and its note; returns bytes actually removed.
fn remove_pair(h: &Held) -> u64 {
    let mut freed = 0;
    for p in [&h.path, &h.note] {
        let len = std::fs::metadata(p).map(|m| m.len()).unwrap_or(0);
        match std::fs::remove_file(p) {
            Ok(()) => freed += len,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %p.display(), error = %e, "could not delete quarantined file"),
        }
    }
    freed
}
