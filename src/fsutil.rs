//! Filesystem helpers for intake: stability wait, atomic move, collision
//! naming, file digests, ignore rules, and directory listing.

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};
use walkdir::WalkDir;

const HASH_BUF_SIZE: usize = 1024 * 1024;

/// Result of waiting for a writer to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stability {
    /// Size held steady for the required number of polls.
    Stable { size: u64 },
    /// The file disappeared while we were watching it.
    Vanished,
    /// Still changing after the poll budget (`checks × 4`) ran out.
    Unstable,
}

/// Poll the size of `path` every `interval` until it reads the same
/// `checks` times in a row.
pub async fn wait_until_stable(path: &Path, checks: u32, interval: Duration) -> Stability {
    let mut last = match tokio::fs::metadata(path).await {
        Ok(m) => m.len(),
        Err(_) => return Stability::Vanished,
    };

    let mut steady = 0;
    for _ in 0..checks.saturating_mul(4) {
        tokio::time::sleep(interval).await;
        let size = match tokio::fs::metadata(path).await {
            Ok(m) => m.len(),
            Err(_) => return Stability::Vanished,
        };
        if size == last {
            steady += 1;
            if steady >= checks {
                return Stability::Stable { size };
            }
        } else {
            steady = 0;
            last = size;
        }
    }
    Stability::Unstable
}

static LAST_SUFFIX: AtomicU64 = AtomicU64::new(0);

/// Strictly increasing millisecond stamp, unique within the process.
fn monotonic_millis() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let mut prev = LAST_SUFFIX.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_SUFFIX.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

/// `dir/name`, or `dir/<stem>.<millis><.ext>` if that name is taken.
pub fn unique_target(dir: &Path, name: &OsStr) -> PathBuf {
    let direct = dir.join(name);
    if !direct.exists() {
        return direct;
    }
    let as_path = Path::new(name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = as_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    loop {
        let candidate = dir.join(format!("{}.{}{}", stem, monotonic_millis(), ext));
        if !candidate.exists() {
            return candidate;
        }
    }
}

/// Move `src` into `dst_dir`, resolving name collisions.
///
/// Renames are retried `retries` times `delay` apart to ride out another
/// process holding the file; after that the file is copied and the source
/// removed. A rename across filesystems goes straight to the copy. A
/// missing source fails immediately.
pub async fn move_atomic(
    src: &Path,
    dst_dir: &Path,
    retries: u32,
    delay: Duration,
) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dst_dir)
        .await
        .with_context(|| format!("Failed to create directory: {}", dst_dir.display()))?;

    let name = src
        .file_name()
        .with_context(|| format!("Path has no file name: {}", src.display()))?;
    let target = unique_target(dst_dir, name);

    let mut last_err = None;
    for attempt in 0..retries {
        match tokio::fs::rename(src, &target).await {
            Ok(()) => return Ok(target),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(e).with_context(|| format!("Source vanished: {}", src.display()));
            }
            Err(e) if crosses_devices(&e) => {
                debug!(path = %src.display(), "rename crosses filesystems");
                last_err = Some(e);
                break;
            }
            Err(e) => {
                debug!(path = %src.display(), attempt, error = %e, "rename failed, retrying");
                last_err = Some(e);
                tokio::time::sleep(delay).await;
            }
        }
    }

    if let Some(e) = last_err {
        warn!(path = %src.display(), error = %e, "rename kept failing, copying instead");
    }
    tokio::fs::copy(src, &target).await.with_context(|| {
        format!("Failed to copy {} to {}", src.display(), target.display())
    })?;
    if let Err(e) = tokio::fs::remove_file(src).await {
        warn!(path = %src.display(), error = %e, "copied but could not remove source");
    }
    Ok(target)
}

fn crosses_devices(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::CrossesDevices
}

/// Hex SHA-256 of a file's contents, streamed.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open for hashing: {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .with_context(|| format!("Failed to read: {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// File-name globs that discovery skips (`*.tmp`, `*.partial`, …).
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    set: GlobSet,
}

impl IgnoreRules {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = GlobBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("Invalid ignore glob: {}", pattern))?;
            builder.add(glob);
        }
        Ok(Self {
            set: builder.build()?,
        })
    }

    /// Matches against the file name only.
    pub fn is_ignored(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| self.set.is_match(Path::new(name)))
            .unwrap_or(true)
    }
}

/// Regular files directly inside `dir`, sorted by name. A missing
/// directory lists as empty.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to list {}", dir.display()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Modification time as Unix seconds, 0 if unavailable.
pub fn modified_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
