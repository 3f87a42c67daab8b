//! Core data models that flow through the intake pipeline.
//!
//! A dropped file becomes a [`FileRecord`]; each parsed line becomes a
//! [`NormalizedEvent`]; a file that cannot be ingested becomes a
//! [`QuarantineEntry`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// One log record in the uniform schema.
///
/// Immutable once built by [`crate::normalize::normalize`]; `content_hash`
/// is a pure function of `source_path`, `event_time`, `level`, `message`,
/// and `attrs`, so resubmitting the same logical event is a no-op at the
/// sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub source_path: String,
    pub source_type: String,
    pub line_number: u64,
    pub event_time: Option<DateTime<Utc>>,
    pub level: Option<String>,
    pub message: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, serde_json::Value>,
    pub raw_excerpt: String,
    pub content_hash: String,
}

/// Lifecycle of a [`FileRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Processing,
    Committed,
    Deleted,
    Error,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Processing => "processing",
            FileStatus::Committed => "committed",
            FileStatus::Deleted => "deleted",
            FileStatus::Error => "error",
        }
    }

    /// Committed and deleted files have been fully ingested; a later file
    /// with the same digest is a duplicate.
    pub fn is_ingested(&self) -> bool {
        matches!(self, FileStatus::Committed | FileStatus::Deleted)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(FileStatus::Processing),
            "committed" => Ok(FileStatus::Committed),
            "deleted" => Ok(FileStatus::Deleted),
            "error" => Ok(FileStatus::Error),
            other => anyhow::bail!("unknown file status: '{}'", other),
        }
    }
}

/// Manifest row for one ingested file.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: i64,
    pub relative_path: String,
    pub content_hash: String,
    pub size_bytes: i64,
    pub modified_at: i64,
    pub source_host: String,
    pub source_app: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub status: FileStatus,
}

/// A file that failed intake, paired on disk with a `.reason.txt` note.
#[derive(Debug, Clone)]
pub struct QuarantineEntry {
    pub filename: String,
    pub reason: String,
    pub quarantined_at: i64,
}
