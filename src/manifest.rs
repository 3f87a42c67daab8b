//! File manifest: one [`FileRecord`] per distinct file digest.
//!
//! ```text
//! begin ──► processing ──► committed ──► deleted
//!               │
//!               └────────► error ──(same digest dropped again)──► processing
//! ```
//!
//! A digest whose record is `committed` or `deleted` is a duplicate. A
//! record left in `error` or `processing` (crash mid-file) is reused when
//! the same bytes show up again.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::db::Store;
use crate::models::{FileRecord, FileStatus};

/// Identity of a file about to be processed.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub relative_path: String,
    pub content_hash: String,
    pub size_bytes: i64,
    pub modified_at: i64,
    pub source_host: String,
    pub source_app: String,
}

fn record_from_row(row: &SqliteRow) -> Result<FileRecord> {
    let status: String = row.get("status");
    Ok(FileRecord {
        id: row.get("id"),
        relative_path: row.get("relative_path"),
        content_hash: row.get("content_hash"),
        size_bytes: row.get("size_bytes"),
        modified_at: row.get("modified_at"),
        source_host: row.get("source_host"),
        source_app: row.get("source_app"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        status: status.parse()?,
    })
}

pub async fn find_by_hash(store: &Store, content_hash: &str) -> Result<Option<FileRecord>> {
    let mut conn = store.lock().await;
    let row = sqlx::query("SELECT * FROM file_records WHERE content_hash = ?")
        .bind(content_hash)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(record_from_row).transpose()
}

pub async fn get(store: &Store, id: i64) -> Result<FileRecord> {
    let mut conn = store.lock().await;
    let row = sqlx::query("SELECT * FROM file_records WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .with_context(|| format!("file record {} not found", id))?;
    record_from_row(&row)
}

/// Start processing `file`: insert a fresh `processing` record, or reset a
/// failed/stale one with the same digest. Returns the record id.
///
/// Callers check [`find_by_hash`] for duplicates first; beginning an
/// already-ingested digest is an error.
pub async fn begin(store: &Store, file: &NewFile) -> Result<i64> {
    let now = Utc::now().timestamp();
    let mut conn = store.lock().await;

    let existing: Option<(i64, String)> =
        sqlx::query_as("SELECT id, status FROM file_records WHERE content_hash = ?")
            .bind(&file.content_hash)
            .fetch_optional(&mut *conn)
            .await?;

    match existing {
        Some((id, status)) => {
            let status: FileStatus = status.parse()?;
            if status.is_ingested() {
                anyhow::bail!(
                    "file {} was already ingested (record {}, {})",
                    file.relative_path,
                    id,
                    status
                );
            }
            sqlx::query(
                r#"
                UPDATE file_records
                SET relative_path = ?, size_bytes = ?, modified_at = ?,
                    source_host = ?, source_app = ?, started_at = ?,
                    completed_at = NULL, status = 'processing'
                WHERE id = ?
                "#,
            )
            .bind(&file.relative_path)
            .bind(file.size_bytes)
            .bind(file.modified_at)
            .bind(&file.source_host)
            .bind(&file.source_app)
            .bind(now)
            .bind(id)
            .execute(&mut *conn)
            .await?;
            Ok(id)
        }
        None => {
            let result = sqlx::query(
                r#"
                INSERT INTO file_records
                    (relative_path, content_hash, size_bytes, modified_at,
                     source_host, source_app, started_at, status)
                VALUES (?, ?, ?, ?, ?, ?, ?, 'processing')
                "#,
            )
            .bind(&file.relative_path)
            .bind(&file.content_hash)
            .bind(file.size_bytes)
            .bind(file.modified_at)
            .bind(&file.source_host)
            .bind(&file.source_app)
            .bind(now)
            .execute(&mut *conn)
            .await?;
            Ok(result.last_insert_rowid())
        }
    }
}

/// Move a record to `status`. Committing stamps `completed_at`.
pub async fn mark(store: &Store, id: i64, status: FileStatus) -> Result<()> {
    let mut conn = store.lock().await;
    let sql = match status {
        FileStatus::Committed => {
            "UPDATE file_records SET status = ?, completed_at = ? WHERE id = ?"
        }
        _ => "UPDATE file_records SET status = ?, completed_at = COALESCE(completed_at, ?) WHERE id = ?",
    };
    let now = Utc::now().timestamp();
    let completed = match status {
        FileStatus::Processing => None,
        _ => Some(now),
    };
    sqlx::query(sql)
        .bind(status.as_str())
        .bind(completed)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Record counts per status, for `munin stats`.
pub async fn count_by_status(store: &Store) -> Result<Vec<(FileStatus, i64)>> {
    let mut conn = store.lock().await;
    let rows = sqlx::query(
        "SELECT status, COUNT(*) AS n FROM file_records GROUP BY status ORDER BY status",
    )
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| {
            let status: String = row.get("status");
            Ok((status.parse()?, row.get::<i64, _>("n")))
        })
        .collect()
}
