//! Idempotent schema creation.
//!
//! Every statement uses `IF NOT EXISTS`, so `munin init` and the start-up
//! path of `munin run` can both call [`run_migrations`] unconditionally.

use anyhow::Result;

use crate::db::Store;

pub async fn run_migrations(store: &Store) -> Result<()> {
    let mut conn = store.lock().await;

    // One row per ingested file; content_hash is the whole-file digest.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            relative_path TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            modified_at INTEGER NOT NULL,
            source_host TEXT NOT NULL,
            source_app TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            completed_at INTEGER,
            status TEXT NOT NULL
                CHECK (status IN ('processing', 'committed', 'deleted', 'error'))
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    // Retry queue; FIFO by id.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pending_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content_hash TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    // Local sink table.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_path TEXT NOT NULL,
            source_type TEXT NOT NULL,
            line_number INTEGER NOT NULL,
            event_ts INTEGER,
            level TEXT,
            message TEXT NOT NULL,
            attrs_json TEXT NOT NULL DEFAULT '{}',
            raw_excerpt TEXT NOT NULL,
            content_hash TEXT NOT NULL UNIQUE,
            ingested_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS quarantine_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            filename TEXT NOT NULL,
            reason TEXT NOT NULL,
            quarantined_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            level TEXT NOT NULL CHECK (level IN ('info', 'warning', 'error')),
            code TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    // Indexes
    for ddl in [
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_file_records_hash ON file_records(content_hash)",
        "CREATE INDEX IF NOT EXISTS idx_file_records_status ON file_records(status)",
        "CREATE INDEX IF NOT EXISTS idx_events_event_ts ON events(event_ts)",
        "CREATE INDEX IF NOT EXISTS idx_events_level ON events(level)",
        "CREATE INDEX IF NOT EXISTS idx_events_source_path ON events(source_path)",
        "CREATE INDEX IF NOT EXISTS idx_events_age ON events(COALESCE(event_ts, ingested_at))",
        "CREATE INDEX IF NOT EXISTS idx_quarantine_filename ON quarantine_entries(filename)",
        "CREATE INDEX IF NOT EXISTS idx_alerts_created_at ON alerts(created_at DESC)",
    ] {
        sqlx::query(ddl).execute(&mut *conn).await?;
    }

    Ok(())
}
