//! Storage quota enforcement.
//!
//! When the store (database plus WAL/SHM) grows past the high watermark,
//! the oldest `events` rows are deleted in batches, ordered by event time
//! and falling back to ingestion time, until the size drops to the low
//! watermark. Rows younger than the retention floor are never deleted: if
//! only those remain and the store is still above the high watermark,
//! enforcement stops and raises `STORAGE_HIGH` instead.
//!
//! The alert is edge-triggered per [`QuotaEnforcer`]: it fires once when
//! the store first fails to get back under the high watermark and re-arms
//! after an enforcement that ends under it.
//!
//! Only the `events` table is pruned. The retry queue, the manifest, and
//! quarantine/alert rows are left alone.

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use crate::alerts::{emit_alert, Alert, AlertCode};
use crate::config::QuotaConfig;
use crate::db::Store;

const SECS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaReport {
    /// Store is at or below the high watermark after enforcement.
    pub under_control: bool,
    pub size_before: u64,
    pub size_after: u64,
    pub bytes_freed: u64,
    pub rows_deleted: u64,
}

pub struct QuotaEnforcer {
    store: Store,
    config: QuotaConfig,
    alert_raised: AtomicBool,
}

impl QuotaEnforcer {
    pub fn new(store: Store, config: &QuotaConfig) -> Self {
        Self {
            store,
            config: config.clone(),
            alert_raised: AtomicBool::new(false),
        }
    }

    pub async fn enforce(&self) -> Result<QuotaReport> {
        let report = enforce_quota(&self.store, &self.config).await?;
        let config = &self.config;

        if report.under_control {
            if self.alert_raised.swap(false, Ordering::SeqCst) {
                info!(size = report.size_after, "store back under high watermark");
            }
            return Ok(report);
        }

        warn!(
            size = report.size_after,
            high_watermark = config.high_watermark_bytes,
            rows_deleted = report.rows_deleted,
            "store above high watermark with nothing older than the retention floor"
        );
        if !self.alert_raised.swap(true, Ordering::SeqCst) {
            emit_alert(
                &self.store,
                Alert::new(
                    AlertCode::StorageHigh,
                    format!(
                        "store is {} bytes, above the {} byte high watermark, and no events older than {} days remain",
                        report.size_after, config.high_watermark_bytes, config.retention_min_days
                    ),
                    json!({
                        "size_bytes": report.size_after,
                        "high_watermark_bytes": config.high_watermark_bytes,
                        "low_watermark_bytes": config.low_watermark_bytes,
                        "retention_min_days": config.retention_min_days,
                        "rows_deleted": report.rows_deleted,
                    }),
                ),
            )
            .await?;
        }
        Ok(report)
    }
}

/// One enforcement pass without alerting.
pub async fn enforce_quota(store: &Store, config: &QuotaConfig) -> Result<QuotaReport> {
    let size_before = store.size_on_disk();
    if size_before <= config.high_watermark_bytes {
        return Ok(QuotaReport {
            under_control: true,
            size_before,
            size_after: size_before,
            bytes_freed: 0,
            rows_deleted: 0,
        });
    }

    let cutoff = Utc::now().timestamp() - i64::from(config.retention_min_days) * SECS_PER_DAY;
    let mut rows_deleted = 0u64;

    let size = loop {
        let deleted = delete_oldest(store, cutoff, config.delete_batch).await?;
        if deleted > 0 {
            rows_deleted += deleted;
            compact(store).await?;
        }
        let size = store.size_on_disk();
        if size <= config.low_watermark_bytes || deleted == 0 {
            break size;
        }
    };

    let report = QuotaReport {
        under_control: size <= config.high_watermark_bytes,
        size_before,
        size_after: size,
        bytes_freed: size_before.saturating_sub(size),
        rows_deleted,
    };
    if rows_deleted > 0 {
        info!(
            rows_deleted,
            bytes_freed = report.bytes_freed,
            size,
            "quota enforced"
        );
    }
    Ok(report)
}

/// Delete up to `limit` of the oldest events older than `cutoff`.
async fn delete_oldest(store: &Store, cutoff: i64, limit: u32) -> Result<u64> {
    let mut conn = store.lock().await;
    let result = sqlx::query(
        r#"
        DELETE FROM events WHERE id IN (
            SELECT id FROM events
            WHERE COALESCE(event_ts, ingested_at) < ?
            ORDER BY COALESCE(event_ts, ingested_at) ASC, id ASC
            LIMIT ?
        )
        "#,
    )
    .bind(cutoff)
    .bind(i64::from(limit))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Return freed pages to the filesystem and fold the WAL back in.
async fn compact(store: &Store) -> Result<()> {
    let mut conn = store.lock().await;
    sqlx::query("PRAGMA incremental_vacuum")
        .execute(&mut *conn)
        .await?;
    sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
        .execute(&mut *conn)
        .await?;
    Ok(())
}
