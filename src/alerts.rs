//! Operator alerts.
//!
//! Alerts are write-only from the pipeline's point of view: each one is a
//! row in `alerts` plus a `warn!` line, for whatever watches the store or
//! the logs. Nothing in the crate reads them back except `munin stats`.

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::fmt;
use tracing::warn;

use crate::db::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertCode {
    StorageHigh,
    QuarantineNew,
    IngestionBackpressure,
}

impl AlertCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCode::StorageHigh => "STORAGE_HIGH",
            AlertCode::QuarantineNew => "QUARANTINE_NEW",
            AlertCode::IngestionBackpressure => "INGESTION_BACKPRESSURE",
        }
    }

    pub fn default_level(&self) -> AlertLevel {
        match self {
            AlertCode::StorageHigh => AlertLevel::Error,
            AlertCode::QuarantineNew | AlertCode::IngestionBackpressure => AlertLevel::Warning,
        }
    }
}

impl fmt::Display for AlertCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub level: AlertLevel,
    pub code: AlertCode,
    pub message: String,
    pub metadata: Value,
}

impl Alert {
    /// An alert at the code's usual level.
    pub fn new(code: AlertCode, message: impl Into<String>, metadata: Value) -> Self {
        Self {
            level: code.default_level(),
            code,
            message: message.into(),
            metadata,
        }
    }
}

/// Record an alert and log it.
pub async fn emit_alert(store: &Store, alert: Alert) -> Result<()> {
    warn!(
        code = %alert.code,
        level = alert.level.as_str(),
        metadata = %alert.metadata,
        "{}",
        alert.message
    );

    let mut conn = store.lock().await;
    sqlx::query(
        "INSERT INTO alerts (level, code, message, created_at, metadata_json) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(alert.level.as_str())
    .bind(alert.code.as_str())
    .bind(&alert.message)
    .bind(Utc::now().timestamp())
    .bind(alert.metadata.to_string())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// `(code, message, created_at)` of the most recent alerts.
pub async fn recent_alerts(store: &Store, limit: i64) -> Result<Vec<(String, String, i64)>> {
    let mut conn = store.lock().await;
    let rows: Vec<(String, String, i64)> = sqlx::query_as(
        "SELECT code, message, created_at FROM alerts ORDER BY created_at DESC, id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}

/// Number of alerts recorded with `code`.
pub async fn count_alerts(store: &Store, code: AlertCode) -> Result<i64> {
    let mut conn = store.lock().await;
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alerts WHERE code = ?")
        .bind(code.as_str())
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}
