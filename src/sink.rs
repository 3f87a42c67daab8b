//! Event sinks.
//!
//! A sink accepts batches of [`NormalizedEvent`]s and must treat a
//! `content_hash` it has already stored as a no-op. It reports how many
//! events it received and how many were new.
//!
//! - [`HttpSink`] posts `{"events": [...]}` to a remote endpoint and reads
//!   back `{"inserted": n, "received": m}`.
//! - [`StoreSink`] writes into the local `events` table with
//!   `ON CONFLICT(content_hash) DO NOTHING`.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::Connection;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{SinkConfig, SinkKind};
use crate::db::Store;
use crate::models::NormalizedEvent;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("sink responded with status {0}")]
    Status(u16),
    #[error("malformed json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// Acknowledgement for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SinkReceipt {
    pub received: u64,
    pub inserted: u64,
}

#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver `events` as one unit. An `Err` means nothing is
    /// acknowledged and the caller keeps the whole batch.
    async fn write_batch(&self, events: &[NormalizedEvent]) -> Result<SinkReceipt, SinkError>;
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    events: &'a [NormalizedEvent],
}

#[derive(Debug, Default, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    inserted: Option<u64>,
    #[serde(default)]
    received: Option<u64>,
}

pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn write_batch(&self, events: &[NormalizedEvent]) -> Result<SinkReceipt, SinkError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&BatchRequest { events })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        let parsed: BatchResponse = if body.iter().all(u8::is_ascii_whitespace) {
            BatchResponse::default()
        } else {
            serde_json::from_slice(&body)?
        };

        Ok(SinkReceipt {
            received: parsed.received.unwrap_or(events.len() as u64),
            inserted: parsed.inserted.unwrap_or(0),
        })
    }
}

/// Writes into the local `events` table.
pub struct StoreSink {
    store: Store,
}

impl StoreSink {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Sink for StoreSink {
    fn name(&self) -> &str {
        "local"
    }

    async fn write_batch(&self, events: &[NormalizedEvent]) -> Result<SinkReceipt, SinkError> {
        let now = Utc::now().timestamp();
        let mut conn = self.store.lock().await;
        let mut tx = conn.begin().await?;

        let mut inserted = 0u64;
        for event in events {
            let attrs_json = serde_json::to_string(&event.attrs)?;
            let result = sqlx::query(
                r#"
                INSERT INTO events
                    (source_path, source_type, line_number, event_ts, level,
                     message, attrs_json, raw_excerpt, content_hash, ingested_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(content_hash) DO NOTHING
                "#,
            )
            .bind(&event.source_path)
            .bind(&event.source_type)
            .bind(event.line_number as i64)
            .bind(event.event_time.map(|t| t.timestamp()))
            .bind(event.level.as_deref())
            .bind(&event.message)
            .bind(attrs_json)
            .bind(&event.raw_excerpt)
            .bind(&event.content_hash)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(SinkReceipt {
            received: events.len() as u64,
            inserted,
        })
    }
}

/// Build the configured sink.
pub fn build_sink(config: &SinkConfig, store: &Store) -> anyhow::Result<Arc<dyn Sink>> {
    match config.kind {
        SinkKind::Local => Ok(Arc::new(StoreSink::new(store.clone()))),
        SinkKind::Http => {
            let endpoint = config
                .endpoint
                .clone()
                .ok_or_else(|| anyhow::anyhow!("sink.kind = \"http\" requires sink.endpoint"))?;
            Ok(Arc::new(HttpSink::new(
                endpoint,
                Duration::from_secs(config.timeout_secs),
            )?))
        }
    }
}
