//! Durable retry queue between parsing and the sink.
//!
//! Intake appends events to `pending_events` and moves on; delivery never
//! blocks intake. A drain worker takes the oldest `batch_size` rows, sends
//! them as one batch, and deletes exactly those rows once the sink
//! acknowledges. A failed delivery leaves the batch untouched for the next
//! cycle: no partial acknowledgement, no splitting.
//!
//! The store lock is released while the batch is in flight, so intake can
//! keep enqueueing during slow deliveries.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use sqlx::{Connection, QueryBuilder, Row, Sqlite};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::alerts::{emit_alert, Alert, AlertCode};
use crate::config::RetryConfig;
use crate::db::Store;
use crate::models::NormalizedEvent;
use crate::sink::{Sink, SinkReceipt};

/// What one drain cycle did.
#[derive(Debug)]
pub enum DrainOutcome {
    /// Nothing pending.
    Empty,
    /// The batch was acknowledged and removed.
    Delivered { rows: usize, receipt: SinkReceipt },
    /// The sink failed; the batch stays queued.
    Retained { rows: usize, error: String },
}

pub struct RetryQueue {
    store: Store,
    sink: Arc<dyn Sink>,
    batch_size: usize,
    backpressure_threshold: u64,
    backpressure_raised: AtomicBool,
}

impl RetryQueue {
    pub fn new(store: Store, sink: Arc<dyn Sink>, config: &RetryConfig) -> Self {
        Self {
            store,
            sink,
            batch_size: config.batch_size,
            backpressure_threshold: config.backpressure_threshold,
            backpressure_raised: AtomicBool::new(false),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Append `events` in order, atomically.
    pub async fn enqueue(&self, events: &[NormalizedEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp();
        {
            let mut conn = self.store.lock().await;
            let mut tx = conn.begin().await?;
            for event in events {
                let payload = serde_json::to_string(event)?;
                sqlx::query(
                    "INSERT INTO pending_events (content_hash, payload_json, enqueued_at) VALUES (?, ?, ?)",
                )
                .bind(&event.content_hash)
                .bind(payload)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await.context("Failed to commit enqueued events")?;
        }

        self.check_backpressure().await
    }

    pub async fn depth(&self) -> Result<u64> {
        queue_depth(&self.store).await
    }

    /// Raise `INGESTION_BACKPRESSURE` once when depth crosses the
    /// threshold; re-arm once it falls back to or below it.
    async fn check_backpressure(&self) -> Result<()> {
        let depth = self.depth().await?;
        if depth > self.backpressure_threshold {
            if !self.backpressure_raised.swap(true, Ordering::SeqCst) {
                emit_alert(
                    &self.store,
                    Alert::new(
                        AlertCode::IngestionBackpressure,
                        format!(
                            "retry queue depth {} exceeds threshold {}",
                            depth, self.backpressure_threshold
                        ),
                        json!({ "depth": depth, "threshold": self.backpressure_threshold }),
                    ),
                )
                .await?;
            }
        } else if self.backpressure_raised.swap(false, Ordering::SeqCst) {
            info!(depth, "retry queue back under backpressure threshold");
        }
        Ok(())
    }

    /// One delivery attempt for the oldest batch.
    pub async fn drain_once(&self) -> Result<DrainOutcome> {
        let rows = {
            let mut conn = self.store.lock().await;
            sqlx::query("SELECT id, payload_json FROM pending_events ORDER BY id LIMIT ?")
                .bind(self.batch_size as i64)
                .fetch_all(&mut *conn)
                .await?
        };
        if rows.is_empty() {
            return Ok(DrainOutcome::Empty);
        }

        let mut ids = Vec::with_capacity(rows.len());
        let mut events = Vec::with_capacity(rows.len());
        let mut poisoned = Vec::new();
        for row in &rows {
            let id: i64 = row.get("id");
            let payload: String = row.get("payload_json");
            match serde_json::from_str::<NormalizedEvent>(&payload) {
                Ok(event) => {
                    ids.push(id);
                    events.push(event);
                }
                Err(e) => {
                    error!(id, error = %e, "dropping undecodable queue row");
                    poisoned.push(id);
                }
            }
        }
        if !poisoned.is_empty() {
            self.delete_rows(&poisoned).await?;
        }
        if events.is_empty() {
            return Ok(DrainOutcome::Empty);
        }

        match self.sink.write_batch(&events).await {
            Ok(receipt) => {
                self.delete_rows(&ids).await?;
                debug!(
                    sink = self.sink.name(),
                    rows = ids.len(),
                    inserted = receipt.inserted,
                    "delivered batch"
                );
                self.check_backpressure().await?;
                Ok(DrainOutcome::Delivered {
                    rows: ids.len(),
                    receipt,
                })
            }
            Err(e) => {
                warn!(sink = self.sink.name(), rows = ids.len(), error = %e, "delivery failed, batch retained");
                Ok(DrainOutcome::Retained {
                    rows: ids.len(),
                    error: e.to_string(),
                })
            }
        }
    }

    async fn delete_rows(&self, ids: &[i64]) -> Result<()> {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM pending_events WHERE id IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let mut conn = self.store.lock().await;
        qb.build().execute(&mut *conn).await?;
        Ok(())
    }
}

/// Number of events waiting for delivery.
pub async fn queue_depth(store: &Store) -> Result<u64> {
    let mut conn = store.lock().await;
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_events")
        .fetch_one(&mut *conn)
        .await?;
    Ok(n as u64)
}

/// Run [`RetryQueue::drain_once`] until `shutdown` flips. Full batches are
/// followed immediately by another attempt; anything else waits `interval`.
pub fn spawn_drain_worker(
    queue: Arc<RetryQueue>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let backlog = match queue.drain_once().await {
                Ok(DrainOutcome::Delivered { rows, .. }) => rows >= queue.batch_size(),
                Ok(_) => false,
                Err(e) => {
                    error!(error = %format!("{:#}", e), "drain cycle failed");
                    false
                }
            };
            if backlog {
                continue;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("drain worker stopped");
    })
}
