use chrono::Utc;
use sqlx::Connection;
use tempfile::TempDir;

use munin_ingest::alerts::{count_alerts, AlertCode};
use munin_ingest::config::QuotaConfig;
use munin_ingest::db::Store;
use munin_ingest::migrate::run_migrations;
use munin_ingest::quota::{enforce_quota, QuotaEnforcer};

const DAY: i64 = 86_400;

async fn store(tmp: &TempDir) -> Store {
    let store = Store::open(&tmp.path().join("quota.sqlite")).await.unwrap();
    run_migrations(&store).await.unwrap();
    store
}

/// Insert `count` events with the given event and ingestion timestamps.
async fn seed(store: &Store, tag: &str, count: usize, event_ts: Option<i64>, ingested_at: i64) {
    let mut conn = store.lock().await;
    let mut tx = conn.begin().await.unwrap();
    let filler = "x".repeat(512);
    for i in 0..count {
        sqlx::query(
            r#"
            INSERT INTO events
                (source_path, source_type, line_number, event_ts, level,
                 message, attrs_json, raw_excerpt, content_hash, ingested_at)
            VALUES (?, 'raw', ?, ?, NULL, ?, '{}', ?, ?, ?)
            "#,
        )
        .bind(format!("{}.log", tag))
        .bind(i as i64)
        .bind(event_ts)
        .bind(format!("{} {} {}", tag, i, filler))
        .bind(&filler)
        .bind(format!("{}-{}", tag, i))
        .bind(ingested_at)
        .execute(&mut *tx)
        .await
        .unwrap();
    }
    tx.commit().await.unwrap();
}

async fn count_tagged(store: &Store, tag: &str) -> i64 {
    let mut conn = store.lock().await;
    sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE source_path = ?")
        .bind(format!("{}.log", tag))
        .fetch_one(&mut *conn)
        .await
        .unwrap()
}

fn tight(retention_min_days: u32) -> QuotaConfig {
    QuotaConfig {
        high_watermark_bytes: 1,
        low_watermark_bytes: 0,
        retention_min_days,
        delete_batch: 25,
        ..QuotaConfig::default()
    }
}

#[tokio::test]
async fn under_high_watermark_is_a_no_op() {
    let tmp = TempDir::new().unwrap();
    let store = store(&tmp).await;
    let old = Utc::now().timestamp() - 90 * DAY;
    seed(&store, "old", 10, Some(old), old).await;

    let report = enforce_quota(&store, &QuotaConfig::default()).await.unwrap();
    assert!(report.under_control);
    assert_eq!(report.rows_deleted, 0);
    assert_eq!(count_tagged(&store, "old").await, 10);
}

#[tokio::test]
async fn retention_floor_is_never_crossed() {
    let tmp = TempDir::new().unwrap();
    let store = store(&tmp).await;
    let now = Utc::now().timestamp();
    let old = now - 30 * DAY;
    seed(&store, "old", 60, Some(old), now).await;
    seed(&store, "recent", 40, Some(now - DAY), now).await;

    let report = QuotaEnforcer::new(store.clone(), &tight(7))
        .enforce()
        .await
        .unwrap();

    assert_eq!(report.rows_deleted, 60);
    assert_eq!(count_tagged(&store, "old").await, 0);
    assert_eq!(count_tagged(&store, "recent").await, 40);
    assert!(!report.under_control);
    assert_eq!(
        count_alerts(&store, AlertCode::StorageHigh).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn missing_event_time_falls_back_to_ingestion_time() {
    let tmp = TempDir::new().unwrap();
    let store = store(&tmp).await;
    let now = Utc::now().timestamp();
    seed(&store, "stale", 20, None, now - 20 * DAY).await;
    seed(&store, "fresh", 20, None, now).await;

    let report = enforce_quota(&store, &tight(7)).await.unwrap();

    assert_eq!(report.rows_deleted, 20);
    assert_eq!(count_tagged(&store, "stale").await, 0);
    assert_eq!(count_tagged(&store, "fresh").await, 20);
}

#[tokio::test]
async fn pruning_brings_store_back_under_high_watermark() {
    let tmp = TempDir::new().unwrap();
    let store = store(&tmp).await;
    let old = Utc::now().timestamp() - 60 * DAY;
    seed(&store, "bulk", 3000, Some(old), old).await;

    let size_before = store.size_on_disk();
    let config = QuotaConfig {
        high_watermark_bytes: size_before - 1,
        low_watermark_bytes: 0,
        retention_min_days: 7,
        delete_batch: 500,
        ..QuotaConfig::default()
    };

    let report = QuotaEnforcer::new(store.clone(), &config)
        .enforce()
        .await
        .unwrap();
    assert_eq!(report.size_before, size_before);
    assert_eq!(report.rows_deleted, 3000);
    assert!(report.size_after < size_before);
    assert!(report.under_control);
    assert_eq!(
        count_alerts(&store, AlertCode::StorageHigh).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn storage_high_alert_fires_once_while_stuck() {
    let tmp = TempDir::new().unwrap();
    let store = store(&tmp).await;
    let now = Utc::now().timestamp();
    seed(&store, "recent", 20, Some(now), now).await;

    let enforcer = QuotaEnforcer::new(store.clone(), &tight(7));
    for _ in 0..20 {
        let report = enforcer.enforce().await.unwrap();
        assert!(!report.under_control);
        assert_eq!(report.rows_deleted, 0);
    }
    assert_eq!(
        count_alerts(&store, AlertCode::StorageHigh).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn storage_high_alert_rearms_after_recovery() {
    let tmp = TempDir::new().unwrap();
    let store = store(&tmp).await;
    let now = Utc::now().timestamp();
    seed(&store, "first", 3000, Some(now), now).await;

    let config = QuotaConfig {
        high_watermark_bytes: store.size_on_disk() - 1,
        low_watermark_bytes: 0,
        retention_min_days: 7,
        delete_batch: 500,
        ..QuotaConfig::default()
    };
    let enforcer = QuotaEnforcer::new(store.clone(), &config);

    assert!(!enforcer.enforce().await.unwrap().under_control);
    assert!(!enforcer.enforce().await.unwrap().under_control);
    assert_eq!(count_alerts(&store, AlertCode::StorageHigh).await.unwrap(), 1);

    // Age the rows past the floor so they become prunable.
    {
        let mut conn = store.lock().await;
        sqlx::query("UPDATE events SET event_ts = ?")
            .bind(now - 30 * DAY)
            .execute(&mut *conn)
            .await
            .unwrap();
    }
    let report = enforcer.enforce().await.unwrap();
    assert!(report.under_control);
    assert_eq!(report.rows_deleted, 3000);

    seed(&store, "second", 6000, Some(now), now).await;
    assert!(!enforcer.enforce().await.unwrap().under_control);
    assert_eq!(count_alerts(&store, AlertCode::StorageHigh).await.unwrap(), 2);
}
