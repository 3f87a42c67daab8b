//! Pipeline statistics and health overview.
//!
//! A quick summary of where files and events are: manifest counts per
//! status, retry queue depth, the local event table, store size against
//! the quota watermarks, quarantine usage, and the most recent alerts.
//! Used by `munin stats` to check that intake and delivery are keeping up.

use anyhow::Result;
use sqlx::Row;

use crate::alerts::recent_alerts;
use crate::config::Config;
use crate::db::Store;
use crate::manifest::count_by_status;
use crate::models::FileStatus;
use crate::quarantine::QuarantineManager;
use crate::queue::queue_depth;

const RECENT_ALERTS: i64 = 5;

/// Everything `munin stats` prints, gathered in one pass.
#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub files: Vec<(FileStatus, i64)>,
    pub queue_depth: u64,
    pub events: i64,
    pub oldest_event_ts: Option<i64>,
    pub store_bytes: u64,
    pub quarantined_files: usize,
    pub quarantined_bytes: u64,
    pub recent_alerts: Vec<(String, String, i64)>,
}

impl PipelineStats {
    pub fn files_with(&self, status: FileStatus) -> i64 {
        self.files
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

pub async fn collect_stats(config: &Config, store: &Store) -> Result<PipelineStats> {
    let files = count_by_status(store).await?;
    let depth = queue_depth(store).await?;

    let (events, oldest_event_ts) = {
        let mut conn = store.lock().await;
        let row = sqlx::query(
            "SELECT COUNT(*) AS n, MIN(COALESCE(event_ts, ingested_at)) AS oldest FROM events",
        )
        .fetch_one(&mut *conn)
        .await?;
        (row.get::<i64, _>("n"), row.get::<Option<i64>, _>("oldest"))
    };

    let quarantine = QuarantineManager::new(
        &config.paths.quarantine_dir,
        store.clone(),
        &config.quarantine,
    );
    let (quarantined_files, quarantined_bytes) = quarantine.usage()?;

    Ok(PipelineStats {
        files,
        queue_depth: depth,
        events,
        oldest_event_ts,
        store_bytes: store.size_on_disk(),
        quarantined_files,
        quarantined_bytes,
        recent_alerts: recent_alerts(store, RECENT_ALERTS).await?,
    })
}

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let store = Store::connect(config).await?;
    crate::migrate::run_migrations(&store).await?;
    let stats = collect_stats(config, &store).await?;

    println!("Munin Pipeline Stats");
    println!("====================");
    println!();
    println!("  Store:       {}", config.db.path.display());
    println!(
        "  Size:        {} (high {}, low {})",
        format_bytes(stats.store_bytes),
        format_bytes(config.quota.high_watermark_bytes),
        format_bytes(config.quota.low_watermark_bytes)
    );
    println!();
    println!("  Files:");
    for status in [
        FileStatus::Processing,
        FileStatus::Committed,
        FileStatus::Deleted,
        FileStatus::Error,
    ] {
        println!("    {:<12} {:>8}", status.as_str(), stats.files_with(status));
    }
    println!();
    println!("  Queue depth: {}", stats.queue_depth);
    println!(
        "  Events:      {}{}",
        stats.events,
        match stats.oldest_event_ts {
            Some(ts) => format!(" (oldest {})", format_ts_relative(ts)),
            None => String::new(),
        }
    );
    println!(
        "  Quarantine:  {} file{}, {} (cap {})",
        stats.quarantined_files,
        if stats.quarantined_files == 1 { "" } else { "s" },
        format_bytes(stats.quarantined_bytes),
        format_bytes(config.quarantine.max_bytes)
    );

    if !stats.recent_alerts.is_empty() {
        println!();
        println!("  Recent alerts:");
        println!("  {:<24} {:<16} {}", "CODE", "WHEN", "MESSAGE");
        println!("  {}", "-".repeat(76));
        for (code, message, created_at) in &stats.recent_alerts {
            println!(
                "  {:<24} {:<16} {}",
                code,
                format_ts_relative(*created_at),
                message
            );
        }
    }

    println!();

    store.close().await?;
    Ok(())
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
