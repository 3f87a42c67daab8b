//! Configuration parsing and validation.
//!
//! Munin is configured from a TOML file (default `config/munin.toml`).
//! Every field has a default, so an empty file describes a working
//! pipeline rooted at the file's directory. Selected keys can be
//! overridden by `MUNIN_*` environment variables, which take precedence
//! over the file.
//!
//! ```toml
//! [paths]
//! watch_dir = "/var/munin/incoming"
//!
//! [quota]
//! high_watermark_bytes = 9663676416
//! low_watermark_bytes = 8589934592
//!
//! [sink]
//! kind = "http"
//! endpoint = "http://collector.internal:8080/ingest"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub quarantine: QuarantineConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// The three pipeline directories. Relative paths are resolved against
/// the directory holding the config file.
#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "default_watch_dir")]
    pub watch_dir: PathBuf,
    #[serde(default = "default_processing_dir")]
    pub processing_dir: PathBuf,
    #[serde(default = "default_quarantine_dir")]
    pub quarantine_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            watch_dir: default_watch_dir(),
            processing_dir: default_processing_dir(),
            quarantine_dir: default_quarantine_dir(),
        }
    }
}

fn default_watch_dir() -> PathBuf {
    PathBuf::from("incoming")
}
fn default_processing_dir() -> PathBuf {
    PathBuf::from("processing")
}
fn default_quarantine_dir() -> PathBuf {
    PathBuf::from("quarantine")
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("db/munin.sqlite")
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// OS notifications (inotify, FSEvents, ReadDirectoryChangesW).
    Native,
    /// Periodic directory polling, for network mounts without notifications.
    Poll,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IntakeConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_sniff_lines")]
    pub sniff_lines: usize,
    #[serde(default = "default_stable_checks")]
    pub stable_checks: u32,
    #[serde(default = "default_stable_interval_ms")]
    pub stable_interval_ms: u64,
    #[serde(default = "default_move_retries")]
    pub move_retries: u32,
    #[serde(default = "default_move_retry_delay_ms")]
    pub move_retry_delay_ms: u64,
    #[serde(default = "default_ignore_globs")]
    pub ignore_globs: Vec<String>,
    #[serde(default = "default_source_host")]
    pub source_host: String,
    #[serde(default = "default_source_app")]
    pub source_app: String,
    #[serde(default = "default_watch_mode")]
    pub watch_mode: WatchMode,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_rescan_interval_secs")]
    pub rescan_interval_secs: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            sniff_lines: default_sniff_lines(),
            stable_checks: default_stable_checks(),
            stable_interval_ms: default_stable_interval_ms(),
            move_retries: default_move_retries(),
            move_retry_delay_ms: default_move_retry_delay_ms(),
            ignore_globs: default_ignore_globs(),
            source_host: default_source_host(),
            source_app: default_source_app(),
            watch_mode: default_watch_mode(),
            poll_interval_ms: default_poll_interval_ms(),
            rescan_interval_secs: default_rescan_interval_secs(),
        }
    }
}

impl IntakeConfig {
    pub fn stable_interval(&self) -> Duration {
        Duration::from_millis(self.stable_interval_ms)
    }

    pub fn move_retry_delay(&self) -> Duration {
        Duration::from_millis(self.move_retry_delay_ms)
    }
}

fn default_batch_size() -> usize {
    1000
}
fn default_sniff_lines() -> usize {
    10
}
fn default_stable_checks() -> u32 {
    3
}
fn default_stable_interval_ms() -> u64 {
    150
}
fn default_move_retries() -> u32 {
    30
}
fn default_move_retry_delay_ms() -> u64 {
    100
}
fn default_ignore_globs() -> Vec<String> {
    vec![
        "*.tmp".to_string(),
        "*.partial".to_string(),
        "*.swp".to_string(),
        "*.crdownload".to_string(),
    ]
}
fn default_source_host() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}
fn default_source_app() -> String {
    "unknown-app".to_string()
}
fn default_watch_mode() -> WatchMode {
    WatchMode::Native
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_rescan_interval_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct QuotaConfig {
    #[serde(default = "default_high_watermark")]
    pub high_watermark_bytes: u64,
    #[serde(default = "default_low_watermark")]
    pub low_watermark_bytes: u64,
    #[serde(default = "default_retention_min_days")]
    pub retention_min_days: u32,
    #[serde(default = "default_delete_batch")]
    pub delete_batch: u32,
    #[serde(default = "default_quota_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            high_watermark_bytes: default_high_watermark(),
            low_watermark_bytes: default_low_watermark(),
            retention_min_days: default_retention_min_days(),
            delete_batch: default_delete_batch(),
            check_interval_secs: default_quota_check_interval_secs(),
        }
    }
}

fn default_high_watermark() -> u64 {
    9 * GIB
}
fn default_low_watermark() -> u64 {
    8 * GIB
}
fn default_retention_min_days() -> u32 {
    7
}
fn default_delete_batch() -> u32 {
    50_000
}
fn default_quota_check_interval_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct QuarantineConfig {
    #[serde(default = "default_quarantine_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_quarantine_retention_days")]
    pub retention_days: u32,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_quarantine_max_bytes(),
            retention_days: default_quarantine_retention_days(),
        }
    }
}

fn default_quarantine_max_bytes() -> u64 {
    GIB
}
fn default_quarantine_retention_days() -> u32 {
    7
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Events land in the `events` table of the local store.
    Local,
    /// Events are POSTed to `sink.endpoint`.
    Http,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SinkConfig {
    #[serde(default = "default_sink_kind")]
    pub kind: SinkKind,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: default_sink_kind(),
            endpoint: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_sink_kind() -> SinkKind {
    SinkKind::Local
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_retry_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_retry_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_backpressure_threshold")]
    pub backpressure_threshold: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_retry_interval_secs(),
            batch_size: default_retry_batch_size(),
            backpressure_threshold: default_backpressure_threshold(),
        }
    }
}

fn default_retry_interval_secs() -> u64 {
    5
}
fn default_retry_batch_size() -> usize {
    500
}
fn default_backpressure_threshold() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ShutdownConfig {
    #[serde(default = "default_shutdown_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

impl Config {
    /// A fully defaulted configuration with every path rooted at `base`.
    pub fn for_base_dir(base: &Path) -> Self {
        let mut config = Config::default();
        config.resolve_paths(base);
        config
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &PathBuf| {
            if p.is_absolute() {
                p.clone()
            } else {
                base.join(p)
            }
        };
        self.paths.watch_dir = resolve(&self.paths.watch_dir);
        self.paths.processing_dir = resolve(&self.paths.processing_dir);
        self.paths.quarantine_dir = resolve(&self.paths.quarantine_dir);
        self.db.path = resolve(&self.db.path);
    }

    /// Apply `MUNIN_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("invalid value for {}: {}", key, e))
        }

        if let Some(v) = lookup("MUNIN_WATCH_DIR") {
            self.paths.watch_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("MUNIN_PROCESSING_DIR") {
            self.paths.processing_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("MUNIN_QUARANTINE_DIR") {
            self.paths.quarantine_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("MUNIN_DB_PATH") {
            self.db.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("MUNIN_BATCH_SIZE") {
            self.intake.batch_size = parse("MUNIN_BATCH_SIZE", v)?;
        }
        if let Some(v) = lookup("MUNIN_SOURCE_HOST") {
            self.intake.source_host = v;
        }
        if let Some(v) = lookup("MUNIN_SOURCE_APP") {
            self.intake.source_app = v;
        }
        if let Some(v) = lookup("MUNIN_WATCH_MODE") {
            self.intake.watch_mode = match v.trim() {
                "native" => WatchMode::Native,
                "poll" => WatchMode::Poll,
                other => bail!("invalid value for MUNIN_WATCH_MODE: '{}'", other),
            };
        }
        if let Some(v) = lookup("MUNIN_DB_HIGH_WATERMARK") {
            self.quota.high_watermark_bytes = parse("MUNIN_DB_HIGH_WATERMARK", v)?;
        }
        if let Some(v) = lookup("MUNIN_DB_LOW_WATERMARK") {
            self.quota.low_watermark_bytes = parse("MUNIN_DB_LOW_WATERMARK", v)?;
        }
        if let Some(v) = lookup("MUNIN_RETENTION_MIN_DAYS") {
            self.quota.retention_min_days = parse("MUNIN_RETENTION_MIN_DAYS", v)?;
        }
        if let Some(v) = lookup("MUNIN_QUARANTINE_MAX_BYTES") {
            self.quarantine.max_bytes = parse("MUNIN_QUARANTINE_MAX_BYTES", v)?;
        }
        if let Some(v) = lookup("MUNIN_QUARANTINE_RETENTION_DAYS") {
            self.quarantine.retention_days = parse("MUNIN_QUARANTINE_RETENTION_DAYS", v)?;
        }
        if let Some(v) = lookup("MUNIN_SINK_KIND") {
            self.sink.kind = match v.trim() {
                "local" => SinkKind::Local,
                "http" => SinkKind::Http,
                other => bail!("invalid value for MUNIN_SINK_KIND: '{}'", other),
            };
        }
        if let Some(v) = lookup("MUNIN_SINK_ENDPOINT") {
            self.sink.endpoint = Some(v);
        }
        if let Some(v) = lookup("MUNIN_RETRY_INTERVAL_SECS") {
            self.retry.interval_secs = parse("MUNIN_RETRY_INTERVAL_SECS", v)?;
        }
        if let Some(v) = lookup("MUNIN_RETRY_BATCH_SIZE") {
            self.retry.batch_size = parse("MUNIN_RETRY_BATCH_SIZE", v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.intake.batch_size == 0 {
            bail!("intake.batch_size must be > 0");
        }
        if self.intake.sniff_lines == 0 {
            bail!("intake.sniff_lines must be > 0");
        }
        if self.intake.stable_checks == 0 {
            bail!("intake.stable_checks must be > 0");
        }
        if self.retry.batch_size == 0 {
            bail!("retry.batch_size must be > 0");
        }
        if self.quota.delete_batch == 0 {
            bail!("quota.delete_batch must be > 0");
        }
        if self.intake.rescan_interval_secs == 0 || self.quota.check_interval_secs == 0 {
            bail!("intake.rescan_interval_secs and quota.check_interval_secs must be > 0");
        }
        if self.intake.poll_interval_ms == 0 {
            bail!("intake.poll_interval_ms must be > 0");
        }
        if self.retry.interval_secs == 0 {
            bail!("retry.interval_secs must be > 0");
        }
        if self.quota.low_watermark_bytes > self.quota.high_watermark_bytes {
            bail!(
                "quota.low_watermark_bytes ({}) must be <= quota.high_watermark_bytes ({})",
                self.quota.low_watermark_bytes,
                self.quota.high_watermark_bytes
            );
        }
        if self.sink.kind == SinkKind::Http && self.sink.endpoint.is_none() {
            bail!("sink.endpoint must be set when sink.kind is 'http'");
        }
        let dirs = [
            &self.paths.watch_dir,
            &self.paths.processing_dir,
            &self.paths.quarantine_dir,
        ];
        for (i, a) in dirs.iter().enumerate() {
            for b in dirs.iter().skip(i + 1) {
                if a == b {
                    bail!("paths must be distinct: {} is used twice", a.display());
                }
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    config.apply_env_overrides()?;

    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    config.resolve_paths(base);

    config.validate()?;
    Ok(config)
}
