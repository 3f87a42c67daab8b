//! SQLite store handle.
//!
//! The store holds the file manifest, the retry queue, the local event
//! table, quarantine entries, and alerts in one SQLite file. SQLite gives
//! no useful concurrency between writers on one connection, so the handle
//! owns exactly one connection behind an async mutex: every query in the
//! crate goes through [`Store::lock`], and the watcher, the drain worker,
//! and quota enforcement are serialized against each other.
//!
//! # Journal and vacuum mode
//!
//! The database runs in WAL mode with `auto_vacuum = INCREMENTAL` so quota
//! enforcement can hand freed pages back to the filesystem after pruning.
//! [`Store::size_on_disk`] counts the `-wal` and `-shm` shadow files too.

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteConnection, SqliteJournalMode,
    SqliteSynchronous,
};
use sqlx::{ConnectOptions, Connection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

use crate::config::Config;

/// Cloneable handle to the single store connection.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    path: PathBuf,
    conn: Mutex<SqliteConnection>,
}

impl Store {
    /// Open (creating if missing) the database at `path`.
    ///
    /// Creates the parent directory. Does not run migrations; see
    /// [`crate::migrate::run_migrations`].
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create store directory: {}", parent.display())
                })?;
            }
        }

        let conn = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .auto_vacuum(SqliteAutoVacuum::Incremental)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .connect()
            .await
            .with_context(|| format!("Failed to open store: {}", path.display()))?;

        Ok(Self {
            inner: Arc::new(StoreInner {
                path: path.to_path_buf(),
                conn: Mutex::new(conn),
            }),
        })
    }

    /// Open the store configured in `db.path`.
    pub async fn connect(config: &Config) -> Result<Self> {
        Self::open(&config.db.path).await
    }

    /// Acquire exclusive use of the connection.
    pub async fn lock(&self) -> MutexGuard<'_, SqliteConnection> {
        self.inner.conn.lock().await
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Total bytes of the database file plus its `-wal`/`-shm` companions.
    pub fn size_on_disk(&self) -> u64 {
        db_size_bytes(&self.inner.path)
    }

    /// Close the connection, checkpointing the WAL.
    pub async fn close(self) -> Result<()> {
        match Arc::try_unwrap(self.inner) {
            Ok(inner) => {
                inner.conn.into_inner().close().await?;
            }
            Err(_) => {
                // Other handles are still alive; the last one dropped closes it.
            }
        }
        Ok(())
    }
}

/// Size of a SQLite database including shadow files. Missing files count as 0.
pub fn db_size_bytes(path: &Path) -> u64 {
    let mut total = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    for suffix in ["-wal", "-shm"] {
        let mut shadow = path.as_os_str().to_owned();
        shadow.push(suffix);
        total += std::fs::metadata(PathBuf::from(shadow))
            .map(|m| m.len())
            .unwrap_or(0);
    }
    total
}
