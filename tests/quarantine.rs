use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tempfile::TempDir;

use munin_ingest::alerts::{count_alerts, AlertCode};
use munin_ingest::config::QuarantineConfig;
use munin_ingest::db::Store;
use munin_ingest::migrate::run_migrations;
use munin_ingest::quarantine::{note_path, QuarantineManager};

const DAY: Duration = Duration::from_secs(86_400);

struct Env {
    _tmp: TempDir,
    store: Store,
    staging: PathBuf,
    dir: PathBuf,
}

async fn env() -> Env {
    let tmp = TempDir::new().unwrap();
    let staging = tmp.path().join("processing");
    let dir = tmp.path().join("quarantine");
    fs::create_dir_all(&staging).unwrap();
    fs::create_dir_all(&dir).unwrap();
    let store = Store::open(&tmp.path().join("q.sqlite")).await.unwrap();
    run_migrations(&store).await.unwrap();
    Env {
        _tmp: tmp,
        store,
        staging,
        dir,
    }
}

fn manager(env: &Env, max_bytes: u64, retention_days: u32) -> QuarantineManager {
    QuarantineManager::new(
        env.dir.clone(),
        env.store.clone(),
        &QuarantineConfig {
            max_bytes,
            retention_days,
        },
    )
}

fn stage(env: &Env, name: &str, len: usize) -> PathBuf {
    let path = env.staging.join(name);
    fs::write(&path, vec![b'z'; len]).unwrap();
    path
}

fn age(path: &Path, by: Duration) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - by).unwrap();
}

fn pair_bytes(path: &Path) -> u64 {
    fs::metadata(path).unwrap().len() + fs::metadata(note_path(path)).unwrap().len()
}

#[tokio::test]
async fn capture_moves_file_and_records_reason() {
    let env = env().await;
    let q = manager(&env, 1 << 30, 7);
    let src = stage(&env, "broken.log", 10);

    let entry = q
        .capture(&src, Path::new("/in/broken.log"), "parser exploded")
        .await
        .unwrap();

    assert_eq!(entry.filename, "broken.log");
    assert!(!src.exists());
    let kept = env.dir.join("broken.log");
    assert!(kept.exists());
    let note = fs::read_to_string(note_path(&kept)).unwrap();
    assert!(note.contains("reason: parser exploded"));
    assert!(note.contains("original: /in/broken.log"));
    assert!(note.contains("quarantined_at: "));

    let mut conn = env.store.lock().await;
    let (filename, reason): (String, String) =
        sqlx::query_as("SELECT filename, reason FROM quarantine_entries")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
    drop(conn);
    assert_eq!(filename, "broken.log");
    assert_eq!(reason, "parser exploded");
    assert_eq!(
        count_alerts(&env.store, AlertCode::QuarantineNew)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn name_collisions_get_unique_names() {
    let env = env().await;
    let q = manager(&env, 1 << 30, 7);

    let first = q
        .capture(&stage(&env, "dup.log", 5), Path::new("dup.log"), "one")
        .await
        .unwrap();
    let second = q
        .capture(&stage(&env, "dup.log", 6), Path::new("dup.log"), "two")
        .await
        .unwrap();

    assert_eq!(first.filename, "dup.log");
    assert_ne!(second.filename, "dup.log");
    assert!(second.filename.starts_with("dup."));
    assert!(second.filename.ends_with(".log"));
    assert_eq!(q.usage().unwrap().0, 2);
}

#[tokio::test]
async fn purge_removes_files_past_retention() {
    let env = env().await;
    let q = manager(&env, 1 << 30, 7);
    q.capture(&stage(&env, "old.log", 50), Path::new("old.log"), "r")
        .await
        .unwrap();
    q.capture(&stage(&env, "new.log", 50), Path::new("new.log"), "r")
        .await
        .unwrap();

    // A renamed file keeps its writer's mtime; only the note says when it arrived.
    age(&env.dir.join("new.log"), 30 * DAY);
    age(&note_path(&env.dir.join("old.log")), 8 * DAY);

    let report = q.purge().await.unwrap();
    assert_eq!(report.expired, 1);
    assert_eq!(report.evicted, 0);
    assert!(report.bytes_freed >= 50);
    assert!(!env.dir.join("old.log").exists());
    assert!(!note_path(&env.dir.join("old.log")).exists());
    assert!(env.dir.join("new.log").exists());
}

#[tokio::test]
async fn purge_evicts_oldest_over_size_cap() {
    let env = env().await;
    let q = manager(&env, 1 << 30, 7);
    for (name, hours) in [("a.log", 3u64), ("b.log", 2), ("c.log", 1)] {
        q.capture(&stage(&env, name, 200), Path::new(name), "r")
            .await
            .unwrap();
        age(
            &note_path(&env.dir.join(name)),
            Duration::from_secs(hours * 3600),
        );
    }

    let newest = pair_bytes(&env.dir.join("c.log"));
    let capped = manager(&env, newest + 10, 7);
    let report = capped.purge().await.unwrap();

    assert_eq!(report.expired, 0);
    assert_eq!(report.evicted, 2);
    assert!(!env.dir.join("a.log").exists());
    assert!(!env.dir.join("b.log").exists());
    assert!(env.dir.join("c.log").exists());
    let (files, bytes) = capped.usage().unwrap();
    assert_eq!(files, 1);
    assert!(bytes <= newest + 10);
}

#[tokio::test]
async fn files_named_like_notes_are_still_capped() {
    let env = env().await;
    let q = manager(&env, 1 << 30, 7);
    let src = stage(&env, "audit.reason.txt", 300);
    q.capture(&src, Path::new("/in/audit.reason.txt"), "no events produced")
        .await
        .unwrap();

    let kept = env.dir.join("audit.reason.txt");
    assert!(kept.exists());
    assert!(note_path(&kept).exists());
    let (files, bytes) = q.usage().unwrap();
    assert_eq!(files, 1);
    assert_eq!(bytes, pair_bytes(&kept));

    let report = manager(&env, 0, 7).purge().await.unwrap();
    assert_eq!(report.evicted, 1);
    assert!(!kept.exists());
    assert!(!note_path(&kept).exists());
    assert_eq!(q.usage().unwrap(), (0, 0));
}

#[tokio::test]
async fn orphan_note_named_file_is_counted() {
    let env = env().await;
    let q = manager(&env, 1 << 30, 7);
    fs::write(env.dir.join("stray.reason.txt"), "left behind").unwrap();

    let (files, _) = q.usage().unwrap();
    assert_eq!(files, 1);
}
