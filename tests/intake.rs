use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use munin_ingest::alerts::{count_alerts, AlertCode};
use munin_ingest::config::{Config, WatchMode};
use munin_ingest::intake::{Intake, IntakeOutcome, NO_EVENTS_REASON};
use munin_ingest::manifest;
use munin_ingest::models::{FileStatus, NormalizedEvent};
use munin_ingest::normalize::{normalize, EventDraft};
use munin_ingest::parsers::{BinaryParser, ParserRegistry};
use munin_ingest::queue::DrainOutcome;
use munin_ingest::watcher::{run_pipeline, Pipeline};
use tempfile::TempDir;

fn test_config(root: &Path) -> Config {
    let mut config = Config::for_base_dir(root);
    config.intake.stable_checks = 2;
    config.intake.stable_interval_ms = 10;
    config.intake.move_retry_delay_ms = 10;
    config.intake.source_host = "test-host".to_string();
    config.intake.source_app = "test-app".to_string();
    config
}

async fn open(root: &Path) -> Pipeline {
    Pipeline::open(test_config(root)).await.unwrap()
}

async fn drain_all(pipeline: &Pipeline) {
    while !matches!(pipeline.queue.drain_once().await.unwrap(), DrainOutcome::Empty) {}
}

async fn events_of_type(pipeline: &Pipeline, source_type: &str) -> i64 {
    let mut conn = pipeline.store.lock().await;
    sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE source_type = ?")
        .bind(source_type)
        .fetch_one(&mut *conn)
        .await
        .unwrap()
}

async fn file_record_count(pipeline: &Pipeline) -> i64 {
    let mut conn = pipeline.store.lock().await;
    sqlx::query_scalar("SELECT COUNT(*) FROM file_records")
        .fetch_one(&mut *conn)
        .await
        .unwrap()
}

fn dir_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn jsonl_file_is_parsed_committed_and_deleted() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(tmp.path()).await;
    let watch = &pipeline.config.paths.watch_dir;

    let path = watch.join("app.log");
    fs::write(
        &path,
        "{\"ts\":\"2024-05-01T10:00:00Z\",\"level\":\"info\",\"msg\":\"started\"}\n\
         this line is not json\n\
         {\"ts\":\"2024-05-01T10:00:01Z\",\"level\":\"error\",\"msg\":\"failed\"}\n",
    )
    .unwrap();

    let outcome = pipeline.intake.process_incoming(&path).await.unwrap();
    let IntakeOutcome::Committed { file_id, events } = outcome else {
        panic!("expected commit, got {:?}", outcome);
    };
    assert_eq!(events, 2);

    assert!(!path.exists());
    assert!(dir_names(&pipeline.config.paths.processing_dir).is_empty());

    let record = manifest::get(&pipeline.store, file_id).await.unwrap();
    assert_eq!(record.status, FileStatus::Deleted);
    assert_eq!(record.relative_path, "app.log");
    assert_eq!(record.source_host, "test-host");
    assert!(record.completed_at.is_some());

    assert_eq!(pipeline.queue.depth().await.unwrap(), 2);
    drain_all(&pipeline).await;
    assert_eq!(pipeline.queue.depth().await.unwrap(), 0);
    assert_eq!(events_of_type(&pipeline, "jsonl").await, 2);
}

#[tokio::test]
async fn duplicate_content_is_ingested_once() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(tmp.path()).await;
    let watch = &pipeline.config.paths.watch_dir;
    let body = "Jan  5 10:00:00 web01 sshd[42]: Accepted publickey for deploy\n";

    let first = watch.join("first.log");
    fs::write(&first, body).unwrap();
    let IntakeOutcome::Committed { file_id, .. } =
        pipeline.intake.process_incoming(&first).await.unwrap()
    else {
        panic!("first copy should commit");
    };

    let second = watch.join("second.log");
    fs::write(&second, body).unwrap();
    let outcome = pipeline.intake.process_incoming(&second).await.unwrap();
    assert_eq!(outcome, IntakeOutcome::DuplicateDropped { file_id });

    assert!(!second.exists());
    assert!(dir_names(&pipeline.config.paths.processing_dir).is_empty());
    assert!(dir_names(&pipeline.config.paths.quarantine_dir).is_empty());
    assert_eq!(file_record_count(&pipeline).await, 1);
    assert_eq!(pipeline.queue.depth().await.unwrap(), 1);
}

#[tokio::test]
async fn empty_file_is_quarantined_with_reason() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(tmp.path()).await;
    let path = pipeline.config.paths.watch_dir.join("empty.log");
    fs::write(&path, "").unwrap();

    let outcome = pipeline.intake.process_incoming(&path).await.unwrap();
    assert_eq!(
        outcome,
        IntakeOutcome::Quarantined {
            reason: NO_EVENTS_REASON.to_string()
        }
    );

    let quarantine = &pipeline.config.paths.quarantine_dir;
    assert_eq!(
        dir_names(quarantine),
        vec!["empty.log".to_string(), "empty.log.reason.txt".to_string()]
    );
    let note = fs::read_to_string(quarantine.join("empty.log.reason.txt")).unwrap();
    assert!(note.contains("no events produced"));
    assert!(note.contains("empty.log"));

    let counts = manifest::count_by_status(&pipeline.store).await.unwrap();
    assert_eq!(counts, vec![(FileStatus::Error, 1)]);
    assert_eq!(
        count_alerts(&pipeline.store, AlertCode::QuarantineNew)
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn ignored_suffixes_stay_put() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(tmp.path()).await;
    let path = pipeline.config.paths.watch_dir.join("upload.PARTIAL");
    fs::write(&path, "half a line").unwrap();

    let outcome = pipeline.intake.process_incoming(&path).await.unwrap();
    assert_eq!(outcome, IntakeOutcome::Ignored);
    assert!(path.exists());
    assert_eq!(file_record_count(&pipeline).await, 0);
}

#[tokio::test]
async fn files_left_in_processing_are_recovered() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(tmp.path()).await;
    let stranded = pipeline.config.paths.processing_dir.join("crash.log");
    fs::write(
        &stranded,
        "2024-03-01 12:00:00 ERROR payment declined user=ana\n\
         2024-03-01 12:00:01 INFO retry scheduled\n",
    )
    .unwrap();

    let outcomes = pipeline.intake.recover_processing().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        outcomes[0],
        IntakeOutcome::Committed { events: 2, .. }
    ));
    assert!(!stranded.exists());

    drain_all(&pipeline).await;
    assert_eq!(events_of_type(&pipeline, "txt").await, 2);
}

#[tokio::test]
async fn scan_picks_up_everything_waiting() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(tmp.path()).await;
    let watch = &pipeline.config.paths.watch_dir;
    fs::write(watch.join("a.csv"), "time,level,msg\n2024-01-01T00:00:00Z,INFO,hello\n").unwrap();
    fs::write(watch.join("b.log"), "{\"msg\":\"one\"}\n").unwrap();
    fs::write(watch.join("c.tmp"), "ignored").unwrap();

    let outcomes = pipeline.intake.scan_incoming().await.unwrap();
    let committed = outcomes
        .iter()
        .filter(|o| matches!(o, IntakeOutcome::Committed { .. }))
        .count();
    assert_eq!(committed, 2);
    assert_eq!(dir_names(watch), vec!["c.tmp".to_string()]);

    drain_all(&pipeline).await;
    assert_eq!(events_of_type(&pipeline, "csv").await, 1);
    assert_eq!(events_of_type(&pipeline, "jsonl").await, 1);
}

#[tokio::test]
async fn running_pipeline_ingests_dropped_files_and_stops_on_signal() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.intake.watch_mode = WatchMode::Poll;
    config.intake.poll_interval_ms = 50;
    config.intake.rescan_interval_secs = 1;
    config.retry.interval_secs = 1;
    config.shutdown.timeout_secs = 5;
    let watch = config.paths.watch_dir.clone();
    let db_path = config.db.path.clone();

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(run_pipeline(config, rx));

    // The pipeline creates the watch directory on start.
    let dropped = watch.join("late.log");
    let mut delivered = 0i64;
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if watch.is_dir() && !dropped.exists() && delivered == 0 {
            fs::write(&dropped, "{\"level\":\"warn\",\"msg\":\"disk slow\"}\n").unwrap();
            delivered = -1;
            continue;
        }
        if delivered == -1 && !dropped.exists() {
            let store = munin_ingest::db::Store::open(&db_path).await.unwrap();
            let n: i64 = {
                let mut conn = store.lock().await;
                sqlx::query_scalar("SELECT COUNT(*) FROM events")
                    .fetch_one(&mut *conn)
                    .await
                    .unwrap()
            };
            store.close().await.unwrap();
            if n == 1 {
                delivered = n;
                break;
            }
        }
    }
    assert_eq!(delivered, 1, "event never reached the local sink");

    tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(15), handle)
        .await
        .expect("pipeline did not stop")
        .unwrap();
    assert!(result.is_ok());
}

async fn record_ids(pipeline: &Pipeline) -> Vec<i64> {
    let mut conn = pipeline.store.lock().await;
    sqlx::query_scalar("SELECT id FROM file_records ORDER BY id")
        .fetch_all(&mut *conn)
        .await
        .unwrap()
}

const TRUNCATED_MAGIC: &[u8] = b"TRUNCLOG";

/// Emits one event, then fails the way a corrupt binary log does.
struct TruncatedLogParser;

impl BinaryParser for TruncatedLogParser {
    fn source_type(&self) -> &'static str {
        "trunclog"
    }

    fn magic(&self) -> &'static [u8] {
        TRUNCATED_MAGIC
    }

    fn parse_file(
        &self,
        _path: &Path,
        source_path: &str,
        _batch_size: usize,
        emit: &mut dyn FnMut(Vec<NormalizedEvent>) -> anyhow::Result<()>,
    ) -> anyhow::Result<u64> {
        emit(vec![normalize(EventDraft {
            source_path: source_path.to_string(),
            source_type: "trunclog".to_string(),
            line_number: 1,
            message: "first record".to_string(),
            attrs: BTreeMap::new(),
            ..EventDraft::default()
        })])?;
        anyhow::bail!("corrupt record at offset 4096")
    }
}

fn intake_with_truncated_parser(pipeline: &Pipeline) -> Intake {
    let mut registry = ParserRegistry::builtin();
    registry.register_binary(Arc::new(TruncatedLogParser));
    Intake::new(
        Arc::clone(&pipeline.config),
        pipeline.store.clone(),
        Arc::new(registry),
        Arc::clone(&pipeline.queue),
    )
    .unwrap()
}

fn truncated_log_bytes() -> Vec<u8> {
    let mut body = TRUNCATED_MAGIC.to_vec();
    body.extend_from_slice(b"\nrecord one\nrecord two\n");
    body
}

#[tokio::test]
async fn stale_notification_after_move_is_ignored() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(tmp.path()).await;
    let path = pipeline.config.paths.watch_dir.join("once.log");
    fs::write(&path, "{\"msg\":\"only once\"}\n").unwrap();

    let (a, b) = tokio::join!(
        pipeline.intake.process_incoming(&path),
        pipeline.intake.process_incoming(&path),
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    let committed = outcomes
        .iter()
        .filter(|o| matches!(o, IntakeOutcome::Committed { .. }))
        .count();
    assert_eq!(committed, 1, "outcomes: {:?}", outcomes);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, IntakeOutcome::Committed { .. } | IntakeOutcome::Ignored | IntakeOutcome::Abandoned)));
    assert_eq!(file_record_count(&pipeline).await, 1);

    let ids = record_ids(&pipeline).await;
    let outcome = pipeline.intake.process_incoming(&path).await.unwrap();
    assert_eq!(outcome, IntakeOutcome::Ignored);
    assert_eq!(record_ids(&pipeline).await, ids);
    assert_eq!(pipeline.queue.depth().await.unwrap(), 1);
}

#[tokio::test]
async fn file_still_growing_is_abandoned_in_place() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(tmp.path()).await;
    let path = pipeline.config.paths.watch_dir.join("busy.log");
    fs::write(&path, "2024-01-01 00:00:00 INFO start\n").unwrap();

    let writer_path = path.clone();
    let writer = tokio::spawn(async move {
        for i in 0..500 {
            let mut file = fs::OpenOptions::new()
                .append(true)
                .open(&writer_path)
                .unwrap();
            writeln!(file, "2024-01-01 00:00:01 INFO tick {}", i).unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    let outcome = pipeline.intake.process_incoming(&path).await.unwrap();
    writer.abort();

    assert_eq!(outcome, IntakeOutcome::Abandoned);
    assert!(path.exists());
    assert!(dir_names(&pipeline.config.paths.processing_dir).is_empty());
    assert_eq!(file_record_count(&pipeline).await, 0);
}

#[tokio::test]
async fn file_removed_while_settling_is_abandoned() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.intake.stable_checks = 5;
    config.intake.stable_interval_ms = 50;
    let pipeline = Pipeline::open(config).await.unwrap();
    let path = pipeline.config.paths.watch_dir.join("fleeting.log");
    fs::write(&path, "{\"msg\":\"gone soon\"}\n").unwrap();

    let doomed = path.clone();
    let remover = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        fs::remove_file(&doomed).unwrap();
    });

    let outcome = pipeline.intake.process_incoming(&path).await.unwrap();
    remover.await.unwrap();

    assert_eq!(outcome, IntakeOutcome::Abandoned);
    assert_eq!(file_record_count(&pipeline).await, 0);
    assert!(dir_names(&pipeline.config.paths.quarantine_dir).is_empty());
}

#[tokio::test]
async fn parse_error_quarantines_with_error_text() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(tmp.path()).await;
    let intake = intake_with_truncated_parser(&pipeline);
    let path = pipeline.config.paths.watch_dir.join("Security.bin");
    fs::write(&path, truncated_log_bytes()).unwrap();

    let outcome = intake.process_incoming(&path).await.unwrap();
    let IntakeOutcome::Quarantined { reason } = outcome else {
        panic!("expected quarantine, got {:?}", outcome);
    };
    assert!(reason.contains("corrupt record at offset 4096"), "reason: {}", reason);
    assert_ne!(reason, NO_EVENTS_REASON);

    let quarantine = &pipeline.config.paths.quarantine_dir;
    assert_eq!(
        dir_names(quarantine),
        vec!["Security.bin".to_string(), "Security.bin.reason.txt".to_string()]
    );
    let note = fs::read_to_string(quarantine.join("Security.bin.reason.txt")).unwrap();
    assert!(note.contains("corrupt record at offset 4096"));

    let counts = manifest::count_by_status(&pipeline.store).await.unwrap();
    assert_eq!(counts, vec![(FileStatus::Error, 1)]);
    // Events handed over before the failure stay queued.
    assert_eq!(pipeline.queue.depth().await.unwrap(), 1);
}

#[tokio::test]
async fn redrop_after_error_reuses_the_record() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(tmp.path()).await;
    let watch = &pipeline.config.paths.watch_dir;

    let failing = intake_with_truncated_parser(&pipeline);
    let first = watch.join("retry.bin");
    fs::write(&first, truncated_log_bytes()).unwrap();
    assert!(matches!(
        failing.process_incoming(&first).await.unwrap(),
        IntakeOutcome::Quarantined { .. }
    ));
    let ids = record_ids(&pipeline).await;
    assert_eq!(ids.len(), 1);

    // Same bytes again, now through the built-in parsers.
    let second = watch.join("retry-again.bin");
    fs::write(&second, truncated_log_bytes()).unwrap();
    let outcome = pipeline.intake.process_incoming(&second).await.unwrap();
    let IntakeOutcome::Committed { file_id, events } = outcome else {
        panic!("expected commit, got {:?}", outcome);
    };
    assert_eq!(file_id, ids[0]);
    assert!(events > 0);
    assert_eq!(record_ids(&pipeline).await, ids);

    let record = manifest::get(&pipeline.store, file_id).await.unwrap();
    assert_eq!(record.status, FileStatus::Deleted);
    assert_eq!(record.relative_path, "retry-again.bin");
}
