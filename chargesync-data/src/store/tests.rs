//! On-disk behaviour of [`SqliteStore`].

use std::collections::HashSet;
use std::thread;

use camino::{Utf8Path, Utf8PathBuf};
use chargesync_core::test_support::{ndjson, station};
use chargesync_core::{
    CanonicalStation, DeltaAction, DetectOptions, NewDelta, ProcessOptions, QueueStatus,
    QueueStore, StationSink, detect_deltas, process_batch,
};
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::SchemaError;

struct DbDir {
    _dir: TempDir,
    path: Utf8PathBuf,
}

#[fixture]
fn db() -> DbDir {
    let dir = TempDir::new().expect("temp dir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("state/chargesync.db"))
        .expect("utf8 temp path");
    DbDir { _dir: dir, path }
}

fn enqueue_keys(path: &Utf8Path, count: usize) {
    let store = SqliteStore::open(path).expect("open store");
    for n in 0..count {
        store
            .enqueue(&NewDelta {
                uniq_key: format!("station-{n}"),
                source: "cz-mpo".into(),
                source_version: "v1".into(),
                action: DeltaAction::New,
                payload: "{}".into(),
            })
            .expect("enqueue");
    }
}

#[rstest]
fn open_creates_parent_directories_and_uses_wal(db: DbDir) {
    let store = SqliteStore::open(&db.path).expect("open store");

    assert!(chargesync_fs::file_is_file(&db.path).expect("stat"));
    assert_eq!(store.path(), Some(db.path.as_path()));
    let mode: String = store
        .connection()
        .query_row("PRAGMA journal_mode", [], |row| row.get(0))
        .expect("journal mode");
    assert_eq!(mode.to_ascii_lowercase(), "wal");
}

#[rstest]
fn reopening_keeps_queued_work(db: DbDir) {
    enqueue_keys(&db.path, 2);
    let reopened = SqliteStore::open(&db.path).expect("reopen");
    assert_eq!(reopened.status_counts(None).expect("counts").pending, 2);
}

#[rstest]
fn reopening_a_newer_schema_fails(db: DbDir) {
    let store = SqliteStore::open(&db.path).expect("open store");
    store
        .connection()
        .execute("UPDATE chargesync_schema_version SET version = version + 1", [])
        .expect("bump version");
    drop(store);

    let err = SqliteStore::open(&db.path).expect_err("version mismatch");
    assert!(matches!(
        err,
        StoreError::Schema(SchemaError::VersionMismatch { .. })
    ));
}

#[rstest]
fn concurrent_consumers_never_claim_the_same_item(db: DbDir) {
    enqueue_keys(&db.path, 40);

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let path = db.path.clone();
            thread::spawn(move || {
                let store = SqliteStore::open(&path).expect("worker store");
                let mut claimed = Vec::new();
                loop {
                    let batch = store.claim_batch(None, 3).expect("claim");
                    if batch.is_empty() {
                        break claimed;
                    }
                    claimed.extend(batch.into_iter().map(|item| item.id));
                }
            })
        })
        .collect();

    let mut seen = HashSet::new();
    let mut total = 0;
    for worker in workers {
        for id in worker.join().expect("worker thread") {
            total += 1;
            assert!(seen.insert(id), "item {id} claimed twice");
        }
    }
    assert_eq!(total, 40);
}

fn station_in(city: &str) -> CanonicalStation {
    let mut raw = station("PRE", 50.08, 14.42);
    raw.city = Some(city.to_owned());
    raw.canonicalize().expect("canonicalize")
}

fn detect(store: &SqliteStore, station: &CanonicalStation, version: &str) -> u64 {
    let feed = ndjson(&[station]);
    detect_deltas(
        feed.as_bytes(),
        store,
        store,
        &DetectOptions::new("cz-mpo", version),
    )
    .expect("detect")
    .unchanged
}

#[rstest]
fn refresh_while_applying_is_neither_double_claimed_nor_lost(db: DbDir) {
    let detector = SqliteStore::open(&db.path).expect("detector store");
    detector.create_target_tables().expect("target tables");
    let first = SqliteStore::open(&db.path).expect("first consumer");
    let second = SqliteStore::open(&db.path).expect("second consumer");
    let old = station_in("OLD-CITY");
    let new = station_in("NEW-CITY");
    detect(&detector, &old, "v1");

    let claimed = first.claim_batch(None, 10).expect("first claim");
    let [item] = claimed.as_slice() else {
        panic!("expected one claimed item, got {claimed:?}");
    };
    detect(&detector, &new, "v2");
    let rival = process_batch(&second, &second, &ProcessOptions::default()).expect("rival");
    assert_eq!(rival.claimed, 0, "refreshed item must stay with its consumer");

    let stale = CanonicalStation::from_json(&item.payload).expect("claimed payload");
    first.apply_station(&stale).expect("apply stale payload");
    assert!(!first.complete(item.id, item.revision).expect("stale completion"));

    let retry = process_batch(&second, &second, &ProcessOptions::default()).expect("retry");
    assert_eq!((retry.claimed, retry.done), (1, 1));
    let city: Option<String> = detector
        .connection()
        .query_row(
            "SELECT city FROM stations WHERE uniq_key = ?1",
            [new.uniq_key.as_str()],
            |row| row.get(0),
        )
        .expect("station row");
    assert_eq!(city.as_deref(), Some("NEW-CITY"));
    let items = detector.queue_items(None).expect("items");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, QueueStatus::Done);
    assert_eq!(detect(&detector, &new, "v3"), 1);
}
