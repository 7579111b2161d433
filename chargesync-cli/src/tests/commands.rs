//! In-process runs of every subcommand against a temporary database.

use super::helpers::{Workspace, invoke, report, sample_feed};
use super::*;
use chargesync_core::{DetectionSummary, ProcessSummary, QueueCounts};
use rstest::{fixture, rstest};
use serde_json::Value;

#[fixture]
fn workspace() -> Workspace {
    Workspace::new()
}

fn init(workspace: &Workspace) -> Value {
    let db = workspace.db();
    report(&invoke(&["init", "--db", db.as_str(), "--create-target-tables"]).expect("init"))
}

fn detect(workspace: &Workspace, feed: &str, version: &str) -> DetectionSummary {
    let db = workspace.db();
    let output = invoke(&[
        "detect",
        "--db",
        db.as_str(),
        "--input",
        feed,
        "--source",
        "cz-mpo",
        "--source-version",
        version,
    ])
    .expect("detect");
    report(&output)
}

fn apply(workspace: &Workspace) -> ProcessSummary {
    let db = workspace.db();
    report(&invoke(&["apply", "--db", db.as_str()]).expect("apply"))
}

#[rstest]
fn init_reports_schema_and_tables(workspace: Workspace) {
    let report = init(&workspace);
    assert_eq!(report["schema_version"], 1);
    assert_eq!(report["target_tables_ready"], true);
    assert!(chargesync_fs::file_is_file(&workspace.db()).expect("stat"));
}

#[rstest]
fn init_without_target_tables_reports_them_missing(workspace: Workspace) {
    let db = workspace.db();
    let report: Value = report(&invoke(&["init", "--db", db.as_str()]).expect("init"));
    assert_eq!(report["target_tables_ready"], false);
}

#[rstest]
fn feed_round_trip_through_every_command(workspace: Workspace) {
    init(&workspace);
    let feed = workspace.write_feed("feed.ndjson", &sample_feed(false));

    let first = detect(&workspace, feed.as_str(), "2024-05-01");
    let applied = apply(&workspace);
    let second = detect(&workspace, feed.as_str(), "2024-06-01");

    assert_eq!((first.rows_processed, first.new), (3, 3));
    assert_eq!((applied.claimed, applied.done), (3, 3));
    assert_eq!((second.unchanged, second.new, second.changed), (3, 0, 0));
    let db = workspace.db();
    let counts: QueueCounts =
        report(&invoke(&["queue-status", "--db", db.as_str()]).expect("status"));
    assert_eq!((counts.done, counts.pending, counts.failed), (3, 0, 0));
}

#[rstest]
fn failed_items_are_only_retried_on_request(workspace: Workspace) {
    init(&workspace);
    let feed = workspace.write_feed("feed.ndjson", &sample_feed(true));
    detect(&workspace, feed.as_str(), "2024-05-01");

    let applied = apply(&workspace);
    let again = apply(&workspace);
    let db = workspace.db();
    let requeued: Value = report(&invoke(&["requeue", "--db", db.as_str()]).expect("requeue"));

    assert_eq!((applied.done, applied.failed), (2, 1));
    assert_eq!(again.claimed, 0);
    assert_eq!(requeued["requeued"], 1);
    let counts: QueueCounts =
        report(&invoke(&["queue-status", "--db", db.as_str()]).expect("status"));
    assert_eq!((counts.pending, counts.failed), (1, 0));
}

#[rstest]
fn commands_refuse_a_missing_database(workspace: Workspace) {
    let db = workspace.db();
    let err = invoke(&["queue-status", "--db", db.as_str()]).expect_err("no database yet");
    assert!(matches!(err, CliError::MissingDatabase { .. }));
    assert!(err.to_string().contains("chargesync init"));
    assert!(!chargesync_fs::file_is_file(&db).expect("stat"));
}

#[rstest]
fn detect_refuses_a_missing_feed(workspace: Workspace) {
    init(&workspace);
    let db = workspace.db();
    let err = invoke(&[
        "detect",
        "--db",
        db.as_str(),
        "--input",
        "absent.ndjson",
        "--source",
        "cz-mpo",
        "--source-version",
        "v1",
    ])
    .expect_err("missing feed");
    assert!(matches!(
        err,
        CliError::MissingSourceFile {
            field: ARG_INPUT,
            ..
        }
    ));
}

#[rstest]
fn apply_reports_missing_target_tables(workspace: Workspace) {
    let db = workspace.db();
    invoke(&["init", "--db", db.as_str()]).expect("init");

    let err = invoke(&["apply", "--db", db.as_str()]).expect_err("no target tables");

    assert!(matches!(err, CliError::Pipeline(_)));
    assert!(chargesync_core::error_chain(&err).contains("does not exist"));
}

#[rstest]
fn init_propagates_target_schema_failures(workspace: Workspace) {
    let db = workspace.db();
    invoke(&["init", "--db", db.as_str()]).expect("init");
    chargesync_data::SqliteStore::open(&db)
        .expect("open")
        .connection()
        .execute_batch("CREATE VIEW stations AS SELECT 1 AS id, 'k' AS uniq_key")
        .expect("view");

    let err = invoke(&["init", "--db", db.as_str()]).expect_err("view cannot be altered");

    assert!(matches!(
        err,
        CliError::Store(chargesync_data::StoreError::Schema(
            chargesync_data::SchemaError::Target { .. }
        ))
    ));
}

#[rstest]
fn requeue_releases_stale_processing_items(workspace: Workspace) {
    use chargesync_core::QueueStore;

    init(&workspace);
    let feed = workspace.write_feed("feed.ndjson", &sample_feed(false));
    detect(&workspace, feed.as_str(), "2024-05-01");
    let db = workspace.db();
    let crashed = chargesync_data::SqliteStore::open(&db).expect("open");
    assert_eq!(crashed.claim_batch(None, 10).expect("claim").len(), 3);

    let failed_only: Value = report(&invoke(&["requeue", "--db", db.as_str()]).expect("requeue"));
    let released: Value = report(
        &invoke(&["requeue", "--db", db.as_str(), "--stale-processing", "0"])
            .expect("requeue stale"),
    );

    assert_eq!(failed_only["requeued"], 0);
    assert_eq!(released["requeued"], 3);
    assert_eq!(apply(&workspace).done, 3);
}
