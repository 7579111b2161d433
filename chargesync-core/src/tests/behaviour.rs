//! Behavioural coverage for detection and reconciliation using rstest-bdd.

use std::cell::{Cell, RefCell};

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};

use crate::test_support::{
    ConnectorRow, MemoryIndex, MemoryQueue, MemoryTarget, connector, ndjson, station,
};
use crate::{
    CanonicalStation, Connector, DeltaAction, DetectOptions, DetectionSummary, ProcessOptions,
    StationSink, detect_deltas, process_batch,
};

/// Stores and scenario state shared by every step.
#[derive(Default)]
struct PipelineWorld {
    index: MemoryIndex,
    queue: MemoryQueue,
    target: MemoryTarget,
    feed: RefCell<Vec<CanonicalStation>>,
    summary: Cell<Option<DetectionSummary>>,
    type2_row: Cell<Option<i64>>,
}

impl PipelineWorld {
    fn detect(&self, version: &str) {
        let stations = self.feed.borrow();
        let input = ndjson(&stations.iter().collect::<Vec<_>>());
        let summary = detect_deltas(
            input.as_bytes(),
            &self.index,
            &self.queue,
            &DetectOptions::new("cz-mpo", version),
        )
        .expect("detection run");
        self.summary.set(Some(summary));
    }

    fn summary(&self) -> DetectionSummary {
        self.summary
            .get()
            .unwrap_or_else(|| panic!("a detection run must have happened"))
    }

    fn apply(&self, connectors: Vec<Connector>) {
        let mut raw = station("PRE", 50.087_65, 14.421_2);
        raw.connectors = connectors;
        let payload = raw.canonicalize().expect("canonicalize");
        self.target.apply_station(&payload).expect("apply station");
    }

    fn row(&self, standard: &str) -> ConnectorRow {
        self.target
            .connector_rows()
            .into_iter()
            .find(|row| row.standard.as_deref() == Some(standard))
            .unwrap_or_else(|| panic!("no {standard} connector row"))
    }
}

#[fixture]
fn world() -> PipelineWorld {
    PipelineWorld::default()
}

fn distinct_stations(count: u32) -> Vec<CanonicalStation> {
    (0..count)
        .map(|n| {
            let mut raw = station("PRE, a.s.", 50.0 + f64::from(n) / 100.0, 14.4);
            raw.connectors = vec![connector("AC", "Type2", 22.0)];
            raw.canonicalize().expect("canonicalize")
        })
        .collect()
}

#[given("a feed of {count} distinct stations")]
fn feed_of(world: &PipelineWorld, count: u32) {
    world.feed.replace(distinct_stations(count));
}

#[given("a feed repeating the first of {count} distinct stations")]
fn feed_with_repeat(world: &PipelineWorld, count: u32) {
    let mut stations = distinct_stations(count);
    if let Some(first) = stations.first().cloned() {
        stations.push(first);
    }
    world.feed.replace(stations);
}

#[given("the feed has been detected and applied")]
fn detected_and_applied(world: &PipelineWorld) {
    world.detect("2024-05-01");
    process_batch(&world.queue, &world.target, &ProcessOptions::default()).expect("apply batch");
}

#[when("the feed is detected")]
fn feed_detected(world: &PipelineWorld) {
    world.detect("2024-05-01");
}

#[when("I detect the same feed again")]
fn same_feed_again(world: &PipelineWorld) {
    world.detect("2024-06-01");
}

#[when("station {position} moves to another city and I detect the feed again")]
fn station_moves(world: &PipelineWorld, position: usize) {
    {
        let mut feed = world.feed.borrow_mut();
        let target = feed
            .get_mut(position - 1)
            .unwrap_or_else(|| panic!("feed has no station {position}"));
        let mut edited = target.clone();
        edited.city = Some("Brno".into());
        *target = edited.canonicalize().expect("canonicalize");
    }
    world.detect("2024-06-01");
}

#[then("the run classifies {new} new, {changed} changed and {unchanged} unchanged rows")]
fn classified(world: &PipelineWorld, new: u64, changed: u64, unchanged: u64) {
    let summary = world.summary();
    assert_eq!(
        (summary.new, summary.changed, summary.unchanged),
        (new, changed, unchanged)
    );
}

#[then("the run reports {rows} rows and {errors} errors")]
fn rows_and_errors(world: &PipelineWorld, rows: u64, errors: u64) {
    let summary = world.summary();
    assert_eq!((summary.rows_processed, summary.errors), (rows, errors));
}

#[then("the queue holds {count} items")]
fn queue_holds(world: &PipelineWorld, count: usize) {
    assert_eq!(world.queue.items().len(), count);
}

#[then("{count} queued items have action CHANGED")]
fn changed_items(world: &PipelineWorld, count: usize) {
    let changed = world
        .queue
        .items()
        .iter()
        .filter(|item| item.action == DeltaAction::Changed)
        .count();
    assert_eq!(changed, count);
}

#[given("a station with a Type2 and a CCS2 connector has been applied")]
fn applied_type2_ccs2(world: &PipelineWorld) {
    world.apply(vec![
        connector("AC", "Type2", 22.0),
        connector("DC", "CCS2", 150.0),
    ]);
    world.type2_row.set(Some(world.row("Type2").id));
}

#[when("the station is applied with a Type2 and a CHAdeMO connector")]
fn applied_type2_chademo(world: &PipelineWorld) {
    world.apply(vec![
        connector("AC", "Type2", 22.0),
        connector("DC", "CHAdeMO", 50.0),
    ]);
}

#[then("the Type2 connector row is unchanged and active")]
fn type2_unchanged(world: &PipelineWorld) {
    let row = world.row("Type2");
    assert_eq!(Some(row.id), world.type2_row.get());
    assert!(row.is_active);
    let type2_rows = world
        .target
        .connector_rows()
        .iter()
        .filter(|candidate| candidate.standard.as_deref() == Some("Type2"))
        .count();
    assert_eq!(type2_rows, 1);
}

#[then("the CCS2 connector row is inactive")]
fn ccs2_inactive(world: &PipelineWorld) {
    assert!(!world.row("CCS2").is_active);
}

#[then("the CHAdeMO connector row is active")]
fn chademo_active(world: &PipelineWorld) {
    assert!(world.row("CHAdeMO").is_active);
}

#[scenario(path = "tests/features/delta_pipeline.feature", index = 0)]
fn identical_feed_queues_nothing(world: PipelineWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/delta_pipeline.feature", index = 1)]
fn one_field_change_queues_one_delta(world: PipelineWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/delta_pipeline.feature", index = 2)]
fn repeated_line_is_unchanged(world: PipelineWorld) {
    let _ = world;
}

#[scenario(path = "tests/features/delta_pipeline.feature", index = 3)]
fn replaced_connector_is_deactivated(world: PipelineWorld) {
    let _ = world;
}
