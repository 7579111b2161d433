//! End-to-end tests driving detection and application over in-memory stores.

mod behaviour;

use crate::test_support::{MemoryIndex, MemoryQueue, MemoryTarget, connector, ndjson, station};
use crate::{
    CanonicalStation, DetectOptions, ProcessOptions, QueueStatus, QueueStore, detect_deltas,
    process_batch,
};
use rstest::rstest;

fn feed() -> Vec<CanonicalStation> {
    let mut first = station("PRE, a.s.", 50.087_65, 14.421_2);
    first.connectors = vec![
        connector("AC", "Type2", 22.0),
        connector("DC", "CCS2", 150.0),
    ];
    let mut second = station("ČEZ, a.s.", 49.195_06, 16.606_84);
    second.connectors = vec![connector("DC", "CHAdeMO", 50.0)];
    vec![
        first.canonicalize().expect("first"),
        second.canonicalize().expect("second"),
    ]
}

#[rstest]
fn detected_feed_is_applied_and_drained() {
    let (index, queue, target) = (
        MemoryIndex::default(),
        MemoryQueue::default(),
        MemoryTarget::default(),
    );
    let stations = feed();
    let input = ndjson(&stations.iter().collect::<Vec<_>>());

    let detected = detect_deltas(
        input.as_bytes(),
        &index,
        &queue,
        &DetectOptions::new("cz-mpo", "2024-05-01"),
    )
    .expect("detect");
    let applied = process_batch(&queue, &target, &ProcessOptions::default()).expect("apply");

    assert_eq!(detected.new, 2);
    assert_eq!((applied.claimed, applied.done), (2, 2));
    assert_eq!(queue.status_counts(None).expect("counts").done, 2);
    assert_eq!(target.active_standards(&stations[0].uniq_key), vec!["CCS2", "Type2"]);
    assert_eq!(target.active_standards(&stations[1].uniq_key), vec!["CHAdeMO"]);
    assert_eq!(index.len(), 2);
}

#[rstest]
fn failed_item_is_replaced_by_later_detection() {
    let (index, queue, target) = (
        MemoryIndex::default(),
        MemoryQueue::default(),
        MemoryTarget::default(),
    );
    let stations = feed();
    target.fail_connector_inserts_for(&stations[1].uniq_key);
    let input = ndjson(&stations.iter().collect::<Vec<_>>());
    let options = DetectOptions::new("cz-mpo", "2024-05-01");
    detect_deltas(input.as_bytes(), &index, &queue, &options).expect("detect");
    process_batch(&queue, &target, &ProcessOptions::default()).expect("apply");

    let mut edited = stations[1].clone();
    edited.opening_hours = Some("24/7".into());
    let edited = edited.canonicalize().expect("edited");
    let next = DetectOptions::new("cz-mpo", "2024-06-01");
    let summary = detect_deltas(ndjson(&[&edited]).as_bytes(), &index, &queue, &next)
        .expect("second detect");

    assert_eq!(summary.changed, 1);
    let statuses: Vec<QueueStatus> = queue
        .items()
        .iter()
        .filter(|item| item.uniq_key == edited.uniq_key)
        .map(|item| item.status)
        .collect();
    assert_eq!(statuses, vec![QueueStatus::Failed, QueueStatus::Pending]);
}
