//! Facade crate for the chargesync delta pipeline.
//!
//! This crate re-exports the core domain types and exposes the SQLite-backed
//! store behind the `store-sqlite` feature.

#![forbid(unsafe_code)]

pub use chargesync_core::{
    CanonicalStation, Classification, Connector, ConnectorStore, DeltaAction, DetectError,
    DetectOptions, DetectionSummary, IndexStore, ProcessError, ProcessOptions, ProcessSummary,
    QueueCounts, QueueItem, QueueStatus, QueueStore, ReconcileError, ReconcileReport,
    StationSink, StationStore, connector_uid, content_hash, detect_deltas, process_batch,
    reconcile_station,
};

#[cfg(feature = "store-sqlite")]
pub use chargesync_data::{
    ApplyError, PipelineError, SqliteStore, StoreError, TargetTables, apply_pending, detect_file,
};
