//! Core of the charging-station delta pipeline.
//!
//! Canonical station records flow through three stages:
//!
//! 1. [`canonical`] and [`hash`] reduce a record to a stable identity key and a
//!    content hash.
//! 2. [`detect_deltas`] classifies each record of an NDJSON stream as `NEW`,
//!    `CHANGED` or `UNCHANGED` against an [`IndexStore`] and enqueues work on a
//!    [`QueueStore`].
//! 3. [`process_batch`] claims queued work and applies it through a
//!    [`StationSink`], which upserts the station and reconciles its connectors
//!    with [`reconcile_station`] inside one transaction.
//!
//! Storage is abstracted behind the traits in [`store`]; the SQLite
//! implementation lives in the `chargesync-data` crate.

pub mod canonical;
mod delta;
mod detect;
pub mod hash;
mod process;
mod reconcile;
mod station;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
#[cfg(test)]
mod tests;

pub use canonical::{CanonicalizeError, identity_key, operator_key, round_coordinate};
pub use delta::{
    Classification, DeltaAction, EnqueueOutcome, IndexEntry, NewDelta, QueueCounts, QueueItem,
    QueueStatus, UnknownLabel,
};
pub use detect::{
    DEFAULT_COMMIT_EVERY, DetectError, DetectOptions, DetectionSummary, classify, detect_deltas,
    detect_deltas_with,
};
pub use hash::{ConnectorIdentity, HashError, connector_signature, connector_uid, content_hash};
pub use process::{
    DEFAULT_BATCH_SIZE, ProcessError, ProcessOptions, ProcessSummary, error_chain, process_batch,
};
pub use reconcile::{ReconcileError, ReconcileReport, reconcile_station};
pub use station::{CanonicalStation, Connector, StationError};
pub use store::{
    Autocommit, BoxedStoreError, ConnectorStore, IndexStore, QueueStore, StationSink,
    StationStore, StationUpsert, StoredConnector, UnitOfWork,
};
