//! Repository interfaces for the delta pipeline.
//!
//! Each pipeline component receives the stores it needs explicitly; nothing
//! reaches for a global connection. Implementations report failures through
//! their own associated error type, which the core algorithms box together
//! with the name of the failing operation.
//!
//! - [`IndexStore`] and [`QueueStore`] are owned by the delta detector and the
//!   queue consumer.
//! - [`StationStore`] and [`ConnectorStore`] are scoped to one open
//!   transaction on the target tables and are only driven by
//!   [`reconcile_station`](crate::reconcile_station).
//! - [`StationSink`] wraps that transaction: one call, one station, commit or
//!   roll back as a unit.
//! - [`UnitOfWork`] lets the detector group the index and queue writes of
//!   many rows into one commit.

use std::error::Error as StdError;

use crate::{
    CanonicalStation, Connector, ConnectorIdentity, EnqueueOutcome, IndexEntry, NewDelta,
    QueueCounts, QueueItem, ReconcileReport,
};

/// Boxed store error carried by core error enums.
pub type BoxedStoreError = Box<dyn StdError + Send + Sync + 'static>;

/// Per-source record of the last-seen content hash of each station.
pub trait IndexStore {
    /// Failure type of the backing store.
    type Error: StdError + Send + Sync + 'static;

    /// Look up the entry for `(uniq_key, source)`.
    fn find_entry(&self, uniq_key: &str, source: &str) -> Result<Option<IndexEntry>, Self::Error>;

    /// Create or overwrite the entry with a new hash and version, bumping its
    /// last-seen timestamp.
    fn record_entry(
        &self,
        uniq_key: &str,
        source: &str,
        source_version: &str,
        row_hash: &str,
    ) -> Result<(), Self::Error>;

    /// Bump only the last-seen timestamp of an existing entry.
    fn touch_entry(&self, uniq_key: &str, source: &str) -> Result<(), Self::Error>;
}

/// Durable list of pending station changes.
///
/// At most one open (`PENDING` or `PROCESSING`) item exists per
/// `(uniq_key, source)`.
pub trait QueueStore {
    /// Failure type of the backing store.
    type Error: StdError + Send + Sync + 'static;

    /// Insert a `PENDING` item, or atomically overwrite the open item for the
    /// same key: payload, version and action are replaced, attempts and error
    /// are reset and the revision is bumped. The status is left alone, so a
    /// `PROCESSING` item stays claimed by its consumer.
    fn enqueue(&self, delta: &NewDelta) -> Result<EnqueueOutcome, Self::Error>;

    /// Claim up to `limit` of the oldest `PENDING` items, optionally for one
    /// source only.
    ///
    /// Each item moves to `PROCESSING` through a conditional update keyed by
    /// id and current status, so concurrent consumers never claim the same
    /// item.
    fn claim_batch(&self, source: Option<&str>, limit: usize)
    -> Result<Vec<QueueItem>, Self::Error>;

    /// Move a `PROCESSING` item claimed at `revision` to `DONE`.
    ///
    /// When the item was refreshed after the claim it goes back to `PENDING`
    /// instead, so the newer payload is applied by a later batch. Returns
    /// `false` in that case and when the item was not `PROCESSING`.
    fn complete(&self, id: i64, revision: i64) -> Result<bool, Self::Error>;

    /// Move a `PROCESSING` item claimed at `revision` to `FAILED`, recording
    /// `error` and incrementing its attempt counter.
    ///
    /// A refreshed item goes back to `PENDING` untouched, as in
    /// [`complete`](Self::complete). Returns `false` when no failure was
    /// recorded.
    fn fail(&self, id: i64, revision: i64, error: &str) -> Result<bool, Self::Error>;

    /// Count items per status, optionally for one source only.
    fn status_counts(&self, source: Option<&str>) -> Result<QueueCounts, Self::Error>;

    /// Operator recovery: move every key whose newest item is `FAILED` back to
    /// `PENDING`, keeping its attempt count and last error. Older failures
    /// superseded by a later item are left alone. Returns the number of items
    /// requeued.
    fn requeue_failed(&self, source: Option<&str>) -> Result<u64, Self::Error>;
}

/// Result of upserting a station row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StationUpsert {
    /// Stable internal id of the station row.
    pub station_id: i64,
    /// Whether the row was created by this upsert.
    pub inserted: bool,
}

/// An active connector row as loaded from the target table.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredConnector {
    /// Row id.
    pub id: i64,
    /// Identity attributes read back from the row.
    pub identity: ConnectorIdentity,
}

/// Station rows of the target store, scoped to one transaction.
pub trait StationStore {
    /// Failure type of the backing store.
    type Error: StdError + Send + Sync + 'static;

    /// Update the row keyed by `uniq_key` with every source-provided field, or
    /// insert it when absent.
    fn upsert_station(&self, station: &CanonicalStation) -> Result<StationUpsert, Self::Error>;
}

/// Connector rows of the target store, scoped to one transaction.
pub trait ConnectorStore {
    /// Failure type of the backing store.
    type Error: StdError + Send + Sync + 'static;

    /// Active connector rows of a station.
    fn active_connectors(&self, station_id: i64) -> Result<Vec<StoredConnector>, Self::Error>;

    /// Insert an active connector row and return its id.
    fn insert_connector(
        &self,
        station_id: i64,
        connector: &Connector,
        signature: &str,
    ) -> Result<i64, Self::Error>;

    /// Mark rows inactive. Rows are never deleted.
    fn deactivate_connectors(&self, ids: &[i64]) -> Result<(), Self::Error>;
}

/// Applies one station to the target store as a single transaction.
pub trait StationSink {
    /// Failure type of the sink.
    type Error: StdError + Send + Sync + 'static;

    /// Upsert the station and reconcile its connectors. On error nothing is
    /// persisted.
    fn apply_station(&self, station: &CanonicalStation) -> Result<ReconcileReport, Self::Error>;
}

/// Groups detector writes into units committed together.
///
/// Implementations share the connection used by the [`IndexStore`] and
/// [`QueueStore`] handed to the detector, so writes issued between
/// [`begin`](Self::begin) and [`commit`](Self::commit) land atomically.
pub trait UnitOfWork {
    /// Failure type of the backing store.
    type Error: StdError + Send + Sync + 'static;

    /// Open a unit.
    fn begin(&self) -> Result<(), Self::Error>;

    /// Make every write since [`begin`](Self::begin) durable.
    fn commit(&self) -> Result<(), Self::Error>;

    /// Discard every write since [`begin`](Self::begin).
    fn rollback(&self) -> Result<(), Self::Error>;
}

/// [`UnitOfWork`] for stores that commit every write on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct Autocommit;

impl UnitOfWork for Autocommit {
    type Error = std::convert::Infallible;

    fn begin(&self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn commit(&self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn rollback(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}
