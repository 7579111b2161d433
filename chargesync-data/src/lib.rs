//! SQLite persistence for the chargesync delta pipeline.
//!
//! Responsibilities:
//! - Own the `delta_index` and `delta_queue` schema and its version check.
//! - Implement the repository traits of `chargesync-core` on SQLite.
//! - Verify (or bootstrap) the station and connector target tables.
//! - Open detector input, plain or bzip2-compressed.
//!
//! Boundaries:
//! - Classification, hashing and reconciliation rules live in
//!   `chargesync-core`; this crate only stores and loads.
//!
//! Invariants:
//! - At most one open queue item per `(uniq_key, source)`, enforced by a
//!   partial unique index.
//! - Every station is applied in its own `BEGIN IMMEDIATE` transaction.

/// SQL expression producing an ISO 8601 UTC timestamp with milliseconds.
macro_rules! sql_now {
    () => {
        "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')"
    };
}

mod error;
mod input;
mod schema;
mod store;


use camino::Utf8Path;
use chargesync_core::{
    DetectError, DetectOptions, DetectionSummary, ProcessError, ProcessOptions, ProcessSummary,
    detect_deltas_with, process_batch,
};
use thiserror::Error;

pub use error::{ApplyError, StoreError};
pub use input::{InputError, open_ndjson};
pub use schema::{
    DEFAULT_CONNECTORS_TABLE, DEFAULT_STATIONS_TABLE, SCHEMA_VERSION, SchemaError, TargetTables,
    create_target_tables, ensure_target_schema, initialise_schema,
};
pub use store::{BUSY_TIMEOUT, SqliteStore};

/// Errors raised by the file-level pipeline helpers.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The input file could not be opened.
    #[error(transparent)]
    Input(#[from] InputError),
    /// The store rejected a precondition check.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The detection run aborted.
    #[error(transparent)]
    Detect(#[from] DetectError),
    /// The queue consumer aborted.
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Run the delta detector over an NDJSON file (plain or bzip2).
///
/// Queue and index writes are committed every `options.commit_every` rows.
///
/// # Errors
/// Returns [`PipelineError::Input`] when the file cannot be opened and
/// [`PipelineError::Detect`] when the read or the store fails mid-run.
/// Malformed rows are counted, not raised.
pub fn detect_file(
    store: &SqliteStore,
    path: &Utf8Path,
    options: &DetectOptions,
) -> Result<DetectionSummary, PipelineError> {
    let reader = open_ndjson(path)?;
    log::info!(
        "detecting deltas in {path} for source {} version {}",
        options.source,
        options.source_version
    );
    Ok(detect_deltas_with(reader, store, store, store, options)?)
}

/// Apply pending queue items until the queue drains or `max_batches` batches
/// have run.
///
/// The target tables are verified first; a missing table or key column aborts
/// before any item is claimed.
///
/// # Errors
/// Returns [`PipelineError::Store`] when the target schema check fails and
/// [`PipelineError::Process`] when the queue itself fails.
pub fn apply_pending(
    store: &SqliteStore,
    options: &ProcessOptions,
    max_batches: Option<usize>,
) -> Result<ProcessSummary, PipelineError> {
    for column in store.ensure_target_schema()? {
        log::info!("target schema: added column {column}");
    }

    let mut total = ProcessSummary::default();
    let mut batches = 0_usize;
    while max_batches.is_none_or(|limit| batches < limit) {
        let summary = process_batch(store, store, options)?;
        batches += 1;
        total.absorb(summary);
        // Stop once a batch made no terminal progress.
        if summary.claimed == 0 || summary.claimed == summary.superseded {
            break;
        }
    }
    log::info!(
        "applied {batches} batch(es): {} done, {} failed, {} superseded",
        total.done,
        total.failed,
        total.superseded
    );
    Ok(total)
}
