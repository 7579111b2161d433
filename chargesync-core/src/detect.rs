//! Delta detection over a canonical NDJSON stream.
//!
//! The detector reads one `(source, version)` stream sequentially, classifies
//! every record against the index registry and enqueues work for records that
//! are new or changed. A malformed row is counted and skipped; only I/O and
//! store failures end the run.

use std::io::{self, BufRead};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{Autocommit, BoxedStoreError, IndexStore, QueueStore, UnitOfWork};
use crate::{CanonicalStation, Classification, EnqueueOutcome, IndexEntry, NewDelta};

/// Default number of decoded rows whose writes share one unit of work.
pub const DEFAULT_COMMIT_EVERY: usize = 500;

/// Parameters of one detection run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectOptions {
    /// Source identifier keying the index registry and the queue.
    pub source: String,
    /// Version label of this import (for example the dataset date).
    pub source_version: String,
    /// Stop after this many non-blank rows.
    pub limit: Option<usize>,
    /// Decoded rows per unit of work; values below 1 count as 1.
    pub commit_every: usize,
}

impl DetectOptions {
    /// Options for an unbounded run.
    pub fn new(source: impl Into<String>, source_version: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_version: source_version.into(),
            limit: None,
            commit_every: DEFAULT_COMMIT_EVERY,
        }
    }

    /// Commit detector writes every `rows` decoded rows.
    #[must_use]
    pub const fn with_commit_every(mut self, rows: usize) -> Self {
        self.commit_every = rows;
        self
    }

    /// Bound the run to the first `limit` non-blank rows.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Counters reported at the end of a detection run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionSummary {
    /// Non-blank rows read, including rows that failed to parse.
    pub rows_processed: u64,
    /// Rows classified `NEW`.
    pub new: u64,
    /// Rows classified `CHANGED`.
    pub changed: u64,
    /// Rows classified `UNCHANGED`.
    pub unchanged: u64,
    /// Rows skipped as malformed.
    pub errors: u64,
}

impl DetectionSummary {
    fn record(&mut self, classification: Classification) {
        match classification {
            Classification::New => self.new += 1,
            Classification::Changed => self.changed += 1,
            Classification::Unchanged => self.unchanged += 1,
        }
    }
}

/// Errors that abort a detection run.
#[derive(Debug, Error)]
pub enum DetectError {
    /// The input stream could not be read.
    #[error("failed to read input at line {line}")]
    Read {
        /// One-based line number being read.
        line: u64,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// A unit of work could not be opened, committed or rolled back.
    #[error("failed to {operation} detector writes (line {line})")]
    Unit {
        /// Operation that failed.
        operation: &'static str,
        /// One-based line number reached.
        line: u64,
        /// Store failure.
        #[source]
        source: BoxedStoreError,
    },
    /// The index registry or the queue failed.
    #[error("failed to {operation} for {uniq_key} (line {line})")]
    Store {
        /// Operation that failed.
        operation: &'static str,
        /// Identity key of the row being handled.
        uniq_key: String,
        /// One-based line number of the row.
        line: u64,
        /// Store failure.
        #[source]
        source: BoxedStoreError,
    },
}

/// Compare a record's content hash with the registry entry for its key.
///
/// # Examples
/// ```
/// use chargesync_core::{Classification, classify};
///
/// assert_eq!(classify(None, "abc"), Classification::New);
/// ```
#[must_use]
pub fn classify(existing: Option<&IndexEntry>, row_hash: &str) -> Classification {
    match existing {
        None => Classification::New,
        Some(entry) if entry.row_hash == row_hash => Classification::Unchanged,
        Some(_) => Classification::Changed,
    }
}

/// Classify every record of `reader` and enqueue the ones that need applying.
///
/// Index and queue rows are keyed by `options.source`, so concurrent runs for
/// different sources never touch the same rows. For `NEW` and `CHANGED` rows
/// the queue item is written before the registry entry, so a failure between
/// the two leaves the row to be detected again rather than silently dropped.
/// Blank lines are ignored and do not count towards the limit.
///
/// Every write is committed on its own; see [`detect_deltas_with`] to group
/// them.
///
/// # Errors
/// Returns [`DetectError::Read`] when the stream fails and
/// [`DetectError::Store`] when the registry or the queue fails. Malformed rows
/// are never errors; they increment [`DetectionSummary::errors`].
pub fn detect_deltas<R, I, Q>(
    reader: R,
    index: &I,
    queue: &Q,
    options: &DetectOptions,
) -> Result<DetectionSummary, DetectError>
where
    R: BufRead,
    I: IndexStore,
    Q: QueueStore,
{
    detect_deltas_with(reader, index, queue, &Autocommit, options)
}

/// [`detect_deltas`], grouping the writes of every `options.commit_every`
/// decoded rows into one unit of `unit`.
///
/// Units already committed stay committed when a later row fails; the open
/// unit is rolled back, so each row's queue item and registry entry land
/// together or not at all.
///
/// # Errors
/// As [`detect_deltas`], plus [`DetectError::Unit`] when a unit cannot be
/// opened or committed.
pub fn detect_deltas_with<R, I, Q, U>(
    mut reader: R,
    index: &I,
    queue: &Q,
    unit: &U,
    options: &DetectOptions,
) -> Result<DetectionSummary, DetectError>
where
    R: BufRead,
    I: IndexStore,
    Q: QueueStore,
    U: UnitOfWork,
{
    let mut run = DetectRun::default();
    let outcome = run.read_all(&mut reader, index, queue, unit, options);
    if let Err(err) = outcome {
        if run.unit_open {
            if let Err(rollback) = unit.rollback() {
                warn!("failed to roll back detector writes: {rollback}");
            }
        }
        return Err(err);
    }

    let summary = run.summary;
    info!(
        "detected {} rows for {}@{}: {} new, {} changed, {} unchanged, {} errors ({} open items refreshed)",
        summary.rows_processed,
        options.source,
        options.source_version,
        summary.new,
        summary.changed,
        summary.unchanged,
        summary.errors,
        run.refreshed
    );
    Ok(summary)
}

#[derive(Debug, Default)]
struct DetectRun {
    summary: DetectionSummary,
    refreshed: u64,
    line_no: u64,
    unit_open: bool,
    unit_rows: usize,
}

impl DetectRun {
    fn read_all<R, I, Q, U>(
        &mut self,
        reader: &mut R,
        index: &I,
        queue: &Q,
        unit: &U,
        options: &DetectOptions,
    ) -> Result<(), DetectError>
    where
        R: BufRead,
        I: IndexStore,
        Q: QueueStore,
        U: UnitOfWork,
    {
        let mut buf = Vec::new();
        let limit = options
            .limit
            .map(|limit| u64::try_from(limit).unwrap_or(u64::MAX));

        loop {
            if limit.is_some_and(|limit| self.summary.rows_processed >= limit) {
                break;
            }
            buf.clear();
            self.line_no += 1;
            let read = reader
                .read_until(b'\n', &mut buf)
                .map_err(|source| DetectError::Read {
                    line: self.line_no,
                    source,
                })?;
            if read == 0 {
                break;
            }
            let Some(station) = parse_row(&buf, self.line_no, &mut self.summary) else {
                continue;
            };
            if !self.unit_open {
                unit.begin().map_err(unit_failure("begin", self.line_no))?;
                self.unit_open = true;
            }
            self.handle_row(&station, trim_line(&buf), index, queue, options)?;
            self.unit_rows += 1;
            if self.unit_rows >= options.commit_every.max(1) {
                self.commit(unit)?;
            }
        }
        if self.unit_open {
            self.commit(unit)?;
        }
        Ok(())
    }

    fn handle_row<I, Q>(
        &mut self,
        station: &CanonicalStation,
        raw: &[u8],
        index: &I,
        queue: &Q,
        options: &DetectOptions,
    ) -> Result<(), DetectError>
    where
        I: IndexStore,
        Q: QueueStore,
    {
        let line_no = self.line_no;
        let existing = index
            .find_entry(&station.uniq_key, &options.source)
            .map_err(store_failure("look up index entry", &station.uniq_key, line_no))?;
        let classification = classify(existing.as_ref(), &station.row_hash);
        debug!("line {line_no}: {} {classification}", station.uniq_key);
        self.summary.record(classification);

        let Some(action) = classification.action() else {
            return index
                .touch_entry(&station.uniq_key, &options.source)
                .map_err(store_failure("touch index entry", &station.uniq_key, line_no));
        };

        let delta = NewDelta {
            uniq_key: station.uniq_key.clone(),
            source: options.source.clone(),
            source_version: options.source_version.clone(),
            action,
            payload: String::from_utf8_lossy(raw).into_owned(),
        };
        let outcome = queue
            .enqueue(&delta)
            .map_err(store_failure("enqueue delta", &station.uniq_key, line_no))?;
        if outcome == EnqueueOutcome::Refreshed {
            self.refreshed += 1;
        }
        index
            .record_entry(
                &station.uniq_key,
                &options.source,
                &options.source_version,
                &station.row_hash,
            )
            .map_err(store_failure("record index entry", &station.uniq_key, line_no))
    }

    fn commit<U: UnitOfWork>(&mut self, unit: &U) -> Result<(), DetectError> {
        unit.commit().map_err(unit_failure("commit", self.line_no))?;
        self.unit_open = false;
        self.unit_rows = 0;
        Ok(())
    }

}

fn unit_failure<E>(operation: &'static str, line: u64) -> impl FnOnce(E) -> DetectError
where
    E: std::error::Error + Send + Sync + 'static,
{
    move |source| DetectError::Unit {
        operation,
        line,
        source: Box::new(source),
    }
}

/// Decode one raw line, updating the row counters.
///
/// Returns `None` for blank lines (not counted) and malformed rows (counted as
/// errors).
fn parse_row(buf: &[u8], line_no: u64, summary: &mut DetectionSummary) -> Option<CanonicalStation> {
    let raw = trim_line(buf);
    if raw.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    summary.rows_processed += 1;
    let text = match std::str::from_utf8(raw) {
        Ok(text) => text,
        Err(err) => {
            warn!("skipping line {line_no}: not valid UTF-8: {err}");
            summary.errors += 1;
            return None;
        }
    };
    match CanonicalStation::from_json(text) {
        Ok(station) => Some(station),
        Err(err) => {
            warn!("skipping line {line_no}: {}", crate::error_chain(&err));
            summary.errors += 1;
            None
        }
    }
}

fn store_failure<E>(
    operation: &'static str,
    uniq_key: &str,
    line: u64,
) -> impl FnOnce(E) -> DetectError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let uniq_key = uniq_key.to_owned();
    move |source| DetectError::Store {
        operation,
        uniq_key,
        line,
        source: Box::new(source),
    }
}

fn trim_line(buf: &[u8]) -> &[u8] {
    let end = buf
        .iter()
        .rposition(|byte| !matches!(byte, b'\n' | b'\r'))
        .map_or(0, |last| last + 1);
    buf.get(..end).unwrap_or_default()
}
