//! Queue consumer: claims pending deltas and applies them one by one.

use std::error::Error as StdError;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{BoxedStoreError, QueueStore, StationSink};
use crate::{CanonicalStation, QueueItem};

/// Default number of items claimed per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Parameters of one consumer batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Only claim items from this source.
    pub source: Option<String>,
    /// Maximum number of items to claim.
    pub batch_size: usize,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            source: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Outcome counters of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSummary {
    /// Items moved to `PROCESSING` by this batch.
    pub claimed: u64,
    /// Items applied and marked `DONE`.
    pub done: u64,
    /// Items marked `FAILED`.
    pub failed: u64,
    /// Items refreshed by a detection run while in flight; they are back to
    /// `PENDING` and will be applied by a later batch.
    pub superseded: u64,
}

impl ProcessSummary {
    /// Add the counters of a later batch.
    pub const fn absorb(&mut self, other: Self) {
        self.claimed += other.claimed;
        self.done += other.done;
        self.failed += other.failed;
        self.superseded += other.superseded;
    }
}

/// Errors that abort a batch.
///
/// Per-item failures never surface here; they are recorded on the item.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The queue store failed.
    #[error("failed to {operation}")]
    Queue {
        /// Operation that failed.
        operation: &'static str,
        /// Store failure.
        #[source]
        source: BoxedStoreError,
    },
}

/// Render an error and all of its sources as `outer: inner: root`.
///
/// # Examples
/// ```
/// use chargesync_core::{CanonicalStation, error_chain};
///
/// let err = CanonicalStation::from_json("{").expect_err("truncated");
/// assert!(error_chain(&err).starts_with("failed to decode station record: "));
/// ```
#[must_use]
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        current = cause.source();
    }
    message
}

/// Claim one batch and apply every claimed item through `sink`.
///
/// Each item is decoded and applied in its own transaction. Success marks the
/// item `DONE`; any decode or apply failure marks it `FAILED` with the full
/// error chain and an incremented attempt count, and the batch moves on.
/// Items whose terminal transition is refused because a detection run
/// refreshed them meanwhile are counted as superseded.
///
/// # Errors
/// Returns [`ProcessError::Queue`] when claiming or transitioning items fails.
pub fn process_batch<Q, S>(
    queue: &Q,
    sink: &S,
    options: &ProcessOptions,
) -> Result<ProcessSummary, ProcessError>
where
    Q: QueueStore,
    S: StationSink,
{
    let items = queue
        .claim_batch(options.source.as_deref(), options.batch_size)
        .map_err(queue_failure("claim batch"))?;
    let mut summary = ProcessSummary {
        claimed: u64::try_from(items.len()).unwrap_or(u64::MAX),
        ..ProcessSummary::default()
    };

    for item in &items {
        match apply_item(sink, item) {
            Ok(()) => {
                if queue
                    .complete(item.id, item.revision)
                    .map_err(queue_failure("complete item"))?
                {
                    summary.done += 1;
                } else {
                    debug!("item {} for {} was refreshed in flight", item.id, item.uniq_key);
                    summary.superseded += 1;
                }
            }
            Err(message) => {
                warn!("item {} for {} failed: {message}", item.id, item.uniq_key);
                if queue
                    .fail(item.id, item.revision, &message)
                    .map_err(queue_failure("record item failure"))?
                {
                    summary.failed += 1;
                } else {
                    summary.superseded += 1;
                }
            }
        }
    }

    info!(
        "processed batch: {} claimed, {} done, {} failed, {} superseded",
        summary.claimed, summary.done, summary.failed, summary.superseded
    );
    Ok(summary)
}

fn apply_item<S: StationSink>(sink: &S, item: &QueueItem) -> Result<(), String> {
    let station = CanonicalStation::from_json(&item.payload).map_err(|err| error_chain(&err))?;
    let report = sink
        .apply_station(&station)
        .map_err(|err| error_chain(&err))?;
    debug!(
        "applied item {} ({}): station {} {}",
        item.id,
        item.action,
        report.station_id,
        if report.station_inserted {
            "inserted"
        } else {
            "updated"
        }
    );
    Ok(())
}

fn queue_failure<E>(operation: &'static str) -> impl FnOnce(E) -> ProcessError
where
    E: StdError + Send + Sync + 'static,
{
    move |source| ProcessError::Queue {
        operation,
        source: Box::new(source),
    }
}
