//! Index registry and delta queue records.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of comparing a record against the index registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Classification {
    /// First sighting of the `(uniq_key, source)` pair.
    New,
    /// Seen before with a different content hash.
    Changed,
    /// Seen before with the same content hash.
    Unchanged,
}

impl Classification {
    /// Queue action for classifications that produce work.
    #[must_use]
    pub const fn action(self) -> Option<DeltaAction> {
        match self {
            Self::New => Some(DeltaAction::New),
            Self::Changed => Some(DeltaAction::Changed),
            Self::Unchanged => None,
        }
    }
}

/// Kind of work recorded on a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeltaAction {
    /// The station was not known for this source.
    New,
    /// The station's content changed.
    Changed,
}

/// Lifecycle state of a queue item.
///
/// `PENDING --claim--> PROCESSING --success--> DONE`, and
/// `PROCESSING --failure--> FAILED`. `DONE` and `FAILED` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueueStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a consumer.
    Processing,
    /// Applied successfully.
    Done,
    /// Application failed; see the recorded error.
    Failed,
}

impl QueueStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 4] = [Self::Pending, Self::Processing, Self::Done, Self::Failed];

    /// Whether the item is still open to in-place refreshes.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }
}

/// Error returned when parsing an unknown status or action label.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} label {label:?}")]
pub struct UnknownLabel {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// Offending label.
    pub label: String,
}

macro_rules! labelled_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $ty {
            /// Stable upper-case label used in storage.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownLabel;

            fn from_str(label: &str) -> Result<Self, Self::Err> {
                match label {
                    $($label => Ok(Self::$variant),)+
                    other => Err(UnknownLabel {
                        kind: $kind,
                        label: other.to_owned(),
                    }),
                }
            }
        }
    };
}

labelled_enum!(Classification, "classification", {
    New => "NEW",
    Changed => "CHANGED",
    Unchanged => "UNCHANGED",
});
labelled_enum!(DeltaAction, "action", { New => "NEW", Changed => "CHANGED" });
labelled_enum!(QueueStatus, "status", {
    Pending => "PENDING",
    Processing => "PROCESSING",
    Done => "DONE",
    Failed => "FAILED",
});

/// Last recorded state of a station for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Station identity key.
    pub uniq_key: String,
    /// Source identifier.
    pub source: String,
    /// Version label of the import that last changed the hash.
    pub source_version: String,
    /// Last recorded content hash.
    pub row_hash: String,
    /// When the pair was last seen by the detector.
    pub last_seen_at: String,
}

/// Work to enqueue for a `NEW` or `CHANGED` station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDelta {
    /// Station identity key.
    pub uniq_key: String,
    /// Source identifier.
    pub source: String,
    /// Version label of the import.
    pub source_version: String,
    /// Why the station was queued.
    pub action: DeltaAction,
    /// Canonical station as JSON.
    pub payload: String,
}

/// Whether an enqueue created an item or refreshed an open one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// A new open item was created.
    Inserted,
    /// An existing open item was overwritten in place.
    Refreshed,
}

/// A persisted unit of pending station work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Store-assigned identifier.
    pub id: i64,
    /// Station identity key.
    pub uniq_key: String,
    /// Source identifier.
    pub source: String,
    /// Version label of the import that produced the payload.
    pub source_version: String,
    /// Why the station was queued.
    pub action: DeltaAction,
    /// Canonical station as JSON.
    pub payload: String,
    /// Current lifecycle state.
    pub status: QueueStatus,
    /// Number of failed application attempts.
    pub attempts: u32,
    /// Error recorded by the last failed attempt.
    pub last_error: Option<String>,
    /// Bumped by every in-place refresh. Terminal transitions present the
    /// revision that was claimed.
    pub revision: i64,
    /// Creation timestamp.
    pub created_at: String,
    /// Last modification timestamp.
    pub updated_at: String,
}

/// Number of queue items per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Items waiting to be claimed.
    pub pending: u64,
    /// Items claimed by a consumer.
    pub processing: u64,
    /// Items applied successfully.
    pub done: u64,
    /// Items whose application failed.
    pub failed: u64,
}

impl QueueCounts {
    /// Add `count` items in `status`.
    pub const fn record(&mut self, status: QueueStatus, count: u64) {
        match status {
            QueueStatus::Pending => self.pending += count,
            QueueStatus::Processing => self.processing += count,
            QueueStatus::Done => self.done += count,
            QueueStatus::Failed => self.failed += count,
        }
    }

    /// Items still open (pending or processing).
    #[must_use]
    pub const fn open(&self) -> u64 {
        self.pending + self.processing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(QueueStatus::Pending, "PENDING", true)]
    #[case(QueueStatus::Processing, "PROCESSING", true)]
    #[case(QueueStatus::Done, "DONE", false)]
    #[case(QueueStatus::Failed, "FAILED", false)]
    fn status_labels_round_trip(
        #[case] status: QueueStatus,
        #[case] label: &str,
        #[case] open: bool,
    ) {
        assert_eq!(status.as_str(), label);
        assert_eq!(label.parse::<QueueStatus>(), Ok(status));
        assert_eq!(status.is_open(), open);
    }

    #[rstest]
    fn unknown_label_is_rejected() {
        let err = "RETRYING".parse::<QueueStatus>().expect_err("unknown label");
        assert_eq!(err.kind, "status");
        assert_eq!(err.label, "RETRYING");
    }

    #[rstest]
    fn unchanged_produces_no_action() {
        assert_eq!(Classification::New.action(), Some(DeltaAction::New));
        assert_eq!(Classification::Changed.action(), Some(DeltaAction::Changed));
        assert_eq!(Classification::Unchanged.action(), None);
    }

    #[rstest]
    fn counts_accumulate_per_status() {
        let mut counts = QueueCounts::default();
        counts.record(QueueStatus::Pending, 2);
        counts.record(QueueStatus::Processing, 1);
        counts.record(QueueStatus::Failed, 4);
        assert_eq!(counts.open(), 3);
        assert_eq!(counts.failed, 4);
        assert_eq!(counts.done, 0);
    }
}
