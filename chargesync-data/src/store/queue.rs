//! `delta_queue` access.
//!
//! Open-item uniqueness is enforced by the partial unique index
//! `idx_delta_queue_open`; every status transition is a conditional update
//! keyed by id and expected status. Refreshes bump `revision` and leave the
//! status alone; a terminal transition presenting an older revision sends the
//! item back to `PENDING`.

use std::str::FromStr;
use std::time::Duration;

use chargesync_core::{EnqueueOutcome, NewDelta, QueueCounts, QueueItem, QueueStatus, QueueStore};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row};

use super::SqliteStore;
use crate::error::{StoreError, sqlite};

impl QueueStore for SqliteStore {
    type Error = StoreError;

    fn enqueue(&self, delta: &NewDelta) -> Result<EnqueueOutcome, StoreError> {
        let revision: i64 = self
            .connection
            .prepare_cached(concat!(
                "INSERT INTO delta_queue
                    (uniq_key, source, source_version, action, payload, status,
                     attempts, revision, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'PENDING', 0, 0, ",
                sql_now!(),
                ", ",
                sql_now!(),
                ")
                 ON CONFLICT (uniq_key, source) WHERE status IN ('PENDING', 'PROCESSING')
                 DO UPDATE SET
                    source_version = excluded.source_version,
                    action = excluded.action,
                    payload = excluded.payload,
                    attempts = 0,
                    last_error = NULL,
                    revision = delta_queue.revision + 1,
                    updated_at = excluded.updated_at
                 RETURNING revision"
            ))
            .and_then(|mut statement| {
                statement.query_row(
                    (
                        delta.uniq_key.as_str(),
                        delta.source.as_str(),
                        delta.source_version.as_str(),
                        delta.action.as_str(),
                        delta.payload.as_str(),
                    ),
                    |row| row.get(0),
                )
            })
            .map_err(sqlite("enqueue delta"))?;
        Ok(if revision == 0 {
            EnqueueOutcome::Inserted
        } else {
            EnqueueOutcome::Refreshed
        })
    }

    fn claim_batch(&self, source: Option<&str>, limit: usize) -> Result<Vec<QueueItem>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).map_err(|_| StoreError::OutOfRange {
            field: "batch size",
            value: u64::try_from(limit).unwrap_or(u64::MAX),
        })?;
        let candidates = {
            let mut select = self
                .connection
                .prepare_cached(
                    "SELECT id FROM delta_queue
                     WHERE status = 'PENDING' AND (?1 IS NULL OR source = ?1)
                     ORDER BY created_at, id
                     LIMIT ?2",
                )
                .map_err(sqlite("prepare claim candidates"))?;
            let ids = select
                .query_map((source, limit), |row| row.get::<_, i64>(0))
                .map_err(sqlite("select claim candidates"))?;
            ids.collect::<Result<Vec<_>, _>>()
                .map_err(sqlite("read claim candidates"))?
        };

        let mut claim = self
            .connection
            .prepare_cached(concat!(
                "UPDATE delta_queue
                 SET status = 'PROCESSING', updated_at = ",
                sql_now!(),
                "
                 WHERE id = ?1 AND status = 'PENDING'
                 RETURNING id, uniq_key, source, source_version, action, payload, status,
                           attempts, last_error, revision, created_at, updated_at"
            ))
            .map_err(sqlite("prepare claim"))?;
        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            // Another consumer may have claimed the item since the select.
            if let Some(item) = claim
                .query_row([id], queue_item)
                .optional()
                .map_err(sqlite("claim queue item"))?
            {
                claimed.push(item);
            }
        }
        Ok(claimed)
    }

    fn complete(&self, id: i64, revision: i64) -> Result<bool, StoreError> {
        let status = self
            .connection
            .prepare_cached(concat!(
                "UPDATE delta_queue
                 SET status = CASE WHEN revision = ?2 THEN 'DONE' ELSE 'PENDING' END,
                     updated_at = ",
                sql_now!(),
                "
                 WHERE id = ?1 AND status = 'PROCESSING'
                 RETURNING status"
            ))
            .and_then(|mut statement| {
                statement
                    .query_row((id, revision), |row| row.get::<_, String>(0))
                    .optional()
            })
            .map_err(sqlite("complete queue item"))?;
        Ok(status.as_deref() == Some(QueueStatus::Done.as_str()))
    }

    fn fail(&self, id: i64, revision: i64, error: &str) -> Result<bool, StoreError> {
        let status = self
            .connection
            .prepare_cached(concat!(
                "UPDATE delta_queue
                 SET status = CASE WHEN revision = ?2 THEN 'FAILED' ELSE 'PENDING' END,
                     attempts = CASE WHEN revision = ?2 THEN attempts + 1 ELSE attempts END,
                     last_error = CASE WHEN revision = ?2 THEN ?3 ELSE last_error END,
                     updated_at = ",
                sql_now!(),
                "
                 WHERE id = ?1 AND status = 'PROCESSING'
                 RETURNING status"
            ))
            .and_then(|mut statement| {
                statement
                    .query_row((id, revision, error), |row| row.get::<_, String>(0))
                    .optional()
            })
            .map_err(sqlite("fail queue item"))?;
        Ok(status.as_deref() == Some(QueueStatus::Failed.as_str()))
    }

    fn status_counts(&self, source: Option<&str>) -> Result<QueueCounts, StoreError> {
        let mut statement = self
            .connection
            .prepare_cached(
                "SELECT status, COUNT(*) FROM delta_queue
                 WHERE ?1 IS NULL OR source = ?1
                 GROUP BY status",
            )
            .map_err(sqlite("prepare status counts"))?;
        let rows = statement
            .query_map([source], |row| {
                let status = parse_label::<QueueStatus>(row, 0)?;
                let count = u64::try_from(row.get::<_, i64>(1)?).unwrap_or_default();
                Ok((status, count))
            })
            .map_err(sqlite("count queue items"))?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let (status, count) = row.map_err(sqlite("read status counts"))?;
            counts.record(status, count);
        }
        Ok(counts)
    }

    fn requeue_failed(&self, source: Option<&str>) -> Result<u64, StoreError> {
        let requeued = self
            .connection
            .prepare_cached(concat!(
                "UPDATE delta_queue SET status = 'PENDING', updated_at = ",
                sql_now!(),
                "
                 WHERE status = 'FAILED'
                   AND (?1 IS NULL OR source = ?1)
                   AND id = (
                       SELECT MAX(newer.id) FROM delta_queue AS newer
                       WHERE newer.uniq_key = delta_queue.uniq_key
                         AND newer.source = delta_queue.source
                   )
                   AND NOT EXISTS (
                       SELECT 1 FROM delta_queue AS live
                       WHERE live.uniq_key = delta_queue.uniq_key
                         AND live.source = delta_queue.source
                         AND live.status IN ('PENDING', 'PROCESSING')
                   )"
            ))
            .and_then(|mut statement| statement.execute([source]))
            .map_err(sqlite("requeue failed items"))?;
        if requeued > 0 {
            log::info!("requeued {requeued} failed delta(s)");
        }
        Ok(u64::try_from(requeued).unwrap_or(u64::MAX))
    }
}

impl SqliteStore {
    /// Move items left `PROCESSING` for at least `older_than` back to
    /// `PENDING`, bumping their revision.
    ///
    /// Operator-only: run it once the consumer that claimed them is known to
    /// be gone. A completion that consumer still reports finds the item
    /// pending under a newer revision and is refused; the item is applied
    /// again by the next batch.
    ///
    /// # Errors
    /// Returns [`StoreError::Sqlite`] when the update fails.
    pub fn requeue_stale_processing(
        &self,
        source: Option<&str>,
        older_than: Duration,
    ) -> Result<u64, StoreError> {
        let cutoff = format!(
            "-{}.{:03} seconds",
            older_than.as_secs(),
            older_than.subsec_millis()
        );
        let requeued = self
            .connection
            .prepare_cached(concat!(
                "UPDATE delta_queue
                 SET status = 'PENDING', revision = revision + 1, updated_at = ",
                sql_now!(),
                "
                 WHERE status = 'PROCESSING'
                   AND (?1 IS NULL OR source = ?1)
                   AND updated_at <= strftime('%Y-%m-%dT%H:%M:%fZ', 'now', ?2)"
            ))
            .and_then(|mut statement| statement.execute((source, cutoff.as_str())))
            .map_err(sqlite("requeue stale processing items"))?;
        if requeued > 0 {
            log::warn!("requeued {requeued} stale processing delta(s)");
        }
        Ok(u64::try_from(requeued).unwrap_or(u64::MAX))
    }

    /// Queue items in id order, optionally for one source only.
    ///
    /// # Errors
    /// Returns [`StoreError::Sqlite`] when the query fails or a row carries an
    /// unknown status or action.
    pub fn queue_items(&self, source: Option<&str>) -> Result<Vec<QueueItem>, StoreError> {
        let mut statement = self
            .connection
            .prepare_cached(
                "SELECT id, uniq_key, source, source_version, action, payload, status,
                        attempts, last_error, revision, created_at, updated_at
                 FROM delta_queue
                 WHERE ?1 IS NULL OR source = ?1
                 ORDER BY id",
            )
            .map_err(sqlite("prepare queue listing"))?;
        let items = statement
            .query_map([source], queue_item)
            .map_err(sqlite("list queue items"))?;
        items
            .collect::<Result<Vec<_>, _>>()
            .map_err(sqlite("read queue items"))
    }
}

fn queue_item(row: &Row<'_>) -> rusqlite::Result<QueueItem> {
    Ok(QueueItem {
        id: row.get(0)?,
        uniq_key: row.get(1)?,
        source: row.get(2)?,
        source_version: row.get(3)?,
        action: parse_label(row, 4)?,
        payload: row.get(5)?,
        status: parse_label(row, 6)?,
        attempts: row.get(7)?,
        last_error: row.get(8)?,
        revision: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn parse_label<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let label: String = row.get(idx)?;
    label
        .parse()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}
