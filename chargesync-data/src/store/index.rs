//! `delta_index` access.

use chargesync_core::{IndexEntry, IndexStore};
use rusqlite::OptionalExtension;

use super::SqliteStore;
use crate::error::{StoreError, sqlite};

impl IndexStore for SqliteStore {
    type Error = StoreError;

    fn find_entry(&self, uniq_key: &str, source: &str) -> Result<Option<IndexEntry>, StoreError> {
        let mut statement = self
            .connection
            .prepare_cached(
                "SELECT uniq_key, source, source_version, row_hash, last_seen_at
                 FROM delta_index
                 WHERE uniq_key = ?1 AND source = ?2",
            )
            .map_err(sqlite("prepare index lookup"))?;
        statement
            .query_row((uniq_key, source), |row| {
                Ok(IndexEntry {
                    uniq_key: row.get(0)?,
                    source: row.get(1)?,
                    source_version: row.get(2)?,
                    row_hash: row.get(3)?,
                    last_seen_at: row.get(4)?,
                })
            })
            .optional()
            .map_err(sqlite("look up index entry"))
    }

    fn record_entry(
        &self,
        uniq_key: &str,
        source: &str,
        source_version: &str,
        row_hash: &str,
    ) -> Result<(), StoreError> {
        self.connection
            .prepare_cached(concat!(
                "INSERT INTO delta_index
                    (uniq_key, source, source_version, row_hash, first_seen_at, last_seen_at)
                 VALUES (?1, ?2, ?3, ?4, ",
                sql_now!(),
                ", ",
                sql_now!(),
                ")
                 ON CONFLICT (uniq_key, source) DO UPDATE SET
                    source_version = excluded.source_version,
                    row_hash = excluded.row_hash,
                    last_seen_at = excluded.last_seen_at"
            ))
            .and_then(|mut statement| {
                statement.execute((uniq_key, source, source_version, row_hash))
            })
            .map(|_| ())
            .map_err(sqlite("record index entry"))
    }

    fn touch_entry(&self, uniq_key: &str, source: &str) -> Result<(), StoreError> {
        self.connection
            .prepare_cached(concat!(
                "UPDATE delta_index SET last_seen_at = ",
                sql_now!(),
                " WHERE uniq_key = ?1 AND source = ?2"
            ))
            .and_then(|mut statement| statement.execute((uniq_key, source)))
            .map(|_| ())
            .map_err(sqlite("touch index entry"))
    }
}
