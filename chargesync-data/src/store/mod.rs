//! SQLite implementations of the repository traits.
//!
//! One [`SqliteStore`] wraps one connection. It implements
//! [`IndexStore`](chargesync_core::IndexStore) and
//! [`QueueStore`](chargesync_core::QueueStore) directly, and
//! [`StationSink`](chargesync_core::StationSink) by opening a
//! `BEGIN IMMEDIATE` transaction per station. As a
//! [`UnitOfWork`](chargesync_core::UnitOfWork) it groups detector writes into
//! explicit transactions on the same connection. Several processes may share
//! a database file: connections use WAL journaling and a busy timeout.
#![forbid(unsafe_code)]

mod index;
mod queue;
mod target;

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chargesync_core::UnitOfWork;
use rusqlite::Connection;

use crate::error::{StoreError, sqlite};
use crate::schema::{self, TargetTables, initialise_schema};

/// How long a connection waits for a competing writer before failing.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Delta registry, delta queue and target tables behind one SQLite connection.
#[derive(Debug)]
pub struct SqliteStore {
    connection: Connection,
    path: Option<Utf8PathBuf>,
    tables: TargetTables,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and initialise the delta
    /// schema.
    ///
    /// Missing parent directories are created.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the file cannot be opened, the connection
    /// cannot be configured, or the schema version does not match.
    pub fn open(path: &Utf8Path) -> Result<Self, StoreError> {
        chargesync_fs::ensure_parent_dir(path).map_err(|source| StoreError::CreateDir {
            path: path.to_path_buf(),
            source,
        })?;
        let mut connection =
            Connection::open(path.as_std_path()).map_err(|source| StoreError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        configure(&connection)?;
        initialise_schema(&mut connection)?;
        log::debug!("opened delta store at {path}");
        Ok(Self {
            connection,
            path: Some(path.to_path_buf()),
            tables: TargetTables::default(),
        })
    }

    /// Open a private in-memory database with the delta schema.
    ///
    /// # Errors
    /// Returns [`StoreError`] when SQLite cannot allocate the database.
    ///
    /// # Examples
    /// ```
    /// use chargesync_data::SqliteStore;
    ///
    /// let store = SqliteStore::open_in_memory().expect("in-memory store");
    /// store.create_target_tables().expect("bootstrap target tables");
    /// ```
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut connection = Connection::open_in_memory().map_err(|source| StoreError::Open {
            path: Utf8PathBuf::from(":memory:"),
            source,
        })?;
        connection
            .busy_timeout(BUSY_TIMEOUT)
            .map_err(|source| StoreError::Configure {
                pragma: "busy_timeout",
                source,
            })?;
        initialise_schema(&mut connection)?;
        Ok(Self {
            connection,
            path: None,
            tables: TargetTables::default(),
        })
    }

    /// Use custom station and connector table names.
    #[must_use]
    pub fn with_target_tables(mut self, tables: TargetTables) -> Self {
        self.tables = tables;
        self
    }

    /// Configured target table names.
    #[must_use]
    pub const fn target_tables(&self) -> &TargetTables {
        &self.tables
    }

    /// Database location, or `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    /// Underlying connection, for inspection and custom queries.
    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Verify the target tables, adding any missing non-key column.
    ///
    /// Returns the added columns as `table.column`.
    ///
    /// # Errors
    /// Returns [`StoreError::Schema`] when a table or key column is missing.
    pub fn ensure_target_schema(&self) -> Result<Vec<String>, StoreError> {
        Ok(schema::ensure_target_schema(&self.connection, &self.tables)?)
    }

    /// Create the target tables when they do not exist.
    ///
    /// # Errors
    /// Returns [`StoreError::Schema`] when a statement fails.
    pub fn create_target_tables(&self) -> Result<(), StoreError> {
        Ok(schema::create_target_tables(&self.connection, &self.tables)?)
    }
}

impl UnitOfWork for SqliteStore {
    type Error = StoreError;

    fn begin(&self) -> Result<(), StoreError> {
        self.connection
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(sqlite("begin detector transaction"))
    }

    fn commit(&self) -> Result<(), StoreError> {
        self.connection
            .execute_batch("COMMIT")
            .map_err(sqlite("commit detector transaction"))
    }

    fn rollback(&self) -> Result<(), StoreError> {
        self.connection
            .execute_batch("ROLLBACK")
            .map_err(sqlite("roll back detector transaction"))
    }
}

fn configure(connection: &Connection) -> Result<(), StoreError> {
    connection
        .busy_timeout(BUSY_TIMEOUT)
        .map_err(|source| StoreError::Configure {
            pragma: "busy_timeout",
            source,
        })?;
    let mode: String = connection
        .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
        .map_err(|source| StoreError::Configure {
            pragma: "journal_mode",
            source,
        })?;
    if !mode.eq_ignore_ascii_case("wal") {
        log::warn!("SQLite kept journal mode {mode}; concurrent consumers may block");
    }
    Ok(())
}

#[cfg(test)]
mod tests;
