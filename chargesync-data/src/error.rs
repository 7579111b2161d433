//! Error types raised by the SQLite stores.

use camino::Utf8PathBuf;
use chargesync_core::ReconcileError;
use rusqlite::Error as SqliteError;
use thiserror::Error;

use crate::schema::SchemaError;

/// Errors raised by [`SqliteStore`](crate::SqliteStore) operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database file could not be opened.
    #[error("failed to open SQLite database at {path}")]
    Open {
        /// Database location.
        path: Utf8PathBuf,
        /// Underlying failure.
        #[source]
        source: SqliteError,
    },
    /// The parent directory of the database could not be created.
    #[error("failed to create directory for {path}")]
    CreateDir {
        /// Database location.
        path: Utf8PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
    /// A connection pragma could not be applied.
    #[error("failed to configure SQLite connection ({pragma})")]
    Configure {
        /// Pragma or setting that failed.
        pragma: &'static str,
        /// Underlying failure.
        #[source]
        source: SqliteError,
    },
    /// Creating or checking a schema failed.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// A statement failed.
    #[error("failed to {operation}")]
    Sqlite {
        /// Operation that failed.
        operation: &'static str,
        /// Underlying failure.
        #[source]
        source: SqliteError,
    },
    /// A field could not be encoded for storage.
    #[error("failed to encode {field}")]
    Encode {
        /// Field being encoded.
        field: &'static str,
        /// Underlying failure.
        #[source]
        source: serde_json::Error,
    },
    /// A value does not fit the SQLite integer range.
    #[error("{field} value {value} is out of range")]
    OutOfRange {
        /// Field being converted.
        field: &'static str,
        /// Offending value.
        value: u64,
    },
}

/// Errors raised while applying one station transaction.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The transaction could not be started.
    #[error("failed to begin station transaction")]
    Begin {
        /// Underlying failure.
        #[source]
        source: SqliteError,
    },
    /// Upserting or reconciling failed; the transaction was rolled back.
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    /// The transaction could not be committed.
    #[error("failed to commit station transaction")]
    Commit {
        /// Underlying failure.
        #[source]
        source: SqliteError,
    },
}

pub(crate) fn sqlite(operation: &'static str) -> impl FnOnce(SqliteError) -> StoreError {
    move |source| StoreError::Sqlite { operation, source }
}
