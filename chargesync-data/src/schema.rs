//! Schema management for the delta tables and the target tables.
//!
//! The delta registry and queue are owned by this crate and created by
//! [`initialise_schema`]. The station and connector tables belong to the
//! surrounding application: [`ensure_target_schema`] verifies them before any
//! queue item is applied, and [`create_target_tables`] bootstraps them for
//! standalone deployments.
#![forbid(unsafe_code)]

use rusqlite::{
    Connection, Error as SqliteError, OptionalExtension, Transaction, TransactionBehavior,
};
use thiserror::Error;

/// Version of the internal delta schema.
pub const SCHEMA_VERSION: i64 = 1;

/// Default name of the station table.
pub const DEFAULT_STATIONS_TABLE: &str = "stations";
/// Default name of the connector table.
pub const DEFAULT_CONNECTORS_TABLE: &str = "connectors";

/// Data columns of the station table in binding order, with the type used
/// when a column has to be added.
pub(crate) const STATION_COLUMNS: &[(&str, &str)] = &[
    ("uniq_key", "TEXT"),
    ("country_code", "TEXT"),
    ("operator_original", "TEXT"),
    ("operator_name", "TEXT"),
    ("operator_key", "TEXT"),
    ("station_name", "TEXT"),
    ("lat", "REAL"),
    ("lon", "REAL"),
    ("lat_5dp", "REAL"),
    ("lon_5dp", "REAL"),
    ("street", "TEXT"),
    ("postal_code", "TEXT"),
    ("city", "TEXT"),
    ("region", "TEXT"),
    ("access_type", "TEXT"),
    ("opening_hours", "TEXT"),
    ("is_24_7", "INTEGER"),
    ("payment_methods", "TEXT"),
    ("max_power_kw", "REAL"),
    ("total_connectors", "INTEGER"),
    ("evse_count", "INTEGER"),
    ("source", "TEXT"),
    ("source_dataset", "TEXT"),
    ("source_url", "TEXT"),
    ("source_as_of_date", "TEXT"),
    ("license", "TEXT"),
    ("license_url", "TEXT"),
    ("row_hash", "TEXT"),
    ("generated_at", "TEXT"),
];

/// Data columns of the connector table in binding order.
pub(crate) const CONNECTOR_COLUMNS: &[(&str, &str)] = &[
    ("connector_uid", "TEXT"),
    ("connector_index", "INTEGER"),
    ("charge_type", "TEXT"),
    ("connector_standard", "TEXT"),
    ("connector_power_kw", "REAL"),
    ("connection_method", "TEXT"),
    ("excl_group", "TEXT"),
    ("evse_uid", "TEXT"),
    ("signature", "TEXT"),
    ("source", "TEXT"),
    ("source_as_of_date", "TEXT"),
];

/// Bookkeeping columns present on both target tables.
const BOOKKEEPING_COLUMNS: &[(&str, &str)] = &[
    ("is_active", "INTEGER NOT NULL DEFAULT 1"),
    ("updated_at", "TEXT"),
];

/// Errors raised when creating or verifying schemas.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Foreign key enforcement could not be enabled.
    #[error("failed to enable SQLite foreign keys")]
    ForeignKeys {
        /// Underlying failure.
        #[source]
        source: SqliteError,
    },
    /// A migration statement failed.
    #[error("failed to execute migration step '{step}'")]
    Migration {
        /// Step that failed.
        step: &'static str,
        /// Underlying failure.
        #[source]
        source: SqliteError,
    },
    /// The database carries a different schema version.
    #[error(
        "expected delta schema version {expected} but found {found}; apply migrations before retrying"
    )]
    VersionMismatch {
        /// Version this build understands.
        expected: i64,
        /// Version recorded in the database.
        found: i64,
    },
    /// A configured table name is not a plain SQL identifier.
    #[error("invalid table name {name:?}")]
    InvalidTableName {
        /// Rejected name.
        name: String,
    },
    /// A target table does not exist.
    #[error("target table {table} does not exist")]
    MissingTable {
        /// Table name.
        table: String,
    },
    /// A target table lacks a key column that cannot be added safely.
    #[error("target table {table} lacks key column {column}")]
    MissingKeyColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: &'static str,
    },
    /// A target table could not be inspected or altered.
    #[error("failed to {operation} on target table {table}")]
    Target {
        /// Operation that failed.
        operation: &'static str,
        /// Table name.
        table: String,
        /// Underlying failure.
        #[source]
        source: SqliteError,
    },
}

/// Names of the station and connector tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetTables {
    stations: String,
    connectors: String,
}

impl Default for TargetTables {
    fn default() -> Self {
        Self {
            stations: DEFAULT_STATIONS_TABLE.to_owned(),
            connectors: DEFAULT_CONNECTORS_TABLE.to_owned(),
        }
    }
}

impl TargetTables {
    /// Validate custom table names.
    ///
    /// Names must start with a letter or underscore and contain only ASCII
    /// letters, digits and underscores.
    ///
    /// # Errors
    /// Returns [`SchemaError::InvalidTableName`] for any other name.
    ///
    /// # Examples
    /// ```
    /// use chargesync_data::TargetTables;
    ///
    /// assert!(TargetTables::new("ev_stations", "ev_connectors").is_ok());
    /// assert!(TargetTables::new("stations; DROP TABLE x", "connectors").is_err());
    /// ```
    pub fn new(stations: &str, connectors: &str) -> Result<Self, SchemaError> {
        Ok(Self {
            stations: validate_identifier(stations)?,
            connectors: validate_identifier(connectors)?,
        })
    }

    /// Station table name.
    #[must_use]
    pub fn stations(&self) -> &str {
        &self.stations
    }

    /// Connector table name.
    #[must_use]
    pub fn connectors(&self) -> &str {
        &self.connectors
    }
}

fn validate_identifier(name: &str) -> Result<String, SchemaError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_');
    if valid_start && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') && name.len() <= 64 {
        Ok(name.to_owned())
    } else {
        Err(SchemaError::InvalidTableName {
            name: name.to_owned(),
        })
    }
}

/// Create the delta tables and record the schema version.
///
/// Existing databases must already carry [`SCHEMA_VERSION`]; mismatches are
/// rejected so migrations can be applied explicitly.
///
/// # Errors
/// Returns [`SchemaError`] when a statement fails or the version differs.
///
/// # Examples
/// ```
/// use rusqlite::Connection;
/// use chargesync_data::initialise_schema;
///
/// let mut conn = Connection::open_in_memory().expect("in-memory database");
/// initialise_schema(&mut conn).expect("create delta schema");
/// initialise_schema(&mut conn).expect("idempotent");
/// ```
pub fn initialise_schema(connection: &mut Connection) -> Result<(), SchemaError> {
    connection
        .pragma_update(None, "foreign_keys", true)
        .map_err(|source| SchemaError::ForeignKeys { source })?;

    let transaction = connection
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|source| SchemaError::Migration {
            step: "begin schema transaction",
            source,
        })?;

    create_delta_tables(&transaction)?;
    ensure_schema_version(&transaction)?;

    transaction
        .commit()
        .map_err(|source| SchemaError::Migration {
            step: "commit schema transaction",
            source,
        })
}

fn create_delta_tables(transaction: &Transaction<'_>) -> Result<(), SchemaError> {
    run_migration_step(
        transaction,
        "create delta_index",
        "CREATE TABLE IF NOT EXISTS delta_index (
            uniq_key TEXT NOT NULL CHECK (length(trim(uniq_key)) > 0),
            source TEXT NOT NULL,
            source_version TEXT NOT NULL,
            row_hash TEXT NOT NULL,
            first_seen_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            PRIMARY KEY (uniq_key, source)
        ) WITHOUT ROWID",
    )?;
    run_migration_step(
        transaction,
        "create delta_queue",
        "CREATE TABLE IF NOT EXISTS delta_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            uniq_key TEXT NOT NULL,
            source TEXT NOT NULL,
            source_version TEXT NOT NULL,
            action TEXT NOT NULL CHECK (action IN ('NEW', 'CHANGED')),
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (status IN ('PENDING', 'PROCESSING', 'DONE', 'FAILED')),
            attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
            last_error TEXT,
            revision INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
    )?;
    run_migration_step(
        transaction,
        "index open delta_queue items",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_delta_queue_open
            ON delta_queue(uniq_key, source)
            WHERE status IN ('PENDING', 'PROCESSING')",
    )?;
    run_migration_step(
        transaction,
        "index delta_queue claims",
        "CREATE INDEX IF NOT EXISTS idx_delta_queue_claim
            ON delta_queue(status, source, created_at, id)",
    )
}

fn ensure_schema_version(transaction: &Transaction<'_>) -> Result<(), SchemaError> {
    run_migration_step(
        transaction,
        "create schema version table",
        "CREATE TABLE IF NOT EXISTS chargesync_schema_version (
            version INTEGER PRIMARY KEY CHECK (version > 0),
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        ) WITHOUT ROWID",
    )?;

    let existing_version: Option<i64> = transaction
        .query_row(
            "SELECT version FROM chargesync_schema_version LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|source| SchemaError::Migration {
            step: "read schema version",
            source,
        })?;

    match existing_version {
        Some(version) if version == SCHEMA_VERSION => Ok(()),
        Some(found) => Err(SchemaError::VersionMismatch {
            expected: SCHEMA_VERSION,
            found,
        }),
        None => transaction
            .execute(
                "INSERT INTO chargesync_schema_version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )
            .map(|_| ())
            .map_err(|source| SchemaError::Migration {
                step: "record schema version",
                source,
            }),
    }
}

fn run_migration_step(
    transaction: &Transaction<'_>,
    step: &'static str,
    sql: &str,
) -> Result<(), SchemaError> {
    transaction
        .execute(sql, [])
        .map(|_| ())
        .map_err(|source| SchemaError::Migration { step, source })
}

/// Create both target tables when they do not exist yet.
///
/// # Errors
/// Returns [`SchemaError::Target`] when a statement fails.
pub fn create_target_tables(
    connection: &Connection,
    tables: &TargetTables,
) -> Result<(), SchemaError> {
    let stations = tables.stations();
    let connectors = tables.connectors();
    let station_columns = column_definitions(STATION_COLUMNS);
    let connector_columns = column_definitions(CONNECTOR_COLUMNS);
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS \"{stations}\" (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            {station_columns},
            is_active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT,
            UNIQUE (uniq_key)
        );
        CREATE TABLE IF NOT EXISTS \"{connectors}\" (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            station_id INTEGER NOT NULL REFERENCES \"{stations}\"(id),
            {connector_columns},
            is_active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT,
            CHECK (connector_power_kw IS NULL OR connector_power_kw >= 0)
        );
        CREATE INDEX IF NOT EXISTS \"idx_{connectors}_station_active\"
            ON \"{connectors}\"(station_id, is_active);"
    );
    connection
        .execute_batch(&sql)
        .map_err(|source| SchemaError::Target {
            operation: "create tables",
            table: stations.to_owned(),
            source,
        })
}

fn column_definitions(columns: &[(&str, &str)]) -> String {
    columns
        .iter()
        .map(|(name, ty)| {
            if *name == "uniq_key" {
                format!("{name} {ty} NOT NULL")
            } else {
                format!("{name} {ty}")
            }
        })
        .collect::<Vec<_>>()
        .join(",\n            ")
}

/// Verify the target tables before any queue item is processed.
///
/// A missing table or key column (`id`, and `uniq_key` on stations or
/// `station_id` on connectors) is fatal. Every other missing column is added
/// with `ALTER TABLE … ADD COLUMN`. Returns the columns that were added, as
/// `table.column`.
///
/// # Errors
/// Returns [`SchemaError`] when a precondition fails or a column cannot be
/// added.
pub fn ensure_target_schema(
    connection: &Connection,
    tables: &TargetTables,
) -> Result<Vec<String>, SchemaError> {
    let mut added = ensure_table(
        connection,
        tables.stations(),
        &["id", "uniq_key"],
        STATION_COLUMNS,
    )?;
    added.extend(ensure_table(
        connection,
        tables.connectors(),
        &["id", "station_id"],
        CONNECTOR_COLUMNS,
    )?);
    Ok(added)
}

fn ensure_table(
    connection: &Connection,
    table: &str,
    keys: &[&'static str],
    columns: &[(&str, &str)],
) -> Result<Vec<String>, SchemaError> {
    let target_error = |operation: &'static str| {
        move |source| SchemaError::Target {
            operation,
            table: table.to_owned(),
            source,
        }
    };
    let existing = existing_columns(connection, table).map_err(target_error("inspect columns"))?;
    if existing.is_empty() {
        return Err(SchemaError::MissingTable {
            table: table.to_owned(),
        });
    }
    if let Some(column) = keys.iter().find(|key| !existing.iter().any(|name| name == **key)) {
        return Err(SchemaError::MissingKeyColumn {
            table: table.to_owned(),
            column,
        });
    }

    let mut added = Vec::new();
    for (name, ty) in columns.iter().chain(BOOKKEEPING_COLUMNS) {
        if existing.iter().any(|column| column == name) {
            continue;
        }
        connection
            .execute(&format!("ALTER TABLE \"{table}\" ADD COLUMN {name} {ty}"), [])
            .map_err(target_error("add column"))?;
        log::info!("added missing column {table}.{name}");
        added.push(format!("{table}.{name}"));
    }
    Ok(added)
}

fn existing_columns(connection: &Connection, table: &str) -> Result<Vec<String>, SqliteError> {
    let mut statement = connection.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let names = statement.query_map([table], |row| row.get::<_, String>(0))?;
    names.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn connection() -> Connection {
        Connection::open_in_memory().expect("open in-memory database")
    }

    #[rstest]
    fn records_schema_version(mut connection: Connection) {
        initialise_schema(&mut connection).expect("initialise");
        let version: i64 = connection
            .query_row("SELECT version FROM chargesync_schema_version", [], |row| {
                row.get(0)
            })
            .expect("version row");
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[rstest]
    fn rejects_unknown_schema_version(mut connection: Connection) {
        initialise_schema(&mut connection).expect("initialise");
        connection
            .execute("UPDATE chargesync_schema_version SET version = 99", [])
            .expect("bump version");
        let err = initialise_schema(&mut connection).expect_err("version mismatch");
        assert!(matches!(
            err,
            SchemaError::VersionMismatch {
                expected: SCHEMA_VERSION,
                found: 99
            }
        ));
    }

    #[rstest]
    #[case("stations")]
    #[case("_ev_2024")]
    fn accepts_plain_identifiers(#[case] name: &str) {
        assert!(TargetTables::new(name, "connectors").is_ok());
    }

    #[rstest]
    #[case("")]
    #[case("1stations")]
    #[case("stations\"")]
    #[case("ev stations")]
    fn rejects_unsafe_identifiers(#[case] name: &str) {
        let err = TargetTables::new(name, "connectors").expect_err("invalid name");
        assert!(matches!(err, SchemaError::InvalidTableName { .. }));
    }

    #[rstest]
    fn bootstrapped_tables_pass_the_check(connection: Connection) {
        let tables = TargetTables::default();
        create_target_tables(&connection, &tables).expect("create");
        let added = ensure_target_schema(&connection, &tables).expect("check");
        assert!(added.is_empty(), "nothing to add: {added:?}");
    }

    #[rstest]
    fn missing_table_is_fatal(connection: Connection) {
        let err = ensure_target_schema(&connection, &TargetTables::default())
            .expect_err("no tables");
        assert!(matches!(err, SchemaError::MissingTable { table } if table == "stations"));
    }

    #[rstest]
    fn missing_key_column_is_fatal(connection: Connection) {
        connection
            .execute_batch(
                "CREATE TABLE stations (id INTEGER PRIMARY KEY, uniq_key TEXT);
                 CREATE TABLE connectors (id INTEGER PRIMARY KEY, charge_type TEXT);",
            )
            .expect("legacy tables");
        let err = ensure_target_schema(&connection, &TargetTables::default())
            .expect_err("no station_id");
        assert!(matches!(
            err,
            SchemaError::MissingKeyColumn { column: "station_id", .. }
        ));
    }

    #[rstest]
    fn adds_missing_provenance_and_flag_columns(connection: Connection) {
        connection
            .execute_batch(
                "CREATE TABLE stations (id INTEGER PRIMARY KEY, uniq_key TEXT NOT NULL UNIQUE, lat REAL, lon REAL);
                 INSERT INTO stations (uniq_key, lat, lon) VALUES ('legacy', 1.0, 2.0);
                 CREATE TABLE connectors (id INTEGER PRIMARY KEY, station_id INTEGER NOT NULL);",
            )
            .expect("legacy tables");

        let added = ensure_target_schema(&connection, &TargetTables::default()).expect("check");

        for column in ["stations.is_active", "stations.license_url", "connectors.source"] {
            assert!(added.iter().any(|name| name == column), "{column} added");
        }
        let active: i64 = connection
            .query_row("SELECT is_active FROM stations WHERE uniq_key = 'legacy'", [], |row| {
                row.get(0)
            })
            .expect("legacy row");
        assert_eq!(active, 1);
        let again = ensure_target_schema(&connection, &TargetTables::default()).expect("recheck");
        assert!(again.is_empty());
    }
}
