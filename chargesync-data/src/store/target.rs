//! Station and connector writes on the target tables.
//!
//! Each [`StationSink::apply_station`] call opens a `BEGIN IMMEDIATE`
//! transaction, runs [`reconcile_station`] against a transaction-scoped
//! store, and commits only when every write succeeded.

use chargesync_core::{
    CanonicalStation, Connector, ConnectorIdentity, ConnectorStore, ReconcileReport, StationSink,
    StationStore, StationUpsert, StoredConnector, reconcile_station,
};
use rusqlite::types::ToSql;
use rusqlite::{OptionalExtension, Transaction, TransactionBehavior, params_from_iter};

use super::SqliteStore;
use crate::error::{ApplyError, StoreError, sqlite};
use crate::schema::{CONNECTOR_COLUMNS, STATION_COLUMNS, TargetTables};

impl StationSink for SqliteStore {
    type Error = ApplyError;

    fn apply_station(&self, station: &CanonicalStation) -> Result<ReconcileReport, ApplyError> {
        let transaction =
            Transaction::new_unchecked(&self.connection, TransactionBehavior::Immediate)
                .map_err(|source| ApplyError::Begin { source })?;
        let scoped = TargetTransaction {
            transaction: &transaction,
            tables: &self.tables,
        };
        // Dropping the transaction on error rolls it back.
        let report = reconcile_station(&scoped, station)?;
        transaction
            .commit()
            .map_err(|source| ApplyError::Commit { source })?;
        Ok(report)
    }
}

/// Target tables seen through one open transaction.
struct TargetTransaction<'tx, 'conn> {
    transaction: &'tx Transaction<'conn>,
    tables: &'tx TargetTables,
}

impl StationStore for TargetTransaction<'_, '_> {
    type Error = StoreError;

    fn upsert_station(&self, station: &CanonicalStation) -> Result<StationUpsert, StoreError> {
        let table = self.tables.stations();
        let payment_methods =
            serde_json::to_string(&station.payment_methods).map_err(|source| {
                StoreError::Encode {
                    field: "payment_methods",
                    source,
                }
            })?;
        let values = station_values(station, &payment_methods);

        let existing: Option<i64> = self
            .transaction
            .prepare_cached(&format!("SELECT id FROM \"{table}\" WHERE uniq_key = ?1"))
            .and_then(|mut statement| {
                statement
                    .query_row([station.uniq_key.as_str()], |row| row.get(0))
                    .optional()
            })
            .map_err(sqlite("look up station"))?;

        if let Some(station_id) = existing {
            let assignments = STATION_COLUMNS
                .iter()
                .enumerate()
                .map(|(position, (name, _))| format!("{name} = ?{}", position + 1))
                .collect::<Vec<_>>()
                .join(", ");
            let id_param = STATION_COLUMNS.len() + 1;
            let sql = format!(
                "UPDATE \"{table}\" SET {assignments}, is_active = 1, updated_at = {} WHERE id = ?{id_param}",
                sql_now!()
            );
            let params = values.iter().copied().chain([&station_id as &dyn ToSql]);
            self.transaction
                .prepare_cached(&sql)
                .and_then(|mut statement| statement.execute(params_from_iter(params)))
                .map_err(sqlite("update station"))?;
            return Ok(StationUpsert {
                station_id,
                inserted: false,
            });
        }

        let sql = format!(
            "INSERT INTO \"{table}\" ({}, is_active, updated_at) VALUES ({}, 1, {})",
            column_list(STATION_COLUMNS),
            placeholders(1, STATION_COLUMNS.len()),
            sql_now!()
        );
        self.transaction
            .prepare_cached(&sql)
            .and_then(|mut statement| statement.execute(params_from_iter(values.iter().copied())))
            .map_err(sqlite("insert station"))?;
        Ok(StationUpsert {
            station_id: self.transaction.last_insert_rowid(),
            inserted: true,
        })
    }
}

impl ConnectorStore for TargetTransaction<'_, '_> {
    type Error = StoreError;

    fn active_connectors(&self, station_id: i64) -> Result<Vec<StoredConnector>, StoreError> {
        let table = self.tables.connectors();
        let mut statement = self
            .transaction
            .prepare_cached(&format!(
                "SELECT id, charge_type, connector_standard, connector_power_kw,
                        connection_method, excl_group
                 FROM \"{table}\"
                 WHERE station_id = ?1 AND is_active = 1
                 ORDER BY id"
            ))
            .map_err(sqlite("prepare active connector query"))?;
        let rows = statement
            .query_map([station_id], |row| {
                Ok(StoredConnector {
                    id: row.get(0)?,
                    identity: ConnectorIdentity {
                        charge_type: row.get(1)?,
                        connector_standard: row.get(2)?,
                        connector_power_kw: row.get(3)?,
                        connection_method: row.get(4)?,
                        excl_group: row.get(5)?,
                    },
                })
            })
            .map_err(sqlite("load active connectors"))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(sqlite("read active connectors"))
    }

    fn insert_connector(
        &self,
        station_id: i64,
        connector: &Connector,
        signature: &str,
    ) -> Result<i64, StoreError> {
        let table = self.tables.connectors();
        let sql = format!(
            "INSERT INTO \"{table}\" (station_id, {}, is_active, updated_at) VALUES (?1, {}, 1, {})",
            column_list(CONNECTOR_COLUMNS),
            placeholders(2, CONNECTOR_COLUMNS.len()),
            sql_now!()
        );
        let values: [&dyn ToSql; 12] = [
            &station_id,
            &connector.connector_uid,
            &connector.connector_index,
            &connector.charge_type,
            &connector.connector_standard,
            &connector.connector_power_kw,
            &connector.connection_method,
            &connector.excl_group,
            &connector.evse_uid,
            &signature,
            &connector.source,
            &connector.source_as_of_date,
        ];
        self.transaction
            .prepare_cached(&sql)
            .and_then(|mut statement| statement.execute(params_from_iter(values)))
            .map_err(sqlite("insert connector"))?;
        Ok(self.transaction.last_insert_rowid())
    }

    fn deactivate_connectors(&self, ids: &[i64]) -> Result<(), StoreError> {
        let table = self.tables.connectors();
        let mut statement = self
            .transaction
            .prepare_cached(&format!(
                "UPDATE \"{table}\" SET is_active = 0, updated_at = {}
                 WHERE id = ?1 AND is_active = 1",
                sql_now!()
            ))
            .map_err(sqlite("prepare connector deactivation"))?;
        for id in ids {
            statement
                .execute([id])
                .map_err(sqlite("deactivate connector"))?;
        }
        Ok(())
    }
}

fn station_values<'a>(
    station: &'a CanonicalStation,
    payment_methods: &'a String,
) -> [&'a dyn ToSql; 29] {
    [
        &station.uniq_key,
        &station.country_code,
        &station.operator_original,
        &station.operator_name,
        &station.operator_key,
        &station.station_name,
        &station.lat,
        &station.lon,
        &station.lat_5dp,
        &station.lon_5dp,
        &station.street,
        &station.postal_code,
        &station.city,
        &station.region,
        &station.access_type,
        &station.opening_hours,
        &station.is_24_7,
        payment_methods,
        &station.max_power_kw,
        &station.total_connectors,
        &station.evse_count,
        &station.source,
        &station.source_dataset,
        &station.source_url,
        &station.source_as_of_date,
        &station.license,
        &station.license_url,
        &station.row_hash,
        &station.generated_at,
    ]
}

fn column_list(columns: &[(&str, &str)]) -> String {
    columns
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ")
}

fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|position| format!("?{position}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chargesync_core::test_support::{connector, station};
    use rstest::{fixture, rstest};

    #[fixture]
    fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().expect("in-memory store");
        store.create_target_tables().expect("target tables");
        store
    }

    fn with_connectors(connectors: Vec<Connector>) -> CanonicalStation {
        let mut raw = station("PRE", 50.087_65, 14.421_2);
        raw.connectors = connectors;
        raw.canonicalize().expect("canonicalize")
    }

    fn active_standards(store: &SqliteStore) -> Vec<String> {
        let mut statement = store
            .connection()
            .prepare("SELECT connector_standard FROM connectors WHERE is_active = 1 ORDER BY 1")
            .expect("prepare");
        statement
            .query_map([], |row| row.get(0))
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("rows")
    }

    fn connector_rows(store: &SqliteStore) -> i64 {
        store
            .connection()
            .query_row("SELECT COUNT(*) FROM connectors", [], |row| row.get(0))
            .expect("count")
    }

    #[rstest]
    fn first_apply_inserts_station_and_connectors(store: SqliteStore) {
        let payload = with_connectors(vec![
            connector("AC", "Type2", 22.0),
            connector("DC", "CCS2", 150.0),
        ]);

        let report = store.apply_station(&payload).expect("apply");

        assert!(report.station_inserted);
        assert_eq!((report.inserted, report.retained, report.deactivated), (2, 0, 0));
        let (uniq_key, payments, active): (String, String, i64) = store
            .connection()
            .query_row(
                "SELECT uniq_key, payment_methods, is_active FROM stations WHERE id = ?1",
                [report.station_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .expect("station row");
        assert_eq!(uniq_key, payload.uniq_key);
        assert!(payments.starts_with('['));
        assert_eq!(active, 1);
    }

    #[rstest]
    fn replaced_connector_is_deactivated_not_deleted(store: SqliteStore) {
        let before = with_connectors(vec![
            connector("AC", "Type2", 22.0),
            connector("DC", "CCS2", 150.0),
        ]);
        let first = store.apply_station(&before).expect("first apply");
        let after = with_connectors(vec![
            connector("AC", "Type2", 22.0),
            connector("DC", "CHAdeMO", 50.0),
        ]);

        let report = store.apply_station(&after).expect("second apply");

        assert_eq!(report.station_id, first.station_id);
        assert!(!report.station_inserted);
        assert_eq!((report.retained, report.inserted, report.deactivated), (1, 1, 1));
        assert_eq!(active_standards(&store), ["CHAdeMO", "Type2"]);
        assert_eq!(connector_rows(&store), 3);
    }

    #[rstest]
    fn reapplying_a_reordered_payload_writes_no_connectors(store: SqliteStore) {
        let payload = with_connectors(vec![
            connector("AC", "Type2", 22.0),
            connector("DC", "CCS2", 150.0),
        ]);
        store.apply_station(&payload).expect("first apply");
        let reordered = with_connectors(vec![
            connector("DC", "CCS2", 150.0),
            connector("AC", "Type2", 22.0),
        ]);

        let report = store.apply_station(&reordered).expect("second apply");

        assert_eq!((report.retained, report.inserted, report.deactivated), (2, 0, 0));
        assert_eq!(connector_rows(&store), 2);
    }

    #[rstest]
    fn constraint_violation_rolls_back_the_station(store: SqliteStore) {
        let payload = with_connectors(vec![
            connector("AC", "Type2", 22.0),
            connector("DC", "CCS2", -1.0),
        ]);

        let err = store.apply_station(&payload).expect_err("negative power rejected");

        assert!(matches!(err, ApplyError::Reconcile(_)));
        let stations: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM stations", [], |row| row.get(0))
            .expect("count");
        assert_eq!(stations, 0);
        assert_eq!(connector_rows(&store), 0);
    }

    #[rstest]
    fn custom_table_names_are_honoured() {
        let tables = TargetTables::new("ev_stations", "ev_connectors").expect("valid names");
        let store = SqliteStore::open_in_memory()
            .expect("in-memory store")
            .with_target_tables(tables);
        store.create_target_tables().expect("target tables");

        store
            .apply_station(&with_connectors(vec![connector("AC", "Type2", 22.0)]))
            .expect("apply");

        let rows: i64 = store
            .connection()
            .query_row("SELECT COUNT(*) FROM ev_connectors", [], |row| row.get(0))
            .expect("count");
        assert_eq!(rows, 1);
    }
}
