//! Station upsert and connector reconciliation.
//!
//! Connectors are matched by [`connector_signature`], not by position, so a
//! feed that reorders its connectors produces no writes. Connectors that
//! disappear from the feed are deactivated, never deleted.

use std::collections::HashMap;

use log::debug;
use serde::Serialize;
use thiserror::Error;

use crate::hash::connector_signature;
use crate::store::{BoxedStoreError, ConnectorStore, StationStore};
use crate::CanonicalStation;

/// Summary of one station reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Internal id of the station row.
    pub station_id: i64,
    /// Whether the station row was created.
    pub station_inserted: bool,
    /// Active connectors left untouched.
    pub retained: usize,
    /// Connectors inserted as new active rows.
    pub inserted: usize,
    /// Previously active connectors marked inactive.
    pub deactivated: usize,
}

/// Errors raised while reconciling a station.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Upserting the station row failed.
    #[error("failed to upsert station {uniq_key}")]
    Station {
        /// Identity key of the station.
        uniq_key: String,
        /// Store failure.
        #[source]
        source: BoxedStoreError,
    },
    /// A connector read or write failed.
    #[error("failed to {operation} for station {uniq_key}")]
    Connector {
        /// Operation that failed.
        operation: &'static str,
        /// Identity key of the station.
        uniq_key: String,
        /// Store failure.
        #[source]
        source: BoxedStoreError,
    },
}

/// Upsert `station` and make its active connector set match the payload.
///
/// Existing active rows are indexed by signature. Each incoming connector
/// consumes one matching row, which is retained unchanged; incoming
/// connectors without a match are inserted. Whatever remains unmatched is
/// deactivated. Duplicate signatures are matched one-for-one.
///
/// The caller owns the transaction; on error it must roll back.
///
/// # Errors
/// Returns [`ReconcileError`] when any store operation fails.
pub fn reconcile_station<S>(
    store: &S,
    station: &CanonicalStation,
) -> Result<ReconcileReport, ReconcileError>
where
    S: StationStore + ConnectorStore,
{
    let upsert = StationStore::upsert_station(store, station).map_err(|source| {
        ReconcileError::Station {
            uniq_key: station.uniq_key.clone(),
            source: Box::new(source),
        }
    })?;
    let connector_error = |operation: &'static str| {
        let uniq_key = station.uniq_key.clone();
        move |source: <S as ConnectorStore>::Error| ReconcileError::Connector {
            operation,
            uniq_key,
            source: Box::new(source),
        }
    };

    let existing = store
        .active_connectors(upsert.station_id)
        .map_err(connector_error("load active connectors"))?;
    let mut stale: HashMap<String, Vec<i64>> = HashMap::new();
    for row in existing {
        stale
            .entry(connector_signature(&row.identity))
            .or_default()
            .push(row.id);
    }

    let mut report = ReconcileReport {
        station_id: upsert.station_id,
        station_inserted: upsert.inserted,
        ..ReconcileReport::default()
    };
    for connector in &station.connectors {
        let signature = connector_signature(&connector.identity());
        let matched = stale.get_mut(&signature).and_then(Vec::pop);
        if matched.is_some() {
            report.retained += 1;
        } else {
            store
                .insert_connector(upsert.station_id, connector, &signature)
                .map_err(connector_error("insert connector"))?;
            report.inserted += 1;
        }
    }

    let mut to_deactivate: Vec<i64> = stale.into_values().flatten().collect();
    to_deactivate.sort_unstable();
    if !to_deactivate.is_empty() {
        store
            .deactivate_connectors(&to_deactivate)
            .map_err(connector_error("deactivate connectors"))?;
    }
    report.deactivated = to_deactivate.len();

    debug!(
        "reconciled {}: retained {}, inserted {}, deactivated {}",
        station.uniq_key, report.retained, report.inserted, report.deactivated
    );
    Ok(report)
}
