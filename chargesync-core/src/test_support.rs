//! In-memory stores and record builders used by unit and behaviour tests.
//!
//! The stores share their state through `Rc`, so a clone observes and mutates
//! the same data. None of them is meant for production use.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::rc::Rc;

use thiserror::Error;

use crate::store::{
    ConnectorStore, IndexStore, QueueStore, StationSink, StationStore, StationUpsert,
    StoredConnector,
};
use crate::{
    CanonicalStation, Connector, ConnectorIdentity, EnqueueOutcome, IndexEntry, NewDelta,
    QueueCounts, QueueItem, QueueStatus, ReconcileError, ReconcileReport, reconcile_station,
};

/// Raw (not yet canonicalized) station operated by `operator` at `lat`/`lon`.
#[must_use]
pub fn station(operator: &str, lat: f64, lon: f64) -> CanonicalStation {
    CanonicalStation {
        uniq_key: String::new(),
        country_code: Some("CZ".into()),
        operator_original: Some(operator.into()),
        operator_name: Some(operator.into()),
        operator_key: String::new(),
        station_name: None,
        lat,
        lon,
        lat_5dp: 0.0,
        lon_5dp: 0.0,
        street: None,
        postal_code: None,
        city: None,
        region: None,
        access_type: Some("public".into()),
        opening_hours: None,
        is_24_7: None,
        payment_methods: Vec::new(),
        max_power_kw: None,
        total_connectors: 0,
        evse_count: 0,
        connectors: Vec::new(),
        source: "cz-mpo".into(),
        source_dataset: None,
        source_url: None,
        source_as_of_date: Some("2024-05-01".into()),
        license: None,
        license_url: None,
        row_hash: String::new(),
        generated_at: Some("2024-05-02T03:00:00Z".into()),
    }
}

/// Active connector with the given charge type, standard and power.
#[must_use]
pub fn connector(charge_type: &str, standard: &str, power_kw: f64) -> Connector {
    Connector {
        connector_uid: String::new(),
        connector_index: 0,
        charge_type: Some(charge_type.into()),
        connector_standard: Some(standard.into()),
        connector_power_kw: Some(power_kw),
        connection_method: None,
        excl_group: None,
        evse_uid: None,
        source: "cz-mpo".into(),
        source_as_of_date: Some("2024-05-01".into()),
        is_active: true,
    }
}

/// Serialise stations as an NDJSON document.
///
/// # Panics
/// Panics if a station cannot be serialised.
#[must_use]
pub fn ndjson(stations: &[&CanonicalStation]) -> String {
    stations
        .iter()
        .map(|station| station.to_json().expect("serialise station") + "\n")
        .collect()
}

#[derive(Debug, Default)]
struct IndexState {
    entries: HashMap<(String, String), IndexEntry>,
    touches: HashMap<(String, String), u32>,
    clock: u64,
}

impl IndexState {
    fn tick(&mut self) -> String {
        self.clock += 1;
        format!("t{:06}", self.clock)
    }
}

/// Index registry held in a hash map.
#[derive(Debug, Default, Clone)]
pub struct MemoryIndex {
    state: Rc<RefCell<IndexState>>,
}

impl MemoryIndex {
    /// Number of unchanged sightings recorded for a pair.
    #[must_use]
    pub fn touches(&self, uniq_key: &str, source: &str) -> u32 {
        self.state
            .borrow()
            .touches
            .get(&(uniq_key.to_owned(), source.to_owned()))
            .copied()
            .unwrap_or_default()
    }

    /// Number of entries in the registry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.borrow().entries.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IndexStore for MemoryIndex {
    type Error = Infallible;

    fn find_entry(&self, uniq_key: &str, source: &str) -> Result<Option<IndexEntry>, Self::Error> {
        Ok(self
            .state
            .borrow()
            .entries
            .get(&(uniq_key.to_owned(), source.to_owned()))
            .cloned())
    }

    fn record_entry(
        &self,
        uniq_key: &str,
        source: &str,
        source_version: &str,
        row_hash: &str,
    ) -> Result<(), Self::Error> {
        let mut state = self.state.borrow_mut();
        let last_seen_at = state.tick();
        state.entries.insert(
            (uniq_key.to_owned(), source.to_owned()),
            IndexEntry {
                uniq_key: uniq_key.to_owned(),
                source: source.to_owned(),
                source_version: source_version.to_owned(),
                row_hash: row_hash.to_owned(),
                last_seen_at,
            },
        );
        Ok(())
    }

    fn touch_entry(&self, uniq_key: &str, source: &str) -> Result<(), Self::Error> {
        let mut state = self.state.borrow_mut();
        let now = state.tick();
        let key = (uniq_key.to_owned(), source.to_owned());
        if let Some(entry) = state.entries.get_mut(&key) {
            entry.last_seen_at = now;
        }
        *state.touches.entry(key).or_default() += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct QueueState {
    items: Vec<QueueItem>,
    next_id: i64,
    clock: u64,
}

impl QueueState {
    fn tick(&mut self) -> String {
        self.clock += 1;
        format!("t{:06}", self.clock)
    }

    fn get_mut(&mut self, id: i64) -> Option<&mut QueueItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    /// Apply a terminal transition to a claimed item, or hand a refreshed
    /// item back to `PENDING`.
    fn transition(&mut self, id: i64, revision: i64, apply: impl FnOnce(&mut QueueItem)) -> bool {
        let now = self.tick();
        match self.get_mut(id) {
            Some(item) if item.status == QueueStatus::Processing => {
                let current = item.revision == revision;
                if current {
                    apply(item);
                } else {
                    item.status = QueueStatus::Pending;
                }
                item.updated_at = now;
                current
            }
            _ => false,
        }
    }
}

/// Delta queue held in a vector, in creation order.
#[derive(Debug, Default, Clone)]
pub struct MemoryQueue {
    state: Rc<RefCell<QueueState>>,
}

impl MemoryQueue {
    /// Snapshot of every item, oldest first.
    #[must_use]
    pub fn items(&self) -> Vec<QueueItem> {
        self.state.borrow().items.clone()
    }

    /// Snapshot of one item.
    #[must_use]
    pub fn item(&self, id: i64) -> Option<QueueItem> {
        self.state
            .borrow()
            .items
            .iter()
            .find(|item| item.id == id)
            .cloned()
    }

    /// Counts across all sources.
    #[must_use]
    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for item in &self.state.borrow().items {
            counts.record(item.status, 1);
        }
        counts
    }
}

fn matches_source(item: &QueueItem, source: Option<&str>) -> bool {
    source.is_none_or(|source| item.source == source)
}

impl QueueStore for MemoryQueue {
    type Error = Infallible;

    fn enqueue(&self, delta: &NewDelta) -> Result<EnqueueOutcome, Self::Error> {
        let mut state = self.state.borrow_mut();
        let now = state.tick();
        let open = state.items.iter_mut().find(|item| {
            item.status.is_open() && item.uniq_key == delta.uniq_key && item.source == delta.source
        });
        if let Some(item) = open {
            item.source_version.clone_from(&delta.source_version);
            item.action = delta.action;
            item.payload.clone_from(&delta.payload);
            item.attempts = 0;
            item.revision += 1;
            item.last_error = None;
            item.updated_at = now;
            return Ok(EnqueueOutcome::Refreshed);
        }
        state.next_id += 1;
        let id = state.next_id;
        state.items.push(QueueItem {
            id,
            uniq_key: delta.uniq_key.clone(),
            source: delta.source.clone(),
            source_version: delta.source_version.clone(),
            action: delta.action,
            payload: delta.payload.clone(),
            status: QueueStatus::Pending,
            attempts: 0,
            last_error: None,
            revision: 0,
            created_at: now.clone(),
            updated_at: now,
        });
        Ok(EnqueueOutcome::Inserted)
    }

    fn claim_batch(
        &self,
        source: Option<&str>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, Self::Error> {
        let mut state = self.state.borrow_mut();
        let now = state.tick();
        let claimed = state
            .items
            .iter_mut()
            .filter(|item| item.status == QueueStatus::Pending && matches_source(item, source))
            .take(limit)
            .map(|item| {
                item.status = QueueStatus::Processing;
                item.updated_at.clone_from(&now);
                item.clone()
            })
            .collect();
        Ok(claimed)
    }

    fn complete(&self, id: i64, revision: i64) -> Result<bool, Self::Error> {
        Ok(self
            .state
            .borrow_mut()
            .transition(id, revision, |item| item.status = QueueStatus::Done))
    }

    fn fail(&self, id: i64, revision: i64, error: &str) -> Result<bool, Self::Error> {
        Ok(self.state.borrow_mut().transition(id, revision, |item| {
            item.status = QueueStatus::Failed;
            item.attempts += 1;
            item.last_error = Some(error.to_owned());
        }))
    }

    fn status_counts(&self, source: Option<&str>) -> Result<QueueCounts, Self::Error> {
        let mut counts = QueueCounts::default();
        for item in &self.state.borrow().items {
            if matches_source(item, source) {
                counts.record(item.status, 1);
            }
        }
        Ok(counts)
    }

    fn requeue_failed(&self, source: Option<&str>) -> Result<u64, Self::Error> {
        let mut state = self.state.borrow_mut();
        let now = state.tick();
        let mut newest: HashMap<(String, String), i64> = HashMap::new();
        for item in &state.items {
            let slot = newest
                .entry((item.uniq_key.clone(), item.source.clone()))
                .or_insert(item.id);
            *slot = (*slot).max(item.id);
        }
        let mut requeued = 0;
        for item in &mut state.items {
            let key = (item.uniq_key.clone(), item.source.clone());
            if item.status == QueueStatus::Failed
                && matches_source(item, source)
                && newest.get(&key) == Some(&item.id)
            {
                item.status = QueueStatus::Pending;
                item.updated_at.clone_from(&now);
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}

/// A station row held by [`MemoryTarget`].
#[derive(Debug, Clone, PartialEq)]
pub struct StationRow {
    /// Row id.
    pub id: i64,
    /// Identity key.
    pub uniq_key: String,
    /// Last applied payload.
    pub station: CanonicalStation,
}

/// A connector row held by [`MemoryTarget`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorRow {
    /// Row id.
    pub id: i64,
    /// Owning station row.
    pub station_id: i64,
    /// Connector standard, for readable assertions.
    pub standard: Option<String>,
    /// Identity attributes.
    pub identity: ConnectorIdentity,
    /// Signature computed at insert time.
    pub signature: String,
    /// Whether the row is active.
    pub is_active: bool,
}

#[derive(Debug, Default, Clone)]
struct Tables {
    stations: Vec<StationRow>,
    connectors: Vec<ConnectorRow>,
    next_station: i64,
    next_connector: i64,
}

/// Failure raised by [`MemoryTarget`]'s transaction.
#[derive(Debug, Error)]
pub enum MemoryTargetError {
    /// A failure injected with [`MemoryTarget::fail_connector_inserts_for`].
    #[error("injected failure")]
    Injected,
}

struct MemoryTransaction {
    tables: RefCell<Tables>,
    fail_inserts: bool,
}

impl StationStore for MemoryTransaction {
    type Error = MemoryTargetError;

    fn upsert_station(&self, station: &CanonicalStation) -> Result<StationUpsert, Self::Error> {
        let mut tables = self.tables.borrow_mut();
        if let Some(row) = tables
            .stations
            .iter_mut()
            .find(|row| row.uniq_key == station.uniq_key)
        {
            row.station = station.clone();
            return Ok(StationUpsert {
                station_id: row.id,
                inserted: false,
            });
        }
        tables.next_station += 1;
        let id = tables.next_station;
        tables.stations.push(StationRow {
            id,
            uniq_key: station.uniq_key.clone(),
            station: station.clone(),
        });
        Ok(StationUpsert {
            station_id: id,
            inserted: true,
        })
    }
}

impl ConnectorStore for MemoryTransaction {
    type Error = MemoryTargetError;

    fn active_connectors(&self, station_id: i64) -> Result<Vec<StoredConnector>, Self::Error> {
        Ok(self
            .tables
            .borrow()
            .connectors
            .iter()
            .filter(|row| row.station_id == station_id && row.is_active)
            .map(|row| StoredConnector {
                id: row.id,
                identity: row.identity.clone(),
            })
            .collect())
    }

    fn insert_connector(
        &self,
        station_id: i64,
        connector: &Connector,
        signature: &str,
    ) -> Result<i64, Self::Error> {
        if self.fail_inserts {
            return Err(MemoryTargetError::Injected);
        }
        let mut tables = self.tables.borrow_mut();
        tables.next_connector += 1;
        let id = tables.next_connector;
        tables.connectors.push(ConnectorRow {
            id,
            station_id,
            standard: connector.connector_standard.clone(),
            identity: connector.identity(),
            signature: signature.to_owned(),
            is_active: true,
        });
        Ok(id)
    }

    fn deactivate_connectors(&self, ids: &[i64]) -> Result<(), Self::Error> {
        for row in &mut self.tables.borrow_mut().connectors {
            if ids.contains(&row.id) {
                row.is_active = false;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct TargetState {
    tables: Tables,
    fail_inserts_for: HashSet<String>,
    on_apply: Option<Rc<dyn Fn()>>,
}

/// Station and connector tables with all-or-nothing application.
///
/// Each [`StationSink::apply_station`] call works on a copy of the tables and
/// swaps it in only when reconciliation succeeds.
#[derive(Default, Clone)]
pub struct MemoryTarget {
    state: Rc<RefCell<TargetState>>,
}

impl MemoryTarget {
    /// Make every connector insert for `uniq_key` fail.
    pub fn fail_connector_inserts_for(&self, uniq_key: &str) {
        self.state
            .borrow_mut()
            .fail_inserts_for
            .insert(uniq_key.to_owned());
    }

    /// Run `hook` at the start of every application.
    pub fn on_apply(&self, hook: impl Fn() + 'static) {
        self.state.borrow_mut().on_apply = Some(Rc::new(hook));
    }

    /// Snapshot of the station rows.
    #[must_use]
    pub fn station_rows(&self) -> Vec<StationRow> {
        self.state.borrow().tables.stations.clone()
    }

    /// Snapshot of the connector rows, active or not.
    #[must_use]
    pub fn connector_rows(&self) -> Vec<ConnectorRow> {
        self.state.borrow().tables.connectors.clone()
    }

    /// Sorted standards of the active connectors of a station.
    #[must_use]
    pub fn active_standards(&self, uniq_key: &str) -> Vec<String> {
        let state = self.state.borrow();
        let Some(station) = state
            .tables
            .stations
            .iter()
            .find(|row| row.uniq_key == uniq_key)
        else {
            return Vec::new();
        };
        let mut standards: Vec<String> = state
            .tables
            .connectors
            .iter()
            .filter(|row| row.station_id == station.id && row.is_active)
            .map(|row| row.standard.clone().unwrap_or_default())
            .collect();
        standards.sort();
        standards
    }

    /// Signatures of the active connectors of a station, as stored.
    #[must_use]
    pub fn active_signatures(&self, station_id: i64) -> Vec<String> {
        self.state
            .borrow()
            .tables
            .connectors
            .iter()
            .filter(|row| row.station_id == station_id && row.is_active)
            .map(|row| row.signature.clone())
            .collect()
    }
}

impl StationSink for MemoryTarget {
    type Error = ReconcileError;

    fn apply_station(&self, station: &CanonicalStation) -> Result<ReconcileReport, Self::Error> {
        let hook = self.state.borrow().on_apply.clone();
        if let Some(hook) = hook {
            hook();
        }
        let transaction = {
            let state = self.state.borrow();
            MemoryTransaction {
                tables: RefCell::new(state.tables.clone()),
                fail_inserts: state.fail_inserts_for.contains(&station.uniq_key),
            }
        };
        let report = reconcile_station(&transaction, station)?;
        self.state.borrow_mut().tables = transaction.tables.into_inner();
        Ok(report)
    }
}
