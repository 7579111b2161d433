//! Canonical station and connector records.
//!
//! These mirror the newline-delimited JSON emitted by the source adapters.
//! Parsing goes through [`CanonicalStation::from_json`], which rejects records
//! lacking the identity key or content hash so downstream components never
//! see a half-formed station.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::canonical::{CanonicalizeError, identity_key, operator_key, round_coordinate};
use crate::hash::{ConnectorIdentity, HashError, connector_uid, content_hash};

/// A charging station reduced to the canonical field set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalStation {
    /// Identity key derived from the operator key and rounded coordinates.
    pub uniq_key: String,
    /// ISO 3166-1 alpha-2 country code.
    #[serde(default)]
    pub country_code: Option<String>,
    /// Operator name exactly as the source spelled it.
    #[serde(default)]
    pub operator_original: Option<String>,
    /// Cleaned display name of the operator.
    #[serde(default)]
    pub operator_name: Option<String>,
    /// Normalised operator key (see [`operator_key`]).
    #[serde(default, deserialize_with = "null_as_default")]
    pub operator_key: String,
    /// Station name, when the source provides one.
    #[serde(default)]
    pub station_name: Option<String>,
    /// Latitude at source precision.
    pub lat: f64,
    /// Longitude at source precision.
    pub lon: f64,
    /// Latitude rounded to five decimal places.
    #[serde(default, deserialize_with = "null_as_default")]
    pub lat_5dp: f64,
    /// Longitude rounded to five decimal places.
    #[serde(default, deserialize_with = "null_as_default")]
    pub lon_5dp: f64,
    /// Street and house number.
    #[serde(default)]
    pub street: Option<String>,
    /// Postal code.
    #[serde(default)]
    pub postal_code: Option<String>,
    /// City or municipality.
    #[serde(default)]
    pub city: Option<String>,
    /// Region, district or state.
    #[serde(default)]
    pub region: Option<String>,
    /// Access restrictions (`public`, `customers`, ...).
    #[serde(default)]
    pub access_type: Option<String>,
    /// Free-form opening hours.
    #[serde(default)]
    pub opening_hours: Option<String>,
    /// Whether the station is open around the clock.
    #[serde(default)]
    pub is_24_7: Option<bool>,
    /// Accepted payment methods.
    #[serde(default, deserialize_with = "null_as_default")]
    pub payment_methods: Vec<String>,
    /// Highest connector power in kW.
    #[serde(default)]
    pub max_power_kw: Option<f64>,
    /// Number of connectors described by the source.
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_connectors: u32,
    /// Number of EVSEs (charge points) at the station.
    #[serde(default, deserialize_with = "null_as_default")]
    pub evse_count: u32,
    /// Connectors in source order.
    #[serde(default, deserialize_with = "null_as_default")]
    pub connectors: Vec<Connector>,
    /// Source identifier (for example `cz-mpo`).
    #[serde(default, deserialize_with = "null_as_default")]
    pub source: String,
    /// Dataset name within the source.
    #[serde(default)]
    pub source_dataset: Option<String>,
    /// URL the dataset was obtained from.
    #[serde(default)]
    pub source_url: Option<String>,
    /// Date the source data refers to.
    #[serde(default)]
    pub source_as_of_date: Option<String>,
    /// Licence name of the source data.
    #[serde(default)]
    pub license: Option<String>,
    /// Licence URL of the source data.
    #[serde(default)]
    pub license_url: Option<String>,
    /// Content hash of the record, see [`content_hash`].
    pub row_hash: String,
    /// When the adapter produced the record. Excluded from the content hash.
    #[serde(default)]
    pub generated_at: Option<String>,
}

/// A single connector slot at a station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connector {
    /// Positional UID, see [`connector_uid`].
    #[serde(default, deserialize_with = "null_as_default")]
    pub connector_uid: String,
    /// Zero-based position in the source feed.
    #[serde(default, deserialize_with = "null_as_default")]
    pub connector_index: u32,
    /// `AC` or `DC`.
    #[serde(default)]
    pub charge_type: Option<String>,
    /// Connector standard (`Type2`, `CCS2`, `CHAdeMO`, ...).
    #[serde(default)]
    pub connector_standard: Option<String>,
    /// Rated power in kW.
    #[serde(default)]
    pub connector_power_kw: Option<f64>,
    /// `socket` or `cable`.
    #[serde(default)]
    pub connection_method: Option<String>,
    /// Connectors sharing an exclusivity group cannot charge simultaneously.
    #[serde(default)]
    pub excl_group: Option<String>,
    /// EVSE identifier, when published.
    #[serde(default)]
    pub evse_uid: Option<String>,
    /// Source identifier.
    #[serde(default, deserialize_with = "null_as_default")]
    pub source: String,
    /// Date the source data refers to.
    #[serde(default)]
    pub source_as_of_date: Option<String>,
    /// Whether the connector is in service.
    #[serde(default = "default_active", deserialize_with = "null_as_active")]
    pub is_active: bool,
}

const fn default_active() -> bool {
    true
}

/// Read an explicit `null` as the field's default.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn null_as_active<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or_else(default_active))
}

impl Connector {
    /// Identity attributes used to match connectors across imports.
    #[must_use]
    pub fn identity(&self) -> ConnectorIdentity {
        ConnectorIdentity {
            charge_type: self.charge_type.clone(),
            connector_standard: self.connector_standard.clone(),
            connector_power_kw: self.connector_power_kw,
            connection_method: self.connection_method.clone(),
            excl_group: self.excl_group.clone(),
        }
    }
}

/// Errors raised when decoding or canonicalizing a station record.
#[derive(Debug, Error)]
pub enum StationError {
    /// The payload was not valid JSON or lacked a required field.
    #[error("failed to decode station record")]
    Decode {
        /// JSON decoding failure.
        #[source]
        source: serde_json::Error,
    },
    /// A required field was present but blank.
    #[error("station record has an empty {field}")]
    BlankField {
        /// Name of the blank field.
        field: &'static str,
    },
    /// The identity key could not be derived.
    #[error("failed to derive identity key")]
    Identity(#[from] CanonicalizeError),
    /// The content hash could not be computed.
    #[error(transparent)]
    Hash(#[from] HashError),
}

impl CanonicalStation {
    /// Decode and validate one NDJSON line.
    ///
    /// # Errors
    /// Returns [`StationError::Decode`] when the JSON is malformed or misses a
    /// required field, and [`StationError::BlankField`] when `uniq_key` or
    /// `row_hash` is blank.
    ///
    /// # Examples
    /// ```
    /// use chargesync_core::CanonicalStation;
    ///
    /// let line = r#"{"uniq_key":"pre|50.08765|14.42120","lat":50.08765,"lon":14.4212,"row_hash":"abc"}"#;
    /// let station = CanonicalStation::from_json(line).expect("valid record");
    /// assert_eq!(station.uniq_key, "pre|50.08765|14.42120");
    /// assert!(CanonicalStation::from_json(r#"{"lat":1.0,"lon":1.0}"#).is_err());
    /// ```
    pub fn from_json(line: &str) -> Result<Self, StationError> {
        let station: Self =
            serde_json::from_str(line).map_err(|source| StationError::Decode { source })?;
        station.validate()?;
        Ok(station)
    }

    fn validate(&self) -> Result<(), StationError> {
        if self.uniq_key.trim().is_empty() {
            return Err(StationError::BlankField { field: "uniq_key" });
        }
        if self.row_hash.trim().is_empty() {
            return Err(StationError::BlankField { field: "row_hash" });
        }
        Ok(())
    }

    /// Serialise the record as compact JSON for queue payloads.
    ///
    /// # Errors
    /// Propagates `serde_json` failures.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Recompute every derived field from the source-provided ones.
    ///
    /// Sets the operator key (from `operator_name`, falling back to
    /// `operator_original`), the rounded coordinates, the identity key, each
    /// connector's position and UID, the aggregate connector count and maximum
    /// power, and finally `row_hash`.
    ///
    /// # Errors
    /// Returns [`StationError`] when the coordinates are invalid or hashing
    /// fails.
    pub fn canonicalize(mut self) -> Result<Self, StationError> {
        let raw_operator = self
            .operator_name
            .as_deref()
            .or(self.operator_original.as_deref())
            .unwrap_or_default();
        self.operator_key = operator_key(raw_operator);
        self.lat_5dp = round_coordinate(self.lat);
        self.lon_5dp = round_coordinate(self.lon);
        self.uniq_key = identity_key(&self.operator_key, self.lat, self.lon)?;

        for (position, connector) in self.connectors.iter_mut().enumerate() {
            let index = u32::try_from(position).unwrap_or(u32::MAX);
            connector.connector_index = index;
            connector.connector_uid = connector_uid(&self.uniq_key, &connector.identity(), index);
        }
        self.total_connectors = u32::try_from(self.connectors.len()).unwrap_or(u32::MAX);
        self.max_power_kw = self
            .connectors
            .iter()
            .filter_map(|connector| connector.connector_power_kw)
            .reduce(f64::max);

        self.row_hash = content_hash(&self)?;
        Ok(self)
    }
}
