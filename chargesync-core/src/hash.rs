//! Content hashing and connector identity signatures.
//!
//! Hashes here are equality oracles between two ingestion runs, not security
//! primitives.
//!
//! # Content hash scheme
//!
//! [`content_hash`] serialises every field of a [`CanonicalStation`] except
//! those listed in [`CONTENT_HASH_EXCLUDED_FIELDS`], writes object keys in
//! byte-wise sorted order at every nesting level with `serde_json` string
//! escaping, and returns the lowercase hex SHA-256 of the result. Adding a
//! field to [`CanonicalStation`] changes every hash; such a change must be
//! paired with a deliberate re-baseline of the index registry.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::CanonicalStation;

/// Fields left out of the content hash.
///
/// `generated_at` changes on every adapter run; `row_hash` is the hash itself.
pub const CONTENT_HASH_EXCLUDED_FIELDS: &[&str] = &["generated_at", "row_hash"];

/// Length of connector signatures and UIDs in hex characters.
pub const SHORT_HASH_LEN: usize = 16;

/// Errors raised while hashing a station.
#[derive(Debug, Error)]
pub enum HashError {
    /// The record could not be serialised.
    #[error("failed to serialise station for hashing")]
    Serialise {
        /// Source error produced by `serde_json`.
        #[source]
        source: serde_json::Error,
    },
}

/// The attributes that make two connectors "the same slot".
///
/// Position, UID, EVSE id and provenance are deliberately absent.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectorIdentity {
    /// `AC` or `DC`.
    pub charge_type: Option<String>,
    /// Connector standard.
    pub connector_standard: Option<String>,
    /// Rated power in kW.
    pub connector_power_kw: Option<f64>,
    /// `socket` or `cable`.
    pub connection_method: Option<String>,
    /// Exclusivity group.
    pub excl_group: Option<String>,
}

/// Compute the content hash of a station.
///
/// # Errors
/// Returns [`HashError::Serialise`] if the record cannot be converted to JSON.
///
/// # Examples
/// ```
/// use chargesync_core::{CanonicalStation, content_hash};
///
/// let line = r#"{"uniq_key":"k","lat":1.0,"lon":2.0,"row_hash":"x","generated_at":"2024-01-01"}"#;
/// let mut station = CanonicalStation::from_json(line).expect("valid record");
/// let before = content_hash(&station).expect("hash");
/// station.generated_at = Some("2024-02-02".into());
/// assert_eq!(content_hash(&station).expect("hash"), before);
/// ```
pub fn content_hash(station: &CanonicalStation) -> Result<String, HashError> {
    let mut value = to_value(station)?;
    if let Value::Object(map) = &mut value {
        for field in CONTENT_HASH_EXCLUDED_FIELDS {
            map.remove(*field);
        }
    }
    let mut canonical = String::new();
    write_canonical_json(&value, &mut canonical)?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

fn to_value<T: Serialize>(input: &T) -> Result<Value, HashError> {
    serde_json::to_value(input).map_err(|source| HashError::Serialise { source })
}

/// Write `value` as compact JSON with object keys sorted at every level.
///
/// Sorting is done here rather than relying on `serde_json`'s map type, whose
/// ordering depends on crate features enabled elsewhere in the build.
fn write_canonical_json(value: &Value, out: &mut String) -> Result<(), HashError> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (position, key) in keys.into_iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                out.push_str(&encode_scalar(key)?);
                out.push(':');
                if let Some(entry) = map.get(key) {
                    write_canonical_json(entry, out)?;
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (position, item) in items.iter().enumerate() {
                if position > 0 {
                    out.push(',');
                }
                write_canonical_json(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&encode_scalar(scalar)?),
    }
    Ok(())
}

fn encode_scalar<T: Serialize + ?Sized>(value: &T) -> Result<String, HashError> {
    serde_json::to_string(value).map_err(|source| HashError::Serialise { source })
}

/// Short signature over a connector's identity fields.
///
/// Two connectors with equal identity fields always collide, whatever their
/// position in the feed.
///
/// # Examples
/// ```
/// use chargesync_core::{ConnectorIdentity, connector_signature};
///
/// let identity = ConnectorIdentity {
///     charge_type: Some("DC".into()),
///     connector_standard: Some("CCS2".into()),
///     connector_power_kw: Some(150.0),
///     ..ConnectorIdentity::default()
/// };
/// let signature = connector_signature(&identity);
/// assert_eq!(signature.len(), 16);
/// assert_eq!(signature, connector_signature(&identity.clone()));
/// ```
#[must_use]
pub fn connector_signature(identity: &ConnectorIdentity) -> String {
    let power = identity
        .connector_power_kw
        .map(|kw| format!("{kw:.2}"))
        .unwrap_or_default();
    let material = [
        text_part(identity.charge_type.as_deref()),
        text_part(identity.connector_standard.as_deref()),
        power.as_str(),
        text_part(identity.connection_method.as_deref()),
        text_part(identity.excl_group.as_deref()),
    ]
    .join("|");
    short_md5(&material)
}

/// Positional connector UID.
///
/// Stable while the connector's identity and position are unchanged; differs
/// for otherwise identical connectors at different positions.
#[must_use]
pub fn connector_uid(identity_key: &str, identity: &ConnectorIdentity, position: u32) -> String {
    let signature = connector_signature(identity);
    short_md5(&format!("{identity_key}|{signature}|{position}"))
}

fn text_part(value: Option<&str>) -> &str {
    value.map(str::trim).unwrap_or_default()
}

fn short_md5(material: &str) -> String {
    let mut hex = hex::encode(md5::compute(material.as_bytes()).0);
    hex.truncate(SHORT_HASH_LEN);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{connector, station};
    use rstest::{fixture, rstest};

    #[fixture]
    fn canonical() -> CanonicalStation {
        let mut raw = station("PRE, a.s.", 50.087_65, 14.421_2);
        raw.connectors = vec![connector("AC", "Type2", 22.0)];
        raw.canonicalize().expect("canonicalize fixture")
    }

    #[rstest]
    fn hash_is_hex_sha256(canonical: CanonicalStation) {
        let hash = content_hash(&canonical).expect("hash");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_eq!(hash, canonical.row_hash);
    }

    #[rstest]
    fn hash_ignores_input_field_order() {
        let forward = r#"{"uniq_key":"k","lat":1.5,"lon":2.5,"city":"Brno","row_hash":"h"}"#;
        let shuffled = r#"{"row_hash":"h","city":"Brno","lon":2.5,"uniq_key":"k","lat":1.5}"#;
        let a = CanonicalStation::from_json(forward).expect("forward");
        let b = CanonicalStation::from_json(shuffled).expect("shuffled");
        assert_eq!(content_hash(&a).expect("a"), content_hash(&b).expect("b"));
    }

    #[rstest]
    fn hash_ignores_generated_at_and_row_hash(canonical: CanonicalStation) {
        let mut touched = canonical.clone();
        touched.generated_at = Some("2030-01-01T00:00:00Z".into());
        touched.row_hash = "stale".into();
        assert_eq!(
            content_hash(&touched).expect("touched"),
            content_hash(&canonical).expect("canonical")
        );
    }

    #[rstest]
    #[case::city(|s: &mut CanonicalStation| s.city = Some("Plzeň".into()))]
    #[case::source_date(|s: &mut CanonicalStation| s.source_as_of_date = Some("2024-06-01".into()))]
    #[case::payment(|s: &mut CanonicalStation| s.payment_methods.push("card".into()))]
    #[case::connector_power(|s: &mut CanonicalStation| {
        if let Some(first) = s.connectors.first_mut() {
            first.connector_power_kw = Some(11.0);
        }
    })]
    #[case::latitude(|s: &mut CanonicalStation| s.lat = 50.087_66)]
    fn hash_changes_with_content(
        canonical: CanonicalStation,
        #[case] mutate: fn(&mut CanonicalStation),
    ) {
        let mut changed = canonical.clone();
        mutate(&mut changed);
        assert_ne!(
            content_hash(&changed).expect("changed"),
            content_hash(&canonical).expect("canonical")
        );
    }

    #[rstest]
    fn signature_ignores_position_and_uid() {
        let mut first = connector("DC", "CCS2", 150.0);
        let mut second = first.clone();
        first.connector_index = 0;
        first.connector_uid = "aaaa".into();
        second.connector_index = 3;
        second.connector_uid = "bbbb".into();
        second.evse_uid = Some("CZ*PRE*E1".into());
        assert_eq!(
            connector_signature(&first.identity()),
            connector_signature(&second.identity())
        );
    }

    #[rstest]
    fn signature_distinguishes_identity_fields() {
        let ccs = connector("DC", "CCS2", 150.0);
        let mut grouped = ccs.clone();
        grouped.excl_group = Some("A".into());
        let chademo = connector("DC", "CHAdeMO", 150.0);
        let slower = connector("DC", "CCS2", 50.0);
        let reference = connector_signature(&ccs.identity());
        for other in [grouped, chademo, slower] {
            assert_ne!(connector_signature(&other.identity()), reference);
        }
    }

    #[rstest]
    fn uid_depends_on_position() {
        let identity = connector("AC", "Type2", 22.0).identity();
        let first = connector_uid("pre|50.00000|14.00000", &identity, 0);
        let second = connector_uid("pre|50.00000|14.00000", &identity, 1);
        assert_ne!(first, second);
        assert_eq!(first, connector_uid("pre|50.00000|14.00000", &identity, 0));
        assert_eq!(first.len(), SHORT_HASH_LEN);
    }

    #[rstest]
    fn uid_depends_on_station() {
        let identity = connector("AC", "Type2", 22.0).identity();
        assert_ne!(
            connector_uid("pre|50.00000|14.00000", &identity, 0),
            connector_uid("pre|50.00001|14.00000", &identity, 0)
        );
    }
}
