//! Operator and coordinate canonicalization.
//!
//! Raw source records spell the same operator in many ways ("ČEZ, a.s.",
//! "CEZ a.s.", "cez") and submit coordinates with varying precision. The
//! functions here reduce both to stable keys so that records describing the
//! same station collapse onto one identity.

use thiserror::Error;
use unicode_normalization::{UnicodeNormalization, char::is_combining_mark};

/// Number of decimal places kept when rounding coordinates (~1.1 m).
pub const COORDINATE_PRECISION: usize = 5;

/// Separator between the operator key and the rounded coordinates.
///
/// Operator keys never contain `|`, so the concatenation is unambiguous.
pub const IDENTITY_SEPARATOR: char = '|';

/// Operator key used when a record carries no usable operator name.
pub const UNKNOWN_OPERATOR: &str = "unknown";

/// Legal-entity suffixes stripped from operator names, pre-tokenised.
///
/// The list is not exhaustive; unknown suffixes pass through unchanged.
const LEGAL_SUFFIXES: &[&[&str]] = &[
    &["s", "r", "o"],
    &["spol", "s", "r", "o"],
    &["a", "s"],
    &["gmbh"],
    &["mbh"],
    &["ag"],
    &["kg"],
    &["co"],
    &["e", "v"],
    &["se"],
    &["ltd"],
    &["limited"],
    &["plc"],
    &["llc"],
    &["inc"],
    &["corp"],
    &["sp", "z", "o", "o"],
    &["s", "a"],
    &["s", "p", "a"],
    &["spa"],
    &["srl"],
    &["s", "r", "l"],
    &["sas"],
    &["sarl"],
    &["b", "v"],
    &["n", "v"],
    &["bv"],
    &["nv"],
    &["kft"],
    &["zrt"],
    &["d", "o", "o"],
    &["ab"],
    &["oy"],
    &["as"],
    &["aps"],
];

/// Errors raised when deriving an identity key.
#[derive(Debug, Error, PartialEq)]
pub enum CanonicalizeError {
    /// A coordinate was NaN or infinite.
    #[error("{axis} coordinate {value} is not a finite number")]
    NonFiniteCoordinate {
        /// Which axis failed (`latitude` or `longitude`).
        axis: &'static str,
        /// Offending value.
        value: f64,
    },
    /// A coordinate fell outside the WGS84 range.
    #[error("{axis} coordinate {value} is outside the valid range")]
    CoordinateOutOfRange {
        /// Which axis failed (`latitude` or `longitude`).
        axis: &'static str,
        /// Offending value.
        value: f64,
    },
}

/// Normalise an operator name into a stable key.
///
/// The name is decomposed and stripped of diacritics, lowercased, split on any
/// non-alphanumeric character, and trailing legal-entity suffixes are removed.
/// Tokens are re-joined with `-`. The function is idempotent.
///
/// # Examples
/// ```
/// use chargesync_core::operator_key;
///
/// assert_eq!(operator_key("ČEZ ESCO, a.s."), "cez-esco");
/// assert_eq!(operator_key("IONITY GmbH"), "ionity");
/// assert_eq!(operator_key(&operator_key("IONITY GmbH")), "ionity");
/// ```
#[must_use]
pub fn operator_key(name: &str) -> String {
    let folded = fold_case_and_marks(name);
    let mut tokens: Vec<&str> = folded
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .collect();

    while let Some(remaining) = strip_legal_suffix(&tokens) {
        tokens.truncate(remaining);
    }

    if tokens.is_empty() {
        return UNKNOWN_OPERATOR.to_owned();
    }
    tokens.join("-")
}

/// Decompose, drop combining marks and lowercase until the text is stable.
///
/// Lowercasing can reintroduce decomposable characters (`İ` lowercases to
/// `i` plus a combining dot), so a single pass is not always a fixed point.
fn fold_case_and_marks(input: &str) -> String {
    const MAX_PASSES: usize = 4;
    let fold = |text: &str| -> String {
        text.nfkd()
            .filter(|ch| !is_combining_mark(*ch))
            .flat_map(char::to_lowercase)
            .collect()
    };

    let mut current = fold(input);
    for _ in 1..MAX_PASSES {
        let next = fold(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

/// Return the token count left after removing one trailing legal suffix.
///
/// A suffix is never stripped when it is the whole name, which keeps the
/// function idempotent for names such as "AG".
fn strip_legal_suffix(tokens: &[&str]) -> Option<usize> {
    LEGAL_SUFFIXES
        .iter()
        .filter(|suffix| suffix.len() < tokens.len())
        .find(|suffix| tokens.ends_with(suffix))
        .map(|suffix| tokens.len() - suffix.len())
}

/// Round a coordinate to [`COORDINATE_PRECISION`] decimal places.
///
/// Negative zero is folded to positive zero so that it serialises identically.
///
/// # Examples
/// ```
/// use chargesync_core::round_coordinate;
///
/// assert_eq!(round_coordinate(50.087_654_9), 50.087_65);
/// assert_eq!(round_coordinate(-0.000_001).to_string(), "0");
/// ```
#[must_use]
#[expect(
    clippy::float_arithmetic,
    reason = "coordinate rounding scales by a power of ten"
)]
pub fn round_coordinate(value: f64) -> f64 {
    const SCALE: f64 = 100_000.0;
    let rounded = (value * SCALE).round() / SCALE;
    if rounded == 0.0 { 0.0 } else { rounded }
}

/// Build the station identity key from an operator key and raw coordinates.
///
/// Both coordinates are rounded to five decimal places and written with fixed
/// precision, so inputs that differ only in trailing precision share a key.
///
/// # Errors
/// Returns [`CanonicalizeError`] when a coordinate is not finite or outside
/// the WGS84 range.
///
/// # Examples
/// ```
/// use chargesync_core::identity_key;
///
/// # fn main() -> Result<(), chargesync_core::CanonicalizeError> {
/// let key = identity_key("ionity", 50.087_654_9, 14.421_2)?;
/// assert_eq!(key, "ionity|50.08765|14.42120");
/// assert_eq!(identity_key("ionity", 50.087_650_2, 14.421_200_4)?, key);
/// # Ok(())
/// # }
/// ```
pub fn identity_key(operator_key: &str, lat: f64, lon: f64) -> Result<String, CanonicalizeError> {
    let lat = checked_coordinate("latitude", lat, 90.0)?;
    let lon = checked_coordinate("longitude", lon, 180.0)?;
    Ok(format!(
        "{operator_key}{IDENTITY_SEPARATOR}{lat:.prec$}{IDENTITY_SEPARATOR}{lon:.prec$}",
        prec = COORDINATE_PRECISION
    ))
}

fn checked_coordinate(axis: &'static str, value: f64, limit: f64) -> Result<f64, CanonicalizeError> {
    if !value.is_finite() {
        return Err(CanonicalizeError::NonFiniteCoordinate { axis, value });
    }
    if !(-limit..=limit).contains(&value) {
        return Err(CanonicalizeError::CoordinateOutOfRange { axis, value });
    }
    Ok(round_coordinate(value))
}
