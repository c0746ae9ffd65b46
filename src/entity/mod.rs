//! Entity Data Model
//!
//! An entity is identified by (table, PartitionKey, RowKey) and carries an ordered
//! bag of typed properties plus the server-managed `Timestamp` and ETag. Property
//! insertion order is kept so responses list properties the way clients wrote them.

pub mod normalizer;

pub use normalizer::{normalize, NewEntity, NormalizeError};

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::value::EdmValue;

pub const PARTITION_KEY: &str = "PartitionKey";
pub const ROW_KEY: &str = "RowKey";
pub const TIMESTAMP: &str = "Timestamp";

/// Names clients may not use for their own properties.
pub const RESERVED_PROPERTIES: [&str; 3] = [PARTITION_KEY, ROW_KEY, TIMESTAMP];

/// Maximum key length in UTF-16 code units
pub const MAX_KEY_LENGTH: usize = 1024;

/// Maximum property name length in characters
pub const MAX_PROPERTY_NAME_LENGTH: usize = 255;

/// Ordered property name -> value mapping.
pub type PropertyBag = IndexMap<String, EdmValue>;

/// Last-modified time at 100ns tick precision (ticks since the Unix epoch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const TICKS_PER_SECOND: i64 = 10_000_000;
    const NANOS_PER_TICK: i64 = 100;

    pub fn from_ticks(ticks: i64) -> Self {
        Timestamp(ticks)
    }

    pub fn ticks(self) -> i64 {
        self.0
    }

    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Truncates to tick precision.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let nanos = i64::from(dt.timestamp_subsec_nanos());
        Timestamp(dt.timestamp() * Self::TICKS_PER_SECOND + nanos / Self::NANOS_PER_TICK)
    }

    pub fn to_datetime(self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(Self::TICKS_PER_SECOND);
        let nanos = self.0.rem_euclid(Self::TICKS_PER_SECOND) * Self::NANOS_PER_TICK;
        DateTime::from_timestamp(secs, nanos as u32).unwrap_or_default()
    }

    /// Parse an RFC 3339 timestamp; digits beyond tick precision are dropped.
    pub fn parse(s: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| Self::from_datetime(dt.with_timezone(&Utc)))
    }

    /// `YYYY-MM-DDTHH:MM:SS.fffffffZ`, always seven fractional digits.
    pub fn to_rfc3339(self) -> String {
        let ticks = self.0.rem_euclid(Self::TICKS_PER_SECOND);
        format!(
            "{}.{ticks:07}Z",
            self.to_datetime().format("%Y-%m-%dT%H:%M:%S")
        )
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

/// A stored entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub partition_key: String,
    pub row_key: String,
    pub properties: PropertyBag,
    pub etag: String,
    pub timestamp: Timestamp,
}

impl Entity {
    /// Primary key within a table
    pub fn key(&self) -> (String, String) {
        (self.partition_key.clone(), self.row_key.clone())
    }

    /// Look up any property by name, including the system properties.
    pub fn property(&self, name: &str) -> Option<EdmValue> {
        match name {
            PARTITION_KEY => Some(EdmValue::string(&self.partition_key)),
            ROW_KEY => Some(EdmValue::string(&self.row_key)),
            TIMESTAMP => Some(EdmValue::DateTime(self.timestamp.to_rfc3339())),
            _ => self.properties.get(name).cloned(),
        }
    }
}

/// Validate a PartitionKey or RowKey value.
///
/// Keys must be non-empty, at most [`MAX_KEY_LENGTH`] UTF-16 code units, and free of
/// `/ \ # ?` and control characters.
pub fn validate_key(field: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    if value.encode_utf16().count() > MAX_KEY_LENGTH {
        return Err(format!(
            "{field} exceeds the maximum length of {MAX_KEY_LENGTH} characters"
        ));
    }
    if let Some(c) = value.chars().find(|c| is_forbidden_key_char(*c)) {
        return Err(format!(
            "{field} contains the disallowed character U+{:04X}",
            u32::from(c)
        ));
    }
    Ok(())
}

fn is_forbidden_key_char(c: char) -> bool {
    matches!(c, '/' | '\\' | '#' | '?' | '\u{0}'..='\u{1f}' | '\u{7f}'..='\u{9f}')
}
