//! # EDM Value Model
//!
//! Typed property values for table entities. Every property on the wire is a JSON
//! scalar, optionally paired with a sibling `<Name>@odata.type` annotation naming
//! its Entity Data Model type.
//!
//! ## Type inference
//!
//! Without an annotation the type is inferred from the bare JSON value:
//!
//! | JSON                                   | EDM type      |
//! |----------------------------------------|---------------|
//! | string                                 | `Edm.String`  |
//! | integral number within 32-bit range    | `Edm.Int32`   |
//! | fractional or out-of-range number      | `Edm.Double`  |
//! | boolean                                | `Edm.Boolean` |
//!
//! An explicit annotation overrides inference and must be one of
//! `Edm.Int64`, `Edm.Double`, `Edm.Boolean`, `Edm.Guid`, `Edm.Binary`, `Edm.DateTime`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tablestore::value::{EdmType, EdmValue};
//! use serde_json::json;
//!
//! let count = EdmValue::infer(&json!(42))?;
//! assert_eq!(count.edm_type(), EdmType::Int32);
//!
//! let big = EdmValue::with_type(&json!("9007199254740993"), EdmType::Int64)?;
//! assert_eq!(big.to_json(), json!("9007199254740993"));
//! ```

use std::fmt;

use base64::Engine;
use serde_json::Value;

/// Suffix of a property's type annotation key.
pub const TYPE_ANNOTATION_SUFFIX: &str = "@odata.type";

/// Wire spellings of non-finite doubles.
const NAN: &str = "NaN";
const INFINITY: &str = "Infinity";
const NEG_INFINITY: &str = "-Infinity";

/// EDM types supported for entity properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdmType {
    String,
    Int32,
    Int64,
    Double,
    Boolean,
    Guid,
    Binary,
    DateTime,
}

impl EdmType {
    /// The `Edm.*` name used in `@odata.type` annotations.
    pub fn as_str(self) -> &'static str {
        match self {
            EdmType::String => "Edm.String",
            EdmType::Int32 => "Edm.Int32",
            EdmType::Int64 => "Edm.Int64",
            EdmType::Double => "Edm.Double",
            EdmType::Boolean => "Edm.Boolean",
            EdmType::Guid => "Edm.Guid",
            EdmType::Binary => "Edm.Binary",
            EdmType::DateTime => "Edm.DateTime",
        }
    }

    /// Parse an explicit `@odata.type` annotation.
    ///
    /// Only the types that may be declared explicitly are accepted; `Edm.String` and
    /// `Edm.Int32` are always inferred and never annotated.
    pub fn from_annotation(annotation: &str) -> Option<Self> {
        match annotation {
            "Edm.Int64" => Some(EdmType::Int64),
            "Edm.Double" => Some(EdmType::Double),
            "Edm.Boolean" => Some(EdmType::Boolean),
            "Edm.Guid" => Some(EdmType::Guid),
            "Edm.Binary" => Some(EdmType::Binary),
            "Edm.DateTime" => Some(EdmType::DateTime),
            _ => None,
        }
    }
}

impl fmt::Display for EdmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed property value.
///
/// `Guid` and `DateTime` keep the validated wire string so responses echo exactly
/// what the client stored.
#[derive(Debug, Clone, PartialEq)]
pub enum EdmValue {
    String(String),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Boolean(bool),
    Guid(String),
    Binary(Vec<u8>),
    DateTime(String),
}

impl EdmValue {
    /// Create a string value
    pub fn string(s: impl Into<String>) -> Self {
        EdmValue::String(s.into())
    }

    pub fn edm_type(&self) -> EdmType {
        match self {
            EdmValue::String(_) => EdmType::String,
            EdmValue::Int32(_) => EdmType::Int32,
            EdmValue::Int64(_) => EdmType::Int64,
            EdmValue::Double(_) => EdmType::Double,
            EdmValue::Boolean(_) => EdmType::Boolean,
            EdmValue::Guid(_) => EdmType::Guid,
            EdmValue::Binary(_) => EdmType::Binary,
            EdmValue::DateTime(_) => EdmType::DateTime,
        }
    }

    /// Infer a value from bare JSON (no type annotation present).
    pub fn infer(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(s) => Ok(EdmValue::String(s.clone())),
            Value::Bool(b) => Ok(EdmValue::Boolean(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                    return Ok(EdmValue::Int32(i));
                }
                n.as_f64()
                    .map(EdmValue::Double)
                    .ok_or_else(|| format!("number {n} is not representable"))
            }
            Value::Null => Err("null values cannot be stored".to_string()),
            Value::Array(_) | Value::Object(_) => {
                Err("nested objects and arrays are not supported".to_string())
            }
        }
    }

    /// Coerce a JSON value to a declared type.
    pub fn with_type(value: &Value, ty: EdmType) -> Result<Self, String> {
        let mismatch = || format!("value {value} is not a valid {ty}");
        match ty {
            EdmType::String => value
                .as_str()
                .map(EdmValue::string)
                .ok_or_else(mismatch),
            EdmType::Int32 => value
                .as_i64()
                .and_then(|i| i32::try_from(i).ok())
                .map(EdmValue::Int32)
                .ok_or_else(mismatch),
            EdmType::Int64 => match value {
                Value::String(s) => s.parse().map(EdmValue::Int64).map_err(|_| mismatch()),
                Value::Number(n) => n.as_i64().map(EdmValue::Int64).ok_or_else(mismatch),
                _ => Err(mismatch()),
            },
            EdmType::Double => match value {
                Value::Number(n) => n.as_f64().map(EdmValue::Double).ok_or_else(mismatch),
                Value::String(s) => parse_double(s).map(EdmValue::Double).ok_or_else(mismatch),
                _ => Err(mismatch()),
            },
            EdmType::Boolean => match value {
                Value::Bool(b) => Ok(EdmValue::Boolean(*b)),
                Value::String(s) if s == "true" => Ok(EdmValue::Boolean(true)),
                Value::String(s) if s == "false" => Ok(EdmValue::Boolean(false)),
                _ => Err(mismatch()),
            },
            EdmType::Guid => {
                let s = value.as_str().ok_or_else(mismatch)?;
                uuid::Uuid::parse_str(s).map_err(|_| mismatch())?;
                Ok(EdmValue::Guid(s.to_string()))
            }
            EdmType::Binary => {
                let s = value.as_str().ok_or_else(mismatch)?;
                base64::engine::general_purpose::STANDARD
                    .decode(s)
                    .map(EdmValue::Binary)
                    .map_err(|_| mismatch())
            }
            EdmType::DateTime => {
                let s = value.as_str().ok_or_else(mismatch)?;
                chrono::DateTime::parse_from_rfc3339(s).map_err(|_| mismatch())?;
                Ok(EdmValue::DateTime(s.to_string()))
            }
        }
    }

    /// Wire JSON for this value.
    ///
    /// Int64 travels as a string so JSON number precision cannot truncate it.
    pub fn to_json(&self) -> Value {
        match self {
            EdmValue::String(s) | EdmValue::Guid(s) | EdmValue::DateTime(s) => {
                Value::String(s.clone())
            }
            EdmValue::Int32(i) => Value::from(*i),
            EdmValue::Int64(i) => Value::String(i.to_string()),
            EdmValue::Double(d) => match serde_json::Number::from_f64(*d) {
                Some(n) => Value::Number(n),
                None => Value::String(format_non_finite(*d).to_string()),
            },
            EdmValue::Boolean(b) => Value::Bool(*b),
            EdmValue::Binary(bytes) => {
                Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
            }
        }
    }

    /// Whether bare JSON would lose this value's type, so the annotation must be
    /// emitted at every verbosity level.
    pub fn needs_annotation(&self) -> bool {
        match self {
            EdmValue::String(_) | EdmValue::Int32(_) | EdmValue::Boolean(_) => false,
            EdmValue::Double(d) => !d.is_finite() || d.fract() == 0.0,
            EdmValue::Int64(_) | EdmValue::Guid(_) | EdmValue::Binary(_) | EdmValue::DateTime(_) => {
                true
            }
        }
    }

    /// Whether a type annotation is emitted at all (full metadata annotates every
    /// type bare JSON cannot name).
    pub fn is_annotatable(&self) -> bool {
        !matches!(self, EdmValue::String(_) | EdmValue::Int32(_))
    }
}

impl fmt::Display for EdmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_json() {
            Value::String(s) => f.write_str(&s),
            other => write!(f, "{other}"),
        }
    }
}

fn parse_double(s: &str) -> Option<f64> {
    match s {
        NAN => Some(f64::NAN),
        INFINITY => Some(f64::INFINITY),
        NEG_INFINITY => Some(f64::NEG_INFINITY),
        _ => s.parse().ok(),
    }
}

fn format_non_finite(d: f64) -> &'static str {
    if d.is_nan() {
        NAN
    } else if d.is_sign_positive() {
        INFINITY
    } else {
        NEG_INFINITY
    }
}
