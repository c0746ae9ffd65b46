//! Entity normalization
//!
//! Converts between wire JSON and the [`Entity`] model:
//!
//! - [`normalize`] validates keys, infers or checks property types and returns a
//!   [`NewEntity`] ready to be stamped by storage.
//! - [`Entity::to_response_json`] renders an entity at a verbosity level with the
//!   `odata.*` annotations supplied by the annotator, honouring `$select`.

use std::collections::HashSet;

use serde_json::{Map, Value};

use super::{
    validate_key, Entity, PropertyBag, Timestamp, MAX_PROPERTY_NAME_LENGTH, PARTITION_KEY,
    RESERVED_PROPERTIES, ROW_KEY, TIMESTAMP,
};
use crate::odata::{EntityAnnotations, Verbosity};
use crate::value::{EdmType, EdmValue, TYPE_ANNOTATION_SUFFIX};

/// Prefix shared by response-only annotation keys (`odata.etag`, `odata.metadata`, ...).
const ODATA_PREFIX: &str = "odata.";

/// Normalization failure, always attributable to one field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    /// PartitionKey or RowKey is absent or empty
    #[error("The required property '{0}' is missing")]
    MissingKey(&'static str),

    /// A property failed validation
    #[error("Property '{field}': {reason}")]
    InvalidProperty { field: String, reason: String },
}

impl NormalizeError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        NormalizeError::InvalidProperty {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// A validated entity that has not been stored yet (no ETag, no Timestamp).
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntity {
    pub partition_key: String,
    pub row_key: String,
    pub properties: PropertyBag,
}

impl NewEntity {
    pub fn into_entity(self, timestamp: Timestamp, etag: String) -> Entity {
        Entity {
            partition_key: self.partition_key,
            row_key: self.row_key,
            properties: self.properties,
            etag,
            timestamp,
        }
    }
}

/// Validate and canonicalize a wire entity.
///
/// `Timestamp` and `odata.*` keys are server-managed and dropped, so a response body
/// can be sent back unchanged. Null properties are dropped.
pub fn normalize(raw: &Map<String, Value>) -> Result<NewEntity, NormalizeError> {
    let partition_key = key_property(raw, PARTITION_KEY)?;
    let row_key = key_property(raw, ROW_KEY)?;

    let mut properties = PropertyBag::with_capacity(raw.len());
    for (name, value) in raw {
        if name == PARTITION_KEY || name == ROW_KEY || name.starts_with(ODATA_PREFIX) {
            continue;
        }

        if let Some(base) = name.strip_suffix(TYPE_ANNOTATION_SUFFIX) {
            if base.is_empty() || !raw.contains_key(base) {
                return Err(NormalizeError::invalid(
                    name,
                    "type annotation has no matching property",
                ));
            }
            continue;
        }

        if name == TIMESTAMP {
            continue;
        }
        validate_property_name(name)?;

        if value.is_null() {
            continue;
        }

        let annotation = raw.get(&format!("{name}{TYPE_ANNOTATION_SUFFIX}"));
        let typed = match annotation {
            None => EdmValue::infer(value),
            Some(Value::String(declared)) => match EdmType::from_annotation(declared) {
                Some(ty) => EdmValue::with_type(value, ty),
                None => Err(format!("unsupported type annotation '{declared}'")),
            },
            Some(other) => Err(format!("type annotation {other} is not a string")),
        }
        .map_err(|reason| NormalizeError::invalid(name, reason))?;

        properties.insert(name.clone(), typed);
    }

    Ok(NewEntity {
        partition_key,
        row_key,
        properties,
    })
}

fn key_property(raw: &Map<String, Value>, field: &'static str) -> Result<String, NormalizeError> {
    match raw.get(field) {
        None | Some(Value::Null) => Err(NormalizeError::MissingKey(field)),
        Some(Value::String(s)) if s.is_empty() => Err(NormalizeError::MissingKey(field)),
        Some(Value::String(s)) => {
            validate_key(field, s).map_err(|reason| NormalizeError::invalid(field, reason))?;
            Ok(s.clone())
        }
        Some(_) => Err(NormalizeError::invalid(field, "key must be a string")),
    }
}

fn validate_property_name(name: &str) -> Result<(), NormalizeError> {
    if name.is_empty() {
        return Err(NormalizeError::invalid(name, "property name must not be empty"));
    }
    if name.chars().count() > MAX_PROPERTY_NAME_LENGTH {
        return Err(NormalizeError::invalid(
            name,
            format!("property name exceeds {MAX_PROPERTY_NAME_LENGTH} characters"),
        ));
    }
    if RESERVED_PROPERTIES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
    {
        return Err(NormalizeError::invalid(
            name,
            "property name collides with a system property",
        ));
    }
    Ok(())
}

impl Entity {
    /// Render the entity as a wire JSON object.
    ///
    /// Annotations come first (`odata.metadata`, `odata.type`, `odata.id`, `odata.etag`,
    /// `odata.editLink`), then the keys, `Timestamp`, and the properties in insertion
    /// order. A property's `@odata.type` sibling directly precedes its value.
    pub fn to_response_json(
        &self,
        verbosity: Verbosity,
        annotations: &EntityAnnotations,
        select: Option<&HashSet<String>>,
    ) -> Map<String, Value> {
        let mut out = Map::new();

        let mut annotate = |key: &str, value: &Option<String>| {
            if let Some(v) = value {
                out.insert(key.to_string(), Value::String(v.clone()));
            }
        };
        annotate("odata.metadata", &annotations.metadata);
        annotate("odata.type", &annotations.odata_type);
        annotate("odata.id", &annotations.id);
        if verbosity != Verbosity::None {
            out.insert("odata.etag".to_string(), Value::String(self.etag.clone()));
        }
        if let Some(link) = &annotations.edit_link {
            out.insert("odata.editLink".to_string(), Value::String(link.clone()));
        }

        out.insert(
            PARTITION_KEY.to_string(),
            Value::String(self.partition_key.clone()),
        );
        out.insert(ROW_KEY.to_string(), Value::String(self.row_key.clone()));
        if verbosity == Verbosity::Full {
            out.insert(
                format!("{TIMESTAMP}{TYPE_ANNOTATION_SUFFIX}"),
                Value::String(EdmType::DateTime.as_str().to_string()),
            );
        }
        out.insert(
            TIMESTAMP.to_string(),
            Value::String(self.timestamp.to_rfc3339()),
        );

        for (name, value) in &self.properties {
            if select.is_some_and(|set| !set.contains(name)) {
                continue;
            }
            let annotated = value.needs_annotation()
                || (verbosity == Verbosity::Full && value.is_annotatable());
            if annotated {
                out.insert(
                    format!("{name}{TYPE_ANNOTATION_SUFFIX}"),
                    Value::String(value.edm_type().as_str().to_string()),
                );
            }
            out.insert(name.clone(), value.to_json());
        }

        out
    }

    /// [`Entity::to_response_json`] as compact JSON text.
    pub fn to_response_string(
        &self,
        verbosity: Verbosity,
        annotations: &EntityAnnotations,
        select: Option<&HashSet<String>>,
    ) -> String {
        Value::Object(self.to_response_json(verbosity, annotations, select)).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    fn stored(raw: Value) -> Entity {
        normalize(&object(raw))
            .unwrap()
            .into_entity(Timestamp::from_ticks(0), "W/\"etag\"".to_string())
    }

    #[test]
    fn test_normalize_infers_types_in_order() {
        let e = normalize(&object(json!({
            "PartitionKey": "p",
            "RowKey": "r",
            "Name": "foo",
            "Count": 3,
            "Ratio": 0.5,
            "Active": true
        })))
        .unwrap();
        let names: Vec<_> = e.properties.keys().cloned().collect();
        assert_eq!(names, vec!["Name", "Count", "Ratio", "Active"]);
        assert_eq!(e.properties["Count"], EdmValue::Int32(3));
        assert_eq!(e.properties["Ratio"], EdmValue::Double(0.5));
    }

    #[test]
    fn test_normalize_explicit_annotations() {
        let e = normalize(&object(json!({
            "PartitionKey": "p",
            "RowKey": "r",
            "Big": "123456789012",
            "Big@odata.type": "Edm.Int64",
            "When@odata.type": "Edm.DateTime",
            "When": "2021-04-15T23:09:46.5446473Z"
        })))
        .unwrap();
        assert_eq!(e.properties["Big"], EdmValue::Int64(123_456_789_012));
        assert_eq!(e.properties["When"].edm_type(), EdmType::DateTime);
    }

    #[test]
    fn test_normalize_missing_keys() {
        let err = normalize(&object(json!({"RowKey": "r"}))).unwrap_err();
        assert_eq!(err, NormalizeError::MissingKey(PARTITION_KEY));
        let err = normalize(&object(json!({"PartitionKey": "p", "RowKey": ""}))).unwrap_err();
        assert_eq!(err, NormalizeError::MissingKey(ROW_KEY));
    }

    #[test]
    fn test_normalize_rejects_bad_key_characters() {
        let err = normalize(&object(json!({"PartitionKey": "a/b", "RowKey": "r"}))).unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidProperty { ref field, .. } if field == PARTITION_KEY));
    }

    #[test]
    fn test_normalize_rejects_dangling_annotation() {
        let err = normalize(&object(json!({
            "PartitionKey": "p",
            "RowKey": "r",
            "Ghost@odata.type": "Edm.Int64"
        })))
        .unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidProperty { ref field, .. } if field == "Ghost@odata.type"));
    }

    #[test]
    fn test_normalize_rejects_unsupported_annotation() {
        let err = normalize(&object(json!({
            "PartitionKey": "p",
            "RowKey": "r",
            "Name": "x",
            "Name@odata.type": "Edm.String"
        })))
        .unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidProperty { .. }));
    }

    #[test]
    fn test_normalize_rejects_reserved_name_variants() {
        let err = normalize(&object(json!({
            "PartitionKey": "p",
            "RowKey": "r",
            "partitionkey": "x"
        })))
        .unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidProperty { .. }));
    }

    #[test]
    fn test_normalize_drops_server_managed_fields() {
        let e = normalize(&object(json!({
            "odata.etag": "W/\"x\"",
            "PartitionKey": "p",
            "RowKey": "r",
            "Timestamp": "2021-01-01T00:00:00Z",
            "Note": null
        })))
        .unwrap();
        assert!(e.properties.is_empty());
    }

    #[test]
    fn test_normalize_rejects_nested_values() {
        let err = normalize(&object(json!({"PartitionKey": "p", "RowKey": "r", "L": [1]})))
            .unwrap_err();
        assert!(matches!(err, NormalizeError::InvalidProperty { ref field, .. } if field == "L"));
    }

    #[test]
    fn test_response_nometadata_has_no_odata_keys() {
        let e = stored(json!({"PartitionKey": "p", "RowKey": "r", "Value": "foo"}));
        let json = e.to_response_json(Verbosity::None, &EntityAnnotations::default(), None);
        assert!(json.keys().all(|k| !k.starts_with("odata.")));
        assert_eq!(json["Value"], json!("foo"));
    }

    #[test]
    fn test_response_minimal_has_etag() {
        let e = stored(json!({"PartitionKey": "p", "RowKey": "r"}));
        let json = e.to_response_json(Verbosity::Minimal, &EntityAnnotations::default(), None);
        assert_eq!(json["odata.etag"], json!("W/\"etag\""));
    }

    #[test]
    fn test_response_annotation_placement() {
        let e = stored(json!({
            "PartitionKey": "p",
            "RowKey": "r",
            "Big": "5",
            "Big@odata.type": "Edm.Int64",
            "Flag": true
        }));
        let minimal = e.to_response_string(Verbosity::Minimal, &EntityAnnotations::default(), None);
        assert!(minimal.contains(r#""Big@odata.type":"Edm.Int64","Big":"5""#));
        assert!(!minimal.contains("Flag@odata.type"));

        let full = e.to_response_string(Verbosity::Full, &EntityAnnotations::default(), None);
        assert!(full.contains(r#""Flag@odata.type":"Edm.Boolean","Flag":true"#));
        assert!(full.contains(r#""Timestamp@odata.type":"Edm.DateTime""#));
    }

    #[test]
    fn test_response_select_keeps_system_properties() {
        let e = stored(json!({"PartitionKey": "p", "RowKey": "r", "A": 1, "B": 2}));
        let select: HashSet<String> = ["B".to_string()].into_iter().collect();
        let json = e.to_response_json(Verbosity::None, &EntityAnnotations::default(), Some(&select));
        let keys: Vec<_> = json.keys().cloned().collect();
        assert_eq!(keys, vec!["PartitionKey", "RowKey", "Timestamp", "B"]);
    }

    #[test]
    fn test_response_then_normalize_preserves_properties() {
        let e = stored(json!({
            "PartitionKey": "p",
            "RowKey": "r",
            "S": "s",
            "I": 1,
            "D": 2.0,
            "D@odata.type": "Edm.Double",
            "L": "99",
            "L@odata.type": "Edm.Int64",
            "G": "00000000-0000-0000-0000-000000000001",
            "G@odata.type": "Edm.Guid",
            "B": "AAEC",
            "B@odata.type": "Edm.Binary"
        }));
        for verbosity in [Verbosity::None, Verbosity::Minimal, Verbosity::Full] {
            let wire = e.to_response_json(verbosity, &EntityAnnotations::default(), None);
            let back = normalize(&wire).unwrap();
            assert_eq!(back.properties, e.properties, "{verbosity:?}");
        }
    }
}
