//! Declarative field mapping.

use conduit_core::models::{FieldMapping, FieldTransform, SimpleTransform};
use serde_json::Value;

use crate::{
    dates,
    path::{FieldPath, Resolved},
};

/// Applies `config` over `payload`.
///
/// The output starts as a copy of the payload, so unmapped fields survive.
/// Sources are always read from the original payload. A missing source is
/// omitted unless the mapping carries a default. Static fields are written
/// last and win over mappings.
pub fn apply_mappings(payload: &Value, config: &SimpleTransform) -> Value {
    let mut output = payload.clone();

    for mapping in &config.mappings {
        let resolved = map_field(payload, mapping);
        FieldPath::parse(&mapping.target_field).set(&mut output, &resolved);
    }

    for field in &config.static_fields {
        FieldPath::parse(&field.key).set(&mut output, &Resolved::Value(field.value.clone()));
    }

    output
}

fn map_field(payload: &Value, mapping: &FieldMapping) -> Resolved {
    let source = FieldPath::parse(&mapping.source_field).get(payload);
    let default = mapping.default_value.as_ref();

    source.map_leaves(&mut |leaf| match leaf {
        None => default.cloned(),
        Some(Value::Null) if mapping.transform == Some(FieldTransform::Default) => {
            Some(default.cloned().unwrap_or(Value::Null))
        },
        Some(value) => Some(apply_field_transform(value, mapping.transform)),
    })
}

/// Applies one per-value transform. Values the transform does not apply to
/// pass through unchanged.
pub fn apply_field_transform(value: Value, transform: Option<FieldTransform>) -> Value {
    let Some(transform) = transform else {
        return value;
    };

    match (transform, value) {
        (FieldTransform::Trim, Value::String(s)) => Value::String(s.trim().to_string()),
        (FieldTransform::Upper, Value::String(s)) => Value::String(s.to_uppercase()),
        (FieldTransform::Lower, Value::String(s)) => Value::String(s.to_lowercase()),
        (FieldTransform::Date, value @ (Value::String(_) | Value::Number(_))) => {
            dates::normalize(&value).map_or(value, Value::String)
        },
        (_, value) => value,
    }
}

#[cfg(test)]
mod tests {
    use conduit_core::models::StaticField;
    use serde_json::json;

    use super::*;

    fn mapping(source: &str, target: &str, transform: Option<FieldTransform>) -> FieldMapping {
        FieldMapping {
            source_field: source.into(),
            target_field: target.into(),
            transform,
            default_value: None,
        }
    }

    #[test]
    fn preserves_original_fields_and_adds_targets() {
        let payload = json!({"firstName": "  Ada ", "id": 7});
        let config = SimpleTransform {
            mappings: vec![mapping("firstName", "patient.name", Some(FieldTransform::Trim))],
            static_fields: vec![],
        };

        let out = apply_mappings(&payload, &config);

        assert_eq!(out["patient"]["name"], json!("Ada"));
        assert_eq!(out["id"], json!(7));
        assert_eq!(out["firstName"], json!("  Ada "));
    }

    #[test]
    fn missing_source_is_omitted() {
        let payload = json!({"a": 1});
        let config = SimpleTransform {
            mappings: vec![mapping("nope", "target", None)],
            static_fields: vec![],
        };

        let out = apply_mappings(&payload, &config);

        assert!(out.get("target").is_none());
    }

    #[test]
    fn missing_source_with_default_writes_default() {
        let mut m = mapping("nope", "target", None);
        m.default_value = Some(json!("fallback"));
        let config = SimpleTransform { mappings: vec![m], static_fields: vec![] };

        let out = apply_mappings(&json!({}), &config);

        assert_eq!(out["target"], json!("fallback"));
    }

    #[test]
    fn default_transform_replaces_null() {
        let mut m = mapping("status", "status", Some(FieldTransform::Default));
        m.default_value = Some(json!("UNKNOWN"));
        let config = SimpleTransform { mappings: vec![m], static_fields: vec![] };

        let out = apply_mappings(&json!({"status": null}), &config);

        assert_eq!(out["status"], json!("UNKNOWN"));
    }

    #[test]
    fn string_transforms_skip_non_strings() {
        assert_eq!(apply_field_transform(json!(5), Some(FieldTransform::Upper)), json!(5));
        assert_eq!(apply_field_transform(json!("ab"), Some(FieldTransform::Upper)), json!("AB"));
        assert_eq!(apply_field_transform(json!("AB"), Some(FieldTransform::Lower)), json!("ab"));
    }

    #[test]
    fn date_transform_normalizes_or_passes_through() {
        assert_eq!(
            apply_field_transform(json!("2025-03-01"), Some(FieldTransform::Date)),
            json!("2025-03-01T00:00:00.000Z")
        );
        assert_eq!(
            apply_field_transform(json!("soon"), Some(FieldTransform::Date)),
            json!("soon")
        );
    }

    #[test]
    fn array_mapping_applies_per_element() {
        let payload = json!({"items": [{"code": "a"}, {"code": "b"}]});
        let config = SimpleTransform {
            mappings: vec![mapping("items[].code", "items[].code", Some(FieldTransform::Upper))],
            static_fields: vec![],
        };

        let out = apply_mappings(&payload, &config);

        assert_eq!(out["items"], json!([{"code": "A"}, {"code": "B"}]));
    }

    #[test]
    fn static_fields_are_written_last() {
        let config = SimpleTransform {
            mappings: vec![mapping("a", "source", None)],
            static_fields: vec![StaticField { key: "source".into(), value: json!("conduit") }],
        };

        let out = apply_mappings(&json!({"a": "x"}), &config);

        assert_eq!(out["source"], json!("conduit"));
    }
}
