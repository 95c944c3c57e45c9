//! Conversion between JSON and script values.

use rhai::{Array, Dynamic, ImmutableString, Map};
use serde_json::{Number, Value};

use crate::error::ScriptError;

/// Converts JSON into a script value. `null` becomes unit.
pub fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from_bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Dynamic::from_int(i),
            None => Dynamic::from_float(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Dynamic::from(ImmutableString::from(s.as_str())),
        Value::Array(items) => Dynamic::from_array(items.iter().map(json_to_dynamic).collect()),
        Value::Object(fields) => {
            let map: Map = fields.iter().map(|(k, v)| (k.as_str().into(), json_to_dynamic(v))).collect();
            Dynamic::from_map(map)
        },
    }
}

/// Converts a script result back to JSON.
///
/// Containers count one level each; a result nested deeper than `max_depth`
/// is rejected. Values without a JSON form (functions, timestamps, custom
/// types, non-finite floats) are rejected too.
pub fn dynamic_to_json(value: &Dynamic, max_depth: usize) -> Result<Value, ScriptError> {
    convert(value, 0, max_depth)
}

fn convert(value: &Dynamic, depth: usize, max_depth: usize) -> Result<Value, ScriptError> {
    if value.is_unit() {
        return Ok(Value::Null);
    }
    if let Ok(b) = value.as_bool() {
        return Ok(Value::Bool(b));
    }
    if let Ok(i) = value.as_int() {
        return Ok(Value::from(i));
    }
    if let Ok(f) = value.as_float() {
        return Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| ScriptError::NotSerializable { type_name: format!("float {f}") });
    }
    if let Ok(c) = value.as_char() {
        return Ok(Value::String(c.to_string()));
    }
    if let Some(s) = value.read_lock::<ImmutableString>() {
        return Ok(Value::String(s.to_string()));
    }

    if value.is_array() || value.is_map() {
        let depth = depth + 1;
        if depth > max_depth {
            return Err(ScriptError::DepthExceeded { max_depth });
        }

        if let Some(items) = value.read_lock::<Array>() {
            return items
                .iter()
                .map(|item| convert(item, depth, max_depth))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array);
        }
        if let Some(fields) = value.read_lock::<Map>() {
            let mut out = serde_json::Map::with_capacity(fields.len());
            for (key, field) in fields.iter() {
                out.insert(key.to_string(), convert(field, depth, max_depth)?);
            }
            return Ok(Value::Object(out));
        }
    }

    Err(ScriptError::NotSerializable { type_name: value.type_name().to_string() })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn nested(depth: usize) -> Value {
        (0..depth).fold(json!(1), |inner, _| json!({ "child": inner }))
    }

    #[test]
    fn json_survives_the_trip() {
        let value = json!({"a": [1, 2.5, "x", null, true], "b": {"c": "d"}});
        let back = dynamic_to_json(&json_to_dynamic(&value), 50).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn depth_limit_counts_containers() {
        assert!(dynamic_to_json(&json_to_dynamic(&nested(50)), 50).is_ok());
        assert_eq!(
            dynamic_to_json(&json_to_dynamic(&nested(51)), 50),
            Err(ScriptError::DepthExceeded { max_depth: 50 })
        );
    }

    #[test]
    fn rejects_function_pointers() {
        let ptr = Dynamic::from(rhai::FnPtr::new("f").unwrap());
        let err = dynamic_to_json(&ptr, 50).unwrap_err();
        assert_eq!(err.code(), "SCRIPT_NOT_SERIALIZABLE");
    }

    #[test]
    fn rejects_non_finite_floats() {
        let err = dynamic_to_json(&Dynamic::from_float(f64::NAN), 50).unwrap_err();
        assert_eq!(err.code(), "SCRIPT_NOT_SERIALIZABLE");
    }
}
