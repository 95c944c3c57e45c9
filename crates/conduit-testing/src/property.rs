//! Shared proptest configuration and strategies.

use proptest::prelude::*;
use serde_json::{Map, Value};

/// Proptest configuration scaled by environment.
///
/// - `PROPTEST_CASES`: number of cases (default 20 locally, 100 in CI)
/// - `CI`: raises the default case count
pub fn proptest_config() -> ProptestConfig {
    let default_cases = if std::env::var("CI").is_ok() { 100 } else { 20 };
    let cases =
        std::env::var("PROPTEST_CASES").ok().and_then(|s| s.parse().ok()).unwrap_or(default_cases);

    ProptestConfig { cases, max_shrink_iters: 1000, ..ProptestConfig::default() }
}

/// Short lowercase identifiers usable as JSON keys.
pub fn field_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,7}"
}

/// Scalar JSON values.
pub fn json_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(Value::from),
        "[ -~]{0,16}".prop_map(Value::String),
    ]
}

/// JSON values nested up to three levels.
pub fn json_value() -> impl Strategy<Value = Value> {
    json_scalar().prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map(field_name(), inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect::<Map<_, _>>())),
        ]
    })
}

/// JSON objects, the shape every event payload has.
pub fn json_payload() -> impl Strategy<Value = Value> {
    prop::collection::btree_map(field_name(), json_value(), 0..6)
        .prop_map(|m| Value::Object(m.into_iter().collect::<Map<_, _>>()))
}
