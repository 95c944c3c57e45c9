//! Dot-notation field paths with `[]` array mapping.
//!
//! `patient.name` addresses a nested field. `items[].code` addresses `code`
//! in every element of `items`; reads return one result per element and
//! writes go back element by element.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    key: String,
    each: bool,
}

/// A parsed field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    segments: Vec<Segment>,
}

impl FieldPath {
    /// Parses `raw`. Empty segments are ignored.
    pub fn parse(raw: &str) -> Self {
        let segments = raw
            .split('.')
            .filter(|s| !s.is_empty())
            .map(|s| match s.strip_suffix("[]") {
                Some(key) => Segment { key: key.to_string(), each: true },
                None => Segment { key: s.to_string(), each: false },
            })
            .collect();
        Self { segments }
    }

    /// Whether the path addresses nothing.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Reads the path from `root`.
    pub fn get(&self, root: &Value) -> Resolved {
        if self.segments.is_empty() {
            return Resolved::Missing;
        }
        get_at(root, &self.segments)
    }

    /// Writes `resolved` into `root` at this path, creating objects as needed.
    ///
    /// Missing leaves are not written.
    pub fn set(&self, root: &mut Value, resolved: &Resolved) {
        if self.segments.is_empty() || resolved.is_missing() {
            return;
        }
        set_at(root, &self.segments, resolved);
    }
}

/// Result of reading a path.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// Nothing at the path.
    Missing,
    /// A single value.
    Value(Value),
    /// One result per element of an array segment.
    Each(Vec<Resolved>),
}

impl Resolved {
    /// Whether nothing was found.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    /// Flattens to a JSON value; missing elements become `null`.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Missing => Value::Null,
            Self::Value(v) => v.clone(),
            Self::Each(items) => Value::Array(items.iter().map(Self::to_value).collect()),
        }
    }

    /// Applies `f` to every leaf, `None` standing for a missing leaf.
    ///
    /// Returning `None` leaves the leaf missing.
    pub fn map_leaves<F>(self, f: &mut F) -> Self
    where
        F: FnMut(Option<Value>) -> Option<Value>,
    {
        match self {
            Self::Missing => f(None).map_or(Self::Missing, Self::Value),
            Self::Value(v) => f(Some(v)).map_or(Self::Missing, Self::Value),
            Self::Each(items) => Self::Each(items.into_iter().map(|i| i.map_leaves(f)).collect()),
        }
    }

    /// Leaves in depth-first order.
    pub fn leaves(&self) -> Vec<Option<&Value>> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<Option<&'a Value>>) {
        match self {
            Self::Missing => out.push(None),
            Self::Value(v) => out.push(Some(v)),
            Self::Each(items) => items.iter().for_each(|i| i.collect_leaves(out)),
        }
    }

    /// Rebuilds the same shape with leaves taken from `replacements` in
    /// depth-first order.
    pub fn replace_leaves<I>(&self, replacements: &mut I) -> Self
    where
        I: Iterator<Item = Option<Value>>,
    {
        match self {
            Self::Missing | Self::Value(_) => {
                replacements.next().flatten().map_or(Self::Missing, Self::Value)
            },
            Self::Each(items) => {
                Self::Each(items.iter().map(|i| i.replace_leaves(replacements)).collect())
            },
        }
    }
}

fn get_at(current: &Value, segments: &[Segment]) -> Resolved {
    let Some((segment, rest)) = segments.split_first() else {
        return Resolved::Value(current.clone());
    };
    let Some(child) = current.as_object().and_then(|m| m.get(&segment.key)) else {
        return Resolved::Missing;
    };

    if !segment.each {
        return get_at(child, rest);
    }

    match child {
        Value::Array(items) => {
            Resolved::Each(items.iter().map(|item| get_at(item, rest)).collect())
        },
        _ => Resolved::Missing,
    }
}

fn set_at(current: &mut Value, segments: &[Segment], resolved: &Resolved) {
    let Some((segment, rest)) = segments.split_first() else {
        return;
    };
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    let Value::Object(map) = current else {
        return;
    };

    if !segment.each {
        if rest.is_empty() {
            map.insert(segment.key.clone(), resolved.to_value());
        } else {
            let child = map.entry(segment.key.clone()).or_insert_with(|| Value::Object(Map::new()));
            set_at(child, rest, resolved);
        }
        return;
    }

    let slot = map.entry(segment.key.clone()).or_insert_with(|| Value::Array(Vec::new()));
    if !slot.is_array() {
        *slot = Value::Array(Vec::new());
    }
    let Value::Array(elements) = slot else {
        return;
    };

    match resolved {
        Resolved::Each(items) => {
            if elements.len() < items.len() {
                let filler = if rest.is_empty() { Value::Null } else { Value::Object(Map::new()) };
                elements.resize(items.len(), filler);
            }
            for (element, item) in elements.iter_mut().zip(items) {
                if item.is_missing() {
                    continue;
                }
                if rest.is_empty() {
                    *element = item.to_value();
                } else {
                    set_at(element, rest, item);
                }
            }
        },
        single => {
            for element in elements.iter_mut() {
                if rest.is_empty() {
                    *element = single.to_value();
                } else {
                    set_at(element, rest, single);
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn reads_nested_fields() {
        let payload = json!({"patient": {"name": {"first": "Ada"}}});
        assert_eq!(
            FieldPath::parse("patient.name.first").get(&payload),
            Resolved::Value(json!("Ada"))
        );
        assert!(FieldPath::parse("patient.age").get(&payload).is_missing());
    }

    #[test]
    fn reads_each_array_element() {
        let payload = json!({"items": [{"code": "A"}, {"other": 1}, {"code": "C"}]});
        let resolved = FieldPath::parse("items[].code").get(&payload);

        assert_eq!(
            resolved,
            Resolved::Each(vec![
                Resolved::Value(json!("A")),
                Resolved::Missing,
                Resolved::Value(json!("C")),
            ])
        );
    }

    #[test]
    fn writes_create_intermediate_objects() {
        let mut out = json!({});
        FieldPath::parse("a.b.c").set(&mut out, &Resolved::Value(json!(1)));
        assert_eq!(out, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn each_to_each_writes_per_element() {
        let mut out = json!({"items": [{"code": "A"}, {"code": "B"}]});
        let resolved = Resolved::Each(vec![Resolved::Value(json!("x")), Resolved::Value(json!("y"))]);

        FieldPath::parse("items[].mapped").set(&mut out, &resolved);

        assert_eq!(
            out,
            json!({"items": [{"code": "A", "mapped": "x"}, {"code": "B", "mapped": "y"}]})
        );
    }

    #[test]
    fn each_into_plain_target_writes_array() {
        let mut out = json!({});
        let resolved = Resolved::Each(vec![Resolved::Value(json!(1)), Resolved::Value(json!(2))]);

        FieldPath::parse("codes").set(&mut out, &resolved);

        assert_eq!(out, json!({"codes": [1, 2]}));
    }

    #[test]
    fn single_into_each_target_broadcasts() {
        let mut out = json!({"items": [{"a": 1}, {"a": 2}]});
        FieldPath::parse("items[].system").set(&mut out, &Resolved::Value(json!("X")));
        assert_eq!(out, json!({"items": [{"a": 1, "system": "X"}, {"a": 2, "system": "X"}]}));
    }

    #[test]
    fn missing_is_never_written() {
        let mut out = json!({"keep": true});
        FieldPath::parse("gone").set(&mut out, &Resolved::Missing);
        assert_eq!(out, json!({"keep": true}));
    }

    #[test]
    fn leaves_round_trip_through_replace() {
        let resolved =
            Resolved::Each(vec![Resolved::Value(json!("a")), Resolved::Missing, Resolved::Value(json!("c"))]);
        let leaves: Vec<Option<Value>> =
            resolved.leaves().into_iter().map(|l| l.map(|v| json!(format!("{v}!")))).collect();

        let replaced = resolved.replace_leaves(&mut leaves.into_iter());

        assert_eq!(replaced.to_value(), json!(["\"a\"!", null, "\"c\"!"]));
    }
}
