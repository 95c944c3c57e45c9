//! Lenient date parsing shared by mappings, scripts and scheduling.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;

/// Parses RFC 3339, `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS` (and the `T`
/// variant without offset). Offset-less forms are read as UTC.
pub fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Epoch milliseconds to a timestamp.
pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
}

/// Formats as ISO-8601 UTC with millisecond precision, e.g.
/// `2025-03-01T10:00:00.000Z`.
pub fn to_iso_millis(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Reads a JSON value as a point in time: strings are parsed, integers are
/// epoch milliseconds.
pub fn value_to_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_datetime(s),
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).and_then(from_millis),
        _ => None,
    }
}

/// Normalizes any accepted date form to ISO millis; `None` if unparseable.
pub fn normalize(value: &Value) -> Option<String> {
    value_to_datetime(value).map(|dt| to_iso_millis(&dt))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn accepts_supported_formats() {
        let expected = "2025-03-01T10:30:00.000Z";
        assert_eq!(normalize(&json!("2025-03-01T10:30:00Z")).as_deref(), Some(expected));
        assert_eq!(normalize(&json!("2025-03-01T12:30:00+02:00")).as_deref(), Some(expected));
        assert_eq!(normalize(&json!("2025-03-01 10:30:00")).as_deref(), Some(expected));
        assert_eq!(
            normalize(&json!("2025-03-01")).as_deref(),
            Some("2025-03-01T00:00:00.000Z")
        );
        assert_eq!(normalize(&json!(1_740_825_000_000_i64)).as_deref(), Some(expected));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(normalize(&json!("next tuesday")), None);
        assert_eq!(normalize(&json!(true)), None);
    }
}
