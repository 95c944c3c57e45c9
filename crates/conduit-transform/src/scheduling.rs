//! Delayed and recurring delivery times computed by tenant scripts.

use conduit_core::models::{CancellationInfo, DeliveryMode, RecurringConfig};
use serde_json::Value;

use crate::{
    context::TransformContext,
    dates,
    error::SchedulingError,
    path::{FieldPath, Resolved},
    sandbox::ScriptSandbox,
};

/// Smallest recurrence interval.
pub const MIN_INTERVAL_MS: i64 = 60_000;

/// Furthest a delayed delivery may be scheduled ahead, 365 days.
pub const MAX_SCHEDULE_AHEAD_MS: i64 = 365 * 24 * 60 * 60 * 1000;

const PATIENT_ID_FIELDS: [&str; 5] =
    ["patientId", "patient_id", "patientRid", "patient.id", "patient.rid"];

const DATETIME_FIELDS: [&str; 5] = [
    "scheduledDateTime",
    "scheduled_date_time",
    "appointmentDateTime",
    "startDateTime",
    "appointment.startDateTime",
];

/// Validated result of a scheduling script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// One delivery at the given epoch ms.
    Delayed {
        /// Delivery time.
        at_ms: i64,
    },
    /// Repeating deliveries; the first row fires at `first_occurrence`.
    Recurring(RecurringConfig),
}

impl ScheduleOutcome {
    /// When the first row is due.
    pub fn first_due_ms(&self) -> i64 {
        match self {
            Self::Delayed { at_ms } => *at_ms,
            Self::Recurring(config) => config.first_occurrence,
        }
    }

    /// Recurrence settings, if any.
    pub fn recurring(&self) -> Option<RecurringConfig> {
        match self {
            Self::Delayed { .. } => None,
            Self::Recurring(config) => Some(*config),
        }
    }
}

/// Runs a scheduling script and validates its result for `mode`.
///
/// A `DELAYED` script returns a timestamp (epoch ms or date string). A
/// `RECURRING` script returns `{firstOccurrence, intervalMs,
/// maxOccurrences | endDate}`. Times are checked against the sandbox clock
/// after the script has finished.
///
/// # Errors
///
/// Returns [`SchedulingError`] when the script fails, returns the wrong
/// shape, or yields times outside the accepted window.
pub async fn execute_scheduling_script(
    sandbox: &ScriptSandbox,
    script: &str,
    mode: DeliveryMode,
    payload: &Value,
    context: &TransformContext,
) -> Result<ScheduleOutcome, SchedulingError> {
    let result = sandbox.run(script, payload, &context.to_value()).await?;
    let now_ms = sandbox.clock().now_millis();

    match mode {
        DeliveryMode::Delayed => validate_delayed(&result, now_ms),
        DeliveryMode::Recurring => validate_recurring(&result, now_ms),
        DeliveryMode::Immediate => Err(SchedulingError::InvalidResult {
            reason: "rule delivers immediately and has no schedule".into(),
        }),
    }
}

/// Checks a delayed delivery time against `now_ms`.
///
/// # Errors
///
/// Returns an error unless the value is a time strictly after `now_ms` and
/// at most [`MAX_SCHEDULE_AHEAD_MS`] later.
pub fn validate_delayed(result: &Value, now_ms: i64) -> Result<ScheduleOutcome, SchedulingError> {
    let at_ms = timestamp(result, "result")?;
    check_window(at_ms, now_ms)?;
    Ok(ScheduleOutcome::Delayed { at_ms })
}

/// Checks a recurrence object against `now_ms`.
///
/// # Errors
///
/// Returns an error for a missing or past `firstOccurrence`, an interval
/// below [`MIN_INTERVAL_MS`], or anything but exactly one valid end
/// condition.
pub fn validate_recurring(result: &Value, now_ms: i64) -> Result<ScheduleOutcome, SchedulingError> {
    let Some(fields) = result.as_object() else {
        return Err(SchedulingError::InvalidResult {
            reason: "expected an object with firstOccurrence and intervalMs".into(),
        });
    };

    let first_occurrence = present(fields, "firstOccurrence")
        .ok_or_else(|| invalid("firstOccurrence is required"))
        .and_then(|v| timestamp(v, "firstOccurrence"))?;
    if first_occurrence <= now_ms {
        return Err(SchedulingError::NotInFuture { at_ms: first_occurrence });
    }

    let interval_ms = present(fields, "intervalMs")
        .and_then(as_integer)
        .ok_or_else(|| invalid("intervalMs must be a number"))?;
    if interval_ms < MIN_INTERVAL_MS {
        return Err(SchedulingError::IntervalTooShort { interval_ms, min_ms: MIN_INTERVAL_MS });
    }

    let max_occurrences = present(fields, "maxOccurrences")
        .map(|v| as_integer(v).ok_or_else(|| end_condition("maxOccurrences must be a number")))
        .transpose()?;
    let end_date = present(fields, "endDate").map(|v| timestamp(v, "endDate")).transpose()?;

    match (max_occurrences, end_date) {
        (Some(_), Some(_)) => {
            return Err(end_condition("give either maxOccurrences or endDate, not both"))
        },
        (None, None) => return Err(end_condition("maxOccurrences or endDate is required")),
        (Some(max), None) if max < 1 => return Err(end_condition("maxOccurrences must be at least 1")),
        (None, Some(end)) if end < first_occurrence => {
            return Err(end_condition("endDate is before firstOccurrence"))
        },
        _ => {},
    }

    Ok(ScheduleOutcome::Recurring(RecurringConfig {
        first_occurrence,
        interval_ms,
        max_occurrences,
        end_date,
        occurrence_number: 1,
    }))
}

/// Epoch ms of occurrence `n` (1-based), or `None` when the series has no
/// such occurrence.
pub fn calculate_next_occurrence(config: &RecurringConfig, n: i64) -> Option<i64> {
    if n < 1 {
        return None;
    }
    if config.max_occurrences.is_some_and(|max| n > max) {
        return None;
    }

    let at = (n - 1)
        .checked_mul(config.interval_ms)
        .and_then(|offset| config.first_occurrence.checked_add(offset))?;

    if config.end_date.is_some_and(|end| at > end) {
        return None;
    }
    Some(at)
}

/// Reads cancellation criteria from an event payload.
///
/// The patient id is required; the appointment time is normalized to ISO
/// millis when it parses and kept verbatim otherwise.
pub fn extract_cancellation_info(payload: &Value) -> Option<CancellationInfo> {
    let patient_id = first_present(payload, &PATIENT_ID_FIELDS).and_then(|v| match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })?;

    let scheduled_date_time = first_present(payload, &DATETIME_FIELDS).and_then(|v| {
        dates::normalize(&v).or_else(|| v.as_str().map(str::to_string))
    });

    Some(CancellationInfo { patient_id, scheduled_date_time })
}

fn first_present(payload: &Value, fields: &[&str]) -> Option<Value> {
    fields.iter().find_map(|field| match FieldPath::parse(field).get(payload) {
        Resolved::Value(value) if !value.is_null() => Some(value),
        _ => None,
    })
}

fn present<'a>(fields: &'a serde_json::Map<String, Value>, key: &str) -> Option<&'a Value> {
    fields.get(key).filter(|v| !v.is_null())
}

fn timestamp(value: &Value, field: &str) -> Result<i64, SchedulingError> {
    dates::value_to_datetime(value)
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| invalid(&format!("{field} is not a timestamp or date")))
}

fn check_window(at_ms: i64, now_ms: i64) -> Result<(), SchedulingError> {
    if at_ms <= now_ms {
        return Err(SchedulingError::NotInFuture { at_ms });
    }
    if at_ms - now_ms > MAX_SCHEDULE_AHEAD_MS {
        return Err(SchedulingError::TooFarAhead { at_ms });
    }
    Ok(())
}

fn as_integer(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| value.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
}

fn invalid(reason: &str) -> SchedulingError {
    SchedulingError::InvalidResult { reason: reason.to_string() }
}

fn end_condition(reason: &str) -> SchedulingError {
    SchedulingError::InvalidEndCondition { reason: reason.to_string() }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const NOW: i64 = 1_740_825_000_000;
    const HOUR: i64 = 3_600_000;
    const DAY: i64 = 24 * HOUR;

    fn series(max: Option<i64>, end: Option<i64>) -> RecurringConfig {
        RecurringConfig {
            first_occurrence: NOW + HOUR,
            interval_ms: DAY,
            max_occurrences: max,
            end_date: end,
            occurrence_number: 1,
        }
    }

    #[test]
    fn delayed_window_is_enforced() {
        assert!(matches!(
            validate_delayed(&json!(NOW - 1), NOW),
            Err(SchedulingError::NotInFuture { .. })
        ));
        assert!(matches!(
            validate_delayed(&json!(NOW + 400 * DAY), NOW),
            Err(SchedulingError::TooFarAhead { .. })
        ));
        assert_eq!(
            validate_delayed(&json!(NOW + 2 * HOUR), NOW).unwrap(),
            ScheduleOutcome::Delayed { at_ms: NOW + 2 * HOUR }
        );
    }

    #[test]
    fn delayed_accepts_date_strings() {
        let outcome = validate_delayed(&json!("2025-03-02T10:30:00Z"), NOW).unwrap();
        assert_eq!(outcome.first_due_ms(), NOW + DAY);
    }

    #[test]
    fn recurring_requires_exactly_one_end_condition() {
        let base = json!({"firstOccurrence": NOW + HOUR, "intervalMs": DAY});
        assert!(matches!(
            validate_recurring(&base, NOW),
            Err(SchedulingError::InvalidEndCondition { .. })
        ));

        let both = json!({
            "firstOccurrence": NOW + HOUR, "intervalMs": DAY,
            "maxOccurrences": 3, "endDate": NOW + 10 * DAY
        });
        assert!(matches!(
            validate_recurring(&both, NOW),
            Err(SchedulingError::InvalidEndCondition { .. })
        ));

        let ok = json!({"firstOccurrence": NOW + HOUR, "intervalMs": DAY, "maxOccurrences": 3});
        assert_eq!(
            validate_recurring(&ok, NOW).unwrap().recurring(),
            Some(series(Some(3), None))
        );
    }

    #[test]
    fn recurring_rejects_short_interval_and_zero_count() {
        let short = json!({"firstOccurrence": NOW + HOUR, "intervalMs": 59_999, "maxOccurrences": 2});
        assert_eq!(validate_recurring(&short, NOW).unwrap_err().code(), "SCHEDULING_INTERVAL_TOO_SHORT");

        let zero = json!({"firstOccurrence": NOW + HOUR, "intervalMs": DAY, "maxOccurrences": 0});
        assert_eq!(validate_recurring(&zero, NOW).unwrap_err().code(), "SCHEDULING_INVALID_END_CONDITION");
    }

    #[test]
    fn recurring_end_date_must_follow_first() {
        let value = json!({"firstOccurrence": NOW + DAY, "intervalMs": DAY, "endDate": NOW + HOUR});
        assert_eq!(validate_recurring(&value, NOW).unwrap_err().code(), "SCHEDULING_INVALID_END_CONDITION");
    }

    #[test]
    fn occurrences_follow_the_interval() {
        let config = series(Some(5), None);
        assert_eq!(calculate_next_occurrence(&config, 1), Some(NOW + HOUR));
        assert_eq!(calculate_next_occurrence(&config, 3), Some(NOW + HOUR + 2 * DAY));
        assert_eq!(calculate_next_occurrence(&config, 5), Some(NOW + HOUR + 4 * DAY));
        assert_eq!(calculate_next_occurrence(&config, 6), None);
        assert_eq!(calculate_next_occurrence(&config, 0), None);
    }

    #[test]
    fn end_date_bounds_occurrences() {
        let config = series(None, Some(NOW + HOUR + 2 * DAY));
        assert!(calculate_next_occurrence(&config, 3).is_some());
        assert_eq!(calculate_next_occurrence(&config, 4), None);
    }

    #[test]
    fn cancellation_info_reads_alternate_spellings() {
        let info = extract_cancellation_info(&json!({
            "patient": {"rid": 42},
            "appointment": {"startDateTime": "2025-03-01 10:30:00"}
        }))
        .unwrap();
        assert_eq!(info.patient_id, "42");
        assert_eq!(info.scheduled_date_time.as_deref(), Some("2025-03-01T10:30:00.000Z"));

        let info = extract_cancellation_info(&json!({"patient_id": "P-1"})).unwrap();
        assert_eq!(info.patient_id, "P-1");
        assert_eq!(info.scheduled_date_time, None);

        assert_eq!(extract_cancellation_info(&json!({"other": 1})), None);
    }
}
