//! Read-only context handed to transform and scheduling scripts.

use chrono::{DateTime, Utc};
use conduit_core::models::{Event, IntegrationRule};
use serde::Serialize;
use serde_json::Value;

use crate::dates;

/// Event and rule facts visible to a script as `context`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformContext {
    /// Event type
    pub event_type: String,
    /// Source event id, absent for detached runs
    pub event_id: Option<i64>,
    /// Organization
    pub org_id: i64,
    /// Unit the event belongs to
    pub org_unit_id: Option<i64>,
    /// Rule being evaluated
    pub rule_id: String,
    /// Rule display name
    pub rule_name: String,
    /// Event time as ISO-8601 millis
    pub timestamp: String,
}

impl TransformContext {
    /// Context for delivering `event` under `rule`.
    pub fn for_event(event: &Event, rule: &IntegrationRule) -> Self {
        Self {
            event_type: event.event_type.clone(),
            event_id: Some(event.id.0),
            org_id: event.org_id.0,
            org_unit_id: event.org_unit_id.map(|u| u.0),
            rule_id: rule.id.to_string(),
            rule_name: rule.name.clone(),
            timestamp: dates::to_iso_millis(&event.timestamp),
        }
    }

    /// Context without an originating event, as for replays of scheduled
    /// rows.
    pub fn detached(
        event_type: &str,
        rule: &IntegrationRule,
        org_unit_id: Option<i64>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: event_type.to_string(),
            event_id: None,
            org_id: rule.org_id.0,
            org_unit_id,
            rule_id: rule.id.to_string(),
            rule_name: rule.name.clone(),
            timestamp: dates::to_iso_millis(&at),
        }
    }

    /// JSON form bound into the script scope.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
