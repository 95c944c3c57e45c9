//! Scheduled (delayed and recurring) deliveries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{text_enum, EventId, OrgId, OrgUnitId, RuleId, ScheduledDeliveryId};

text_enum!(
    /// Lifecycle of a scheduled delivery. Every state but `PENDING` is terminal.
    ScheduleStatus {
        /// Waiting for its due time.
        Pending => "PENDING",
        /// Delivered successfully.
        Sent => "SENT",
        /// Cancelled by an event or because its rule went away.
        Cancelled => "CANCELLED",
        /// Delivery failed after all retries.
        Failed => "FAILED",
    }
);

/// Keys captured from the triggering event for later cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancellationInfo {
    /// Patient the delivery concerns.
    pub patient_id: String,
    /// Normalized appointment time, if the event carried one.
    #[serde(default)]
    pub scheduled_date_time: Option<String>,
}

impl CancellationInfo {
    /// Whether a stored row's info is hit by cancellation `criteria`.
    ///
    /// Patients must be equal. The datetime only narrows the match when the
    /// criteria carry one.
    pub fn matched_by(&self, criteria: &CancellationInfo) -> bool {
        if self.patient_id != criteria.patient_id {
            return false;
        }
        match &criteria.scheduled_date_time {
            Some(wanted) => self.scheduled_date_time.as_deref() == Some(wanted.as_str()),
            None => true,
        }
    }
}

/// Recurrence settings, persisted with every occurrence row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringConfig {
    /// Epoch ms of occurrence 1.
    pub first_occurrence: i64,
    /// Spacing between occurrences.
    pub interval_ms: i64,
    /// Last occurrence number, if bounded by count.
    #[serde(default)]
    pub max_occurrences: Option<i64>,
    /// Epoch ms after which no occurrence fires, if bounded by date.
    #[serde(default)]
    pub end_date: Option<i64>,
    /// 1-based number of the occurrence this row represents.
    #[serde(default = "first")]
    pub occurrence_number: i64,
}

fn first() -> i64 {
    1
}

fn first_attempt() -> i32 {
    1
}

/// A delivery persisted for later execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledDelivery {
    /// Row identifier.
    pub id: ScheduledDeliveryId,
    /// Rule to deliver through.
    pub rule_id: RuleId,
    /// Owning organization.
    pub org_id: OrgId,
    /// Unit of the triggering event.
    pub org_unit_id: Option<OrgUnitId>,
    /// Event that created the schedule.
    pub original_event_id: EventId,
    /// Type of the triggering event.
    pub event_type: String,
    /// Due time, epoch ms.
    pub scheduled_for: i64,
    /// Original event payload.
    pub payload: Value,
    /// Lifecycle state.
    pub status: ScheduleStatus,
    /// Keys for event-driven cancellation.
    pub cancellation_info: Option<CancellationInfo>,
    /// Present on recurring rows.
    pub recurring_config: Option<RecurringConfig>,
    /// Restricts delivery to one action; set on retry rows.
    #[serde(default)]
    pub action_index: Option<i32>,
    /// 1-based attempt number the next delivery makes.
    #[serde(default = "first_attempt")]
    pub attempt: i32,
    /// Last delivery error.
    pub last_error: Option<String>,
    /// Why the row was cancelled.
    pub cancelled_reason: Option<String>,
    /// When the row was cancelled.
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last transition time.
    pub updated_at: DateTime<Utc>,
}
