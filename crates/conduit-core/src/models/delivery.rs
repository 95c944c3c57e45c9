//! Delivery audit log, worker checkpoints and dead-letter entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    text_enum, DeliveryLogId, DlqEntryId, EventId, OrgId, OrgUnitId, RuleId, ScheduledDeliveryId,
};

/// Upper bound on stored response body length, in characters.
pub const MAX_RESPONSE_BODY_CHARS: usize = 5000;

/// Truncates a response body to [`MAX_RESPONSE_BODY_CHARS`] characters.
///
/// Counts characters rather than bytes so multi-byte text is never split.
pub fn truncate_response_body(body: &str) -> String {
    body.chars().take(MAX_RESPONSE_BODY_CHARS).collect()
}

text_enum!(
    /// Outcome of a single delivery attempt.
    DeliveryStatus {
        /// 2xx response.
        Success => "SUCCESS",
        /// Terminal failure without retries left to spend on it.
        Failed => "FAILED",
        /// Retryable failure; another attempt follows.
        Retrying => "RETRYING",
        /// Retry budget exhausted.
        Abandoned => "ABANDONED",
    }
);

/// One row of the append-only delivery audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAttemptLog {
    /// Row identifier.
    pub id: DeliveryLogId,
    /// Rule that produced the attempt.
    pub rule_id: RuleId,
    /// Triggering event, when delivered from the poller.
    pub event_id: Option<EventId>,
    /// Scheduled row, when delivered by the scheduler.
    pub scheduled_delivery_id: Option<ScheduledDeliveryId>,
    /// Owning organization.
    pub org_id: OrgId,
    /// Action name for multi-action rules.
    pub action_name: Option<String>,
    /// Attempt outcome.
    pub status: DeliveryStatus,
    /// HTTP status, when a response arrived.
    pub response_status: Option<i32>,
    /// Wall time of the attempt.
    pub response_time_ms: i64,
    /// 1-based attempt number within the dispatch.
    pub attempt_count: i32,
    /// Body sent, after lookups and transform.
    pub request_payload: Option<Value>,
    /// Response body, at most [`MAX_RESPONSE_BODY_CHARS`] characters.
    pub response_body: Option<String>,
    /// Stable error code.
    pub error_code: Option<String>,
    /// Human-readable error.
    pub error_message: Option<String>,
    /// When the row was written.
    pub created_at: DateTime<Utc>,
}

/// Durable progress marker of a polling worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCheckpoint {
    /// Logical worker name.
    pub worker_id: String,
    /// Highest event id whose processing completed.
    pub last_processed_id: EventId,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

text_enum!(
    /// Lifecycle of a dead-letter entry.
    ///
    /// `pending -> retrying -> {resolved | pending}`; `pending -> abandoned`.
    DlqStatus {
        /// Awaiting operator action.
        Pending => "pending",
        /// A manual replay is in flight.
        Retrying => "retrying",
        /// Given up by an operator.
        Abandoned => "abandoned",
        /// A manual replay succeeded.
        Resolved => "resolved",
    }
);

impl DlqStatus {
    /// Whether no further transition is allowed.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Abandoned | Self::Resolved)
    }
}

/// A delivery that ended in terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DlqEntry {
    /// Entry identifier.
    pub id: DlqEntryId,
    /// Owning organization.
    pub org_id: OrgId,
    /// Rule that failed.
    pub rule_id: RuleId,
    /// Triggering event, if the failure came from the poller.
    pub event_id: Option<EventId>,
    /// Unit of the triggering event.
    pub org_unit_id: Option<OrgUnitId>,
    /// Type of the triggering event.
    pub event_type: String,
    /// Index of the failed action.
    pub action_index: i32,
    /// Name of the failed action.
    pub action_name: Option<String>,
    /// Lifecycle state.
    pub status: DlqStatus,
    /// Coarse failure class, e.g. `network` or `auth`.
    pub error_category: String,
    /// Stable error code.
    pub error_code: String,
    /// Human-readable error.
    pub error_message: String,
    /// Original event payload, replayed through the current rule.
    pub payload: Value,
    /// Manual replays performed so far.
    pub retry_count: i32,
    /// First failure time.
    pub created_at: DateTime<Utc>,
    /// Most recent failure time.
    pub failed_at: DateTime<Utc>,
}
