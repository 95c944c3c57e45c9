//! Repository for delayed and recurring deliveries.
//!
//! Every state change is guarded by `status = 'PENDING'` so a row can leave
//! the pending state exactly once even when the due poller and a
//! cancellation race.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{types::Json, PgPool};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{
        CancellationInfo, EventId, OrgId, OrgUnitId, RecurringConfig, RuleId, ScheduleStatus,
        ScheduledDelivery, ScheduledDeliveryId,
    },
};

const COLUMNS: &str = r"
    id, rule_id, org_id, org_unit_id, original_event_id, event_type, scheduled_for,
    payload, status, cancellation_info, recurring_config, action_index, attempt,
    last_error, cancelled_reason, cancelled_at, created_at, updated_at
";

#[derive(sqlx::FromRow)]
struct ScheduledRow {
    id: ScheduledDeliveryId,
    rule_id: RuleId,
    org_id: OrgId,
    org_unit_id: Option<OrgUnitId>,
    original_event_id: EventId,
    event_type: String,
    scheduled_for: i64,
    payload: Value,
    status: ScheduleStatus,
    cancellation_info: Option<Json<CancellationInfo>>,
    recurring_config: Option<Json<RecurringConfig>>,
    action_index: Option<i32>,
    attempt: i32,
    last_error: Option<String>,
    cancelled_reason: Option<String>,
    cancelled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ScheduledRow> for ScheduledDelivery {
    fn from(row: ScheduledRow) -> Self {
        Self {
            id: row.id,
            rule_id: row.rule_id,
            org_id: row.org_id,
            org_unit_id: row.org_unit_id,
            original_event_id: row.original_event_id,
            event_type: row.event_type,
            scheduled_for: row.scheduled_for,
            payload: row.payload,
            status: row.status,
            cancellation_info: row.cancellation_info.map(|j| j.0),
            recurring_config: row.recurring_config.map(|j| j.0),
            action_index: row.action_index,
            attempt: row.attempt,
            last_error: row.last_error,
            cancelled_reason: row.cancelled_reason,
            cancelled_at: row.cancelled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Repository for scheduled deliveries.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Persists a new row.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create(&self, delivery: &ScheduledDelivery) -> Result<ScheduledDeliveryId> {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO scheduled_deliveries (
                id, rule_id, org_id, org_unit_id, original_event_id, event_type,
                scheduled_for, payload, status, cancellation_info, recurring_config,
                action_index, attempt, last_error, cancelled_reason, cancelled_at,
                created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                $17, $18
            )
            RETURNING id
            ",
        )
        .bind(delivery.id)
        .bind(delivery.rule_id)
        .bind(delivery.org_id)
        .bind(delivery.org_unit_id)
        .bind(delivery.original_event_id)
        .bind(&delivery.event_type)
        .bind(delivery.scheduled_for)
        .bind(&delivery.payload)
        .bind(delivery.status)
        .bind(delivery.cancellation_info.as_ref().map(Json))
        .bind(delivery.recurring_config.as_ref().map(Json))
        .bind(delivery.action_index)
        .bind(delivery.attempt)
        .bind(&delivery.last_error)
        .bind(&delivery.cancelled_reason)
        .bind(delivery.cancelled_at)
        .bind(delivery.created_at)
        .bind(delivery.updated_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Finds a row by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: ScheduledDeliveryId) -> Result<Option<ScheduledDelivery>> {
        let sql = format!("SELECT {COLUMNS} FROM scheduled_deliveries WHERE id = $1");
        let row = sqlx::query_as::<_, ScheduledRow>(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(row.map(ScheduledDelivery::from))
    }

    /// Pending rows due at or before `now_ms`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_due(&self, now_ms: i64, limit: i64) -> Result<Vec<ScheduledDelivery>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM scheduled_deliveries
             WHERE status = 'PENDING' AND scheduled_for <= $1
             ORDER BY scheduled_for ASC
             LIMIT $2"
        );
        let rows = sqlx::query_as::<_, ScheduledRow>(&sql)
            .bind(now_ms)
            .bind(limit)
            .fetch_all(&*self.pool)
            .await?;

        Ok(rows.into_iter().map(ScheduledDelivery::from).collect())
    }

    /// Moves a pending row to `status`.
    ///
    /// Returns `false` when the row was no longer pending.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn complete(
        &self,
        id: ScheduledDeliveryId,
        status: ScheduleStatus,
        last_error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE scheduled_deliveries
            SET status = $2, last_error = $3, updated_at = $4
            WHERE id = $1 AND status = 'PENDING'
            ",
        )
        .bind(id)
        .bind(status)
        .bind(last_error)
        .bind(at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Pushes a pending row back to `scheduled_for` for attempt `attempt`.
    ///
    /// Returns `false` when the row was no longer pending.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn reschedule(
        &self,
        id: ScheduledDeliveryId,
        attempt: i32,
        scheduled_for: i64,
        last_error: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE scheduled_deliveries
            SET attempt = $2, scheduled_for = $3, last_error = $4, updated_at = $5
            WHERE id = $1 AND status = 'PENDING'
            ",
        )
        .bind(id)
        .bind(attempt)
        .bind(scheduled_for)
        .bind(last_error)
        .bind(at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Cancels one pending row.
    ///
    /// Returns `false` when the row was no longer pending.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn cancel_by_id(
        &self,
        id: ScheduledDeliveryId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE scheduled_deliveries
            SET status = 'CANCELLED', cancelled_reason = $2, cancelled_at = $3, updated_at = $3
            WHERE id = $1 AND status = 'PENDING'
            ",
        )
        .bind(id)
        .bind(reason)
        .bind(at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Cancels every pending row of `rule_ids` whose cancellation info is
    /// matched by `criteria`. Returns the cancelled ids.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn cancel_matching(
        &self,
        org_id: OrgId,
        rule_ids: &[RuleId],
        criteria: &CancellationInfo,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<ScheduledDeliveryId>> {
        let rule_ids: Vec<Uuid> = rule_ids.iter().map(|r| r.0).collect();
        let ids = sqlx::query_scalar(
            r"
            UPDATE scheduled_deliveries
            SET status = 'CANCELLED', cancelled_reason = $5, cancelled_at = $6, updated_at = $6
            WHERE status = 'PENDING'
              AND org_id = $1
              AND rule_id = ANY($2)
              AND cancellation_info->>'patientId' = $3
              AND ($4::TEXT IS NULL OR cancellation_info->>'scheduledDateTime' = $4)
            RETURNING id
            ",
        )
        .bind(org_id)
        .bind(rule_ids)
        .bind(&criteria.patient_id)
        .bind(&criteria.scheduled_date_time)
        .bind(reason)
        .bind(at)
        .fetch_all(&*self.pool)
        .await?;

        Ok(ids)
    }
}
