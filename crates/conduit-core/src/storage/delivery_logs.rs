//! Repository for the append-only delivery attempt log.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    models::{DeliveryAttemptLog, DeliveryLogId, RuleId},
};

/// Repository for delivery attempt logs.
///
/// Rows are never updated or deleted by the gateway.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Appends one attempt row.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create(&self, log: &DeliveryAttemptLog) -> Result<DeliveryLogId> {
        self.create_impl(&*self.pool, log).await
    }

    /// Appends one attempt row within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        log: &DeliveryAttemptLog,
    ) -> Result<DeliveryLogId> {
        self.create_impl(&mut **tx, log).await
    }

    async fn create_impl<'e, E>(&self, executor: E, log: &DeliveryAttemptLog) -> Result<DeliveryLogId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO delivery_logs (
                id, rule_id, event_id, scheduled_delivery_id, org_id, action_name,
                status, response_status, response_time_ms, attempt_count,
                request_payload, response_body, error_code, error_message, created_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15
            )
            RETURNING id
            ",
        )
        .bind(log.id)
        .bind(log.rule_id)
        .bind(log.event_id)
        .bind(log.scheduled_delivery_id)
        .bind(log.org_id)
        .bind(&log.action_name)
        .bind(log.status)
        .bind(log.response_status)
        .bind(log.response_time_ms)
        .bind(log.attempt_count)
        .bind(&log.request_payload)
        .bind(&log.response_body)
        .bind(&log.error_code)
        .bind(&log.error_message)
        .bind(log.created_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }

    /// Most recent attempts of a rule, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_rule(&self, rule_id: RuleId, limit: i64) -> Result<Vec<DeliveryAttemptLog>> {
        let logs = sqlx::query_as::<_, DeliveryAttemptLog>(
            r"
            SELECT id, rule_id, event_id, scheduled_delivery_id, org_id, action_name,
                   status, response_status, response_time_ms, attempt_count,
                   request_payload, response_body, error_code, error_message, created_at
            FROM delivery_logs
            WHERE rule_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            ",
        )
        .bind(rule_id)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(logs)
    }
}
