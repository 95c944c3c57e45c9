//! Repository for integration rules.
//!
//! Rules are authored by the admin surface; the gateway only reads them,
//! plus a `create` used for seeding and integration tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{types::Json, Executor, PgPool, Postgres};

use crate::{
    error::Result,
    models::{
        ActionExecution, AuthSettings, DeliveryMode, HttpMethod, IntegrationRule, LookupConfig,
        OrgId, OrgUnitId, RetryStrategy, RuleAction, RuleId, RuleScope, SchedulingConfig,
        TransformConfig,
    },
};

const RULE_COLUMNS: &str = r"
    id, org_id, org_unit_id, name, event_type, scope, excluded_org_unit_ids,
    target_url, http_method, auth_type, auth_config, transform, lookups,
    delivery_mode, scheduling_config, timeout_ms, retry_count, retry_strategy,
    is_active, actions, action_execution, created_at, updated_at
";

#[derive(sqlx::FromRow)]
struct RuleRow {
    id: RuleId,
    org_id: OrgId,
    org_unit_id: Option<OrgUnitId>,
    name: String,
    event_type: String,
    scope: Option<RuleScope>,
    excluded_org_unit_ids: Vec<i64>,
    target_url: String,
    http_method: HttpMethod,
    auth_type: String,
    auth_config: Json<serde_json::Map<String, serde_json::Value>>,
    transform: Json<TransformConfig>,
    lookups: Json<Vec<LookupConfig>>,
    delivery_mode: DeliveryMode,
    scheduling_config: Option<Json<SchedulingConfig>>,
    timeout_ms: i64,
    retry_count: i32,
    retry_strategy: RetryStrategy,
    is_active: bool,
    actions: Json<Vec<RuleAction>>,
    action_execution: ActionExecution,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RuleRow> for IntegrationRule {
    fn from(row: RuleRow) -> Self {
        Self {
            id: row.id,
            org_id: row.org_id,
            org_unit_id: row.org_unit_id,
            name: row.name,
            event_type: row.event_type,
            scope: row.scope,
            excluded_org_unit_ids: row.excluded_org_unit_ids.into_iter().map(OrgUnitId).collect(),
            target_url: row.target_url,
            http_method: row.http_method,
            auth: AuthSettings { auth_type: row.auth_type, config: row.auth_config.0 },
            transform: row.transform.0,
            lookups: row.lookups.0,
            delivery_mode: row.delivery_mode,
            scheduling_config: row.scheduling_config.map(|c| c.0),
            timeout_ms: u64::try_from(row.timeout_ms).unwrap_or(0),
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            retry_strategy: row.retry_strategy,
            is_active: row.is_active,
            actions: row.actions.0,
            action_execution: row.action_execution,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Repository for integration rule reads.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Active rules of `org_id` listening to `event_type` directly or by `*`.
    ///
    /// Hierarchy filtering happens in the matcher, not here.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_active_for_event(
        &self,
        org_id: OrgId,
        event_type: &str,
    ) -> Result<Vec<IntegrationRule>> {
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM integration_rules
             WHERE org_id = $1 AND is_active AND (event_type = $2 OR event_type = '*')
             ORDER BY created_at ASC"
        );
        let rows = sqlx::query_as::<_, RuleRow>(&sql)
            .bind(org_id)
            .bind(event_type)
            .fetch_all(&*self.pool)
            .await?;

        Ok(rows.into_iter().map(IntegrationRule::from).collect())
    }

    /// Active scheduled rules whose cancellation list contains `event_type`.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_cancelling(
        &self,
        org_id: OrgId,
        event_type: &str,
    ) -> Result<Vec<IntegrationRule>> {
        let sql = format!(
            "SELECT {RULE_COLUMNS} FROM integration_rules
             WHERE org_id = $1 AND is_active
               AND scheduling_config IS NOT NULL
               AND scheduling_config->'cancelOnEventTypes' ? $2"
        );
        let rows = sqlx::query_as::<_, RuleRow>(&sql)
            .bind(org_id)
            .bind(event_type)
            .fetch_all(&*self.pool)
            .await?;

        Ok(rows.into_iter().map(IntegrationRule::from).collect())
    }

    /// Finds a rule by id regardless of its active flag.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: RuleId) -> Result<Option<IntegrationRule>> {
        let sql = format!("SELECT {RULE_COLUMNS} FROM integration_rules WHERE id = $1");
        let row =
            sqlx::query_as::<_, RuleRow>(&sql).bind(id).fetch_optional(&*self.pool).await?;

        Ok(row.map(IntegrationRule::from))
    }

    /// Inserts a rule.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create(&self, rule: &IntegrationRule) -> Result<RuleId> {
        self.create_impl(&*self.pool, rule).await
    }

    async fn create_impl<'e, E>(&self, executor: E, rule: &IntegrationRule) -> Result<RuleId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let excluded: Vec<i64> = rule.excluded_org_unit_ids.iter().map(|u| u.0).collect();
        let id = sqlx::query_scalar(
            r"
            INSERT INTO integration_rules (
                id, org_id, org_unit_id, name, event_type, scope, excluded_org_unit_ids,
                target_url, http_method, auth_type, auth_config, transform, lookups,
                delivery_mode, scheduling_config, timeout_ms, retry_count, retry_strategy,
                is_active, actions, action_execution, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                $14, $15, $16, $17, $18, $19, $20, $21, $22, $23
            )
            RETURNING id
            ",
        )
        .bind(rule.id)
        .bind(rule.org_id)
        .bind(rule.org_unit_id)
        .bind(&rule.name)
        .bind(&rule.event_type)
        .bind(rule.scope)
        .bind(excluded)
        .bind(&rule.target_url)
        .bind(rule.http_method)
        .bind(&rule.auth.auth_type)
        .bind(Json(&rule.auth.config))
        .bind(Json(&rule.transform))
        .bind(Json(&rule.lookups))
        .bind(rule.delivery_mode)
        .bind(rule.scheduling_config.as_ref().map(Json))
        .bind(i64::try_from(rule.timeout_ms).unwrap_or(i64::MAX))
        .bind(i32::try_from(rule.retry_count).unwrap_or(i32::MAX))
        .bind(rule.retry_strategy)
        .bind(rule.is_active)
        .bind(Json(&rule.actions))
        .bind(rule.action_execution)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .fetch_one(executor)
        .await?;

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _repo = Repository::new(Arc::new(pool));
    }
}
