//! Repository for the lookup code mappings.

use std::sync::Arc;

use serde_json::Value;
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{OrgId, OrgUnitId},
};

/// Read access to code mappings.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Resolves `source_code` within `lookup_type`.
    ///
    /// A mapping for the event's unit wins over the organization-wide one.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn resolve(
        &self,
        org_id: OrgId,
        org_unit_id: Option<OrgUnitId>,
        lookup_type: &str,
        source_code: &str,
    ) -> Result<Option<Value>> {
        let value = sqlx::query_scalar(
            r"
            SELECT target_value
            FROM code_mappings
            WHERE org_id = $1
              AND lookup_type = $2
              AND source_code = $3
              AND (org_unit_id IS NULL OR org_unit_id = $4)
            ORDER BY org_unit_id NULLS LAST
            LIMIT 1
            ",
        )
        .bind(org_id)
        .bind(lookup_type)
        .bind(source_code)
        .bind(org_unit_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(value)
    }

    /// Inserts a mapping. Used for seeding.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create(
        &self,
        org_id: OrgId,
        org_unit_id: Option<OrgUnitId>,
        lookup_type: &str,
        source_code: &str,
        target_value: &Value,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO code_mappings (org_id, org_unit_id, lookup_type, source_code, target_value)
            VALUES ($1, $2, $3, $4, $5)
            ",
        )
        .bind(org_id)
        .bind(org_unit_id)
        .bind(lookup_type)
        .bind(source_code)
        .bind(target_value)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
