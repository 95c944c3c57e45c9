//! Repository for the organization unit hierarchy.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{OrgId, OrgUnitId},
};

/// Read access to org units.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Strict ancestors of `unit`, nearest first.
    ///
    /// The walk is depth-limited so a corrupted cycle cannot spin forever.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn ancestors(&self, org_id: OrgId, unit: OrgUnitId) -> Result<Vec<OrgUnitId>> {
        let ids: Vec<OrgUnitId> = sqlx::query_scalar(
            r"
            WITH RECURSIVE chain(id, parent_id, depth) AS (
                SELECT id, parent_id, 0 FROM org_units WHERE id = $1 AND org_id = $2
                UNION ALL
                SELECT u.id, u.parent_id, c.depth + 1
                FROM org_units u
                JOIN chain c ON u.id = c.parent_id
                WHERE c.depth < 64 AND u.org_id = $2
            )
            SELECT id FROM chain WHERE depth > 0 ORDER BY depth ASC
            ",
        )
        .bind(unit)
        .bind(org_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(ids)
    }

    /// Inserts a unit. Used for seeding.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create(
        &self,
        id: OrgUnitId,
        org_id: OrgId,
        parent_id: Option<OrgUnitId>,
    ) -> Result<()> {
        sqlx::query("INSERT INTO org_units (id, org_id, parent_id) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(org_id)
            .bind(parent_id)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }
}
