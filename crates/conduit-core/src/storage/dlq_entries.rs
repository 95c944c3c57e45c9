//! Repository for dead-letter entries.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{DlqEntry, DlqEntryId, DlqStatus},
};

const COLUMNS: &str = r"
    id, org_id, rule_id, event_id, org_unit_id, event_type, action_index, action_name,
    status, error_category, error_code, error_message, payload, retry_count,
    created_at, failed_at
";

/// Repository for dead-letter entries.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Persists a new entry.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create(&self, entry: &DlqEntry) -> Result<DlqEntryId> {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO dlq_entries (
                id, org_id, rule_id, event_id, org_unit_id, event_type, action_index,
                action_name, status, error_category, error_code, error_message, payload,
                retry_count, created_at, failed_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16
            )
            RETURNING id
            ",
        )
        .bind(entry.id)
        .bind(entry.org_id)
        .bind(entry.rule_id)
        .bind(entry.event_id)
        .bind(entry.org_unit_id)
        .bind(&entry.event_type)
        .bind(entry.action_index)
        .bind(&entry.action_name)
        .bind(entry.status)
        .bind(&entry.error_category)
        .bind(&entry.error_code)
        .bind(&entry.error_message)
        .bind(&entry.payload)
        .bind(entry.retry_count)
        .bind(entry.created_at)
        .bind(entry.failed_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Finds an entry by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: DlqEntryId) -> Result<Option<DlqEntry>> {
        let sql = format!("SELECT {COLUMNS} FROM dlq_entries WHERE id = $1");
        let entry =
            sqlx::query_as::<_, DlqEntry>(&sql).bind(id).fetch_optional(&*self.pool).await?;

        Ok(entry)
    }

    /// Atomically moves an entry from `from` to `to`.
    ///
    /// Returns `false` when the entry was not in `from`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn transition(&self, id: DlqEntryId, from: DlqStatus, to: DlqStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE dlq_entries SET status = $3 WHERE id = $1 AND status = $2")
            .bind(id)
            .bind(from)
            .bind(to)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Writes the mutable fields of `entry` back if the stored entry is
    /// still in `from`.
    ///
    /// Returns `false` when it was not.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn update(&self, entry: &DlqEntry, from: DlqStatus) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE dlq_entries
            SET status = $2, error_category = $3, error_code = $4, error_message = $5,
                retry_count = $6, failed_at = $7
            WHERE id = $1 AND status = $8
            ",
        )
        .bind(entry.id)
        .bind(entry.status)
        .bind(&entry.error_category)
        .bind(&entry.error_code)
        .bind(&entry.error_message)
        .bind(entry.retry_count)
        .bind(entry.failed_at)
        .bind(from)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
