//! Repository for polling worker checkpoints.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{EventId, WorkerCheckpoint},
};

/// Repository for worker checkpoints.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Loads the checkpoint of `worker_id`, if one was ever saved.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find(&self, worker_id: &str) -> Result<Option<WorkerCheckpoint>> {
        let checkpoint = sqlx::query_as::<_, WorkerCheckpoint>(
            r"
            SELECT worker_id, last_processed_id, updated_at
            FROM worker_checkpoints
            WHERE worker_id = $1
            ",
        )
        .bind(worker_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(checkpoint)
    }

    /// Upserts the checkpoint, never moving it backwards.
    ///
    /// Returns the id stored after the write.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn save(
        &self,
        worker_id: &str,
        last_processed_id: EventId,
        at: DateTime<Utc>,
    ) -> Result<EventId> {
        let stored = sqlx::query_scalar(
            r"
            INSERT INTO worker_checkpoints (worker_id, last_processed_id, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (worker_id) DO UPDATE SET
                last_processed_id = GREATEST(worker_checkpoints.last_processed_id, EXCLUDED.last_processed_id),
                updated_at = EXCLUDED.updated_at
            RETURNING last_processed_id
            ",
        )
        .bind(worker_id)
        .bind(last_processed_id)
        .bind(at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(stored)
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
