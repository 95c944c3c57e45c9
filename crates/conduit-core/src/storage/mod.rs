//! PostgreSQL persistence, one repository per table.
//!
//! All SQL lives in this module. Callers outside the crate go through
//! [`Storage`], which shares a single pool across repositories.

use std::sync::Arc;

use sqlx::PgPool;

pub mod checkpoints;
pub mod code_mappings;
pub mod delivery_logs;
pub mod dlq_entries;
pub mod org_units;
pub mod rules;
pub mod scheduled_deliveries;
pub mod schema;

use crate::error::Result;

/// Container for all repository instances.
#[derive(Clone)]
pub struct Storage {
    /// Integration rules (read only).
    pub rules: Arc<rules::Repository>,

    /// Delivery attempt audit log.
    pub delivery_logs: Arc<delivery_logs::Repository>,

    /// Worker checkpoints.
    pub checkpoints: Arc<checkpoints::Repository>,

    /// Delayed and recurring deliveries.
    pub scheduled_deliveries: Arc<scheduled_deliveries::Repository>,

    /// Dead-letter entries.
    pub dlq_entries: Arc<dlq_entries::Repository>,

    /// Code mappings used by lookups (read only).
    pub code_mappings: Arc<code_mappings::Repository>,

    /// Organization unit hierarchy (read only).
    pub org_units: Arc<org_units::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates all repositories over one shared pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            rules: Arc::new(rules::Repository::new(pool.clone())),
            delivery_logs: Arc::new(delivery_logs::Repository::new(pool.clone())),
            checkpoints: Arc::new(checkpoints::Repository::new(pool.clone())),
            scheduled_deliveries: Arc::new(scheduled_deliveries::Repository::new(pool.clone())),
            dlq_entries: Arc::new(dlq_entries::Repository::new(pool.clone())),
            code_mappings: Arc::new(code_mappings::Repository::new(pool.clone())),
            org_units: Arc::new(org_units::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Verifies the database answers a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created_lazily() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _storage = Storage::new(pool);
    }
}
