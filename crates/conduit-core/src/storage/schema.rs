//! Idempotent schema bootstrap run at start-up.

use sqlx::PgPool;
use tracing::debug;

use crate::error::Result;

const STATEMENTS: &[(&str, &str)] = &[
    (
        "integration_rules",
        r#"
        CREATE TABLE IF NOT EXISTS integration_rules (
            id UUID PRIMARY KEY,
            org_id BIGINT NOT NULL,
            org_unit_id BIGINT,
            name TEXT NOT NULL,
            event_type TEXT NOT NULL,
            scope TEXT,
            excluded_org_unit_ids BIGINT[] NOT NULL DEFAULT '{}',
            target_url TEXT NOT NULL,
            http_method TEXT NOT NULL DEFAULT 'POST',
            auth_type TEXT NOT NULL DEFAULT 'NONE',
            auth_config JSONB NOT NULL DEFAULT '{}',
            transform JSONB NOT NULL DEFAULT '{"mode": "NONE"}',
            lookups JSONB NOT NULL DEFAULT '[]',
            delivery_mode TEXT NOT NULL DEFAULT 'IMMEDIATE',
            scheduling_config JSONB,
            timeout_ms BIGINT NOT NULL DEFAULT 30000,
            retry_count INTEGER NOT NULL DEFAULT 3,
            retry_strategy TEXT NOT NULL DEFAULT 'EXPONENTIAL',
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            actions JSONB NOT NULL DEFAULT '[]',
            action_execution TEXT NOT NULL DEFAULT 'PARALLEL',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "idx_integration_rules_org_event",
        r"
        CREATE INDEX IF NOT EXISTS idx_integration_rules_org_event
        ON integration_rules(org_id, event_type)
        WHERE is_active
        ",
    ),
    (
        "delivery_logs",
        r"
        CREATE TABLE IF NOT EXISTS delivery_logs (
            id UUID PRIMARY KEY,
            rule_id UUID NOT NULL,
            event_id BIGINT,
            scheduled_delivery_id UUID,
            org_id BIGINT NOT NULL,
            action_name TEXT,
            status TEXT NOT NULL,
            response_status INTEGER,
            response_time_ms BIGINT NOT NULL,
            attempt_count INTEGER NOT NULL,
            request_payload JSONB,
            response_body TEXT,
            error_code TEXT,
            error_message TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    ),
    (
        "idx_delivery_logs_rule",
        r"
        CREATE INDEX IF NOT EXISTS idx_delivery_logs_rule
        ON delivery_logs(rule_id, created_at DESC)
        ",
    ),
    (
        "worker_checkpoints",
        r"
        CREATE TABLE IF NOT EXISTS worker_checkpoints (
            worker_id TEXT PRIMARY KEY,
            last_processed_id BIGINT NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    ),
    (
        "scheduled_deliveries",
        r"
        CREATE TABLE IF NOT EXISTS scheduled_deliveries (
            id UUID PRIMARY KEY,
            rule_id UUID NOT NULL,
            org_id BIGINT NOT NULL,
            org_unit_id BIGINT,
            original_event_id BIGINT NOT NULL,
            event_type TEXT NOT NULL,
            scheduled_for BIGINT NOT NULL,
            payload JSONB NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            cancellation_info JSONB,
            recurring_config JSONB,
            action_index INTEGER,
            attempt INTEGER NOT NULL DEFAULT 1,
            last_error TEXT,
            cancelled_reason TEXT,
            cancelled_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    ),
    (
        "idx_scheduled_deliveries_due",
        r"
        CREATE INDEX IF NOT EXISTS idx_scheduled_deliveries_due
        ON scheduled_deliveries(scheduled_for)
        WHERE status = 'PENDING'
        ",
    ),
    (
        "dlq_entries",
        r"
        CREATE TABLE IF NOT EXISTS dlq_entries (
            id UUID PRIMARY KEY,
            org_id BIGINT NOT NULL,
            rule_id UUID NOT NULL,
            event_id BIGINT,
            org_unit_id BIGINT,
            event_type TEXT NOT NULL,
            action_index INTEGER NOT NULL DEFAULT 0,
            action_name TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            error_category TEXT NOT NULL,
            error_code TEXT NOT NULL,
            error_message TEXT NOT NULL,
            payload JSONB NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            failed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        ",
    ),
    (
        "code_mappings",
        r"
        CREATE TABLE IF NOT EXISTS code_mappings (
            org_id BIGINT NOT NULL,
            org_unit_id BIGINT,
            lookup_type TEXT NOT NULL,
            source_code TEXT NOT NULL,
            target_value JSONB NOT NULL
        )
        ",
    ),
    (
        "idx_code_mappings_lookup",
        r"
        CREATE INDEX IF NOT EXISTS idx_code_mappings_lookup
        ON code_mappings(org_id, lookup_type, source_code)
        ",
    ),
    (
        "org_units",
        r"
        CREATE TABLE IF NOT EXISTS org_units (
            id BIGINT PRIMARY KEY,
            org_id BIGINT NOT NULL,
            parent_id BIGINT
        )
        ",
    ),
];

/// Creates any missing tables and indexes.
///
/// # Errors
///
/// Returns the first statement failure.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for &(name, sql) in STATEMENTS {
        sqlx::query(sql).execute(pool).await?;
        debug!(object = name, "schema object ensured");
    }
    Ok(())
}
