//! Relational adapter reading an append-only PostgreSQL event table.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::{
    models::{Event, EventId, OrgId, OrgUnitId},
    Clock, RealClock,
};
use serde_json::{Map, Value};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::{debug, warn};

use crate::{
    config::RelationalSourceConfig,
    error::{Result, SourceError},
    EventSource,
};

const MAX_IDENTIFIER_LEN: usize = 63;

/// Checks one identifier against `[A-Za-z_][A-Za-z0-9_$]*`.
///
/// # Errors
///
/// Returns [`SourceError::InvalidIdentifier`] naming the offending value.
pub fn validate_identifier(name: &str) -> Result<()> {
    let reject = |reason: &str| SourceError::InvalidIdentifier {
        identifier: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(reject("identifier is empty"));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(reject("identifier is longer than 63 characters"));
    }

    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {},
        _ => return Err(reject("must start with a letter or underscore")),
    }
    if let Some(c) = chars.find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '$')) {
        return Err(reject(&format!("contains invalid character '{c}'")));
    }
    Ok(())
}

/// Validates and double-quotes an identifier, splitting `schema.table`.
fn quoted(name: &str) -> Result<String> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return Err(SourceError::InvalidIdentifier {
            identifier: name.to_string(),
            reason: "at most one schema qualifier is allowed".into(),
        });
    }
    parts
        .iter()
        .map(|part| validate_identifier(part).map(|()| format!("\"{part}\"")))
        .collect::<Result<Vec<_>>>()
        .map(|parts| parts.join("."))
}

fn optional_column(column: Option<&str>, cast: &str) -> Result<String> {
    match column {
        Some(name) => Ok(format!("{}::{cast}", quoted(name)?)),
        None => Ok(format!("NULL::{cast}")),
    }
}

/// Fails when the connection URL carries no username.
fn check_credentials(database_url: &str) -> Result<()> {
    let url = url::Url::parse(database_url)
        .map_err(|e| SourceError::config(format!("invalid database_url: {e}")))?;
    if url.username().is_empty() {
        return Err(SourceError::MissingCredentials);
    }
    Ok(())
}

struct Queries {
    batch: String,
    latest: String,
}

impl Queries {
    fn build(config: &RelationalSourceConfig) -> Result<Self> {
        let table = quoted(&config.table)?;
        let id = quoted(&config.id_column)?;
        let org = quoted(&config.org_column)?;
        let event_type = quoted(&config.event_type_column)?;
        let payload = quoted(&config.payload_column)?;
        let org_unit = optional_column(config.org_unit_column.as_deref(), "BIGINT")?;
        let timestamp = optional_column(config.timestamp_column.as_deref(), "TIMESTAMPTZ")?;

        let batch = format!(
            "SELECT {id}::BIGINT AS id, {org_unit} AS org_unit_id, {event_type}::TEXT AS event_type, \
             {payload}::TEXT AS payload, {timestamp} AS occurred_at \
             FROM {table} WHERE {id} > $1 AND {org} = $2 ORDER BY {id} LIMIT "
        );
        let latest =
            format!("SELECT COALESCE(MAX({id}), 0)::BIGINT FROM {table} WHERE {org} = $1");

        Ok(Self { batch, latest })
    }

    fn batch_with_limit(&self, limit: usize) -> String {
        format!("{}{limit}", self.batch)
    }
}

#[derive(sqlx::FromRow)]
struct SourceRow {
    id: i64,
    org_unit_id: Option<i64>,
    event_type: Option<String>,
    payload: Option<String>,
    occurred_at: Option<DateTime<Utc>>,
}

/// Reads events from `SELECT … WHERE id > $1 AND org = $2 ORDER BY id`.
pub struct RelationalSource {
    pool: PgPool,
    org_id: OrgId,
    table: String,
    queries: Queries,
    last_acknowledged: AtomicI64,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RelationalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationalSource")
            .field("table", &self.table)
            .field("org_id", &self.org_id)
            .finish_non_exhaustive()
    }
}

impl RelationalSource {
    /// Validates `config` and opens a lazy pool.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid identifiers, a URL without credentials
    /// or unusable pool options. No connection is attempted.
    pub fn connect(config: &RelationalSourceConfig) -> Result<Self> {
        check_credentials(&config.database_url)?;
        let queries = Queries::build(config)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_lazy(&config.database_url)?;

        Ok(Self::assemble(pool, config, queries))
    }

    /// Reads through an existing pool.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid identifiers.
    pub fn with_pool(pool: PgPool, config: &RelationalSourceConfig) -> Result<Self> {
        let queries = Queries::build(config)?;
        Ok(Self::assemble(pool, config, queries))
    }

    fn assemble(pool: PgPool, config: &RelationalSourceConfig, queries: Queries) -> Self {
        Self {
            pool,
            org_id: OrgId(config.org_id),
            table: config.table.clone(),
            queries,
            last_acknowledged: AtomicI64::new(0),
            clock: Arc::new(RealClock::new()),
        }
    }

    /// Stamps rows without a timestamp column from `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Highest id passed to `ack` or `nack`.
    pub fn last_acknowledged(&self) -> EventId {
        EventId(self.last_acknowledged.load(Ordering::Acquire))
    }

    fn to_event(&self, row: SourceRow) -> Event {
        Event {
            id: EventId(row.id),
            org_id: self.org_id,
            org_unit_id: row.org_unit_id.map(OrgUnitId),
            event_type: row.event_type.unwrap_or_default(),
            payload: parse_payload(row.id, row.payload.as_deref()),
            timestamp: row.occurred_at.unwrap_or_else(|| self.clock.now_utc()),
            source: format!("relational:{}", self.table),
        }
    }
}

/// Parses a payload column, degrading to `{}`.
pub(crate) fn parse_payload(id: i64, raw: Option<&str>) -> Value {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return Value::Object(Map::new());
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => value,
        Ok(_) => {
            warn!(event_id = id, "event payload is not a JSON object, using {{}}");
            Value::Object(Map::new())
        },
        Err(e) => {
            warn!(event_id = id, error = %e, "event payload is not valid JSON, using {{}}");
            Value::Object(Map::new())
        },
    }
}

#[async_trait]
impl EventSource for RelationalSource {
    fn name(&self) -> &str {
        "relational"
    }

    async fn poll(&self, checkpoint: EventId, batch_size: usize) -> Result<Vec<Event>> {
        let sql = self.queries.batch_with_limit(batch_size.max(1));
        let rows: Vec<SourceRow> = sqlx::query_as(&sql)
            .bind(checkpoint.0)
            .bind(self.org_id.0)
            .fetch_all(&self.pool)
            .await?;

        debug!(table = %self.table, checkpoint = %checkpoint, rows = rows.len(), "polled relational source");
        Ok(rows.into_iter().map(|row| self.to_event(row)).collect())
    }

    async fn ack(&self, event: &Event) -> Result<()> {
        self.last_acknowledged.fetch_max(event.id.0, Ordering::AcqRel);
        Ok(())
    }

    async fn nack(&self, event: &Event) -> Result<()> {
        self.last_acknowledged.fetch_max(event.id.0, Ordering::AcqRel);
        Ok(())
    }

    async fn latest_position(&self) -> Result<EventId> {
        let max: i64 = sqlx::query_scalar(&self.queries.latest)
            .bind(self.org_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(EventId(max))
    }
}
