//! Source adapter configuration, read from the `[source]` table.

use serde::{Deserialize, Serialize};

/// Which adapter feeds the polling worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Rows of a PostgreSQL table.
    Relational(RelationalSourceConfig),
    /// Records of one Kafka topic partition.
    Stream(StreamSourceConfig),
    /// Events pushed to the ingest endpoint.
    HttpPush(HttpPushSourceConfig),
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::HttpPush(HttpPushSourceConfig::default())
    }
}

impl SourceConfig {
    /// Short adapter kind for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Relational(_) => "relational",
            Self::Stream(_) => "stream",
            Self::HttpPush(_) => "http_push",
        }
    }
}

/// Column mapping of the relational adapter.
///
/// `table` may be schema-qualified. Optional columns read as null when
/// unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationalSourceConfig {
    /// PostgreSQL connection URL; must carry a username.
    pub database_url: String,
    /// Organization whose events this source reads.
    pub org_id: i64,
    /// Event table.
    pub table: String,
    /// Monotonic integer id column.
    #[serde(default = "default_id_column")]
    pub id_column: String,
    /// Organization column compared against `org_id`.
    #[serde(default = "default_org_column")]
    pub org_column: String,
    /// Unit column.
    #[serde(default)]
    pub org_unit_column: Option<String>,
    /// Event type column.
    #[serde(default = "default_event_type_column")]
    pub event_type_column: String,
    /// JSON payload column, read as text.
    #[serde(default = "default_payload_column")]
    pub payload_column: String,
    /// Event time column.
    #[serde(default)]
    pub timestamp_column: Option<String>,
    /// Pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_org_column() -> String {
    "org_id".to_string()
}

fn default_event_type_column() -> String {
    "event_type".to_string()
}

fn default_payload_column() -> String {
    "payload".to_string()
}

fn default_max_connections() -> u32 {
    5
}

/// Kafka topic partition read by the stream adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSourceConfig {
    /// Bootstrap brokers, `host:port`.
    pub brokers: Vec<String>,
    /// Topic name.
    pub topic: String,
    /// Partition number.
    #[serde(default)]
    pub partition: i32,
    /// Organization assigned to events from this topic.
    pub org_id: i64,
    /// Event type used when a record has none.
    #[serde(default = "default_event_type")]
    pub default_event_type: String,
    /// Longest broker wait per fetch.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: i32,
    /// Upper bound of bytes per fetch.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: i32,
}

fn default_event_type() -> String {
    "UNKNOWN".to_string()
}

fn default_max_wait_ms() -> i32 {
    500
}

fn default_max_bytes() -> i32 {
    1024 * 1024
}

/// In-memory queue behind the ingest endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpPushSourceConfig {
    /// Events held before pushes are rejected.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Value required in `X-Api-Key`, when set.
    #[serde(default)]
    pub api_key: Option<String>,
    /// HMAC-SHA256 key for `X-Signature`, when set.
    #[serde(default)]
    pub signing_secret: Option<String>,
}

impl Default for HttpPushSourceConfig {
    fn default() -> Self {
        Self { capacity: default_capacity(), api_key: None, signing_secret: None }
    }
}

fn default_capacity() -> usize {
    10_000
}
