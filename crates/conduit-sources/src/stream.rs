//! Stream adapter reading one Kafka topic partition.
//!
//! Event ids are record offsets shifted by one, so offset 0 is event 1 and
//! a checkpoint of `n` resumes at offset `n`. Warm-up seeds the checkpoint
//! from the high watermark, skipping everything already in the topic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::models::{Event, EventId, OrgId, OrgUnitId};
use rskafka::{
    client::{
        partition::{OffsetAt, PartitionClient, UnknownTopicHandling},
        ClientBuilder,
    },
    record::RecordAndOffset,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::{
    config::StreamSourceConfig,
    error::{Result, SourceError},
    EventSource,
};

/// Record value layout.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    event_type: Option<String>,
    #[serde(default)]
    org_unit_id: Option<i64>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// Reads events from a Kafka partition.
pub struct StreamSource {
    client: PartitionClient,
    topic: String,
    partition: i32,
    org_id: OrgId,
    default_event_type: String,
    max_wait_ms: i32,
    max_bytes: i32,
}

impl std::fmt::Debug for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSource")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .finish_non_exhaustive()
    }
}

impl StreamSource {
    /// Validates `config` and connects to the partition leader.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidConfig`] for missing brokers or topic
    /// and a connection error when the cluster cannot be reached.
    pub async fn connect(config: &StreamSourceConfig) -> Result<Self> {
        validate(config)?;

        let client = ClientBuilder::new(config.brokers.clone()).build().await?;
        let partition = client
            .partition_client(config.topic.clone(), config.partition, UnknownTopicHandling::Error)
            .await?;

        info!(topic = %config.topic, partition = config.partition, "connected stream source");

        Ok(Self {
            client: partition,
            topic: config.topic.clone(),
            partition: config.partition,
            org_id: OrgId(config.org_id),
            default_event_type: config.default_event_type.clone(),
            max_wait_ms: config.max_wait_ms,
            max_bytes: config.max_bytes,
        })
    }

    fn to_event(&self, record: RecordAndOffset) -> Event {
        let id = record.offset + 1;
        let envelope = decode(id, record.record.value.as_deref());

        let (event_type, org_unit_id, payload, timestamp) = match envelope {
            Some(env) => (
                env.event_type.unwrap_or_else(|| self.default_event_type.clone()),
                env.org_unit_id.map(OrgUnitId),
                match env.payload {
                    Some(payload @ Value::Object(_)) => payload,
                    _ => Value::Object(Map::new()),
                },
                env.timestamp.unwrap_or(record.record.timestamp),
            ),
            None => (
                self.default_event_type.clone(),
                None,
                Value::Object(Map::new()),
                record.record.timestamp,
            ),
        };

        Event {
            id: EventId(id),
            org_id: self.org_id,
            org_unit_id,
            event_type,
            payload,
            timestamp,
            source: format!("stream:{}/{}", self.topic, self.partition),
        }
    }
}

fn validate(config: &StreamSourceConfig) -> Result<()> {
    if config.brokers.iter().all(|b| b.trim().is_empty()) {
        return Err(SourceError::config("stream source needs at least one broker"));
    }
    if config.topic.trim().is_empty() {
        return Err(SourceError::config("stream source needs a topic"));
    }
    if config.partition < 0 {
        return Err(SourceError::config("partition must not be negative"));
    }
    if config.max_bytes < 1 {
        return Err(SourceError::config("max_bytes must be positive"));
    }
    Ok(())
}

fn decode(id: i64, value: Option<&[u8]>) -> Option<Envelope> {
    let bytes = value?;
    match serde_json::from_slice::<Envelope>(bytes) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            warn!(event_id = id, error = %e, "stream record is not a valid envelope, using {{}}");
            None
        },
    }
}

#[async_trait]
impl EventSource for StreamSource {
    fn name(&self) -> &str {
        "stream"
    }

    async fn poll(&self, checkpoint: EventId, batch_size: usize) -> Result<Vec<Event>> {
        let start = checkpoint.0.max(0);
        let (records, high_watermark) = self
            .client
            .fetch_records(start, 1..self.max_bytes, self.max_wait_ms)
            .await?;

        debug!(
            topic = %self.topic,
            start_offset = start,
            high_watermark,
            fetched = records.len(),
            "polled stream source"
        );

        Ok(records
            .into_iter()
            .filter(|r| r.offset >= start)
            .take(batch_size)
            .map(|r| self.to_event(r))
            .collect())
    }

    async fn ack(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, _event: &Event) -> Result<()> {
        Ok(())
    }

    async fn latest_position(&self) -> Result<EventId> {
        let next_offset = self.client.get_offset(OffsetAt::Latest).await?;
        Ok(EventId(next_offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StreamSourceConfig {
        StreamSourceConfig {
            brokers: vec!["localhost:9092".into()],
            topic: "events".into(),
            partition: 0,
            org_id: 1,
            default_event_type: "UNKNOWN".into(),
            max_wait_ms: 100,
            max_bytes: 1024,
        }
    }

    #[test]
    fn config_requires_brokers_and_topic() {
        let mut no_brokers = config();
        no_brokers.brokers = vec![];
        assert_eq!(validate(&no_brokers).unwrap_err().code(), "SOURCE_INVALID_CONFIG");

        let mut no_topic = config();
        no_topic.topic = " ".into();
        assert!(validate(&no_topic).is_err());

        assert!(validate(&config()).is_ok());
    }

    #[test]
    fn envelopes_decode_or_degrade() {
        let env = decode(1, Some(br#"{"eventType":"A","orgUnitId":3,"payload":{"x":1}}"#)).unwrap();
        assert_eq!(env.event_type.as_deref(), Some("A"));
        assert_eq!(env.org_unit_id, Some(3));

        assert!(decode(1, Some(b"\x00garbage")).is_none());
        assert!(decode(1, None).is_none());
    }
}
