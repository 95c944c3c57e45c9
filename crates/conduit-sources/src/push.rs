//! HTTP push adapter: a bounded queue filled by the ingest endpoint.

use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_core::{
    models::{Event, EventId, OrgId, OrgUnitId},
    Clock, RealClock,
};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    config::HttpPushSourceConfig,
    error::{Result, SourceError},
    EventSource,
};

/// Body of a pushed event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushedEvent {
    /// Organization.
    pub org_id: OrgId,
    /// Unit, if any.
    #[serde(default)]
    pub org_unit_id: Option<OrgUnitId>,
    /// Event type.
    pub event_type: String,
    /// JSON object payload.
    pub payload: Value,
    /// Occurrence time, defaulting to receipt time.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Queue {
    events: VecDeque<Event>,
    last_id: i64,
}

/// Events pushed over HTTP, held in memory until acknowledged.
///
/// Ids are `max(last + 1, now in µs)`, which keeps them increasing across
/// restarts as long as the wall clock does.
#[derive(Debug)]
pub struct HttpPushSource {
    queue: Mutex<Queue>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl HttpPushSource {
    /// Creates an empty queue.
    pub fn new(config: &HttpPushSourceConfig) -> Self {
        Self::with_clock(config, Arc::new(RealClock::new()))
    }

    /// Creates an empty queue whose ids derive from `clock`.
    pub fn with_clock(config: &HttpPushSourceConfig, clock: Arc<dyn Clock>) -> Self {
        Self { queue: Mutex::new(Queue::default()), capacity: config.capacity.max(1), clock }
    }

    /// Enqueues an event and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::QueueFull`] at capacity and
    /// [`SourceError::InvalidConfig`] for an empty event type or a
    /// non-object payload.
    pub async fn push(&self, pushed: PushedEvent) -> Result<EventId> {
        if pushed.event_type.trim().is_empty() {
            return Err(SourceError::config("eventType must not be empty"));
        }
        if !pushed.payload.is_object() {
            return Err(SourceError::config("payload must be a JSON object"));
        }

        let now = self.clock.now_utc();
        let mut queue = self.queue.lock().await;
        if queue.events.len() >= self.capacity {
            return Err(SourceError::QueueFull { capacity: self.capacity });
        }

        let id = queue.last_id.saturating_add(1).max(now.timestamp_micros());
        queue.last_id = id;
        queue.events.push_back(Event {
            id: EventId(id),
            org_id: pushed.org_id,
            org_unit_id: pushed.org_unit_id,
            event_type: pushed.event_type,
            payload: pushed.payload,
            timestamp: pushed.timestamp.unwrap_or(now),
            source: "http_push".to_string(),
        });

        debug!(event_id = id, queued = queue.events.len(), "accepted pushed event");
        Ok(EventId(id))
    }

    /// Events waiting for acknowledgement.
    pub async fn len(&self) -> usize {
        self.queue.lock().await.events.len()
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.events.is_empty()
    }

    async fn release_through(&self, id: EventId) {
        let mut queue = self.queue.lock().await;
        queue.events.retain(|e| e.id > id);
    }
}

#[async_trait]
impl EventSource for HttpPushSource {
    fn name(&self) -> &str {
        "http_push"
    }

    async fn poll(&self, checkpoint: EventId, batch_size: usize) -> Result<Vec<Event>> {
        let queue = self.queue.lock().await;
        Ok(queue.events.iter().filter(|e| e.id > checkpoint).take(batch_size).cloned().collect())
    }

    async fn ack(&self, event: &Event) -> Result<()> {
        self.release_through(event.id).await;
        Ok(())
    }

    async fn nack(&self, event: &Event) -> Result<()> {
        self.release_through(event.id).await;
        Ok(())
    }

    async fn latest_position(&self) -> Result<EventId> {
        let queue = self.queue.lock().await;
        let oldest = queue.events.front().map(|e| e.id.0.saturating_sub(1));
        Ok(EventId(oldest.unwrap_or(queue.last_id)))
    }
}
