//! Builds the configured source adapter.

use std::sync::Arc;

use conduit_core::Clock;
use tracing::info;

use crate::{
    config::SourceConfig, error::Result, push::HttpPushSource, relational::RelationalSource,
    stream::StreamSource, EventSource,
};

/// The active source, plus the push queue when the ingest endpoint feeds it.
#[derive(Clone)]
pub struct SourceHandle {
    /// Adapter polled by the worker.
    pub source: Arc<dyn EventSource>,
    /// Same adapter as its concrete push type, for the ingest endpoint.
    pub push: Option<Arc<HttpPushSource>>,
}

impl std::fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceHandle")
            .field("source", &self.source.name())
            .field("push", &self.push.is_some())
            .finish()
    }
}

impl SourceHandle {
    /// Wraps a push queue.
    pub fn push(source: Arc<HttpPushSource>) -> Self {
        Self { source: source.clone(), push: Some(source) }
    }

    /// Wraps any other adapter.
    pub fn polled(source: Arc<dyn EventSource>) -> Self {
        Self { source, push: None }
    }
}

/// Constructs the adapter named by `config`, reading time from `clock`.
///
/// # Errors
///
/// Returns configuration errors, and for the stream adapter a connection
/// error when the brokers cannot be reached.
pub async fn build_source(config: &SourceConfig, clock: Arc<dyn Clock>) -> Result<SourceHandle> {
    let handle = match config {
        SourceConfig::Relational(cfg) => {
            SourceHandle::polled(Arc::new(RelationalSource::connect(cfg)?.with_clock(clock)))
        },
        SourceConfig::Stream(cfg) => SourceHandle::polled(Arc::new(StreamSource::connect(cfg).await?)),
        SourceConfig::HttpPush(cfg) => {
            SourceHandle::push(Arc::new(HttpPushSource::with_clock(cfg, clock)))
        },
    };

    info!(kind = config.kind(), "event source ready");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use conduit_core::RealClock;

    use super::*;
    use crate::config::{HttpPushSourceConfig, RelationalSourceConfig};

    fn clock() -> Arc<dyn Clock> {
        Arc::new(RealClock::new())
    }

    #[tokio::test]
    async fn push_config_exposes_the_queue() {
        let handle =
            build_source(&SourceConfig::HttpPush(HttpPushSourceConfig { capacity: 4, ..Default::default() }), clock())
                .await
                .unwrap();

        assert_eq!(handle.source.name(), "http_push");
        assert!(handle.push.is_some());
    }

    #[tokio::test]
    async fn relational_config_builds_without_connecting() {
        let config = SourceConfig::Relational(RelationalSourceConfig {
            database_url: "postgres://reader:pw@127.0.0.1:1/events".into(),
            org_id: 1,
            table: "outbox".into(),
            id_column: "id".into(),
            org_column: "org_id".into(),
            org_unit_column: None,
            event_type_column: "event_type".into(),
            payload_column: "payload".into(),
            timestamp_column: None,
            max_connections: 1,
        });

        let handle = build_source(&config, clock()).await.unwrap();

        assert_eq!(handle.source.name(), "relational");
        assert!(handle.push.is_none());
    }
}
