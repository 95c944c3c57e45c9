//! Shared handler state.

use std::sync::Arc;

use conduit_core::Clock;
use conduit_delivery::{CircuitBreakerManager, DeliveryStorage, DlqManager, Dispatcher};
use conduit_sources::{HttpPushSource, HttpPushSourceConfig};

/// Push queue behind `POST /ingest` and the credentials guarding it.
#[derive(Clone)]
pub struct IngestState {
    /// Queue the polling worker drains.
    pub source: Arc<HttpPushSource>,
    /// Required `X-Api-Key` value.
    pub api_key: Option<String>,
    /// HMAC key for `X-Signature`.
    pub signing_secret: Option<String>,
}

impl IngestState {
    /// Ingest state for `source` with the credentials of `config`.
    pub fn new(source: Arc<HttpPushSource>, config: &HttpPushSourceConfig) -> Self {
        Self {
            source,
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            signing_secret: config.signing_secret.clone().filter(|s| !s.is_empty()),
        }
    }
}

/// State cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    /// Storage, for readiness.
    pub storage: Arc<dyn DeliveryStorage>,
    /// Dead-letter replay and abandon.
    pub dlq: Arc<DlqManager>,
    /// Breaker registry shared with the dispatcher.
    pub circuits: Arc<CircuitBreakerManager>,
    /// Timestamps in responses.
    pub clock: Arc<dyn Clock>,
    /// Present when events arrive over HTTP.
    pub ingest: Option<IngestState>,
}

impl AppState {
    /// State sharing storage, breakers and clock with `dispatcher`.
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            storage: dispatcher.storage().clone(),
            circuits: dispatcher.circuits().clone(),
            clock: dispatcher.clock().clone(),
            dlq: Arc::new(DlqManager::new(dispatcher)),
            ingest: None,
        }
    }

    /// Enables `POST /ingest`.
    #[must_use]
    pub fn with_ingest(mut self, ingest: IngestState) -> Self {
        self.ingest = Some(ingest);
        self
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").field("ingest", &self.ingest.is_some()).finish_non_exhaustive()
    }
}
