//! `POST /ingest`: events pushed over HTTP.
//!
//! The API key is checked by middleware. This handler verifies the optional
//! HMAC signature over the raw body, parses the event and enqueues it for
//! the polling worker.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use conduit_core::models::EventId;
use conduit_sources::PushedEvent;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::{crypto::verify_signature, error::ApiError, state::AppState};

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Largest accepted body.
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Response to an accepted event.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    /// Id assigned by the push queue
    pub event_id: EventId,
}

/// Accepts one pushed event.
///
/// # Errors
///
/// - 401: signature missing or invalid
/// - 400: body is not a valid event
/// - 404: ingest is not enabled
/// - 503: the push queue is full
#[instrument(
    name = "ingest_event",
    skip(state, headers, body),
    fields(content_length = body.len())
)]
pub async fn ingest_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let ingest = state.ingest.as_ref().ok_or_else(|| {
        ApiError::new(StatusCode::NOT_FOUND, "INGEST_DISABLED", "ingest endpoint is not enabled")
    })?;

    if let Some(secret) = ingest.signing_secret.as_deref() {
        let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()).unwrap_or("");
        verify_signature(&body, signature, secret).inspect_err(|e| {
            warn!(code = e.code(), "rejected pushed event with bad signature");
        })?;
    }

    let pushed: PushedEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request("INVALID_PAYLOAD", format!("invalid event body: {e}")))?;
    let event_type = pushed.event_type.clone();
    let org_id = pushed.org_id;

    let event_id = ingest.source.push(pushed).await.inspect_err(|e| {
        warn!(code = e.code(), error = %e, "pushed event rejected");
    })?;

    info!(event_id = %event_id, org_id = %org_id, event_type = %event_type, "event accepted");
    Ok((StatusCode::ACCEPTED, Json(IngestResponse { event_id })).into_response())
}
