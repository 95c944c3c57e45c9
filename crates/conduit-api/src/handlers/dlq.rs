//! Dead-letter operator endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use bytes::Bytes;
use conduit_core::models::{DlqEntryId, DlqStatus};
use conduit_delivery::ReplayResult;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    error::{ApiError, ErrorDetail},
    state::AppState,
};

/// Most ids accepted by one bulk retry.
pub const MAX_BULK_RETRY: usize = 100;

/// Body of `POST /dlq/retry`.
#[derive(Debug, Deserialize)]
pub struct BulkRetryRequest {
    /// Entries to replay, in order.
    pub ids: Vec<Uuid>,
}

/// Per-entry outcome of a bulk retry.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRetryItem {
    /// Entry id
    pub id: DlqEntryId,
    /// Replay outcome, when the replay ran
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ReplayResult>,
    /// Refusal, when it did not
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

/// Response of `POST /dlq/retry`.
#[derive(Debug, Serialize)]
pub struct BulkRetryResponse {
    /// One item per requested id
    pub results: Vec<BulkRetryItem>,
}

/// Body of `POST /dlq/{id}/abandon`.
#[derive(Debug, Default, Deserialize)]
pub struct AbandonRequest {
    /// Operator note appended to the error message.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Response of `POST /dlq/{id}/abandon`.
#[derive(Debug, Serialize)]
pub struct AbandonResponse {
    /// Entry id
    pub id: DlqEntryId,
    /// Always `abandoned`
    pub status: DlqStatus,
}

/// Replays one pending entry.
///
/// # Errors
///
/// 404 for an unknown entry, 409 when it is not pending and 422 when its
/// rule or action is gone.
#[instrument(name = "dlq_retry", skip(state))]
pub async fn retry_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReplayResult>, ApiError> {
    let result = state.dlq.retry(DlqEntryId(id)).await?;
    info!(status = %result.status, retry_count = result.retry_count, "manual retry finished");
    Ok(Json(result))
}

/// Replays several entries one after another.
///
/// Refusals are reported per entry and do not stop the batch.
///
/// # Errors
///
/// 400 when `ids` is empty or longer than [`MAX_BULK_RETRY`].
#[instrument(name = "dlq_retry_bulk", skip(state, request), fields(count = request.ids.len()))]
pub async fn retry_bulk(
    State(state): State<AppState>,
    Json(request): Json<BulkRetryRequest>,
) -> Result<Json<BulkRetryResponse>, ApiError> {
    if request.ids.is_empty() {
        return Err(ApiError::bad_request("INVALID_REQUEST", "ids must not be empty"));
    }
    if request.ids.len() > MAX_BULK_RETRY {
        return Err(ApiError::bad_request(
            "INVALID_REQUEST",
            format!("at most {MAX_BULK_RETRY} ids per bulk retry"),
        ));
    }

    let ids: Vec<_> = request.ids.into_iter().map(DlqEntryId).collect();
    let results = state
        .dlq
        .retry_bulk(&ids)
        .await
        .into_iter()
        .map(|(id, outcome)| match outcome {
            Ok(result) => BulkRetryItem { id, result: Some(result), error: None },
            Err(e) => {
                BulkRetryItem { id, result: None, error: Some(ApiError::from(e).detail().clone()) }
            },
        })
        .collect();

    Ok(Json(BulkRetryResponse { results }))
}

/// Abandons one pending entry.
///
/// The body is optional.
///
/// # Errors
///
/// 400 for a malformed body, 404 for an unknown entry and 409 when it is
/// not pending.
#[instrument(name = "dlq_abandon", skip(state, body))]
pub async fn abandon_entry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> Result<(StatusCode, Json<AbandonResponse>), ApiError> {
    let request: AbandonRequest = if body.iter().all(u8::is_ascii_whitespace) {
        AbandonRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request("INVALID_REQUEST", format!("invalid body: {e}")))?
    };
    let reason = request.reason.filter(|r| !r.trim().is_empty());

    let id = DlqEntryId(id);
    state.dlq.abandon(id, reason).await?;

    Ok((StatusCode::OK, Json(AbandonResponse { id, status: DlqStatus::Abandoned })))
}
