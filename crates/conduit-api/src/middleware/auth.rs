//! API key check for the ingest endpoint.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::{crypto::constant_time_eq, error::ApiError, state::AppState};

/// Header carrying the ingest API key.
pub const API_KEY_HEADER: &str = "x-api-key";

fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()).filter(|k| !k.is_empty())
}

/// Rejects requests whose `X-Api-Key` does not match the configured key.
///
/// Passes everything through when no key is configured.
pub async fn require_api_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.ingest.as_ref().and_then(|i| i.api_key.as_deref()) else {
        return Ok(next.run(req).await);
    };

    let provided = extract_api_key(req.headers())
        .ok_or_else(|| ApiError::unauthorized("AUTH_MISSING_API_KEY", "missing X-Api-Key header"))?;

    if !constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        warn!("rejected ingest request with invalid API key");
        return Err(ApiError::unauthorized("AUTH_INVALID_API_KEY", "invalid API key"));
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn api_key_is_read_from_its_header() {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("test-api-key-12345"));

        assert_eq!(extract_api_key(&headers), Some("test-api-key-12345"));
    }

    #[test]
    fn absent_or_empty_key_is_none() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_api_key(&headers), None);

        headers.insert(API_KEY_HEADER, HeaderValue::from_static(""));
        assert_eq!(extract_api_key(&headers), None);
    }
}
