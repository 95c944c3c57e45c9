//! JSON error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use conduit_delivery::DlqError;
use conduit_sources::SourceError;
use serde::Serialize;

use crate::crypto::SignatureError;

/// Error response with code and message.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    /// Stable error code, e.g. `DLQ_NOT_FOUND`
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

/// Handler failure rendered as `{"error": {"code", "message"}}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: ErrorDetail,
}

impl ApiError {
    /// Error with an explicit status and code.
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { status, detail: ErrorDetail { code: code.into(), message: message.into() } }
    }

    /// 400 with `code`.
    pub fn bad_request(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    /// 401 with `code`.
    pub fn unauthorized(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, code, message)
    }

    /// HTTP status of the response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Code and message.
    pub fn detail(&self) -> &ErrorDetail {
        &self.detail
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.detail })).into_response()
    }
}

impl From<DlqError> for ApiError {
    fn from(error: DlqError) -> Self {
        let status = match &error {
            DlqError::NotFound(_) => StatusCode::NOT_FOUND,
            DlqError::InvalidState { .. } => StatusCode::CONFLICT,
            DlqError::RuleMissing(_)
            | DlqError::RuleInactive(_)
            | DlqError::ActionMissing { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            DlqError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, error.code(), error.to_string())
    }
}

impl From<SourceError> for ApiError {
    fn from(error: SourceError) -> Self {
        match &error {
            SourceError::QueueFull { .. } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, error.code(), error.to_string())
            },
            SourceError::InvalidConfig { message } => Self::bad_request("INVALID_EVENT", message.clone()),
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, error.code(), error.to_string()),
        }
    }
}

impl From<SignatureError> for ApiError {
    fn from(error: SignatureError) -> Self {
        match error {
            SignatureError::InvalidSecret => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, error.code(), error.to_string())
            },
            _ => Self::unauthorized(error.code(), error.to_string()),
        }
    }
}
