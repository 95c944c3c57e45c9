//! Liveness and readiness probes.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::state::AppState;

/// Readiness response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// When the check ran
    pub timestamp: DateTime<Utc>,
    /// Individual component checks
    pub checks: HealthChecks,
    /// Circuits currently open
    pub open_circuits: usize,
    /// Service version
    pub version: String,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Storage is failing
    Unhealthy,
}

/// Component checks.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Storage round trip
    pub database: ComponentHealth,
}

/// Health of one component.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    /// Component status
    pub status: ComponentStatus,
    /// Error message when down
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Check duration in milliseconds
    pub response_time_ms: u64,
}

/// Component-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is healthy
    Up,
    /// Component is failing
    Down,
}

/// Liveness: the process answers HTTP. Touches no dependency.
#[instrument(name = "liveness_check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let response = serde_json::json!({
        "status": "alive",
        "timestamp": state.clock.now_utc(),
        "service": "conduit",
        "version": env!("CARGO_PKG_VERSION"),
    });

    (StatusCode::OK, Json(response)).into_response()
}

/// Readiness: storage answers a trivial query. 503 otherwise.
#[instrument(name = "readiness_check", skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> Response {
    let started = state.clock.now();
    let database = match state.storage.health_check().await {
        Ok(()) => ComponentHealth { status: ComponentStatus::Up, message: None, response_time_ms: 0 },
        Err(e) => {
            error!(error = %e, "storage health check failed");
            ComponentHealth {
                status: ComponentStatus::Down,
                message: Some(format!("storage unavailable: {e}")),
                response_time_ms: 0,
            }
        },
    };
    let elapsed = state.clock.now().saturating_duration_since(started);
    let database = ComponentHealth {
        response_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        ..database
    };

    let status = match database.status {
        ComponentStatus::Up => HealthStatus::Healthy,
        ComponentStatus::Down => HealthStatus::Unhealthy,
    };
    let open_circuits = state
        .circuits
        .all_circuit_stats()
        .await
        .iter()
        .filter(|c| c.state != conduit_delivery::CircuitState::Closed)
        .count();

    debug!(status = ?status, open_circuits, "readiness check completed");

    let status_code = match status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    let body = HealthResponse {
        status,
        timestamp: state.clock.now_utc(),
        checks: HealthChecks { database },
        open_circuits,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (status_code, Json(body)).into_response()
}
