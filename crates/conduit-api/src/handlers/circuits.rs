//! Circuit breaker observation and reset.

use axum::{
    extract::{Path, State},
    Json,
};
use conduit_core::models::RuleId;
use conduit_delivery::{CircuitState, CircuitStats};
use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::state::AppState;

/// Response of `POST /circuits/{rule_id}/reset`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetResponse {
    /// Rule whose circuit was reset
    pub rule_id: RuleId,
    /// State before the reset; absent when the rule had no circuit
    pub previous_state: Option<CircuitState>,
    /// Always `closed`
    pub state: CircuitState,
}

/// Lists every tracked circuit.
#[instrument(name = "list_circuits", skip(state))]
pub async fn list_circuits(State(state): State<AppState>) -> Json<Vec<CircuitStats>> {
    let mut circuits = state.circuits.all_circuit_stats().await;
    circuits.sort_by_key(|c| c.rule_id);
    Json(circuits)
}

/// Closes a rule's circuit and clears its failure count.
#[instrument(name = "reset_circuit", skip(state))]
pub async fn reset_circuit(
    State(state): State<AppState>,
    Path(rule_id): Path<Uuid>,
) -> Json<ResetResponse> {
    let rule_id = RuleId(rule_id);
    let previous_state = state.circuits.reset(rule_id).await;
    info!(rule_id = %rule_id, previous = ?previous_state, "operator reset circuit");

    Json(ResetResponse { rule_id, previous_state, state: CircuitState::Closed })
}
