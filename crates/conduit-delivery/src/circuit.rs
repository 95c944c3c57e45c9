//! Per-rule circuit breaker.
//!
//! Counts consecutive delivery failures for each rule. Once the count
//! reaches the threshold the circuit opens and attempts are short-circuited
//! without an outbound call.
//!
//! ```text
//!   CLOSED ── threshold consecutive failures ──▶ OPEN
//!     ▲                                           │
//!     │ probe succeeds            open_timeout elapsed (if set)
//!     │                                           ▼
//!     └──────────────────────────────────────  HALF-OPEN ── probe fails ──▶ OPEN
//! ```
//!
//! A success in any state, or an operator [`reset`](CircuitBreakerManager::reset),
//! closes the circuit and clears the counter. Half-open admits a single
//! probe at a time.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use conduit_core::{models::RuleId, Clock};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Breaker settings shared by all rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Cool-down before a half-open probe; `None` keeps the circuit open
    /// until a reset.
    pub open_timeout: Option<Duration>,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, open_timeout: Some(Duration::from_secs(60)) }
    }
}

/// Current state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Deliveries flow.
    Closed,
    /// Deliveries are short-circuited.
    Open,
    /// One probe delivery is allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Observable state of one rule's circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStats {
    /// Rule the circuit guards.
    pub rule_id: RuleId,
    /// Current state.
    pub state: CircuitState,
    /// Failures since the last success or reset.
    pub consecutive_failures: u32,
    /// When the circuit last opened.
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    probe_in_flight: bool,
}

impl CircuitStats {
    fn new(rule_id: RuleId) -> Self {
        Self {
            rule_id,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Thread-safe breaker registry keyed by rule.
#[derive(Debug)]
pub struct CircuitBreakerManager {
    config: CircuitConfig,
    circuits: Mutex<HashMap<RuleId, CircuitStats>>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerManager {
    /// Creates an empty registry.
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, circuits: Mutex::new(HashMap::new()), clock }
    }

    /// Whether a delivery for `rule_id` may proceed.
    ///
    /// An open circuit past its cool-down moves to half-open and admits the
    /// caller as its probe.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn should_allow_request(&self, rule_id: RuleId) -> bool {
        let now = self.clock.now_utc();
        let mut circuits = self.circuits.lock().await;
        let stats = circuits.entry(rule_id).or_insert_with(|| CircuitStats::new(rule_id));

        match stats.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = match (self.config.open_timeout, stats.opened_at) {
                    (Some(timeout), Some(opened)) => {
                        (now - opened).to_std().is_ok_and(|elapsed| elapsed >= timeout)
                    },
                    _ => false,
                };
                if cooled {
                    info!(rule_id = %rule_id, "circuit half-open, admitting probe");
                    stats.state = CircuitState::HalfOpen;
                    stats.probe_in_flight = true;
                }
                cooled
            },
            CircuitState::HalfOpen => {
                if stats.probe_in_flight {
                    false
                } else {
                    stats.probe_in_flight = true;
                    true
                }
            },
        }
    }

    /// Records a delivered attempt; closes the circuit.
    pub async fn record_success(&self, rule_id: RuleId) {
        let mut circuits = self.circuits.lock().await;
        let stats = circuits.entry(rule_id).or_insert_with(|| CircuitStats::new(rule_id));
        if stats.state != CircuitState::Closed {
            info!(rule_id = %rule_id, "circuit closed after successful delivery");
        }
        *stats = CircuitStats::new(rule_id);
    }

    /// Records a failed delivery; may open the circuit.
    pub async fn record_failure(&self, rule_id: RuleId) {
        let now = self.clock.now_utc();
        let mut circuits = self.circuits.lock().await;
        let stats = circuits.entry(rule_id).or_insert_with(|| CircuitStats::new(rule_id));

        stats.consecutive_failures = stats.consecutive_failures.saturating_add(1);
        stats.probe_in_flight = false;

        let open = match stats.state {
            CircuitState::Closed => stats.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if open {
            warn!(
                rule_id = %rule_id,
                consecutive_failures = stats.consecutive_failures,
                "circuit breaker opening"
            );
            stats.state = CircuitState::Open;
            stats.opened_at = Some(now);
        }
    }

    /// Closes the circuit and clears its counter.
    ///
    /// Returns the state before the reset, `None` if the rule had no circuit.
    pub async fn reset(&self, rule_id: RuleId) -> Option<CircuitState> {
        let previous = self.circuits.lock().await.remove(&rule_id).map(|s| s.state);
        info!(rule_id = %rule_id, previous = ?previous, "circuit reset");
        previous
    }

    /// State of one rule's circuit.
    pub async fn circuit_stats(&self, rule_id: RuleId) -> Option<CircuitStats> {
        self.circuits.lock().await.get(&rule_id).cloned()
    }

    /// All tracked circuits.
    pub async fn all_circuit_stats(&self) -> Vec<CircuitStats> {
        self.circuits.lock().await.values().cloned().collect()
    }
}
