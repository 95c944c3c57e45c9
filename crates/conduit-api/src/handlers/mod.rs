//! HTTP request handlers.
//!
//! - `health`: liveness and readiness probes
//! - `ingest`: events pushed over HTTP
//! - `dlq`: dead-letter replay and abandon
//! - `circuits`: breaker observation and reset
//!
//! Failures render as `{"error": {"code", "message"}}` through
//! [`ApiError`](crate::error::ApiError).

pub mod circuits;
pub mod dlq;
pub mod health;
pub mod ingest;

pub use circuits::{list_circuits, reset_circuit};
pub use dlq::{abandon_entry, retry_bulk, retry_entry};
pub use health::{health_check, readiness_check};
pub use ingest::ingest_event;
