//! Conduit HTTP surface and service configuration.
//!
//! Serves the push-ingest endpoint, health probes and the operator
//! endpoints for dead-letter replay and circuit resets. [`Config`] loads
//! the whole service configuration and converts it into the settings of
//! the delivery, transform and source crates.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod server;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ErrorDetail, ErrorResponse};
pub use server::{create_router, shutdown_signal, start_server};
pub use state::{AppState, IngestState};
