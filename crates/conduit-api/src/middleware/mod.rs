//! HTTP middleware: ingest API keys and request ids.

pub mod auth;
pub mod request_id;

pub use auth::require_api_key;
pub use request_id::{inject_request_id, RequestId};
