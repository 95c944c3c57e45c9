//! Test infrastructure for conduit crates.
//!
//! Fixture builders for rules and events, a wiremock-backed delivery target
//! and proptest helpers. Deterministic time comes from
//! [`conduit_core::TestClock`], re-exported here.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod fixtures;
pub mod http;
pub mod property;

pub use conduit_core::TestClock;
pub use fixtures::{dead_letter_for, fixed_time, EventBuilder, RuleBuilder};
pub use http::MockTarget;
pub use property::proptest_config;
