//! Event delivery engine.
//!
//! The polling worker reads events from the configured source, matches them
//! against integration rules along the org-unit hierarchy and hands each
//! match to the dispatcher, or to the scheduler for delayed and recurring
//! rules. The dispatcher runs lookups, transforms, auth headers and URL
//! validation, then delivers behind a per-rule circuit breaker. Retries are
//! persisted as pending scheduled rows that the scheduler's due poller picks
//! up. Terminal failures land in the dead-letter queue, from which operators
//! replay or abandon them.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use conduit_core::{Clock, RealClock};
//! use conduit_delivery::{
//!     storage::mock::MockDeliveryStorage, DedupCache, DeliveryClient, DeliveryEngine,
//!     DispatchConfig, Dispatcher, PollingWorker, Scheduler, WorkerConfig,
//! };
//! use conduit_sources::{HttpPushSource, HttpPushSourceConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
//! let dispatcher = Arc::new(Dispatcher::new(
//!     Arc::new(MockDeliveryStorage::new()),
//!     DeliveryClient::with_defaults()?,
//!     clock.clone(),
//!     DispatchConfig::default(),
//! ));
//! let scheduler = Arc::new(Scheduler::new(dispatcher.clone(), Default::default()));
//! let worker = Arc::new(PollingWorker::new(
//!     Arc::new(HttpPushSource::new(&HttpPushSourceConfig::default())),
//!     dispatcher,
//!     scheduler.clone(),
//!     Arc::new(DedupCache::new(Default::default(), clock)),
//!     WorkerConfig::default(),
//! ));
//!
//! let mut engine = DeliveryEngine::new(worker, scheduler);
//! engine.start()?;
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod circuit;
pub mod client;
pub mod dedup;
pub mod dispatcher;
pub mod dlq;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod worker;

pub use auth::{build_auth_headers, AuthHeaders};
pub use circuit::{CircuitBreakerManager, CircuitConfig, CircuitState, CircuitStats};
pub use client::{ClientConfig, DeliveryClient};
pub use dedup::{DedupCache, DedupConfig};
pub use dispatcher::{
    DeliveryJob, DispatchConfig, DispatchOutcome, Dispatcher, RetryMode, TargetOutcome,
};
pub use dlq::{DlqError, DlqManager, ReplayResult};
pub use engine::{DeliveryEngine, EngineError};
pub use error::{AuthError, DeliveryError, DispatchError, ErrorCategory, Result};
pub use retry::{BackoffConfig, RetryDecision, RetryPolicy};
pub use scheduler::{DueReport, Scheduler, SchedulerConfig};
pub use storage::{DeliveryStorage, PostgresDeliveryStorage};
pub use worker::{PollingWorker, WorkerConfig, WorkerError, WorkerStats};
