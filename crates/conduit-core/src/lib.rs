//! Core domain models and shared primitives for the conduit gateway.
//!
//! Holds the event, rule, delivery-log, schedule and dead-letter models,
//! the strongly-typed identifiers that flow between crates, the injectable
//! [`Clock`](time::Clock), the target URL validator and the PostgreSQL
//! repositories. Every other crate in the workspace builds on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;
pub mod url_policy;

pub use error::{CoreError, Result};
pub use models::{
    ActionExecution, AuthSettings, AuthType, CancellationInfo, DeliveryAttemptLog, DeliveryLogId,
    DeliveryMode, DeliveryStatus, DeliveryTarget, DlqEntry, DlqEntryId, DlqStatus, Event, EventId,
    FieldMapping, FieldTransform, HttpMethod, IntegrationRule, LookupConfig, OrgId, OrgUnitId,
    RecurringConfig, RetryStrategy, RuleAction, RuleId, RuleScope, ScheduleStatus,
    ScheduledDelivery, ScheduledDeliveryId, SchedulingConfig, SimpleTransform, StaticField,
    TransformConfig, UnmappedBehavior, WorkerCheckpoint,
};
pub use time::{Clock, RealClock, TestClock};
pub use url_policy::{redirect_policy, validate_target_url, UrlPolicy, UrlValidationError};
