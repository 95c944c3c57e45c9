//! Storage abstraction for the delivery loops.
//!
//! The worker, dispatcher, DLQ manager and scheduler depend on
//! [`DeliveryStorage`] rather than the concrete repositories, so their logic
//! can be exercised against [`mock::MockDeliveryStorage`] without a
//! database. [`PostgresDeliveryStorage`] adapts `conduit_core::Storage`.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use conduit_core::{
    error::Result,
    models::{
        CancellationInfo, DeliveryAttemptLog, DlqEntry, DlqEntryId, DlqStatus, EventId,
        IntegrationRule, OrgId, OrgUnitId, RuleId, ScheduleStatus, ScheduledDelivery,
        ScheduledDeliveryId,
    },
    storage::Storage,
};

/// Boxed future returned by every storage operation.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Persistence operations needed by the delivery loops.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Active rules of `org_id` listening to `event_type` or `*`.
    fn find_active_rules<'a>(
        &'a self,
        org_id: OrgId,
        event_type: &'a str,
    ) -> StorageFuture<'a, Vec<IntegrationRule>>;

    /// Active scheduled rules that `event_type` cancels.
    fn find_cancelling_rules<'a>(
        &'a self,
        org_id: OrgId,
        event_type: &'a str,
    ) -> StorageFuture<'a, Vec<IntegrationRule>>;

    /// A rule by id, active or not.
    fn find_rule(&self, rule_id: RuleId) -> StorageFuture<'_, Option<IntegrationRule>>;

    /// Strict ancestors of `unit`.
    fn ancestors(&self, org_id: OrgId, unit: OrgUnitId) -> StorageFuture<'_, Vec<OrgUnitId>>;

    /// Appends a delivery attempt row.
    fn record_log(&self, log: DeliveryAttemptLog) -> StorageFuture<'_, ()>;

    /// Persists a new dead-letter entry.
    fn create_dlq(&self, entry: DlqEntry) -> StorageFuture<'_, ()>;

    /// A dead-letter entry by id.
    fn find_dlq(&self, id: DlqEntryId) -> StorageFuture<'_, Option<DlqEntry>>;

    /// Moves an entry from `from` to `to`; `false` if it was not in `from`.
    fn transition_dlq(
        &self,
        id: DlqEntryId,
        from: DlqStatus,
        to: DlqStatus,
    ) -> StorageFuture<'_, bool>;

    /// Writes back an entry's status, error, retry count and failure time;
    /// `false` if the stored entry was not in `from`.
    fn update_dlq(&self, entry: DlqEntry, from: DlqStatus) -> StorageFuture<'_, bool>;

    /// Last processed id of `worker_id`.
    fn load_checkpoint<'a>(&'a self, worker_id: &'a str) -> StorageFuture<'a, Option<EventId>>;

    /// Advances the checkpoint, never backwards. Returns the stored id.
    fn save_checkpoint<'a>(
        &'a self,
        worker_id: &'a str,
        last_processed_id: EventId,
        at: DateTime<Utc>,
    ) -> StorageFuture<'a, EventId>;

    /// Persists a new pending scheduled delivery.
    fn create_scheduled(&self, delivery: ScheduledDelivery) -> StorageFuture<'_, ()>;

    /// Pending rows due at or before `now_ms`, oldest first.
    fn find_due(&self, now_ms: i64, limit: usize) -> StorageFuture<'_, Vec<ScheduledDelivery>>;

    /// Moves a pending row to a terminal status; `false` if it was not pending.
    fn complete_scheduled(
        &self,
        id: ScheduledDeliveryId,
        status: ScheduleStatus,
        last_error: Option<String>,
        at: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Moves a pending row to a later due time and attempt; `false` if it
    /// was not pending.
    fn reschedule_scheduled(
        &self,
        id: ScheduledDeliveryId,
        attempt: i32,
        scheduled_for: i64,
        last_error: String,
        at: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Cancels one pending row; `false` if it was not pending.
    fn cancel_scheduled(
        &self,
        id: ScheduledDeliveryId,
        reason: String,
        at: DateTime<Utc>,
    ) -> StorageFuture<'_, bool>;

    /// Cancels every pending row of `rule_ids` matched by `criteria`.
    fn cancel_matching(
        &self,
        org_id: OrgId,
        rule_ids: Vec<RuleId>,
        criteria: CancellationInfo,
        reason: String,
        at: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<ScheduledDeliveryId>>;

    /// Succeeds when the backing store answers.
    fn health_check(&self) -> StorageFuture<'_, ()>;
}

/// PostgreSQL implementation over the core repositories.
pub struct PostgresDeliveryStorage {
    storage: Arc<Storage>,
}

impl PostgresDeliveryStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn find_active_rules<'a>(
        &'a self,
        org_id: OrgId,
        event_type: &'a str,
    ) -> StorageFuture<'a, Vec<IntegrationRule>> {
        Box::pin(self.storage.rules.find_active_for_event(org_id, event_type))
    }

    fn find_cancelling_rules<'a>(
        &'a self,
        org_id: OrgId,
        event_type: &'a str,
    ) -> StorageFuture<'a, Vec<IntegrationRule>> {
        Box::pin(self.storage.rules.find_cancelling(org_id, event_type))
    }

    fn find_rule(&self, rule_id: RuleId) -> StorageFuture<'_, Option<IntegrationRule>> {
        Box::pin(self.storage.rules.find_by_id(rule_id))
    }

    fn ancestors(&self, org_id: OrgId, unit: OrgUnitId) -> StorageFuture<'_, Vec<OrgUnitId>> {
        Box::pin(self.storage.org_units.ancestors(org_id, unit))
    }

    fn record_log(&self, log: DeliveryAttemptLog) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_logs.create(&log).await.map(|_| ()) })
    }

    fn create_dlq(&self, entry: DlqEntry) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.dlq_entries.create(&entry).await.map(|_| ()) })
    }

    fn find_dlq(&self, id: DlqEntryId) -> StorageFuture<'_, Option<DlqEntry>> {
        Box::pin(self.storage.dlq_entries.find_by_id(id))
    }

    fn transition_dlq(
        &self,
        id: DlqEntryId,
        from: DlqStatus,
        to: DlqStatus,
    ) -> StorageFuture<'_, bool> {
        Box::pin(self.storage.dlq_entries.transition(id, from, to))
    }

    fn update_dlq(&self, entry: DlqEntry, from: DlqStatus) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.dlq_entries.update(&entry, from).await })
    }

    fn load_checkpoint<'a>(&'a self, worker_id: &'a str) -> StorageFuture<'a, Option<EventId>> {
        Box::pin(async move {
            Ok(self.storage.checkpoints.find(worker_id).await?.map(|c| c.last_processed_id))
        })
    }

    fn save_checkpoint<'a>(
        &'a self,
        worker_id: &'a str,
        last_processed_id: EventId,
        at: DateTime<Utc>,
    ) -> StorageFuture<'a, EventId> {
        Box::pin(self.storage.checkpoints.save(worker_id, last_processed_id, at))
    }

    fn create_scheduled(&self, delivery: ScheduledDelivery) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.scheduled_deliveries.create(&delivery).await.map(|_| ()) })
    }

    fn find_due(&self, now_ms: i64, limit: usize) -> StorageFuture<'_, Vec<ScheduledDelivery>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Box::pin(self.storage.scheduled_deliveries.find_due(now_ms, limit))
    }

    fn complete_scheduled(
        &self,
        id: ScheduledDeliveryId,
        status: ScheduleStatus,
        last_error: Option<String>,
        at: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.scheduled_deliveries.complete(id, status, last_error.as_deref(), at).await
        })
    }

    fn reschedule_scheduled(
        &self,
        id: ScheduledDeliveryId,
        attempt: i32,
        scheduled_for: i64,
        last_error: String,
        at: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage
                .scheduled_deliveries
                .reschedule(id, attempt, scheduled_for, &last_error, at)
                .await
        })
    }

    fn cancel_scheduled(
        &self,
        id: ScheduledDeliveryId,
        reason: String,
        at: DateTime<Utc>,
    ) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.scheduled_deliveries.cancel_by_id(id, &reason, at).await })
    }

    fn cancel_matching(
        &self,
        org_id: OrgId,
        rule_ids: Vec<RuleId>,
        criteria: CancellationInfo,
        reason: String,
        at: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<ScheduledDeliveryId>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage
                .scheduled_deliveries
                .cancel_matching(org_id, &rule_ids, &criteria, &reason, at)
                .await
        })
    }

    fn health_check(&self) -> StorageFuture<'_, ()> {
        Box::pin(self.storage.health_check())
    }
}

pub mod mock {
    //! In-memory storage for exercising the delivery loops without a
    //! database.
    //!
    //! Operations can be made to fail once through the `inject_*` methods.

    use std::collections::HashMap;

    use conduit_core::CoreError;
    use tokio::sync::RwLock;

    use super::{
        CancellationInfo, DateTime, DeliveryAttemptLog, DeliveryStorage, DlqEntry, DlqEntryId,
        DlqStatus, EventId, IntegrationRule, OrgId, OrgUnitId, Result, RuleId, ScheduleStatus,
        ScheduledDelivery, ScheduledDeliveryId, StorageFuture, Utc,
    };

    /// Mock storage for testing delivery logic without a database.
    #[derive(Default)]
    pub struct MockDeliveryStorage {
        rules: RwLock<Vec<IntegrationRule>>,
        parents: RwLock<HashMap<OrgUnitId, OrgUnitId>>,
        logs: RwLock<Vec<DeliveryAttemptLog>>,
        dlq: RwLock<Vec<DlqEntry>>,
        checkpoints: RwLock<HashMap<String, EventId>>,
        scheduled: RwLock<Vec<ScheduledDelivery>>,
        rules_error: RwLock<Option<String>>,
        log_error: RwLock<Option<String>>,
        checkpoint_error: RwLock<Option<String>>,
        scheduled_error: RwLock<Option<String>>,
        dlq_update_error: RwLock<Option<String>>,
        health_error: RwLock<Option<String>>,
    }

    async fn take_error(slot: &RwLock<Option<String>>) -> Result<()> {
        match slot.write().await.take() {
            Some(message) => Err(CoreError::Database(message)),
            None => Ok(()),
        }
    }

    impl MockDeliveryStorage {
        /// Creates empty storage.
        pub fn new() -> Self {
            Self::default()
        }

        /// Adds or replaces a rule.
        pub async fn add_rule(&self, rule: IntegrationRule) {
            let mut rules = self.rules.write().await;
            rules.retain(|r| r.id != rule.id);
            rules.push(rule);
        }

        /// Removes a rule.
        pub async fn remove_rule(&self, rule_id: RuleId) {
            self.rules.write().await.retain(|r| r.id != rule_id);
        }

        /// Declares `parent` as the parent unit of `unit`.
        pub async fn set_parent(&self, unit: OrgUnitId, parent: OrgUnitId) {
            self.parents.write().await.insert(unit, parent);
        }

        /// Seeds a dead-letter entry.
        pub async fn add_dlq(&self, entry: DlqEntry) {
            self.dlq.write().await.push(entry);
        }

        /// Seeds a scheduled delivery.
        pub async fn add_scheduled(&self, delivery: ScheduledDelivery) {
            self.scheduled.write().await.push(delivery);
        }

        /// Seeds a checkpoint.
        pub async fn set_checkpoint(&self, worker_id: &str, id: EventId) {
            self.checkpoints.write().await.insert(worker_id.to_string(), id);
        }

        /// Every delivery log, in write order.
        pub async fn logs(&self) -> Vec<DeliveryAttemptLog> {
            self.logs.read().await.clone()
        }

        /// Every dead-letter entry.
        pub async fn dlq_entries(&self) -> Vec<DlqEntry> {
            self.dlq.read().await.clone()
        }

        /// Every scheduled delivery.
        pub async fn scheduled(&self) -> Vec<ScheduledDelivery> {
            self.scheduled.read().await.clone()
        }

        /// Stored checkpoint of `worker_id`.
        pub async fn checkpoint(&self, worker_id: &str) -> Option<EventId> {
            self.checkpoints.read().await.get(worker_id).copied()
        }

        /// Fails the next rule lookup.
        pub async fn inject_rules_error(&self, message: impl Into<String>) {
            *self.rules_error.write().await = Some(message.into());
        }

        /// Fails the next log write.
        pub async fn inject_log_error(&self, message: impl Into<String>) {
            *self.log_error.write().await = Some(message.into());
        }

        /// Fails the next checkpoint write.
        pub async fn inject_checkpoint_error(&self, message: impl Into<String>) {
            *self.checkpoint_error.write().await = Some(message.into());
        }

        /// Fails the next scheduled-delivery insert.
        pub async fn inject_scheduled_error(&self, message: impl Into<String>) {
            *self.scheduled_error.write().await = Some(message.into());
        }

        /// Fails the next dead-letter update.
        pub async fn inject_dlq_update_error(&self, message: impl Into<String>) {
            *self.dlq_update_error.write().await = Some(message.into());
        }

        /// Fails the next health check.
        pub async fn inject_health_error(&self, message: impl Into<String>) {
            *self.health_error.write().await = Some(message.into());
        }
    }

    impl DeliveryStorage for MockDeliveryStorage {
        fn find_active_rules<'a>(
            &'a self,
            org_id: OrgId,
            event_type: &'a str,
        ) -> StorageFuture<'a, Vec<IntegrationRule>> {
            Box::pin(async move {
                take_error(&self.rules_error).await?;
                Ok(self
                    .rules
                    .read()
                    .await
                    .iter()
                    .filter(|r| r.org_id == org_id && r.is_active && r.matches_event_type(event_type))
                    .cloned()
                    .collect())
            })
        }

        fn find_cancelling_rules<'a>(
            &'a self,
            org_id: OrgId,
            event_type: &'a str,
        ) -> StorageFuture<'a, Vec<IntegrationRule>> {
            Box::pin(async move {
                Ok(self
                    .rules
                    .read()
                    .await
                    .iter()
                    .filter(|r| r.org_id == org_id && r.is_active && r.cancels_on(event_type))
                    .cloned()
                    .collect())
            })
        }

        fn find_rule(&self, rule_id: RuleId) -> StorageFuture<'_, Option<IntegrationRule>> {
            Box::pin(async move {
                Ok(self.rules.read().await.iter().find(|r| r.id == rule_id).cloned())
            })
        }

        fn ancestors(&self, _org_id: OrgId, unit: OrgUnitId) -> StorageFuture<'_, Vec<OrgUnitId>> {
            Box::pin(async move {
                let parents = self.parents.read().await;
                let mut chain = Vec::new();
                let mut current = unit;
                while let Some(&parent) = parents.get(&current) {
                    if chain.contains(&parent) || chain.len() >= 64 {
                        break;
                    }
                    chain.push(parent);
                    current = parent;
                }
                Ok(chain)
            })
        }

        fn record_log(&self, log: DeliveryAttemptLog) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                take_error(&self.log_error).await?;
                self.logs.write().await.push(log);
                Ok(())
            })
        }

        fn create_dlq(&self, entry: DlqEntry) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                self.dlq.write().await.push(entry);
                Ok(())
            })
        }

        fn find_dlq(&self, id: DlqEntryId) -> StorageFuture<'_, Option<DlqEntry>> {
            Box::pin(async move { Ok(self.dlq.read().await.iter().find(|e| e.id == id).cloned()) })
        }

        fn transition_dlq(
            &self,
            id: DlqEntryId,
            from: DlqStatus,
            to: DlqStatus,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut dlq = self.dlq.write().await;
                match dlq.iter_mut().find(|e| e.id == id && e.status == from) {
                    Some(entry) => {
                        entry.status = to;
                        Ok(true)
                    },
                    None => Ok(false),
                }
            })
        }

        fn update_dlq(&self, entry: DlqEntry, from: DlqStatus) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                take_error(&self.dlq_update_error).await?;
                let mut dlq = self.dlq.write().await;
                match dlq.iter_mut().find(|e| e.id == entry.id && e.status == from) {
                    Some(stored) => {
                        *stored = entry;
                        Ok(true)
                    },
                    None => Ok(false),
                }
            })
        }

        fn load_checkpoint<'a>(&'a self, worker_id: &'a str) -> StorageFuture<'a, Option<EventId>> {
            Box::pin(async move { Ok(self.checkpoints.read().await.get(worker_id).copied()) })
        }

        fn save_checkpoint<'a>(
            &'a self,
            worker_id: &'a str,
            last_processed_id: EventId,
            _at: DateTime<Utc>,
        ) -> StorageFuture<'a, EventId> {
            Box::pin(async move {
                take_error(&self.checkpoint_error).await?;
                let mut checkpoints = self.checkpoints.write().await;
                let stored = checkpoints.entry(worker_id.to_string()).or_insert(last_processed_id);
                *stored = (*stored).max(last_processed_id);
                Ok(*stored)
            })
        }

        fn create_scheduled(&self, delivery: ScheduledDelivery) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                take_error(&self.scheduled_error).await?;
                self.scheduled.write().await.push(delivery);
                Ok(())
            })
        }

        fn find_due(&self, now_ms: i64, limit: usize) -> StorageFuture<'_, Vec<ScheduledDelivery>> {
            Box::pin(async move {
                let mut due: Vec<_> = self
                    .scheduled
                    .read()
                    .await
                    .iter()
                    .filter(|d| d.status == ScheduleStatus::Pending && d.scheduled_for <= now_ms)
                    .cloned()
                    .collect();
                due.sort_by_key(|d| d.scheduled_for);
                due.truncate(limit);
                Ok(due)
            })
        }

        fn complete_scheduled(
            &self,
            id: ScheduledDeliveryId,
            status: ScheduleStatus,
            last_error: Option<String>,
            at: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut scheduled = self.scheduled.write().await;
                let Some(row) = scheduled
                    .iter_mut()
                    .find(|d| d.id == id && d.status == ScheduleStatus::Pending)
                else {
                    return Ok(false);
                };
                row.status = status;
                row.last_error = last_error;
                row.updated_at = at;
                Ok(true)
            })
        }

        fn reschedule_scheduled(
            &self,
            id: ScheduledDeliveryId,
            attempt: i32,
            scheduled_for: i64,
            last_error: String,
            at: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                take_error(&self.scheduled_error).await?;
                let mut scheduled = self.scheduled.write().await;
                let Some(row) = scheduled
                    .iter_mut()
                    .find(|d| d.id == id && d.status == ScheduleStatus::Pending)
                else {
                    return Ok(false);
                };
                row.attempt = attempt;
                row.scheduled_for = scheduled_for;
                row.last_error = Some(last_error);
                row.updated_at = at;
                Ok(true)
            })
        }

        fn cancel_scheduled(
            &self,
            id: ScheduledDeliveryId,
            reason: String,
            at: DateTime<Utc>,
        ) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut scheduled = self.scheduled.write().await;
                let Some(row) = scheduled
                    .iter_mut()
                    .find(|d| d.id == id && d.status == ScheduleStatus::Pending)
                else {
                    return Ok(false);
                };
                row.status = ScheduleStatus::Cancelled;
                row.cancelled_reason = Some(reason);
                row.cancelled_at = Some(at);
                row.updated_at = at;
                Ok(true)
            })
        }

        fn cancel_matching(
            &self,
            org_id: OrgId,
            rule_ids: Vec<RuleId>,
            criteria: CancellationInfo,
            reason: String,
            at: DateTime<Utc>,
        ) -> StorageFuture<'_, Vec<ScheduledDeliveryId>> {
            Box::pin(async move {
                let mut scheduled = self.scheduled.write().await;
                let mut cancelled = Vec::new();
                for row in scheduled.iter_mut().filter(|d| {
                    d.status == ScheduleStatus::Pending
                        && d.org_id == org_id
                        && rule_ids.contains(&d.rule_id)
                        && d.cancellation_info.as_ref().is_some_and(|i| i.matched_by(&criteria))
                }) {
                    row.status = ScheduleStatus::Cancelled;
                    row.cancelled_reason = Some(reason.clone());
                    row.cancelled_at = Some(at);
                    row.updated_at = at;
                    cancelled.push(row.id);
                }
                Ok(cancelled)
            })
        }

        fn health_check(&self) -> StorageFuture<'_, ()> {
            Box::pin(take_error(&self.health_error))
        }
    }
}
