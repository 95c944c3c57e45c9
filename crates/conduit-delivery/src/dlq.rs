//! Operator actions on dead-letter entries.
//!
//! A replay moves the entry `pending -> retrying`, re-runs the failed action
//! through the rule's current configuration with a fresh retry budget, then
//! lands in `resolved` or back in `pending`. If the final write fails the
//! entry is put back to `pending`. Abandon is terminal and also clears
//! entries left in `retrying`.

use std::sync::Arc;

use conduit_core::{
    models::{DlqEntry, DlqEntryId, DlqStatus},
    Clock, CoreError,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::{
    dispatcher::{DeliveryJob, Dispatcher},
    storage::DeliveryStorage,
};

/// Why an operator action was refused.
#[derive(Debug, Error)]
pub enum DlqError {
    /// No entry with this id.
    #[error("dead-letter entry {0} not found")]
    NotFound(DlqEntryId),

    /// The entry is not `pending`.
    #[error("dead-letter entry {id} is {status}")]
    InvalidState {
        /// Entry id
        id: DlqEntryId,
        /// Current status
        status: DlqStatus,
    },

    /// The entry's rule no longer exists.
    #[error("rule of dead-letter entry {0} no longer exists")]
    RuleMissing(DlqEntryId),

    /// The entry's rule is deactivated.
    #[error("rule of dead-letter entry {0} is inactive")]
    RuleInactive(DlqEntryId),

    /// The rule no longer has the failed action.
    #[error("rule of dead-letter entry {id} has no action {index}")]
    ActionMissing {
        /// Entry id
        id: DlqEntryId,
        /// Stored action index
        index: i32,
    },

    /// Persistence failed.
    #[error(transparent)]
    Storage(#[from] CoreError),
}

impl DlqError {
    /// Stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "DLQ_NOT_FOUND",
            Self::InvalidState { status: DlqStatus::Retrying, .. } => "DLQ_IN_FLIGHT",
            Self::InvalidState { status: DlqStatus::Abandoned, .. } => "DLQ_ABANDONED",
            Self::InvalidState { status: DlqStatus::Resolved, .. } => "DLQ_RESOLVED",
            Self::InvalidState { .. } => "DLQ_INVALID_STATE",
            Self::RuleMissing(_) => "DLQ_RULE_MISSING",
            Self::RuleInactive(_) => "DLQ_RULE_INACTIVE",
            Self::ActionMissing { .. } => "DLQ_ACTION_MISSING",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }
}

/// Outcome of one replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResult {
    /// Entry id.
    pub id: DlqEntryId,
    /// Status after the replay: `resolved` or `pending`.
    pub status: DlqStatus,
    /// Replays performed so far, including this one.
    pub retry_count: i32,
    /// Error code of the failed replay.
    pub error_code: Option<String>,
}

/// Replays and abandons dead-letter entries.
#[derive(Debug)]
pub struct DlqManager {
    dispatcher: Arc<Dispatcher>,
}

impl DlqManager {
    /// Creates a manager replaying through `dispatcher`.
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    fn storage(&self) -> &Arc<dyn DeliveryStorage> {
        self.dispatcher.storage()
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        self.dispatcher.clock()
    }

    /// Replays one entry.
    ///
    /// # Errors
    ///
    /// Refuses entries that are missing or not `pending`, and entries whose
    /// rule is gone or inactive or lacks the action. A replay that fails
    /// delivery is not an error; it returns the entry back in `pending`.
    #[instrument(skip(self), fields(dlq_id = %id))]
    pub async fn retry(&self, id: DlqEntryId) -> Result<ReplayResult, DlqError> {
        let entry = self.pending_entry(id).await?;

        let rule =
            self.storage().find_rule(entry.rule_id).await?.ok_or(DlqError::RuleMissing(id))?;
        if !rule.is_active {
            return Err(DlqError::RuleInactive(id));
        }
        if !rule.targets().iter().any(|t| i32::try_from(t.index).ok() == Some(entry.action_index)) {
            return Err(DlqError::ActionMissing { id, index: entry.action_index });
        }

        if !self.storage().transition_dlq(id, DlqStatus::Pending, DlqStatus::Retrying).await? {
            return Err(self.refusal(id).await);
        }

        let job = DeliveryJob::for_replay(&rule, &entry, self.clock().now_utc());
        let outcome = self.dispatcher.dispatch(&job).await;

        let mut updated = DlqEntry {
            retry_count: entry.retry_count.saturating_add(1),
            ..entry
        };
        let error_code = match outcome.first_error() {
            None => {
                updated.status = DlqStatus::Resolved;
                info!(retry_count = updated.retry_count, "dead-letter entry resolved");
                None
            },
            Some(error) => {
                updated.status = DlqStatus::Pending;
                updated.error_category = error.category().as_str().to_string();
                updated.error_code = error.code().to_string();
                updated.error_message = error.to_string();
                updated.failed_at = self.clock().now_utc();
                warn!(code = error.code(), "dead-letter replay failed");
                Some(error.code().to_string())
            },
        };

        let result = ReplayResult {
            id,
            status: updated.status,
            retry_count: updated.retry_count,
            error_code,
        };
        match self.storage().update_dlq(updated, DlqStatus::Retrying).await {
            Ok(true) => Ok(result),
            Ok(false) => Err(self.refusal(id).await),
            Err(e) => {
                warn!(error = %e, "failed to store replay result, releasing entry");
                if let Err(rollback) =
                    self.storage().transition_dlq(id, DlqStatus::Retrying, DlqStatus::Pending).await
                {
                    warn!(error = %rollback, "dead-letter entry left retrying");
                }
                Err(e.into())
            },
        }
    }

    /// Replays each entry in turn. One refusal does not stop the rest.
    pub async fn retry_bulk(
        &self,
        ids: &[DlqEntryId],
    ) -> Vec<(DlqEntryId, Result<ReplayResult, DlqError>)> {
        let mut results = Vec::with_capacity(ids.len());
        for &id in ids {
            results.push((id, self.retry(id).await));
        }
        results
    }

    /// Gives up on a `pending` or `retrying` entry.
    ///
    /// # Errors
    ///
    /// Refuses entries that are missing or already terminal.
    #[instrument(skip(self, reason), fields(dlq_id = %id))]
    pub async fn abandon(&self, id: DlqEntryId, reason: Option<String>) -> Result<(), DlqError> {
        let entry = self.storage().find_dlq(id).await?.ok_or(DlqError::NotFound(id))?;
        if entry.status.is_terminal() {
            return Err(DlqError::InvalidState { id, status: entry.status });
        }

        let from = entry.status;
        if !self.storage().transition_dlq(id, from, DlqStatus::Abandoned).await? {
            return Err(self.refusal(id).await);
        }

        if let Some(reason) = reason.filter(|r| !r.trim().is_empty()) {
            let updated = DlqEntry {
                status: DlqStatus::Abandoned,
                error_message: format!("{} (abandoned: {reason})", entry.error_message),
                ..entry
            };
            self.storage().update_dlq(updated, DlqStatus::Abandoned).await?;
        }

        info!(%from, "dead-letter entry abandoned");
        Ok(())
    }

    async fn pending_entry(&self, id: DlqEntryId) -> Result<DlqEntry, DlqError> {
        let entry = self.storage().find_dlq(id).await?.ok_or(DlqError::NotFound(id))?;
        if entry.status != DlqStatus::Pending {
            return Err(DlqError::InvalidState { id, status: entry.status });
        }
        Ok(entry)
    }

    /// Error for a lost `pending` transition race.
    async fn refusal(&self, id: DlqEntryId) -> DlqError {
        match self.storage().find_dlq(id).await {
            Ok(Some(entry)) => DlqError::InvalidState { id, status: entry.status },
            Ok(None) => DlqError::NotFound(id),
            Err(e) => DlqError::Storage(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use conduit_core::{
        models::{EventId, IntegrationRule},
        TestClock, UrlPolicy,
    };
    use conduit_testing::{MockTarget, RuleBuilder};
    use serde_json::json;

    use super::*;
    use crate::{
        client::DeliveryClient,
        dispatcher::DispatchConfig,
        retry::BackoffConfig,
        storage::mock::MockDeliveryStorage,
    };

    fn manager(storage: Arc<MockDeliveryStorage>) -> DlqManager {
        let config = DispatchConfig {
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
                jitter_factor: 0.0,
            },
            url_policy: UrlPolicy::permissive(),
            ..DispatchConfig::default()
        };
        let dispatcher = Dispatcher::new(
            storage,
            DeliveryClient::with_defaults().unwrap(),
            Arc::new(TestClock::new()),
            config,
        );
        DlqManager::new(Arc::new(dispatcher))
    }

    fn entry_for(rule: &IntegrationRule) -> DlqEntry {
        DlqEntry {
            id: DlqEntryId::new(),
            org_id: rule.org_id,
            rule_id: rule.id,
            event_id: Some(EventId(7)),
            org_unit_id: None,
            event_type: "APPOINTMENT_CREATED".into(),
            action_index: 0,
            action_name: None,
            status: DlqStatus::Pending,
            error_category: "server".into(),
            error_code: "DELIVERY_SERVER_ERROR".into(),
            error_message: "server error: HTTP 503".into(),
            payload: json!({"patientId": "p-9"}),
            retry_count: 0,
            created_at: Utc::now(),
            failed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn successful_replay_resolves_entry() {
        let target = MockTarget::start().await;
        target.always("/hook", 200).await;
        let storage = Arc::new(MockDeliveryStorage::new());
        let rule = RuleBuilder::new("APPOINTMENT_CREATED").target(target.url("/hook")).build();
        let entry = entry_for(&rule);
        storage.add_rule(rule).await;
        storage.add_dlq(entry.clone()).await;

        let result = manager(storage.clone()).retry(entry.id).await.unwrap();

        assert_eq!(result.status, DlqStatus::Resolved);
        assert_eq!(result.retry_count, 1);
        assert_eq!(target.received_json().await, vec![json!({"patientId": "p-9"})]);
        assert_eq!(storage.dlq_entries().await[0].status, DlqStatus::Resolved);
    }

    #[tokio::test]
    async fn failed_replay_returns_to_pending_without_new_entry() {
        let target = MockTarget::start().await;
        target.always("/hook", 404).await;
        let storage = Arc::new(MockDeliveryStorage::new());
        let rule = RuleBuilder::new("APPOINTMENT_CREATED").target(target.url("/hook")).build();
        let entry = entry_for(&rule);
        storage.add_rule(rule).await;
        storage.add_dlq(entry.clone()).await;

        let result = manager(storage.clone()).retry(entry.id).await.unwrap();

        assert_eq!(result.status, DlqStatus::Pending);
        assert_eq!(result.error_code.as_deref(), Some("DELIVERY_CLIENT_ERROR"));
        let entries = storage.dlq_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].error_category, "client");
        assert_eq!(entries[0].retry_count, 1);
    }

    #[tokio::test]
    async fn terminal_and_missing_entries_are_refused() {
        let storage = Arc::new(MockDeliveryStorage::new());
        let rule = RuleBuilder::new("APPOINTMENT_CREATED").build();
        let resolved = DlqEntry { status: DlqStatus::Resolved, ..entry_for(&rule) };
        storage.add_rule(rule).await;
        storage.add_dlq(resolved.clone()).await;
        let manager = manager(storage);

        let err = manager.retry(resolved.id).await.unwrap_err();
        assert_eq!(err.code(), "DLQ_RESOLVED");

        let err = manager.abandon(DlqEntryId::new(), None).await.unwrap_err();
        assert_eq!(err.code(), "DLQ_NOT_FOUND");
    }

    #[tokio::test]
    async fn replay_without_rule_is_refused_and_entry_stays_pending() {
        let storage = Arc::new(MockDeliveryStorage::new());
        let rule = RuleBuilder::new("APPOINTMENT_CREATED").build();
        let entry = entry_for(&rule);
        storage.add_dlq(entry.clone()).await;

        let err = manager(storage.clone()).retry(entry.id).await.unwrap_err();

        assert_eq!(err.code(), "DLQ_RULE_MISSING");
        assert_eq!(storage.dlq_entries().await[0].status, DlqStatus::Pending);
    }

    #[tokio::test]
    async fn abandon_is_terminal_and_keeps_reason() {
        let storage = Arc::new(MockDeliveryStorage::new());
        let rule = RuleBuilder::new("APPOINTMENT_CREATED").build();
        let entry = entry_for(&rule);
        storage.add_rule(rule).await;
        storage.add_dlq(entry.clone()).await;
        let manager = manager(storage.clone());

        manager.abandon(entry.id, Some("target retired".into())).await.unwrap();

        let stored = &storage.dlq_entries().await[0];
        assert_eq!(stored.status, DlqStatus::Abandoned);
        assert!(stored.error_message.ends_with("(abandoned: target retired)"));
        assert_eq!(manager.retry(entry.id).await.unwrap_err().code(), "DLQ_ABANDONED");
    }

    #[tokio::test]
    async fn failed_result_write_releases_the_entry() {
        let target = MockTarget::start().await;
        target.always("/hook", 200).await;
        let storage = Arc::new(MockDeliveryStorage::new());
        let rule = RuleBuilder::new("APPOINTMENT_CREATED").target(target.url("/hook")).build();
        let entry = entry_for(&rule);
        storage.add_rule(rule).await;
        storage.add_dlq(entry.clone()).await;
        storage.inject_dlq_update_error("connection reset").await;
        let manager = manager(storage.clone());

        let err = manager.retry(entry.id).await.unwrap_err();

        assert_eq!(err.code(), "STORAGE_ERROR");
        assert_eq!(storage.dlq_entries().await[0].status, DlqStatus::Pending);
        let result = manager.retry(entry.id).await.unwrap();
        assert_eq!(result.status, DlqStatus::Resolved);
        assert_eq!(target.request_count().await, 2);
    }

    #[tokio::test]
    async fn entry_left_retrying_can_be_abandoned() {
        let storage = Arc::new(MockDeliveryStorage::new());
        let rule = RuleBuilder::new("APPOINTMENT_CREATED").build();
        let stuck = DlqEntry { status: DlqStatus::Retrying, ..entry_for(&rule) };
        storage.add_rule(rule).await;
        storage.add_dlq(stuck.clone()).await;
        let manager = manager(storage.clone());

        assert_eq!(manager.retry(stuck.id).await.unwrap_err().code(), "DLQ_IN_FLIGHT");
        manager.abandon(stuck.id, None).await.unwrap();

        assert_eq!(storage.dlq_entries().await[0].status, DlqStatus::Abandoned);
        assert_eq!(manager.abandon(stuck.id, None).await.unwrap_err().code(), "DLQ_ABANDONED");
    }

    #[tokio::test]
    async fn replay_through_an_inactive_rule_is_refused() {
        let target = MockTarget::start().await;
        target.always("/hook", 200).await;
        let storage = Arc::new(MockDeliveryStorage::new());
        let rule =
            RuleBuilder::new("APPOINTMENT_CREATED").target(target.url("/hook")).inactive().build();
        let entry = entry_for(&rule);
        storage.add_rule(rule).await;
        storage.add_dlq(entry.clone()).await;

        let err = manager(storage.clone()).retry(entry.id).await.unwrap_err();

        assert_eq!(err.code(), "DLQ_RULE_INACTIVE");
        assert_eq!(target.request_count().await, 0);
        assert_eq!(storage.dlq_entries().await[0].status, DlqStatus::Pending);
    }

    #[tokio::test]
    async fn bulk_retry_reports_each_entry() {
        let target = MockTarget::start().await;
        target.always("/hook", 200).await;
        let storage = Arc::new(MockDeliveryStorage::new());
        let rule = RuleBuilder::new("APPOINTMENT_CREATED").target(target.url("/hook")).build();
        let first = entry_for(&rule);
        storage.add_rule(rule).await;
        storage.add_dlq(first.clone()).await;
        let unknown = DlqEntryId::new();

        let results = manager(storage).retry_bulk(&[first.id, unknown]).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].1.as_ref().unwrap().status, DlqStatus::Resolved);
        assert_eq!(results[1].1.as_ref().unwrap_err().code(), "DLQ_NOT_FOUND");
    }
}
