//! Delayed and recurring deliveries.
//!
//! The polling worker hands non-immediate rule matches to
//! [`Scheduler::schedule`], which runs the rule's scheduling script and
//! persists a `PENDING` row. [`Scheduler::run`] polls for due rows and feeds
//! each through the dispatcher. Retryable delivery failures come back here
//! too, as `PENDING` rows carrying their next attempt number. Cancellation
//! events move matching pending rows to `CANCELLED`.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use conduit_core::{
    models::{
        DeliveryAttemptLog, DeliveryLogId, DeliveryStatus, Event, IntegrationRule, RuleId,
        ScheduleStatus, ScheduledDelivery, ScheduledDeliveryId,
    },
    Clock, CoreError,
};
use conduit_transform::{
    calculate_next_occurrence, execute_scheduling_script, extract_cancellation_info,
    SchedulingError, TransformContext,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    dispatcher::{DeliveryJob, Dispatcher},
    storage::DeliveryStorage,
};

/// Due-poller settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pause between due-row polls.
    pub poll_interval: Duration,
    /// Rows fetched per poll.
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(10), batch_size: 50 }
    }
}

/// Counts from one due-poller tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DueReport {
    /// Rows delivered.
    pub sent: usize,
    /// Rows whose delivery failed.
    pub failed: usize,
    /// Rows pushed back for another attempt.
    pub retrying: usize,
    /// Rows cancelled because their rule is gone or inactive.
    pub cancelled: usize,
    /// Follow-up occurrences persisted.
    pub next_occurrences: usize,
}

/// Why a schedule could not be created.
#[derive(Debug)]
enum ScheduleFailure {
    Missing,
    Script(SchedulingError),
    Persist(CoreError),
}

impl ScheduleFailure {
    fn code(&self) -> &'static str {
        match self {
            Self::Missing => "SCHEDULING_MISSING_SCRIPT",
            Self::Script(SchedulingError::Script(_)) => "SCHEDULING_SCRIPT_FAILED",
            Self::Script(e) => e.code(),
            Self::Persist(_) => "SCHEDULING_PERSIST_FAILED",
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Missing => "rule has no scheduling script".to_string(),
            Self::Script(SchedulingError::Script(e)) => format!("{}: {e}", e.code()),
            Self::Script(e) => e.to_string(),
            Self::Persist(e) => e.to_string(),
        }
    }
}

/// Creates, cancels and delivers scheduled rows.
#[derive(Debug)]
pub struct Scheduler {
    dispatcher: Arc<Dispatcher>,
    config: SchedulerConfig,
}

impl Scheduler {
    /// Creates a scheduler delivering through `dispatcher`.
    pub fn new(dispatcher: Arc<Dispatcher>, config: SchedulerConfig) -> Self {
        Self { dispatcher, config }
    }

    fn storage(&self) -> &Arc<dyn DeliveryStorage> {
        self.dispatcher.storage()
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        self.dispatcher.clock()
    }

    /// Runs `rule`'s scheduling script for `event` and persists the first
    /// row.
    ///
    /// A failure is written as a `FAILED` delivery log and yields `None`.
    pub async fn schedule(
        &self,
        rule: &IntegrationRule,
        event: &Event,
    ) -> Option<ScheduledDeliveryId> {
        match self.try_schedule(rule, event).await {
            Ok(row) => {
                info!(
                    rule_id = %rule.id,
                    event_id = %event.id,
                    scheduled_id = %row.id,
                    scheduled_for = row.scheduled_for,
                    mode = %rule.delivery_mode,
                    "delivery scheduled"
                );
                Some(row.id)
            },
            Err(failure) => {
                warn!(
                    rule_id = %rule.id,
                    event_id = %event.id,
                    code = failure.code(),
                    "scheduling failed"
                );
                self.record_failure(rule, event, &failure).await;
                None
            },
        }
    }

    async fn try_schedule(
        &self,
        rule: &IntegrationRule,
        event: &Event,
    ) -> Result<ScheduledDelivery, ScheduleFailure> {
        let config = rule.scheduling_config.as_ref().ok_or(ScheduleFailure::Missing)?;
        let context = TransformContext::for_event(event, rule);

        let outcome = execute_scheduling_script(
            self.dispatcher.sandbox(),
            &config.script,
            rule.delivery_mode,
            &event.payload,
            &context,
        )
        .await
        .map_err(ScheduleFailure::Script)?;

        let now = self.clock().now_utc();
        let row = ScheduledDelivery {
            id: ScheduledDeliveryId::new(),
            rule_id: rule.id,
            org_id: event.org_id,
            org_unit_id: event.org_unit_id,
            original_event_id: event.id,
            event_type: event.event_type.clone(),
            scheduled_for: outcome.first_due_ms(),
            payload: event.payload.clone(),
            status: ScheduleStatus::Pending,
            cancellation_info: extract_cancellation_info(&event.payload),
            recurring_config: outcome.recurring(),
            action_index: None,
            attempt: 1,
            last_error: None,
            cancelled_reason: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        };

        self.storage().create_scheduled(row.clone()).await.map_err(ScheduleFailure::Persist)?;
        Ok(row)
    }

    async fn record_failure(&self, rule: &IntegrationRule, event: &Event, failure: &ScheduleFailure) {
        let log = DeliveryAttemptLog {
            id: DeliveryLogId::new(),
            rule_id: rule.id,
            event_id: Some(event.id),
            scheduled_delivery_id: None,
            org_id: rule.org_id,
            action_name: None,
            status: DeliveryStatus::Failed,
            response_status: None,
            response_time_ms: 0,
            attempt_count: 0,
            request_payload: None,
            response_body: None,
            error_code: Some(failure.code().to_string()),
            error_message: Some(failure.message()),
            created_at: self.clock().now_utc(),
        };
        if let Err(e) = self.storage().record_log(log).await {
            warn!(error = %e, "failed to record scheduling failure");
        }
    }

    /// Cancels the pending rows of `rule_ids` that `event` identifies.
    ///
    /// Returns the cancelled row ids; empty when the event carries no
    /// patient id.
    ///
    /// # Errors
    ///
    /// Returns the storage error.
    pub async fn cancel_for_event(
        &self,
        event: &Event,
        rule_ids: Vec<RuleId>,
    ) -> Result<Vec<ScheduledDeliveryId>, CoreError> {
        if rule_ids.is_empty() {
            return Ok(Vec::new());
        }
        let Some(criteria) = extract_cancellation_info(&event.payload) else {
            debug!(event_id = %event.id, "cancellation event has no patient id");
            return Ok(Vec::new());
        };

        let reason = format!("cancelled by {} event {}", event.event_type, event.id);
        let cancelled = self
            .storage()
            .cancel_matching(event.org_id, rule_ids, criteria, reason, self.clock().now_utc())
            .await?;

        if !cancelled.is_empty() {
            info!(event_id = %event.id, count = cancelled.len(), "scheduled deliveries cancelled");
        }
        Ok(cancelled)
    }

    /// Delivers every row due now, up to the batch size.
    ///
    /// # Errors
    ///
    /// Returns the storage error that stopped the tick. Rows handled before
    /// it keep their new status.
    pub async fn process_due(&self) -> Result<DueReport, CoreError> {
        let now_ms = self.clock().now_millis();
        let due = self.storage().find_due(now_ms, self.config.batch_size).await?;
        let mut report = DueReport::default();

        for row in due {
            self.process_row(row, &mut report).await?;
        }

        if report != DueReport::default() {
            debug!(?report, "due deliveries processed");
        }
        Ok(report)
    }

    async fn process_row(&self, row: ScheduledDelivery, report: &mut DueReport) -> Result<(), CoreError> {
        let now = self.clock().now_utc();

        let rule = match self.storage().find_rule(row.rule_id).await? {
            Some(rule) if rule.is_active => rule,
            found => {
                let reason = if found.is_some() { "rule is inactive" } else { "rule no longer exists" };
                if self.storage().cancel_scheduled(row.id, reason.to_string(), now).await? {
                    info!(scheduled_id = %row.id, reason, "scheduled delivery cancelled");
                    report.cancelled += 1;
                }
                return Ok(());
            },
        };

        let job = DeliveryJob::for_scheduled(&rule, &row, now);
        let outcome = self.dispatcher.dispatch(&job).await;
        if outcome.rescheduled {
            report.retrying += 1;
            return Ok(());
        }

        let (status, last_error) = match outcome.first_error() {
            None => (ScheduleStatus::Sent, None),
            Some(e) => (ScheduleStatus::Failed, Some(format!("{}: {e}", e.code()))),
        };

        let finished_at = self.clock().now_utc();
        if !self.storage().complete_scheduled(row.id, status, last_error, finished_at).await? {
            debug!(scheduled_id = %row.id, "row left pending state during delivery");
            return Ok(());
        }
        match status {
            ScheduleStatus::Sent => report.sent += 1,
            _ => report.failed += 1,
        }

        if let Some(next) = next_occurrence(&row, finished_at) {
            debug!(
                scheduled_id = %next.id,
                scheduled_for = next.scheduled_for,
                "next occurrence scheduled"
            );
            self.storage().create_scheduled(next).await?;
            report.next_occurrences += 1;
        }
        Ok(())
    }

    /// Polls for due rows until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(poll_interval_ms = self.config.poll_interval.as_millis(), "scheduler starting");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if let Err(e) = self.process_due().await {
                error!(error = %e, "scheduler tick failed");
            }

            tokio::select! {
                () = self.clock().sleep(self.config.poll_interval) => {},
                () = cancel.cancelled() => break,
            }
        }

        info!("scheduler stopped");
    }
}

/// Follow-up row for a recurring series, if the series continues.
fn next_occurrence(row: &ScheduledDelivery, at: DateTime<Utc>) -> Option<ScheduledDelivery> {
    let config = row.recurring_config?;
    let n = config.occurrence_number + 1;
    let scheduled_for = calculate_next_occurrence(&config, n)?;

    let mut recurring = config;
    recurring.occurrence_number = n;

    Some(ScheduledDelivery {
        id: ScheduledDeliveryId::new(),
        scheduled_for,
        status: ScheduleStatus::Pending,
        recurring_config: Some(recurring),
        action_index: None,
        attempt: 1,
        last_error: None,
        cancelled_reason: None,
        cancelled_at: None,
        created_at: at,
        updated_at: at,
        ..row.clone()
    })
}
