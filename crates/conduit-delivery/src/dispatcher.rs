//! Per-rule delivery pipeline.
//!
//! For every target of a rule the dispatcher runs, in order: lookups,
//! transform, auth headers, URL validation, circuit check, then the HTTP
//! attempt. Each outbound attempt is logged and counted by the breaker. A
//! retryable failure of a polled or scheduled delivery is persisted as a
//! `PENDING` scheduled row due after the backoff delay, so the due poller
//! makes the next attempt; DLQ replays retry inline instead. A terminal
//! failure at any stage is logged `FAILED` or `ABANDONED` and, unless the
//! job is a DLQ replay, written to the dead-letter queue.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use conduit_core::{
    models::{
        ActionExecution, CancellationInfo, DeliveryAttemptLog, DeliveryLogId, DeliveryStatus,
        DeliveryTarget, DlqEntry, DlqEntryId, DlqStatus, Event, EventId, IntegrationRule,
        OrgUnitId, ScheduleStatus, ScheduledDelivery, ScheduledDeliveryId,
    },
    validate_target_url, Clock, UrlPolicy,
};
use conduit_transform::{
    extract_cancellation_info, prepare_payload, CodeLookup, SandboxConfig, ScriptSandbox,
    StaticCodeLookup, TransformContext,
};
use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    auth::{build_auth_headers, DEFAULT_TOKEN_TIMEOUT},
    circuit::{CircuitBreakerManager, CircuitConfig},
    client::{DeliveryClient, DeliveryRequest, DeliveryResponse},
    error::DispatchError,
    retry::{BackoffConfig, RetryDecision, RetryPolicy},
    storage::DeliveryStorage,
};

/// Settings shared by every dispatch.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Backoff bounds for retries.
    pub backoff: BackoffConfig,
    /// Timeout for OAuth2 and custom token requests.
    pub token_timeout: Duration,
    /// Breaker thresholds.
    pub circuit: CircuitConfig,
    /// Target URL policy.
    pub url_policy: UrlPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            token_timeout: DEFAULT_TOKEN_TIMEOUT,
            circuit: CircuitConfig::default(),
            url_policy: UrlPolicy::default(),
        }
    }
}

/// Where the attempt after a retryable failure happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Persist a `PENDING` scheduled row due after the backoff delay.
    Deferred,
    /// Sleep on the clock and retry within the same dispatch.
    Inline,
}

/// One rule to deliver, with everything the logs and DLQ need to know about
/// where it came from.
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    /// Rule to deliver through.
    pub rule: IntegrationRule,
    /// Original payload, before lookups and transform.
    pub payload: Value,
    /// Script context.
    pub context: TransformContext,
    /// Triggering event.
    pub event_id: Option<EventId>,
    /// Scheduled row being delivered.
    pub scheduled_delivery_id: Option<ScheduledDeliveryId>,
    /// Unit of the triggering event.
    pub org_unit_id: Option<OrgUnitId>,
    /// Type of the triggering event.
    pub event_type: String,
    /// Restricts delivery to one action index.
    pub only_action: Option<usize>,
    /// Whether terminal failures create dead-letter entries.
    pub dead_letter: bool,
    /// Cancellation keys carried over to retry rows.
    pub cancellation_info: Option<CancellationInfo>,
    /// 1-based number of the first outbound attempt.
    pub first_attempt: u32,
    /// How retryable failures are retried.
    pub retry_mode: RetryMode,
}

impl DeliveryJob {
    /// Job for a polled event.
    pub fn for_event(rule: &IntegrationRule, event: &Event) -> Self {
        Self {
            rule: rule.clone(),
            payload: event.payload.clone(),
            context: TransformContext::for_event(event, rule),
            event_id: Some(event.id),
            scheduled_delivery_id: None,
            org_unit_id: event.org_unit_id,
            event_type: event.event_type.clone(),
            only_action: None,
            dead_letter: true,
            cancellation_info: extract_cancellation_info(&event.payload),
            first_attempt: 1,
            retry_mode: RetryMode::Deferred,
        }
    }

    /// Job for a due scheduled row, resuming at the row's attempt number.
    pub fn for_scheduled(rule: &IntegrationRule, row: &ScheduledDelivery, at: DateTime<Utc>) -> Self {
        let mut context =
            TransformContext::detached(&row.event_type, rule, row.org_unit_id.map(|u| u.0), at);
        context.event_id = Some(row.original_event_id.0);
        Self {
            rule: rule.clone(),
            payload: row.payload.clone(),
            context,
            event_id: Some(row.original_event_id),
            scheduled_delivery_id: Some(row.id),
            org_unit_id: row.org_unit_id,
            event_type: row.event_type.clone(),
            only_action: row.action_index.and_then(|i| usize::try_from(i).ok()),
            dead_letter: true,
            cancellation_info: row.cancellation_info.clone(),
            first_attempt: u32::try_from(row.attempt).unwrap_or(1).max(1),
            retry_mode: RetryMode::Deferred,
        }
    }

    /// Job replaying the failed action of a dead-letter entry through the
    /// rule's current configuration.
    pub fn for_replay(rule: &IntegrationRule, entry: &DlqEntry, at: DateTime<Utc>) -> Self {
        let mut context =
            TransformContext::detached(&entry.event_type, rule, entry.org_unit_id.map(|u| u.0), at);
        context.event_id = entry.event_id.map(|e| e.0);
        Self {
            rule: rule.clone(),
            payload: entry.payload.clone(),
            context,
            event_id: entry.event_id,
            scheduled_delivery_id: None,
            org_unit_id: entry.org_unit_id,
            event_type: entry.event_type.clone(),
            only_action: usize::try_from(entry.action_index).ok(),
            dead_letter: false,
            cancellation_info: None,
            first_attempt: 1,
            retry_mode: RetryMode::Inline,
        }
    }
}

/// Result of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOutcome {
    /// Action index.
    pub index: usize,
    /// Action name.
    pub action_name: Option<String>,
    /// Outbound attempts made by this dispatch.
    pub attempts: u32,
    /// Final status code on success, or the last error.
    pub result: Result<u16, DispatchError>,
    /// Due time, epoch ms, of the persisted next attempt.
    pub retry_scheduled_for: Option<i64>,
}

impl TargetOutcome {
    /// Whether the target failed and will not be attempted again.
    pub fn is_terminal_failure(&self) -> bool {
        self.result.is_err() && self.retry_scheduled_for.is_none()
    }
}

/// Result of a whole job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// One entry per delivered target, in action order.
    pub targets: Vec<TargetOutcome>,
    /// The job's own scheduled row was pushed back for another attempt.
    pub rescheduled: bool,
}

impl DispatchOutcome {
    /// Whether every target was delivered.
    pub fn is_success(&self) -> bool {
        self.targets.iter().all(|t| t.result.is_ok())
    }

    /// Targets whose next attempt was persisted.
    pub fn retries_pending(&self) -> usize {
        self.targets.iter().filter(|t| t.retry_scheduled_for.is_some()).count()
    }

    /// First error that will not be retried, if any.
    pub fn first_error(&self) -> Option<&DispatchError> {
        self.targets.iter().filter(|t| t.is_terminal_failure()).find_map(|t| t.result.as_ref().err())
    }
}

/// What follows a failed attempt.
enum NextStep {
    Sleep(Duration),
    Deferred(i64),
    Stop { dead_letter: bool },
}

/// Result of persisting a retry.
enum Deferral {
    Scheduled(i64),
    /// The row being delivered left `PENDING` meanwhile.
    Dropped,
    Failed,
}

/// Everything a log row needs besides the job and target.
struct Attempt<'a> {
    status: DeliveryStatus,
    attempt: u32,
    payload: Option<&'a Value>,
    response: Option<&'a DeliveryResponse>,
    error: Option<&'a DispatchError>,
    elapsed: Duration,
}

/// Runs delivery jobs.
pub struct Dispatcher {
    storage: Arc<dyn DeliveryStorage>,
    client: DeliveryClient,
    circuits: Arc<CircuitBreakerManager>,
    sandbox: Arc<ScriptSandbox>,
    lookup: Arc<dyn CodeLookup>,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Creates a dispatcher with its own breaker registry, a sandbox on
    /// `clock` and an empty code table.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        client: DeliveryClient,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
    ) -> Self {
        let circuits = Arc::new(CircuitBreakerManager::new(config.circuit.clone(), clock.clone()));
        let sandbox = Arc::new(ScriptSandbox::with_clock(SandboxConfig::default(), clock.clone()));
        Self {
            storage,
            client,
            circuits,
            sandbox,
            lookup: Arc::new(StaticCodeLookup::new()),
            clock,
            config,
        }
    }

    /// Uses `sandbox` for transform scripts.
    #[must_use]
    pub fn with_sandbox(mut self, sandbox: Arc<ScriptSandbox>) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Uses `lookup` for code mappings.
    #[must_use]
    pub fn with_code_lookup(mut self, lookup: Arc<dyn CodeLookup>) -> Self {
        self.lookup = lookup;
        self
    }

    /// Shares an existing breaker registry.
    #[must_use]
    pub fn with_circuits(mut self, circuits: Arc<CircuitBreakerManager>) -> Self {
        self.circuits = circuits;
        self
    }

    /// Breaker registry, for observation and operator resets.
    pub fn circuits(&self) -> &Arc<CircuitBreakerManager> {
        &self.circuits
    }

    /// Sandbox used for transform scripts.
    pub fn sandbox(&self) -> &Arc<ScriptSandbox> {
        &self.sandbox
    }

    /// Storage the dispatcher writes to.
    pub fn storage(&self) -> &Arc<dyn DeliveryStorage> {
        &self.storage
    }

    /// Clock the dispatcher sleeps on.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Delivers every target of `job`.
    ///
    /// Failures are recorded, never returned; inspect the outcome instead.
    pub async fn dispatch(&self, job: &DeliveryJob) -> DispatchOutcome {
        let targets: Vec<DeliveryTarget> = job
            .rule
            .targets()
            .into_iter()
            .filter(|t| job.only_action.map_or(true, |only| only == t.index))
            .collect();

        let span = info_span!(
            "event_delivery",
            rule_id = %job.rule.id,
            event_id = ?job.event_id.map(|e| e.0),
            targets = targets.len()
        );

        // A single-target scheduled job retries by moving its own row.
        let own_row = job.scheduled_delivery_id.filter(|_| targets.len() == 1);

        async move {
            let outcomes = match job.rule.action_execution {
                ActionExecution::Parallel => {
                    join_all(targets.iter().map(|t| self.deliver_target(job, t, own_row))).await
                },
                ActionExecution::Sequential => {
                    let mut outcomes = Vec::with_capacity(targets.len());
                    for target in &targets {
                        outcomes.push(self.deliver_target(job, target, own_row).await);
                    }
                    outcomes
                },
            };
            let rescheduled =
                own_row.is_some() && outcomes.iter().any(|t| t.retry_scheduled_for.is_some());
            DispatchOutcome { targets: outcomes, rescheduled }
        }
        .instrument(span)
        .await
    }

    async fn deliver_target(
        &self,
        job: &DeliveryJob,
        target: &DeliveryTarget,
        own_row: Option<ScheduledDeliveryId>,
    ) -> TargetOutcome {
        let (attempts, result, retry_scheduled_for) = self.run_target(job, target, own_row).await;
        TargetOutcome {
            index: target.index,
            action_name: target.action_name.clone(),
            attempts,
            result,
            retry_scheduled_for,
        }
    }

    async fn run_target(
        &self,
        job: &DeliveryJob,
        target: &DeliveryTarget,
        own_row: Option<ScheduledDeliveryId>,
    ) -> (u32, Result<u16, DispatchError>, Option<i64>) {
        let rule = &job.rule;

        let prepared = match self.prepare(job, target).await {
            Ok(prepared) => prepared,
            Err((payload, error)) => {
                self.fail_without_attempt(job, target, payload.as_ref(), &error).await;
                return (0, Err(error), None);
            },
        };
        let (payload, headers, url) = prepared;

        let policy = RetryPolicy::for_rule(rule, self.config.backoff);
        let timeout = Duration::from_millis(rule.timeout_ms);
        let mut attempt = job.first_attempt.max(1);
        let mut made = 0_u32;

        loop {
            if !self.circuits.should_allow_request(rule.id).await {
                let error = DispatchError::CircuitOpen { rule_id: rule.id };
                self.fail_without_attempt(job, target, Some(&payload), &error).await;
                return (made, Err(error), None);
            }

            let request = DeliveryRequest {
                url: url.clone(),
                method: target.http_method,
                headers: headers.clone(),
                body: payload.clone(),
                timeout,
                attempt,
            };

            let started = self.clock.now();
            let result = match self.client.deliver(request).await {
                Ok(response) => response.classify(self.clock.now_utc()),
                Err(e) => Err(e),
            };
            let elapsed = self.clock.now().saturating_duration_since(started);
            made += 1;

            let delivery_error = match result {
                Ok(response) => {
                    self.record(job, target, Attempt {
                        status: DeliveryStatus::Success,
                        attempt,
                        payload: Some(&payload),
                        response: Some(&response),
                        error: None,
                        elapsed,
                    })
                    .await;
                    self.circuits.record_success(rule.id).await;
                    debug!(attempt, status = response.status_code, "delivered");
                    return (made, Ok(response.status_code), None);
                },
                Err(e) => e,
            };

            self.circuits.record_failure(rule.id).await;
            let decision = policy.decide(attempt, &delivery_error);
            let error = DispatchError::Delivery(delivery_error);

            let (status, next) = match decision {
                RetryDecision::Retry { delay } => match job.retry_mode {
                    RetryMode::Inline => (DeliveryStatus::Retrying, NextStep::Sleep(delay)),
                    RetryMode::Deferred => {
                        match self.defer_retry(job, target, own_row, attempt + 1, delay, &error).await {
                            Deferral::Scheduled(due) => {
                                (DeliveryStatus::Retrying, NextStep::Deferred(due))
                            },
                            Deferral::Dropped => {
                                (DeliveryStatus::Failed, NextStep::Stop { dead_letter: false })
                            },
                            Deferral::Failed => {
                                (DeliveryStatus::Abandoned, NextStep::Stop { dead_letter: true })
                            },
                        }
                    },
                },
                RetryDecision::Fail => (DeliveryStatus::Failed, NextStep::Stop { dead_letter: true }),
                RetryDecision::Exhausted => {
                    (DeliveryStatus::Abandoned, NextStep::Stop { dead_letter: true })
                },
            };

            self.record(job, target, Attempt {
                status,
                attempt,
                payload: Some(&payload),
                response: None,
                error: Some(&error),
                elapsed,
            })
            .await;

            match next {
                NextStep::Sleep(delay) => {
                    debug!(attempt, delay_ms = delay.as_millis(), error = %error, "retrying");
                    self.clock.sleep(delay).await;
                    attempt += 1;
                },
                NextStep::Deferred(due) => {
                    info!(attempt, next_attempt_at = due, code = error.code(), "retry scheduled");
                    return (made, Err(error), Some(due));
                },
                NextStep::Stop { dead_letter } => {
                    warn!(attempt, code = error.code(), error = %error, "delivery failed");
                    if dead_letter {
                        self.dead_letter(job, target, &error).await;
                    }
                    return (made, Err(error), None);
                },
            }
        }
    }

    /// Persists the next attempt of `target`, due after `delay`.
    ///
    /// A single-target scheduled job moves its own row; anything else gets
    /// a new `PENDING` row scoped to the target's action.
    async fn defer_retry(
        &self,
        job: &DeliveryJob,
        target: &DeliveryTarget,
        own_row: Option<ScheduledDeliveryId>,
        next_attempt: u32,
        delay: Duration,
        error: &DispatchError,
    ) -> Deferral {
        let now = self.clock.now_utc();
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let due = self.clock.now_millis().saturating_add(delay_ms);
        let attempt = i32::try_from(next_attempt).unwrap_or(i32::MAX);
        let last_error = format!("{}: {error}", error.code());

        let persisted = match (own_row, job.event_id) {
            (Some(id), _) => {
                self.storage.reschedule_scheduled(id, attempt, due, last_error, now).await
            },
            (None, Some(event_id)) => {
                let row = ScheduledDelivery {
                    id: ScheduledDeliveryId::new(),
                    rule_id: job.rule.id,
                    org_id: job.rule.org_id,
                    org_unit_id: job.org_unit_id,
                    original_event_id: event_id,
                    event_type: job.event_type.clone(),
                    scheduled_for: due,
                    payload: job.payload.clone(),
                    status: ScheduleStatus::Pending,
                    cancellation_info: job.cancellation_info.clone(),
                    recurring_config: None,
                    action_index: Some(i32::try_from(target.index).unwrap_or(i32::MAX)),
                    attempt,
                    last_error: Some(last_error),
                    cancelled_reason: None,
                    cancelled_at: None,
                    created_at: now,
                    updated_at: now,
                };
                self.storage.create_scheduled(row).await.map(|()| true)
            },
            (None, None) => {
                warn!("delivery without an event cannot be retried later");
                return Deferral::Failed;
            },
        };

        match persisted {
            Ok(true) => Deferral::Scheduled(due),
            Ok(false) => {
                debug!("scheduled row left pending state, retry dropped");
                Deferral::Dropped
            },
            Err(e) => {
                warn!(error = %e, "failed to persist retry");
                Deferral::Failed
            },
        }
    }

    /// Lookups, transform, auth and URL validation.
    ///
    /// On failure returns the transformed payload if the failing stage came
    /// after the transform.
    async fn prepare(
        &self,
        job: &DeliveryJob,
        target: &DeliveryTarget,
    ) -> Result<(Value, crate::auth::AuthHeaders, String), (Option<Value>, DispatchError)> {
        let payload = prepare_payload(
            &job.payload,
            &target.lookups,
            &target.transform,
            self.lookup.as_ref(),
            &self.sandbox,
            &job.context,
        )
        .await
        .map_err(|e| (None, DispatchError::from_transform(e)))?;

        let headers =
            match build_auth_headers(&target.auth, self.client.http(), self.config.token_timeout)
                .await
            {
                Ok(headers) => headers,
                Err(e) => return Err((Some(payload), e.into())),
            };

        let url = match validate_target_url(&target.target_url, &self.config.url_policy) {
            Ok(url) => url.to_string(),
            Err(e) => return Err((Some(payload), e.into())),
        };

        Ok((payload, headers, url))
    }

    async fn fail_without_attempt(
        &self,
        job: &DeliveryJob,
        target: &DeliveryTarget,
        payload: Option<&Value>,
        error: &DispatchError,
    ) {
        warn!(code = error.code(), error = %error, "delivery aborted before sending");
        self.record(job, target, Attempt {
            status: DeliveryStatus::Failed,
            attempt: 0,
            payload,
            response: None,
            error: Some(error),
            elapsed: Duration::ZERO,
        })
        .await;
        self.dead_letter(job, target, error).await;
    }

    async fn record(&self, job: &DeliveryJob, target: &DeliveryTarget, attempt: Attempt<'_>) {
        let (response_status, response_body) = match (attempt.response, attempt.error) {
            (Some(r), _) => (Some(i32::from(r.status_code)), Some(r.body.clone())),
            (None, Some(DispatchError::Delivery(e))) => {
                (e.status_code().map(i32::from), e.body().map(str::to_string))
            },
            _ => (None, None),
        };

        let log = DeliveryAttemptLog {
            id: DeliveryLogId::new(),
            rule_id: job.rule.id,
            event_id: job.event_id,
            scheduled_delivery_id: job.scheduled_delivery_id,
            org_id: job.rule.org_id,
            action_name: target.action_name.clone(),
            status: attempt.status,
            response_status,
            response_time_ms: i64::try_from(attempt.elapsed.as_millis()).unwrap_or(i64::MAX),
            attempt_count: i32::try_from(attempt.attempt).unwrap_or(i32::MAX),
            request_payload: attempt.payload.cloned(),
            response_body,
            error_code: attempt.error.map(|e| e.code().to_string()),
            error_message: attempt.error.map(ToString::to_string),
            created_at: self.clock.now_utc(),
        };

        if let Err(e) = self.storage.record_log(log).await {
            warn!(error = %e, status = %attempt.status, "failed to record delivery log");
        }
    }

    async fn dead_letter(&self, job: &DeliveryJob, target: &DeliveryTarget, error: &DispatchError) {
        if !job.dead_letter {
            return;
        }

        let now = self.clock.now_utc();
        let entry = DlqEntry {
            id: DlqEntryId::new(),
            org_id: job.rule.org_id,
            rule_id: job.rule.id,
            event_id: job.event_id,
            org_unit_id: job.org_unit_id,
            event_type: job.event_type.clone(),
            action_index: i32::try_from(target.index).unwrap_or(i32::MAX),
            action_name: target.action_name.clone(),
            status: DlqStatus::Pending,
            error_category: error.category().as_str().to_string(),
            error_code: error.code().to_string(),
            error_message: error.to_string(),
            payload: job.payload.clone(),
            retry_count: 0,
            created_at: now,
            failed_at: now,
        };

        if let Err(e) = self.storage.create_dlq(entry).await {
            warn!(error = %e, "failed to write dead-letter entry");
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").field("config", &self.config).finish_non_exhaustive()
    }
}
