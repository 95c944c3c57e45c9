//! Polling worker: pulls events from the source, matches rules and hands
//! each match to the dispatcher or the scheduler.
//!
//! Events are handled one at a time in id order; the rules matched by one
//! event are delivered concurrently up to `max_concurrent_deliveries`. The
//! checkpoint only moves over events whose handling finished, so a
//! cancelled or failed batch resumes at the first event it did not finish.

use std::{sync::Arc, time::Duration};

use conduit_core::{
    models::{DeliveryMode, Event, EventId, IntegrationRule, OrgUnitId},
    Clock, CoreError,
};
use conduit_sources::{EventSource, SourceError};
use futures::{stream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    dedup::{event_key, DedupCache},
    dispatcher::{DeliveryJob, DispatchOutcome, Dispatcher},
    matcher::{match_rules, rule_cancelled_by},
    scheduler::Scheduler,
    storage::DeliveryStorage,
};

/// Polling worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Checkpoint key.
    pub worker_id: String,
    /// Events polled per tick.
    pub batch_size: usize,
    /// Pause between ticks that found no events.
    pub poll_interval: Duration,
    /// Pause after a failed tick.
    pub error_backoff: Duration,
    /// Concurrent rule deliveries per event.
    pub max_concurrent_deliveries: usize,
    /// Start a fresh checkpoint at the oldest event instead of the newest.
    pub replay_from_start: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "conduit-worker".to_string(),
            batch_size: 100,
            poll_interval: Duration::from_secs(5),
            error_backoff: Duration::from_secs(5),
            max_concurrent_deliveries: 10,
            replay_from_start: false,
        }
    }
}

/// Failure that stops a tick.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The source could not be polled.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Rules, hierarchy or checkpoint storage failed.
    #[error(transparent)]
    Storage(#[from] CoreError),
}

/// Running totals since start-up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    /// Events fully handled.
    pub events_processed: u64,
    /// Events skipped as duplicates.
    pub duplicates_skipped: u64,
    /// Events that matched no rule.
    pub unmatched_events: u64,
    /// Rule deliveries that succeeded on every target.
    pub deliveries_succeeded: u64,
    /// Rule deliveries with a failed target, plus schedules that could not
    /// be created.
    pub deliveries_failed: u64,
    /// Rule deliveries handed to the due poller for another attempt.
    pub retries_scheduled: u64,
    /// Scheduled rows created.
    pub scheduled: u64,
    /// Scheduled rows cancelled.
    pub cancelled: u64,
    /// Last checkpoint written.
    pub checkpoint: Option<i64>,
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Events returned by the source.
    pub polled: usize,
    /// Events handled before the tick ended.
    pub processed: usize,
}

#[derive(Debug, Default)]
struct EventReport {
    duplicate: bool,
    matched: usize,
    succeeded: u64,
    failed: u64,
    retrying: u64,
    scheduled: u64,
    cancelled: u64,
}

impl EventReport {
    fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Single-replica event poller.
pub struct PollingWorker {
    source: Arc<dyn EventSource>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<Scheduler>,
    dedup: Arc<DedupCache>,
    config: WorkerConfig,
    checkpoint: Mutex<Option<EventId>>,
    last_sweep: Mutex<std::time::Instant>,
    stats: RwLock<WorkerStats>,
}

impl PollingWorker {
    /// Creates a worker; the checkpoint is loaded on the first tick.
    pub fn new(
        source: Arc<dyn EventSource>,
        dispatcher: Arc<Dispatcher>,
        scheduler: Arc<Scheduler>,
        dedup: Arc<DedupCache>,
        config: WorkerConfig,
    ) -> Self {
        let started = dispatcher.clock().now();
        Self {
            source,
            dispatcher,
            scheduler,
            dedup,
            config,
            checkpoint: Mutex::new(None),
            last_sweep: Mutex::new(started),
            stats: RwLock::new(WorkerStats::default()),
        }
    }

    fn storage(&self) -> &Arc<dyn DeliveryStorage> {
        self.dispatcher.storage()
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        self.dispatcher.clock()
    }

    /// Totals since start-up.
    pub async fn stats(&self) -> WorkerStats {
        self.stats.read().await.clone()
    }

    /// Polls until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            worker_id = %self.config.worker_id,
            source = self.source.name(),
            batch_size = self.config.batch_size,
            "polling worker starting"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let pause = match self.process_batch(&cancel).await {
                Ok(report) if report.polled >= self.config.batch_size => None,
                Ok(_) => Some(self.config.poll_interval),
                Err(e) => {
                    error!(worker_id = %self.config.worker_id, error = %e, "worker tick failed");
                    Some(self.config.error_backoff)
                },
            };

            if let Some(pause) = pause {
                tokio::select! {
                    () = self.clock().sleep(pause) => {},
                    () = cancel.cancelled() => break,
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "polling worker stopped");
    }

    /// Runs one tick: poll, handle each event, advance the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns the source or storage error that ended the tick. Events
    /// handled before it are still checkpointed.
    pub async fn process_batch(&self, cancel: &CancellationToken) -> Result<BatchReport, WorkerError> {
        self.maybe_sweep().await;

        let position = self.position().await?;
        let events = self.source.poll(position, self.config.batch_size).await?;
        let mut report = BatchReport { polled: events.len(), processed: 0 };
        let mut handled_through = None;
        let mut failure = None;

        for event in &events {
            if cancel.is_cancelled() {
                debug!(event_id = %event.id, "tick cancelled before event");
                break;
            }

            let span = info_span!(
                "event",
                worker_id = %self.config.worker_id,
                event_id = %event.id,
                event_type = %event.event_type
            );
            match self.handle_event(event).instrument(span).await {
                Ok(outcome) => {
                    self.acknowledge(event, outcome.is_success()).await;
                    self.tally(&outcome).await;
                    handled_through = Some(event.id);
                    report.processed += 1;
                },
                Err(e) => {
                    failure = Some(e);
                    break;
                },
            }
        }

        if let Some(last) = handled_through {
            self.advance(last).await?;
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Current position, loading or seeding it on first use.
    async fn position(&self) -> Result<EventId, WorkerError> {
        let mut checkpoint = self.checkpoint.lock().await;
        if let Some(position) = *checkpoint {
            return Ok(position);
        }

        let worker_id = self.config.worker_id.as_str();
        let position = match self.storage().load_checkpoint(worker_id).await? {
            Some(stored) => stored,
            None => {
                let seed = if self.config.replay_from_start {
                    EventId(0)
                } else {
                    self.source.latest_position().await?
                };
                let saved =
                    self.storage().save_checkpoint(worker_id, seed, self.clock().now_utc()).await?;
                info!(worker_id, checkpoint = %saved, "seeded fresh checkpoint");
                saved
            },
        };

        *checkpoint = Some(position);
        Ok(position)
    }

    async fn advance(&self, last: EventId) -> Result<(), WorkerError> {
        let stored = self
            .storage()
            .save_checkpoint(&self.config.worker_id, last, self.clock().now_utc())
            .await?;
        *self.checkpoint.lock().await = Some(stored);
        self.stats.write().await.checkpoint = Some(stored.0);
        debug!(checkpoint = %stored, "checkpoint advanced");
        Ok(())
    }

    async fn handle_event(&self, event: &Event) -> Result<EventReport, WorkerError> {
        let key = event_key(event);
        if self.dedup.seen(&key).await {
            debug!("duplicate event skipped");
            return Ok(EventReport { duplicate: true, ..EventReport::default() });
        }

        let ancestors = match event.org_unit_id {
            Some(unit) => self.storage().ancestors(event.org_id, unit).await?,
            None => Vec::new(),
        };
        let mut report = EventReport::default();

        report.cancelled = self.cancel_schedules(event, &ancestors).await?;

        let candidates =
            self.storage().find_active_rules(event.org_id, &event.event_type).await?;
        let matched = match_rules(&candidates, event, &ancestors);
        report.matched = matched.len();
        if matched.is_empty() {
            debug!("no rule matched");
        }

        let (immediate, deferred): (Vec<&IntegrationRule>, Vec<&IntegrationRule>) =
            matched.into_iter().partition(|r| r.delivery_mode == DeliveryMode::Immediate);

        for rule in deferred {
            match self.scheduler.schedule(rule, event).await {
                Some(_) => report.scheduled += 1,
                None => report.failed += 1,
            }
        }

        let jobs: Vec<DeliveryJob> =
            immediate.into_iter().map(|rule| DeliveryJob::for_event(rule, event)).collect();
        let outcomes: Vec<DispatchOutcome> = stream::iter(jobs)
            .map(|job| async move { self.dispatcher.dispatch(&job).await })
            .buffer_unordered(self.config.max_concurrent_deliveries.max(1))
            .collect()
            .await;
        for outcome in outcomes {
            if outcome.is_success() {
                report.succeeded += 1;
            } else if outcome.first_error().is_some() {
                report.failed += 1;
            } else {
                report.retrying += 1;
            }
        }

        self.dedup.mark(key).await;
        Ok(report)
    }

    async fn cancel_schedules(
        &self,
        event: &Event,
        ancestors: &[OrgUnitId],
    ) -> Result<u64, CoreError> {
        let cancelling =
            self.storage().find_cancelling_rules(event.org_id, &event.event_type).await?;
        let rule_ids: Vec<_> = cancelling
            .iter()
            .filter(|rule| rule_cancelled_by(rule, event, ancestors))
            .map(|rule| rule.id)
            .collect();

        let cancelled = self.scheduler.cancel_for_event(event, rule_ids).await?;
        Ok(cancelled.len() as u64)
    }

    async fn acknowledge(&self, event: &Event, success: bool) {
        let result = if success { self.source.ack(event).await } else { self.source.nack(event).await };
        if let Err(e) = result {
            warn!(event_id = %event.id, error = %e, "source acknowledgement failed");
        }
    }

    async fn tally(&self, outcome: &EventReport) {
        let mut stats = self.stats.write().await;
        stats.events_processed += 1;
        if outcome.duplicate {
            stats.duplicates_skipped += 1;
            return;
        }
        if outcome.matched == 0 {
            stats.unmatched_events += 1;
        }
        stats.deliveries_succeeded += outcome.succeeded;
        stats.deliveries_failed += outcome.failed;
        stats.retries_scheduled += outcome.retrying;
        stats.scheduled += outcome.scheduled;
        stats.cancelled += outcome.cancelled;
    }

    async fn maybe_sweep(&self) {
        let now = self.clock().now();
        let mut last = self.last_sweep.lock().await;
        if now.saturating_duration_since(*last) < self.dedup.sweep_interval() {
            return;
        }
        *last = now;
        let removed = self.dedup.sweep().await;
        if removed > 0 {
            debug!(removed, "dedup cache swept");
        }
    }
}

impl std::fmt::Debug for PollingWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingWorker")
            .field("source", &self.source.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
