//! Supervisor for the two delivery loops.
//!
//! ```text
//! ┌────────────────┐   ┌────────────────┐   ┌─────────────┐
//! │ DeliveryEngine │──▶│ PollingWorker  │──▶│ Dispatcher  │──▶ targets
//! └────────────────┘   └────────────────┘   └─────────────┘
//!         │                    │                   ▲
//!         │                    ▼                   │
//!         │            ┌────────────────┐          │
//!         └───────────▶│ Scheduler      │──────────┘
//!                      └────────────────┘
//! ```
//!
//! Both loops share one cancellation token. Shutdown cancels it and waits
//! for in-flight work up to a timeout.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{scheduler::Scheduler, worker::PollingWorker};

/// Default time allowed for in-flight work at shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Supervisor failures.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine is already running.
    #[error("delivery engine already started")]
    AlreadyStarted,

    /// A loop did not stop within the shutdown timeout.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Configured timeout
        timeout: Duration,
    },

    /// A loop panicked.
    #[error("{task} task panicked: {message}")]
    TaskPanic {
        /// Loop name
        task: &'static str,
        /// Join error
        message: String,
    },
}

/// Owns the polling worker and scheduler tasks.
pub struct DeliveryEngine {
    worker: Arc<PollingWorker>,
    scheduler: Arc<Scheduler>,
    cancel: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
    shutdown_timeout: Duration,
}

impl DeliveryEngine {
    /// Creates a stopped engine.
    pub fn new(worker: Arc<PollingWorker>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            worker,
            scheduler,
            cancel: CancellationToken::new(),
            handles: Vec::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Overrides the shutdown timeout.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Token cancelled at shutdown, for tying other tasks to the engine.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether both loops are running.
    pub fn is_running(&self) -> bool {
        !self.handles.is_empty() && self.handles.iter().all(|(_, h)| !h.is_finished())
    }

    /// Spawns both loops and returns.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyStarted`] on a second call.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if !self.handles.is_empty() {
            return Err(EngineError::AlreadyStarted);
        }

        let worker = self.worker.clone();
        let token = self.cancel.clone();
        self.handles.push(("polling_worker", tokio::spawn(async move { worker.run(token).await })));

        let scheduler = self.scheduler.clone();
        let token = self.cancel.clone();
        self.handles.push(("scheduler", tokio::spawn(async move { scheduler.run(token).await })));

        info!("delivery engine started");
        Ok(())
    }

    /// Cancels both loops and waits for them.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ShutdownTimeout`] when a loop is still busy
    /// after the timeout, or [`EngineError::TaskPanic`] for the first loop
    /// that panicked.
    pub async fn shutdown(mut self) -> Result<(), EngineError> {
        let timeout = self.shutdown_timeout;
        info!(timeout_ms = timeout.as_millis(), "shutting down delivery engine");
        self.cancel.cancel();

        let handles = std::mem::take(&mut self.handles);
        let joined = tokio::time::timeout(timeout, async {
            let mut first_panic = None;
            for (task, handle) in handles {
                if let Err(join_error) = handle.await {
                    error!(task, error = %join_error, "delivery task panicked");
                    first_panic.get_or_insert(EngineError::TaskPanic {
                        task,
                        message: join_error.to_string(),
                    });
                }
            }
            first_panic
        })
        .await;

        match joined {
            Ok(None) => {
                info!("delivery engine stopped");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_elapsed) => {
                error!(timeout_ms = timeout.as_millis(), "delivery engine shutdown timed out");
                Err(EngineError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for DeliveryEngine {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            warn!("delivery engine dropped while running; cancelling loops");
            self.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("tasks", &self.handles.len())
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}
