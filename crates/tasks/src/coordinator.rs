//! Task coordinator
//!
//! Wires the registry, the queue and the timeout sweep together and owns
//! their lifecycle. Hosts talk to this type.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::TaskConfig;
use crate::error::TaskError;
use crate::queue::{Cancellation, Enqueued, OwnerStatus, QueueStats, TaskQueue};
use crate::registry::TaskRegistry;
use crate::runner::Job;
use crate::sink::ProgressSink;
use crate::task::{OwnerId, TaskStatus};

/// Errors from coordinator lifecycle operations
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("coordinator already running")]
    AlreadyRunning,

    #[error("shutdown timeout: {remaining} tasks still active")]
    ShutdownTimeout { remaining: usize },

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Entry point for hosts
pub struct TaskCoordinator {
    config: Arc<TaskConfig>,
    registry: Arc<TaskRegistry>,
    queue: Arc<TaskQueue>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
    /// Set once shutdown begins; `submit` is refused from then on
    closed: AtomicBool,
}

impl TaskCoordinator {
    /// Validate `config` and build the registry and queue
    pub fn new(config: TaskConfig, sink: Arc<dyn ProgressSink>) -> Result<Self, CoordinatorError> {
        config.validate()?;

        let config = Arc::new(config);
        let registry = Arc::new(TaskRegistry::new(sink, config.task_timeout));
        let queue = TaskQueue::new(Arc::clone(&registry), Arc::clone(&config));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            registry,
            queue,
            shutdown_tx,
            shutdown_rx,
            sweep_handle: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Start the timeout sweep
    pub fn start(&self) -> Result<(), CoordinatorError> {
        let mut handle = self.sweep_handle.lock();
        if handle.is_some() {
            return Err(CoordinatorError::AlreadyRunning);
        }

        info!(
            max_concurrency = self.config.max_concurrency,
            max_queue_size = self.config.max_queue_size,
            task_timeout_secs = self.config.task_timeout.as_secs(),
            "Starting task coordinator"
        );

        *handle = Some(self.start_sweep_loop());
        Ok(())
    }

    /// Stop the sweep, cancel every task and wait for them to drain
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        info!("Initiating graceful shutdown");

        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
        let sweep = self.sweep_handle.lock().take();
        if let Some(sweep) = sweep {
            if let Err(e) = sweep.await {
                warn!("Sweep loop ended abnormally: {}", e);
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            // Drop waiters first so finishing tasks promote nobody
            for snapshot in self.registry.active_tasks() {
                if snapshot.status == TaskStatus::Pending {
                    if let Cancellation::Dequeued(task_id) = self.queue.cancel(snapshot.owner) {
                        debug!(%task_id, "Dropped waiting task on shutdown");
                    }
                }
            }
            let flagged = self.registry.cancel_all();
            debug!(flagged, "Cancellation requested for active tasks");

            let remaining = self.registry.len();
            if remaining == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining, "Shutdown timeout reached");
                return Err(CoordinatorError::ShutdownTimeout { remaining });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!("Task coordinator stopped");
        Ok(())
    }

    /// Submit a job for `owner`; see [`TaskQueue::enqueue`]
    ///
    /// Fails with `ShuttingDown` once [`shutdown`](Self::shutdown) was called.
    pub fn submit(&self, owner: OwnerId, job: Box<dyn Job>) -> Result<Enqueued, TaskError> {
        if self.is_closed() {
            return Err(TaskError::ShuttingDown);
        }
        self.queue.enqueue(owner, job)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn cancel(&self, owner: OwnerId) -> Cancellation {
        self.queue.cancel(owner)
    }

    pub fn status(&self, owner: OwnerId) -> OwnerStatus {
        self.queue.status(owner)
    }

    pub fn position(&self, owner: OwnerId) -> Option<usize> {
        self.queue.position(owner)
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    fn start_sweep_loop(&self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let interval = self.config.sweep_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let timed_out = registry.sweep_timeouts();
                        if !timed_out.is_empty() {
                            info!(count = timed_out.len(), "Timed out inactive tasks");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Sweep loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Sweep loop exited");
        })
    }
}
