// Task context for running jobs
//
// Each running task gets one context. It is the job's only handle on its
// record: progress reports, activity, cancellation and the AwaitingInput
// round trip all go through here.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::config::TaskConfig;
use crate::error::{JobError, TaskError};
use crate::registry::{Outcome, Slot, TaskRegistry};
use crate::sink::{ProgressThrottle, ProgressUpdate};
use crate::task::{OwnerId, Progress, TaskId, TaskStatus};

/// Context provided to a job while it runs
#[derive(Clone)]
pub struct TaskContext {
    task_id: TaskId,
    owner: OwnerId,
    registry: Arc<TaskRegistry>,
    slot: Slot,
    cancel_signal: Arc<Notify>,
    config: Arc<TaskConfig>,
    throttle: ProgressThrottle,
}

impl TaskContext {
    pub(crate) fn new(registry: Arc<TaskRegistry>, slot: Slot, config: Arc<TaskConfig>) -> Self {
        let (task_id, owner, cancel_signal) = {
            let record = slot.lock();
            (record.task_id, record.owner, Arc::clone(&record.cancel_signal))
        };

        Self {
            task_id,
            owner,
            registry,
            slot,
            cancel_signal,
            throttle: ProgressThrottle::new(config.progress_every),
            config,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    /// Report progress, then check for cancellation
    ///
    /// Emits a `Progress` update at the configured granularity. Returns
    /// `Err(Cancelled)` if cancellation was requested, and an
    /// `AlreadyTerminal` error if the task was finished from outside (e.g.
    /// timed out), so the job stops either way.
    pub fn checkpoint(&self, current: u32, total: u32) -> Result<(), JobError> {
        let progress = self.report(current, total)?;

        if self.throttle.should_emit(progress.current, progress.total) {
            self.registry.emit_on(
                &self.slot,
                ProgressUpdate::Progress {
                    current: progress.current,
                    total: progress.total,
                },
            );
        }

        if self.is_cancel_requested() {
            return Err(JobError::Cancelled);
        }
        Ok(())
    }

    /// Record progress without emitting an update
    pub fn report(&self, current: u32, total: u32) -> Result<Progress, JobError> {
        TaskRegistry::record_progress(&self.slot, current, total).ok_or_else(|| self.finished())
    }

    /// Emit a custom update; `false` once the task is terminal
    pub fn emit(&self, update: ProgressUpdate) -> bool {
        self.registry.emit_on(&self.slot, update)
    }

    /// Record user interaction
    pub fn touch(&self) -> bool {
        TaskRegistry::touch_slot(&self.slot)
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.slot.lock().cancel_requested
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        loop {
            let notified = self.cancel_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_cancel_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `duration`, cut short by cancellation
    ///
    /// For pacing and retry delays between checkpoints. Sleeping is not
    /// activity.
    pub async fn pause(&self, duration: Duration) -> Result<(), JobError> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(JobError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Wait for user input in AwaitingInput
    ///
    /// Moves the task Running → AwaitingInput, awaits `input` unless
    /// cancellation arrives first, then moves back to Running. The wait is
    /// not activity: a user who never answers is timed out by the sweep.
    pub async fn await_input<F>(&self, input: F) -> Result<F::Output, JobError>
    where
        F: Future,
    {
        self.registry
            .transition(&self.slot, TaskStatus::AwaitingInput, Outcome::default())?;

        let value = tokio::select! {
            biased;
            _ = self.cancelled() => return Err(JobError::Cancelled),
            value = input => value,
        };

        self.registry
            .transition(&self.slot, TaskStatus::Running, Outcome::default())?;
        Ok(value)
    }

    fn finished(&self) -> JobError {
        let status = self.slot.lock().status;
        JobError::Task(TaskError::AlreadyTerminal {
            task_id: self.task_id,
            status,
        })
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}
