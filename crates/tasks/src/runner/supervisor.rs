//! Job supervision
//!
//! The job body runs in its own tokio task so that a panic surfaces as a
//! `JoinError` instead of unwinding through the supervisor. The supervisor
//! is the task's runner: it is what the registry aborts on timeout, and
//! aborting it also aborts the job body.

use std::sync::Arc;

use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use super::{Job, JobOutput, TaskContext};
use crate::config::TaskConfig;
use crate::error::{JobError, Result};
use crate::registry::{Outcome, Slot, TaskRegistry};
use crate::task::{RunnerHandle, TaskId, TaskStatus};

/// Spawns and supervises jobs
pub struct JobRunner;

impl JobRunner {
    /// Start `job` for an admitted task
    ///
    /// Advances Pending → Running, spawns the supervisor and binds it as the
    /// task's runner. Must be called from within a tokio runtime.
    pub fn spawn(
        registry: Arc<TaskRegistry>,
        task_id: TaskId,
        job: Box<dyn Job>,
        config: Arc<TaskConfig>,
    ) -> Result<JoinHandle<()>> {
        let slot = registry.slot(task_id)?;

        let status = slot.lock().status;
        if status == TaskStatus::Pending {
            registry.transition(&slot, TaskStatus::Running, Outcome::default())?;
        }

        let ctx = TaskContext::new(Arc::clone(&registry), Arc::clone(&slot), config);
        let handle = tokio::spawn(supervise(Arc::clone(&registry), Arc::clone(&slot), job, ctx));

        if let Err(e) = TaskRegistry::bind_slot(&slot, RunnerHandle::new(handle.abort_handle())) {
            // Finished (or bound) in between; nobody will ever abort this one
            handle.abort();
            return Err(e);
        }

        debug!(%task_id, "Runner started");
        Ok(handle)
    }
}

/// Aborts the job body when the supervisor is dropped or aborted
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn supervise(registry: Arc<TaskRegistry>, slot: Slot, job: Box<dyn Job>, ctx: TaskContext) {
    let task_id = ctx.task_id();
    let kind = job.kind();

    let body = tokio::spawn(job.run(ctx));
    let _guard = AbortOnDrop(body.abort_handle());

    let (status, outcome) = match body.await {
        Ok(Ok(JobOutput {
            detail,
            poll,
            posted,
        })) => (TaskStatus::Completed, Outcome { detail, poll, posted }),
        Ok(Err(JobError::Cancelled)) => {
            info!(%task_id, %kind, "Job stopped on cancellation");
            (TaskStatus::Cancelled, Outcome::default())
        }
        Ok(Err(JobError::Task(e))) if e.is_benign() => {
            debug!(%task_id, "Job stopped, task already finished: {}", e);
            return;
        }
        Ok(Err(e)) => {
            warn!(%task_id, %kind, error = %e, "Job failed");
            (e.terminal_status(), Outcome::detail(e.user_summary()))
        }
        Err(join_err) => {
            let err = if join_err.is_panic() {
                JobError::internal("job panicked")
            } else {
                JobError::internal("job aborted")
            };
            error!(%task_id, %kind, "Job did not return: {}", join_err);
            (TaskStatus::Failed, Outcome::detail(err.user_summary()))
        }
    };

    finish(&registry, &slot, task_id, status, outcome);
}

/// Exactly one terminal transition, whatever happened to the job
fn finish(registry: &TaskRegistry, slot: &Slot, task_id: TaskId, status: TaskStatus, outcome: Outcome) {
    match registry.transition(slot, status, outcome) {
        Ok(_) => {}
        Err(e) if e.is_benign() => {
            debug!(%task_id, "Task finished elsewhere first: {}", e);
        }
        Err(e) => {
            error!(%task_id, error = %e, "Could not finish task, forcing failure");
            let summary = JobError::Task(e).user_summary();
            if let Err(e) = registry.transition(slot, TaskStatus::Failed, Outcome::detail(summary)) {
                debug!(%task_id, "Forced failure not applied: {}", e);
            }
        }
    }
}
