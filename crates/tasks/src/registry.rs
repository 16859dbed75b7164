//! Task registry
//!
//! The single source of truth mapping an owner to at most one active task.
//! Every status change, progress report and timeout goes through here.
//!
//! # Locking
//!
//! ```text
//!   owners: DashMap<OwnerId, TaskId>      (shard lock)
//!      │
//!      ▼
//!   records: DashMap<TaskId, Slot>        (shard lock, released before ↓)
//!      │
//!      ▼
//!   Slot = Arc<Mutex<TaskRecord>>         (per-record lock)
//! ```
//!
//! Locks are only ever taken in that order. A terminal transition sets the
//! status and emits the final message under the record lock, then releases
//! it before touching the maps and notifying observers. The sweep and the
//! runner therefore race on one per-record lock: whoever reaches a terminal
//! status first wins and the loser gets [`TaskError::AlreadyTerminal`].
//!
//! Liveness ("is a task ongoing for this user?") is always read from the
//! record's own status; there is no separate flag to get out of sync.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, TaskError};
use crate::poll::PollSummary;
use crate::runner::PostSummary;
use crate::sink::{FinalSummary, ProgressSink, ProgressUpdate};
use crate::task::{
    OwnerId, Progress, RunnerHandle, TaskId, TaskRecord, TaskSnapshot, TaskSpec, TaskStatus,
};

pub(crate) type Slot = Arc<Mutex<TaskRecord>>;

/// Notified once for every task that reaches a terminal status
///
/// Called after all registry locks are released. Implementations must not
/// block.
pub trait TerminalObserver: Send + Sync {
    fn on_task_terminal(&self, snapshot: &TaskSnapshot);
}

/// Extra data attached to a terminal transition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    /// User-facing detail (failure reason, job summary)
    pub detail: Option<String>,
    pub poll: Option<PollSummary>,
    pub posted: Option<PostSummary>,
}

impl Outcome {
    pub fn detail(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::default()
        }
    }
}

/// Registry of active tasks
pub struct TaskRegistry {
    records: DashMap<TaskId, Slot>,
    owners: DashMap<OwnerId, TaskId>,
    /// Recently finished tasks, so late callers get `AlreadyTerminal`
    finished: DashMap<TaskId, (TaskStatus, Instant)>,
    sink: Arc<dyn ProgressSink>,
    timeout: Duration,
    observers: RwLock<Vec<Weak<dyn TerminalObserver>>>,
}

impl TaskRegistry {
    /// Create a registry with the given inactivity timeout
    pub fn new(sink: Arc<dyn ProgressSink>, timeout: Duration) -> Self {
        Self {
            records: DashMap::new(),
            owners: DashMap::new(),
            finished: DashMap::new(),
            sink,
            timeout,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Register an observer for terminal transitions
    pub fn observe(&self, observer: Weak<dyn TerminalObserver>) {
        self.observers.write().push(observer);
    }

    /// Inactivity timeout enforced by [`sweep_timeouts`](Self::sweep_timeouts)
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of active (non-terminal) tasks
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Create a Pending record for `owner`
    ///
    /// Fails with `AlreadyActive` if the owner already has a non-terminal
    /// task. The check and the insert happen under the owner's shard lock,
    /// so concurrent admits for one owner admit exactly one.
    pub fn admit(&self, owner: OwnerId, spec: TaskSpec) -> Result<TaskSnapshot> {
        let record = TaskRecord::new(owner, spec);
        let snapshot = record.snapshot();
        let task_id = snapshot.task_id;

        match self.owners.entry(owner) {
            Entry::Occupied(mut entry) => {
                let existing = *entry.get();
                if self.is_live(existing) {
                    debug!(%owner, existing = %existing, "Admission rejected, owner already active");
                    return Err(TaskError::AlreadyActive { owner });
                }
                // Previous task is terminal and its cleanup has not run yet
                self.records.insert(task_id, Arc::new(Mutex::new(record)));
                entry.insert(task_id);
            }
            Entry::Vacant(entry) => {
                self.records.insert(task_id, Arc::new(Mutex::new(record)));
                entry.insert(task_id);
            }
        }

        info!(%task_id, %owner, kind = %snapshot.kind, "Task admitted");
        Ok(snapshot)
    }

    /// Associate the runner executing `task_id`
    pub fn bind_runner(&self, task_id: TaskId, runner: RunnerHandle) -> Result<()> {
        let slot = self.slot(task_id)?;
        Self::bind_slot(&slot, runner)
    }

    pub(crate) fn bind_slot(slot: &Slot, runner: RunnerHandle) -> Result<()> {
        let mut record = slot.lock();
        let task_id = record.task_id;

        if record.status.is_terminal() {
            return Err(TaskError::AlreadyTerminal {
                task_id,
                status: record.status,
            });
        }
        if record.runner.is_some() {
            return Err(TaskError::AlreadyBound(task_id));
        }

        record.runner = Some(runner);
        debug!(%task_id, "Runner bound");
        Ok(())
    }

    // ========================================================================
    // Progress and activity
    // ========================================================================

    /// Record progress and refresh the activity clock
    ///
    /// Returns `false` (and logs) when the task is already terminal or
    /// gone; a straggling update racing a cancellation is not an error.
    /// `current` never decreases and is clamped to a known `total`.
    pub fn report_progress(&self, task_id: TaskId, current: u32, total: u32) -> bool {
        match self.slot(task_id) {
            Ok(slot) => Self::record_progress(&slot, current, total).is_some(),
            Err(_) => {
                debug!(%task_id, current, total, "Progress for inactive task ignored");
                false
            }
        }
    }

    /// Emit an intermediate update unless the task is already terminal
    pub fn emit_progress(&self, task_id: TaskId, update: ProgressUpdate) -> bool {
        match self.slot(task_id) {
            Ok(slot) => self.emit_on(&slot, update),
            Err(_) => false,
        }
    }

    /// Record user interaction without progress
    pub fn touch(&self, task_id: TaskId) -> bool {
        match self.slot(task_id) {
            Ok(slot) => Self::touch_slot(&slot),
            Err(_) => false,
        }
    }

    /// Returns the progress as stored, or `None` if the task is terminal
    pub(crate) fn record_progress(slot: &Slot, current: u32, total: u32) -> Option<Progress> {
        let mut record = slot.lock();
        if record.status.is_terminal() {
            debug!(task_id = %record.task_id, current, total, "Straggling progress ignored");
            return None;
        }

        let total = if total > 0 { total } else { record.progress.total };
        let current = if total > 0 { current.min(total) } else { current };

        record.progress = Progress::new(current.max(record.progress.current), total);
        record.touch();
        Some(record.progress)
    }

    pub(crate) fn emit_on(&self, slot: &Slot, update: ProgressUpdate) -> bool {
        let record = slot.lock();
        if record.status.is_terminal() {
            return false;
        }
        self.sink.emit(record.task_id, update);
        true
    }

    pub(crate) fn touch_slot(slot: &Slot) -> bool {
        let mut record = slot.lock();
        if record.status.is_terminal() {
            return false;
        }
        record.touch();
        true
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Move a task along the state machine
    pub fn advance(&self, task_id: TaskId, to: TaskStatus) -> Result<TaskSnapshot> {
        self.advance_with(task_id, to, Outcome::default())
    }

    /// Move a task along the state machine, attaching an outcome if terminal
    pub fn advance_with(
        &self,
        task_id: TaskId,
        to: TaskStatus,
        outcome: Outcome,
    ) -> Result<TaskSnapshot> {
        let slot = self.slot(task_id)?;
        self.transition(&slot, to, outcome)
    }

    /// Force a task to Failed from any non-terminal status
    pub fn fail(&self, task_id: TaskId, summary: impl Into<String>) -> Result<TaskSnapshot> {
        self.advance_with(task_id, TaskStatus::Failed, Outcome::detail(summary))
    }

    pub(crate) fn transition(
        &self,
        slot: &Slot,
        to: TaskStatus,
        outcome: Outcome,
    ) -> Result<TaskSnapshot> {
        self.transition_if(slot, to, outcome, |_| true)?
            .ok_or_else(|| TaskError::NotFound(slot.lock().task_id))
    }

    /// Check-and-set under the record lock
    ///
    /// `precondition` runs under the same lock as the status write; returns
    /// `Ok(None)` when it declines.
    fn transition_if(
        &self,
        slot: &Slot,
        to: TaskStatus,
        outcome: Outcome,
        precondition: impl FnOnce(&TaskRecord) -> bool,
    ) -> Result<Option<TaskSnapshot>> {
        let (snapshot, runner) = {
            let mut record = slot.lock();
            let task_id = record.task_id;
            let from = record.status;

            if from.is_terminal() {
                return Err(TaskError::AlreadyTerminal {
                    task_id,
                    status: from,
                });
            }
            if !from.can_transition_to(to) {
                return Err(TaskError::InvalidTransition { task_id, from, to });
            }
            if !precondition(&record) {
                return Ok(None);
            }

            record.status = to;

            if !to.is_terminal() {
                record.touch();
                match (from, to) {
                    (TaskStatus::Pending, TaskStatus::Running) => {
                        self.sink.emit(task_id, ProgressUpdate::Started)
                    }
                    (_, TaskStatus::AwaitingInput) => {
                        self.sink.emit(task_id, ProgressUpdate::AwaitingInput)
                    }
                    _ => {}
                }
                debug!(%task_id, %from, %to, "Task advanced");
                return Ok(Some(record.snapshot()));
            }

            let snapshot = record.snapshot();
            self.sink.emit_final(
                task_id,
                FinalSummary {
                    owner: record.owner,
                    status: to,
                    progress: record.progress,
                    detail: outcome.detail,
                    poll: outcome.poll,
                    posted: outcome.posted,
                },
            );
            (snapshot, record.runner.take())
        };

        self.release(&snapshot);

        if let Some(runner) = runner {
            if snapshot.status == TaskStatus::TimedOut {
                runner.abort();
            }
        }

        match snapshot.status {
            TaskStatus::Completed => {
                info!(task_id = %snapshot.task_id, owner = %snapshot.owner, progress = %snapshot.progress, "Task completed")
            }
            TaskStatus::TimedOut => {
                warn!(task_id = %snapshot.task_id, owner = %snapshot.owner, progress = %snapshot.progress, "Task timed out")
            }
            status => {
                info!(task_id = %snapshot.task_id, owner = %snapshot.owner, %status, progress = %snapshot.progress, "Task finished")
            }
        }

        self.notify_terminal(&snapshot);
        Ok(Some(snapshot))
    }

    /// Drop a terminal task from the active maps, freeing the owner slot
    fn release(&self, snapshot: &TaskSnapshot) {
        let task_id = snapshot.task_id;
        self.finished
            .insert(task_id, (snapshot.status, Instant::now()));
        self.owners
            .remove_if(&snapshot.owner, |_, active| *active == task_id);
        self.records.remove(&task_id);
    }

    fn notify_terminal(&self, snapshot: &TaskSnapshot) {
        let observers: Vec<Arc<dyn TerminalObserver>> = self
            .observers
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        for observer in observers {
            observer.on_task_terminal(snapshot);
        }
    }

    // ========================================================================
    // Cancellation and timeouts
    // ========================================================================

    /// Request cooperative cancellation of the owner's active task
    ///
    /// Idempotent. Returns the task's snapshot, or `None` if the owner has
    /// nothing active.
    pub fn cancel(&self, owner: OwnerId) -> Option<TaskSnapshot> {
        let slot = self.owner_slot(owner)?;
        let mut record = slot.lock();
        if record.status.is_terminal() {
            return None;
        }

        if record.request_cancel() {
            info!(task_id = %record.task_id, %owner, "Cancellation requested");
        }
        Some(record.snapshot())
    }

    /// Request cancellation of every active task; returns how many
    pub fn cancel_all(&self) -> usize {
        let slots: Vec<Slot> = self.records.iter().map(|e| Arc::clone(e.value())).collect();
        slots
            .iter()
            .filter(|slot| {
                let mut record = slot.lock();
                if record.status.is_terminal() {
                    return false;
                }
                record.request_cancel();
                true
            })
            .count()
    }

    /// Force every task idle for longer than the timeout to TimedOut
    ///
    /// Runner liveness is irrelevant: a hung runner is timed out the same
    /// as a dead one. The age check and the status write happen under one
    /// record lock, so a task that completes concurrently is skipped.
    /// Pending tasks are waiting for capacity, not for their runner, and
    /// are exempt.
    pub fn sweep_timeouts(&self) -> Vec<TaskSnapshot> {
        let now = Instant::now();
        let timeout = self.timeout;
        let slots: Vec<Slot> = self.records.iter().map(|e| Arc::clone(e.value())).collect();
        let mut timed_out = Vec::new();

        for slot in slots {
            let outcome = Outcome::detail(format!("no activity for {}s", timeout.as_secs()));
            let result = self.transition_if(&slot, TaskStatus::TimedOut, outcome, |record| {
                record.status != TaskStatus::Pending
                    && now.saturating_duration_since(record.last_activity) > timeout
            });

            match result {
                Ok(Some(snapshot)) => timed_out.push(snapshot),
                Ok(None) => {}
                Err(e) if e.is_benign() => debug!("Sweep skipped finished task: {}", e),
                Err(e) => warn!("Sweep could not time out task: {}", e),
            }
        }

        self.finished
            .retain(|_, (_, finished_at)| now.saturating_duration_since(*finished_at) <= timeout);

        timed_out
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// The owner's active task, read fresh from its record
    pub fn active_for(&self, owner: OwnerId) -> Option<TaskSnapshot> {
        let slot = self.owner_slot(owner)?;
        let record = slot.lock();
        (!record.status.is_terminal()).then(|| record.snapshot())
    }

    /// Snapshot of an active task
    pub fn get(&self, task_id: TaskId) -> Option<TaskSnapshot> {
        let slot = self.slot(task_id).ok()?;
        let record = slot.lock();
        (!record.status.is_terminal()).then(|| record.snapshot())
    }

    /// Snapshots of every active task
    pub fn active_tasks(&self) -> Vec<TaskSnapshot> {
        let slots: Vec<Slot> = self.records.iter().map(|e| Arc::clone(e.value())).collect();
        slots
            .iter()
            .filter_map(|slot| {
                let record = slot.lock();
                (!record.status.is_terminal()).then(|| record.snapshot())
            })
            .collect()
    }

    /// Whether cancellation was requested for an active task
    pub fn is_cancel_requested(&self, task_id: TaskId) -> bool {
        self.slot(task_id)
            .map(|slot| slot.lock().cancel_requested)
            .unwrap_or(false)
    }

    pub(crate) fn slot(&self, task_id: TaskId) -> Result<Slot> {
        if let Some(slot) = self.records.get(&task_id).map(|e| Arc::clone(e.value())) {
            return Ok(slot);
        }
        match self.finished.get(&task_id).map(|e| e.value().0) {
            Some(status) => Err(TaskError::AlreadyTerminal { task_id, status }),
            None => Err(TaskError::NotFound(task_id)),
        }
    }

    fn owner_slot(&self, owner: OwnerId) -> Option<Slot> {
        let task_id = self.owners.get(&owner).map(|e| *e.value())?;
        self.records.get(&task_id).map(|e| Arc::clone(e.value()))
    }

    fn is_live(&self, task_id: TaskId) -> bool {
        self.records
            .get(&task_id)
            .map(|e| Arc::clone(e.value()))
            .map(|slot| !slot.lock().status.is_terminal())
            .unwrap_or(false)
    }
}
