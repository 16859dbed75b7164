//! Task queue
//!
//! Admits tasks up to the concurrency limit and keeps a FIFO waiting list
//! for the rest. Waiting entries already hold a Pending record in the
//! registry, so "already queued" and "already running" are the same
//! admission conflict.
//!
//! All queue state sits behind one mutex. Removal and position
//! recomputation happen in the same critical section, so a waiter never
//! sees a stale position. The queue may call into the registry while
//! holding its lock, but never performs a terminal transition there: the
//! registry calls back into [`TaskQueue::on_task_terminal`] for those.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TaskConfig;
use crate::error::{JobError, Result, TaskError};
use crate::registry::{TaskRegistry, TerminalObserver};
use crate::runner::{Job, JobRunner};
use crate::sink::ProgressUpdate;
use crate::task::{OwnerId, TaskId, TaskSnapshot, TaskStatus};

/// Result of a successful enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    pub task_id: TaskId,
    /// 0 when admitted immediately, otherwise the 1-based waiting position
    pub position: usize,
}

/// What `cancel` did
#[derive(Debug, Clone, PartialEq)]
pub enum Cancellation {
    /// Removed from the waiting list and cancelled
    Dequeued(TaskId),
    /// Running task flagged; it stops at its next checkpoint
    Requested(TaskSnapshot),
    /// The owner has no active task
    NothingActive,
}

/// Where an owner stands, derived from the registry and the queue
#[derive(Debug, Clone, PartialEq)]
pub enum OwnerStatus {
    Idle,
    Queued { position: usize },
    Active(TaskSnapshot),
}

/// Queue counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub running: usize,
    pub waiting: usize,
    /// Waiting-list capacity
    pub capacity: usize,
    pub max_concurrency: usize,
}

struct Waiter {
    task_id: TaskId,
    owner: OwnerId,
    job: Box<dyn Job>,
}

#[derive(Default)]
struct QueueState {
    running: HashSet<TaskId>,
    waiting: VecDeque<Waiter>,
}

/// FIFO admission queue in front of the registry
pub struct TaskQueue {
    registry: Arc<TaskRegistry>,
    config: Arc<TaskConfig>,
    state: Mutex<QueueState>,
}

impl TaskQueue {
    /// Create a queue and subscribe it to the registry's terminal events
    pub fn new(registry: Arc<TaskRegistry>, config: Arc<TaskConfig>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<TaskQueue>| {
            let observer: Weak<dyn TerminalObserver> = weak.clone();
            registry.observe(observer);
            Self {
                registry,
                config,
                state: Mutex::new(QueueState::default()),
            }
        })
    }

    /// Admit `job` for `owner`, or append it to the waiting list
    ///
    /// Fails with `AlreadyActive` if the owner is running or waiting, and
    /// with `QueueFull` if the waiting list is at capacity.
    pub fn enqueue(&self, owner: OwnerId, job: Box<dyn Job>) -> Result<Enqueued> {
        let mut state = self.state.lock();

        if self.registry.active_for(owner).is_some() {
            return Err(TaskError::AlreadyActive { owner });
        }

        let has_capacity = state.running.len() < self.config.max_concurrency;
        if !has_capacity && state.waiting.len() >= self.config.max_queue_size {
            debug!(%owner, waiting = state.waiting.len(), "Queue full");
            return Err(TaskError::QueueFull {
                capacity: self.config.max_queue_size,
            });
        }

        let task_id = self.registry.admit(owner, job.spec())?.task_id;

        if has_capacity {
            let started = self.start(&mut state, task_id, job);
            drop(state);
            if let Err(e) = started {
                self.abandon(task_id, &e);
                return Err(e);
            }
            return Ok(Enqueued {
                task_id,
                position: 0,
            });
        }

        state.waiting.push_back(Waiter {
            task_id,
            owner,
            job,
        });
        let position = state.waiting.len();
        self.registry
            .emit_progress(task_id, ProgressUpdate::Queued { position });

        info!(%task_id, %owner, position, "Task queued");
        Ok(Enqueued { task_id, position })
    }

    /// Promote waiters after a task finished
    ///
    /// Called by the registry once per terminal transition, after its locks
    /// are released.
    pub fn on_task_terminal(&self, task_id: TaskId) {
        let mut state = self.state.lock();
        let mut not_started = Vec::new();

        if state.running.remove(&task_id) {
            let mut admitted = 0;
            while state.running.len() < self.config.max_concurrency {
                let Some(next) = state.waiting.pop_front() else {
                    break;
                };
                debug!(task_id = %next.task_id, owner = %next.owner, "Admitting waiter");
                if let Err(e) = self.start(&mut state, next.task_id, next.job) {
                    not_started.push((next.task_id, e));
                }
                admitted += 1;
            }
            if admitted > 0 {
                self.announce_positions(&state, 0);
            }
        } else if let Some(index) = state.waiting.iter().position(|w| w.task_id == task_id) {
            // Cancelled or timed out while waiting
            state.waiting.remove(index);
            self.announce_positions(&state, index);
        }

        drop(state);
        for (task_id, e) in not_started {
            self.abandon(task_id, &e);
        }
    }

    /// 0 when running, the 1-based position when waiting
    pub fn position(&self, owner: OwnerId) -> Option<usize> {
        let state = self.state.lock();
        if let Some(index) = state.waiting.iter().position(|w| w.owner == owner) {
            return Some(index + 1);
        }
        self.registry.active_for(owner).map(|_| 0)
    }

    /// Cancel the owner's task, waiting or running
    ///
    /// Idempotent: a second call on a running task only re-flags it.
    pub fn cancel(&self, owner: OwnerId) -> Cancellation {
        let removed = {
            let mut state = self.state.lock();
            match state.waiting.iter().position(|w| w.owner == owner) {
                Some(index) => {
                    let waiter = state.waiting.remove(index);
                    self.announce_positions(&state, index);
                    waiter
                }
                None => None,
            }
        };

        if let Some(waiter) = removed {
            // The record leaves the registry outside the queue lock; the
            // terminal callback then finds nothing left to remove.
            if let Err(e) = self.registry.advance(waiter.task_id, TaskStatus::Cancelled) {
                debug!(task_id = %waiter.task_id, "Dequeued task already finished: {}", e);
            }
            info!(task_id = %waiter.task_id, %owner, "Waiting task cancelled");
            return Cancellation::Dequeued(waiter.task_id);
        }

        match self.registry.cancel(owner) {
            Some(snapshot) => Cancellation::Requested(snapshot),
            None => Cancellation::NothingActive,
        }
    }

    /// Fresh view of the owner's state
    pub fn status(&self, owner: OwnerId) -> OwnerStatus {
        let state = self.state.lock();
        if let Some(index) = state.waiting.iter().position(|w| w.owner == owner) {
            return OwnerStatus::Queued {
                position: index + 1,
            };
        }
        match self.registry.active_for(owner) {
            Some(snapshot) => OwnerStatus::Active(snapshot),
            None => OwnerStatus::Idle,
        }
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            running: state.running.len(),
            waiting: state.waiting.len(),
            capacity: self.config.max_queue_size,
            max_concurrency: self.config.max_concurrency,
        }
    }

    /// Spawn the runner; a non-benign error leaves the task for `abandon`
    fn start(&self, state: &mut QueueState, task_id: TaskId, job: Box<dyn Job>) -> Result<()> {
        // Tracked before spawning: if the task is already finishing, its
        // terminal callback is queued behind our lock and will untrack it.
        state.running.insert(task_id);

        match JobRunner::spawn(
            Arc::clone(&self.registry),
            task_id,
            job,
            Arc::clone(&self.config),
        ) {
            Ok(_) => Ok(()),
            Err(e) if e.is_benign() => {
                debug!(%task_id, "Not starting finished task: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Fail a task whose runner could not start
    ///
    /// Must be called without the queue lock: the terminal callback frees
    /// the running slot and promotes the next waiter.
    fn abandon(&self, task_id: TaskId, cause: &TaskError) {
        warn!(%task_id, error = %cause, "Runner did not start, failing task");
        let summary = JobError::Task(cause.clone()).user_summary();
        if let Err(e) = self.registry.fail(task_id, summary) {
            debug!(%task_id, "Task finished before it could be failed: {}", e);
        }
    }

    fn announce_positions(&self, state: &QueueState, from: usize) {
        for (index, waiter) in state.waiting.iter().enumerate().skip(from) {
            self.registry.emit_progress(
                waiter.task_id,
                ProgressUpdate::Queued {
                    position: index + 1,
                },
            );
        }
    }
}

impl TerminalObserver for TaskQueue {
    fn on_task_terminal(&self, snapshot: &TaskSnapshot) {
        TaskQueue::on_task_terminal(self, snapshot.task_id);
    }
}
