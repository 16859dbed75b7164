// Progress Sink
//
// Outbound channel for user-facing progress. The core supplies structured
// updates; formatting chat messages is the host's job.
//
// Sink calls are synchronous and must not block: the core calls them while
// holding a record or queue lock so that a reader observes updates for one
// task in the order they happened.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::poll::PollSummary;
use crate::runner::PostSummary;
use crate::task::{OwnerId, Progress, TaskId, TaskStatus};

// ============================================================================
// Updates
// ============================================================================

/// Intermediate update for a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressUpdate {
    /// Waiting in the queue ("You are #N in queue")
    Queued { position: usize },

    /// Admitted and executing
    Started,

    /// Processing step, e.g. "Processing page X/Y"
    Progress { current: u32, total: u32 },

    /// Poll answers received so far
    PollCount { received: u32, expected: Option<u32> },

    /// Waiting on the user (e.g. page range selection)
    AwaitingInput,

    /// Ask the host to delete a poll prompt message
    DeletePrompt { respondent: i64 },
}

/// The single final message of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalSummary {
    pub owner: OwnerId,
    pub status: TaskStatus,
    pub progress: Progress,
    /// Failure reason or job-supplied detail
    pub detail: Option<String>,
    pub poll: Option<PollSummary>,
    /// Quiz posting counters
    #[serde(default)]
    pub posted: Option<PostSummary>,
}

impl FinalSummary {
    /// One-line outcome text
    pub fn message(&self) -> String {
        let mut text = match self.status {
            TaskStatus::Completed => match (&self.poll, &self.posted) {
                (Some(poll), _) => format!(
                    "Collection finished: {} answers ({} valid, {} invalid)",
                    poll.total, poll.success, poll.failed
                ),
                (None, Some(posted)) => format!(
                    "Posted {}/{} quizzes ({} failed, {} skipped)",
                    posted.success, posted.total, posted.failed, posted.skipped
                ),
                (None, None) => format!("Done: processed {}", self.progress),
            },
            TaskStatus::Failed => "Task failed".to_string(),
            TaskStatus::Cancelled => format!("Cancelled at {}", self.progress),
            TaskStatus::TimedOut => {
                format!("Timed out due to inactivity at {}", self.progress)
            }
            status => format!("Task ended in unexpected state {}", status),
        };

        if let Some(detail) = &self.detail {
            text.push_str(": ");
            text.push_str(detail);
        }
        text
    }
}

// ============================================================================
// ProgressSink Trait
// ============================================================================

/// Receiver of progress and final messages
pub trait ProgressSink: Send + Sync {
    /// Intermediate update; callers rate-limit
    fn emit(&self, task_id: TaskId, update: ProgressUpdate);

    /// Final message; called exactly once per task
    fn emit_final(&self, task_id: TaskId, summary: FinalSummary);

    /// Human-readable name for logging/debugging.
    fn name(&self) -> &'static str {
        "ProgressSink"
    }
}

// ============================================================================
// ChannelSink
// ============================================================================

/// Event delivered by [`ChannelSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Progress {
        task_id: TaskId,
        update: ProgressUpdate,
    },
    Final {
        task_id: TaskId,
        summary: FinalSummary,
    },
}

impl SinkEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Progress { task_id, .. } | Self::Final { task_id, .. } => *task_id,
        }
    }
}

/// Forwards every call to an unbounded channel
///
/// The host drains the receiver and talks to the chat transport.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SinkEvent) {
        if self.tx.send(event).is_err() {
            debug!("Progress receiver dropped, discarding event");
        }
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, task_id: TaskId, update: ProgressUpdate) {
        self.send(SinkEvent::Progress { task_id, update });
    }

    fn emit_final(&self, task_id: TaskId, summary: FinalSummary) {
        self.send(SinkEvent::Final { task_id, summary });
    }

    fn name(&self) -> &'static str {
        "ChannelSink"
    }
}

// ============================================================================
// TracingSink / NoopSink
// ============================================================================

/// Logs every update
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, task_id: TaskId, update: ProgressUpdate) {
        debug!(%task_id, ?update, "Task progress");
    }

    fn emit_final(&self, task_id: TaskId, summary: FinalSummary) {
        info!(
            %task_id,
            owner = %summary.owner,
            status = %summary.status,
            "{}",
            summary.message()
        );
    }

    fn name(&self) -> &'static str {
        "TracingSink"
    }
}

/// Discards everything
#[derive(Debug, Clone, Default)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _task_id: TaskId, _update: ProgressUpdate) {}

    fn emit_final(&self, _task_id: TaskId, _summary: FinalSummary) {}

    fn name(&self) -> &'static str {
        "NoopSink"
    }
}

// ============================================================================
// CompositeSink
// ============================================================================

/// Fans every call out to several sinks, in order
pub struct CompositeSink {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl CompositeSink {
    pub fn new(sinks: Vec<Arc<dyn ProgressSink>>) -> Self {
        Self { sinks }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ProgressSink for CompositeSink {
    fn emit(&self, task_id: TaskId, update: ProgressUpdate) {
        for sink in &self.sinks {
            sink.emit(task_id, update.clone());
        }
    }

    fn emit_final(&self, task_id: TaskId, summary: FinalSummary) {
        for sink in &self.sinks {
            sink.emit_final(task_id, summary.clone());
        }
    }

    fn name(&self) -> &'static str {
        "CompositeSink"
    }
}

// ============================================================================
// ProgressThrottle
// ============================================================================

/// Bounds how often a runner emits progress
///
/// Emits on every `every`-th step and always on the last step of a known
/// total, so the user never misses the final count.
#[derive(Debug, Clone, Copy)]
pub struct ProgressThrottle {
    every: u32,
}

impl ProgressThrottle {
    pub fn new(every: u32) -> Self {
        Self {
            every: every.max(1),
        }
    }

    /// `step` is 1-based; `total == 0` means unknown
    pub fn should_emit(&self, step: u32, total: u32) -> bool {
        if step == 0 {
            return false;
        }
        step % self.every == 0 || (total > 0 && step >= total)
    }

    /// True when a counter that jumped from `previous` to `current` passed
    /// at least one multiple of `every`
    ///
    /// For counters that advance in batches, where `should_emit` would miss
    /// a multiple that was stepped over.
    pub fn crossed(&self, previous: u32, current: u32) -> bool {
        current / self.every > previous / self.every
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(1)
    }
}
