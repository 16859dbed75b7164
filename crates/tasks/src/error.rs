// Error types for the task lifecycle core

use thiserror::Error;

use crate::task::{OwnerId, TaskId, TaskStatus};

/// Result type alias for registry and queue operations
pub type Result<T> = std::result::Result<T, TaskError>;

/// Errors raised by the registry and the queue
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The owner already has a non-terminal task (running or waiting)
    #[error("owner {owner} already has an active task")]
    AlreadyActive { owner: OwnerId },

    /// A runner is already bound to this task
    #[error("task {0} already has a bound runner")]
    AlreadyBound(TaskId),

    /// The requested status change is not an edge of the state machine
    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// The task already reached a terminal status; the request was ignored
    #[error("task {task_id} is already terminal ({status})")]
    AlreadyTerminal { task_id: TaskId, status: TaskStatus },

    /// No active record with this id
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// The waiting list is at capacity
    #[error("queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The coordinator is shutting down and takes no new tasks
    #[error("not accepting tasks: shutting down")]
    ShuttingDown,

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TaskError {
    /// Benign errors that callers are expected to swallow
    pub fn is_benign(&self) -> bool {
        matches!(self, TaskError::AlreadyTerminal { .. })
    }
}

/// Errors from the rendering engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    /// A single page could not be rendered
    #[error("page {page} failed to render: {message}")]
    Page { page: u32, message: String },

    /// The engine itself is unavailable
    #[error("rendering engine unavailable: {0}")]
    Unavailable(String),
}

impl RenderError {
    /// Create a page failure
    pub fn page(page: u32, message: impl Into<String>) -> Self {
        RenderError::Page {
            page,
            message: message.into(),
        }
    }
}

/// Errors from the chat transport when posting a message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Flood control; try again after the given delay
    #[error("rate limited, retry after {0:?}")]
    RetryAfter(std::time::Duration),

    /// The request timed out; safe to retry
    #[error("request timed out")]
    TimedOut,

    /// Refused for good (bad payload, chat gone)
    #[error("rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Rejected(_))
    }
}

/// Errors a job body can return
///
/// Every variant maps to exactly one terminal status; see
/// [`JobError::terminal_status`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Cancellation was observed at a checkpoint
    #[error("cancelled")]
    Cancelled,

    /// Propagated from the rendering engine
    #[error(transparent)]
    Render(#[from] RenderError),

    /// Chat transport failure (e.g. the input channel went away)
    #[error("transport error: {0}")]
    Transport(String),

    /// Registry or queue rejected an operation
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Unexpected internal fault, including a panicked job body
    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        JobError::Transport(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        JobError::Internal(msg.into())
    }

    /// Terminal status this error drives the task into
    pub fn terminal_status(&self) -> TaskStatus {
        match self {
            JobError::Cancelled => TaskStatus::Cancelled,
            _ => TaskStatus::Failed,
        }
    }

    /// One-line text suitable for showing to the user
    pub fn user_summary(&self) -> String {
        match self {
            JobError::Cancelled => "Task cancelled".to_string(),
            JobError::Render(RenderError::Page { page, message }) => {
                format!("Could not process page {}: {}", page, truncate(message, 200))
            }
            JobError::Render(RenderError::Unavailable(_)) => {
                "Document processing is unavailable right now, please try again later".to_string()
            }
            JobError::Transport(msg) => format!("Lost contact with the chat: {}", truncate(msg, 200)),
            JobError::Task(_) | JobError::Internal(_) => {
                "Processing failed due to an internal error".to_string()
            }
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}
