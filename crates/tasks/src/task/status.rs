//! Task state machine
//!
//! ```text
//! Pending ──▶ Running ◀──▶ AwaitingInput
//!    │           │               │
//!    └───────────┴───────────────┴──▶ Completed | Failed | Cancelled | TimedOut
//! ```
//!
//! Terminal states are final. Completed is only reachable from Running or
//! AwaitingInput; the other terminal states are reachable from any
//! non-terminal state (a waiting task can be cancelled or time out).

use serde::{Deserialize, Serialize};

/// Status of a task record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Admitted, slot reserved, not yet executing
    Pending,

    /// Runner actively producing progress
    Running,

    /// Waiting on further chat input
    AwaitingInput,

    /// Finished successfully
    Completed,

    /// Finished with an error
    Failed,

    /// Cancelled on user request
    Cancelled,

    /// Forced by the inactivity sweep
    TimedOut,
}

impl TaskStatus {
    /// Whether no further transitions are allowed
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Whether `next` is an edge of the state machine
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        match (self, next) {
            (Pending, Running) => true,
            (Running, AwaitingInput) | (AwaitingInput, Running) => true,
            (Running | AwaitingInput, Completed) => true,
            (Pending | Running | AwaitingInput, Failed | Cancelled | TimedOut) => true,
            _ => false,
        }
    }

    /// Position in the forward order; used to check monotonic observation
    ///
    /// Running and AwaitingInput share a rank since they alternate.
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running | Self::AwaitingInput => 1,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut => 2,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::AwaitingInput => write!(f, "awaiting_input"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}
