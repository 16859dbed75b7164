//! # Task Lifecycle Core
//!
//! Admission, queueing and supervision of long-running per-user jobs for a
//! chat bot: PDF generation from quiz data, quiz posting and poll answer
//! collection.
//!
//! ## Features
//!
//! - **One task per user**: the registry refuses a second active task for an owner
//! - **FIFO queue**: waiters are told their position and re-told when it changes
//! - **Cooperative cancellation**: jobs observe cancel requests at checkpoints
//! - **Timeout backstop**: tasks idle past the timeout are forced to TimedOut
//! - **Supervised runners**: errors and panics still end in a terminal status
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TaskCoordinator                         │
//! │  (owns lifecycle, runs the timeout sweep)                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskQueue                             │
//! │  (concurrency limit, FIFO waiting list, positions)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       TaskRegistry                           │
//! │  (owner → task, state machine, progress, timeouts)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │        JobRunner  ──▶  PdfJob / PollJob / QuizPostJob        │
//! │  (supervises jobs, reports through TaskContext)             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Progress leaves the core through a [`ProgressSink`]; the host turns it
//! into chat messages.
//!
//! ## Example
//!
//! ```ignore
//! use tss_tasks::prelude::*;
//!
//! let (sink, mut events) = ChannelSink::new();
//! let coordinator = TaskCoordinator::new(TaskConfig::from_env(), Arc::new(sink))?;
//! coordinator.start()?;
//!
//! let pages = PageRange::new(1, 10).unwrap();
//! let job = PdfJob::for_range(engine, pages);
//! let Enqueued { position, .. } = coordinator.submit(OwnerId(42), Box::new(job))?;
//!
//! while let Some(event) = events.recv().await {
//!     // forward to the chat
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod poll;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod sink;
pub mod task;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::TaskConfig;
    pub use crate::coordinator::{CoordinatorError, TaskCoordinator};
    pub use crate::error::{JobError, RenderError, TaskError, TransportError};
    pub use crate::poll::{PollAnswer, PollCollector, PollJob, PollSummary};
    pub use crate::queue::{Cancellation, Enqueued, OwnerStatus, QueueStats};
    pub use crate::runner::{
        Job, JobOutput, PageSelection, PdfJob, PostSummary, Quiz, QuizPostJob, QuizTransport,
        RenderedPage, RenderingEngine, TaskContext,
    };
    pub use crate::sink::{ChannelSink, FinalSummary, ProgressSink, ProgressUpdate, SinkEvent};
    pub use crate::task::{OwnerId, PageRange, TaskId, TaskKind, TaskSnapshot, TaskStatus};
}

// Re-export key types at crate root
pub use config::TaskConfig;
pub use coordinator::{CoordinatorError, TaskCoordinator};
pub use error::{JobError, RenderError, TaskError, TransportError};
pub use poll::{PollAnswer, PollCollector, PollError, PollJob, PollSummary, RespondentId};
pub use queue::{Cancellation, Enqueued, OwnerStatus, QueueStats, TaskQueue};
pub use registry::{Outcome, TaskRegistry, TerminalObserver};
pub use runner::{
    Job, JobOutput, JobRunner, PageSelection, PdfJob, PostSummary, Quiz, QuizPacing, QuizPostJob,
    QuizTransport, RenderedPage, RenderingEngine, TaskContext,
};
pub use sink::{
    ChannelSink, CompositeSink, FinalSummary, NoopSink, ProgressSink, ProgressThrottle,
    ProgressUpdate, SinkEvent, TracingSink,
};
pub use task::{
    OwnerId, PageRange, Progress, RunnerHandle, TaskId, TaskKind, TaskSnapshot, TaskSpec,
    TaskStatus,
};
