//! Job runners
//!
//! A [`Job`] is the concrete work behind a task. The [`JobRunner`]
//! supervises it: whatever the job does (returns, errors, panics, or gets
//! aborted by the timeout sweep), the task ends in exactly one terminal
//! status.

mod context;
mod pdf;
mod quiz;
mod supervisor;

use async_trait::async_trait;

use crate::error::JobError;
use crate::poll::PollSummary;
use crate::task::{TaskKind, TaskSpec};

pub use context::TaskContext;
pub use pdf::{PageSelection, PdfJob, RenderedPage, RenderingEngine};
pub use quiz::{PostSummary, Quiz, QuizPacing, QuizPostJob, QuizTransport};
pub use supervisor::JobRunner;

/// Result of a successful job, carried into the final summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutput {
    pub detail: Option<String>,
    pub poll: Option<PollSummary>,
    pub posted: Option<PostSummary>,
}

impl JobOutput {
    pub fn with_detail(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::default()
        }
    }
}

/// Work executed for one task
///
/// Implementations call [`TaskContext::checkpoint`] at every natural step
/// so that progress is reported and cancellation is observed.
#[async_trait]
pub trait Job: Send + 'static {
    /// Kind-specific payload stored on the task record
    fn spec(&self) -> TaskSpec;

    fn kind(&self) -> TaskKind {
        self.spec().kind()
    }

    /// Run to completion
    async fn run(self: Box<Self>, ctx: TaskContext) -> Result<JobOutput, JobError>;
}
