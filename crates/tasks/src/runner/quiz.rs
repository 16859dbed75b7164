//! Quiz posting job
//!
//! Sends a list of quizzes to a chat in paced batches. Each quiz is one
//! checkpoint, so a cancel lands between two quizzes and the progress shows
//! how many were handled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Job, JobOutput, TaskContext};
use crate::error::{JobError, TransportError};
use crate::task::TaskSpec;

/// Most options a chat quiz accepts
pub const MAX_OPTIONS: usize = 10;

/// One quiz question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quiz {
    pub question: String,
    pub options: Vec<String>,
    /// 0-based index into `options`
    pub correct_option: u32,
    #[serde(default)]
    pub explanation: Option<String>,
}

impl Quiz {
    pub fn new(question: impl Into<String>, options: Vec<String>, correct_option: u32) -> Self {
        Self {
            question: question.into(),
            options,
            correct_option,
            explanation: None,
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }

    /// Options cut to [`MAX_OPTIONS`], correct index clamped into range
    pub fn normalized(&self) -> Quiz {
        let options: Vec<String> = self.options.iter().take(MAX_OPTIONS).cloned().collect();
        let last = options.len().saturating_sub(1) as u32;
        Quiz {
            question: self.question.clone(),
            correct_option: self.correct_option.min(last),
            options,
            explanation: self.explanation.clone().filter(|e| !e.is_empty()),
        }
    }

    /// Nothing to post: no question text or no options at all
    fn is_blank(&self) -> bool {
        self.question.trim().is_empty() || self.options.is_empty()
    }
}

/// Sends one quiz to the chat
#[async_trait]
pub trait QuizTransport: Send + Sync {
    async fn send_quiz(&self, quiz: &Quiz) -> Result<(), TransportError>;
}

/// Counters for a posting run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostSummary {
    pub total: u32,
    pub success: u32,
    pub failed: u32,
    pub skipped: u32,
}

/// Delays and retry budget for posting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizPacing {
    /// Quizzes per batch
    pub batch_size: u32,

    #[serde(with = "crate::config::duration_millis")]
    pub quiz_delay: Duration,

    #[serde(with = "crate::config::duration_millis")]
    pub batch_delay: Duration,

    /// Send attempts per quiz, including the first
    pub max_attempts: u32,

    /// Wait after a timed out send
    #[serde(with = "crate::config::duration_millis")]
    pub retry_delay: Duration,
}

impl Default for QuizPacing {
    fn default() -> Self {
        Self {
            batch_size: 30,
            quiz_delay: Duration::from_millis(1500),
            batch_delay: Duration::from_secs(5),
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

impl QuizPacing {
    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_quiz_delay(mut self, delay: Duration) -> Self {
        self.quiz_delay = delay;
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

/// Posts quizzes one by one, one checkpoint per quiz
pub struct QuizPostJob {
    transport: Arc<dyn QuizTransport>,
    quizzes: Vec<Quiz>,
    pacing: QuizPacing,
}

impl QuizPostJob {
    pub fn new(transport: Arc<dyn QuizTransport>, quizzes: Vec<Quiz>) -> Self {
        Self {
            transport,
            quizzes,
            pacing: QuizPacing::default(),
        }
    }

    pub fn with_pacing(mut self, pacing: QuizPacing) -> Self {
        self.pacing = pacing;
        self
    }
}

#[async_trait]
impl Job for QuizPostJob {
    fn spec(&self) -> TaskSpec {
        TaskSpec::QuizPosting {
            quizzes: self.quizzes.len() as u32,
        }
    }

    async fn run(self: Box<Self>, ctx: TaskContext) -> Result<JobOutput, JobError> {
        let Self {
            transport,
            quizzes,
            pacing,
        } = *self;

        let total = quizzes.len() as u32;
        let mut summary = PostSummary {
            total,
            ..PostSummary::default()
        };
        ctx.checkpoint(0, total)?;

        for (index, quiz) in quizzes.iter().enumerate() {
            let number = index as u32 + 1;

            if quiz.is_blank() {
                debug!(task_id = %ctx.task_id(), number, "Skipping blank quiz");
                summary.skipped += 1;
                ctx.checkpoint(number, total)?;
                continue;
            }

            if post(transport.as_ref(), &ctx, &quiz.normalized(), &pacing).await? {
                summary.success += 1;
            } else {
                summary.failed += 1;
            }
            ctx.checkpoint(number, total)?;

            if number < total {
                ctx.pause(pacing.quiz_delay).await?;
                if number % pacing.batch_size.max(1) == 0 {
                    debug!(task_id = %ctx.task_id(), number, "Batch posted, pausing");
                    ctx.pause(pacing.batch_delay).await?;
                }
            }
        }

        Ok(JobOutput {
            posted: Some(summary),
            ..JobOutput::default()
        })
    }
}

/// Send one quiz; `Ok(false)` when it could not be posted
///
/// Only cancellation during a retry wait is an error.
async fn post(
    transport: &dyn QuizTransport,
    ctx: &TaskContext,
    quiz: &Quiz,
    pacing: &QuizPacing,
) -> Result<bool, JobError> {
    if quiz.options.len() < 2 {
        return Ok(false);
    }

    let attempts = pacing.max_attempts.max(1);
    for attempt in 1..=attempts {
        let err = match transport.send_quiz(quiz).await {
            Ok(()) => return Ok(true),
            Err(err) => err,
        };

        if !err.is_retryable() {
            warn!(task_id = %ctx.task_id(), error = %err, "Quiz rejected");
            return Ok(false);
        }
        if attempt == attempts {
            warn!(task_id = %ctx.task_id(), error = %err, attempts, "Quiz not posted, out of retries");
            return Ok(false);
        }

        let wait = match err {
            TransportError::RetryAfter(delay) => delay,
            _ => pacing.retry_delay,
        };
        debug!(task_id = %ctx.task_id(), attempt, ?wait, "Retrying quiz");
        ctx.pause(wait).await?;
    }
    Ok(false)
}
