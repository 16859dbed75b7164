//! Poll answer collection
//!
//! A [`PollCollector`] holds the live state of one collection session: the
//! latest answer per respondent, the expected total and whether prompt
//! messages are auto-deleted. The chat transport feeds it through
//! [`PollCollector::record_answer`]; a [`PollJob`] drives it as a task so it
//! shares cancellation and the inactivity timeout with every other job.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::JobError;
use crate::runner::{Job, JobOutput, TaskContext};
use crate::sink::{ProgressThrottle, ProgressUpdate};
use crate::task::TaskSpec;

/// Chat identity of whoever answered
pub type RespondentId = i64;

/// Options selected by a respondent; empty means the vote was retracted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollAnswer {
    pub option_ids: Vec<u32>,
}

impl PollAnswer {
    pub fn new(option_ids: Vec<u32>) -> Self {
        Self { option_ids }
    }

    pub fn is_retracted(&self) -> bool {
        self.option_ids.is_empty()
    }
}

/// Export counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSummary {
    /// Valid answers
    pub success: u32,
    /// Invalid or retracted answers
    pub failed: u32,
    /// Distinct respondents
    pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("poll collection is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct PollState {
    answers: BTreeMap<RespondentId, PollAnswer>,
    /// Respondents whose answers arrived since the job last looked
    arrivals: VecDeque<RespondentId>,
    closed: bool,
}

/// Live state of a poll collection session
#[derive(Debug)]
pub struct PollCollector {
    expected_total: Option<u32>,
    option_count: Option<u32>,
    auto_delete: bool,
    state: Mutex<PollState>,
    changed: Notify,
}

impl PollCollector {
    pub fn new(expected_total: Option<u32>, auto_delete: bool) -> Self {
        Self {
            expected_total,
            option_count: None,
            auto_delete,
            state: Mutex::new(PollState::default()),
            changed: Notify::new(),
        }
    }

    /// Treat option ids `>= count` as invalid
    pub fn with_option_count(mut self, count: u32) -> Self {
        self.option_count = Some(count);
        self
    }

    pub fn expected_total(&self) -> Option<u32> {
        self.expected_total
    }

    pub fn auto_delete(&self) -> bool {
        self.auto_delete
    }

    /// Store a respondent's answer, replacing any earlier one
    ///
    /// Returns the number of distinct respondents so far.
    pub fn record_answer(&self, respondent: RespondentId, answer: PollAnswer) -> Result<u32, PollError> {
        let received = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PollError::Closed);
            }
            if state.answers.insert(respondent, answer).is_some() {
                debug!(respondent, "Answer replaced");
            }
            state.arrivals.push_back(respondent);
            state.answers.len() as u32
        };

        self.changed.notify_one();
        Ok(received)
    }

    /// Distinct respondents so far
    pub fn received(&self) -> u32 {
        self.state.lock().answers.len() as u32
    }

    /// Drop collected answers; the session stays open
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.answers.clear();
        state.arrivals.clear();
        drop(state);
        self.changed.notify_one();
    }

    /// Stop accepting answers
    pub fn stop(&self) {
        self.state.lock().closed = true;
        self.changed.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Snapshot of the stored answers, ordered by respondent
    pub fn answers(&self) -> Vec<(RespondentId, PollAnswer)> {
        self.state
            .lock()
            .answers
            .iter()
            .map(|(id, answer)| (*id, answer.clone()))
            .collect()
    }

    /// Close the collector and count the answers
    pub fn finalize(&self) -> PollSummary {
        let mut state = self.state.lock();
        state.closed = true;

        let total = state.answers.len() as u32;
        let success = state
            .answers
            .values()
            .filter(|answer| self.is_valid(answer))
            .count() as u32;

        PollSummary {
            success,
            failed: total - success,
            total,
        }
    }

    fn is_valid(&self, answer: &PollAnswer) -> bool {
        if answer.is_retracted() {
            return false;
        }
        match self.option_count {
            Some(count) => answer.option_ids.iter().all(|id| *id < count),
            None => true,
        }
    }

    fn take_arrivals(&self) -> Vec<RespondentId> {
        self.state.lock().arrivals.drain(..).collect()
    }

    fn is_done(&self) -> bool {
        let state = self.state.lock();
        state.closed
            || self
                .expected_total
                .is_some_and(|expected| expected > 0 && state.answers.len() as u32 >= expected)
    }
}

/// Runs a [`PollCollector`] session as a task
///
/// The collector is closed when the job ends, however it ends: completed,
/// cancelled, failed, aborted by the timeout sweep, or dropped before it
/// ever started.
pub struct PollJob {
    session: OpenSession,
}

impl PollJob {
    pub fn new(collector: Arc<PollCollector>) -> Self {
        Self {
            session: OpenSession(collector),
        }
    }
}

/// Closes the collector on drop
struct OpenSession(Arc<PollCollector>);

impl Drop for OpenSession {
    fn drop(&mut self) {
        if !self.0.is_closed() {
            self.0.stop();
            debug!("Poll collection closed with its task");
        }
    }
}

#[async_trait]
impl Job for PollJob {
    fn spec(&self) -> TaskSpec {
        TaskSpec::PollCollection {
            expected_total: self.session.0.expected_total(),
            auto_delete: self.session.0.auto_delete(),
        }
    }

    async fn run(self: Box<Self>, ctx: TaskContext) -> Result<JobOutput, JobError> {
        let session = self.session;
        let collector = &session.0;
        let expected = collector.expected_total();
        let throttle = ProgressThrottle::new(ctx.config().poll_progress_every);
        let mut submissions = 0u32;
        let mut last_count: Option<u32> = None;

        loop {
            let before = submissions;
            for respondent in collector.take_arrivals() {
                submissions += 1;
                if collector.auto_delete() {
                    ctx.emit(ProgressUpdate::DeletePrompt { respondent });
                }
            }

            let received = collector.received();
            ctx.report(received, expected.unwrap_or(0))?;
            if throttle.crossed(before, submissions) {
                ctx.emit(ProgressUpdate::PollCount { received, expected });
                last_count = Some(received);
            }

            if collector.is_done() {
                break;
            }
            if ctx.is_cancel_requested() {
                return Err(JobError::Cancelled);
            }

            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(JobError::Cancelled),
                _ = collector.changed.notified() => {}
            }
        }

        let summary = collector.finalize();
        if last_count != Some(summary.total) {
            ctx.emit(ProgressUpdate::PollCount {
                received: summary.total,
                expected,
            });
        }
        debug!(task_id = %ctx.task_id(), ?summary, "Poll collection finished");
        Ok(JobOutput {
            poll: Some(summary),
            ..JobOutput::default()
        })
    }
}
