//! Task records and their owned snapshots

use std::fmt;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::TaskStatus;

/// Unique task identifier (UUID v7, time-ordered)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a fresh id
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the requesting chat user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub i64);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for OwnerId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Kind of work a task performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    PdfGeneration,
    PollCollection,
    QuizPosting,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PdfGeneration => write!(f, "pdf_generation"),
            Self::PollCollection => write!(f, "poll_collection"),
            Self::QuizPosting => write!(f, "quiz_posting"),
        }
    }
}

/// Inclusive, 1-based page range of a source document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    first: u32,
    last: u32,
}

impl PageRange {
    /// Returns `None` unless `1 <= first <= last`
    pub fn new(first: u32, last: u32) -> Option<Self> {
        (first >= 1 && first <= last).then_some(Self { first, last })
    }

    /// Every page of a document with `page_count` pages
    pub fn all(page_count: u32) -> Option<Self> {
        Self::new(1, page_count)
    }

    pub fn first(&self) -> u32 {
        self.first
    }

    pub fn last(&self) -> u32 {
        self.last
    }

    /// Number of pages in the range
    pub fn len(&self) -> u32 {
        self.last - self.first + 1
    }

    /// Never true; a range holds at least one page
    pub fn is_empty(&self) -> bool {
        false
    }

    /// 0-based source page indices, in order
    pub fn source_indices(&self) -> impl Iterator<Item = u32> {
        (self.first - 1)..self.last
    }
}

/// Kind-specific payload of a task
///
/// Poll-only data lives in the `PollCollection` variant, so there is no
/// shared struct with optional fields for either kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskSpec {
    PdfGeneration {
        /// `None` while the user has not picked a range yet
        pages: Option<PageRange>,
    },
    PollCollection {
        expected_total: Option<u32>,
        auto_delete: bool,
    },
    QuizPosting {
        quizzes: u32,
    },
}

impl TaskSpec {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::PdfGeneration { .. } => TaskKind::PdfGeneration,
            Self::PollCollection { .. } => TaskKind::PollCollection,
            Self::QuizPosting { .. } => TaskKind::QuizPosting,
        }
    }
}

/// Progress counters; `total == 0` means unknown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u32,
    pub total: u32,
}

impl Progress {
    pub fn new(current: u32, total: u32) -> Self {
        Self { current, total }
    }

    /// Whether the total is known
    pub fn has_total(&self) -> bool {
        self.total > 0
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.has_total() {
            write!(f, "{}/{}", self.current, self.total)
        } else {
            write!(f, "{}", self.current)
        }
    }
}

/// Handle to the runner bound to a task
#[derive(Debug)]
pub struct RunnerHandle {
    abort: Option<AbortHandle>,
}

impl RunnerHandle {
    /// Bind the tokio task executing the job
    pub fn new(abort: AbortHandle) -> Self {
        Self { abort: Some(abort) }
    }

    /// A runner without a tokio task behind it (tests, external drivers)
    pub fn detached() -> Self {
        Self { abort: None }
    }

    pub(crate) fn abort(&self) {
        if let Some(handle) = &self.abort {
            handle.abort();
        }
    }
}

/// Mutable state of one task, owned by the registry
#[derive(Debug)]
pub struct TaskRecord {
    pub(crate) task_id: TaskId,
    pub(crate) owner: OwnerId,
    pub(crate) spec: TaskSpec,
    pub(crate) status: TaskStatus,
    pub(crate) progress: Progress,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) last_activity_at: DateTime<Utc>,
    pub(crate) last_activity: Instant,
    pub(crate) cancel_requested: bool,
    /// Woken when `cancel_requested` is set
    pub(crate) cancel_signal: Arc<Notify>,
    pub(crate) runner: Option<RunnerHandle>,
}

impl TaskRecord {
    pub(crate) fn new(owner: OwnerId, spec: TaskSpec) -> Self {
        let now = Utc::now();
        Self {
            task_id: TaskId::new(),
            owner,
            spec,
            status: TaskStatus::Pending,
            progress: Progress::default(),
            created_at: now,
            last_activity_at: now,
            last_activity: Instant::now(),
            cancel_requested: false,
            cancel_signal: Arc::new(Notify::new()),
            runner: None,
        }
    }

    /// Set the cancel flag and wake anyone waiting on it
    pub(crate) fn request_cancel(&mut self) -> bool {
        let first = !self.cancel_requested;
        self.cancel_requested = true;
        self.cancel_signal.notify_waiters();
        first
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }

    pub(crate) fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.task_id,
            owner: self.owner,
            kind: self.spec.kind(),
            spec: self.spec.clone(),
            status: self.status,
            progress: self.progress,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            cancel_requested: self.cancel_requested,
        }
    }
}

/// Owned copy of a task record
///
/// Carries the durable fields a host needs to persist a record for crash
/// recovery (`task_id, owner, kind, status, progress, last_activity_at`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub owner: OwnerId,
    pub kind: TaskKind,
    pub spec: TaskSpec,
    pub status: TaskStatus,
    pub progress: Progress,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub cancel_requested: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_range_validation() {
        assert!(PageRange::new(0, 3).is_none());
        assert!(PageRange::new(5, 4).is_none());
        assert!(PageRange::all(0).is_none());

        let range = PageRange::new(3, 5).unwrap();
        assert_eq!(range.len(), 3);
        assert_eq!(range.source_indices().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn test_spec_kind() {
        let pdf = TaskSpec::PdfGeneration { pages: None };
        let poll = TaskSpec::PollCollection {
            expected_total: Some(3),
            auto_delete: true,
        };
        assert_eq!(pdf.kind(), TaskKind::PdfGeneration);
        assert_eq!(poll.kind(), TaskKind::PollCollection);
        assert_eq!(TaskSpec::QuizPosting { quizzes: 4 }.kind(), TaskKind::QuizPosting);
        assert_eq!(TaskKind::QuizPosting.to_string(), "quiz_posting");
    }

    #[test]
    fn test_spec_serialization_is_tagged() {
        let spec = TaskSpec::PollCollection {
            expected_total: None,
            auto_delete: false,
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["kind"], "poll_collection");
        assert_eq!(json["auto_delete"], false);
    }

    #[test]
    fn test_new_record_is_pending() {
        let record = TaskRecord::new(OwnerId(42), TaskSpec::PdfGeneration { pages: None });
        let snapshot = record.snapshot();

        assert_eq!(snapshot.status, TaskStatus::Pending);
        assert_eq!(snapshot.owner, OwnerId(42));
        assert_eq!(snapshot.progress, Progress::default());
        assert!(!snapshot.cancel_requested);
        assert_eq!(snapshot.created_at, snapshot.last_activity_at);
    }

    #[test]
    fn test_progress_display() {
        assert_eq!(Progress::new(3, 10).to_string(), "3/10");
        assert_eq!(Progress::new(4, 0).to_string(), "4");
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_uuid().get_version_num(), 7);
    }
}
