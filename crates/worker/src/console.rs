// Console command handling
//
// One command per line, mirroring the bot's chat commands. The console
// keeps the host-side handles the core does not own: poll collectors that
// answers are fed into, and pending page-range selections.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::oneshot;
use tss_tasks::{
    Cancellation, Job, OwnerId, OwnerStatus, PageRange, PageSelection, PdfJob, PollAnswer,
    PollCollector, PollJob, ProgressUpdate, Quiz, QuizPacing, QuizPostJob, QuizTransport,
    RenderingEngine, SinkEvent, TaskCoordinator, TaskId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Render a fixed page range
    Pdf { owner: OwnerId, range: PageRange },
    /// Start a PDF task and pick pages later
    PdfAsk { owner: OwnerId },
    /// Answer a pending page selection; `None` means all pages
    Pages {
        owner: OwnerId,
        range: Option<PageRange>,
    },
    Poll {
        owner: OwnerId,
        expected: Option<u32>,
    },
    Answer {
        owner: OwnerId,
        respondent: i64,
        options: Vec<u32>,
    },
    /// Post generated sample quizzes
    Quiz { owner: OwnerId, count: u32 },
    Stop { owner: OwnerId },
    Clear { owner: OwnerId },
    Cancel { owner: OwnerId },
    Status { owner: OwnerId },
    Stats,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,

    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid number: {0}")]
    Number(String),

    #[error("invalid page range {0}-{1}")]
    Range(u32, u32),
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut words = line.split_whitespace();
        let name = words.next().ok_or(ParseError::Empty)?;
        let args: Vec<&str> = words.collect();

        let command = match (name, args.as_slice()) {
            ("pdf", [owner, first, last]) => Command::Pdf {
                owner: owner_arg(owner)?,
                range: range_arg(first, last)?,
            },
            ("pdf", _) => return Err(ParseError::Usage("pdf <user> <first> <last>")),
            ("pdf-ask", [owner]) => Command::PdfAsk {
                owner: owner_arg(owner)?,
            },
            ("pdf-ask", _) => return Err(ParseError::Usage("pdf-ask <user>")),
            ("pages", [owner, "all"]) => Command::Pages {
                owner: owner_arg(owner)?,
                range: None,
            },
            ("pages", [owner, first, last]) => Command::Pages {
                owner: owner_arg(owner)?,
                range: Some(range_arg(first, last)?),
            },
            ("pages", _) => return Err(ParseError::Usage("pages <user> <first> <last> | pages <user> all")),
            ("poll", [owner]) => Command::Poll {
                owner: owner_arg(owner)?,
                expected: None,
            },
            ("poll", [owner, expected]) => Command::Poll {
                owner: owner_arg(owner)?,
                expected: Some(number(expected)?),
            },
            ("poll", _) => return Err(ParseError::Usage("poll <user> [expected]")),
            ("answer", [owner, respondent, options @ ..]) => Command::Answer {
                owner: owner_arg(owner)?,
                respondent: number(respondent)?,
                options: options.iter().map(|o| number(o)).collect::<Result<_, _>>()?,
            },
            ("answer", _) => return Err(ParseError::Usage("answer <user> <respondent> <option>...")),
            ("quiz", [owner, count]) => Command::Quiz {
                owner: owner_arg(owner)?,
                count: number(count)?,
            },
            ("quiz", _) => return Err(ParseError::Usage("quiz <user> <count>")),
            ("stop", [owner]) => Command::Stop {
                owner: owner_arg(owner)?,
            },
            ("clear", [owner]) => Command::Clear {
                owner: owner_arg(owner)?,
            },
            ("cancel", [owner]) => Command::Cancel {
                owner: owner_arg(owner)?,
            },
            ("status", [owner]) => Command::Status {
                owner: owner_arg(owner)?,
            },
            ("stop" | "clear" | "cancel" | "status", _) => {
                return Err(ParseError::Usage("<command> <user>"))
            }
            ("stats", []) => Command::Stats,
            ("help", _) => Command::Help,
            ("quit" | "exit", _) => Command::Quit,
            (other, _) => return Err(ParseError::Unknown(other.to_string())),
        };
        Ok(command)
    }
}

fn number<T: std::str::FromStr>(s: &str) -> Result<T, ParseError> {
    s.parse().map_err(|_| ParseError::Number(s.to_string()))
}

fn owner_arg(s: &str) -> Result<OwnerId, ParseError> {
    number::<i64>(s).map(OwnerId)
}

fn range_arg(first: &str, last: &str) -> Result<PageRange, ParseError> {
    let (first, last) = (number(first)?, number(last)?);
    PageRange::new(first, last).ok_or(ParseError::Range(first, last))
}

pub const HELP: &str = "\
commands:
  pdf <user> <first> <last>        render a page range
  pdf-ask <user>                   start a PDF task, choose pages afterwards
  pages <user> <first> <last>|all  answer the page selection
  poll <user> [expected]           collect poll answers
  answer <user> <respondent> <option>...
  quiz <user> <count>              post sample quizzes
  stop <user> | clear <user>       finish or reset a poll
  cancel <user> | status <user>
  stats | help | quit";

/// Host-side state behind the console
pub struct Console {
    coordinator: Arc<TaskCoordinator>,
    engine: Arc<dyn RenderingEngine>,
    transport: Arc<dyn QuizTransport>,
    pacing: QuizPacing,
    document_pages: u32,
    polls: HashMap<OwnerId, Arc<PollCollector>>,
    selections: HashMap<OwnerId, oneshot::Sender<PageRange>>,
}

impl Console {
    pub fn new(
        coordinator: Arc<TaskCoordinator>,
        engine: Arc<dyn RenderingEngine>,
        transport: Arc<dyn QuizTransport>,
        document_pages: u32,
    ) -> Self {
        Self {
            coordinator,
            engine,
            transport,
            pacing: QuizPacing::default(),
            document_pages,
            polls: HashMap::new(),
            selections: HashMap::new(),
        }
    }

    pub fn with_pacing(mut self, pacing: QuizPacing) -> Self {
        self.pacing = pacing;
        self
    }

    /// Execute a command and return the reply text
    pub fn handle(&mut self, command: Command) -> String {
        match command {
            Command::Pdf { owner, range } => {
                let job = PdfJob::for_range(Arc::clone(&self.engine), range);
                self.submit(owner, Box::new(job)).0
            }
            Command::PdfAsk { owner } => {
                let (tx, rx) = oneshot::channel();
                let job = PdfJob::new(Arc::clone(&self.engine), PageSelection::AwaitUser(rx));
                let (reply, accepted) = self.submit(owner, Box::new(job));
                if !accepted {
                    return reply;
                }
                self.selections.insert(owner, tx);
                format!(
                    "{}\nchoose pages: `pages {} all` ({} pages) or `pages {} <first> <last>`",
                    reply, owner, self.document_pages, owner
                )
            }
            Command::Pages { owner, range } => {
                let Some(tx) = self.selections.remove(&owner) else {
                    return "no page selection pending".to_string();
                };
                let range = match range.or_else(|| PageRange::all(self.document_pages)) {
                    Some(range) => range,
                    None => return "document has no pages".to_string(),
                };
                if range.last() > self.document_pages {
                    self.selections.insert(owner, tx);
                    return format!("document has only {} pages", self.document_pages);
                }
                match tx.send(range) {
                    Ok(()) => format!("selected pages {}-{}", range.first(), range.last()),
                    Err(_) => "the task is no longer waiting for pages".to_string(),
                }
            }
            Command::Poll { owner, expected } => {
                let collector = Arc::new(PollCollector::new(expected, true));
                let (reply, accepted) =
                    self.submit(owner, Box::new(PollJob::new(Arc::clone(&collector))));
                if accepted {
                    self.polls.insert(owner, collector);
                }
                reply
            }
            Command::Answer {
                owner,
                respondent,
                options,
            } => {
                let Some(collector) = self.live_poll(owner) else {
                    return "no poll collection for this user".to_string();
                };
                match collector.record_answer(respondent, PollAnswer::new(options)) {
                    Ok(received) => format!("answers: {}", received),
                    Err(e) => {
                        self.polls.remove(&owner);
                        e.to_string()
                    }
                }
            }
            Command::Quiz { owner, count } => {
                let job = QuizPostJob::new(Arc::clone(&self.transport), sample_quizzes(count))
                    .with_pacing(self.pacing.clone());
                self.submit(owner, Box::new(job)).0
            }
            Command::Stop { owner } => match self.live_poll(owner).cloned() {
                Some(collector) => {
                    self.polls.remove(&owner);
                    collector.stop();
                    "stopping collection".to_string()
                }
                None => "no poll collection for this user".to_string(),
            },
            Command::Clear { owner } => match self.live_poll(owner) {
                Some(collector) => {
                    collector.clear();
                    "answers cleared".to_string()
                }
                None => "no poll collection for this user".to_string(),
            },
            Command::Cancel { owner } => {
                self.selections.remove(&owner);
                match self.coordinator.cancel(owner) {
                    Cancellation::Dequeued(_) => "removed from the queue".to_string(),
                    Cancellation::Requested(_) => "cancelling...".to_string(),
                    Cancellation::NothingActive => "nothing to cancel".to_string(),
                }
            }
            Command::Status { owner } => match self.coordinator.status(owner) {
                OwnerStatus::Idle => "no active task".to_string(),
                OwnerStatus::Queued { position } => format!("#{} in queue", position),
                OwnerStatus::Active(task) => format!(
                    "{} {} {}{}",
                    task.kind,
                    task.status,
                    task.progress,
                    if task.cancel_requested { " (cancelling)" } else { "" }
                ),
            },
            Command::Stats => {
                let stats = self.coordinator.stats();
                format!(
                    "running {}/{}, waiting {}/{}",
                    stats.running, stats.max_concurrency, stats.waiting, stats.capacity
                )
            }
            Command::Help => HELP.to_string(),
            Command::Quit => String::new(),
        }
    }

    /// The owner's poll collector, forgetting it once its task has ended
    fn live_poll(&mut self, owner: OwnerId) -> Option<&Arc<PollCollector>> {
        if self.polls.get(&owner).is_some_and(|c| c.is_closed()) {
            self.polls.remove(&owner);
        }
        self.polls.get(&owner)
    }

    /// Reply text and whether the job was accepted
    fn submit(&self, owner: OwnerId, job: Box<dyn Job>) -> (String, bool) {
        match self.coordinator.submit(owner, job) {
            Ok(enqueued) if enqueued.position == 0 => {
                (format!("started {}", short(enqueued.task_id)), true)
            }
            Ok(enqueued) => (
                format!("queued {} at #{}", short(enqueued.task_id), enqueued.position),
                true,
            ),
            Err(e) => (format!("rejected: {}", e), false),
        }
    }
}

fn sample_quizzes(count: u32) -> Vec<Quiz> {
    (1..=count)
        .map(|n| {
            let options = (1..=4).map(|o| format!("{} x {}", n, o)).collect();
            Quiz::new(format!("Sample question {}", n), options, n % 4)
                .with_explanation(format!("{} x {} = {}", n, n % 4 + 1, n * (n % 4 + 1)))
        })
        .collect()
}

fn short(task_id: TaskId) -> String {
    task_id.to_string().chars().take(8).collect()
}

/// One line of console output per sink event
pub fn render_event(event: &SinkEvent) -> String {
    let id = short(event.task_id());
    match event {
        SinkEvent::Progress { update, .. } => match update {
            ProgressUpdate::Queued { position } => format!("[{}] You are #{} in queue", id, position),
            ProgressUpdate::Started => format!("[{}] Started", id),
            ProgressUpdate::Progress { current, total } if *total > 0 => {
                format!("[{}] Processing page {}/{}", id, current, total)
            }
            ProgressUpdate::Progress { current, .. } => format!("[{}] Processed {}", id, current),
            ProgressUpdate::PollCount {
                received,
                expected: Some(expected),
            } => format!("[{}] Answers received: {}/{}", id, received, expected),
            ProgressUpdate::PollCount { received, .. } => {
                format!("[{}] Answers received: {}", id, received)
            }
            ProgressUpdate::AwaitingInput => format!("[{}] Waiting for your input", id),
            ProgressUpdate::DeletePrompt { respondent } => {
                format!("[{}] (prompt for {} deleted)", id, respondent)
            }
        },
        SinkEvent::Final { summary, .. } => {
            format!("[{}] user {}: {}", id, summary.owner, summary.message())
        }
    }
}
