//! End-to-end lifecycle scenarios through the coordinator
//!
//! Every scenario observes the system the way a chat user would: through
//! the events a `ChannelSink` receives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{oneshot, Notify};
use tokio_test::{assert_err, assert_ok};
use tss_tasks::prelude::*;
use tss_tasks::{PollError, Progress, TaskRegistry, TaskSpec};

// ============================================================================
// Helpers
// ============================================================================

fn coordinator(config: TaskConfig) -> (TaskCoordinator, UnboundedReceiver<SinkEvent>) {
    let (sink, rx) = ChannelSink::new();
    let coordinator = TaskCoordinator::new(config, Arc::new(sink)).unwrap();
    coordinator.start().unwrap();
    (coordinator, rx)
}

/// Wait for the final message of `task_id`, collecting the updates before it
async fn until_final(
    rx: &mut UnboundedReceiver<SinkEvent>,
    task_id: TaskId,
) -> (Vec<ProgressUpdate>, FinalSummary) {
    let mut updates = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("timed out waiting for final message")
            .expect("sink closed");
        match event {
            SinkEvent::Progress { task_id: id, update } if id == task_id => updates.push(update),
            SinkEvent::Final { task_id: id, summary } if id == task_id => {
                return (updates, summary)
            }
            _ => {}
        }
    }
}

fn drain(rx: &mut UnboundedReceiver<SinkEvent>) -> Vec<SinkEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn queued_positions(events: &[SinkEvent], task_id: TaskId) -> Vec<usize> {
    events
        .iter()
        .filter_map(|event| match event {
            SinkEvent::Progress {
                task_id: id,
                update: ProgressUpdate::Queued { position },
            } if *id == task_id => Some(*position),
            _ => None,
        })
        .collect()
}

async fn settle<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held");
}

/// Never checkpoints; only the sweep can end it
struct Stalled;

#[async_trait]
impl Job for Stalled {
    fn spec(&self) -> TaskSpec {
        TaskSpec::PdfGeneration { pages: None }
    }

    async fn run(self: Box<Self>, _ctx: TaskContext) -> Result<JobOutput, JobError> {
        std::future::pending::<()>().await;
        Ok(JobOutput::default())
    }
}

/// Completes when its gate fires
struct Gated(oneshot::Receiver<()>);

#[async_trait]
impl Job for Gated {
    fn spec(&self) -> TaskSpec {
        TaskSpec::PdfGeneration { pages: None }
    }

    async fn run(self: Box<Self>, ctx: TaskContext) -> Result<JobOutput, JobError> {
        tokio::select! {
            _ = ctx.cancelled() => Err(JobError::Cancelled),
            _ = self.0 => Ok(JobOutput::default()),
        }
    }
}

struct Exploding;

#[async_trait]
impl Job for Exploding {
    fn spec(&self) -> TaskSpec {
        TaskSpec::PdfGeneration { pages: None }
    }

    async fn run(self: Box<Self>, ctx: TaskContext) -> Result<JobOutput, JobError> {
        ctx.checkpoint(1, 4)?;
        let pages: Vec<u32> = Vec::new();
        ctx.checkpoint(pages[3], 4)?;
        Ok(JobOutput::default())
    }
}

/// Blocks while rendering `hold_at` until released
struct HeldEngine {
    hold_at: u32,
    entered: Notify,
    release: Notify,
}

impl HeldEngine {
    fn new(hold_at: u32) -> Arc<Self> {
        Arc::new(Self {
            hold_at,
            entered: Notify::new(),
            release: Notify::new(),
        })
    }
}

#[async_trait]
impl RenderingEngine for HeldEngine {
    async fn render_page(&self, source_index: u32) -> Result<RenderedPage, RenderError> {
        if source_index == self.hold_at {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(RenderedPage {
            source_index,
            data: vec![1, 2, 3],
        })
    }
}

// ============================================================================
// Admission
// ============================================================================

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn concurrent_admits_from_one_owner_admit_exactly_one() {
    let (sink, _rx) = ChannelSink::new();
    let registry = Arc::new(TaskRegistry::new(Arc::new(sink), Duration::from_secs(300)));

    let attempts: Vec<_> = (0..32)
        .map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .admit(OwnerId(5), TaskSpec::PdfGeneration { pages: None })
                    .is_ok()
            })
        })
        .collect();

    let mut admitted = 0;
    for attempt in attempts {
        if attempt.await.unwrap() {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 1);
    assert_eq!(registry.active_tasks().len(), 1);
}

#[test_log::test(tokio::test)]
async fn finished_task_cannot_be_revived() {
    let (coordinator, mut rx) = coordinator(TaskConfig::default());
    let (done, gate) = oneshot::channel();

    let task = assert_ok!(coordinator.submit(OwnerId(1), Box::new(Gated(gate))));
    done.send(()).unwrap();
    let (_, summary) = until_final(&mut rx, task.task_id).await;
    assert_eq!(summary.status, TaskStatus::Completed);

    let registry = coordinator.registry();
    for status in [TaskStatus::Running, TaskStatus::Failed, TaskStatus::TimedOut] {
        let err = assert_err!(registry.advance(task.task_id, status));
        assert!(err.is_benign(), "unexpected {:?}", err);
    }
    assert!(!registry.report_progress(task.task_id, 9, 10));

    // No second final message, no lingering record
    tokio::task::yield_now().await;
    assert!(drain(&mut rx).is_empty());
    assert_eq!(coordinator.status(OwnerId(1)), OwnerStatus::Idle);
}

// ============================================================================
// Queue
// ============================================================================

#[test_log::test(tokio::test)]
async fn waiters_move_up_by_one_when_the_earliest_task_completes() {
    let config = TaskConfig::default().with_max_concurrency(2);
    let (coordinator, mut rx) = coordinator(config);

    let mut gates = Vec::new();
    let mut tasks = Vec::new();
    for owner in 1..=5 {
        let (gate, rx_gate) = oneshot::channel();
        gates.push(gate);
        tasks.push(assert_ok!(coordinator.submit(OwnerId(owner), Box::new(Gated(rx_gate)))));
    }

    let positions: Vec<usize> = tasks.iter().map(|t| t.position).collect();
    assert_eq!(positions, vec![0, 0, 1, 2, 3]);

    let events = drain(&mut rx);
    for (task, expected) in tasks[2..].iter().zip(1..) {
        assert_eq!(queued_positions(&events, task.task_id), vec![expected]);
    }

    // Complete the earliest admitted task
    gates.remove(0).send(()).unwrap();
    let (_, summary) = until_final(&mut rx, tasks[0].task_id).await;
    assert_eq!(summary.status, TaskStatus::Completed);

    settle(|| coordinator.position(OwnerId(3)) == Some(0)).await;
    assert_eq!(coordinator.position(OwnerId(4)), Some(1));
    assert_eq!(coordinator.position(OwnerId(5)), Some(2));

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        SinkEvent::Progress { task_id, update: ProgressUpdate::Started } if *task_id == tasks[2].task_id
    )));
    assert_eq!(queued_positions(&events, tasks[3].task_id), vec![1]);
    assert_eq!(queued_positions(&events, tasks[4].task_id), vec![2]);

    coordinator.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn queue_rejects_when_full() {
    let config = TaskConfig::default().with_max_queue_size(1);
    let (coordinator, _rx) = coordinator(config);

    coordinator.submit(OwnerId(1), Box::new(Stalled)).unwrap();
    coordinator.submit(OwnerId(2), Box::new(Stalled)).unwrap();

    let err = assert_err!(coordinator.submit(OwnerId(3), Box::new(Stalled)));
    assert_eq!(err, TaskError::QueueFull { capacity: 1 });
    assert_eq!(
        coordinator.stats(),
        QueueStats {
            running: 1,
            waiting: 1,
            capacity: 1,
            max_concurrency: 1
        }
    );
}

// ============================================================================
// Timeouts
// ============================================================================

#[tokio::test(start_paused = true)]
async fn stalled_task_times_out_and_the_waiter_starts() {
    let config = TaskConfig::default()
        .with_max_concurrency(1)
        .with_task_timeout(Duration::from_secs(5))
        .with_sweep_interval(Duration::from_secs(1));
    let (coordinator, mut rx) = coordinator(config);

    let a = coordinator.submit(OwnerId(1), Box::new(Stalled)).unwrap();
    let b = coordinator.submit(OwnerId(2), Box::new(Stalled)).unwrap();
    assert_eq!(a.position, 0);
    assert_eq!(b.position, 1);
    assert_eq!(
        coordinator.registry().get(a.task_id).unwrap().status,
        TaskStatus::Running
    );

    tokio::time::sleep(Duration::from_secs(7)).await;

    let (_, summary) = until_final(&mut rx, a.task_id).await;
    assert_eq!(summary.status, TaskStatus::TimedOut);
    assert!(summary.message().starts_with("Timed out"));

    // A's slot is free immediately, B runs
    assert_eq!(coordinator.status(OwnerId(1)), OwnerStatus::Idle);
    assert_eq!(coordinator.position(OwnerId(2)), Some(0));
    assert!(matches!(
        coordinator.status(OwnerId(2)),
        OwnerStatus::Active(TaskSnapshot { status: TaskStatus::Running, .. })
    ));

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        SinkEvent::Progress { task_id, update: ProgressUpdate::Started } if *task_id == b.task_id
    )));

    // A can start over right away
    assert_ok!(coordinator.submit(OwnerId(1), Box::new(Stalled)));
}

#[tokio::test(start_paused = true)]
async fn user_who_never_picks_pages_times_out() {
    let config = TaskConfig::default()
        .with_task_timeout(Duration::from_secs(5))
        .with_sweep_interval(Duration::from_secs(1));
    let (coordinator, mut rx) = coordinator(config);

    let engine = HeldEngine::new(u32::MAX);
    let (_select, selection) = oneshot::channel();
    let job = PdfJob::new(engine, PageSelection::AwaitUser(selection));
    let task = coordinator.submit(OwnerId(1), Box::new(job)).unwrap();

    let (updates, summary) = until_final(&mut rx, task.task_id).await;
    assert!(updates.contains(&ProgressUpdate::AwaitingInput));
    assert_eq!(summary.status, TaskStatus::TimedOut);
}

// ============================================================================
// Cancellation and failures
// ============================================================================

#[test_log::test(tokio::test)]
async fn cancel_mid_document_keeps_partial_progress() {
    let (coordinator, mut rx) = coordinator(TaskConfig::default());

    // Hold page 3 (source index 2) while the user cancels
    let engine = HeldEngine::new(2);
    let job = PdfJob::for_range(engine.clone(), PageRange::new(1, 10).unwrap());
    let task = coordinator.submit(OwnerId(1), Box::new(job)).unwrap();

    engine.entered.notified().await;
    assert!(matches!(
        coordinator.cancel(OwnerId(1)),
        Cancellation::Requested(TaskSnapshot { cancel_requested: true, .. })
    ));
    engine.release.notify_one();

    let (updates, summary) = until_final(&mut rx, task.task_id).await;
    assert_eq!(summary.status, TaskStatus::Cancelled);
    assert_eq!(summary.progress, Progress::new(3, 10));
    assert_eq!(summary.message(), "Cancelled at 3/10");

    let pages: Vec<u32> = updates
        .iter()
        .filter_map(|u| match u {
            ProgressUpdate::Progress { current, .. } => Some(*current),
            _ => None,
        })
        .collect();
    assert_eq!(pages, vec![1, 2, 3]);
    assert_eq!(coordinator.status(OwnerId(1)), OwnerStatus::Idle);
}

#[test_log::test(tokio::test)]
async fn cancelling_a_waiter_removes_it_at_once() {
    let (coordinator, mut rx) = coordinator(TaskConfig::default());

    coordinator.submit(OwnerId(1), Box::new(Stalled)).unwrap();
    let b = coordinator.submit(OwnerId(2), Box::new(Stalled)).unwrap();

    assert_eq!(coordinator.cancel(OwnerId(2)), Cancellation::Dequeued(b.task_id));
    let (_, summary) = until_final(&mut rx, b.task_id).await;
    assert_eq!(summary.status, TaskStatus::Cancelled);
    assert_eq!(coordinator.position(OwnerId(2)), None);
    assert_eq!(coordinator.stats().waiting, 0);
}

#[test_log::test(tokio::test)]
async fn panicking_job_fails_and_frees_the_queue() {
    let (coordinator, mut rx) = coordinator(TaskConfig::default());

    let a = coordinator.submit(OwnerId(1), Box::new(Exploding)).unwrap();
    let (done, gate) = oneshot::channel();
    let b = coordinator.submit(OwnerId(2), Box::new(Gated(gate))).unwrap();
    assert_eq!(b.position, 1);

    let (_, summary) = until_final(&mut rx, a.task_id).await;
    assert_eq!(summary.status, TaskStatus::Failed);
    assert_eq!(summary.progress, Progress::new(1, 4));
    assert!(summary.detail.is_some());

    settle(|| coordinator.position(OwnerId(2)) == Some(0)).await;
    done.send(()).unwrap();
    let (_, summary) = until_final(&mut rx, b.task_id).await;
    assert_eq!(summary.status, TaskStatus::Completed);
}

#[test_log::test(tokio::test)]
async fn render_error_fails_with_its_cause() {
    struct Broken;

    #[async_trait]
    impl RenderingEngine for Broken {
        async fn render_page(&self, source_index: u32) -> Result<RenderedPage, RenderError> {
            Err(RenderError::page(source_index + 1, "unsupported font"))
        }
    }

    let (coordinator, mut rx) = coordinator(TaskConfig::default());
    let job = PdfJob::for_range(Arc::new(Broken), PageRange::new(4, 6).unwrap());
    let task = coordinator.submit(OwnerId(1), Box::new(job)).unwrap();

    let (_, summary) = until_final(&mut rx, task.task_id).await;
    assert_eq!(summary.status, TaskStatus::Failed);
    assert_eq!(
        summary.detail.as_deref(),
        Some("Could not process page 4: unsupported font")
    );
}

// ============================================================================
// Polls
// ============================================================================

#[test_log::test(tokio::test)]
async fn repeated_answer_counts_once() {
    let (coordinator, mut rx) = coordinator(TaskConfig::default());

    let collector = Arc::new(PollCollector::new(Some(3), true));
    let task = coordinator
        .submit(OwnerId(1), Box::new(PollJob::new(Arc::clone(&collector))))
        .unwrap();

    assert_eq!(collector.record_answer(77, PollAnswer::new(vec![0])), Ok(1));
    assert_eq!(collector.record_answer(77, PollAnswer::new(vec![2])), Ok(1));
    settle(|| {
        coordinator
            .registry()
            .get(task.task_id)
            .is_some_and(|t| t.progress.current == 1)
    })
    .await;
    collector.stop();

    let (updates, summary) = until_final(&mut rx, task.task_id).await;
    assert_eq!(summary.status, TaskStatus::Completed);
    assert_eq!(
        summary.poll,
        Some(PollSummary {
            success: 1,
            failed: 0,
            total: 1
        })
    );
    assert_eq!(collector.answers(), vec![(77, PollAnswer::new(vec![2]))]);
    assert!(updates.contains(&ProgressUpdate::DeletePrompt { respondent: 77 }));
    assert!(updates.contains(&ProgressUpdate::PollCount {
        received: 1,
        expected: Some(3)
    }));

    assert_eq!(
        collector.record_answer(78, PollAnswer::new(vec![1])),
        Err(PollError::Closed)
    );
}

#[test_log::test(tokio::test)]
async fn poll_completes_when_expected_total_is_reached() {
    let (coordinator, mut rx) = coordinator(TaskConfig::default());

    let collector = Arc::new(PollCollector::new(Some(2), false).with_option_count(3));
    let task = coordinator
        .submit(OwnerId(1), Box::new(PollJob::new(Arc::clone(&collector))))
        .unwrap();

    collector.record_answer(1, PollAnswer::new(vec![1])).unwrap();
    collector.record_answer(2, PollAnswer::new(vec![9])).unwrap();

    let (updates, summary) = until_final(&mut rx, task.task_id).await;
    assert_eq!(
        summary.poll,
        Some(PollSummary {
            success: 1,
            failed: 1,
            total: 2
        })
    );
    assert!(!updates
        .iter()
        .any(|u| matches!(u, ProgressUpdate::DeletePrompt { .. })));
}

#[test_log::test(tokio::test)]
async fn cancelled_poll_reports_no_summary() {
    let (coordinator, mut rx) = coordinator(TaskConfig::default());

    let collector = Arc::new(PollCollector::new(None, false));
    let task = coordinator
        .submit(OwnerId(1), Box::new(PollJob::new(Arc::clone(&collector))))
        .unwrap();
    collector.record_answer(1, PollAnswer::new(vec![0])).unwrap();

    coordinator.cancel(OwnerId(1));

    let (_, summary) = until_final(&mut rx, task.task_id).await;
    assert_eq!(summary.status, TaskStatus::Cancelled);
    assert!(summary.poll.is_none());

    // The session ended with its task
    assert!(collector.is_closed());
    assert_eq!(
        collector.record_answer(9, PollAnswer::new(vec![1])),
        Err(PollError::Closed)
    );
}

#[tokio::test(start_paused = true)]
async fn unanswered_poll_times_out_and_stops_accepting_answers() {
    let config = TaskConfig::default()
        .with_task_timeout(Duration::from_secs(5))
        .with_sweep_interval(Duration::from_secs(1));
    let (coordinator, mut rx) = coordinator(config);

    let collector = Arc::new(PollCollector::new(Some(3), false));
    let task = coordinator
        .submit(OwnerId(1), Box::new(PollJob::new(Arc::clone(&collector))))
        .unwrap();

    let (_, summary) = until_final(&mut rx, task.task_id).await;
    assert_eq!(summary.status, TaskStatus::TimedOut);
    assert_eq!(coordinator.status(OwnerId(1)), OwnerStatus::Idle);

    // The aborted job closes its session once the runtime drops it
    settle(|| collector.is_closed()).await;
    assert_eq!(
        collector.record_answer(1, PollAnswer::new(vec![0])),
        Err(PollError::Closed)
    );
}

#[test_log::test(tokio::test)]
async fn poll_counts_are_reported_when_answers_arrive_in_batches() {
    let config = TaskConfig::default().with_poll_progress_every(2);
    let (coordinator, mut rx) = coordinator(config);

    let collector = Arc::new(PollCollector::new(None, false));
    let task = coordinator
        .submit(OwnerId(1), Box::new(PollJob::new(Arc::clone(&collector))))
        .unwrap();
    let progress_is = |n: u32| {
        coordinator
            .registry()
            .get(task.task_id)
            .is_some_and(|t| t.progress.current == n)
    };

    for respondent in 1..=3 {
        collector.record_answer(respondent, PollAnswer::new(vec![0])).unwrap();
    }
    settle(|| progress_is(3)).await;
    for respondent in 4..=5 {
        collector.record_answer(respondent, PollAnswer::new(vec![1])).unwrap();
    }
    settle(|| progress_is(5)).await;
    collector.stop();

    let (updates, summary) = until_final(&mut rx, task.task_id).await;
    let counts: Vec<u32> = updates
        .iter()
        .filter_map(|u| match u {
            ProgressUpdate::PollCount { received, .. } => Some(*received),
            _ => None,
        })
        .collect();
    assert_eq!(counts, vec![3, 5]);
    assert_eq!(summary.poll.map(|p| p.total), Some(5));
}

#[test_log::test(tokio::test)]
async fn poll_sends_a_final_count_below_the_granularity() {
    let config = TaskConfig::default().with_poll_progress_every(10);
    let (coordinator, mut rx) = coordinator(config);

    let collector = Arc::new(PollCollector::new(None, false));
    let task = coordinator
        .submit(OwnerId(1), Box::new(PollJob::new(Arc::clone(&collector))))
        .unwrap();
    collector.record_answer(1, PollAnswer::new(vec![0])).unwrap();
    collector.record_answer(2, PollAnswer::new(vec![0])).unwrap();
    collector.stop();

    let (updates, _) = until_final(&mut rx, task.task_id).await;
    let counts: Vec<&ProgressUpdate> = updates
        .iter()
        .filter(|u| matches!(u, ProgressUpdate::PollCount { .. }))
        .collect();
    assert_eq!(
        counts,
        vec![&ProgressUpdate::PollCount {
            received: 2,
            expected: None
        }]
    );
}

// ============================================================================
// Shutdown
// ============================================================================

#[test_log::test(tokio::test)]
async fn shutdown_cancels_running_and_waiting_tasks() {
    let config = TaskConfig::default().with_shutdown_timeout(Duration::from_secs(5));
    let (coordinator, mut rx) = coordinator(config);

    let (_keep, gate) = oneshot::channel();
    let a = coordinator.submit(OwnerId(1), Box::new(Gated(gate))).unwrap();
    let b = coordinator.submit(OwnerId(2), Box::new(Stalled)).unwrap();

    assert_ok!(coordinator.shutdown().await);

    let events = drain(&mut rx);
    let finals: Vec<(TaskId, TaskStatus)> = events
        .iter()
        .filter_map(|e| match e {
            SinkEvent::Final { task_id, summary } => Some((*task_id, summary.status)),
            _ => None,
        })
        .collect();
    assert!(finals.contains(&(a.task_id, TaskStatus::Cancelled)));
    assert!(finals.contains(&(b.task_id, TaskStatus::Cancelled)));
    assert!(coordinator.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_gives_up_on_stuck_tasks() {
    let config = TaskConfig::default().with_shutdown_timeout(Duration::from_secs(1));
    let (coordinator, _rx) = coordinator(config);

    coordinator.submit(OwnerId(1), Box::new(Stalled)).unwrap();

    let err = coordinator.shutdown().await.unwrap_err();
    assert!(matches!(err, CoordinatorError::ShutdownTimeout { remaining: 1 }));
}
