//! PDF generation job

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::debug;

use super::{Job, JobOutput, TaskContext};
use crate::error::{JobError, RenderError};
use crate::task::{PageRange, TaskSpec};

/// One rendered page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    /// 0-based index in the source document
    pub source_index: u32,
    pub data: Vec<u8>,
}

/// Renders pages of the source document
#[async_trait]
pub trait RenderingEngine: Send + Sync {
    async fn render_page(&self, source_index: u32) -> Result<RenderedPage, RenderError>;
}

/// How the page range is chosen
#[derive(Debug)]
pub enum PageSelection {
    /// Known up front
    Range(PageRange),
    /// The user picks it after the task started; the task waits in
    /// AwaitingInput until a range arrives
    AwaitUser(oneshot::Receiver<PageRange>),
}

/// Renders every page of a range, one checkpoint per page
pub struct PdfJob {
    engine: Arc<dyn RenderingEngine>,
    selection: PageSelection,
    output: Option<oneshot::Sender<Vec<RenderedPage>>>,
}

impl PdfJob {
    pub fn new(engine: Arc<dyn RenderingEngine>, selection: PageSelection) -> Self {
        Self {
            engine,
            selection,
            output: None,
        }
    }

    /// Render a fixed range
    pub fn for_range(engine: Arc<dyn RenderingEngine>, pages: PageRange) -> Self {
        Self::new(engine, PageSelection::Range(pages))
    }

    /// Deliver the rendered pages here on success
    pub fn with_output(mut self, output: oneshot::Sender<Vec<RenderedPage>>) -> Self {
        self.output = Some(output);
        self
    }
}

#[async_trait]
impl Job for PdfJob {
    fn spec(&self) -> TaskSpec {
        let pages = match &self.selection {
            PageSelection::Range(range) => Some(*range),
            PageSelection::AwaitUser(_) => None,
        };
        TaskSpec::PdfGeneration { pages }
    }

    async fn run(self: Box<Self>, ctx: TaskContext) -> Result<JobOutput, JobError> {
        let Self {
            engine,
            selection,
            output,
        } = *self;

        let range = match selection {
            PageSelection::Range(range) => range,
            PageSelection::AwaitUser(rx) => ctx
                .await_input(rx)
                .await?
                .map_err(|_| JobError::transport("page selection was abandoned"))?,
        };

        let total = range.len();
        debug!(task_id = %ctx.task_id(), first = range.first(), last = range.last(), "Rendering pages");

        // Establishes the total and catches a cancel issued while waiting
        ctx.checkpoint(0, total)?;

        let mut pages = Vec::with_capacity(total as usize);
        for (done, index) in range.source_indices().enumerate() {
            let page = engine.render_page(index).await?;
            pages.push(page);
            ctx.checkpoint(done as u32 + 1, total)?;
        }

        let bytes: usize = pages.iter().map(|p| p.data.len()).sum();
        let detail = format!(
            "pages {}-{} ({} bytes)",
            range.first(),
            range.last(),
            bytes
        );

        if let Some(output) = output {
            if output.send(pages).is_err() {
                debug!(task_id = %ctx.task_id(), "Rendered pages receiver dropped");
            }
        }

        Ok(JobOutput::with_detail(detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskConfig;
    use crate::registry::TaskRegistry;
    use crate::runner::JobRunner;
    use crate::sink::{ChannelSink, FinalSummary, SinkEvent};
    use crate::task::{OwnerId, TaskStatus};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct FakeEngine {
        fail_on: Option<u32>,
    }

    #[async_trait]
    impl RenderingEngine for FakeEngine {
        async fn render_page(&self, source_index: u32) -> Result<RenderedPage, RenderError> {
            if Some(source_index) == self.fail_on {
                return Err(RenderError::page(source_index + 1, "bad xref table"));
            }
            Ok(RenderedPage {
                source_index,
                data: vec![0; 10],
            })
        }
    }

    fn start(job: PdfJob) -> (Arc<TaskRegistry>, UnboundedReceiver<SinkEvent>, tokio::task::JoinHandle<()>) {
        let (sink, rx) = ChannelSink::new();
        let registry = Arc::new(TaskRegistry::new(Arc::new(sink), Duration::from_secs(300)));
        let task = registry.admit(OwnerId(1), job.spec()).unwrap();
        let handle = JobRunner::spawn(
            Arc::clone(&registry),
            task.task_id,
            Box::new(job),
            Arc::new(TaskConfig::default()),
        )
        .unwrap();
        (registry, rx, handle)
    }

    fn final_of(rx: &mut UnboundedReceiver<SinkEvent>) -> FinalSummary {
        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            if let SinkEvent::Final { summary, .. } = event {
                last = Some(summary);
            }
        }
        last.expect("no final message")
    }

    #[tokio::test]
    async fn test_renders_requested_range() {
        let engine = Arc::new(FakeEngine { fail_on: None });
        let (tx, rx_pages) = oneshot::channel();
        let job = PdfJob::for_range(engine, PageRange::new(2, 4).unwrap()).with_output(tx);

        let (_registry, mut rx, handle) = start(job);
        handle.await.unwrap();

        let pages = rx_pages.await.unwrap();
        assert_eq!(
            pages.iter().map(|p| p.source_index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        let summary = final_of(&mut rx);
        assert_eq!(summary.status, TaskStatus::Completed);
        assert_eq!(summary.progress.to_string(), "3/3");
        assert_eq!(summary.detail.as_deref(), Some("pages 2-4 (30 bytes)"));
    }

    #[tokio::test]
    async fn test_render_error_fails_with_cause() {
        let engine = Arc::new(FakeEngine { fail_on: Some(2) });
        let job = PdfJob::for_range(engine, PageRange::new(1, 5).unwrap());

        let (_registry, mut rx, handle) = start(job);
        handle.await.unwrap();

        let summary = final_of(&mut rx);
        assert_eq!(summary.status, TaskStatus::Failed);
        assert_eq!(summary.progress.to_string(), "2/5");
        assert!(summary.detail.unwrap().contains("page 3"));
    }

    #[tokio::test]
    async fn test_deferred_selection() {
        let engine = Arc::new(FakeEngine { fail_on: None });
        let (select, selection) = oneshot::channel();
        let job = PdfJob::new(engine, PageSelection::AwaitUser(selection));
        assert_eq!(job.spec(), TaskSpec::PdfGeneration { pages: None });

        let (registry, mut rx, handle) = start(job);
        for _ in 0..16 {
            if registry.active_for(OwnerId(1)).unwrap().status == TaskStatus::AwaitingInput {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            registry.active_for(OwnerId(1)).unwrap().status,
            TaskStatus::AwaitingInput
        );

        select.send(PageRange::new(1, 2).unwrap()).unwrap();
        handle.await.unwrap();
        assert_eq!(final_of(&mut rx).status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_abandoned_selection_fails() {
        let engine = Arc::new(FakeEngine { fail_on: None });
        let (select, selection) = oneshot::channel::<PageRange>();
        let (_registry, mut rx, handle) = start(PdfJob::new(engine, PageSelection::AwaitUser(selection)));

        drop(select);
        handle.await.unwrap();

        let summary = final_of(&mut rx);
        assert_eq!(summary.status, TaskStatus::Failed);
        assert!(summary.detail.unwrap().contains("abandoned"));
    }
}
