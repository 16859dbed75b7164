// Simulated rendering engine and chat transport
//
// Stand in for the real document renderer and the chat API. Both can be
// told to fail so failure handling can be tried from the console.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tss_tasks::{
    Quiz, QuizTransport, RenderError, RenderedPage, RenderingEngine, TransportError,
};

#[derive(Debug, Clone)]
pub struct SimulatedEngine {
    page_delay: Duration,
    /// 1-based page that fails to render
    fail_page: Option<u32>,
}

impl SimulatedEngine {
    pub fn new(page_delay: Duration, fail_page: Option<u32>) -> Self {
        Self {
            page_delay,
            fail_page,
        }
    }
}

#[async_trait]
impl RenderingEngine for SimulatedEngine {
    async fn render_page(&self, source_index: u32) -> Result<RenderedPage, RenderError> {
        tokio::time::sleep(self.page_delay).await;

        let page = source_index + 1;
        if self.fail_page == Some(page) {
            return Err(RenderError::page(page, "simulated rendering failure"));
        }

        Ok(RenderedPage {
            source_index,
            data: format!("%PDF page {}", page).into_bytes(),
        })
    }
}

/// Accepts quizzes, rejecting every `reject_every`-th one
#[derive(Debug)]
pub struct SimulatedTransport {
    send_delay: Duration,
    reject_every: Option<u32>,
    sent: AtomicU32,
}

impl SimulatedTransport {
    pub fn new(send_delay: Duration, reject_every: Option<u32>) -> Self {
        Self {
            send_delay,
            reject_every: reject_every.filter(|n| *n > 0),
            sent: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl QuizTransport for SimulatedTransport {
    async fn send_quiz(&self, quiz: &Quiz) -> Result<(), TransportError> {
        tokio::time::sleep(self.send_delay).await;

        let number = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        if self.reject_every.is_some_and(|n| number % n == 0) {
            return Err(TransportError::Rejected(format!(
                "simulated rejection of {:?}",
                quiz.question
            )));
        }
        tracing::debug!(number, question = %quiz.question, "Quiz posted");
        Ok(())
    }
}
