// TSS worker console
//
// Runs the task lifecycle core against a simulated rendering engine and
// takes chat-like commands on stdin. Every progress event is printed as the
// message the bot would send.

mod console;
mod engine;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tss_tasks::{
    ChannelSink, CompositeSink, ProgressSink, TaskConfig, TaskCoordinator, TracingSink,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::console::{render_event, Command, Console, HELP};
use crate::engine::{SimulatedEngine, SimulatedTransport};

#[derive(Parser, Debug)]
#[command(name = "tss-worker")]
#[command(about = "Task lifecycle console for PDF generation, quiz posting and poll collection")]
#[command(version)]
struct Cli {
    /// Tasks executing at the same time
    #[arg(long, env = "TSS_MAX_CONCURRENCY")]
    max_concurrency: Option<usize>,

    /// Waiting-list capacity
    #[arg(long, env = "TSS_MAX_QUEUE_SIZE")]
    queue_size: Option<usize>,

    /// Inactivity timeout in seconds
    #[arg(long, env = "TSS_TASK_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// Timeout sweep interval in seconds
    #[arg(long, env = "TSS_SWEEP_INTERVAL_SECS")]
    sweep_secs: Option<u64>,

    /// Simulated render time per page
    #[arg(long, env = "TSS_PAGE_DELAY_MS", default_value = "200")]
    page_delay_ms: u64,

    /// Make the engine fail on this 1-based page
    #[arg(long)]
    fail_page: Option<u32>,

    /// Simulated send time per quiz
    #[arg(long, default_value = "100")]
    quiz_send_ms: u64,

    /// Reject every Nth quiz sent
    #[arg(long)]
    reject_every: Option<u32>,

    /// Pages in the simulated document
    #[arg(long, default_value = "20")]
    document_pages: u32,
}

impl Cli {
    fn task_config(&self) -> TaskConfig {
        let mut config = TaskConfig::from_env();
        if let Some(max) = self.max_concurrency {
            config = config.with_max_concurrency(max);
        }
        if let Some(size) = self.queue_size {
            config = config.with_max_queue_size(size);
        }
        if let Some(secs) = self.timeout_secs {
            config = config.with_task_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.sweep_secs {
            config = config.with_sweep_interval(Duration::from_secs(secs));
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Logs go to stderr; stdout carries the bot messages
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL"))
        .unwrap_or_else(|_| "tss_tasks=debug,tss_worker=info".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.task_config();
    tracing::info!(?config, "tss-worker starting...");

    let (channel, mut events) = ChannelSink::new();
    let sinks: Vec<Arc<dyn ProgressSink>> = vec![Arc::new(channel), Arc::new(TracingSink)];
    let coordinator = Arc::new(
        TaskCoordinator::new(config, Arc::new(CompositeSink::new(sinks)))
            .context("invalid task configuration")?,
    );
    coordinator.start()?;

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{}", render_event(&event));
        }
    });

    let engine = Arc::new(SimulatedEngine::new(
        Duration::from_millis(cli.page_delay_ms),
        cli.fail_page,
    ));
    let transport = Arc::new(SimulatedTransport::new(
        Duration::from_millis(cli.quiz_send_ms),
        cli.reject_every,
    ));
    let mut console = Console::new(
        Arc::clone(&coordinator),
        engine,
        transport,
        cli.document_pages,
    );
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match Command::parse(&line) {
            Ok(Command::Quit) => break,
            Ok(command) => println!("{}", console.handle(command)),
            Err(e) => println!("{}", e),
        }
    }

    if let Err(e) = coordinator.shutdown().await {
        tracing::warn!("Shutdown incomplete: {}", e);
    }

    // Flush the final messages of cancelled tasks
    drop(console);
    drop(coordinator);
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        tracing::debug!("Printer still busy at exit");
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
