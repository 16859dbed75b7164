//! Task core configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// Configuration for the registry, queue and runners
///
/// The inactivity timeout and the progress granularities are product
/// parameters; nothing in the core hardcodes them.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use tss_tasks::TaskConfig;
///
/// let config = TaskConfig::default()
///     .with_max_concurrency(2)
///     .with_task_timeout(Duration::from_secs(120));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskConfig {
    /// Tasks executing at the same time
    pub max_concurrency: usize,

    /// Waiting-list capacity
    pub max_queue_size: usize,

    /// Inactivity age after which the sweep forces TimedOut
    #[serde(with = "duration_millis")]
    pub task_timeout: Duration,

    /// How often the sweep runs
    #[serde(with = "duration_millis")]
    pub sweep_interval: Duration,

    /// PDF jobs emit one progress update per this many pages
    pub progress_every: u32,

    /// Poll jobs emit one count update per this many submissions
    pub poll_progress_every: u32,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            max_queue_size: 20,
            task_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            progress_every: 1,
            poll_progress_every: 1,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl TaskConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from `TSS_*` environment variables
    ///
    /// Missing or unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            max_concurrency: env_parse("TSS_MAX_CONCURRENCY")
                .unwrap_or(defaults.max_concurrency)
                .max(1),
            max_queue_size: env_parse("TSS_MAX_QUEUE_SIZE").unwrap_or(defaults.max_queue_size),
            task_timeout: env_parse("TSS_TASK_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.task_timeout),
            sweep_interval: env_parse("TSS_SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            progress_every: env_parse("TSS_PROGRESS_EVERY").unwrap_or(defaults.progress_every),
            poll_progress_every: env_parse("TSS_POLL_PROGRESS_EVERY")
                .unwrap_or(defaults.poll_progress_every),
            ..defaults
        }
    }

    /// Set the concurrency limit (at least 1)
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set the waiting-list capacity
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Set the inactivity timeout
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Set the sweep interval
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the PDF progress granularity
    pub fn with_progress_every(mut self, pages: u32) -> Self {
        self.progress_every = pages;
        self
    }

    /// Set the poll progress granularity
    pub fn with_poll_progress_every(mut self, submissions: u32) -> Self {
        self.poll_progress_every = submissions;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.max_concurrency == 0 {
            return Err(TaskError::InvalidConfig(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.task_timeout.is_zero() {
            return Err(TaskError::InvalidConfig(
                "task_timeout must be positive".into(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(TaskError::InvalidConfig(
                "sweep_interval must be positive".into(),
            ));
        }
        if self.progress_every == 0 || self.poll_progress_every == 0 {
            return Err(TaskError::InvalidConfig(
                "progress granularity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
