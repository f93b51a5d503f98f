use crate::ingest::queue::BYTES_PER_MEGABYTE;
use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_FETCH_CONCURRENCY: usize = 4;
const DEFAULT_QUEUE_MAX_SIZE_MB: usize = 200;
const DEFAULT_MAX_BATCH_SIZE_MB: usize = 4;
const DEFAULT_MIN_BATCH_SIZE_BYTES: usize = 262_144;
const DEFAULT_MAX_BATCH_COUNT: usize = 64;
const DEFAULT_POLL_INTERVAL_MS: u64 = 3_000;
const DEFAULT_MAX_POLL_INTERVAL_MS: u64 = 60_000;
const DEFAULT_POLL_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_REORG_WINDOW_SIZE: usize = 100;
const DEFAULT_FETCH_RETRY_ATTEMPTS: usize = 5;
const DEFAULT_COMMAND_RETRY_ATTEMPTS: usize = 3;
const DEFAULT_COMMAND_RETRY_INITIAL_BACKOFF_MS: u64 = 500;
const DEFAULT_COMMAND_RETRY_MAX_BACKOFF_MS: u64 = 5_000;

/// How new blocks reach the ingestion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStrategy {
    /// A worker pool polls the node provider for the next unfetched heights.
    PollProvider,
    /// An external transport polls the chain and delivers `LoadBatch` commands.
    PollTransport,
    /// Blocks are pushed in over a webhook and admitted through the push gate.
    WebhookPush,
}

impl IngestStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStrategy::PollProvider => "poll-provider",
            IngestStrategy::PollTransport => "poll-transport",
            IngestStrategy::WebhookPush => "webhook-push",
        }
    }
}

impl std::fmt::Display for IngestStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IngestStrategy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim() {
            "poll-provider" => Ok(IngestStrategy::PollProvider),
            "poll-transport" => Ok(IngestStrategy::PollTransport),
            "webhook-push" => Ok(IngestStrategy::WebhookPush),
            other => bail!(
                "unknown ingestion strategy {other:?} (expected poll-provider, poll-transport \
                 or webhook-push)"
            ),
        }
    }
}

/// Runtime configuration for the ingestion pipeline.
///
/// All instances must be constructed via [`IngestConfig::builder`] or [`IngestConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    strategy: IngestStrategy,
    start_height: u64,
    fetch_concurrency: usize,
    queue_max_size_mb: usize,
    max_batch_size_mb: usize,
    min_batch_size_bytes: usize,
    max_batch_count: usize,
    poll_interval: Duration,
    max_poll_interval: Duration,
    poll_backoff_multiplier: f64,
    reorg_window_size: usize,
    fetch_retry_attempts: usize,
    command_retry_attempts: usize,
    command_retry_initial_backoff: Duration,
    command_retry_max_backoff: Duration,
    metrics_interval: Duration,
}

pub struct IngestConfigParams {
    pub strategy: IngestStrategy,
    pub start_height: u64,
    pub fetch_concurrency: usize,
    pub queue_max_size_mb: usize,
    pub max_batch_size_mb: usize,
    pub min_batch_size_bytes: usize,
    pub max_batch_count: usize,
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub poll_backoff_multiplier: f64,
    pub reorg_window_size: usize,
    pub fetch_retry_attempts: usize,
    pub command_retry_attempts: usize,
    pub command_retry_initial_backoff: Duration,
    pub command_retry_max_backoff: Duration,
    pub metrics_interval: Duration,
}

impl IngestConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> IngestConfigBuilder {
        IngestConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    ///
    /// Prefer [`IngestConfig::builder`] when many values use defaults. Callers that already
    /// have concrete runtime parameters can use this method to enforce validation without
    /// going through the builder.
    pub fn new(params: IngestConfigParams) -> Result<Self> {
        let IngestConfigParams {
            strategy,
            start_height,
            fetch_concurrency,
            queue_max_size_mb,
            max_batch_size_mb,
            min_batch_size_bytes,
            max_batch_count,
            poll_interval,
            max_poll_interval,
            poll_backoff_multiplier,
            reorg_window_size,
            fetch_retry_attempts,
            command_retry_attempts,
            command_retry_initial_backoff,
            command_retry_max_backoff,
            metrics_interval,
        } = params;

        let config = Self {
            strategy,
            start_height,
            fetch_concurrency,
            queue_max_size_mb,
            max_batch_size_mb,
            min_batch_size_bytes,
            max_batch_count,
            poll_interval,
            max_poll_interval,
            poll_backoff_multiplier,
            reorg_window_size,
            fetch_retry_attempts,
            command_retry_attempts,
            command_retry_initial_backoff,
            command_retry_max_backoff,
            metrics_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// Ingestion strategy selecting how blocks reach the queue.
    pub fn strategy(&self) -> IngestStrategy {
        self.strategy
    }

    /// Height ingestion starts from on a fresh deployment.
    pub fn start_height(&self) -> u64 {
        self.start_height
    }

    /// Number of parallel fetch workers for the poll-provider strategy.
    pub fn fetch_concurrency(&self) -> usize {
        self.fetch_concurrency
    }

    /// Maximum megabytes of buffered block data allowed in the queue.
    pub fn queue_max_size_mb(&self) -> usize {
        self.queue_max_size_mb
    }

    /// Queue byte budget derived from [`queue_max_size_mb`](Self::queue_max_size_mb).
    pub fn queue_max_bytes(&self) -> usize {
        self.queue_max_size_mb.saturating_mul(BYTES_PER_MEGABYTE)
    }

    /// Maximum megabytes a dequeued batch may carry.
    pub fn max_batch_size_mb(&self) -> usize {
        self.max_batch_size_mb
    }

    /// Batch byte ceiling derived from [`max_batch_size_mb`](Self::max_batch_size_mb).
    pub fn max_batch_bytes(&self) -> usize {
        self.max_batch_size_mb.saturating_mul(BYTES_PER_MEGABYTE)
    }

    /// Byte size below which the batch sizer grows the next batch.
    pub fn min_batch_size_bytes(&self) -> usize {
        self.min_batch_size_bytes
    }

    /// Maximum number of blocks a dequeued batch may carry.
    pub fn max_batch_count(&self) -> usize {
        self.max_batch_count
    }

    /// Base delay between tip polls when no new block is found.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Ceiling the idle poll delay backs off to.
    pub fn max_poll_interval(&self) -> Duration {
        self.max_poll_interval
    }

    /// Multiplier applied to the idle poll delay after each empty poll.
    pub fn poll_backoff_multiplier(&self) -> f64 {
        self.poll_backoff_multiplier
    }

    /// Number of recent light blocks kept for ancestor walk-back.
    pub fn reorg_window_size(&self) -> usize {
        self.reorg_window_size
    }

    /// Attempts a fetch worker makes per height before failing fatally.
    pub fn fetch_retry_attempts(&self) -> usize {
        self.fetch_retry_attempts
    }

    /// Attempts the command retry combinator makes per automatic command.
    pub fn command_retry_attempts(&self) -> usize {
        self.command_retry_attempts
    }

    /// Initial backoff between command retry attempts.
    pub fn command_retry_initial_backoff(&self) -> Duration {
        self.command_retry_initial_backoff
    }

    /// Ceiling the command retry backoff doubles up to.
    pub fn command_retry_max_backoff(&self) -> Duration {
        self.command_retry_max_backoff
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.fetch_concurrency == 0 {
            bail!("fetch_concurrency must be greater than 0");
        }

        if self.queue_max_size_mb == 0 {
            bail!("queue_max_size_mb must be greater than 0");
        }

        if self.max_batch_size_mb == 0 {
            bail!("max_batch_size_mb must be greater than 0");
        }

        if self.min_batch_size_bytes == 0 {
            bail!("min_batch_size_bytes must be greater than 0");
        }

        if self.max_batch_count == 0 {
            bail!("max_batch_count must be greater than 0");
        }

        if self.max_batch_bytes() > self.queue_max_bytes() {
            bail!(
                "max_batch_size_mb ({}) cannot exceed queue_max_size_mb ({})",
                self.max_batch_size_mb,
                self.queue_max_size_mb,
            );
        }

        if self.min_batch_size_bytes > self.max_batch_bytes() {
            bail!(
                "min_batch_size_bytes ({}) cannot exceed the batch byte ceiling ({})",
                self.min_batch_size_bytes,
                self.max_batch_bytes(),
            );
        }

        if self.poll_interval.is_zero() {
            bail!("poll_interval must be greater than 0");
        }

        if self.max_poll_interval < self.poll_interval {
            bail!("max_poll_interval must be at least poll_interval");
        }

        if self.poll_backoff_multiplier < 1.0 {
            bail!("poll_backoff_multiplier must be at least 1.0");
        }

        if self.reorg_window_size == 0 {
            bail!("reorg_window_size must be greater than 0");
        }

        if self.fetch_retry_attempts == 0 {
            bail!("fetch_retry_attempts must be greater than 0");
        }

        if self.command_retry_attempts == 0 {
            bail!("command_retry_attempts must be greater than 0");
        }

        if self.command_retry_initial_backoff.is_zero() {
            bail!("command_retry_initial_backoff must be greater than 0");
        }

        if self.command_retry_max_backoff < self.command_retry_initial_backoff {
            bail!("command_retry_max_backoff must be at least command_retry_initial_backoff");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct IngestConfigBuilder {
    strategy: Option<IngestStrategy>,
    start_height: Option<u64>,
    fetch_concurrency: Option<usize>,
    queue_max_size_mb: Option<usize>,
    max_batch_size_mb: Option<usize>,
    min_batch_size_bytes: Option<usize>,
    max_batch_count: Option<usize>,
    poll_interval: Option<Duration>,
    max_poll_interval: Option<Duration>,
    poll_backoff_multiplier: Option<f64>,
    reorg_window_size: Option<usize>,
    fetch_retry_attempts: Option<usize>,
    command_retry_attempts: Option<usize>,
    command_retry_initial_backoff: Option<Duration>,
    command_retry_max_backoff: Option<Duration>,
    metrics_interval: Option<Duration>,
}

impl IngestConfigBuilder {
    pub fn strategy(mut self, strategy: IngestStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn start_height(mut self, height: u64) -> Self {
        self.start_height = Some(height);
        self
    }

    pub fn fetch_concurrency(mut self, count: usize) -> Self {
        self.fetch_concurrency = Some(count);
        self
    }

    pub fn queue_max_size_mb(mut self, megabytes: usize) -> Self {
        self.queue_max_size_mb = Some(megabytes);
        self
    }

    pub fn max_batch_size_mb(mut self, megabytes: usize) -> Self {
        self.max_batch_size_mb = Some(megabytes);
        self
    }

    pub fn min_batch_size_bytes(mut self, bytes: usize) -> Self {
        self.min_batch_size_bytes = Some(bytes);
        self
    }

    pub fn max_batch_count(mut self, count: usize) -> Self {
        self.max_batch_count = Some(count);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval = Some(interval);
        self
    }

    pub fn poll_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.poll_backoff_multiplier = Some(multiplier);
        self
    }

    pub fn reorg_window_size(mut self, window: usize) -> Self {
        self.reorg_window_size = Some(window);
        self
    }

    pub fn fetch_retry_attempts(mut self, attempts: usize) -> Self {
        self.fetch_retry_attempts = Some(attempts);
        self
    }

    pub fn command_retry_attempts(mut self, attempts: usize) -> Self {
        self.command_retry_attempts = Some(attempts);
        self
    }

    pub fn command_retry_initial_backoff(mut self, backoff: Duration) -> Self {
        self.command_retry_initial_backoff = Some(backoff);
        self
    }

    pub fn command_retry_max_backoff(mut self, backoff: Duration) -> Self {
        self.command_retry_max_backoff = Some(backoff);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<IngestConfig> {
        let params = IngestConfigParams {
            strategy: self.strategy.unwrap_or(IngestStrategy::PollProvider),
            start_height: self.start_height.context("start_height is required")?,
            fetch_concurrency: self.fetch_concurrency.unwrap_or(DEFAULT_FETCH_CONCURRENCY),
            queue_max_size_mb: self.queue_max_size_mb.unwrap_or(DEFAULT_QUEUE_MAX_SIZE_MB),
            max_batch_size_mb: self.max_batch_size_mb.unwrap_or(DEFAULT_MAX_BATCH_SIZE_MB),
            min_batch_size_bytes: self
                .min_batch_size_bytes
                .unwrap_or(DEFAULT_MIN_BATCH_SIZE_BYTES),
            max_batch_count: self.max_batch_count.unwrap_or(DEFAULT_MAX_BATCH_COUNT),
            poll_interval: self
                .poll_interval
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)),
            max_poll_interval: self
                .max_poll_interval
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_MAX_POLL_INTERVAL_MS)),
            poll_backoff_multiplier: self
                .poll_backoff_multiplier
                .unwrap_or(DEFAULT_POLL_BACKOFF_MULTIPLIER),
            reorg_window_size: self.reorg_window_size.unwrap_or(DEFAULT_REORG_WINDOW_SIZE),
            fetch_retry_attempts: self
                .fetch_retry_attempts
                .unwrap_or(DEFAULT_FETCH_RETRY_ATTEMPTS),
            command_retry_attempts: self
                .command_retry_attempts
                .unwrap_or(DEFAULT_COMMAND_RETRY_ATTEMPTS),
            command_retry_initial_backoff: self.command_retry_initial_backoff.unwrap_or_else(
                || Duration::from_millis(DEFAULT_COMMAND_RETRY_INITIAL_BACKOFF_MS),
            ),
            command_retry_max_backoff: self
                .command_retry_max_backoff
                .unwrap_or_else(|| Duration::from_millis(DEFAULT_COMMAND_RETRY_MAX_BACKOFF_MS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
        };

        IngestConfig::new(params)
    }
}
