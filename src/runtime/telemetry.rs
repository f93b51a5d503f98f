use crate::ingest::queue::BlockQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Lightweight rolling counters used to derive runtime metrics.
#[derive(Default, Debug)]
pub struct Telemetry {
    fetched_blocks: AtomicU64,
    enqueued_blocks: AtomicU64,
    projected_blocks: AtomicU64,
    committed_batches: AtomicU64,
    written_operations: AtomicU64,
    commit_failures: AtomicU64,
    provider_retries: AtomicU64,
    reorgs_started: AtomicU64,
    reorg_steps: AtomicU64,
    reorgs_resolved: AtomicU64,
}

impl Telemetry {
    pub fn record_fetched_block(&self) {
        self.fetched_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enqueued_block(&self) {
        self.enqueued_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_projected_blocks(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.projected_blocks.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_committed_batch(&self, operations: u64) {
        self.committed_batches.fetch_add(1, Ordering::Relaxed);
        self.written_operations
            .fetch_add(operations, Ordering::Relaxed);
    }

    pub fn record_commit_failure(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_provider_retry(&self) {
        self.provider_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reorg_started(&self) {
        self.reorgs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reorg_step(&self) {
        self.reorg_steps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reorg_resolved(&self) {
        self.reorgs_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            fetched_blocks: self.fetched_blocks.load(Ordering::Relaxed),
            enqueued_blocks: self.enqueued_blocks.load(Ordering::Relaxed),
            projected_blocks: self.projected_blocks.load(Ordering::Relaxed),
            committed_batches: self.committed_batches.load(Ordering::Relaxed),
            written_operations: self.written_operations.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            provider_retries: self.provider_retries.load(Ordering::Relaxed),
            reorgs_started: self.reorgs_started.load(Ordering::Relaxed),
            reorg_steps: self.reorg_steps.load(Ordering::Relaxed),
            reorgs_resolved: self.reorgs_resolved.load(Ordering::Relaxed),
        }
    }

    pub fn projected_blocks(&self) -> u64 {
        self.projected_blocks.load(Ordering::Relaxed)
    }

    pub fn committed_batches(&self) -> u64 {
        self.committed_batches.load(Ordering::Relaxed)
    }

    pub fn commit_failures(&self) -> u64 {
        self.commit_failures.load(Ordering::Relaxed)
    }

    pub fn provider_retries(&self) -> u64 {
        self.provider_retries.load(Ordering::Relaxed)
    }

    pub fn reorgs_started(&self) -> u64 {
        self.reorgs_started.load(Ordering::Relaxed)
    }

    pub fn reorgs_resolved(&self) -> u64 {
        self.reorgs_resolved.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Copy, Clone)]
pub struct TelemetrySnapshot {
    pub fetched_blocks: u64,
    pub enqueued_blocks: u64,
    pub projected_blocks: u64,
    pub committed_batches: u64,
    pub written_operations: u64,
    pub commit_failures: u64,
    pub provider_retries: u64,
    pub reorgs_started: u64,
    pub reorg_steps: u64,
    pub reorgs_resolved: u64,
}

/// Spawns a background task that periodically logs throughput, queue depth, and reorg counters.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    queue: Arc<BlockQueue>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "projblock::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current_snapshot = telemetry.snapshot();
                    let projected_delta = current_snapshot
                        .projected_blocks
                        .saturating_sub(last_snapshot.projected_blocks);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        projected_delta as f64 / elapsed
                    };
                    let queue_blocks = queue.len().await;
                    let queue_bytes = queue.bytes().await;

                    tracing::info!(
                        target: "projblock::metrics",
                        throughput = format!("{throughput:.2}"),
                        projected = current_snapshot.projected_blocks,
                        committed_batches = current_snapshot.committed_batches,
                        queue_blocks,
                        queue_bytes,
                        provider_retries = current_snapshot.provider_retries,
                        reorgs_started = current_snapshot.reorgs_started,
                        reorgs_resolved = current_snapshot.reorgs_resolved,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current_snapshot;
                    last_tick = Instant::now();
                }
            }
        }
    })
}
