use crate::ingest::poll::PollPlanner;
use crate::ingest::queue::{BlockQueue, QueueError};
use crate::ingest::sizing::ByteSized;
use crate::provider::{NodeProvider, ProviderError};
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::Telemetry;
use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const FETCH_INITIAL_BACKOFF_MS: u64 = 250;
const FETCH_MAX_BACKOFF_MS: u64 = 2_000;

pub(crate) fn retry_delay(attempt: usize) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(FETCH_INITIAL_BACKOFF_MS);
    }

    let exponent = attempt.saturating_sub(1).min(8) as u32;
    let mut delay_ms = FETCH_INITIAL_BACKOFF_MS.saturating_mul(1u64 << exponent);
    if delay_ms > FETCH_MAX_BACKOFF_MS {
        delay_ms = FETCH_MAX_BACKOFF_MS;
    }

    Duration::from_millis(delay_ms)
}

/// Worker control value carried on the arm channel. Re-arming goes through
/// `Paused` so no claims race the cursor reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmState {
    Paused,
    Running { epoch: u64, start_height: u64 },
}

/// Highest tip height reported by the provider so far. `u64::MAX` means no
/// observation yet.
#[derive(Debug)]
pub struct ObservedTip {
    value: AtomicU64,
}

const TIP_UNKNOWN: u64 = u64::MAX;

impl ObservedTip {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(TIP_UNKNOWN),
        }
    }

    /// Stores the observation and reports whether the tip advanced.
    pub fn update(&self, tip: u64) -> bool {
        let previous = self.value.swap(tip, Ordering::SeqCst);
        previous == TIP_UNKNOWN || tip > previous
    }

    pub fn get(&self) -> Option<u64> {
        let value = self.value.load(Ordering::SeqCst);
        (value != TIP_UNKNOWN).then_some(value)
    }
}

impl Default for ObservedTip {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks in-flight fetches so re-arm and shutdown can wait for a quiet pool.
#[derive(Debug, Default)]
pub struct WorkerActivityTracker {
    active_fetches: AtomicUsize,
    notify: Notify,
}

impl WorkerActivityTracker {
    pub fn new() -> Self {
        Self {
            active_fetches: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    pub fn enter(self: &Arc<Self>) -> WorkerActivityGuard {
        self.active_fetches.fetch_add(1, Ordering::SeqCst);
        WorkerActivityGuard {
            tracker: Arc::clone(self),
            active: true,
        }
    }

    pub async fn wait_until_idle(&self) {
        self.wait_until_idle_with(|| async {}).await;
    }

    pub async fn wait_until_idle_with<F, Fut>(&self, mut on_wait: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            if self.active_fetches.load(Ordering::SeqCst) == 0 {
                return;
            }

            let notified = self.notify.notified();
            on_wait().await;

            if self.active_fetches.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn release(&self) {
        if self.active_fetches.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        } else {
            self.notify.notify_one();
        }
    }
}

pub struct WorkerActivityGuard {
    tracker: Arc<WorkerActivityTracker>,
    active: bool,
}

impl Drop for WorkerActivityGuard {
    fn drop(&mut self) {
        if self.active {
            self.tracker.release();
            self.active = false;
        }
    }
}

pub struct FetchPoolParams {
    pub provider: Arc<dyn NodeProvider>,
    pub queue: Arc<BlockQueue>,
    pub telemetry: Arc<Telemetry>,
    pub fatal_handler: FatalErrorHandler,
    pub shutdown: CancellationToken,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub poll_backoff_multiplier: f64,
    pub fetch_retry_attempts: usize,
}

/// Bounded pool of fetch workers claiming heights from a shared cursor.
pub struct FetchPool {
    handles: Vec<JoinHandle<()>>,
    arm_tx: watch::Sender<ArmState>,
    cursor: Arc<AtomicU64>,
    activity: Arc<WorkerActivityTracker>,
    observed_tip: Arc<ObservedTip>,
    queue: Arc<BlockQueue>,
}

impl FetchPool {
    /// Spawns the workers in `Paused` state; call [`arm`](Self::arm) to start claiming.
    pub fn spawn(params: FetchPoolParams) -> Self {
        let (arm_tx, arm_rx) = watch::channel(ArmState::Paused);
        let cursor = Arc::new(AtomicU64::new(0));
        let activity = Arc::new(WorkerActivityTracker::new());
        let observed_tip = Arc::new(ObservedTip::new());

        let concurrency = params.concurrency.max(1);
        let mut handles = Vec::with_capacity(concurrency);
        for id in 0..concurrency {
            let worker = FetchWorker {
                id,
                provider: Arc::clone(&params.provider),
                queue: Arc::clone(&params.queue),
                telemetry: Arc::clone(&params.telemetry),
                fatal_handler: params.fatal_handler.clone(),
                shutdown: params.shutdown.clone(),
                arm_rx: arm_rx.clone(),
                cursor: Arc::clone(&cursor),
                activity: Arc::clone(&activity),
                observed_tip: Arc::clone(&observed_tip),
                planner: PollPlanner::new(
                    params.poll_interval,
                    params.max_poll_interval,
                    params.poll_backoff_multiplier,
                ),
                retry_attempts: params.fetch_retry_attempts.max(1),
            };
            handles.push(tokio::spawn(worker.run()));
        }

        Self {
            handles,
            arm_tx,
            cursor,
            activity,
            observed_tip,
            queue: params.queue,
        }
    }

    /// Point the cursor at `start_height` and let workers claim. Must only be
    /// called while the pool is paused and idle.
    pub fn arm(&self, start_height: u64, epoch: u64) {
        self.cursor.store(start_height, Ordering::SeqCst);
        let _ = self.arm_tx.send(ArmState::Running {
            epoch,
            start_height,
        });
    }

    /// Park all workers and wait until in-flight fetches have drained.
    ///
    /// The queue is cleared while waiting so producers suspended on the byte
    /// budget wake up and release their activity guards.
    pub async fn pause_and_drain(&self) {
        let _ = self.arm_tx.send(ArmState::Paused);
        let queue = Arc::clone(&self.queue);
        self.activity
            .wait_until_idle_with(|| {
                let queue = Arc::clone(&queue);
                async move { queue.clear().await }
            })
            .await;
    }

    pub fn observed_tip(&self) -> Option<u64> {
        self.observed_tip.get()
    }

    /// Waits for worker tasks after the shutdown token has been cancelled.
    pub async fn join(self) {
        let _ = self.arm_tx.send(ArmState::Paused);
        let queue = Arc::clone(&self.queue);
        self.activity
            .wait_until_idle_with(|| {
                let queue = Arc::clone(&queue);
                async move { queue.clear().await }
            })
            .await;
        let results = join_all(self.handles).await;
        for result in results {
            if let Err(err) = result {
                tracing::error!(error = %err, "fetch worker task panicked");
            }
        }
    }
}

enum FetchOutcome {
    Enqueued,
    Skipped,
    Stale,
    Shutdown,
    Fatal,
}

struct FetchWorker {
    id: usize,
    provider: Arc<dyn NodeProvider>,
    queue: Arc<BlockQueue>,
    telemetry: Arc<Telemetry>,
    fatal_handler: FatalErrorHandler,
    shutdown: CancellationToken,
    arm_rx: watch::Receiver<ArmState>,
    cursor: Arc<AtomicU64>,
    activity: Arc<WorkerActivityTracker>,
    observed_tip: Arc<ObservedTip>,
    planner: PollPlanner,
    retry_attempts: usize,
}

impl FetchWorker {
    #[tracing::instrument(name = "fetch_worker", skip_all, fields(worker = self.id))]
    async fn run(mut self) {
        tracing::debug!("fetch worker started");

        loop {
            let running = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                state = wait_for_running(&mut self.arm_rx) => state,
            };
            let Some(epoch) = running else {
                break;
            };
            self.planner.reset();

            loop {
                if self.shutdown.is_cancelled() {
                    tracing::debug!("fetch worker stopped");
                    return;
                }
                if self.arm_rx.has_changed().unwrap_or(true) {
                    break;
                }

                let height = self.cursor.fetch_add(1, Ordering::SeqCst);
                let guard = self.activity.enter();
                let outcome = self.fetch_and_enqueue(height, epoch).await;
                drop(guard);

                match outcome {
                    FetchOutcome::Enqueued | FetchOutcome::Skipped => {}
                    FetchOutcome::Stale => break,
                    FetchOutcome::Shutdown | FetchOutcome::Fatal => {
                        tracing::debug!("fetch worker stopped");
                        return;
                    }
                }
            }
        }

        tracing::debug!("fetch worker stopped");
    }

    async fn fetch_and_enqueue(&mut self, height: u64, epoch: u64) -> FetchOutcome {
        let mut attempt = 0usize;
        let mut tip_known_to_cover = self
            .observed_tip
            .get()
            .map(|tip| tip >= height)
            .unwrap_or(false);

        loop {
            if !tip_known_to_cover {
                match self.wait_for_tip(height).await {
                    TipWait::Covered => tip_known_to_cover = true,
                    TipWait::Stale => return FetchOutcome::Stale,
                    TipWait::Shutdown => return FetchOutcome::Shutdown,
                    TipWait::Fatal => return FetchOutcome::Fatal,
                }
            }

            let fetched = self.provider.get_block(height).await;
            match fetched {
                Ok(block) => {
                    if block.height() != height {
                        attempt += 1;
                        tracing::warn!(
                            height,
                            returned = block.height(),
                            attempt,
                            "provider returned mismatched height; retrying"
                        );
                        if attempt >= self.retry_attempts {
                            let err = anyhow::anyhow!(
                                "provider returned height {} for requested height {height}",
                                block.height()
                            );
                            let _ = self.fatal_handler.trigger_external("block fetch", err);
                            return FetchOutcome::Fatal;
                        }
                        if let Some(outcome) = self.backoff_or_give_up(attempt).await {
                            return outcome;
                        }
                        continue;
                    }

                    self.telemetry.record_fetched_block();
                    self.planner.reset();
                    let size_bytes = block.byte_size();
                    return match self.queue.enqueue_sized(block, size_bytes, epoch).await {
                        Ok(()) => {
                            self.telemetry.record_enqueued_block();
                            FetchOutcome::Enqueued
                        }
                        Err(QueueError::StaleEpoch { .. }) => FetchOutcome::Stale,
                        Err(err @ QueueError::DuplicateHeight { .. })
                        | Err(err @ QueueError::StaleHeight { .. }) => {
                            tracing::debug!(height, error = %err, "admission skipped");
                            FetchOutcome::Skipped
                        }
                    };
                }
                Err(err) if ProviderError::is_height_out_of_range(&err) => {
                    // The tip answer was stale; fall back to tip waiting.
                    tip_known_to_cover = false;
                }
                Err(err) => {
                    attempt += 1;
                    self.telemetry.record_provider_retry();
                    tracing::warn!(
                        height,
                        attempt,
                        error = %err,
                        "block fetch failed; backing off"
                    );
                    if attempt >= self.retry_attempts {
                        let err = err.context(format!("fetching block {height}"));
                        let _ = self.fatal_handler.trigger_external("block fetch", err);
                        return FetchOutcome::Fatal;
                    }
                    if let Some(outcome) = self.backoff_or_give_up(attempt).await {
                        return outcome;
                    }
                }
            }
        }
    }

    /// Sleeps the retry delay; `Some` means the worker must bail out.
    async fn backoff_or_give_up(&mut self, attempt: usize) -> Option<FetchOutcome> {
        tokio::select! {
            _ = sleep(retry_delay(attempt)) => None,
            _ = self.shutdown.cancelled() => Some(FetchOutcome::Shutdown),
            _ = self.arm_rx.changed() => Some(FetchOutcome::Stale),
        }
    }

    async fn wait_for_tip(&mut self, height: u64) -> TipWait {
        let mut attempt = 0usize;
        loop {
            let refreshed = self.provider.tip_height().await;
            match refreshed {
                Ok(tip) => {
                    if self.observed_tip.update(tip) {
                        self.planner.reset();
                    }
                    if tip >= height {
                        return TipWait::Covered;
                    }

                    let delay = self.planner.idle_delay();
                    tracing::trace!(height, tip, delay_ms = delay.as_millis() as u64, "waiting for tip");
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = self.shutdown.cancelled() => return TipWait::Shutdown,
                        _ = self.arm_rx.changed() => return TipWait::Stale,
                    }
                }
                Err(err) => {
                    attempt += 1;
                    self.telemetry.record_provider_retry();
                    tracing::warn!(attempt, error = %err, "tip refresh failed; backing off");
                    if attempt >= self.retry_attempts {
                        let err = err.context("refreshing chain tip");
                        let _ = self.fatal_handler.trigger_external("tip refresh", err);
                        return TipWait::Fatal;
                    }
                    tokio::select! {
                        _ = sleep(retry_delay(attempt)) => {}
                        _ = self.shutdown.cancelled() => return TipWait::Shutdown,
                        _ = self.arm_rx.changed() => return TipWait::Stale,
                    }
                }
            }
        }
    }
}

enum TipWait {
    Covered,
    Stale,
    Shutdown,
    Fatal,
}

async fn wait_for_running(arm_rx: &mut watch::Receiver<ArmState>) -> Option<u64> {
    loop {
        if let ArmState::Running { epoch, .. } = *arm_rx.borrow_and_update() {
            return Some(epoch);
        }
        if arm_rx.changed().await.is_err() {
            return None;
        }
    }
}
