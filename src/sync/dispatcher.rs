//! Command-driven orchestration of the ingestion pipeline.
//!
//! `SyncDispatcher` owns the queue, the chain aggregate, the projection
//! pipeline and the reorg saga, and drives them from a single loop so batches
//! are applied strictly sequentially. Blocks arrive through one of three
//! frontends selected by configuration: a polling worker pool, externally
//! delivered `LoadBatch` commands, or the webhook push gate.

use crate::chain::state::ChainAggregate;
use crate::chain::store::EventStore;
use crate::ingest::batch::BatchSizer;
use crate::ingest::block::{Block, LightBlock, QueueItem};
use crate::ingest::push::PushGate;
use crate::ingest::queue::BlockQueue;
use crate::ingest::sizing::ByteSized;
use crate::ingest::worker::{FetchPool, FetchPoolParams};
use crate::projection::mapper::BlockProjection;
use crate::projection::pipeline::CommitPipeline;
use crate::projection::store::{ProjectionStore, StoreError};
use crate::provider::NodeProvider;
use crate::runtime::config::{IngestConfig, IngestStrategy};
use crate::runtime::fatal::{FatalErrorHandler, PipelineError, PipelineStage};
use crate::runtime::telemetry::{self, Telemetry};
use crate::sync::commands::{
    command_channel, Command, CommandReceiver, CommandSender, EventPublisher, ReorgStatus,
    RequestId, SyncEvent,
};
use crate::sync::reorg::{ReorgSaga, ReorgSettings};
use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct SyncDispatcherParams {
    pub config: IngestConfig,
    pub provider: Arc<dyn NodeProvider>,
    pub projection: Arc<dyn BlockProjection>,
    pub event_store: Arc<dyn EventStore>,
    pub projection_store: Arc<dyn ProjectionStore>,
    pub publisher: Arc<dyn EventPublisher>,
}

pub struct SyncDispatcher {
    config: IngestConfig,
    provider: Arc<dyn NodeProvider>,
    projection: Arc<dyn BlockProjection>,
    event_store: Arc<dyn EventStore>,
    projection_store: Arc<dyn ProjectionStore>,
    publisher: Arc<dyn EventPublisher>,
    telemetry: Arc<Telemetry>,
    queue: Arc<BlockQueue>,
    push_gate: Option<Arc<PushGate>>,
    command_tx: CommandSender,
    command_rx: Option<CommandReceiver>,
    shutdown_root: CancellationToken,
    run_token: Option<CancellationToken>,
    fatal_handler: Option<FatalErrorHandler>,
    processing_handle: Option<JoinHandle<(CommandReceiver, Result<()>)>>,
    metrics_handle: Option<JoinHandle<()>>,
    running: bool,
}

impl SyncDispatcher {
    /// Creates a dispatcher with its own root cancellation token.
    ///
    /// Use [`Self::with_cancellation_token`] to integrate with an existing
    /// shutdown mechanism.
    pub fn new(params: SyncDispatcherParams) -> Self {
        Self::with_cancellation_token(params, CancellationToken::new())
    }

    /// Creates a dispatcher whose per-run cancellation tokens derive from the
    /// given shutdown token.
    pub fn with_cancellation_token(
        params: SyncDispatcherParams,
        shutdown_root: CancellationToken,
    ) -> Self {
        let SyncDispatcherParams {
            config,
            provider,
            projection,
            event_store,
            projection_store,
            publisher,
        } = params;

        let telemetry = Arc::new(Telemetry::default());
        let queue = Arc::new(BlockQueue::new(config.queue_max_bytes()));
        let push_gate = match config.strategy() {
            IngestStrategy::WebhookPush => Some(Arc::new(PushGate::new(
                Arc::clone(&queue),
                Arc::clone(&telemetry),
            ))),
            IngestStrategy::PollProvider | IngestStrategy::PollTransport => None,
        };
        let capacity = config.fetch_concurrency().saturating_mul(4).max(16);
        let (command_tx, command_rx) = command_channel(capacity);

        Self {
            config,
            provider,
            projection,
            event_store,
            projection_store,
            publisher,
            telemetry,
            queue,
            push_gate,
            command_tx,
            command_rx: Some(command_rx),
            shutdown_root,
            run_token: None,
            fatal_handler: None,
            processing_handle: None,
            metrics_handle: None,
            running: false,
        }
    }

    /// Returns a reference to the dispatcher's configuration.
    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Returns a reference to the ordered block queue.
    pub fn queue(&self) -> &Arc<BlockQueue> {
        &self.queue
    }

    /// Returns a clone of the telemetry handle for observability.
    pub fn telemetry(&self) -> Arc<Telemetry> {
        Arc::clone(&self.telemetry)
    }

    /// Returns a sender for the dispatcher's command channel.
    pub fn command_sender(&self) -> CommandSender {
        self.command_tx.clone()
    }

    /// Returns the admission gate when running the webhook-push strategy.
    pub fn push_gate(&self) -> Option<Arc<PushGate>> {
        self.push_gate.as_ref().map(Arc::clone)
    }

    /// Replaces the root shutdown token used to derive per-run cancellation tokens.
    /// This must only be called while the dispatcher is idle (i.e. between `stop` and `start`).
    pub fn replace_shutdown_root(&mut self, shutdown: CancellationToken) {
        debug_assert!(
            !self.running,
            "shutdown token should not change while the dispatcher is running"
        );
        self.shutdown_root = shutdown;
    }

    /// Replays persisted state and launches the dispatch loop.
    ///
    /// Ingestion stays idle until an `InitIngestion` command arms it. Returns
    /// an error if the dispatcher is already running or replay fails.
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            bail!("dispatcher already running");
        }

        debug_assert!(
            self.config.validate().is_ok(),
            "IngestConfig should have been validated at construction time"
        );

        let commands = self
            .command_rx
            .take()
            .context("command receiver unavailable; a previous run did not return it")?;

        let run_token = self.shutdown_root.child_token();
        let fatal_handler = FatalErrorHandler::new(self.shutdown_root.clone(), run_token.clone());

        let aggregate = ChainAggregate::replay(
            Arc::clone(&self.event_store),
            self.config.reorg_window_size(),
        )
        .await
        .context("replaying chain state")?;
        let pipeline = CommitPipeline::load(
            Arc::clone(&self.projection_store),
            Arc::clone(&self.projection),
            Arc::clone(&self.telemetry),
        )
        .await
        .context("loading projection pipeline")?;

        // Acceptance is logged before any projection write, so a checkpoint
        // past the replayed tip means the two stores are out of sync.
        if let Some(checkpoint) = pipeline.checkpoint() {
            let tip = aggregate.state().tip().map(|tip| tip.height());
            if tip.map_or(true, |tip| tip < checkpoint) {
                bail!(
                    "projection checkpoint {checkpoint} is ahead of the replayed chain tip \
                     {tip:?}; the event log and read-model disagree"
                );
            }
        }

        tracing::info!(
            strategy = %self.config.strategy(),
            start_height = self.config.start_height(),
            tip = ?aggregate.state().tip().map(|tip| tip.height()),
            checkpoint = ?pipeline.checkpoint(),
            reorg_in_progress = aggregate.state().is_reorging(),
            "starting sync dispatcher"
        );

        self.queue.clear().await;

        let frontend = match self.config.strategy() {
            IngestStrategy::PollProvider => {
                IngestFrontend::PollProvider(FetchPool::spawn(FetchPoolParams {
                    provider: Arc::clone(&self.provider),
                    queue: Arc::clone(&self.queue),
                    telemetry: Arc::clone(&self.telemetry),
                    fatal_handler: fatal_handler.clone(),
                    shutdown: run_token.clone(),
                    concurrency: self.config.fetch_concurrency(),
                    poll_interval: self.config.poll_interval(),
                    max_poll_interval: self.config.max_poll_interval(),
                    poll_backoff_multiplier: self.config.poll_backoff_multiplier(),
                    fetch_retry_attempts: self.config.fetch_retry_attempts(),
                }))
            }
            IngestStrategy::PollTransport => IngestFrontend::PollTransport,
            IngestStrategy::WebhookPush => {
                let gate = self
                    .push_gate
                    .as_ref()
                    .map(Arc::clone)
                    .context("push gate missing for the webhook-push strategy")?;
                IngestFrontend::WebhookPush(gate)
            }
        };

        let saga = ReorgSaga::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.publisher),
            Arc::clone(&self.telemetry),
            fatal_handler.clone(),
            ReorgSettings {
                retry_attempts: self.config.command_retry_attempts(),
                retry_initial_backoff: self.config.command_retry_initial_backoff(),
                retry_max_backoff: self.config.command_retry_max_backoff(),
            },
            run_token.clone(),
        );

        let session = Session {
            aggregate,
            pipeline,
            saga,
            queue: Arc::clone(&self.queue),
            frontend,
            sizer: BatchSizer::new(
                self.config.min_batch_size_bytes(),
                self.config.max_batch_bytes(),
                self.config.max_batch_count(),
            ),
            commands,
            projection: Arc::clone(&self.projection),
            publisher: Arc::clone(&self.publisher),
            telemetry: Arc::clone(&self.telemetry),
            fatal_handler: fatal_handler.clone(),
            shutdown: run_token.clone(),
            retry_attempts: self.config.command_retry_attempts(),
            retry_initial_backoff: self.config.command_retry_initial_backoff(),
            retry_max_backoff: self.config.command_retry_max_backoff(),
            armed: false,
        };

        self.metrics_handle = Some(telemetry::spawn_metrics_reporter(
            Arc::clone(&self.telemetry),
            Arc::clone(&self.queue),
            run_token.clone(),
            self.config.metrics_interval(),
        ));
        self.processing_handle = Some(tokio::spawn(async move {
            let mut session = session;
            let result = session.run().await;
            session.finish(result).await
        }));
        self.run_token = Some(run_token);
        self.fatal_handler = Some(fatal_handler);
        self.running = true;

        Ok(())
    }

    /// Stops the dispatcher gracefully.
    ///
    /// Cancels the run token, joins the dispatch loop and worker tasks, and
    /// returns any error the pipeline captured.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }

        tracing::info!("stopping sync dispatcher");

        if let Some(token) = &self.run_token {
            token.cancel();
        }

        let mut pipeline_error: Option<anyhow::Error> = None;
        if let Some(handle) = self.processing_handle.take() {
            match handle.await {
                Ok((commands, result)) => {
                    self.command_rx = Some(commands);
                    if let Err(err) = result {
                        tracing::error!(error = %err, "dispatch loop exited with error");
                        pipeline_error = Some(err);
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to join dispatch loop task");
                    pipeline_error = Some(err.into());
                }
            }
        }
        tracing::debug!("sync dispatcher stop: dispatch loop joined");

        if let Some(handle) = self.metrics_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "metrics reporter terminated unexpectedly");
            }
        }

        let fatal_error = self.fatal_handler.as_ref().and_then(FatalErrorHandler::error);

        self.queue.clear().await;
        self.run_token = None;
        self.fatal_handler = None;
        self.running = false;

        if let Some(err) = pipeline_error.or(fatal_error) {
            return Err(err).context("block sync pipeline aborted");
        }

        Ok(())
    }
}

enum IngestFrontend {
    PollProvider(FetchPool),
    PollTransport,
    WebhookPush(Arc<PushGate>),
}

impl IngestFrontend {
    fn label(&self) -> &'static str {
        match self {
            IngestFrontend::PollProvider(_) => "poll-provider",
            IngestFrontend::PollTransport => "poll-transport",
            IngestFrontend::WebhookPush(_) => "webhook-push",
        }
    }
}

enum CommitOutcome {
    Applied,
    NothingToApply,
    Interrupted,
}

/// Per-run state driven by the dispatch loop. Owns the single mutable handle
/// to the aggregate and the pipeline, so batches never interleave.
struct Session {
    aggregate: ChainAggregate,
    pipeline: CommitPipeline,
    saga: ReorgSaga,
    queue: Arc<BlockQueue>,
    frontend: IngestFrontend,
    sizer: BatchSizer,
    commands: CommandReceiver,
    projection: Arc<dyn BlockProjection>,
    publisher: Arc<dyn EventPublisher>,
    telemetry: Arc<Telemetry>,
    fatal_handler: FatalErrorHandler,
    shutdown: CancellationToken,
    retry_attempts: usize,
    retry_initial_backoff: Duration,
    retry_max_backoff: Duration,
    armed: bool,
}

impl Session {
    async fn run(&mut self) -> Result<()> {
        let mut commands_closed = false;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let pending = self.queue.len().await;
                    if pending > 0 {
                        tracing::info!(
                            pending_blocks = pending,
                            "dispatch loop received shutdown; dropping queued blocks"
                        );
                    }
                    tracing::info!("dispatch loop stopped");
                    return Ok(());
                }
                command = self.commands.recv(), if !commands_closed => {
                    match command {
                        Some(command) => self.handle_command(command).await?,
                        None => {
                            commands_closed = true;
                            tracing::debug!("command channel closed");
                        }
                    }
                }
                items = self.queue.dequeue_batch(
                    self.sizer.byte_limit(),
                    self.sizer.count_limit(),
                ), if self.armed => {
                    self.ingest_queued(items).await?;
                }
            }
        }
    }

    async fn finish(self, result: Result<()>) -> (CommandReceiver, Result<()>) {
        if let IngestFrontend::PollProvider(pool) = self.frontend {
            pool.join().await;
        }
        (self.commands, result)
    }

    async fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::InitIngestion {
                request_id,
                start_height,
                last_read_state_height,
            } => {
                self.init_ingestion(request_id, start_height, last_read_state_height)
                    .await
            }
            Command::LoadBatch { batch, request_id } => self.load_batch(batch, request_id).await,
            Command::ProcessReorganisation {
                blocks,
                height,
                request_id,
                status,
            } => {
                self.process_reorganisation(blocks, height, request_id, status)
                    .await
            }
        }
    }

    /// Arm ingestion at the resume height.
    ///
    /// An explicit `last_read_state_height` wins; otherwise the checkpoint
    /// decides, so blocks accepted but not yet committed are replayed. A
    /// reorg left unresolved by a previous run is finished first and then
    /// overrides both.
    async fn init_ingestion(
        &mut self,
        request_id: RequestId,
        start_height: u64,
        last_read_state_height: Option<u64>,
    ) -> Result<()> {
        tracing::info!(
            request_id = %request_id,
            start_height,
            last_read_state_height = ?last_read_state_height,
            "initialising ingestion"
        );

        if self.armed {
            self.pause_frontend().await;
        }

        let resolved_fork = if self.aggregate.state().is_reorging() {
            tracing::warn!("previous run left a reorg unresolved; resuming recovery first");
            match self
                .saga
                .resume(&mut self.aggregate, &mut self.pipeline, &self.queue)
                .await?
            {
                Some(fork) => Some(fork),
                None => return Ok(()),
            }
        } else {
            None
        };

        let resume = if let Some(fork) = resolved_fork {
            fork.saturating_add(1)
        } else if let Some(last_read) = last_read_state_height {
            last_read.saturating_add(1)
        } else {
            let after_checkpoint = self
                .pipeline
                .checkpoint()
                .map_or(0, |checkpoint| checkpoint.saturating_add(1));
            start_height.max(after_checkpoint)
        };

        self.queue.reset_to(resume).await;
        self.arm_frontend(resume).await;
        self.armed = true;

        tracing::info!(
            resume_height = resume,
            frontend = self.frontend.label(),
            "ingestion armed"
        );
        Ok(())
    }

    async fn load_batch(&mut self, batch: Vec<Block>, request_id: RequestId) -> Result<()> {
        if !self.armed {
            tracing::warn!(
                request_id = %request_id,
                blocks = batch.len(),
                "batch received before ingestion was initialised; ignoring"
            );
            return Ok(());
        }
        if batch.is_empty() {
            return Ok(());
        }

        let batch_bytes: usize = batch.iter().map(|block| block.byte_size()).sum();
        tracing::debug!(
            request_id = %request_id,
            blocks = batch.len(),
            batch_bytes,
            "processing delivered batch"
        );
        self.apply_blocks(batch, batch_bytes).await
    }

    async fn ingest_queued(&mut self, items: Vec<QueueItem>) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let batch_bytes: usize = items.iter().map(QueueItem::size_bytes).sum();
        let blocks: Vec<Block> = items.into_iter().map(QueueItem::into_block).collect();
        self.apply_blocks(blocks, batch_bytes).await
    }

    /// Forward path for one ascending batch: classify against local history,
    /// log acceptance, commit block by block, then handle a detected fork.
    async fn apply_blocks(&mut self, blocks: Vec<Block>, batch_bytes: usize) -> Result<()> {
        let lights: Vec<LightBlock> = blocks.iter().map(Block::light).collect();
        let plan = self.aggregate.plan_batch(&lights);

        if plan.is_noop() {
            tracing::debug!(skipped = plan.skipped(), "batch carried no new work");
            return Ok(());
        }

        let accepted = plan.accepted().to_vec();
        let fork = plan.fork().copied();
        let commit_heights: HashSet<u64> = plan
            .accepted()
            .iter()
            .chain(plan.replayed().iter())
            .map(|light| light.height())
            .collect();

        // The event log records acceptance before any projection write so a
        // crash always leaves the log at or ahead of the checkpoint.
        if !accepted.is_empty() {
            if let Err(err) = self.aggregate.accept_batch(accepted.clone()).await {
                return Err(self
                    .fatal_handler
                    .trigger(PipelineError::new(PipelineStage::Commit, err)));
            }
        }

        let mut projected = 0u64;
        for block in &blocks {
            if !commit_heights.contains(&block.height()) {
                continue;
            }
            if self
                .pipeline
                .checkpoint()
                .map_or(false, |checkpoint| block.height() <= checkpoint)
            {
                continue;
            }

            match self.commit_block(block).await? {
                CommitOutcome::Applied => projected += 1,
                CommitOutcome::NothingToApply => {}
                CommitOutcome::Interrupted => return Ok(()),
            }
        }
        if projected > 0 {
            self.telemetry.record_projected_blocks(projected);
        }

        if let (Some(first), Some(last)) = (accepted.first(), accepted.last()) {
            self.publish(SyncEvent::BatchAccepted {
                first_height: first.height(),
                last_height: last.height(),
                last_hash: *last.hash(),
            })
            .await;
        }

        self.sizer.adjust(batch_bytes);

        if let Some(fork) = fork {
            tracing::warn!(height = fork.height(), "previous hash mismatch at the chain tip");
            self.recover_from_fork().await?;
        }

        Ok(())
    }

    /// Project and commit one block, retrying transient store failures with
    /// bounded backoff. Each attempt re-derives the operation log because a
    /// failed commit clears it.
    async fn commit_block(&mut self, block: &Block) -> Result<CommitOutcome> {
        let height = block.height();
        let mut attempt = 0;
        loop {
            attempt += 1;

            let models = match self.projection.project(block) {
                Ok(models) => models,
                Err(err) => {
                    return Err(self
                        .fatal_handler
                        .trigger(PipelineError::new(PipelineStage::Project, err)));
                }
            };
            self.pipeline.process(models);
            if self.pipeline.pending_operations() == 0 {
                tracing::debug!(height, "block projected no operations; checkpoint unchanged");
                return Ok(CommitOutcome::NothingToApply);
            }

            let error = match self.pipeline.commit(height).await {
                Ok(()) => return Ok(CommitOutcome::Applied),
                Err(err) => err,
            };

            if StoreError::is_constraint_violation(&error) {
                return Err(self
                    .fatal_handler
                    .trigger(PipelineError::new(PipelineStage::Commit, error)));
            }
            if attempt >= self.retry_attempts.max(1) {
                return Err(self
                    .fatal_handler
                    .trigger(PipelineError::new(PipelineStage::Commit, error)));
            }

            self.sizer.shrink_on_failure();
            let delay = self.commit_retry_delay(attempt);
            tracing::warn!(
                height,
                attempt,
                max_attempts = self.retry_attempts,
                backoff_ms = delay.as_millis() as u64,
                error = %error,
                "commit failed; retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => return Ok(CommitOutcome::Interrupted),
            }
        }
    }

    fn commit_retry_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(8) as u32;
        let scaled = self
            .retry_initial_backoff
            .saturating_mul(2u32.saturating_pow(exponent));
        scaled.min(self.retry_max_backoff)
    }

    async fn recover_from_fork(&mut self) -> Result<()> {
        self.pause_frontend().await;
        let resolved = self
            .saga
            .run(&mut self.aggregate, &mut self.pipeline, &self.queue)
            .await?;
        let Some(fork_height) = resolved else {
            return Ok(());
        };
        if self.armed {
            self.arm_frontend(fork_height.saturating_add(1)).await;
        }
        Ok(())
    }

    /// Handle a reorganisation notice from an external driver. Every arm is
    /// duplicate-tolerant: the local state decides whether a step still
    /// applies, so redelivered notices are no-ops.
    async fn process_reorganisation(
        &mut self,
        blocks: Vec<LightBlock>,
        height: u64,
        request_id: RequestId,
        status: ReorgStatus,
    ) -> Result<()> {
        tracing::info!(
            request_id = %request_id,
            height,
            status = ?status,
            announced_blocks = blocks.len(),
            "reorganisation notice received"
        );

        match status {
            ReorgStatus::Started => {
                if self.aggregate.state().is_reorging() {
                    tracing::debug!("recovery already in progress; notice ignored");
                    return Ok(());
                }
                if self.aggregate.state().tip().is_none() {
                    tracing::debug!("no local history; nothing to unwind");
                    return Ok(());
                }
                self.recover_from_fork().await
            }
            ReorgStatus::Unwinding => {
                let local_tip = self.aggregate.state().tip().map(|tip| tip.height());
                if local_tip.map_or(true, |tip| tip < height) {
                    tracing::debug!(
                        height,
                        local_tip = ?local_tip,
                        "height already unwound locally; step ignored"
                    );
                    return Ok(());
                }
                if let Err(err) = self.pipeline.rollback(height).await {
                    return Err(self
                        .fatal_handler
                        .trigger(PipelineError::new(PipelineStage::Rollback, err)));
                }
                if let Err(err) = self.aggregate.record_unwound(height).await {
                    return Err(self
                        .fatal_handler
                        .trigger(PipelineError::new(PipelineStage::Rollback, err)));
                }
                self.telemetry.record_reorg_step();
                Ok(())
            }
            ReorgStatus::Resolved => {
                if !self.aggregate.state().is_reorging() {
                    tracing::debug!(height, "no recovery in progress; resolution ignored");
                    return Ok(());
                }
                self.queue.re_arm(height).await;
                if let Err(err) = self.aggregate.resolve_reorg(height).await {
                    return Err(self
                        .fatal_handler
                        .trigger(PipelineError::new(PipelineStage::Rollback, err)));
                }
                self.telemetry.record_reorg_resolved();
                if self.armed {
                    self.arm_frontend(height.saturating_add(1)).await;
                }
                Ok(())
            }
        }
    }

    async fn pause_frontend(&self) {
        match &self.frontend {
            IngestFrontend::PollProvider(pool) => pool.pause_and_drain().await,
            IngestFrontend::PollTransport | IngestFrontend::WebhookPush(_) => {
                self.queue.clear().await;
            }
        }
    }

    async fn arm_frontend(&self, resume: u64) {
        match &self.frontend {
            IngestFrontend::PollProvider(pool) => pool.arm(resume, self.queue.epoch().await),
            IngestFrontend::WebhookPush(gate) => gate.arm(resume).await,
            IngestFrontend::PollTransport => {}
        }
    }

    async fn publish(&self, event: SyncEvent) {
        if let Err(err) = self.publisher.publish(event).await {
            tracing::warn!(error = %err, "event publish failed");
        }
    }
}
