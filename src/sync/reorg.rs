//! Reorganisation recovery: the ancestor walk-back state machine.

use crate::chain::state::ChainAggregate;
use crate::ingest::block::LightBlock;
use crate::ingest::queue::BlockQueue;
use crate::projection::pipeline::CommitPipeline;
use crate::provider::{NodeProvider, ProviderError};
use crate::runtime::fatal::{FatalErrorHandler, PipelineError, PipelineStage};
use crate::runtime::telemetry::Telemetry;
use crate::sync::backoff::{run_with_retry, RetryDisposition, RetryPolicy};
use crate::sync::commands::{EventPublisher, RequestId, SyncEvent};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retry bounds for the remote light-block fetches issued per step.
#[derive(Debug, Clone, Copy)]
pub struct ReorgSettings {
    pub retry_attempts: usize,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
}

enum StepFetch {
    Remote(LightBlock),
    /// The remote chain is currently shorter than the queried height.
    BeyondTip,
    Cancelled,
}

/// Drives `FORK_DETECTED → UNWINDING → RESOLVED`, one light block per step.
///
/// Each step rolls back the current local tip, records the unwind in the
/// event log, fetches the remote light block at that height, and tests its
/// previous hash against local history. Fatal failures are routed through
/// the fatal handler before being returned.
pub(crate) struct ReorgSaga {
    provider: Arc<dyn NodeProvider>,
    publisher: Arc<dyn EventPublisher>,
    telemetry: Arc<Telemetry>,
    fatal_handler: FatalErrorHandler,
    settings: ReorgSettings,
    shutdown: CancellationToken,
}

impl ReorgSaga {
    pub(crate) fn new(
        provider: Arc<dyn NodeProvider>,
        publisher: Arc<dyn EventPublisher>,
        telemetry: Arc<Telemetry>,
        fatal_handler: FatalErrorHandler,
        settings: ReorgSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            provider,
            publisher,
            telemetry,
            fatal_handler,
            settings,
            shutdown,
        }
    }

    /// Handle a freshly detected fork.
    ///
    /// Returns the fork-point height, or `None` when shutdown interrupted the
    /// walk; the persisted reorg flag makes the next start resume it.
    pub(crate) async fn run(
        &self,
        aggregate: &mut ChainAggregate,
        pipeline: &mut CommitPipeline,
        queue: &BlockQueue,
    ) -> Result<Option<u64>> {
        let Some(tip) = aggregate.state().tip() else {
            let error = PipelineError::new(
                PipelineStage::Rollback,
                anyhow!("fork signalled with no local history"),
            );
            return Err(self.fatal_handler.trigger(error));
        };
        let detected_height = tip.height();

        self.telemetry.record_reorg_started();
        let segment = match aggregate.begin_reorg().await {
            Ok(segment) => segment,
            Err(err) => {
                return Err(self
                    .fatal_handler
                    .trigger(PipelineError::new(PipelineStage::Rollback, err)));
            }
        };

        tracing::warn!(
            tip_height = detected_height,
            window_size = segment.len(),
            "fork detected; walking back to a common ancestor"
        );
        self.publish(SyncEvent::ReorgStarted {
            blocks: segment,
            height: detected_height,
        })
        .await;

        self.unwind(aggregate, pipeline, queue).await
    }

    /// Continue a reorg that a previous run left unresolved.
    pub(crate) async fn resume(
        &self,
        aggregate: &mut ChainAggregate,
        pipeline: &mut CommitPipeline,
        queue: &BlockQueue,
    ) -> Result<Option<u64>> {
        tracing::warn!(
            tip_height = aggregate.state().tip().map(|tip| tip.height()),
            "resuming interrupted reorg recovery"
        );
        self.unwind(aggregate, pipeline, queue).await
    }

    async fn unwind(
        &self,
        aggregate: &mut ChainAggregate,
        pipeline: &mut CommitPipeline,
        queue: &BlockQueue,
    ) -> Result<Option<u64>> {
        let mut unwound: Vec<LightBlock> = Vec::new();

        let fork_height = loop {
            if self.shutdown.is_cancelled() {
                tracing::info!("reorg recovery interrupted by shutdown");
                return Ok(None);
            }

            let Some(top) = aggregate.state().tip() else {
                let error = PipelineError::new(
                    PipelineStage::Rollback,
                    anyhow!(
                        "unable to locate a common ancestor within the lookback window (unwound={})",
                        unwound.len()
                    ),
                );
                return Err(self.fatal_handler.trigger(error));
            };
            let height = top.height();

            // Every step gets its own correlation id and is independently
            // retryable; the rollback below is a no-op when already applied.
            let step_id = RequestId::new();
            tracing::info!(height, request_id = %step_id, "unwinding block");

            if let Err(err) = pipeline.rollback(height).await {
                return Err(self
                    .fatal_handler
                    .trigger(PipelineError::new(PipelineStage::Rollback, err)));
            }
            if let Err(err) = aggregate.record_unwound(height).await {
                return Err(self
                    .fatal_handler
                    .trigger(PipelineError::new(PipelineStage::Rollback, err)));
            }
            self.telemetry.record_reorg_step();
            unwound.push(top);

            let fetched = self.fetch_remote_light(height).await?;
            self.publish(SyncEvent::ReorgStepProcessed {
                blocks: aggregate.state().window().segment_newest_first(),
                height,
            })
            .await;

            match fetched {
                StepFetch::Cancelled => {
                    tracing::info!("reorg recovery interrupted by shutdown");
                    return Ok(None);
                }
                StepFetch::BeyondTip => {
                    tracing::debug!(height, "remote chain is shorter; continuing the walk");
                }
                StepFetch::Remote(remote) => {
                    if let Some(candidate) = aggregate.state().find_hash(remote.previous_hash()) {
                        let unwound_to = aggregate.state().tip().map(|tip| tip.height());
                        if unwound_to == Some(candidate) {
                            break candidate;
                        }
                        tracing::warn!(
                            candidate,
                            unwound_to = ?unwound_to,
                            "ancestor candidate below the unwound tip; continuing walk"
                        );
                    }
                }
            }
        };

        // Resolution: the stepwise rollbacks already left the checkpoint at
        // the fork point. Re-arm the queue so fetching resumes above it.
        queue.re_arm(fork_height).await;
        if let Err(err) = aggregate.resolve_reorg(fork_height).await {
            return Err(self
                .fatal_handler
                .trigger(PipelineError::new(PipelineStage::Rollback, err)));
        }

        self.publish(SyncEvent::ReorgFinished {
            blocks: unwound,
            height: fork_height,
        })
        .await;
        self.telemetry.record_reorg_resolved();
        tracing::info!(
            fork_height,
            resume_height = fork_height.saturating_add(1),
            checkpoint = ?pipeline.checkpoint(),
            "reorg recovery complete"
        );

        Ok(Some(fork_height))
    }

    async fn fetch_remote_light(&self, height: u64) -> Result<StepFetch> {
        let attempts = self.settings.retry_attempts.max(1);
        let result = run_with_retry(
            RetryPolicy::new(
                self.settings.retry_initial_backoff,
                self.settings.retry_max_backoff,
            )
            .with_max_attempts(attempts)
            .with_cancellation(&self.shutdown),
            |_attempt| {
                let provider = Arc::clone(&self.provider);
                let shutdown = self.shutdown.clone();
                async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => Err(anyhow!("light block fetch cancelled")),
                        result = provider.get_light_block(height) => result,
                    }
                }
            },
            |attempt, backoff, err, will_retry| {
                self.telemetry.record_provider_retry();
                if will_retry {
                    tracing::warn!(
                        height,
                        attempt,
                        max_attempts = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "light block fetch failed; retrying"
                    );
                } else {
                    tracing::error!(
                        height,
                        attempt,
                        max_attempts = attempts,
                        error = %err,
                        "light block fetch failed; giving up"
                    );
                }
            },
            |_, err| {
                if ProviderError::is_height_out_of_range(err) {
                    RetryDisposition::Abort
                } else {
                    RetryDisposition::Retry
                }
            },
        )
        .await;

        match result {
            Ok(light) => Ok(StepFetch::Remote(light)),
            Err(err) if ProviderError::is_height_out_of_range(&err) => Ok(StepFetch::BeyondTip),
            Err(err) if self.shutdown.is_cancelled() => {
                tracing::debug!(height, error = %err, "light block fetch cancelled");
                Ok(StepFetch::Cancelled)
            }
            Err(err) => Err(self
                .fatal_handler
                .trigger(PipelineError::new(PipelineStage::Provider, err))),
        }
    }

    async fn publish(&self, event: SyncEvent) {
        if let Err(err) = self.publisher.publish(event).await {
            tracing::warn!(error = %err, "event publish failed");
        }
    }
}
