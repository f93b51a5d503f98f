use crate::runtime::config::IngestStrategy;
use crate::sync::commands::{Command, RequestId};
use crate::sync::dispatcher::{SyncDispatcher, SyncDispatcherParams};
use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Coordinates the dispatcher lifecycle and handles OS signals for graceful shutdowns.
pub struct Runner {
    dispatcher: SyncDispatcher,
    shutdown: CancellationToken,
    started: bool,
}

impl Runner {
    /// Creates a new runner and wires a root [`CancellationToken`] that propagates
    /// through the entire pipeline (dispatcher, fetch workers, queue, reorg recovery).
    pub fn new(params: SyncDispatcherParams) -> Self {
        let shutdown = CancellationToken::new();
        let dispatcher = SyncDispatcher::with_cancellation_token(params, shutdown.clone());
        Self {
            dispatcher,
            shutdown,
            started: false,
        }
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Returns the dispatcher for access to the command sender, the push gate
    /// and telemetry.
    pub fn dispatcher(&self) -> &SyncDispatcher {
        &self.dispatcher
    }

    /// Starts the dispatcher. Self-driving deployments (provider polling and
    /// webhook push) are armed immediately from the configured start height;
    /// transport deployments wait for an `InitIngestion` command from the
    /// driving side.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        self.dispatcher.start().await?;
        if self.dispatcher.config().strategy() != IngestStrategy::PollTransport {
            let command = Command::InitIngestion {
                request_id: RequestId::new(),
                start_height: self.dispatcher.config().start_height(),
                last_read_state_height: None,
            };
            self.dispatcher
                .command_sender()
                .send(command)
                .await
                .context("queueing the initial ingestion command")?;
        }
        self.started = true;
        Ok(())
    }

    /// Stops the pipeline gracefully by cancelling the root token and delegating to the dispatcher.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        self.shutdown.cancel();
        self.dispatcher.stop().await?;
        self.started = false;
        self.reinitialize_shutdown_token();
        Ok(())
    }

    /// Runs until a Ctrl-C (SIGINT) is received or the shutdown token is cancelled elsewhere.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start().await?;
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down runner");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
            }
        }

        self.shutdown.cancel();
        self.dispatcher.stop().await?;
        self.started = false;
        self.reinitialize_shutdown_token();
        Ok(())
    }

    fn reinitialize_shutdown_token(&mut self) {
        self.shutdown = CancellationToken::new();
        self.dispatcher.replace_shutdown_root(self.shutdown.clone());
    }
}
