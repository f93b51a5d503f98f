use crate::ingest::block::{Block, LightBlock};
use anyhow::Result;
use bitcoin::BlockHash;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Correlation id attached to commands. Recovery steps mint a fresh one per
/// step so each step is independently retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where an externally driven reorganisation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReorgStatus {
    Started,
    Unwinding,
    Resolved,
}

/// Commands accepted by the dispatcher, delivered in order but possibly more
/// than once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Start (or restart) ingestion. `last_read_state_height` overrides the
    /// persisted checkpoint when the upstream knows better.
    InitIngestion {
        request_id: RequestId,
        start_height: u64,
        last_read_state_height: Option<u64>,
    },
    /// A batch of full blocks in ascending height order.
    LoadBatch {
        batch: Vec<Block>,
        request_id: RequestId,
    },
    /// One externally driven reorganisation transition.
    ProcessReorganisation {
        blocks: Vec<LightBlock>,
        height: u64,
        request_id: RequestId,
        status: ReorgStatus,
    },
}

impl Command {
    pub fn request_id(&self) -> RequestId {
        match self {
            Command::InitIngestion { request_id, .. }
            | Command::LoadBatch { request_id, .. }
            | Command::ProcessReorganisation { request_id, .. } => *request_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Command::InitIngestion { .. } => "init_ingestion",
            Command::LoadBatch { .. } => "load_batch",
            Command::ProcessReorganisation { .. } => "process_reorganisation",
        }
    }
}

/// Notifications published as the pipeline makes progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncEvent {
    /// A contiguous batch was recorded and committed.
    BatchAccepted {
        first_height: u64,
        last_height: u64,
        last_hash: BlockHash,
    },
    /// A fork was detected at tip `height`; `blocks` is the walk segment,
    /// newest first.
    ReorgStarted { blocks: Vec<LightBlock>, height: u64 },
    /// The block at `height` was unwound; `blocks` is the remaining segment.
    ReorgStepProcessed { blocks: Vec<LightBlock>, height: u64 },
    /// The walk resolved at fork point `height`; `blocks` is the abandoned
    /// branch that was unwound.
    ReorgFinished { blocks: Vec<LightBlock>, height: u64 },
}

/// Outbound event seam; the dispatch substrate behind it is out of scope.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: SyncEvent) -> BoxFuture<'_, Result<()>>;
}

/// Publisher that retains everything it is given. Used in tests and as the
/// default in-process sink.
#[derive(Default)]
pub struct RecordingPublisher {
    events: RwLock<Vec<SyncEvent>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<SyncEvent> {
        self.events.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

impl EventPublisher for RecordingPublisher {
    fn publish(&self, event: SyncEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.events.write().await.push(event);
            Ok(())
        })
    }
}

/// Publisher that forwards onto an in-process channel.
pub struct ChannelPublisher {
    sender: mpsc::UnboundedSender<SyncEvent>,
}

impl ChannelPublisher {
    pub fn new(sender: mpsc::UnboundedSender<SyncEvent>) -> Self {
        Self { sender }
    }
}

impl EventPublisher for ChannelPublisher {
    fn publish(&self, event: SyncEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            // A dropped receiver means the consumer has shut down; progress
            // must not depend on anyone listening.
            if self.sender.send(event).is_err() {
                tracing::debug!("event receiver dropped; event discarded");
            }
            Ok(())
        })
    }
}

pub type CommandSender = mpsc::Sender<Command>;
pub type CommandReceiver = mpsc::Receiver<Command>;

pub fn command_channel(capacity: usize) -> (CommandSender, CommandReceiver) {
    mpsc::channel(capacity.max(1))
}
