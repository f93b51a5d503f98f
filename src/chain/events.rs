use crate::ingest::block::LightBlock;
use serde::{Deserialize, Serialize};

/// Append-only log entry for the chain aggregate.
///
/// Replay of these entries in order rebuilds the aggregate exactly, including
/// a reorg that was interrupted mid-unwind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainEvent {
    /// Newly recorded canonical blocks, ascending and contiguous with the tip.
    BatchAccepted { blocks: Vec<LightBlock> },
    /// A fork was detected while the tip stood at `height`.
    ReorgStarted { height: u64 },
    /// The block at `height` was unwound; the tip moves below it.
    ReorgStepProcessed { height: u64 },
    /// A common ancestor was found at `height`; forward ingestion resumes above it.
    ReorgFinished { height: u64 },
}

impl ChainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ChainEvent::BatchAccepted { .. } => "batch_accepted",
            ChainEvent::ReorgStarted { .. } => "reorg_started",
            ChainEvent::ReorgStepProcessed { .. } => "reorg_step_processed",
            ChainEvent::ReorgFinished { .. } => "reorg_finished",
        }
    }
}

/// A persisted event together with its position in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    sequence: u64,
    event: ChainEvent,
}

impl EventRecord {
    pub fn new(sequence: u64, event: ChainEvent) -> Self {
        Self { sequence, event }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn event(&self) -> &ChainEvent {
        &self.event
    }

    pub fn into_event(self) -> ChainEvent {
        self.event
    }
}
