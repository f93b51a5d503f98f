use crate::ingest::block::Block;
use crate::ingest::queue::{BlockQueue, QueueError};
use crate::ingest::sizing::ByteSized;
use crate::runtime::telemetry::Telemetry;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Admission verdict returned to the delivering transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The block was admitted and will become visible in height order.
    Admitted,
    /// The height was already admitted; at-least-once transports should ack.
    Duplicate { height: u64 },
    /// The height skips ahead; the transport must deliver `expected` first.
    Gap { height: u64, expected: u64 },
    /// A re-arm happened while the push was suspended; the transport should
    /// query [`expected_height`](PushGate::expected_height) and resume there.
    Rearmed { height: u64 },
}

struct GateState {
    expected: u64,
    epoch: u64,
}

/// Admission gate for externally delivered blocks.
///
/// Pushed blocks must arrive in strictly increasing height order with no
/// gaps. The gate serializes pushers, so backpressure from the queue's byte
/// budget suspends the delivering transport directly.
pub struct PushGate {
    queue: Arc<BlockQueue>,
    telemetry: Arc<Telemetry>,
    state: Mutex<GateState>,
}

impl PushGate {
    pub fn new(queue: Arc<BlockQueue>, telemetry: Arc<Telemetry>) -> Self {
        Self {
            queue,
            telemetry,
            state: Mutex::new(GateState {
                expected: 0,
                epoch: 0,
            }),
        }
    }

    /// Point the gate at the next height to accept. Called at startup and
    /// after a reorg resolution re-arms the queue.
    pub async fn arm(&self, expected: u64) {
        let epoch = self.queue.epoch().await;
        let mut state = self.state.lock().await;
        state.expected = expected;
        state.epoch = epoch;
    }

    pub async fn expected_height(&self) -> u64 {
        self.state.lock().await.expected
    }

    /// Validate and admit one pushed block.
    ///
    /// Suspends while the queue byte budget is exhausted; the gate lock is
    /// held for the duration so deliveries stay strictly ordered.
    pub async fn push(&self, block: Block) -> PushOutcome {
        let height = block.height();
        let mut state = self.state.lock().await;

        if height < state.expected {
            return PushOutcome::Duplicate { height };
        }
        if height > state.expected {
            return PushOutcome::Gap {
                height,
                expected: state.expected,
            };
        }

        let size_bytes = block.byte_size();
        match self
            .queue
            .enqueue_sized(block, size_bytes, state.epoch)
            .await
        {
            Ok(()) => {
                self.telemetry.record_enqueued_block();
                state.expected = height + 1;
                PushOutcome::Admitted
            }
            Err(QueueError::StaleEpoch { .. }) => PushOutcome::Rearmed { height },
            Err(QueueError::DuplicateHeight { .. }) => PushOutcome::Duplicate { height },
            Err(QueueError::StaleHeight { .. }) => PushOutcome::Duplicate { height },
        }
    }
}
