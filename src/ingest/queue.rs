use crate::ingest::block::{Block, QueueItem};
use crate::ingest::sizing::ByteSized;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::{Mutex, Notify};

pub const BYTES_PER_MEGABYTE: usize = 1_048_576;

/// Admission failures. Fullness is not an error: producers suspend instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// A block at this height is already buffered.
    DuplicateHeight { height: u64 },
    /// The height is below the current floor and can never be released.
    StaleHeight { height: u64, floor: u64 },
    /// The producer's epoch predates a re-arm; the block belongs to an abandoned branch.
    StaleEpoch { provided: u64, current: u64 },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::DuplicateHeight { height } => {
                write!(f, "block height {height} is already buffered")
            }
            QueueError::StaleHeight { height, floor } => {
                write!(f, "block height {height} is below the queue floor {floor}")
            }
            QueueError::StaleEpoch { provided, current } => {
                write!(f, "queue epoch {provided} is stale (current epoch {current})")
            }
        }
    }
}

impl std::error::Error for QueueError {}

struct QueueState {
    next_expected: u64,
    epoch: u64,
    next_sequence: u64,
    blocks: HashMap<u64, QueueItem>,
    total_bytes: usize,
}

impl QueueState {
    fn new(next_expected: u64) -> Self {
        Self {
            next_expected,
            epoch: 0,
            next_sequence: 0,
            blocks: HashMap::new(),
            total_bytes: 0,
        }
    }
}

/// Ordered, byte-bounded block buffer.
///
/// Out-of-order admissions above the floor are buffered and released in strictly increasing
/// height order. Producers suspend while the byte budget is exhausted; the next expected height
/// (and any block entering an empty queue) bypasses the budget so a single oversized block cannot
/// wedge admission.
pub struct BlockQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    max_bytes: usize,
}

impl BlockQueue {
    pub fn new(max_bytes: usize) -> Self {
        Self::starting_at(0, max_bytes)
    }

    pub fn starting_at(next_expected: u64, max_bytes: usize) -> Self {
        assert!(max_bytes > 0, "max_bytes must be greater than zero");
        Self {
            state: Mutex::new(QueueState::new(next_expected)),
            notify: Notify::new(),
            max_bytes,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Admit a block, charging its measured byte size against the budget.
    pub async fn enqueue(&self, block: Block) -> Result<(), QueueError> {
        let size_bytes = block.byte_size();
        let epoch = self.epoch().await;
        self.enqueue_sized(block, size_bytes, epoch).await
    }

    /// Admit a block with an explicit size and the producer's captured epoch.
    ///
    /// Suspends while the budget is exhausted. The epoch is re-checked on every wakeup so a
    /// producer parked across a re-arm aborts instead of admitting a stale-branch block.
    pub async fn enqueue_sized(
        &self,
        block: Block,
        size_bytes: usize,
        epoch: u64,
    ) -> Result<(), QueueError> {
        let mut pending_block = Some(block);
        loop {
            let notified = self.notify.notified();
            let mut state = self.state.lock().await;
            if epoch != state.epoch {
                return Err(QueueError::StaleEpoch {
                    provided: epoch,
                    current: state.epoch,
                });
            }
            let height = pending_block
                .as_ref()
                .expect("pending block should exist before admission")
                .height();
            if height < state.next_expected {
                return Err(QueueError::StaleHeight {
                    height,
                    floor: state.next_expected,
                });
            }
            if state.blocks.contains_key(&height) {
                return Err(QueueError::DuplicateHeight { height });
            }
            let prospective_bytes = state.total_bytes.saturating_add(size_bytes);
            let queue_empty = state.blocks.is_empty();
            let is_next_expected = height == state.next_expected;
            if prospective_bytes <= self.max_bytes || queue_empty || is_next_expected {
                let block = pending_block
                    .take()
                    .expect("block should only be admitted once");
                let sequence = state.next_sequence;
                state.next_sequence += 1;
                state
                    .blocks
                    .insert(height, QueueItem::new(block, size_bytes, sequence));
                state.total_bytes = prospective_bytes;
                drop(state);
                self.notify.notify_waiters();
                return Ok(());
            }
            drop(state);
            notified.await;
        }
    }

    /// Remove and return the longest ready prefix within both limits, waiting until at least one
    /// block is ready.
    ///
    /// The first ready block is always included even when it alone exceeds `max_bytes`.
    pub async fn dequeue_batch(&self, max_bytes: usize, max_count: usize) -> Vec<QueueItem> {
        loop {
            let batch = self.try_dequeue_batch(max_bytes, max_count).await;
            if !batch.is_empty() {
                self.notify.notify_waiters();
                return batch;
            }
            #[cfg(test)]
            {
                test_hooks::pause_in_gap().await;
            }
            let notified = self.notify.notified();
            let batch = self.try_dequeue_batch(max_bytes, max_count).await;
            if !batch.is_empty() {
                self.notify.notify_waiters();
                return batch;
            }
            notified.await;
        }
    }

    /// Non-suspending variant of [`dequeue_batch`](Self::dequeue_batch); may return empty.
    pub async fn try_dequeue_batch(&self, max_bytes: usize, max_count: usize) -> Vec<QueueItem> {
        let mut state = self.state.lock().await;
        let mut batch: Vec<QueueItem> = Vec::new();
        let mut batch_bytes = 0usize;
        while batch.len() < max_count.max(1) {
            let expected = state.next_expected;
            let Some(next_size) = state.blocks.get(&expected).map(QueueItem::size_bytes) else {
                break;
            };
            let prospective = batch_bytes.saturating_add(next_size);
            if !batch.is_empty() && prospective > max_bytes {
                break;
            }
            let item = state
                .blocks
                .remove(&expected)
                .expect("ready block should still be buffered under the state lock");
            state.next_expected += 1;
            state.total_bytes = state.total_bytes.saturating_sub(next_size);
            batch_bytes = prospective;
            batch.push(item);
        }
        batch
    }

    /// Drop everything above `from_height`, reset the floor to `from_height + 1` and bump the
    /// epoch so in-flight producers from the abandoned branch are rejected.
    ///
    /// Entries above the fork belong to the abandoned branch; entries at or below it are under
    /// the new floor and can never be released. Both are discarded.
    pub async fn re_arm(&self, from_height: u64) {
        self.reset_to(from_height.saturating_add(1)).await;
    }

    /// Point the floor at an arbitrary next expected height, discarding the buffer and bumping
    /// the epoch. Used when ingestion is (re)initialised at a resume height.
    pub async fn reset_to(&self, next_expected: u64) {
        let mut state = self.state.lock().await;
        state.next_expected = next_expected;
        state.epoch += 1;
        state.blocks.clear();
        state.total_bytes = 0;
        drop(state);
        self.notify.notify_waiters();
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.blocks.clear();
        state.total_bytes = 0;
        drop(state);
        self.notify.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.blocks.len()
    }

    pub async fn bytes(&self) -> usize {
        self.state.lock().await.total_bytes
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.blocks.is_empty()
    }

    pub async fn has_ready_block(&self) -> bool {
        let state = self.state.lock().await;
        state.blocks.contains_key(&state.next_expected)
    }

    pub async fn next_expected(&self) -> u64 {
        self.state.lock().await.next_expected
    }

    pub async fn epoch(&self) -> u64 {
        self.state.lock().await.epoch
    }
}
