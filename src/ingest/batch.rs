const MAX_BLOCKS_PER_BATCH: usize = 1_024;

/// Adaptive batch sizing for the dispatcher's dequeue calls.
///
/// Grows the block count while batches come in under the minimum transfer
/// size and shrinks it when a batch lands over the byte ceiling, so batch
/// granularity tracks the actual block sizes on the chain.
#[derive(Debug, Clone)]
pub struct BatchSizer {
    min_bytes: usize,
    max_bytes: usize,
    max_count: usize,
    current_count: usize,
}

impl BatchSizer {
    pub fn new(min_bytes: usize, max_bytes: usize, max_count: usize) -> Self {
        Self {
            min_bytes: min_bytes.min(max_bytes),
            max_bytes: max_bytes.max(1),
            max_count: max_count.clamp(1, MAX_BLOCKS_PER_BATCH),
            current_count: 1,
        }
    }

    /// Current block-count limit for the next dequeue.
    pub fn count_limit(&self) -> usize {
        self.current_count
    }

    /// Byte ceiling for the next dequeue.
    pub fn byte_limit(&self) -> usize {
        self.max_bytes
    }

    /// Feed back the byte size of the batch just drained.
    pub fn adjust(&mut self, batch_bytes: usize) {
        if batch_bytes < self.min_bytes {
            self.current_count = (self.current_count + 1).min(self.max_count);
        } else if batch_bytes > self.max_bytes {
            self.current_count = self.current_count.saturating_sub(1).max(1);
        }
    }

    /// Back off sharply after a failed batch so the retry is small.
    pub fn shrink_on_failure(&mut self) {
        if self.current_count > 1 {
            self.current_count = (self.current_count / 2).max(1);
        }
    }
}
