use crate::ingest::sizing::ByteSized;
use bitcoin::{BlockHash, Transaction};
use serde::{Deserialize, Serialize};

/// Serialized size of a block header on the wire.
const BLOCK_HEADER_BYTES: usize = 80;

/// A fetched block, immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    height: u64,
    hash: BlockHash,
    previous_hash: BlockHash,
    transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(
        height: u64,
        hash: BlockHash,
        previous_hash: BlockHash,
        transactions: Vec<Transaction>,
    ) -> Self {
        Self {
            height,
            hash,
            previous_hash,
            transactions,
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn hash(&self) -> &BlockHash {
        &self.hash
    }

    pub fn previous_hash(&self) -> &BlockHash {
        &self.previous_hash
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Header-only view used for ancestor walk-back and event payloads.
    pub fn light(&self) -> LightBlock {
        LightBlock::new(self.height, self.hash, self.previous_hash)
    }
}

impl ByteSized for Block {
    fn byte_size(&self) -> usize {
        BLOCK_HEADER_BYTES.saturating_add(self.transactions.byte_size())
    }
}

/// Height, hash and previous hash only; cheap enough to re-transfer during reorg recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightBlock {
    height: u64,
    hash: BlockHash,
    previous_hash: BlockHash,
}

impl LightBlock {
    pub fn new(height: u64, hash: BlockHash, previous_hash: BlockHash) -> Self {
        Self {
            height,
            hash,
            previous_hash,
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn hash(&self) -> &BlockHash {
        &self.hash
    }

    pub fn previous_hash(&self) -> &BlockHash {
        &self.previous_hash
    }
}

/// A block admitted to the queue, together with its charged size and admission sequence.
///
/// Owned exclusively by the queue until dequeued.
#[derive(Debug, Clone)]
pub struct QueueItem {
    block: Block,
    size_bytes: usize,
    sequence: u64,
}

impl QueueItem {
    pub(crate) fn new(block: Block, size_bytes: usize, sequence: u64) -> Self {
        Self {
            block,
            size_bytes,
            sequence,
        }
    }

    pub fn height(&self) -> u64 {
        self.block.height()
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn into_block(self) -> Block {
        self.block
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}
