use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use anyhow::{anyhow, bail, Result};
use bitcoin::blockdata::block::{Header as BlockHeader, Version};
use bitcoin::hashes::Hash;
use bitcoin::pow::CompactTarget;
use bitcoin::{BlockHash, TxMerkleNode};
use futures::future::BoxFuture;
use projblock::{Block, LightBlock, NodeProvider, ProviderError};

/// In-process chain simulator serving as the node provider for pipeline tests.
///
/// `tip_limit` bounds what the provider reports and serves, so tests can grow
/// the visible chain step by step. `force_reorg` replaces everything above the
/// fork height with a salted branch, exactly like a competing chain winning.
#[derive(Clone)]
pub struct MockChain {
    inner: Arc<RwLock<HashMap<u64, Block>>>,
    tip_limit: Arc<AtomicU64>,
    epoch: Arc<AtomicU64>,
    failures_remaining: Arc<AtomicU64>,
    offline: Arc<AtomicBool>,
}

impl MockChain {
    pub fn new(length: u64) -> Self {
        assert!(length > 0, "chain needs at least one block");
        let mut by_height = HashMap::new();
        let mut previous = BlockHash::from_slice(&[0u8; 32]).expect("zero hash should deserialize");

        for height in 0..length {
            let block = build_block(height, previous, 0);
            previous = *block.hash();
            by_height.insert(height, block);
        }

        Self {
            inner: Arc::new(RwLock::new(by_height)),
            tip_limit: Arc::new(AtomicU64::new(length.saturating_sub(1))),
            epoch: Arc::new(AtomicU64::new(0)),
            failures_remaining: Arc::new(AtomicU64::new(0)),
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn best_height(&self) -> u64 {
        self.tip_limit.load(Ordering::SeqCst)
    }

    pub fn max_height(&self) -> u64 {
        self.inner
            .read()
            .expect("mock chain poisoned")
            .keys()
            .copied()
            .max()
            .unwrap_or(0)
    }

    /// Current canonical hash at `height`, ignoring the visibility limit.
    pub fn hash_at(&self, height: u64) -> Option<BlockHash> {
        self.inner
            .read()
            .expect("mock chain poisoned")
            .get(&height)
            .map(|block| *block.hash())
    }

    /// Current canonical block at `height`, ignoring the visibility limit.
    /// Used by push tests that deliver blocks themselves.
    pub fn block_at(&self, height: u64) -> Option<Block> {
        self.inner
            .read()
            .expect("mock chain poisoned")
            .get(&height)
            .cloned()
    }

    pub fn set_tip_limit(&self, limit: u64) {
        let clamped = limit.min(self.max_height());
        self.tip_limit.store(clamped, Ordering::SeqCst);
    }

    pub fn advance_tip_by(&self, delta: u64) -> u64 {
        if delta == 0 {
            return self.tip_limit.load(Ordering::SeqCst);
        }

        let max_height = self.max_height();
        loop {
            let current = self.tip_limit.load(Ordering::SeqCst);
            if current >= max_height {
                return max_height;
            }
            let next = current.saturating_add(delta).min(max_height);
            match self
                .tip_limit
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(_) => continue,
            }
        }
    }

    /// Fails the next `count` provider calls with a transient error.
    pub fn fail_next_fetches(&self, count: u64) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// When offline, every provider call fails until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Replace everything above `fork_height` with a fresh salted branch of
    /// `new_suffix_len` blocks. The visibility limit is clamped down if the
    /// new branch is shorter, never raised.
    pub fn force_reorg(&self, fork_height: u64, new_suffix_len: u64) -> Result<()> {
        if new_suffix_len == 0 {
            bail!("new_suffix_len must be greater than zero");
        }

        let mut inner = self.inner.write().expect("mock chain poisoned");
        let salt = self.epoch.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        let parent_hash = inner
            .get(&fork_height)
            .map(|block| *block.hash())
            .ok_or_else(|| anyhow!("cannot reorg: missing fork height {fork_height}"))?;

        inner.retain(|height, _| *height <= fork_height);

        let mut previous = parent_hash;
        for offset in 1..=new_suffix_len {
            let height = fork_height.saturating_add(offset);
            let block = build_block(height, previous, salt);
            previous = *block.hash();
            inner.insert(height, block);
        }

        let new_max = fork_height.saturating_add(new_suffix_len);
        let current_limit = self.tip_limit.load(Ordering::SeqCst);
        if current_limit > new_max {
            self.tip_limit.store(new_max, Ordering::SeqCst);
        }

        Ok(())
    }

    fn take_failure(&self) -> bool {
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                (remaining > 0).then(|| remaining - 1)
            })
            .is_ok()
    }

    fn serve_block(&self, height: u64) -> Result<Block> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(anyhow!(ProviderError::Unavailable {
                detail: "mock chain offline".into(),
            }));
        }
        if self.take_failure() {
            return Err(anyhow!(ProviderError::Transient {
                detail: "scripted fetch failure".into(),
            }));
        }
        if height > self.best_height() {
            return Err(anyhow!(ProviderError::HeightOutOfRange { height }));
        }
        self.block_at(height)
            .ok_or_else(|| anyhow!("missing block {height}"))
    }
}

impl NodeProvider for MockChain {
    fn get_block(&self, height: u64) -> BoxFuture<'_, Result<Block>> {
        Box::pin(async move { self.serve_block(height) })
    }

    fn get_light_block(&self, height: u64) -> BoxFuture<'_, Result<LightBlock>> {
        Box::pin(async move { self.serve_block(height).map(|block| block.light()) })
    }

    fn tip_height(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            if self.offline.load(Ordering::SeqCst) {
                return Err(anyhow!(ProviderError::Unavailable {
                    detail: "mock chain offline".into(),
                }));
            }
            if self.take_failure() {
                return Err(anyhow!(ProviderError::Transient {
                    detail: "scripted tip failure".into(),
                }));
            }
            Ok(self.best_height())
        })
    }
}

fn build_block(height: u64, prev_hash: BlockHash, salt: u64) -> Block {
    let mut merkle_bytes = [0u8; 32];
    merkle_bytes[..8].copy_from_slice(&height.to_le_bytes());
    merkle_bytes[8..16].copy_from_slice(&salt.to_le_bytes());
    let merkle_root = TxMerkleNode::from_slice(&merkle_bytes).expect("valid merkle root bytes");

    let header = BlockHeader {
        version: Version::from_consensus(1),
        prev_blockhash: prev_hash,
        merkle_root,
        time: 1 + height as u32 + salt as u32,
        bits: CompactTarget::from_consensus(0x207f_ffff),
        nonce: height as u32 ^ salt as u32,
    };

    Block::new(height, header.block_hash(), prev_hash, Vec::new())
}
