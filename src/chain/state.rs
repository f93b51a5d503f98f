//! Event-sourced chain aggregate: canonical tip, lookback window, fork detection.

use crate::chain::events::ChainEvent;
use crate::chain::store::EventStore;
use crate::ingest::block::LightBlock;
use anyhow::{bail, Context, Result};
use bitcoin::BlockHash;
use std::collections::VecDeque;
use std::sync::Arc;

/// Sliding window of recent canonical light blocks, bounded by the reorg
/// lookback limit.
#[derive(Debug, Clone)]
pub struct LookbackWindow {
    limit: usize,
    items: VecDeque<LightBlock>,
}

impl LookbackWindow {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            items: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, block: LightBlock) {
        self.items.push_back(block);
        if self.items.len() > self.limit {
            self.items.pop_front();
        }
    }

    pub fn tip(&self) -> Option<&LightBlock> {
        self.items.back()
    }

    pub fn find_hash(&self, hash: &BlockHash) -> Option<u64> {
        self.items
            .iter()
            .rev()
            .find(|block| block.hash() == hash)
            .map(LightBlock::height)
    }

    /// Removes entries whose height is greater than the provided value while
    /// keeping the older portion of the window intact.
    pub fn truncate_after(&mut self, height: u64) {
        while matches!(self.items.back(), Some(block) if block.height() > height) {
            self.items.pop_back();
        }
    }

    /// Removes entries at or above the provided height.
    pub fn remove_from(&mut self, height: u64) {
        while matches!(self.items.back(), Some(block) if block.height() >= height) {
            self.items.pop_back();
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &LightBlock> {
        self.items.iter()
    }

    /// Window contents from the tip downward, newest first.
    pub fn segment_newest_first(&self) -> Vec<LightBlock> {
        self.items.iter().rev().copied().collect()
    }
}

/// How a batch of incoming blocks relates to the local chain history.
///
/// `accepted` extends the tip and must be recorded; `replayed` blocks are
/// already in local history (at-least-once redelivery) and are re-applied
/// without new events; `fork` carries the first block whose previous hash
/// contradicts the tip.
#[derive(Debug, Clone, Default)]
pub struct BatchPlan {
    accepted: Vec<LightBlock>,
    replayed: Vec<LightBlock>,
    fork: Option<LightBlock>,
    skipped: usize,
}

impl BatchPlan {
    pub fn accepted(&self) -> &[LightBlock] {
        &self.accepted
    }

    pub fn replayed(&self) -> &[LightBlock] {
        &self.replayed
    }

    pub fn fork(&self) -> Option<&LightBlock> {
        self.fork.as_ref()
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn into_accepted(self) -> Vec<LightBlock> {
        self.accepted
    }

    pub fn is_noop(&self) -> bool {
        self.accepted.is_empty() && self.replayed.is_empty() && self.fork.is_none()
    }
}

/// Pure fold target rebuilt by event replay. The aggregate is its only writer.
#[derive(Debug, Clone)]
pub struct ChainState {
    window: LookbackWindow,
    reorg_in_progress: bool,
}

impl ChainState {
    pub fn new(lookback: usize) -> Self {
        Self {
            window: LookbackWindow::new(lookback),
            reorg_in_progress: false,
        }
    }

    pub fn tip(&self) -> Option<LightBlock> {
        self.window.tip().copied()
    }

    pub fn is_reorging(&self) -> bool {
        self.reorg_in_progress
    }

    pub fn window(&self) -> &LookbackWindow {
        &self.window
    }

    pub fn find_hash(&self, hash: &BlockHash) -> Option<u64> {
        self.window.find_hash(hash)
    }

    pub fn apply(&mut self, event: &ChainEvent) {
        match event {
            ChainEvent::BatchAccepted { blocks } => {
                for block in blocks {
                    self.window.push(*block);
                }
            }
            ChainEvent::ReorgStarted { .. } => {
                self.reorg_in_progress = true;
            }
            ChainEvent::ReorgStepProcessed { height } => {
                self.window.remove_from(*height);
            }
            ChainEvent::ReorgFinished { height } => {
                self.window.truncate_after(*height);
                self.reorg_in_progress = false;
            }
        }
    }

    /// Classify an incoming ascending batch against local history without
    /// mutating anything.
    ///
    /// Walks the batch with a simulated tip so blocks later in the batch are
    /// judged against the blocks before them. Stops at the first fork or gap;
    /// everything after it is counted as skipped.
    pub fn plan_batch(&self, lights: &[LightBlock]) -> BatchPlan {
        let mut plan = BatchPlan::default();

        if self.reorg_in_progress {
            plan.skipped = lights.len();
            return plan;
        }

        let mut sim_tip = self.tip();
        let mut remaining = lights.iter();
        while let Some(light) = remaining.next() {
            match sim_tip {
                None => {
                    // Empty history: the first block bootstraps the chain.
                    plan.accepted.push(*light);
                    sim_tip = Some(*light);
                }
                Some(tip) => {
                    if light.height() == tip.height() + 1 {
                        if light.previous_hash() == tip.hash() {
                            plan.accepted.push(*light);
                            sim_tip = Some(*light);
                        } else {
                            plan.fork = Some(*light);
                            plan.skipped += remaining.count();
                            break;
                        }
                    } else if light.height() <= tip.height() {
                        if self.window.find_hash(light.hash()) == Some(light.height()) {
                            plan.replayed.push(*light);
                        } else {
                            plan.skipped += 1;
                        }
                    } else {
                        // Gap: the queue never releases one, so this batch
                        // predates a re-arm. Drop the rest with it.
                        plan.skipped += 1 + remaining.count();
                        break;
                    }
                }
            }
        }

        plan
    }
}

/// Aggregate root: folds `ChainState` from the event store and appends new
/// events before they take effect in memory.
pub struct ChainAggregate {
    store: Arc<dyn EventStore>,
    state: ChainState,
}

impl ChainAggregate {
    /// Rebuilds the aggregate by replaying the full event log.
    pub async fn replay(store: Arc<dyn EventStore>, lookback: usize) -> Result<Self> {
        let records = store
            .load_all()
            .await
            .context("loading chain event log for replay")?;
        let mut state = ChainState::new(lookback);
        for record in &records {
            state.apply(record.event());
        }

        tracing::info!(
            replayed_events = records.len(),
            tip_height = state.tip().map(|tip| tip.height()),
            reorg_in_progress = state.is_reorging(),
            "chain aggregate replayed"
        );

        Ok(Self { store, state })
    }

    pub fn state(&self) -> &ChainState {
        &self.state
    }

    pub fn plan_batch(&self, lights: &[LightBlock]) -> BatchPlan {
        self.state.plan_batch(lights)
    }

    /// Record newly accepted blocks. The event is durable before the in-memory
    /// tip moves, so a crash can only leave the log ahead of the checkpoint,
    /// never behind it.
    pub async fn accept_batch(&mut self, accepted: Vec<LightBlock>) -> Result<()> {
        if accepted.is_empty() {
            return Ok(());
        }
        let event = ChainEvent::BatchAccepted { blocks: accepted };
        self.store
            .append(vec![event.clone()])
            .await
            .context("appending accepted batch to the event log")?;
        self.state.apply(&event);
        Ok(())
    }

    /// Mark the reorg as started and hand back the walk segment, newest first.
    pub async fn begin_reorg(&mut self) -> Result<Vec<LightBlock>> {
        let Some(tip) = self.state.tip() else {
            bail!("fork signalled with no local history");
        };
        let event = ChainEvent::ReorgStarted {
            height: tip.height(),
        };
        self.store
            .append(vec![event.clone()])
            .await
            .context("appending reorg start to the event log")?;
        self.state.apply(&event);
        Ok(self.state.window.segment_newest_first())
    }

    /// Record that `height` has been rolled back; the tip drops below it.
    pub async fn record_unwound(&mut self, height: u64) -> Result<()> {
        let event = ChainEvent::ReorgStepProcessed { height };
        self.store
            .append(vec![event.clone()])
            .await
            .context("appending reorg step to the event log")?;
        self.state.apply(&event);
        Ok(())
    }

    /// Record the found common ancestor and leave the reorg state.
    pub async fn resolve_reorg(&mut self, fork_height: u64) -> Result<()> {
        let event = ChainEvent::ReorgFinished {
            height: fork_height,
        };
        self.store
            .append(vec![event.clone()])
            .await
            .context("appending reorg resolution to the event log")?;
        self.state.apply(&event);
        Ok(())
    }
}
