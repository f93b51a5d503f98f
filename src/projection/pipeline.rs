use crate::projection::mapper::BlockProjection;
use crate::projection::model::ModelBuffer;
use crate::projection::oplog::OperationLog;
use crate::projection::store::ProjectionStore;
use crate::runtime::telemetry::Telemetry;
use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitError {
    /// `commit` was called with nothing in the operation log; a silent no-op
    /// here would hide a projection bug.
    EmptyCommit,
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitError::EmptyCommit => write!(f, "commit called with an empty operation log"),
        }
    }
}

impl std::error::Error for CommitError {}

impl CommitError {
    pub fn is_empty_commit(error: &anyhow::Error) -> bool {
        matches!(
            error.downcast_ref::<CommitError>(),
            Some(CommitError::EmptyCommit)
        )
    }
}

/// Accumulates model mutations and commits them atomically, advancing the
/// `last_block_height` checkpoint.
///
/// Single logical writer of the read-model store. Forward commits move the
/// checkpoint up one block at a time; `rollback` is the saga-only reverse
/// path and moves it down.
pub struct CommitPipeline {
    store: Arc<dyn ProjectionStore>,
    projection: Arc<dyn BlockProjection>,
    telemetry: Arc<Telemetry>,
    log: OperationLog,
    checkpoint: Option<u64>,
}

impl CommitPipeline {
    /// Builds the pipeline, loading the persisted checkpoint.
    pub async fn load(
        store: Arc<dyn ProjectionStore>,
        projection: Arc<dyn BlockProjection>,
        telemetry: Arc<Telemetry>,
    ) -> Result<Self> {
        let checkpoint = store
            .last_block_height()
            .await
            .context("loading the projection checkpoint")?;
        Ok(Self {
            store,
            projection,
            telemetry,
            log: OperationLog::new(),
            checkpoint,
        })
    }

    /// Last committed height; `None` before the first commit.
    pub fn checkpoint(&self) -> Option<u64> {
        self.checkpoint
    }

    pub fn pending_operations(&self) -> usize {
        self.log.len()
    }

    /// Drain each model's buffered mutations into the shared log. No store
    /// I/O happens here.
    pub fn process(&mut self, models: Vec<ModelBuffer>) {
        for model in models {
            model.drain_into(&mut self.log);
        }
    }

    /// Write the accumulated log as one atomic batch and advance the
    /// checkpoint to `height`.
    ///
    /// On failure the log is already cleared and the store error is
    /// propagated unmodified; the caller re-derives the batch and retries.
    pub async fn commit(&mut self, height: u64) -> Result<()> {
        if self.log.is_empty() {
            return Err(anyhow!(CommitError::EmptyCommit));
        }

        let operations = self.log.drain();
        let operation_count = operations.len() as u64;

        match self.store.apply(operations).await {
            Ok(()) => {
                self.store
                    .set_last_block_height(Some(height))
                    .await
                    .context("advancing the projection checkpoint")?;
                self.checkpoint = Some(height);
                self.telemetry.record_committed_batch(operation_count);
                tracing::debug!(height, operations = operation_count, "batch committed");
                Ok(())
            }
            Err(err) => {
                self.log.clear();
                self.telemetry.record_commit_failure();
                Err(err)
            }
        }
    }

    /// Undo one height and move the checkpoint below it.
    ///
    /// A no-op when the checkpoint is already below `height`, so a retried
    /// reorg step cannot double-delete. An empty undo batch is permitted; the
    /// checkpoint still moves.
    pub async fn rollback(&mut self, height: u64) -> Result<()> {
        let covered = matches!(self.checkpoint, Some(checkpoint) if checkpoint >= height);
        if !covered {
            tracing::debug!(
                height,
                checkpoint = ?self.checkpoint,
                "rollback skipped; height not committed"
            );
            return Ok(());
        }

        let buffers = self.projection.undo(height)?;
        let mut undo_log = OperationLog::new();
        for buffer in buffers {
            buffer.drain_into(&mut undo_log);
        }
        let operations = undo_log.drain();
        let operation_count = operations.len();

        if !operations.is_empty() {
            self.store.apply(operations).await?;
        }

        let new_checkpoint = height.checked_sub(1);
        self.store.set_last_block_height(new_checkpoint).await?;
        self.checkpoint = new_checkpoint;

        tracing::info!(
            height,
            operations = operation_count,
            checkpoint = ?new_checkpoint,
            "height rolled back"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::block::Block;
    use crate::projection::model::EntityDef;
    use crate::projection::oplog::Operation;
    use crate::projection::store::MemoryProjectionStore;
    use bitcoin::hashes::Hash;
    use bitcoin::BlockHash;
    use futures::future::BoxFuture;
    use serde_json::json;

    static HEADERS: EntityDef = EntityDef::new("block_headers", "hash", "block_height");

    struct HeaderProjection;

    impl BlockProjection for HeaderProjection {
        fn entities(&self) -> &[&'static EntityDef] {
            static ENTITIES: [&EntityDef; 1] = [&HEADERS];
            &ENTITIES
        }

        fn project(&self, block: &Block) -> Result<Vec<ModelBuffer>> {
            let mut buffer = ModelBuffer::new(&HEADERS, block.height());
            let mut values = serde_json::Map::new();
            values.insert("tx_count".into(), json!(block.transactions().len()));
            buffer.insert(block.hash().to_string(), values);
            Ok(vec![buffer])
        }
    }

    struct FailingStore;

    impl ProjectionStore for FailingStore {
        fn apply(&self, _operations: Vec<Operation>) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Err(anyhow!("store unavailable")) })
        }

        fn last_block_height(&self) -> BoxFuture<'_, Result<Option<u64>>> {
            Box::pin(async { Ok(None) })
        }

        fn set_last_block_height(&self, _height: Option<u64>) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn dummy_hash(seed: u64) -> BlockHash {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&seed.to_le_bytes());
        BlockHash::from_slice(&bytes).expect("valid hash")
    }

    fn make_block(height: u64) -> Block {
        Block::new(
            height,
            dummy_hash(height),
            dummy_hash(height.wrapping_sub(1)),
            Vec::new(),
        )
    }

    async fn pipeline_over(store: Arc<MemoryProjectionStore>) -> CommitPipeline {
        CommitPipeline::load(
            store as Arc<dyn ProjectionStore>,
            Arc::new(HeaderProjection),
            Arc::new(Telemetry::default()),
        )
        .await
        .expect("load should succeed")
    }

    #[tokio::test]
    async fn empty_commit_is_an_explicit_error() {
        let store = Arc::new(MemoryProjectionStore::new());
        let mut pipeline = pipeline_over(store).await;

        let err = pipeline
            .commit(1)
            .await
            .expect_err("empty log should not commit");
        assert!(CommitError::is_empty_commit(&err));
    }

    #[tokio::test]
    async fn commit_applies_operations_and_advances_checkpoint() {
        let store = Arc::new(MemoryProjectionStore::new());
        let mut pipeline = pipeline_over(Arc::clone(&store)).await;
        let projection = HeaderProjection;

        let block = make_block(7);
        let models = projection.project(&block).expect("project should succeed");
        pipeline.process(models);
        assert_eq!(pipeline.pending_operations(), 1);

        pipeline.commit(7).await.expect("commit should succeed");

        assert_eq!(pipeline.checkpoint(), Some(7));
        assert_eq!(pipeline.pending_operations(), 0);
        assert_eq!(store.collection_len("block_headers").await, 1);
        assert_eq!(
            store
                .last_block_height()
                .await
                .expect("checkpoint should read"),
            Some(7)
        );
    }

    #[tokio::test]
    async fn committing_the_same_block_twice_is_idempotent() {
        let store = Arc::new(MemoryProjectionStore::new());
        let mut pipeline = pipeline_over(Arc::clone(&store)).await;
        let projection = HeaderProjection;
        let block = make_block(3);

        for _ in 0..2 {
            let models = projection.project(&block).expect("project should succeed");
            pipeline.process(models);
            pipeline.commit(3).await.expect("commit should succeed");
        }

        assert_eq!(store.collection_len("block_headers").await, 1);
        assert_eq!(pipeline.checkpoint(), Some(3));
    }

    #[tokio::test]
    async fn failed_commit_clears_the_log_and_propagates() {
        let mut pipeline = CommitPipeline::load(
            Arc::new(FailingStore),
            Arc::new(HeaderProjection),
            Arc::new(Telemetry::default()),
        )
        .await
        .expect("load should succeed");
        let projection = HeaderProjection;

        let models = projection
            .project(&make_block(1))
            .expect("project should succeed");
        pipeline.process(models);

        let err = pipeline.commit(1).await.expect_err("store fails");
        assert!(err.to_string().contains("store unavailable"));
        assert_eq!(pipeline.pending_operations(), 0, "log must be cleared");
        assert_eq!(pipeline.checkpoint(), None);
    }

    #[tokio::test]
    async fn rollback_restores_checkpoint_and_removes_rows() {
        let store = Arc::new(MemoryProjectionStore::new());
        let mut pipeline = pipeline_over(Arc::clone(&store)).await;
        let projection = HeaderProjection;

        for height in 480..=482 {
            let models = projection
                .project(&make_block(height))
                .expect("project should succeed");
            pipeline.process(models);
            pipeline.commit(height).await.expect("commit should succeed");
        }
        assert_eq!(store.collection_len("block_headers").await, 3);

        pipeline.rollback(482).await.expect("rollback should succeed");
        pipeline.rollback(481).await.expect("rollback should succeed");

        assert_eq!(pipeline.checkpoint(), Some(480));
        assert_eq!(store.collection_len("block_headers").await, 1);
        assert_eq!(
            store
                .last_block_height()
                .await
                .expect("checkpoint should read"),
            Some(480)
        );
    }

    #[tokio::test]
    async fn retried_rollback_is_a_no_op() {
        let store = Arc::new(MemoryProjectionStore::new());
        let mut pipeline = pipeline_over(Arc::clone(&store)).await;
        let projection = HeaderProjection;

        for height in 0..=1 {
            let models = projection
                .project(&make_block(height))
                .expect("project should succeed");
            pipeline.process(models);
            pipeline.commit(height).await.expect("commit should succeed");
        }

        pipeline.rollback(1).await.expect("rollback should succeed");
        pipeline.rollback(1).await.expect("retry must be a no-op");

        assert_eq!(pipeline.checkpoint(), Some(0));
        assert_eq!(store.collection_len("block_headers").await, 1);
    }

    #[tokio::test]
    async fn rollback_of_height_zero_clears_the_checkpoint() {
        let store = Arc::new(MemoryProjectionStore::new());
        let mut pipeline = pipeline_over(Arc::clone(&store)).await;
        let projection = HeaderProjection;

        let models = projection
            .project(&make_block(0))
            .expect("project should succeed");
        pipeline.process(models);
        pipeline.commit(0).await.expect("commit should succeed");

        pipeline.rollback(0).await.expect("rollback should succeed");

        assert_eq!(pipeline.checkpoint(), None);
        assert_eq!(
            store
                .last_block_height()
                .await
                .expect("checkpoint should read"),
            None
        );
    }
}
