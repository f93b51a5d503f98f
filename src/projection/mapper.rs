use crate::ingest::block::Block;
use crate::projection::model::{EntityDef, ModelBuffer};
use anyhow::Result;

/// Downstream seam: turns accepted blocks into read-model mutations and
/// rolled-back heights into their undo.
///
/// Implementations stay pure: buffers are built in memory and the commit
/// pipeline owns all store I/O. The default `undo` deletes every registered
/// entity's rows at the height, which is correct whenever `project` only
/// inserts; projections that update rows override it.
pub trait BlockProjection: Send + Sync {
    /// Entities this projection writes; drives the default undo.
    fn entities(&self) -> &[&'static EntityDef];

    /// Build the mutation buffers for one accepted block.
    fn project(&self, block: &Block) -> Result<Vec<ModelBuffer>>;

    /// Build the undo buffers for one rolled-back height.
    fn undo(&self, height: u64) -> Result<Vec<ModelBuffer>> {
        let mut buffers = Vec::with_capacity(self.entities().len());
        for entity in self.entities() {
            let mut buffer = ModelBuffer::new(entity, height);
            buffer.delete_at_height();
            buffers.push(buffer);
        }
        Ok(buffers)
    }
}
