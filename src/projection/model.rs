use crate::projection::oplog::{Operation, OperationLog, Selector, ValueMap};
use serde_json::json;

/// Static metadata for one projected entity: where its rows live, which field
/// keys them, and which field records the producing block height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityDef {
    collection: &'static str,
    key_field: &'static str,
    height_field: &'static str,
}

impl EntityDef {
    pub const fn new(
        collection: &'static str,
        key_field: &'static str,
        height_field: &'static str,
    ) -> Self {
        Self {
            collection,
            key_field,
            height_field,
        }
    }

    pub fn collection(&self) -> &'static str {
        self.collection
    }

    pub fn key_field(&self) -> &'static str {
        self.key_field
    }

    pub fn height_field(&self) -> &'static str {
        self.height_field
    }
}

/// Transient mutation buffer for one entity within one block.
///
/// Inserted values are stamped with the key and the producing block height,
/// so a later rollback can target the whole height with one delete.
#[derive(Debug)]
pub struct ModelBuffer {
    entity: &'static EntityDef,
    block_height: u64,
    operations: Vec<Operation>,
}

impl ModelBuffer {
    pub fn new(entity: &'static EntityDef, block_height: u64) -> Self {
        Self {
            entity,
            block_height,
            operations: Vec::new(),
        }
    }

    pub fn entity(&self) -> &'static EntityDef {
        self.entity
    }

    pub fn block_height(&self) -> u64 {
        self.block_height
    }

    pub fn insert(&mut self, key: impl Into<String>, mut values: ValueMap) {
        let key = key.into();
        values.insert(self.entity.key_field().to_owned(), json!(key));
        values.insert(
            self.entity.height_field().to_owned(),
            json!(self.block_height),
        );
        self.operations.push(Operation::Insert {
            collection: self.entity.collection().to_owned(),
            key,
            values,
        });
    }

    pub fn update(&mut self, selector: Selector, values: ValueMap) {
        self.operations.push(Operation::Update {
            collection: self.entity.collection().to_owned(),
            selector,
            values,
        });
    }

    pub fn delete(&mut self, selector: Selector) {
        self.operations.push(Operation::Delete {
            collection: self.entity.collection().to_owned(),
            selector,
        });
    }

    /// Queue a delete of every row this entity recorded at the buffer height.
    pub fn delete_at_height(&mut self) {
        let selector = Selector::ByField {
            field: self.entity.height_field().to_owned(),
            value: json!(self.block_height),
        };
        self.delete(selector);
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Moves the buffered mutations into the shared log, consuming the buffer.
    pub fn drain_into(self, log: &mut OperationLog) {
        log.extend(self.operations);
    }
}
