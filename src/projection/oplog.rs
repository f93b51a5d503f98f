use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field map carried by inserts and updates.
pub type ValueMap = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpMethod {
    Insert,
    Update,
    Delete,
}

/// Row targeting for updates and deletes. Keys are deterministic functions of
/// block content, so the same selector re-derives after a replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Selector {
    ByKey { key: String },
    ByField { field: String, value: Value },
}

/// One pending read-model mutation, produced by a model buffer and consumed
/// by a single atomic commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Insert {
        collection: String,
        key: String,
        values: ValueMap,
    },
    Update {
        collection: String,
        selector: Selector,
        values: ValueMap,
    },
    Delete {
        collection: String,
        selector: Selector,
    },
}

impl Operation {
    pub fn method(&self) -> OpMethod {
        match self {
            Operation::Insert { .. } => OpMethod::Insert,
            Operation::Update { .. } => OpMethod::Update,
            Operation::Delete { .. } => OpMethod::Delete,
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            Operation::Insert { collection, .. }
            | Operation::Update { collection, .. }
            | Operation::Delete { collection, .. } => collection,
        }
    }
}

/// In-memory batch of pending mutations destined for one atomic commit.
#[derive(Debug, Default)]
pub struct OperationLog {
    entries: Vec<Operation>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, operation: Operation) {
        self.entries.push(operation);
    }

    pub fn extend(&mut self, operations: impl IntoIterator<Item = Operation>) {
        self.entries.extend(operations);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Operation] {
        &self.entries
    }

    /// Hands the batch to the caller and leaves the log empty.
    pub fn drain(&mut self) -> Vec<Operation> {
        std::mem::take(&mut self.entries)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
