use crate::projection::oplog::{Operation, Selector, ValueMap};
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tokio::sync::RwLock;

/// Read-model storage failures that callers branch on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The same key was inserted twice within one batch; either a projection
    /// bug or a broken idempotency contract.
    ConstraintViolation { collection: String, key: String },
    Backend { detail: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::ConstraintViolation { collection, key } => {
                write!(f, "duplicate key {key:?} inserted into {collection:?} within one batch")
            }
            StoreError::Backend { detail } => write!(f, "projection store backend error: {detail}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl StoreError {
    pub fn is_constraint_violation(error: &anyhow::Error) -> bool {
        matches!(
            error.downcast_ref::<StoreError>(),
            Some(StoreError::ConstraintViolation { .. })
        )
    }
}

/// Storage collaborator behind the commit pipeline.
///
/// `apply` is all-or-nothing: a failed batch must leave the store untouched.
/// The checkpoint is the single `system` row; `None` clears it.
pub trait ProjectionStore: Send + Sync {
    fn apply(&self, operations: Vec<Operation>) -> BoxFuture<'_, Result<()>>;
    fn last_block_height(&self) -> BoxFuture<'_, Result<Option<u64>>>;
    fn set_last_block_height(&self, height: Option<u64>) -> BoxFuture<'_, Result<()>>;
}

#[derive(Default)]
struct StoreState {
    collections: HashMap<String, BTreeMap<String, ValueMap>>,
    last_block_height: Option<u64>,
}

/// In-memory read-model store.
///
/// Batches are validated before any row is touched, so a rejected batch
/// leaves the collections exactly as they were. Inserts overwrite an existing
/// row with the same key: keys are deterministic, and a replayed batch after
/// a crash must land on the same final state.
#[derive(Default)]
pub struct MemoryProjectionStore {
    state: RwLock<StoreState>,
}

impl MemoryProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn row(&self, collection: &str, key: &str) -> Option<ValueMap> {
        let state = self.state.read().await;
        state
            .collections
            .get(collection)
            .and_then(|rows| rows.get(key))
            .cloned()
    }

    /// All rows of a collection in key order.
    pub async fn rows(&self, collection: &str) -> Vec<(String, ValueMap)> {
        let state = self.state.read().await;
        state
            .collections
            .get(collection)
            .map(|rows| {
                rows.iter()
                    .map(|(key, values)| (key.clone(), values.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn collection_len(&self, collection: &str) -> usize {
        let state = self.state.read().await;
        state
            .collections
            .get(collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    fn validate(operations: &[Operation]) -> Result<(), StoreError> {
        let mut inserted: HashSet<(&str, &str)> = HashSet::new();
        for operation in operations {
            if let Operation::Insert {
                collection, key, ..
            } = operation
            {
                if !inserted.insert((collection.as_str(), key.as_str())) {
                    return Err(StoreError::ConstraintViolation {
                        collection: collection.clone(),
                        key: key.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn apply_one(state: &mut StoreState, operation: Operation) {
        match operation {
            Operation::Insert {
                collection,
                key,
                values,
            } => {
                state
                    .collections
                    .entry(collection)
                    .or_default()
                    .insert(key, values);
            }
            Operation::Update {
                collection,
                selector,
                values,
            } => {
                let Some(rows) = state.collections.get_mut(&collection) else {
                    return;
                };
                match selector {
                    Selector::ByKey { key } => {
                        if let Some(row) = rows.get_mut(&key) {
                            for (field, value) in values {
                                row.insert(field, value);
                            }
                        }
                    }
                    Selector::ByField { field, value } => {
                        for row in rows.values_mut() {
                            if row.get(&field) == Some(&value) {
                                for (update_field, update_value) in &values {
                                    row.insert(update_field.clone(), update_value.clone());
                                }
                            }
                        }
                    }
                }
            }
            Operation::Delete {
                collection,
                selector,
            } => {
                let Some(rows) = state.collections.get_mut(&collection) else {
                    return;
                };
                match selector {
                    Selector::ByKey { key } => {
                        rows.remove(&key);
                    }
                    Selector::ByField { field, value } => {
                        rows.retain(|_, row| row.get(&field) != Some(&value));
                    }
                }
            }
        }
    }
}

impl ProjectionStore for MemoryProjectionStore {
    fn apply(&self, operations: Vec<Operation>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            Self::validate(&operations).map_err(|err| anyhow!(err))?;

            let mut state = self.state.write().await;
            for operation in operations {
                Self::apply_one(&mut state, operation);
            }
            Ok(())
        })
    }

    fn last_block_height(&self) -> BoxFuture<'_, Result<Option<u64>>> {
        Box::pin(async move { Ok(self.state.read().await.last_block_height) })
    }

    fn set_last_block_height(&self, height: Option<u64>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.state.write().await.last_block_height = height;
            Ok(())
        })
    }
}
