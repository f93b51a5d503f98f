use crate::chain::events::{ChainEvent, EventRecord};
use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::RwLock;

/// Append-only storage for the chain aggregate's event log.
///
/// The aggregate is the only writer; `load_all` is used once at startup to
/// replay state.
pub trait EventStore: Send + Sync {
    fn append(&self, events: Vec<ChainEvent>) -> BoxFuture<'_, Result<()>>;
    fn load_all(&self) -> BoxFuture<'_, Result<Vec<EventRecord>>>;
}

/// In-memory event log; the durable stores behind real deployments implement
/// the same trait.
#[derive(Default)]
pub struct MemoryEventStore {
    records: RwLock<Vec<EventRecord>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Snapshot of the raw log, newest last.
    pub async fn records(&self) -> Vec<EventRecord> {
        self.records.read().await.clone()
    }
}

impl EventStore for MemoryEventStore {
    fn append(&self, events: Vec<ChainEvent>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut records = self.records.write().await;
            let mut sequence = records.len() as u64;
            for event in events {
                records.push(EventRecord::new(sequence, event));
                sequence += 1;
            }
            Ok(())
        })
    }

    fn load_all(&self) -> BoxFuture<'_, Result<Vec<EventRecord>>> {
        Box::pin(async move { Ok(self.records.read().await.clone()) })
    }
}
