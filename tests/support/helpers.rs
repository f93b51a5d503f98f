use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use projblock::{
    Block, BlockProjection, Command, EntityDef, EventPublisher, EventStore, IngestConfig,
    IngestStrategy, MemoryEventStore, MemoryProjectionStore, ModelBuffer, ProjectionStore,
    PushGate, RecordingPublisher, RequestId, SyncDispatcher, SyncDispatcherParams,
};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use crate::support::chain::MockChain;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

pub static HEADERS: EntityDef = EntityDef::new("block_headers", "hash", "block_height");

/// Minimal projection recording one row per block, keyed by hash.
pub struct HeaderProjection;

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

pub struct Harness {
    pub dispatcher: SyncDispatcher,
    pub chain: MockChain,
    pub event_store: Arc<MemoryEventStore>,
    pub projection_store: Arc<MemoryProjectionStore>,
    pub publisher: Arc<RecordingPublisher>,
}

pub fn harness(config: IngestConfig, chain: MockChain) -> Harness {
    let event_store = Arc::new(MemoryEventStore::new());
    let projection_store = Arc::new(MemoryProjectionStore::new());
    let publisher = Arc::new(RecordingPublisher::new());
    let dispatcher = dispatcher_over(
        config,
        chain.clone(),
        &event_store,
        &projection_store,
        &publisher,
    );
    Harness {
        dispatcher,
        chain,
        event_store,
        projection_store,
        publisher,
    }
}

/// Builds a dispatcher over existing stores, as after a process restart.
pub fn dispatcher_over(
    config: IngestConfig,
    chain: MockChain,
    event_store: &Arc<MemoryEventStore>,
    projection_store: &Arc<MemoryProjectionStore>,
    publisher: &Arc<RecordingPublisher>,
) -> SyncDispatcher {
    SyncDispatcher::new(SyncDispatcherParams {
        config,
        provider: Arc::new(chain),
        projection: Arc::new(HeaderProjection),
        event_store: Arc::clone(event_store) as Arc<dyn EventStore>,
        projection_store: Arc::clone(projection_store) as Arc<dyn ProjectionStore>,
        publisher: Arc::clone(publisher) as Arc<dyn EventPublisher>,
    })
}

pub fn fast_poll_config(start_height: u64) -> IngestConfig {
    IngestConfig::builder()
        .strategy(IngestStrategy::PollProvider)
        .start_height(start_height)
        .fetch_concurrency(3)
        .poll_interval(Duration::from_millis(5))
        .max_poll_interval(Duration::from_millis(40))
        .reorg_window_size(32)
        .command_retry_initial_backoff(Duration::from_millis(5))
        .command_retry_max_backoff(Duration::from_millis(20))
        .build()
        .expect("test config should build")
}

pub async fn arm_ingestion(dispatcher: &SyncDispatcher, start_height: u64) -> Result<()> {
    dispatcher
        .command_sender()
        .send(Command::InitIngestion {
            request_id: RequestId::new(),
            start_height,
            last_read_state_height: None,
        })
        .await
        .context("dispatcher should accept the init command")
}

pub async fn wait_for_checkpoint(
    store: &Arc<MemoryProjectionStore>,
    target: u64,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        let current = store.last_block_height().await?;
        if let Some(height) = current {
            if height >= target {
                return Ok(());
            }
        }
        if start.elapsed() > timeout {
            let reported = current
                .map(|height| height.to_string())
                .unwrap_or_else(|| "<none>".to_owned());
            bail!(
                "checkpoint did not reach {target} within {:?} (last committed: {reported})",
                timeout
            );
        }
        sleep(Duration::from_millis(25)).await;
    }
}

pub async fn wait_for_push_floor(
    gate: &Arc<PushGate>,
    expected: u64,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        let current = gate.expected_height().await;
        if current == expected {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!(
                "push gate did not reach floor {expected} within {:?} (currently: {current})",
                timeout
            );
        }
        sleep(Duration::from_millis(25)).await;
    }
}

/// All committed heights in the headers collection, ascending.
pub async fn committed_heights(store: &Arc<MemoryProjectionStore>) -> Vec<u64> {
    let mut heights: Vec<u64> = store
        .rows(HEADERS.collection())
        .await
        .into_iter()
        .filter_map(|(_, values)| values.get(HEADERS.height_field()).and_then(Value::as_u64))
        .collect();
    heights.sort_unstable();
    heights
}

pub fn assert_is_contiguous(heights: &[u64]) {
    for window in heights.windows(2) {
        if let [lhs, rhs] = window {
            assert_eq!(rhs, &(lhs + 1), "heights must increase monotonically");
        }
    }
}
