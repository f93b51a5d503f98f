pub mod chain;
pub mod ingest;
pub mod projection;
pub mod provider;
pub mod runtime;
pub mod sync;

pub use chain::events::{ChainEvent, EventRecord};
pub use chain::state::{BatchPlan, ChainAggregate, ChainState, LookbackWindow};
pub use chain::store::{EventStore, MemoryEventStore};
pub use ingest::batch::BatchSizer;
pub use ingest::block::{Block, LightBlock, QueueItem};
pub use ingest::push::{PushGate, PushOutcome};
pub use ingest::queue::{BlockQueue, QueueError, BYTES_PER_MEGABYTE};
pub use ingest::sizing::ByteSized;
pub use projection::mapper::BlockProjection;
pub use projection::model::{EntityDef, ModelBuffer};
pub use projection::oplog::{OpMethod, Operation, OperationLog, Selector, ValueMap};
pub use projection::pipeline::{CommitError, CommitPipeline};
pub use projection::store::{MemoryProjectionStore, ProjectionStore, StoreError};
pub use provider::{NodeProvider, ProviderError};
pub use runtime::config::{IngestConfig, IngestConfigBuilder, IngestConfigParams, IngestStrategy};
pub use runtime::fatal::{FatalErrorHandler, PipelineError, PipelineStage};
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use sync::commands::{
    command_channel, ChannelPublisher, Command, CommandReceiver, CommandSender, EventPublisher,
    RecordingPublisher, ReorgStatus, RequestId, SyncEvent,
};
pub use sync::dispatcher::{SyncDispatcher, SyncDispatcherParams};
