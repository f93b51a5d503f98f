//! Interface to the remote node this pipeline consumes blocks from. Concrete
//! transports (JSON-RPC pools, gRPC gateways) live outside this crate; tests
//! drive the pipeline with an in-memory implementation.

use crate::ingest::block::{Block, LightBlock};
use anyhow::Result;
use futures::future::BoxFuture;
use std::fmt;

#[derive(Debug)]
pub enum ProviderError {
    /// Network or node hiccup worth retrying.
    Transient { detail: String },
    /// The requested height is above the node's current tip.
    HeightOutOfRange { height: u64 },
    /// The node rejected us in a way retries will not fix.
    Unavailable { detail: String },
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Transient { detail } => {
                write!(f, "transient provider failure: {detail}")
            }
            ProviderError::HeightOutOfRange { height } => {
                write!(f, "requested height {height} is above the current tip")
            }
            ProviderError::Unavailable { detail } => {
                write!(f, "provider unavailable: {detail}")
            }
        }
    }
}

impl std::error::Error for ProviderError {}

impl ProviderError {
    pub fn is_height_out_of_range(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<ProviderError>(),
            Some(ProviderError::HeightOutOfRange { .. })
        )
    }

    pub fn is_transient(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<ProviderError>(),
            Some(ProviderError::Transient { .. })
        )
    }
}

/// Read-only view of one canonical chain as reported by a node.
pub trait NodeProvider: Send + Sync {
    /// Fetch a full block by height on the node's current best chain.
    fn get_block(&self, height: u64) -> BoxFuture<'_, Result<Block>>;

    /// Fetch header-only data by height; used during ancestor walk-back.
    fn get_light_block(&self, height: u64) -> BoxFuture<'_, Result<LightBlock>>;

    /// Height of the node's current best tip.
    fn tip_height(&self) -> BoxFuture<'_, Result<u64>>;
}
