//! Read-model plumbing: the projection seam, model buffers, the operation
//! log, and the commit pipeline with its height checkpoint.

pub mod mapper;
pub mod model;
pub mod oplog;
pub mod pipeline;
pub mod store;
