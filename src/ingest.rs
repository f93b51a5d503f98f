//! Ingestion primitives: block types, byte accounting, the ordered queue,
//! batch shaping, the polling worker pool, and the webhook admission gate.

pub mod batch;
pub mod block;
pub mod poll;
pub mod push;
pub mod queue;
pub mod sizing;
pub mod worker;
