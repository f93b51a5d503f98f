//! Synchronisation control: commands and progress events, retry policy,
//! reorganisation recovery, and the dispatcher that drives the pipeline.

pub mod backoff;
pub mod commands;
pub mod dispatcher;
pub mod reorg;
