mod poll_pipeline;
mod push_pipeline;
mod reorg_pipeline;
mod runner;
