//! Chain history: the append-only event log, the replayable aggregate, and
//! batch classification against the lookback window.

pub mod events;
pub mod state;
pub mod store;
