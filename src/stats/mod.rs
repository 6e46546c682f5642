//! Processing counters for the aggregation engine.
//!
//! Row- and record-level problems (parse errors, late drops) are absorbed by
//! the engine and only surface here.

pub mod counters;

// Re-export commonly used types
pub use counters::{create_shared_stats, EngineStats, SharedStats, StatsSnapshot};
