//! Core functionality of the aggregation engine.
//!
//! This module contains:
//! - Event-time watermark tracking
//! - Tumbling window assignment
//! - The per-window aggregate store
//! - The window lifecycle manager that drives one cycle per batch

pub mod aggregate;
pub mod engine;
pub mod watermark;
pub mod windowing;

// Re-export commonly used types
pub use aggregate::{Accumulator, AggregateStore, FinalizedWindow, MergeOutcome};
pub use engine::{CycleReport, Engine, EngineConfig, EngineError};
pub use watermark::{WatermarkTracker, EARLIEST};
pub use windowing::{WindowAssigner, WindowKey};
