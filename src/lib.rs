//! Meterflow - event-time windowed aggregation of smart meter batches.
//!
//! This library consumes CSV batch files of per-device measurements, groups
//! them into tumbling event-time windows, and emits per-device averages for
//! each window exactly once, with crash-safe checkpoints.
//!
//! # Guarantees
//!
//! - **Bounded lateness**: a window closes once the watermark
//!   (`max event time - allowed lateness`) reaches its end
//! - **Emit once**: a closed window is never reopened; records arriving for
//!   it afterwards are dropped and counted
//! - **Sink before checkpoint**: a checkpoint is written only after every
//!   window closed in its cycle has been acknowledged by the sink
//! - **Resume**: restart reloads the last checkpoint and continues with the
//!   first batch after its cursor
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            meterflow                             │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────────────────┐ │
//! │  │   Poller    │──▶│   Parser    │──▶│         Engine          │ │
//! │  │ (directory) │   │   (CSV)     │   │ watermark ─ windows ─   │ │
//! │  └─────────────┘   └─────────────┘   │ aggregate store         │ │
//! │                                      └───────────┬─────────────┘ │
//! │                                   ┌──────────────┴──────┐        │
//! │                                   ▼                     ▼        │
//! │                            ┌─────────────┐      ┌─────────────┐  │
//! │                            │    Sink     │ then │ Checkpoint  │  │
//! │                            │  (JSONL)    │─────▶│   (JSON)    │  │
//! │                            └─────────────┘      └─────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use meterflow::{create_shared_stats, Engine, EngineConfig, FileCheckpointStore, JsonlSink};
//!
//! let sink = JsonlSink::open("/data/output").expect("Failed to open sink");
//! let checkpoints = FileCheckpointStore::new("/data/checkpoint");
//! let stats = create_shared_stats(None);
//! let mut engine = Engine::open(EngineConfig::default(), sink, checkpoints, stats)
//!     .expect("Failed to open engine");
//!
//! let raw = std::fs::read_to_string("/data/raw/smartmeter_20240101T000000Z.csv").unwrap();
//! let report = engine.process_raw("smartmeter_20240101T000000Z.csv", &raw).unwrap();
//! println!("emitted {} windows", report.emitted.len());
//! ```

pub mod checkpoint;
pub mod config;
pub mod core;
pub mod sink;
pub mod source;
pub mod stats;

// Re-export key types at crate root for convenience
pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointStore, FileCheckpointStore, OpenWindow,
};
pub use config::{parse_duration, Config, ConfigError};
pub use crate::core::{
    AggregateStore, CycleReport, Engine, EngineConfig, EngineError, FinalizedWindow,
    WatermarkTracker, WindowAssigner, WindowKey,
};
pub use sink::{JsonlSink, MemorySink, RetryPolicy, Sink, SinkError, SinkWriter};
pub use source::{Batch, BatchPoller, BatchSource, DirectorySource, MeasurementRecord, ParseError};
pub use stats::{create_shared_stats, EngineStats, SharedStats};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
