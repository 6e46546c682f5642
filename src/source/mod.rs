//! Batch input for the aggregation engine.
//!
//! This module contains:
//! - Measurement record types
//! - The CSV record parser
//! - Batch discovery and background prefetching

pub mod directory;
pub mod parser;
pub mod types;

// Re-export commonly used types
pub use directory::{BatchPoller, BatchSource, DirectorySource, PollerConfig, SourceError};
pub use parser::{parse_batch, parse_timestamp, ParseError, ParseErrorKind, ParsedBatch};
pub use types::{Batch, MeasurementRecord};
