//! Atomic engine counters with optional JSON persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for one engine process, optionally continued from disk.
#[derive(Debug)]
pub struct EngineStats {
    /// Cycles committed through a checkpoint
    batches_processed: AtomicU64,
    /// Records folded into an accumulator
    records_merged: AtomicU64,
    /// Records behind the watermark whose window was still open
    late_records_merged: AtomicU64,
    /// Rows rejected by the parser
    parse_errors: AtomicU64,
    /// Records whose window had already been closed
    dropped_late: AtomicU64,
    /// Windows acknowledged by the sink
    windows_emitted: AtomicU64,
    /// Extra sink attempts beyond the first
    sink_retries: AtomicU64,
    /// Cycles that failed and were rolled back
    cycles_failed: AtomicU64,
    /// Process start time
    started_at: DateTime<Utc>,
    /// Path for persisting stats
    persist_path: Option<PathBuf>,
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            batches_processed: AtomicU64::new(0),
            records_merged: AtomicU64::new(0),
            late_records_merged: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            dropped_late: AtomicU64::new(0),
            windows_emitted: AtomicU64::new(0),
            sink_retries: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
            started_at: Utc::now(),
            persist_path: None,
        }
    }

    /// Create counters that continue from a previously saved file.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut stats = Self::new();
        stats.persist_path = Some(path);

        if let Err(e) = stats.load() {
            tracing::warn!(error = %e, "could not load previous stats");
        }

        stats
    }

    pub fn record_batch(&self) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_merged(&self, count: u64) {
        self.records_merged.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_late_merged(&self, count: u64) {
        self.late_records_merged.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_parse_errors(&self, count: u64) {
        self.parse_errors.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_dropped_late(&self, count: u64) {
        self.dropped_late.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_window_emitted(&self) {
        self.windows_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_retries(&self, count: u64) {
        self.sink_retries.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_cycle_failed(&self) {
        self.cycles_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            records_merged: self.records_merged.load(Ordering::Relaxed),
            late_records_merged: self.late_records_merged.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            dropped_late: self.dropped_late.load(Ordering::Relaxed),
            windows_emitted: self.windows_emitted.load(Ordering::Relaxed),
            sink_retries: self.sink_retries.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            last_updated: Utc::now(),
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.snapshot();
        format!(
            "Engine Statistics:\n\
             - Batches processed: {}\n\
             - Records merged: {} ({} late)\n\
             - Rows rejected: {}\n\
             - Late records dropped: {}\n\
             - Windows emitted: {}\n\
             - Sink retries: {}\n\
             - Failed cycles: {}\n\
             - Uptime: {} seconds",
            stats.batches_processed,
            stats.records_merged,
            stats.late_records_merged,
            stats.parse_errors,
            stats.dropped_late,
            stats.windows_emitted,
            stats.sink_retries,
            stats.cycles_failed,
            (Utc::now() - self.started_at).num_seconds()
        )
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json =
                serde_json::to_string_pretty(&self.snapshot()).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: StatsSnapshot =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.batches_processed
                    .store(persisted.batches_processed, Ordering::Relaxed);
                self.records_merged
                    .store(persisted.records_merged, Ordering::Relaxed);
                self.late_records_merged
                    .store(persisted.late_records_merged, Ordering::Relaxed);
                self.parse_errors
                    .store(persisted.parse_errors, Ordering::Relaxed);
                self.dropped_late
                    .store(persisted.dropped_late, Ordering::Relaxed);
                self.windows_emitted
                    .store(persisted.windows_emitted, Ordering::Relaxed);
                self.sink_retries
                    .store(persisted.sink_retries, Ordering::Relaxed);
                self.cycles_failed
                    .store(persisted.cycles_failed, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters; also the persisted format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub batches_processed: u64,
    pub records_merged: u64,
    pub late_records_merged: u64,
    pub parse_errors: u64,
    pub dropped_late: u64,
    pub windows_emitted: u64,
    pub sink_retries: u64,
    pub cycles_failed: u64,
    pub last_updated: DateTime<Utc>,
}

/// Thread-safe shared counters.
pub type SharedStats = Arc<EngineStats>;

/// Create new shared counters, persisted at `path` when given.
pub fn create_shared_stats(path: Option<PathBuf>) -> SharedStats {
    match path {
        Some(path) => Arc::new(EngineStats::with_persistence(path)),
        None => Arc::new(EngineStats::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting() {
        let stats = EngineStats::new();
        stats.record_merged(9);
        stats.record_parse_errors(1);
        stats.record_dropped_late(2);
        stats.record_window_emitted();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.records_merged, 9);
        assert_eq!(snapshot.parse_errors, 1);
        assert_eq!(snapshot.dropped_late, 2);
        assert_eq!(snapshot.windows_emitted, 1);
    }

    #[test]
    fn test_persisted_counts_carry_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");

        let stats = EngineStats::with_persistence(path.clone());
        stats.record_batch();
        stats.record_window_emitted();
        stats.save().unwrap();

        let reloaded = EngineStats::with_persistence(path);
        reloaded.record_batch();
        let snapshot = reloaded.snapshot();
        assert_eq!(snapshot.batches_processed, 2);
        assert_eq!(snapshot.windows_emitted, 1);
    }

    #[test]
    fn test_summary_format() {
        let summary = EngineStats::new().summary();
        assert!(summary.contains("Windows emitted"));
        assert!(summary.contains("Late records dropped"));
    }
}
