//! The window lifecycle manager.
//!
//! One [`Engine`] owns the watermark tracker, the aggregate store, the sink
//! writer and the checkpoint store. It processes one batch per cycle:
//!
//! 1. merge every valid record into its window (or drop it if that window
//!    is already closed);
//! 2. close every window ending at or before the new watermark: write it to
//!    the sink, and evict it only once the sink has acknowledged;
//! 3. save a checkpoint of the cursor, the watermark and the open windows.
//!
//! Cycles are strictly sequential. A cycle that fails before its checkpoint
//! is durable is rolled back to the last committed checkpoint, so the same
//! batch can be offered again without double counting.

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore, CHECKPOINT_VERSION};
use crate::core::aggregate::{AggregateStore, FinalizedWindow, MergeOutcome};
use crate::core::watermark::WatermarkTracker;
use crate::core::windowing::{WindowAssigner, WindowKey};
use crate::sink::{RetryPolicy, Sink, SinkFailure, SinkWriter};
use crate::source::types::Batch;
use crate::stats::SharedStats;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Parse errors logged individually per batch; the rest are only counted.
const LOGGED_PARSE_ERRORS: usize = 5;

/// Engine settings.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub window_duration: Duration,
    pub allowed_lateness: Duration,
    pub retry: RetryPolicy,
}

impl EngineConfig {
    /// Reject settings that cannot form half-open windows.
    pub fn validate(&self) -> Result<(), EngineError> {
        let millis = self.window_duration.num_milliseconds();
        if millis <= 0 || self.window_duration != Duration::milliseconds(millis) {
            return Err(EngineError::InvalidConfig(format!(
                "window duration must be a positive whole number of milliseconds, got {}",
                self.window_duration
            )));
        }
        if self.allowed_lateness < Duration::zero() {
            return Err(EngineError::InvalidConfig(format!(
                "allowed lateness must not be negative, got {}",
                self.allowed_lateness
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::InvalidConfig(
                "sink max attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_duration: Duration::minutes(5),
            allowed_lateness: Duration::minutes(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// Cycle- and startup-level failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("sink write failed for {key}: {failure}")]
    SinkWriteFailure {
        key: WindowKey,
        #[source]
        failure: SinkFailure,
    },
    #[error("checkpoint write failed: {0}")]
    CheckpointWriteFailure(#[source] CheckpointError),
    #[error("refusing to start from corrupt checkpoint: {0}")]
    CorruptCheckpoint(#[source] CheckpointError),
    #[error("checkpoint could not be read: {0}")]
    CheckpointRead(#[source] CheckpointError),
    #[error("engine halted after an uncommitted cycle; restart from the last checkpoint")]
    Halted,
    #[error("batch {pending} failed in the sink and must be retried before {offered}")]
    RetryPending { pending: String, offered: String },
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),
}

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub batch_id: String,
    /// The batch was at or behind the committed cursor and was ignored
    pub skipped: bool,
    pub records_merged: u64,
    pub late_records_merged: u64,
    pub dropped_late: u64,
    pub parse_errors: u64,
    /// Windows written to the sink this cycle, in emission order
    pub emitted: Vec<FinalizedWindow>,
    pub watermark: Option<DateTime<Utc>>,
    pub open_windows: usize,
}

/// Owns all mutable state of one aggregation pipeline.
pub struct Engine {
    id: Uuid,
    config: EngineConfig,
    assigner: WindowAssigner,
    tracker: WatermarkTracker,
    store: AggregateStore,
    last_batch_id: Option<String>,
    committed: Checkpoint,
    sink: SinkWriter,
    checkpoints: Box<dyn CheckpointStore>,
    stats: SharedStats,
    halted: bool,
    /// Batch whose cycle failed in the sink; nothing else may run until it commits
    retry_pending: Option<String>,
}

impl Engine {
    /// Start an engine, resuming from the stored checkpoint if there is one.
    pub fn open<S, C>(
        config: EngineConfig,
        sink: S,
        checkpoints: C,
        stats: SharedStats,
    ) -> Result<Self, EngineError>
    where
        S: Sink + 'static,
        C: CheckpointStore + 'static,
    {
        config.validate()?;

        let id = Uuid::new_v4();
        let committed = match checkpoints.load() {
            Ok(Some(checkpoint)) => {
                info!(
                    last_batch_id = ?checkpoint.last_batch_id,
                    watermark = %checkpoint.watermark,
                    open_windows = checkpoint.open_windows.len(),
                    "resuming from checkpoint"
                );
                checkpoint
            }
            Ok(None) => {
                info!("no checkpoint found, starting cold");
                Checkpoint::empty(id)
            }
            Err(e @ CheckpointError::Corrupt { .. }) => {
                return Err(EngineError::CorruptCheckpoint(e))
            }
            Err(e) => return Err(EngineError::CheckpointRead(e)),
        };

        let mut engine = Self {
            id,
            config,
            assigner: WindowAssigner::new(config.window_duration),
            tracker: WatermarkTracker::new(config.allowed_lateness),
            store: AggregateStore::new(),
            last_batch_id: None,
            committed,
            sink: SinkWriter::spawn(sink, config.retry),
            checkpoints: Box::new(checkpoints),
            stats,
            halted: false,
            retry_pending: None,
        };
        engine.rollback();

        if let Some(w) = engine.committed.open_windows.first() {
            if w.window_end - w.window_start != config.window_duration {
                warn!(
                    persisted = %(w.window_end - w.window_start),
                    configured = %config.window_duration,
                    "window duration changed since the checkpoint; restored windows keep their bounds"
                );
            }
        }

        Ok(engine)
    }

    /// Parse raw batch text and process it.
    pub fn process_raw(&mut self, batch_id: &str, raw: &str) -> Result<CycleReport, EngineError> {
        self.process_batch(Batch::parse(batch_id, raw))
    }

    /// Run one full cycle for `batch`.
    pub fn process_batch(&mut self, batch: Batch) -> Result<CycleReport, EngineError> {
        if self.halted {
            return Err(EngineError::Halted);
        }
        if let Some(pending) = &self.retry_pending {
            if *pending != batch.id {
                return Err(EngineError::RetryPending {
                    pending: pending.clone(),
                    offered: batch.id,
                });
            }
        }

        let mut report = CycleReport {
            batch_id: batch.id.clone(),
            ..CycleReport::default()
        };

        if let Some(ref last) = self.last_batch_id {
            if batch.id.as_str() <= last.as_str() {
                debug!(batch_id = %batch.id, cursor = %last, "batch already committed, skipping");
                report.skipped = true;
                report.watermark = self.watermark();
                report.open_windows = self.store.len();
                return Ok(report);
            }
        }

        report.parse_errors = batch.errors.len() as u64;
        for e in batch.errors.iter().take(LOGGED_PARSE_ERRORS) {
            warn!(batch_id = %batch.id, error = %e, "skipping malformed row");
        }

        self.merge_records(&batch, &mut report);

        let watermark = self.tracker.current();
        if let Err(e) = self.close_windows(watermark, &mut report) {
            self.fail_cycle(&batch.id, &e);
            self.retry_pending = Some(batch.id);
            return Err(e);
        }
        self.store.seal(watermark);
        self.last_batch_id = Some(batch.id.clone());

        let checkpoint = self.build_checkpoint();
        if let Err(e) = self.checkpoints.save(&checkpoint) {
            let e = EngineError::CheckpointWriteFailure(e);
            self.fail_cycle(&batch.id, &e);
            self.halted = true;
            return Err(e);
        }
        self.committed = checkpoint;
        self.retry_pending = None;

        self.stats.record_batch();
        self.stats.record_merged(report.records_merged);
        self.stats.record_late_merged(report.late_records_merged);
        self.stats.record_dropped_late(report.dropped_late);
        self.stats.record_parse_errors(report.parse_errors);

        report.watermark = self.watermark();
        report.open_windows = self.store.len();
        info!(
            batch_id = %report.batch_id,
            merged = report.records_merged,
            late_merged = report.late_records_merged,
            dropped_late = report.dropped_late,
            parse_errors = report.parse_errors,
            emitted = report.emitted.len(),
            open_windows = report.open_windows,
            watermark = ?report.watermark,
            "cycle committed"
        );
        Ok(report)
    }

    fn merge_records(&mut self, batch: &Batch, report: &mut CycleReport) {
        for record in &batch.records {
            let late = self.tracker.is_late(record.timestamp);
            self.tracker.observe(record.timestamp);

            let key = self.assigner.assign(record.timestamp, &record.meter_id);
            match self.store.merge(key, record) {
                MergeOutcome::Merged => {
                    report.records_merged += 1;
                    if late {
                        report.late_records_merged += 1;
                    }
                }
                MergeOutcome::Rejected => {
                    debug!(
                        batch_id = %batch.id,
                        device_id = %record.meter_id,
                        event_time = %record.timestamp,
                        "dropping record for an already closed window"
                    );
                    report.dropped_late += 1;
                }
            }
        }
    }

    fn close_windows(
        &mut self,
        watermark: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<(), EngineError> {
        for key in self.store.closed_keys(watermark) {
            let Some(window) = self.store.peek(&key) else {
                continue;
            };

            let attempts = self
                .sink
                .write(&window)
                .map_err(|failure| EngineError::SinkWriteFailure {
                    key: key.clone(),
                    failure,
                })?;

            self.stats.record_window_emitted();
            self.stats
                .record_sink_retries(u64::from(attempts.saturating_sub(1)));
            self.store.finalize(&key);
            report.emitted.push(window);
        }
        Ok(())
    }

    fn build_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            version: CHECKPOINT_VERSION,
            last_batch_id: self.last_batch_id.clone(),
            watermark: self.store.sealed_through(),
            max_event_time: self.tracker.max_seen(),
            open_windows: self.store.snapshot(),
            engine_id: self.id,
            written_at: Utc::now(),
        }
    }

    fn fail_cycle(&mut self, batch_id: &str, e: &EngineError) {
        error!(batch_id, error = %e, "cycle aborted, rolling back to last checkpoint");
        self.stats.record_cycle_failed();
        self.rollback();
    }

    /// Reset in-memory state to the last committed checkpoint.
    fn rollback(&mut self) {
        let cp = &self.committed;
        self.tracker =
            WatermarkTracker::restore(self.config.allowed_lateness, cp.max_event_time, cp.watermark);
        self.store = AggregateStore::restore(&cp.open_windows, cp.watermark);
        self.last_batch_id = cp.last_batch_id.clone();
    }

    /// Watermark at which windows were last closed, `None` before any event.
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        let sealed = self.store.sealed_through();
        (sealed != crate::core::watermark::EARLIEST).then_some(sealed)
    }

    /// Identifier of the last committed batch.
    pub fn last_batch_id(&self) -> Option<&str> {
        self.committed.last_batch_id.as_deref()
    }

    /// Last durable checkpoint.
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.committed
    }

    pub fn open_window_count(&self) -> usize {
        self.store.len()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Batch that must be offered again before any other, after a sink failure.
    pub fn retry_pending(&self) -> Option<&str> {
        self.retry_pending.as_deref()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}
