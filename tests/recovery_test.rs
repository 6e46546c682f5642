//! Restart and failure-injection tests for the aggregation engine.

use chrono::{DateTime, Duration, TimeZone, Utc};
use meterflow::checkpoint::{Checkpoint, CheckpointError, CheckpointStore, FileCheckpointStore};
use meterflow::core::{Engine, EngineConfig, EngineError, FinalizedWindow};
use meterflow::sink::{MemorySink, RetryPolicy, Sink, SinkError};
use meterflow::source::{Batch, MeasurementRecord};
use meterflow::stats::create_shared_stats;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
}

fn config(lateness_secs: i64) -> EngineConfig {
    EngineConfig {
        window_duration: Duration::minutes(5),
        allowed_lateness: Duration::seconds(lateness_secs),
        retry: RetryPolicy {
            timeout: std::time::Duration::from_secs(2),
            max_attempts: 1,
            backoff: std::time::Duration::from_millis(1),
        },
    }
}

fn batch(id: &str, rows: &[(&str, DateTime<Utc>, f64)]) -> Batch {
    Batch::from_records(
        id,
        rows.iter()
            .map(|(meter, ts, power)| MeasurementRecord::with_active_power(*meter, *ts, *power))
            .collect(),
    )
}

fn open<S: Sink + 'static>(dir: &Path, lateness_secs: i64, sink: S) -> Engine {
    Engine::open(
        config(lateness_secs),
        sink,
        FileCheckpointStore::new(dir),
        create_shared_stats(None),
    )
    .unwrap()
}

fn emitted_for(windows: &[FinalizedWindow], device: &str, start: DateTime<Utc>) -> usize {
    windows
        .iter()
        .filter(|w| w.device_id == device && w.window_start == start)
        .count()
}

/// Writes through to a file store, but fails once `saves_left` reaches zero.
struct CrashingStore {
    inner: FileCheckpointStore,
    saves_left: Arc<AtomicU32>,
}

impl CheckpointStore for CrashingStore {
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if self.saves_left.load(Ordering::SeqCst) == 0 {
            return Err(CheckpointError::Io {
                path: self.inner.path(),
                source: std::io::Error::other("injected crash"),
            });
        }
        self.saves_left.fetch_sub(1, Ordering::SeqCst);
        self.inner.save(checkpoint)
    }

    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        self.inner.load()
    }
}

/// Rejects writes while `failures` is non-zero.
struct FlakySink {
    failures: Arc<AtomicU32>,
    inner: MemorySink,
}

impl Sink for FlakySink {
    fn write(&mut self, window: &FinalizedWindow) -> Result<(), SinkError> {
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(SinkError::Rejected("injected".to_string()));
        }
        self.inner.write(window)
    }
}

#[test]
fn test_restart_resumes_open_windows_without_reemitting() {
    let dir = tempfile::tempdir().unwrap();
    let sink = MemorySink::new();

    let watermark_before = {
        let mut engine = open(dir.path(), 0, sink.clone());
        engine
            .process_batch(batch(
                "b01",
                &[
                    ("MTR-00001", at(0, 0, 10), 100.0),
                    ("MTR-00002", at(0, 3, 0), 50.0),
                ],
            ))
            .unwrap();
        engine
            .process_batch(batch(
                "b02",
                &[
                    ("MTR-00001", at(0, 6, 0), 300.0),
                    ("MTR-00002", at(0, 7, 0), 70.0),
                ],
            ))
            .unwrap();
        assert_eq!(sink.windows().len(), 2);
        engine.watermark()
    };

    let mut engine = open(dir.path(), 0, sink.clone());
    assert_eq!(engine.last_batch_id(), Some("b02"));
    assert_eq!(engine.watermark(), watermark_before);
    assert_eq!(engine.open_window_count(), 2);

    // Redelivered batch is behind the cursor.
    let report = engine
        .process_batch(batch("b02", &[("MTR-00001", at(0, 6, 0), 300.0)]))
        .unwrap();
    assert!(report.skipped);

    let report = engine
        .process_batch(batch(
            "b03",
            &[
                ("MTR-00001", at(0, 8, 0), 500.0),
                ("MTR-00001", at(0, 10, 0), 1.0),
            ],
        ))
        .unwrap();
    assert_eq!(report.emitted.len(), 2);

    let windows = sink.windows();
    assert_eq!(emitted_for(&windows, "MTR-00001", at(0, 0, 0)), 1);
    assert_eq!(emitted_for(&windows, "MTR-00002", at(0, 0, 0)), 1);
    let resumed = windows
        .iter()
        .find(|w| w.device_id == "MTR-00001" && w.window_start == at(0, 5, 0))
        .unwrap();
    assert_eq!(resumed.count, 2);
    assert_eq!(resumed.avg_active_power, 400.0);
}

#[test]
fn test_crash_between_sink_ack_and_checkpoint_duplicates_at_most_once() {
    let dir = tempfile::tempdir().unwrap();
    let sink = MemorySink::new();

    {
        let store = CrashingStore {
            inner: FileCheckpointStore::new(dir.path()),
            saves_left: Arc::new(AtomicU32::new(1)),
        };
        let mut engine =
            Engine::open(config(0), sink.clone(), store, create_shared_stats(None)).unwrap();
        engine
            .process_batch(batch("b01", &[("MTR-00001", at(0, 1, 0), 10.0)]))
            .unwrap();

        let err = engine
            .process_batch(batch("b02", &[("MTR-00001", at(0, 5, 30), 20.0)]))
            .unwrap_err();
        assert!(matches!(err, EngineError::CheckpointWriteFailure(_)));
        assert_eq!(sink.windows().len(), 1);

        // The engine must not carry on past an uncommitted cycle.
        assert!(engine.is_halted());
        assert!(matches!(
            engine.process_batch(batch("b03", &[("MTR-00001", at(0, 9, 0), 1.0)])),
            Err(EngineError::Halted)
        ));
        assert_eq!(engine.last_batch_id(), Some("b01"));
    }

    let mut engine = open(dir.path(), 0, sink.clone());
    assert_eq!(engine.last_batch_id(), Some("b01"));
    engine
        .process_batch(batch("b02", &[("MTR-00001", at(0, 5, 30), 20.0)]))
        .unwrap();
    engine
        .process_batch(batch("b03", &[("MTR-00001", at(0, 11, 0), 1.0)]))
        .unwrap();

    let windows = sink.windows();
    assert_eq!(emitted_for(&windows, "MTR-00001", at(0, 0, 0)), 2);
    assert_eq!(emitted_for(&windows, "MTR-00001", at(0, 5, 0)), 1);

    // Steady state after the boundary: nothing closed is emitted again.
    drop(engine);
    let mut engine = open(dir.path(), 0, sink.clone());
    engine
        .process_batch(batch("b04", &[("MTR-00001", at(0, 20, 0), 1.0)]))
        .unwrap();
    let windows = sink.windows();
    assert_eq!(emitted_for(&windows, "MTR-00001", at(0, 0, 0)), 2);
    assert_eq!(emitted_for(&windows, "MTR-00001", at(0, 5, 0)), 1);
    assert_eq!(emitted_for(&windows, "MTR-00001", at(0, 10, 0)), 1);
}

#[test]
fn test_sink_failure_rolls_back_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let memory = MemorySink::new();
    let failures = Arc::new(AtomicU32::new(0));
    let sink = FlakySink {
        failures: failures.clone(),
        inner: memory.clone(),
    };
    let stats = create_shared_stats(None);
    let mut engine = Engine::open(
        config(0),
        sink,
        FileCheckpointStore::new(dir.path()),
        stats.clone(),
    )
    .unwrap();

    engine
        .process_batch(batch(
            "b01",
            &[
                ("MTR-00001", at(0, 0, 30), 100.0),
                ("MTR-00001", at(0, 1, 30), 200.0),
            ],
        ))
        .unwrap();

    failures.store(1, Ordering::SeqCst);
    let closing = batch(
        "b02",
        &[
            ("MTR-00001", at(0, 2, 0), 300.0),
            ("MTR-00002", at(0, 5, 0), 1.0),
        ],
    );
    let err = engine.process_batch(closing.clone()).unwrap_err();
    assert!(matches!(err, EngineError::SinkWriteFailure { .. }));
    assert!(!engine.is_halted());
    assert_eq!(engine.retry_pending(), Some("b02"));
    assert_eq!(engine.last_batch_id(), Some("b01"));
    assert_eq!(engine.checkpoint().last_batch_id.as_deref(), Some("b01"));
    assert!(memory.windows().is_empty());
    assert_eq!(stats.snapshot().cycles_failed, 1);

    // Later batches must wait until the failed one commits.
    let err = engine
        .process_batch(batch("b03", &[("MTR-00002", at(0, 11, 0), 1.0)]))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::RetryPending { ref pending, ref offered } if pending == "b02" && offered == "b03"
    ));
    assert_eq!(engine.checkpoint().last_batch_id.as_deref(), Some("b01"));

    // Offering the batch again must not double count it.
    let report = engine.process_batch(closing).unwrap();
    assert!(!report.skipped);
    assert_eq!(report.emitted.len(), 1);
    assert_eq!(report.emitted[0].count, 3);
    assert_eq!(report.emitted[0].avg_active_power, 200.0);
    assert_eq!(memory.windows().len(), 1);
    assert_eq!(engine.retry_pending(), None);

    let report = engine
        .process_batch(batch("b03", &[("MTR-00002", at(0, 11, 0), 1.0)]))
        .unwrap();
    assert_eq!(report.emitted.len(), 1);
    assert_eq!(engine.last_batch_id(), Some("b03"));
}

/// Sleeps `delay_ms` before delegating to a memory sink.
struct SlowSink {
    delay_ms: Arc<AtomicU32>,
    inner: MemorySink,
}

impl Sink for SlowSink {
    fn write(&mut self, window: &FinalizedWindow) -> Result<(), SinkError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(u64::from(delay)));
        self.inner.write(window)
    }
}

#[test]
fn test_sink_timeout_aborts_cycle_without_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let memory = MemorySink::new();
    let delay_ms = Arc::new(AtomicU32::new(0));
    let sink = SlowSink {
        delay_ms: delay_ms.clone(),
        inner: memory.clone(),
    };
    let config = EngineConfig {
        retry: RetryPolicy {
            timeout: std::time::Duration::from_millis(20),
            max_attempts: 3,
            backoff: std::time::Duration::from_millis(1),
        },
        ..config(0)
    };
    let mut engine =
        Engine::open(config, sink, FileCheckpointStore::new(dir.path()), create_shared_stats(None))
            .unwrap();

    engine
        .process_batch(batch("b01", &[("MTR-00001", at(0, 1, 0), 100.0)]))
        .unwrap();

    delay_ms.store(300, Ordering::SeqCst);
    let closing = batch("b02", &[("MTR-00001", at(0, 5, 30), 1.0)]);
    let err = engine.process_batch(closing.clone()).unwrap_err();
    match err {
        EngineError::SinkWriteFailure { failure, .. } => {
            assert_eq!(failure.attempts, 3);
            assert!(matches!(failure.last, SinkError::Timeout(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(engine.checkpoint().last_batch_id.as_deref(), Some("b01"));
    assert_eq!(
        FileCheckpointStore::new(dir.path())
            .load()
            .unwrap()
            .unwrap()
            .last_batch_id
            .as_deref(),
        Some("b01")
    );

    // Let the stalled write land, then retry the cycle.
    delay_ms.store(0, Ordering::SeqCst);
    std::thread::sleep(std::time::Duration::from_millis(500));
    let report = engine.process_batch(closing).unwrap();
    assert_eq!(report.emitted.len(), 1);
    assert_eq!(engine.checkpoint().last_batch_id.as_deref(), Some("b02"));

    drop(engine);
    let windows = memory.windows();
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].count, 1);
    assert_eq!(windows[0].avg_active_power, 100.0);
}

#[test]
fn test_open_rejects_degenerate_window() {
    let dir = tempfile::tempdir().unwrap();
    for window_duration in [Duration::zero(), Duration::microseconds(1500)] {
        let config = EngineConfig {
            window_duration,
            ..config(0)
        };
        let result = Engine::open(
            config,
            MemorySink::new(),
            FileCheckpointStore::new(dir.path()),
            create_shared_stats(None),
        );
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }
}

#[test]
fn test_corrupt_checkpoint_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("checkpoint.json"), "{ not json").unwrap();

    let result = Engine::open(
        config(0),
        MemorySink::new(),
        FileCheckpointStore::new(dir.path()),
        create_shared_stats(None),
    );
    assert!(matches!(result, Err(EngineError::CorruptCheckpoint(_))));
}

#[test]
fn test_watermark_never_moves_back_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let sink = MemorySink::new();

    let before = {
        let mut engine = open(dir.path(), 0, sink.clone());
        engine
            .process_batch(batch("b01", &[("MTR-00001", at(1, 0, 0), 1.0)]))
            .unwrap();
        engine.watermark().unwrap()
    };

    // A larger lateness on restart must not lower the watermark.
    let mut engine = open(dir.path(), 600, sink.clone());
    assert_eq!(engine.watermark(), Some(before));

    let report = engine
        .process_batch(batch("b02", &[("MTR-00001", at(0, 57, 0), 1.0)]))
        .unwrap();
    assert_eq!(report.dropped_late, 1);
    assert!(engine.watermark().unwrap() >= before);
}

#[test]
fn test_directory_pipeline_end_to_end() {
    use meterflow::sink::JsonlSink;
    use meterflow::source::{BatchPoller, DirectorySource, PollerConfig};
    use std::sync::atomic::AtomicBool;

    const HEADER: &str = "meter_id,timestamp,voltage,current,active_power,reactive_power,frequency,power_factor,total_energy_kwh";

    let root = tempfile::tempdir().unwrap();
    let raw = root.path().join("raw");
    let out = root.path().join("out");
    let cp = root.path().join("cp");
    std::fs::create_dir_all(&raw).unwrap();

    let write = |name: &str, rows: &[&str]| {
        let mut body = HEADER.to_string();
        for row in rows {
            body.push('\n');
            body.push_str(row);
        }
        std::fs::write(raw.join(name), body).unwrap();
    };

    let drain = || {
        let mut engine = Engine::open(
            config(0),
            JsonlSink::open(&out).unwrap(),
            FileCheckpointStore::new(&cp),
            create_shared_stats(None),
        )
        .unwrap();
        let poller = BatchPoller::start(
            DirectorySource::new(&raw),
            engine.last_batch_id().map(str::to_string),
            PollerConfig {
                trigger_interval: std::time::Duration::from_millis(10),
                prefetch: 2,
                once: true,
            },
            Arc::new(AtomicBool::new(true)),
        );
        for batch in poller.receiver().iter() {
            engine.process_batch(batch.unwrap()).unwrap();
        }
        engine.last_batch_id().map(str::to_string)
    };

    write(
        "smartmeter_20240101T000100Z.csv",
        &[
            "MTR-00001,2024-01-01T00:00:10+00:00,230,5,100,10,50,0.9,1",
            "MTR-00001,2024-01-01T00:02:00+00:00,not-a-number,5,100,10,50,0.9,1",
            "MTR-00001,2024-01-01T00:02:00+00:00,230,5,200,10,50,0.9,1",
        ],
    );
    write(
        "smartmeter_20240101T000500Z.csv",
        &[
            "MTR-00001,2024-01-01T00:04:50+00:00,230,5,300,10,50,0.9,1",
            "MTR-00002,2024-01-01T00:05:01+00:00,230,5,1,10,50,0.9,1",
        ],
    );
    assert_eq!(
        drain().as_deref(),
        Some("smartmeter_20240101T000500Z.csv")
    );

    write(
        "smartmeter_20240101T001100Z.csv",
        &["MTR-00002,2024-01-01T00:11:00+00:00,230,5,1,10,50,0.9,1"],
    );
    assert_eq!(
        drain().as_deref(),
        Some("smartmeter_20240101T001100Z.csv")
    );

    let content = std::fs::read_to_string(out.join("windows.jsonl")).unwrap();
    let rows: Vec<FinalizedWindow> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].device_id, "MTR-00001");
    assert_eq!(rows[0].count, 3);
    assert_eq!(rows[0].avg_active_power, 200.0);
    assert_eq!(rows[1].device_id, "MTR-00002");
    assert_eq!(rows[1].window_start, at(0, 5, 0));
}
