//! Append-only destinations for finalized windows.
//!
//! [`SinkWriter`] runs a [`Sink`] on a dedicated thread so each write can be
//! bounded by a timeout, and retries failed or unacknowledged writes with
//! exponential backoff. At most one request is ever queued on the worker: a
//! write that timed out is awaited again instead of being resubmitted, so a
//! window lands at most once per writer even when its ack arrives late.

use crate::core::{FinalizedWindow, WindowKey};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

const SINK_FILE: &str = "windows.jsonl";

/// Sink errors.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sink serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("sink did not acknowledge within {0:?}")]
    Timeout(Duration),
    #[error("sink rejected write: {0}")]
    Rejected(String),
    #[error("sink worker is gone")]
    WorkerGone,
}

/// A durable, append-only destination.
///
/// Returning `Ok` is the acknowledgement: the write must survive a crash.
pub trait Sink: Send {
    fn write(&mut self, window: &FinalizedWindow) -> Result<(), SinkError>;
}

/// Appends one JSON object per line to `<dir>/windows.jsonl`.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    file: File,
}

impl JsonlSink {
    /// Open (or create) the output file in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, SinkError> {
        std::fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(SINK_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for JsonlSink {
    fn write(&mut self, window: &FinalizedWindow) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(window)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// In-memory sink; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    windows: Arc<Mutex<Vec<FinalizedWindow>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, in write order.
    pub fn windows(&self) -> Vec<FinalizedWindow> {
        self.windows
            .lock()
            .map(|w| w.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl Sink for MemorySink {
    fn write(&mut self, window: &FinalizedWindow) -> Result<(), SinkError> {
        let mut windows = self
            .windows
            .lock()
            .map_err(|_| SinkError::Rejected("memory sink poisoned".to_string()))?;
        windows.push(window.clone());
        Ok(())
    }
}

/// Timeout and retry settings for [`SinkWriter`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// How long to wait for one acknowledgement
    pub timeout: Duration,
    /// Attempts per window before giving up (at least 1)
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn delay_before(&self, attempt: u32) -> Duration {
        // attempt is 1-based; no delay before the first one.
        self.backoff
            .saturating_mul(1u32 << attempt.saturating_sub(2).min(16))
    }
}

/// A write that exhausted its attempts.
#[derive(Debug, Error)]
#[error("gave up after {attempts} attempt(s): {last}")]
pub struct SinkFailure {
    pub attempts: u32,
    pub last: SinkError,
}

struct WriteRequest {
    window: FinalizedWindow,
    ack: Sender<Result<(), SinkError>>,
}

/// A submitted write whose ack has not arrived yet.
struct InFlight {
    key: WindowKey,
    acked: Receiver<Result<(), SinkError>>,
}

/// Drives a sink on its own thread with bounded, retried writes.
pub struct SinkWriter {
    requests: Option<Sender<WriteRequest>>,
    policy: RetryPolicy,
    in_flight: Option<InFlight>,
    thread_handle: Option<JoinHandle<()>>,
}

impl SinkWriter {
    /// Move `sink` onto a worker thread.
    pub fn spawn<S>(mut sink: S, policy: RetryPolicy) -> Self
    where
        S: Sink + 'static,
    {
        let (requests, receiver) = unbounded::<WriteRequest>();

        let handle = thread::spawn(move || {
            for request in receiver {
                let result = sink.write(&request.window);
                // The caller may have timed out and stopped listening.
                let _ = request.ack.send(result);
            }
        });

        Self {
            requests: Some(requests),
            policy,
            in_flight: None,
            thread_handle: Some(handle),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Write one window, retrying until acknowledged.
    ///
    /// Returns the number of attempts it took.
    pub fn write(&mut self, window: &FinalizedWindow) -> Result<u32, SinkFailure> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last = SinkError::WorkerGone;

        for attempt in 1..=max_attempts {
            let delay = self.policy.delay_before(attempt);
            if attempt > 1 && !delay.is_zero() {
                thread::sleep(delay);
            }

            match self.try_once(window) {
                Ok(()) => return Ok(attempt),
                Err(e) => {
                    tracing::warn!(
                        window = %window.key(),
                        attempt,
                        max_attempts,
                        error = %e,
                        "sink write failed"
                    );
                    last = e;
                }
            }
        }

        Err(SinkFailure {
            attempts: max_attempts,
            last,
        })
    }

    /// Whether a timed-out write is still waiting for its ack.
    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    fn try_once(&mut self, window: &FinalizedWindow) -> Result<(), SinkError> {
        let key = window.key();

        // An earlier request is still with the worker: wait on it rather than queueing another.
        if let Some(pending) = self.in_flight.take() {
            let same_window = pending.key == key;
            let result = self.await_ack(pending)?;
            if same_window {
                return result;
            }
        }

        let requests = self.requests.as_ref().ok_or(SinkError::WorkerGone)?;
        let (ack, acked) = bounded(1);
        requests
            .send(WriteRequest {
                window: window.clone(),
                ack,
            })
            .map_err(|_| SinkError::WorkerGone)?;

        self.await_ack(InFlight { key, acked })?
    }

    /// Wait up to the policy timeout for `pending`, keeping it in flight on timeout.
    fn await_ack(&mut self, pending: InFlight) -> Result<Result<(), SinkError>, SinkError> {
        match pending.acked.recv_timeout(self.policy.timeout) {
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Timeout) => {
                self.in_flight = Some(pending);
                Err(SinkError::Timeout(self.policy.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(SinkError::WorkerGone),
        }
    }
}

impl Drop for SinkWriter {
    fn drop(&mut self) {
        // Closing the queue lets the worker finish pending writes and exit.
        self.requests.take();
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}
