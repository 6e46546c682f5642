//! Batch discovery in a landing directory and background prefetching.
//!
//! The producer drops `smartmeter_<YYYYMMDDTHHMMSSZ>.csv` files into the
//! landing directory, so file-name order is arrival order. The file name is
//! the batch identifier and the greatest committed name is the cursor.

use crate::source::types::Batch;
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors raised while listing or reading batches.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to list {path:?}: {source}")]
    List {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read batch {id}: {source}")]
    Read { id: String, source: std::io::Error },
}

/// A queue of batches in monotonic arrival order.
pub trait BatchSource: Send {
    /// Identifiers of all available batches strictly after `cursor`, oldest first.
    fn list_after(&self, cursor: Option<&str>) -> Result<Vec<String>, SourceError>;

    /// Raw contents of one batch.
    fn read(&self, id: &str) -> Result<String, SourceError>;
}

/// Batch files in a local directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_batch_file(name: &str) -> bool {
        !name.starts_with('.')
            && name.ends_with(".csv")
            && !name.ends_with(".tmp")
            && !name.ends_with(".part")
    }
}

impl BatchSource for DirectorySource {
    fn list_after(&self, cursor: Option<&str>) -> Result<Vec<String>, SourceError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&self.root).map_err(|source| SourceError::List {
            path: self.root.clone(),
            source,
        })?;

        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|name| Self::is_batch_file(name))
            .filter(|name| cursor.map_or(true, |c| name.as_str() > c))
            .collect();

        names.sort();
        Ok(names)
    }

    fn read(&self, id: &str) -> Result<String, SourceError> {
        std::fs::read_to_string(self.root.join(id)).map_err(|source| SourceError::Read {
            id: id.to_string(),
            source,
        })
    }
}

/// Settings for [`BatchPoller`].
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Minimum delay between two polls of the source
    pub trigger_interval: Duration,
    /// Number of parsed batches that may wait ahead of the engine
    pub prefetch: usize,
    /// Stop after draining what is currently available
    pub once: bool,
}

/// Reads and parses batches on a background thread.
///
/// Batch N+1 is parsed while the engine is still committing batch N. The
/// channel is bounded, so the poller never runs more than `prefetch`
/// batches ahead. Dropping the poller stops the thread.
pub struct BatchPoller {
    receiver: Receiver<Result<Batch, SourceError>>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl BatchPoller {
    /// Start polling `source` for batches after `cursor`.
    pub fn start<S>(
        source: S,
        cursor: Option<String>,
        config: PollerConfig,
        running: Arc<AtomicBool>,
    ) -> Self
    where
        S: BatchSource + 'static,
    {
        let (sender, receiver) = bounded(config.prefetch.max(1));
        let flag = running.clone();

        let handle = thread::spawn(move || {
            poll_loop(source, cursor, config, sender, flag);
        });

        Self {
            receiver,
            running,
            thread_handle: Some(handle),
        }
    }

    /// Receiver of parsed batches. Disconnects once the poller has finished.
    pub fn receiver(&self) -> &Receiver<Result<Batch, SourceError>> {
        &self.receiver
    }

    /// Ask the poller to stop and wait for its thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BatchPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

const STOP_CHECK: Duration = Duration::from_millis(100);

fn poll_loop<S: BatchSource>(
    source: S,
    mut cursor: Option<String>,
    config: PollerConfig,
    sender: Sender<Result<Batch, SourceError>>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        let poll_started = Instant::now();

        let ids = match source.list_after(cursor.as_deref()) {
            Ok(ids) => ids,
            Err(e) => {
                if !send(&sender, Err(e), &running) {
                    return;
                }
                Vec::new()
            }
        };

        for id in &ids {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            match source.read(id) {
                Ok(raw) => {
                    let batch = Batch::parse(id.clone(), &raw);
                    tracing::debug!(batch_id = %id, records = batch.records.len(), "batch prefetched");
                    if !send(&sender, Ok(batch), &running) {
                        return;
                    }
                    cursor = Some(id.clone());
                }
                Err(e) => {
                    // Leave the cursor in place so the file is retried on the next poll.
                    if !send(&sender, Err(e), &running) {
                        return;
                    }
                    break;
                }
            }
        }

        if config.once {
            return;
        }

        while running.load(Ordering::SeqCst) && poll_started.elapsed() < config.trigger_interval {
            thread::sleep(STOP_CHECK.min(config.trigger_interval));
        }
    }
}

/// Blocking send that gives up when the stop flag is lowered or the engine hung up.
fn send(
    sender: &Sender<Result<Batch, SourceError>>,
    mut item: Result<Batch, SourceError>,
    running: &AtomicBool,
) -> bool {
    loop {
        match sender.send_timeout(item, STOP_CHECK) {
            Ok(()) => return true,
            Err(SendTimeoutError::Disconnected(_)) => return false,
            Err(SendTimeoutError::Timeout(back)) => {
                if !running.load(Ordering::SeqCst) {
                    return false;
                }
                item = back;
            }
        }
    }
}
