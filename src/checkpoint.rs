//! Durable engine checkpoints.
//!
//! A checkpoint holds the batch cursor, the watermark and every open
//! accumulator. It is written only after the sink has acknowledged every
//! window closed in the same cycle, and replaced atomically (temp file,
//! fsync, rename) so a crash never exposes a partial file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Current on-disk format version.
pub const CHECKPOINT_VERSION: u32 = 1;

const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Checkpoint errors.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("checkpoint serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("corrupt checkpoint {path:?}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// One open accumulator as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenWindow {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub device_id: String,
    pub count: u64,
    pub sum_voltage: f64,
    pub sum_current: f64,
    pub sum_active_power: f64,
    pub sum_power_factor: f64,
}

/// Snapshot of engine progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    /// Last batch whose effects are fully committed
    pub last_batch_id: Option<String>,
    /// Watermark at which windows were last closed
    #[serde(with = "watermark_serde")]
    pub watermark: DateTime<Utc>,
    /// Latest event time observed
    pub max_event_time: Option<DateTime<Utc>>,
    /// Accumulators not yet emitted
    pub open_windows: Vec<OpenWindow>,
    /// Engine instance that wrote the checkpoint
    pub engine_id: Uuid,
    pub written_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Cold-start state: nothing consumed, earliest watermark, no windows.
    pub fn empty(engine_id: Uuid) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            last_batch_id: None,
            watermark: crate::core::watermark::EARLIEST,
            max_event_time: None,
            open_windows: Vec::new(),
            engine_id,
            written_at: Utc::now(),
        }
    }

    /// Check structural invariants of a loaded checkpoint.
    pub fn validate(&self) -> Result<(), String> {
        if self.version != CHECKPOINT_VERSION {
            return Err(format!("unsupported version {}", self.version));
        }
        for w in &self.open_windows {
            if w.window_end <= w.window_start {
                return Err(format!(
                    "window for {} ends before it starts ({} <= {})",
                    w.device_id, w.window_end, w.window_start
                ));
            }
            if w.count == 0 {
                return Err(format!("empty accumulator for {}", w.device_id));
            }
            if w.window_end <= self.watermark {
                return Err(format!(
                    "open window for {} ending {} is behind the watermark {}",
                    w.device_id, w.window_end, self.watermark
                ));
            }
        }
        Ok(())
    }
}

/// Durable storage for checkpoints.
pub trait CheckpointStore: Send {
    /// Atomically replace the stored checkpoint.
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Most recent fully written checkpoint, or `None` on cold start.
    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError>;
}

/// Checkpoint kept as a JSON file in a directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the live checkpoint file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
        move |source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        fs::create_dir_all(&self.dir).map_err(Self::io(&self.dir))?;

        let path = self.path();
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(checkpoint)?;

        let mut file = File::create(&tmp_path).map_err(Self::io(&tmp_path))?;
        file.write_all(&json).map_err(Self::io(&tmp_path))?;
        file.sync_all().map_err(Self::io(&tmp_path))?;
        drop(file);

        fs::rename(&tmp_path, &path).map_err(Self::io(&path))?;
        sync_dir(&self.dir).map_err(Self::io(&self.dir))?;
        Ok(())
    }

    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path).map_err(Self::io(&path))?;
        let checkpoint: Checkpoint =
            serde_json::from_str(&content).map_err(|e| CheckpointError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        checkpoint
            .validate()
            .map_err(|reason| CheckpointError::Corrupt { path, reason })?;
        Ok(Some(checkpoint))
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Serde support for the watermark; the earliest instant is stored as `null`.
mod watermark_serde {
    use crate::core::watermark::EARLIEST;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(watermark: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let value = (*watermark != EARLIEST).then_some(*watermark);
        value.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<DateTime<Utc>>::deserialize(deserializer)?;
        Ok(value.unwrap_or(EARLIEST))
    }
}
