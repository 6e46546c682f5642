//! Configuration for the meterflow engine.

use crate::core::EngineConfig;
use crate::sink::RetryPolicy;
use crate::source::PollerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Length of each tumbling window
    #[serde(with = "duration_serde")]
    pub window_duration: Duration,

    /// Slack subtracted from the latest event time to form the watermark
    #[serde(with = "duration_serde")]
    pub allowed_lateness: Duration,

    /// Minimum delay between two polls of the source
    #[serde(with = "duration_serde")]
    pub trigger_interval: Duration,

    /// Directory holding the checkpoint and stats files
    pub checkpoint_location: PathBuf,

    /// Directory receiving finalized windows
    pub sink_location: PathBuf,

    /// Directory the producer drops batch files into
    pub source_location: PathBuf,

    /// How long to wait for one sink acknowledgement
    #[serde(with = "duration_serde")]
    pub sink_timeout: Duration,

    /// Sink attempts per window before the cycle fails
    pub sink_max_attempts: u32,

    /// Delay before the first sink retry (doubles per retry)
    #[serde(with = "millis_serde")]
    pub sink_backoff: Duration,

    /// Parsed batches allowed to queue ahead of the engine
    pub prefetch_batches: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("meterflow");

        Self {
            window_duration: Duration::from_secs(300),
            allowed_lateness: Duration::from_secs(300),
            trigger_interval: Duration::from_secs(30),
            checkpoint_location: data_dir.join("checkpoint"),
            sink_location: data_dir.join("output"),
            source_location: data_dir.join("raw"),
            sink_timeout: Duration::from_secs(10),
            sink_max_attempts: 3,
            sink_backoff: Duration::from_millis(500),
            prefetch_batches: 2,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults if it is absent.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)
                .map_err(|e| ConfigError::Parse(e.to_string()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("meterflow")
            .join("config.json")
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_duration.as_millis() == 0 {
            return Err(ConfigError::Invalid(
                "window_duration must be at least 1ms".to_string(),
            ));
        }
        if self.window_duration.subsec_nanos() % 1_000_000 != 0 {
            return Err(ConfigError::Invalid(
                "window_duration must be a whole number of milliseconds".to_string(),
            ));
        }
        if self.sink_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "sink_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.sink_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "sink_timeout must be positive".to_string(),
            ));
        }
        chrono::Duration::from_std(self.window_duration)
            .and(chrono::Duration::from_std(self.allowed_lateness))
            .map_err(|_| ConfigError::Invalid("duration out of range".to_string()))?;
        Ok(())
    }

    /// Engine settings derived from this configuration.
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        self.validate()?;
        let to_chrono = |d: Duration| {
            chrono::Duration::from_std(d)
                .map_err(|_| ConfigError::Invalid("duration out of range".to_string()))
        };

        Ok(EngineConfig {
            window_duration: to_chrono(self.window_duration)?,
            allowed_lateness: to_chrono(self.allowed_lateness)?,
            retry: RetryPolicy {
                timeout: self.sink_timeout,
                max_attempts: self.sink_max_attempts,
                backoff: self.sink_backoff,
            },
        })
    }

    /// Poller settings derived from this configuration.
    pub fn poller_config(&self, once: bool) -> PollerConfig {
        PollerConfig {
            trigger_interval: self.trigger_interval,
            prefetch: self.prefetch_batches,
            once,
        }
    }

    /// Path of the persisted stats file.
    pub fn stats_path(&self) -> PathBuf {
        self.checkpoint_location.join("stats.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.checkpoint_location)?;
        std::fs::create_dir_all(&self.sink_location)?;
        std::fs::create_dir_all(&self.source_location)?;
        Ok(())
    }
}

/// Parse a human duration such as `30 seconds`, `5 minutes`, `500ms` or `2m`.
///
/// A bare number is taken as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(raw.to_string());
    let trimmed = raw.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let value: f64 = number.parse().map_err(|_| invalid())?;
    let unit_secs = match unit.trim().to_ascii_lowercase().as_str() {
        "ms" | "milli" | "millis" | "millisecond" | "milliseconds" => 0.001,
        "" | "s" | "sec" | "secs" | "second" | "seconds" => 1.0,
        "m" | "min" | "mins" | "minute" | "minutes" => 60.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3600.0,
        "d" | "day" | "days" => 86_400.0,
        _ => return Err(invalid()),
    };

    Duration::try_from_secs_f64(value * unit_secs).map_err(|_| invalid())
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Serialize error: {0}")]
    Serialize(String),
    #[error("Invalid duration {0:?}")]
    InvalidDuration(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde support for Duration in seconds; sub-second values are written as fractions.
mod duration_serde {
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            duration.as_secs().serialize(serializer)
        } else {
            duration.as_secs_f64().serialize(serializer)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        let duration = Duration::try_from_secs_f64(secs).map_err(de::Error::custom)?;
        // Settle float noise on the millisecond grid the engine works in.
        let millis = (duration.as_secs_f64() * 1000.0).round() as u64;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for millisecond Durations.
mod millis_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
