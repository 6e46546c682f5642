//! Assignment of records to tumbling event-time windows.
//!
//! Windows are fixed-duration, non-overlapping and aligned to the Unix
//! epoch. Every window is the half-open interval `[start, end)`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one accumulator: a window and the device it aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
    /// Start time of the window (inclusive)
    pub window_start: DateTime<Utc>,
    /// End time of the window (exclusive)
    pub window_end: DateTime<Utc>,
    /// Device the window aggregates
    pub device_id: String,
}

impl WindowKey {
    /// Check if a timestamp falls within this window.
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.window_start && timestamp < self.window_end
    }

    /// Whether the window can be closed at the given watermark.
    pub fn is_closed_at(&self, watermark: DateTime<Utc>) -> bool {
        self.window_end <= watermark
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[{}, {})",
            self.device_id,
            self.window_start.to_rfc3339(),
            self.window_end.to_rfc3339()
        )
    }
}

/// Maps event times to tumbling windows.
#[derive(Debug, Clone, Copy)]
pub struct WindowAssigner {
    window_duration: Duration,
}

impl WindowAssigner {
    /// Create an assigner. `window_duration` must be positive.
    pub fn new(window_duration: Duration) -> Self {
        Self { window_duration }
    }

    pub fn window_duration(&self) -> Duration {
        self.window_duration
    }

    /// Start of the window containing `event_time`.
    pub fn window_start(&self, event_time: DateTime<Utc>) -> DateTime<Utc> {
        let size = self.window_duration.num_milliseconds().max(1);
        let sub_milli = event_time.timestamp_subsec_nanos() % 1_000_000;
        // rem_euclid keeps pre-epoch instants flooring downwards.
        let offset = event_time.timestamp_millis().rem_euclid(size);
        event_time - Duration::nanoseconds(i64::from(sub_milli)) - Duration::milliseconds(offset)
    }

    /// Window key for a record with the given event time and device.
    pub fn assign(&self, event_time: DateTime<Utc>, device_id: &str) -> WindowKey {
        let window_start = self.window_start(event_time);
        let window_end = window_start
            .checked_add_signed(self.window_duration)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        WindowKey {
            window_start,
            window_end,
            device_id: device_id.to_string(),
        }
    }
}
