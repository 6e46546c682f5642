//! Event-time watermark tracking.
//!
//! The watermark is `max(event time seen) - allowed_lateness`, clamped so it
//! never falls below a floor restored from a checkpoint.

use chrono::{DateTime, Duration, Utc};

/// Earliest representable instant; the watermark before any event is seen.
pub const EARLIEST: DateTime<Utc> = DateTime::<Utc>::MIN_UTC;

/// Tracks the maximum observed event time and derives the watermark from it.
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    allowed_lateness: Duration,
    max_seen: Option<DateTime<Utc>>,
    floor: DateTime<Utc>,
}

impl WatermarkTracker {
    /// Create a tracker in its cold-start state.
    pub fn new(allowed_lateness: Duration) -> Self {
        Self {
            allowed_lateness,
            max_seen: None,
            floor: EARLIEST,
        }
    }

    /// Restore from persisted state.
    ///
    /// `watermark` becomes a floor: the restored watermark is never lower
    /// than it, even if `allowed_lateness` grew since it was written.
    pub fn restore(
        allowed_lateness: Duration,
        max_seen: Option<DateTime<Utc>>,
        watermark: DateTime<Utc>,
    ) -> Self {
        Self {
            allowed_lateness,
            max_seen,
            floor: watermark,
        }
    }

    /// Record an observed event time.
    pub fn observe(&mut self, event_time: DateTime<Utc>) {
        if self.max_seen.map_or(true, |max| event_time > max) {
            self.max_seen = Some(event_time);
        }
    }

    /// Current watermark.
    pub fn current(&self) -> DateTime<Utc> {
        let derived = self
            .max_seen
            .and_then(|max| max.checked_sub_signed(self.allowed_lateness))
            .unwrap_or(EARLIEST);
        derived.max(self.floor)
    }

    /// Whether an event time is behind the current watermark.
    pub fn is_late(&self, event_time: DateTime<Utc>) -> bool {
        event_time < self.current()
    }

    /// Latest event time observed so far.
    pub fn max_seen(&self) -> Option<DateTime<Utc>> {
        self.max_seen
    }

    pub fn allowed_lateness(&self) -> Duration {
        self.allowed_lateness
    }
}
