//! Per-window, per-device running aggregates.
//!
//! Accumulators live in the store from the first record mapped to their
//! window until the window is finalized. Once the store has been sealed up
//! to a watermark, windows ending at or before it can no longer be merged
//! into, so a finalized window is never reopened.

use crate::checkpoint::OpenWindow;
use crate::core::windowing::WindowKey;
use crate::core::watermark::EARLIEST;
use crate::source::types::MeasurementRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Running sums for one window and device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Accumulator {
    pub count: u64,
    pub sum_voltage: f64,
    pub sum_current: f64,
    pub sum_active_power: f64,
    pub sum_power_factor: f64,
}

impl Accumulator {
    /// Fold one record into the sums.
    pub fn add(&mut self, record: &MeasurementRecord) {
        self.count += 1;
        self.sum_voltage += record.voltage;
        self.sum_current += record.current;
        self.sum_active_power += record.active_power;
        self.sum_power_factor += record.power_factor;
    }

    fn mean(&self, sum: f64) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            sum / self.count as f64
        }
    }
}

/// Result emitted for a closed window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedWindow {
    pub device_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub count: u64,
    pub avg_voltage: f64,
    pub avg_current: f64,
    pub avg_active_power: f64,
    pub avg_power_factor: f64,
}

impl FinalizedWindow {
    fn from_parts(key: &WindowKey, acc: &Accumulator) -> Self {
        Self {
            device_id: key.device_id.clone(),
            window_start: key.window_start,
            window_end: key.window_end,
            count: acc.count,
            avg_voltage: acc.mean(acc.sum_voltage),
            avg_current: acc.mean(acc.sum_current),
            avg_active_power: acc.mean(acc.sum_active_power),
            avg_power_factor: acc.mean(acc.sum_power_factor),
        }
    }

    /// Key of the window this result closes.
    pub fn key(&self) -> WindowKey {
        WindowKey {
            window_start: self.window_start,
            window_end: self.window_end,
            device_id: self.device_id.clone(),
        }
    }
}

/// Outcome of [`AggregateStore::merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The record was folded into an open (possibly new) accumulator.
    Merged,
    /// The window was already closed; the record was not applied.
    Rejected,
}

/// Open accumulators keyed by window and device.
#[derive(Debug, Clone)]
pub struct AggregateStore {
    windows: BTreeMap<WindowKey, Accumulator>,
    sealed_through: DateTime<Utc>,
}

impl Default for AggregateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregateStore {
    pub fn new() -> Self {
        Self {
            windows: BTreeMap::new(),
            sealed_through: EARLIEST,
        }
    }

    /// Merge a record into the accumulator for `key`, creating it if absent.
    pub fn merge(&mut self, key: WindowKey, record: &MeasurementRecord) -> MergeOutcome {
        if key.is_closed_at(self.sealed_through) {
            return MergeOutcome::Rejected;
        }
        self.windows.entry(key).or_default().add(record);
        MergeOutcome::Merged
    }

    /// Keys of open windows that end at or before `watermark`, oldest first.
    pub fn closed_keys(&self, watermark: DateTime<Utc>) -> Vec<WindowKey> {
        let mut keys: Vec<WindowKey> = self
            .windows
            .keys()
            .filter(|k| k.is_closed_at(watermark))
            .cloned()
            .collect();
        keys.sort_by(|a, b| {
            a.window_end
                .cmp(&b.window_end)
                .then_with(|| a.device_id.cmp(&b.device_id))
        });
        keys
    }

    /// Compute the result for `key` without evicting it.
    pub fn peek(&self, key: &WindowKey) -> Option<FinalizedWindow> {
        self.windows
            .get(key)
            .map(|acc| FinalizedWindow::from_parts(key, acc))
    }

    /// Compute the result for `key` and evict its accumulator.
    pub fn finalize(&mut self, key: &WindowKey) -> Option<FinalizedWindow> {
        self.windows
            .remove(key)
            .map(|acc| FinalizedWindow::from_parts(key, &acc))
    }

    /// Refuse further merges into windows ending at or before `watermark`.
    pub fn seal(&mut self, watermark: DateTime<Utc>) {
        if watermark > self.sealed_through {
            self.sealed_through = watermark;
        }
    }

    pub fn sealed_through(&self) -> DateTime<Utc> {
        self.sealed_through
    }

    pub fn get(&self, key: &WindowKey) -> Option<&Accumulator> {
        self.windows.get(key)
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Serializable copy of every open accumulator.
    pub fn snapshot(&self) -> Vec<OpenWindow> {
        self.windows
            .iter()
            .map(|(key, acc)| OpenWindow {
                window_start: key.window_start,
                window_end: key.window_end,
                device_id: key.device_id.clone(),
                count: acc.count,
                sum_voltage: acc.sum_voltage,
                sum_current: acc.sum_current,
                sum_active_power: acc.sum_active_power,
                sum_power_factor: acc.sum_power_factor,
            })
            .collect()
    }

    /// Rebuild a store from a snapshot.
    pub fn restore(open_windows: &[OpenWindow], sealed_through: DateTime<Utc>) -> Self {
        let windows = open_windows
            .iter()
            .map(|w| {
                let key = WindowKey {
                    window_start: w.window_start,
                    window_end: w.window_end,
                    device_id: w.device_id.clone(),
                };
                let acc = Accumulator {
                    count: w.count,
                    sum_voltage: w.sum_voltage,
                    sum_current: w.sum_current,
                    sum_active_power: w.sum_active_power,
                    sum_power_factor: w.sum_power_factor,
                };
                (key, acc)
            })
            .collect();

        Self {
            windows,
            sealed_through,
        }
    }
}
