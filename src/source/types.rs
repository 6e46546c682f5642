//! Measurement types produced by the record parser.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One smart meter reading decoded from a batch file row.
///
/// Every metric is guaranteed finite and the timestamp is a valid UTC
/// instant; rows that violate either are rejected by the parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// Device identifier (e.g. `MTR-00001`)
    pub meter_id: String,
    /// Event time of the measurement
    pub timestamp: DateTime<Utc>,
    /// Line voltage in volts
    pub voltage: f64,
    /// Current in amperes
    pub current: f64,
    /// Active power in watts
    pub active_power: f64,
    /// Reactive power in VAr
    pub reactive_power: f64,
    /// Grid frequency in hertz
    pub frequency: f64,
    /// Power factor in [0, 1]
    pub power_factor: f64,
    /// Cumulative energy counter in kWh
    pub total_energy_kwh: f64,
}

impl MeasurementRecord {
    /// Build a record with the same value for every metric except active power.
    ///
    /// Handy for tests and demos where only the timestamp, device and one
    /// metric matter.
    pub fn with_active_power(
        meter_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        active_power: f64,
    ) -> Self {
        Self {
            meter_id: meter_id.into(),
            timestamp,
            voltage: 230.0,
            current: 5.0,
            active_power,
            reactive_power: 0.0,
            frequency: 50.0,
            power_factor: 0.9,
            total_energy_kwh: 0.0,
        }
    }
}

/// A parsed batch tagged with its stable identifier.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Stable identifier used as the checkpoint cursor (the file name)
    pub id: String,
    /// Valid records in file order
    pub records: Vec<MeasurementRecord>,
    /// Rows that could not be decoded
    pub errors: Vec<super::parser::ParseError>,
}

impl Batch {
    /// Parse raw batch text into a tagged batch.
    pub fn parse(id: impl Into<String>, raw: &str) -> Self {
        let parsed = super::parser::parse_batch(raw);
        Self {
            id: id.into(),
            records: parsed.records,
            errors: parsed.errors,
        }
    }

    /// Build a batch directly from records (no parse errors).
    pub fn from_records(id: impl Into<String>, records: Vec<MeasurementRecord>) -> Self {
        Self {
            id: id.into(),
            records,
            errors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_from_records_has_no_errors() {
        let record = MeasurementRecord::with_active_power("MTR-00001", Utc::now(), 100.0);
        let batch = Batch::from_records("b1", vec![record.clone()]);
        assert_eq!(batch.id, "b1");
        assert_eq!(batch.records, vec![record]);
        assert!(batch.errors.is_empty());
    }
}
