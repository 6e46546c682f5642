//! Decoding of CSV batch files into measurement records.
//!
//! A malformed row never fails the batch: it is skipped and reported as a
//! [`ParseError`] alongside the valid records, which keep their file order.

use crate::source::types::MeasurementRecord;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use csv::{ReaderBuilder, StringRecord, Trim};
use thiserror::Error;

/// Column names expected in the batch header.
pub const COLUMNS: [&str; 9] = [
    "meter_id",
    "timestamp",
    "voltage",
    "current",
    "active_power",
    "reactive_power",
    "frequency",
    "power_factor",
    "total_energy_kwh",
];

/// A rejected row.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("line {line}: {kind}")]
pub struct ParseError {
    /// 1-based line number in the batch file (the header is line 1)
    pub line: u64,
    pub kind: ParseErrorKind,
}

/// Why a row was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseErrorKind {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is not a number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("field `{field}` is not finite")]
    NonFinite { field: &'static str },
    #[error("unparsable timestamp {0:?}")]
    InvalidTimestamp(String),
    #[error("malformed row: {0}")]
    Malformed(String),
}

/// Output of [`parse_batch`].
#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub records: Vec<MeasurementRecord>,
    pub errors: Vec<ParseError>,
}

/// Column positions resolved from the header row.
struct Layout {
    positions: [Option<usize>; 9],
}

impl Layout {
    fn from_header(header: &StringRecord) -> Self {
        let mut positions = [None; 9];
        for (slot, name) in positions.iter_mut().zip(COLUMNS) {
            *slot = header.iter().position(|h| h.trim() == name);
        }
        Self { positions }
    }

    fn field<'r>(&self, row: &'r StringRecord, column: usize) -> Result<&'r str, ParseErrorKind> {
        self.positions[column]
            .and_then(|pos| row.get(pos))
            .filter(|v| !v.is_empty())
            .ok_or(ParseErrorKind::MissingField(COLUMNS[column]))
    }

    fn number(&self, row: &StringRecord, column: usize) -> Result<f64, ParseErrorKind> {
        let raw = self.field(row, column)?;
        let field = COLUMNS[column];
        let value: f64 = raw.parse().map_err(|_| ParseErrorKind::InvalidNumber {
            field,
            value: raw.to_string(),
        })?;
        if !value.is_finite() {
            return Err(ParseErrorKind::NonFinite { field });
        }
        Ok(value)
    }

    fn record(&self, row: &StringRecord) -> Result<MeasurementRecord, ParseErrorKind> {
        let meter_id = self.field(row, 0)?.to_string();
        let raw_ts = self.field(row, 1)?;
        let timestamp = parse_timestamp(raw_ts)
            .ok_or_else(|| ParseErrorKind::InvalidTimestamp(raw_ts.to_string()))?;

        Ok(MeasurementRecord {
            meter_id,
            timestamp,
            voltage: self.number(row, 2)?,
            current: self.number(row, 3)?,
            active_power: self.number(row, 4)?,
            reactive_power: self.number(row, 5)?,
            frequency: self.number(row, 6)?,
            power_factor: self.number(row, 7)?,
            total_energy_kwh: self.number(row, 8)?,
        })
    }
}

/// Decode one batch file.
pub fn parse_batch(raw: &str) -> ParsedBatch {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(raw.as_bytes());

    let mut parsed = ParsedBatch::default();

    let layout = match reader.headers() {
        Ok(header) => Layout::from_header(header),
        Err(e) => {
            parsed.errors.push(ParseError {
                line: 1,
                kind: ParseErrorKind::Malformed(e.to_string()),
            });
            return parsed;
        }
    };

    for row in reader.records() {
        match row {
            Ok(row) => {
                let line = row.position().map(|p| p.line()).unwrap_or_default();
                match layout.record(&row) {
                    Ok(record) => parsed.records.push(record),
                    Err(kind) => parsed.errors.push(ParseError { line, kind }),
                }
            }
            Err(e) => {
                let line = e.position().map(|p| p.line()).unwrap_or_default();
                parsed.errors.push(ParseError {
                    line,
                    kind: ParseErrorKind::Malformed(e.to_string()),
                });
            }
        }
    }

    parsed
}

/// Parse an ISO-8601 timestamp into UTC.
///
/// Offsets are honoured; timestamps without an offset are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}
