//! Raw and parsed pollutant readings plus UTC timestamp handling.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ForecastError;
use crate::pollutant::Pollutant;

pub const HOUR_MS: i64 = 3_600_000;

const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"];
const OFFSET_FORMATS: [&str; 1] = ["%Y-%m-%d %H:%M:%S%.f%:z"];

/// A measurement exactly as a source delivered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    pub pollutant: Pollutant,
    pub observed_at: String,
    pub value: f64,
    pub unit: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub pollutant: Pollutant,
    pub ts_ms_utc: i64,
    pub value: f64,
    pub unit: String,
    pub location: String,
}

impl RawReading {
    pub fn parse(&self) -> Result<Reading, ForecastError> {
        let ts_ms_utc = parse_timestamp_utc(&self.observed_at)?;
        if !self.value.is_finite() {
            return Err(ForecastError::ParseFailure {
                field: "value",
                value: self.value.to_string(),
            });
        }
        Ok(Reading {
            pollutant: self.pollutant,
            ts_ms_utc,
            value: self.value,
            unit: self.unit.clone(),
            location: self.location.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_ts_ms_utc: i64,
    pub end_ts_ms_utc_exclusive: i64,
}

impl TimeRange {
    pub fn new(start_ts_ms_utc: i64, end_ts_ms_utc_exclusive: i64) -> Result<Self, ForecastError> {
        if end_ts_ms_utc_exclusive <= start_ts_ms_utc {
            return Err(ForecastError::InvalidInput(
                "end_ts_ms_utc_exclusive must be greater than start_ts_ms_utc".to_string(),
            ));
        }
        Ok(Self {
            start_ts_ms_utc,
            end_ts_ms_utc_exclusive,
        })
    }

    pub fn contains(&self, ts_ms_utc: i64) -> bool {
        ts_ms_utc >= self.start_ts_ms_utc && ts_ms_utc < self.end_ts_ms_utc_exclusive
    }
}

/// Parses an RFC 3339 or naive (assumed UTC) timestamp into UTC milliseconds.
pub fn parse_timestamp_utc(raw: &str) -> Result<i64, ForecastError> {
    let trimmed = raw.trim();
    let failure = || ForecastError::ParseFailure {
        field: "observed_at",
        value: raw.to_string(),
    };
    if trimmed.is_empty() {
        return Err(failure());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc).timestamp_millis());
    }
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(trimmed, format) {
            return Ok(dt.with_timezone(&Utc).timestamp_millis());
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(Utc.from_utc_datetime(&naive).timestamp_millis());
        }
    }

    Err(failure())
}

pub fn truncate_to_hour(ts_ms_utc: i64) -> i64 {
    ts_ms_utc.div_euclid(HOUR_MS) * HOUR_MS
}

pub fn format_ts_utc(ts_ms_utc: i64) -> Result<String, ForecastError> {
    Utc.timestamp_millis_opt(ts_ms_utc)
        .single()
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .ok_or_else(|| ForecastError::InvalidInput(format!("invalid UTC timestamp: {ts_ms_utc}")))
}
