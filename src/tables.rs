//! CSV persistence for aligned tables, feature tables and the forecast log.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::{TimeZone, Utc};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::align::{AlignedSeries, SeriesColumn};
use crate::error::ForecastError;
use crate::features::{FeatureRow, FeatureSchema};
use crate::inference::ForecastRecord;
use crate::pollutant::Pollutant;
use crate::reading::{format_ts_utc, parse_timestamp_utc, truncate_to_hour};

const TIMESTAMP_COLUMN: &str = "timestamp";
const FORECAST_LOG_HEADER: [&str; 3] = ["prediction_date", "predicted_value", "generated_at"];

#[derive(Debug, Error)]
pub enum TableError {
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{path}: unexpected header {actual:?}")]
    Header { path: String, actual: Vec<String> },
    #[error("{path}:{line}: {message}")]
    Parse {
        path: String,
        line: u64,
        message: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct ForecastLogRow {
    prediction_date: String,
    predicted_value: f64,
    generated_at: String,
}

pub fn write_aligned_table(path: &Path, series: &AlignedSeries) -> Result<(), ForecastError> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());

    let mut header = vec![TIMESTAMP_COLUMN.to_string()];
    header.extend(series.columns().iter().map(|c| c.pollutant.to_string()));
    writer.write_record(&header).map_err(TableError::from)?;

    for (row, ts_ms_utc) in series.timestamps().iter().enumerate() {
        let mut record = vec![format_ts_utc(*ts_ms_utc)?];
        record.extend(series.columns().iter().map(|c| format_cell(c.values[row])));
        writer.write_record(&record).map_err(TableError::from)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|err| TableError::Io(err.into_error()))?;
    write_table_bytes(path, &bytes)?;

    info!(
        component = "tables",
        event = "tables.aligned.written",
        path = %path.display(),
        rows = series.len(),
        columns = series.columns().len()
    );
    Ok(())
}

/// Reads an aligned table back. Timestamps go through the same UTC parsing and
/// hour truncation as raw readings.
pub fn read_aligned_table(path: &Path, target: Pollutant) -> Result<AlignedSeries, ForecastError> {
    if !path.exists() {
        return Err(ForecastError::DataUnavailable(format!(
            "no aligned table at {}",
            path.display()
        )));
    }
    let mut reader = ReaderBuilder::new()
        .from_path(path)
        .map_err(TableError::from)?;
    let header = reader.headers().map_err(TableError::from)?.clone();
    if header.get(0) != Some(TIMESTAMP_COLUMN) {
        return Err(header_error(path, &header).into());
    }
    let pollutants = header
        .iter()
        .skip(1)
        .map(Pollutant::parse)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| header_error(path, &header))?;

    let mut ts_ms_utc = Vec::new();
    let mut columns: Vec<SeriesColumn> = pollutants
        .iter()
        .map(|pollutant| SeriesColumn {
            pollutant: *pollutant,
            values: Vec::new(),
        })
        .collect();

    for record in reader.records() {
        let record = record.map_err(TableError::from)?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        let raw_ts = record.get(0).unwrap_or_default();
        let ts = parse_timestamp_utc(raw_ts).map_err(|err| parse_error(path, line, err))?;
        ts_ms_utc.push(truncate_to_hour(ts));
        for (idx, column) in columns.iter_mut().enumerate() {
            let cell = record.get(idx + 1).unwrap_or_default();
            column
                .values
                .push(parse_cell(cell).map_err(|err| parse_error(path, line, err))?);
        }
    }

    if ts_ms_utc.is_empty() {
        return Err(ForecastError::DataUnavailable(format!(
            "aligned table {} has no rows",
            path.display()
        )));
    }

    debug!(
        component = "tables",
        event = "tables.aligned.read",
        path = %path.display(),
        rows = ts_ms_utc.len()
    );
    AlignedSeries::new(target, ts_ms_utc, columns)
}

pub fn write_feature_table(
    path: &Path,
    schema: &FeatureSchema,
    rows: &[FeatureRow],
) -> Result<(), ForecastError> {
    let mut writer = WriterBuilder::new().from_writer(Vec::new());

    let mut header = vec![TIMESTAMP_COLUMN.to_string(), schema.target.to_string()];
    header.extend(schema.columns.iter().map(|column| column.name.clone()));
    writer.write_record(&header).map_err(TableError::from)?;

    for row in rows {
        let mut record = vec![format_ts_utc(row.ts_ms_utc)?, row.target.to_string()];
        record.extend(row.values.iter().map(f64::to_string));
        writer.write_record(&record).map_err(TableError::from)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|err| TableError::Io(err.into_error()))?;
    write_table_bytes(path, &bytes)?;

    info!(
        component = "tables",
        event = "tables.features.written",
        path = %path.display(),
        rows = rows.len(),
        columns = schema.len()
    );
    Ok(())
}

/// Appends one record, writing the header first when the log is new.
/// Earlier records are never rewritten.
pub fn append_forecast(path: &Path, record: &ForecastRecord) -> Result<(), ForecastError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let is_new = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);

    if is_new {
        writer
            .write_record(FORECAST_LOG_HEADER)
            .map_err(TableError::from)?;
    }
    writer
        .serialize(ForecastLogRow {
            prediction_date: format_ts_utc(record.prediction_ts_ms_utc)?,
            predicted_value: record.predicted_value,
            generated_at: format_generated_at(record.generated_at_ms_utc)?,
        })
        .map_err(TableError::from)?;
    writer.flush()?;

    info!(
        component = "tables",
        event = "tables.forecast.appended",
        path = %path.display(),
        prediction_ts_ms_utc = record.prediction_ts_ms_utc,
        predicted_value = record.predicted_value
    );
    Ok(())
}

/// Every record in log order. A missing log is an empty log.
pub fn read_forecast_log(path: &Path) -> Result<Vec<ForecastRecord>, ForecastError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = ReaderBuilder::new()
        .from_path(path)
        .map_err(TableError::from)?;
    let header = reader.headers().map_err(TableError::from)?.clone();
    if header.iter().ne(FORECAST_LOG_HEADER) {
        return Err(header_error(path, &header).into());
    }

    let mut records = Vec::new();
    for row in reader.deserialize::<ForecastLogRow>() {
        let row = row.map_err(TableError::from)?;
        records.push(ForecastRecord {
            prediction_ts_ms_utc: parse_timestamp_utc(&row.prediction_date)?,
            predicted_value: row.predicted_value,
            generated_at_ms_utc: parse_timestamp_utc(&row.generated_at)?,
        });
    }
    Ok(records)
}

/// Latest generation per prediction date, ordered by prediction date. On equal
/// generation times the record appearing later in the log wins.
pub fn resolve_latest(records: &[ForecastRecord]) -> Vec<ForecastRecord> {
    let mut latest: BTreeMap<i64, ForecastRecord> = BTreeMap::new();
    for record in records {
        latest
            .entry(record.prediction_ts_ms_utc)
            .and_modify(|current| {
                if record.generated_at_ms_utc >= current.generated_at_ms_utc {
                    *current = *record;
                }
            })
            .or_insert(*record);
    }
    latest.into_values().collect()
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid output path: {}", path.display()),
            )
        })?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)
}

fn write_table_bytes(path: &Path, bytes: &[u8]) -> Result<(), ForecastError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    write_atomic(path, bytes)?;
    Ok(())
}

fn format_cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn parse_cell(cell: &str) -> Result<Option<f64>, String> {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let value: f64 = trimmed
        .parse()
        .map_err(|_| format!("invalid number '{trimmed}'"))?;
    if value.is_finite() {
        Ok(Some(value))
    } else {
        Err(format!("non-finite number '{trimmed}'"))
    }
}

fn format_generated_at(ts_ms_utc: i64) -> Result<String, ForecastError> {
    Utc.timestamp_millis_opt(ts_ms_utc)
        .single()
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .ok_or_else(|| ForecastError::InvalidInput(format!("invalid UTC timestamp: {ts_ms_utc}")))
}

fn header_error(path: &Path, header: &StringRecord) -> TableError {
    TableError::Header {
        path: path.display().to_string(),
        actual: header.iter().map(str::to_string).collect(),
    }
}

fn parse_error(path: &Path, line: u64, err: impl std::fmt::Display) -> TableError {
    TableError::Parse {
        path: path.display().to_string(),
        line,
        message: err.to_string(),
    }
}
