//! Causal lag, rolling and calendar features over an aligned hourly series.
//!
//! Every feature of the row at grid position `p` is computed from rows strictly
//! before `p` (calendar features use the timestamp of `p` itself, which is known
//! in advance). The same kernel serves the training table and the single
//! inference vector for the hour after the last observation.

use std::collections::HashSet;

use chrono::{Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::align::{prune_uninformative_columns, AlignedSeries};
use crate::error::ForecastError;
use crate::pollutant::Pollutant;
use crate::reading::HOUR_MS;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub lags_hours: Vec<u32>,
    pub rolling_window_hours: u32,
    pub include_covariates: bool,
    pub schema_version: u32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            lags_hours: vec![1, 2, 3, 24],
            rolling_window_hours: 24,
            include_covariates: true,
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

impl FeatureConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version != FEATURE_SCHEMA_VERSION {
            return Err(format!(
                "schema_version must equal FEATURE_SCHEMA_VERSION ({FEATURE_SCHEMA_VERSION})"
            ));
        }
        if self.lags_hours.is_empty() {
            return Err("lags_hours must not be empty".to_string());
        }
        let mut seen = HashSet::new();
        for lag in &self.lags_hours {
            if *lag == 0 {
                return Err("lags_hours entries must be > 0".to_string());
            }
            if !seen.insert(*lag) {
                return Err("lags_hours entries must be unique".to_string());
            }
        }
        if self.rolling_window_hours < 2 {
            return Err("rolling_window_hours must be >= 2".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureKind {
    /// Co-pollutant value one hour before the row.
    CovariateLag { pollutant: Pollutant },
    TargetLag { hours: u32 },
    /// Mean of the `window` target values before the row, excluding the row.
    RollingMean { window: u32 },
    /// Sample standard deviation over the same window as `RollingMean`.
    RollingStd { window: u32 },
    HourOfDay,
    DayOfWeek,
    Month,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub kind: FeatureKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub target: Pollutant,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|column| column.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    /// Number of trailing hours of target history needed to fill every column.
    pub fn required_history_hours(&self) -> usize {
        self.columns
            .iter()
            .map(|column| match column.kind {
                FeatureKind::TargetLag { hours } => hours as usize,
                FeatureKind::RollingMean { window } | FeatureKind::RollingStd { window } => {
                    window as usize
                }
                FeatureKind::CovariateLag { .. } => 1,
                FeatureKind::HourOfDay | FeatureKind::DayOfWeek | FeatureKind::Month => 0,
            })
            .max()
            .unwrap_or(0)
    }

    /// Checks the stored fingerprint against the columns actually present.
    pub fn verify(&self) -> Result<(), ForecastError> {
        let recomputed = FeatureSchema {
            fingerprint: schema_fingerprint(self.version, self.target, &self.columns),
            ..self.clone()
        };
        assert_schema_compatible(FEATURE_SCHEMA_VERSION, &self.fingerprint, &recomputed)
    }
}

/// One labeled training row: features for hour `ts_ms_utc` and the observed
/// target at that hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub ts_ms_utc: i64,
    pub target: f64,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureBuildReport {
    pub input_rows: u64,
    pub rows_without_target: u64,
    pub incomplete_rows: u64,
    pub output_rows: u64,
    pub covariates: Vec<Pollutant>,
    pub pruned_columns: Vec<Pollutant>,
}

pub fn build_feature_schema(
    target: Pollutant,
    covariates: &[Pollutant],
    cfg: &FeatureConfig,
) -> FeatureSchema {
    let mut columns = Vec::new();

    if cfg.include_covariates {
        for pollutant in covariates.iter().filter(|p| **p != target) {
            columns.push(FeatureColumn {
                name: format!("{pollutant}_lag_1h"),
                kind: FeatureKind::CovariateLag {
                    pollutant: *pollutant,
                },
            });
        }
    }
    for hours in &cfg.lags_hours {
        columns.push(FeatureColumn {
            name: format!("{target}_lag_{hours}h"),
            kind: FeatureKind::TargetLag { hours: *hours },
        });
    }
    let window = cfg.rolling_window_hours;
    columns.push(FeatureColumn {
        name: format!("{target}_rolling_mean_{window}h"),
        kind: FeatureKind::RollingMean { window },
    });
    columns.push(FeatureColumn {
        name: format!("{target}_rolling_std_{window}h"),
        kind: FeatureKind::RollingStd { window },
    });
    for (name, kind) in [
        ("hour", FeatureKind::HourOfDay),
        ("day_of_week", FeatureKind::DayOfWeek),
        ("month", FeatureKind::Month),
    ] {
        columns.push(FeatureColumn {
            name: name.to_string(),
            kind,
        });
    }

    let fingerprint = schema_fingerprint(cfg.schema_version, target, &columns);

    info!(
        component = "features",
        event = "features.schema.built",
        version = cfg.schema_version,
        target = target.as_str(),
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    FeatureSchema {
        version: cfg.schema_version,
        target,
        fingerprint,
        columns,
    }
}

/// Builds the labeled feature table for every row of `series`.
///
/// Uninformative covariate columns are pruned first, then the schema is fixed
/// from the surviving columns. Rows lacking the target or any feature input are
/// dropped in a single pass after all features are computed.
pub fn build_features(
    series: &AlignedSeries,
    cfg: &FeatureConfig,
) -> Result<(FeatureSchema, Vec<FeatureRow>, FeatureBuildReport), ForecastError> {
    cfg.validate().map_err(ForecastError::InvalidInput)?;

    info!(
        component = "features",
        event = "features.build.start",
        input_rows = series.len(),
        target = series.target().as_str(),
        lags_hours = ?cfg.lags_hours,
        rolling_window_hours = cfg.rolling_window_hours
    );

    let (series, pruned_columns) = prune_uninformative_columns(series.clone());
    let target_values = series.target_values().ok_or_else(|| {
        ForecastError::DataUnavailable(format!(
            "aligned table has no {} column",
            series.target()
        ))
    })?;

    let covariates: Vec<Pollutant> = series.covariates().map(|column| column.pollutant).collect();
    let schema = build_feature_schema(series.target(), &covariates, cfg);

    let mut report = FeatureBuildReport {
        input_rows: series.len() as u64,
        covariates,
        pruned_columns,
        ..FeatureBuildReport::default()
    };

    let mut rows = Vec::new();
    for (position, target) in target_values.iter().enumerate() {
        let Some(target) = target else {
            report.rows_without_target += 1;
            continue;
        };
        let values = causal_feature_values(&schema, &series, position)?;
        match values.into_iter().collect::<Option<Vec<f64>>>() {
            Some(values) => rows.push(FeatureRow {
                ts_ms_utc: series.timestamps()[position],
                target: *target,
                values,
            }),
            None => report.incomplete_rows += 1,
        }
    }
    report.output_rows = rows.len() as u64;

    info!(
        component = "features",
        event = "features.build.finish",
        input_rows = report.input_rows,
        output_rows = report.output_rows,
        rows_without_target = report.rows_without_target,
        incomplete_rows = report.incomplete_rows,
        fingerprint = schema.fingerprint
    );

    Ok((schema, rows, report))
}

/// Feature values for grid position `position` of `series`, in schema order.
///
/// `position` may equal `series.len()`, meaning the hour right after the last
/// row. Only rows `< position` are read; `None` marks an unavailable input.
pub fn causal_feature_values(
    schema: &FeatureSchema,
    series: &AlignedSeries,
    position: usize,
) -> Result<Vec<Option<f64>>, ForecastError> {
    if schema.target != series.target() {
        return Err(ForecastError::InvalidInput(format!(
            "schema target {} does not match series target {}",
            schema.target,
            series.target()
        )));
    }
    let first_ts = *series.timestamps().first().ok_or_else(|| {
        ForecastError::DataUnavailable("aligned table is empty".to_string())
    })?;
    if position > series.len() {
        return Err(ForecastError::InvalidInput(format!(
            "position {position} beyond series of {} rows",
            series.len()
        )));
    }

    let ts_ms_utc = first_ts + position as i64 * HOUR_MS;
    let calendar = Utc
        .timestamp_millis_opt(ts_ms_utc)
        .single()
        .ok_or_else(|| ForecastError::InvalidInput(format!("invalid UTC timestamp: {ts_ms_utc}")))?;
    let target = series.target_values().unwrap_or(&[]);

    let values = schema
        .columns
        .iter()
        .map(|column| match column.kind {
            FeatureKind::CovariateLag { pollutant } => series
                .column(pollutant)
                .and_then(|values| lookback(values, position, 1)),
            FeatureKind::TargetLag { hours } => lookback(target, position, hours as usize),
            FeatureKind::RollingMean { window } => {
                trailing_window(target, position, window as usize).map(|w| mean(&w))
            }
            FeatureKind::RollingStd { window } => {
                trailing_window(target, position, window as usize).map(|w| sample_std(&w))
            }
            FeatureKind::HourOfDay => Some(calendar.hour() as f64),
            FeatureKind::DayOfWeek => Some(calendar.weekday().num_days_from_monday() as f64),
            FeatureKind::Month => Some(calendar.month() as f64),
        })
        .collect();

    debug!(
        component = "features",
        event = "features.kernel.evaluated",
        position = position,
        ts_ms_utc = ts_ms_utc
    );

    Ok(values)
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), ForecastError> {
    if expected_version != actual.version {
        return Err(ForecastError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(ForecastError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

fn lookback(values: &[Option<f64>], position: usize, hours: usize) -> Option<f64> {
    let idx = position.checked_sub(hours)?;
    values.get(idx).copied().flatten()
}

fn trailing_window(values: &[Option<f64>], position: usize, window: usize) -> Option<Vec<f64>> {
    let start = position.checked_sub(window)?;
    values.get(start..position)?.iter().copied().collect()
}

fn mean(window: &[f64]) -> f64 {
    window.iter().sum::<f64>() / window.len() as f64
}

fn sample_std(window: &[f64]) -> f64 {
    if window.len() < 2 {
        return 0.0;
    }
    let mean = mean(window);
    let variance = window
        .iter()
        .map(|v| {
            let d = *v - mean;
            d * d
        })
        .sum::<f64>()
        / (window.len() - 1) as f64;
    variance.sqrt()
}

fn schema_fingerprint(version: u32, target: Pollutant, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{version};"));
    hasher.update(format!("target:{target};"));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}
