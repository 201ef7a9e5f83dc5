//! Time alignment: irregular per-pollutant readings onto a gapless hourly grid.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ForecastError;
use crate::pollutant::{Pollutant, ALL_POLLUTANTS};
use crate::reading::{truncate_to_hour, RawReading, HOUR_MS};

pub const DEFAULT_MAX_INTERPOLATION_GAP_HOURS: usize = 6;
pub const DEFAULT_MAX_TARGET_VALUE: f64 = 500.0;

/// How readings of one pollutant that share an exact timestamp are collapsed
/// before hourly resampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplicatePolicy {
    KeepFirst,
    MeanAcrossStations,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentConfig {
    pub target: Pollutant,
    pub pollutants: Vec<Pollutant>,
    pub max_interpolation_gap_hours: usize,
    pub duplicate_policy: DuplicatePolicy,
    pub max_target_value: Option<f64>,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            target: Pollutant::Pm25,
            pollutants: ALL_POLLUTANTS.to_vec(),
            max_interpolation_gap_hours: DEFAULT_MAX_INTERPOLATION_GAP_HOURS,
            duplicate_policy: DuplicatePolicy::KeepFirst,
            max_target_value: Some(DEFAULT_MAX_TARGET_VALUE),
        }
    }
}

impl AlignmentConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.pollutants.is_empty() {
            return Err("pollutants must not be empty".to_string());
        }
        let mut seen = HashSet::new();
        for pollutant in &self.pollutants {
            if !seen.insert(*pollutant) {
                return Err(format!("pollutant {pollutant} listed more than once"));
            }
        }
        if !seen.contains(&self.target) {
            return Err(format!("target {} must be one of the pollutants", self.target));
        }
        if self.max_interpolation_gap_hours == 0 {
            return Err("max_interpolation_gap_hours must be >= 1".to_string());
        }
        if let Some(max) = self.max_target_value {
            if !max.is_finite() || max <= 0.0 {
                return Err("max_target_value must be a positive finite number".to_string());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesColumn {
    pub pollutant: Pollutant,
    pub values: Vec<Option<f64>>,
}

/// Uniform hourly table: one row per hour between the first and last observed
/// hour, one optional value per tracked pollutant column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedSeries {
    target: Pollutant,
    ts_ms_utc: Vec<i64>,
    columns: Vec<SeriesColumn>,
}

impl AlignedSeries {
    pub fn new(
        target: Pollutant,
        ts_ms_utc: Vec<i64>,
        columns: Vec<SeriesColumn>,
    ) -> Result<Self, ForecastError> {
        for (idx, ts) in ts_ms_utc.iter().enumerate() {
            if ts.rem_euclid(HOUR_MS) != 0 {
                return Err(ForecastError::InvalidInput(format!(
                    "timestamp {ts} is not hour aligned"
                )));
            }
            if idx > 0 && *ts != ts_ms_utc[idx - 1] + HOUR_MS {
                return Err(ForecastError::InvalidInput(format!(
                    "hourly grid is not gapless at {ts} (previous {})",
                    ts_ms_utc[idx - 1]
                )));
            }
        }

        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.pollutant) {
                return Err(ForecastError::InvalidInput(format!(
                    "duplicate column {}",
                    column.pollutant
                )));
            }
            if column.values.len() != ts_ms_utc.len() {
                return Err(ForecastError::InvalidInput(format!(
                    "column {} has {} values for {} rows",
                    column.pollutant,
                    column.values.len(),
                    ts_ms_utc.len()
                )));
            }
        }

        Ok(Self {
            target,
            ts_ms_utc,
            columns,
        })
    }

    pub fn empty(target: Pollutant) -> Self {
        Self {
            target,
            ts_ms_utc: Vec::new(),
            columns: Vec::new(),
        }
    }

    pub fn target(&self) -> Pollutant {
        self.target
    }

    pub fn timestamps(&self) -> &[i64] {
        &self.ts_ms_utc
    }

    pub fn columns(&self) -> &[SeriesColumn] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.ts_ms_utc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ts_ms_utc.is_empty()
    }

    pub fn column(&self, pollutant: Pollutant) -> Option<&[Option<f64>]> {
        self.columns
            .iter()
            .find(|column| column.pollutant == pollutant)
            .map(|column| column.values.as_slice())
    }

    pub fn target_values(&self) -> Option<&[Option<f64>]> {
        self.column(self.target)
    }

    /// Non-target columns in table order.
    pub fn covariates(&self) -> impl Iterator<Item = &SeriesColumn> {
        self.columns
            .iter()
            .filter(move |column| column.pollutant != self.target)
    }

    /// Last `rows` rows (or all of them when shorter).
    pub fn tail(&self, rows: usize) -> Self {
        let start = self.len().saturating_sub(rows);
        Self {
            target: self.target,
            ts_ms_utc: self.ts_ms_utc[start..].to_vec(),
            columns: self
                .columns
                .iter()
                .map(|column| SeriesColumn {
                    pollutant: column.pollutant,
                    values: column.values[start..].to_vec(),
                })
                .collect(),
        }
    }

    /// Copy with one cell replaced.
    pub fn with_value(
        &self,
        pollutant: Pollutant,
        row: usize,
        value: Option<f64>,
    ) -> Result<Self, ForecastError> {
        let mut out = self.clone();
        let column = out
            .columns
            .iter_mut()
            .find(|column| column.pollutant == pollutant)
            .ok_or_else(|| ForecastError::InvalidInput(format!("no column {pollutant}")))?;
        let cell = column.values.get_mut(row).ok_or_else(|| {
            ForecastError::InvalidInput(format!("row {row} out of range for {pollutant}"))
        })?;
        *cell = value;
        Ok(out)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentReport {
    pub input_readings: u64,
    pub parse_failures: u64,
    pub untracked_readings: u64,
    pub out_of_range_readings: u64,
    pub duplicates_collapsed: u64,
    pub output_rows: u64,
    pub interpolated_cells: u64,
    pub missing_cells_after_interpolation: u64,
    pub pruned_columns: Vec<Pollutant>,
}

/// Aligns raw readings into an hourly grid.
///
/// Steps, in order: UTC parsing (bad readings are dropped and counted),
/// exact-timestamp duplicate collapsing per `DuplicatePolicy`, hourly mean
/// resampling, outer merge on the union of observed hours, bounded linear
/// interpolation, and pruning of columns with no values on target-valid rows.
///
/// Returns `DataUnavailable` when nothing usable remains.
pub fn align_readings(
    readings: &[RawReading],
    cfg: &AlignmentConfig,
) -> Result<(AlignedSeries, AlignmentReport), ForecastError> {
    cfg.validate().map_err(ForecastError::InvalidInput)?;

    info!(
        component = "align",
        event = "align.start",
        input_readings = readings.len(),
        target = cfg.target.as_str(),
        max_interpolation_gap_hours = cfg.max_interpolation_gap_hours,
        duplicate_policy = ?cfg.duplicate_policy
    );

    let mut report = AlignmentReport {
        input_readings: readings.len() as u64,
        ..AlignmentReport::default()
    };

    // (column index, exact ts) -> (sum, count)
    let mut exact: BTreeMap<(usize, i64), (f64, u32)> = BTreeMap::new();
    for raw in readings {
        let Some(col_idx) = cfg.pollutants.iter().position(|p| *p == raw.pollutant) else {
            report.untracked_readings += 1;
            continue;
        };

        let reading = match raw.parse() {
            Ok(reading) => reading,
            Err(err) => {
                report.parse_failures += 1;
                warn!(
                    component = "align",
                    event = "align.reading_dropped",
                    reason = "parse_failure",
                    pollutant = raw.pollutant.as_str(),
                    location = %raw.location,
                    error = %err
                );
                continue;
            }
        };

        if reading.pollutant == cfg.target {
            if let Some(max) = cfg.max_target_value {
                if reading.value > max {
                    report.out_of_range_readings += 1;
                    debug!(
                        component = "align",
                        event = "align.reading_dropped",
                        reason = "out_of_range",
                        value = reading.value,
                        max_target_value = max
                    );
                    continue;
                }
            }
        }

        match exact.entry((col_idx, reading.ts_ms_utc)) {
            Entry::Vacant(slot) => {
                slot.insert((reading.value, 1));
            }
            Entry::Occupied(mut slot) => {
                report.duplicates_collapsed += 1;
                if cfg.duplicate_policy == DuplicatePolicy::MeanAcrossStations {
                    let (sum, count) = slot.get_mut();
                    *sum += reading.value;
                    *count += 1;
                }
            }
        }
    }

    let mut hourly: BTreeMap<(usize, i64), (f64, u32)> = BTreeMap::new();
    for ((col_idx, ts_ms_utc), (sum, count)) in exact {
        let value = sum / count as f64;
        let bucket = hourly
            .entry((col_idx, truncate_to_hour(ts_ms_utc)))
            .or_insert((0.0, 0));
        bucket.0 += value;
        bucket.1 += 1;
    }

    let (Some(first_hour), Some(last_hour)) = (
        hourly.keys().map(|(_, hour)| *hour).min(),
        hourly.keys().map(|(_, hour)| *hour).max(),
    ) else {
        warn!(
            component = "align",
            event = "align.data_unavailable",
            input_readings = report.input_readings,
            parse_failures = report.parse_failures
        );
        return Err(ForecastError::DataUnavailable(format!(
            "no usable readings among {} inputs",
            report.input_readings
        )));
    };

    let rows = ((last_hour - first_hour) / HOUR_MS + 1) as usize;
    let ts_ms_utc: Vec<i64> = (0..rows)
        .map(|idx| first_hour + idx as i64 * HOUR_MS)
        .collect();

    let mut columns = Vec::new();
    for (col_idx, pollutant) in cfg.pollutants.iter().enumerate() {
        let mut values = vec![None; rows];
        let mut observed = false;
        for ((_, hour), (sum, count)) in hourly.range((col_idx, i64::MIN)..=(col_idx, i64::MAX)) {
            let row = ((hour - first_hour) / HOUR_MS) as usize;
            values[row] = Some(sum / *count as f64);
            observed = true;
        }
        if observed {
            columns.push(SeriesColumn {
                pollutant: *pollutant,
                values,
            });
        } else {
            debug!(
                component = "align",
                event = "align.column_absent",
                pollutant = pollutant.as_str()
            );
        }
    }

    for column in &mut columns {
        report.interpolated_cells +=
            interpolate_short_gaps(&mut column.values, cfg.max_interpolation_gap_hours) as u64;
    }

    let series = AlignedSeries::new(cfg.target, ts_ms_utc, columns)?;
    let (series, pruned) = prune_uninformative_columns(series);
    report.pruned_columns = pruned;
    report.output_rows = series.len() as u64;
    report.missing_cells_after_interpolation = series
        .columns()
        .iter()
        .map(|column| column.values.iter().filter(|v| v.is_none()).count() as u64)
        .sum();

    info!(
        component = "align",
        event = "align.finish",
        output_rows = report.output_rows,
        columns = series.columns().len(),
        parse_failures = report.parse_failures,
        out_of_range_readings = report.out_of_range_readings,
        duplicates_collapsed = report.duplicates_collapsed,
        interpolated_cells = report.interpolated_cells,
        missing_cells_after_interpolation = report.missing_cells_after_interpolation,
        pruned_columns = ?report.pruned_columns
    );

    Ok((series, report))
}

/// Fills interior runs of at most `max_gap` missing values by linear
/// interpolation between the bounding observations. Longer runs and leading
/// or trailing runs are left missing. Returns the number of filled cells.
pub fn interpolate_short_gaps(values: &mut [Option<f64>], max_gap: usize) -> usize {
    let mut filled = 0;
    let mut idx = 0;
    let mut last_known: Option<(usize, f64)> = None;

    while idx < values.len() {
        match values[idx] {
            Some(value) => {
                last_known = Some((idx, value));
                idx += 1;
            }
            None => {
                let run_start = idx;
                while idx < values.len() && values[idx].is_none() {
                    idx += 1;
                }
                let run_len = idx - run_start;
                let (Some((left_idx, left)), Some(right)) =
                    (last_known, values.get(idx).copied().flatten())
                else {
                    continue;
                };
                if run_len > max_gap {
                    continue;
                }

                let span = (idx - left_idx) as f64;
                for (offset, slot) in values[run_start..idx].iter_mut().enumerate() {
                    let step = (run_start + offset - left_idx) as f64;
                    *slot = Some(left + (right - left) * step / span);
                    filled += 1;
                }
            }
        }
    }

    filled
}

/// Drops every non-target column that has no value on any row where the
/// target is present. Rows are never dropped here.
pub fn prune_uninformative_columns(series: AlignedSeries) -> (AlignedSeries, Vec<Pollutant>) {
    let Some(target_values) = series.target_values() else {
        return (series, Vec::new());
    };
    let target_rows: Vec<usize> = target_values
        .iter()
        .enumerate()
        .filter_map(|(idx, value)| value.map(|_| idx))
        .collect();
    if target_rows.is_empty() {
        return (series, Vec::new());
    }

    let target = series.target;
    let mut pruned = Vec::new();
    let AlignedSeries {
        ts_ms_utc, columns, ..
    } = series;
    let kept = columns
        .into_iter()
        .filter(|column| {
            if column.pollutant == target {
                return true;
            }
            let informative = target_rows.iter().any(|row| column.values[*row].is_some());
            if !informative {
                warn!(
                    component = "align",
                    event = "align.column_pruned",
                    pollutant = column.pollutant.as_str(),
                    target = target.as_str(),
                    reason = "no_overlap_with_target"
                );
                pruned.push(column.pollutant);
            }
            informative
        })
        .collect();

    (
        AlignedSeries {
            target,
            ts_ms_utc,
            columns: kept,
        },
        pruned,
    )
}
