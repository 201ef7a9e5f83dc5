//! Batch runs: ingestion, training and one-step forecasting.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::align::{align_readings, AlignedSeries, AlignmentReport};
use crate::config::ForecastConfig;
use crate::error::ForecastError;
use crate::features::{build_features, FeatureBuildReport};
use crate::inference::{forecast_next_hour, ForecastRecord};
use crate::model::RidgeRegressor;
use crate::pollutant::Pollutant;
use crate::reading::{truncate_to_hour, RawReading, TimeRange, HOUR_MS};
use crate::source::ReadingSource;
use crate::store::ReadingStore;
use crate::tables::{append_forecast, read_aligned_table, write_aligned_table, write_feature_table};
use crate::training::{load_artifact, save_artifact, train_and_evaluate, ModelArtifact, TrainingMetrics};

const DAY_MS: i64 = 24 * HOUR_MS;

/// A run either completes or is skipped because there is nothing to work on
/// yet. Every other problem is an `Err`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunOutcome<T> {
    Completed(T),
    Skipped { reason: String },
}

impl<T> RunOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Skipped { .. } => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub alignment: AlignmentReport,
    pub features: FeatureBuildReport,
    pub metrics: TrainingMetrics,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollutantIngest {
    pub pollutant: Pollutant,
    pub start_ts_ms_utc: i64,
    pub fetched: u64,
    pub inserted: u64,
    pub already_present: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub pollutants: Vec<PollutantIngest>,
}

impl IngestSummary {
    pub fn inserted(&self) -> u64 {
        self.pollutants.iter().map(|p| p.inserted).sum()
    }

    pub fn failures(&self) -> usize {
        self.pollutants.iter().filter(|p| p.error.is_some()).count()
    }
}

/// Pulls new readings for every tracked pollutant into the store, starting at
/// the last stored hour (or `ingest_lookback_days` back when empty). A failing
/// pollutant is recorded and the others continue.
pub fn ingest<S: ReadingSource + ?Sized>(
    source: &S,
    store: &mut ReadingStore,
    now_ms_utc: i64,
    cfg: &ForecastConfig,
) -> Result<IngestSummary, ForecastError> {
    cfg.validate()
        .map_err(|err| ForecastError::InvalidInput(err.to_string()))?;

    let mut summary = IngestSummary::default();
    for pollutant in cfg.pollutants() {
        let start_ts_ms_utc = match store.latest_ts_ms_utc(*pollutant)? {
            Some(latest) => truncate_to_hour(latest),
            None => now_ms_utc - i64::from(cfg.ingest_lookback_days) * DAY_MS,
        };
        let mut entry = PollutantIngest {
            pollutant: *pollutant,
            start_ts_ms_utc,
            fetched: 0,
            inserted: 0,
            already_present: 0,
            error: None,
        };

        let Ok(range) = TimeRange::new(start_ts_ms_utc, now_ms_utc) else {
            summary.pollutants.push(entry);
            continue;
        };
        match source.fetch(*pollutant, &range) {
            Ok(readings) => {
                entry.fetched = readings.len() as u64;
                let report = store.insert_readings(&readings)?;
                entry.inserted = report.inserted;
                entry.already_present = report.already_present;
            }
            Err(err) => {
                warn!(
                    component = "pipeline",
                    event = "pipeline.ingest.pollutant_failed",
                    pollutant = pollutant.as_str(),
                    error = %err
                );
                entry.error = Some(err.to_string());
            }
        }
        summary.pollutants.push(entry);
    }

    info!(
        component = "pipeline",
        event = "pipeline.ingest.finish",
        inserted = summary.inserted(),
        failures = summary.failures()
    );
    Ok(summary)
}

/// Fetch, align, build features, fit and persist. Everything is recomputed
/// from the raw readings in `range`.
pub fn run_training<S: ReadingSource + ?Sized>(
    source: &S,
    range: &TimeRange,
    cfg: &ForecastConfig,
) -> Result<RunOutcome<TrainingSummary>, ForecastError> {
    cfg.validate()
        .map_err(|err| ForecastError::InvalidInput(err.to_string()))?;
    info!(
        component = "pipeline",
        event = "pipeline.training.start",
        target = cfg.target().as_str(),
        start_ts_ms_utc = range.start_ts_ms_utc,
        end_ts_ms_utc_exclusive = range.end_ts_ms_utc_exclusive
    );

    let readings = collect_readings(source, cfg.pollutants(), range)?;
    let (series, alignment) = match align_readings(&readings, &cfg.alignment) {
        Ok(aligned) => aligned,
        Err(err) if err.is_skippable() => return Ok(skipped("training", err)),
        Err(err) => return Err(err),
    };
    write_aligned_table(&cfg.paths.aligned_table_path, &series)?;

    let (schema, rows, features) = match build_features(&series, &cfg.features) {
        Ok(built) => built,
        Err(err) if err.is_skippable() => return Ok(skipped("training", err)),
        Err(err) => return Err(err),
    };
    if rows.is_empty() {
        return Ok(skipped(
            "training",
            ForecastError::DataUnavailable("no complete feature rows".to_string()),
        ));
    }
    write_feature_table(&cfg.paths.feature_table_path, &schema, &rows)?;

    let model = RidgeRegressor::new(cfg.training.ridge_lambda)?;
    let artifact = match train_and_evaluate(model, &schema, &rows, &cfg.training) {
        Ok(artifact) => artifact,
        Err(err) if err.is_skippable() => return Ok(skipped("training", err)),
        Err(err) => return Err(err),
    };
    save_artifact(&cfg.paths.model_path, &artifact)?;

    info!(
        component = "pipeline",
        event = "pipeline.training.finish",
        aligned_rows = alignment.output_rows,
        feature_rows = features.output_rows,
        rmse = artifact.metrics.model.rmse,
        fingerprint = artifact.schema.fingerprint
    );

    Ok(RunOutcome::Completed(TrainingSummary {
        alignment,
        features,
        metrics: artifact.metrics,
        fingerprint: artifact.schema.fingerprint,
    }))
}

/// Aligns the last `inference_lookback_hours` of readings and appends a
/// forecast for the hour after the last observed target value.
pub fn run_forecast<S: ReadingSource + ?Sized>(
    source: &S,
    now_ms_utc: i64,
    cfg: &ForecastConfig,
) -> Result<RunOutcome<ForecastRecord>, ForecastError> {
    cfg.validate()
        .map_err(|err| ForecastError::InvalidInput(err.to_string()))?;

    let end = truncate_to_hour(now_ms_utc) + HOUR_MS;
    let range = TimeRange::new(
        end - i64::from(cfg.inference_lookback_hours) * HOUR_MS,
        end,
    )?;
    let readings = collect_readings(source, cfg.pollutants(), &range)?;
    let series = match align_readings(&readings, &cfg.alignment) {
        Ok((series, _)) => series,
        Err(err) if err.is_skippable() => return Ok(skipped("forecast", err)),
        Err(err) => return Err(err),
    };
    forecast_and_append(&series, now_ms_utc, cfg)
}

/// Same as `run_forecast`, reading history from the persisted aligned table.
pub fn run_forecast_from_table(
    now_ms_utc: i64,
    cfg: &ForecastConfig,
) -> Result<RunOutcome<ForecastRecord>, ForecastError> {
    cfg.validate()
        .map_err(|err| ForecastError::InvalidInput(err.to_string()))?;
    let series = match read_aligned_table(&cfg.paths.aligned_table_path, cfg.target()) {
        Ok(series) => series,
        Err(err) if err.is_skippable() => return Ok(skipped("forecast", err)),
        Err(err) => return Err(err),
    };
    forecast_and_append(&series, now_ms_utc, cfg)
}

fn forecast_and_append(
    series: &AlignedSeries,
    now_ms_utc: i64,
    cfg: &ForecastConfig,
) -> Result<RunOutcome<ForecastRecord>, ForecastError> {
    let artifact: ModelArtifact<RidgeRegressor> = match load_artifact(&cfg.paths.model_path) {
        Ok(artifact) => artifact,
        Err(err) if err.is_skippable() => return Ok(skipped("forecast", err)),
        Err(err) => return Err(err),
    };
    if artifact.schema.target != cfg.target() {
        return Err(ForecastError::InvalidInput(format!(
            "model predicts {}, configured target is {}",
            artifact.schema.target,
            cfg.target()
        )));
    }

    let record = forecast_next_hour(&artifact.model, &artifact.schema, series, now_ms_utc)?;
    append_forecast(&cfg.paths.forecast_log_path, &record)?;

    info!(
        component = "pipeline",
        event = "pipeline.forecast.finish",
        prediction_ts_ms_utc = record.prediction_ts_ms_utc,
        predicted_value = record.predicted_value
    );
    Ok(RunOutcome::Completed(record))
}

fn collect_readings<S: ReadingSource + ?Sized>(
    source: &S,
    pollutants: &[Pollutant],
    range: &TimeRange,
) -> Result<Vec<RawReading>, ForecastError> {
    let mut readings = Vec::new();
    for pollutant in pollutants {
        readings.extend(source.fetch(*pollutant, range)?);
    }
    Ok(readings)
}

fn skipped<T>(run: &str, err: ForecastError) -> RunOutcome<T> {
    warn!(
        component = "pipeline",
        event = "pipeline.skipped",
        run = run,
        reason = %err
    );
    RunOutcome::Skipped {
        reason: err.to_string(),
    }
}
