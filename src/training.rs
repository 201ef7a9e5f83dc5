//! Chronological split, fit driver, evaluation metrics and model artifacts.

use std::fs;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ForecastError;
use crate::features::{FeatureRow, FeatureSchema};
use crate::model::{Regressor, DEFAULT_RIDGE_LAMBDA};
use crate::tables::write_atomic;

pub const DEFAULT_SPLIT_FRACTION: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub split_fraction: f64,
    pub ridge_lambda: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            split_fraction: DEFAULT_SPLIT_FRACTION,
            ridge_lambda: DEFAULT_RIDGE_LAMBDA,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.split_fraction > 0.0 && self.split_fraction < 1.0) {
            return Err(format!(
                "split_fraction must be in (0, 1), got {}",
                self.split_fraction
            ));
        }
        if !self.ridge_lambda.is_finite() || self.ridge_lambda < 0.0 {
            return Err(format!(
                "ridge_lambda must be finite and >= 0, got {}",
                self.ridge_lambda
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub rmse: f64,
    pub mae: f64,
    pub r2: f64,
    pub rows: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub train_rows: usize,
    pub test_rows: usize,
    pub model: EvaluationMetrics,
    /// Persistence forecast (previous hour's value) on the same test rows.
    pub baseline: Option<EvaluationMetrics>,
}

/// Everything inference needs, persisted as one JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact<M> {
    pub schema: FeatureSchema,
    pub model: M,
    pub metrics: TrainingMetrics,
    pub trained_at: String,
    pub last_training_ts_ms_utc: i64,
}

/// First `floor(n * fraction)` rows train, the rest test. Never shuffles.
pub fn chronological_split(
    rows: &[FeatureRow],
    fraction: f64,
) -> Result<(&[FeatureRow], &[FeatureRow]), ForecastError> {
    if !(fraction > 0.0 && fraction < 1.0) {
        return Err(ForecastError::InvalidInput(format!(
            "split fraction must be in (0, 1), got {fraction}"
        )));
    }
    if rows.windows(2).any(|pair| pair[0].ts_ms_utc >= pair[1].ts_ms_utc) {
        return Err(ForecastError::InvalidInput(
            "feature rows must be strictly increasing in time".to_string(),
        ));
    }

    let split = (rows.len() as f64 * fraction).floor() as usize;
    if split == 0 || split == rows.len() {
        return Err(ForecastError::DataUnavailable(format!(
            "{} rows cannot be split into non-empty train and test sets at {fraction}",
            rows.len()
        )));
    }
    Ok(rows.split_at(split))
}

pub fn evaluate(actual: &[f64], predicted: &[f64]) -> Result<EvaluationMetrics, ForecastError> {
    if actual.len() != predicted.len() {
        return Err(ForecastError::InvalidInput(format!(
            "{} actual values but {} predictions",
            actual.len(),
            predicted.len()
        )));
    }
    if actual.is_empty() {
        return Err(ForecastError::InvalidInput(
            "cannot evaluate an empty set".to_string(),
        ));
    }

    let n = actual.len() as f64;
    let mut ss_res = 0.0;
    let mut abs_sum = 0.0;
    for (y, y_hat) in actual.iter().zip(predicted) {
        let residual = y - y_hat;
        ss_res += residual * residual;
        abs_sum += residual.abs();
    }
    let mean = actual.iter().sum::<f64>() / n;
    let ss_tot: f64 = actual.iter().map(|y| (y - mean).powi(2)).sum();
    let r2 = if ss_tot > 0.0 {
        1.0 - ss_res / ss_tot
    } else if ss_res == 0.0 {
        1.0
    } else {
        0.0
    };

    Ok(EvaluationMetrics {
        rmse: (ss_res / n).sqrt(),
        mae: abs_sum / n,
        r2,
        rows: actual.len(),
    })
}

/// Splits `rows`, fits `model` on the training part and scores it on the rest.
///
/// Metrics are reported, never used to accept or reject the model.
pub fn train_and_evaluate<M: Regressor>(
    mut model: M,
    schema: &FeatureSchema,
    rows: &[FeatureRow],
    cfg: &TrainingConfig,
) -> Result<ModelArtifact<M>, ForecastError> {
    cfg.validate().map_err(ForecastError::InvalidInput)?;
    if let Some(row) = rows.iter().find(|row| row.values.len() != schema.len()) {
        return Err(ForecastError::InvalidInput(format!(
            "feature row at {} has {} values, schema has {} columns",
            row.ts_ms_utc,
            row.values.len(),
            schema.len()
        )));
    }

    let (train, test) = chronological_split(rows, cfg.split_fraction)?;

    info!(
        component = "training",
        event = "training.fit.start",
        train_rows = train.len(),
        test_rows = test.len(),
        columns = schema.len(),
        fingerprint = schema.fingerprint
    );

    let (train_x, train_y) = unzip_rows(train);
    model.fit(&train_x, &train_y)?;

    let (test_x, test_y) = unzip_rows(test);
    let predicted = model.predict(&test_x)?;
    let model_metrics = evaluate(&test_y, &predicted)?;

    let baseline = match schema.index_of(&format!("{}_lag_1h", schema.target)) {
        Some(lag_idx) => {
            let persistence: Vec<f64> = test_x.iter().map(|row| row[lag_idx]).collect();
            Some(evaluate(&test_y, &persistence)?)
        }
        None => None,
    };

    info!(
        component = "training",
        event = "training.fit.finish",
        rmse = model_metrics.rmse,
        mae = model_metrics.mae,
        r2 = model_metrics.r2,
        baseline_rmse = baseline.map(|m| m.rmse),
        baseline_mae = baseline.map(|m| m.mae)
    );

    let last_training_ts_ms_utc = train.last().map(|row| row.ts_ms_utc).unwrap_or_default();

    Ok(ModelArtifact {
        schema: schema.clone(),
        model,
        metrics: TrainingMetrics {
            train_rows: train.len(),
            test_rows: test.len(),
            model: model_metrics,
            baseline,
        },
        trained_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        last_training_ts_ms_utc,
    })
}

/// Writes the artifact next to its final path and renames it into place.
pub fn save_artifact<M: Serialize>(
    path: &Path,
    artifact: &ModelArtifact<M>,
) -> Result<(), ForecastError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(artifact)?;
    write_atomic(path, &bytes)?;

    info!(
        component = "training",
        event = "training.artifact.saved",
        path = %path.display(),
        bytes = bytes.len(),
        fingerprint = artifact.schema.fingerprint
    );
    Ok(())
}

pub fn load_artifact<M: DeserializeOwned>(path: &Path) -> Result<ModelArtifact<M>, ForecastError> {
    let bytes = fs::read(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ForecastError::DataUnavailable(format!("no model artifact at {}", path.display()))
        } else {
            ForecastError::Io(err)
        }
    })?;
    let artifact: ModelArtifact<M> = serde_json::from_slice(&bytes)?;
    artifact.schema.verify()?;
    Ok(artifact)
}

fn unzip_rows(rows: &[FeatureRow]) -> (Vec<Vec<f64>>, Vec<f64>) {
    rows.iter()
        .map(|row| (row.values.clone(), row.target))
        .unzip()
}
