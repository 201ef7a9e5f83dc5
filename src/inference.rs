//! Single-step inference: the feature vector for the hour after the last
//! observed target value, and the clamped forecast built from it.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::align::AlignedSeries;
use crate::error::ForecastError;
use crate::features::{causal_feature_values, FeatureSchema};
use crate::model::{ModelError, Regressor};
use crate::reading::HOUR_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryState {
    InsufficientHistory {
        required: usize,
        available: usize,
    },
    /// `last_observed` is the row index of T, the most recent hour with a
    /// target value.
    Ready { last_observed: usize, available: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceVector {
    pub ts_ms_utc: i64,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub prediction_ts_ms_utc: i64,
    pub predicted_value: f64,
    pub generated_at_ms_utc: i64,
}

/// Counts the consecutive target values ending at the last observed hour.
pub fn assess_history(series: &AlignedSeries, schema: &FeatureSchema) -> HistoryState {
    let required = schema.required_history_hours().max(1);
    let target = series.target_values().unwrap_or(&[]);

    let Some(last_observed) = target.iter().rposition(Option::is_some) else {
        return HistoryState::InsufficientHistory {
            required,
            available: 0,
        };
    };
    let available = target[..=last_observed]
        .iter()
        .rev()
        .take_while(|value| value.is_some())
        .count();

    if available < required {
        HistoryState::InsufficientHistory {
            required,
            available,
        }
    } else {
        HistoryState::Ready {
            last_observed,
            available,
        }
    }
}

/// Builds the schema-ordered vector for T+1 from rows up to and including T.
pub fn construct_inference_vector(
    series: &AlignedSeries,
    schema: &FeatureSchema,
) -> Result<InferenceVector, ForecastError> {
    schema.verify()?;

    let last_observed = match assess_history(series, schema) {
        HistoryState::Ready { last_observed, .. } => last_observed,
        HistoryState::InsufficientHistory {
            required,
            available,
        } => {
            warn!(
                component = "inference",
                event = "inference.insufficient_history",
                required = required,
                available = available
            );
            return Err(ForecastError::InsufficientHistory {
                required,
                available,
            });
        }
    };

    let position = last_observed + 1;
    let constructed = causal_feature_values(schema, series, position)?;

    let missing: Vec<String> = schema
        .columns
        .iter()
        .zip(&constructed)
        .filter(|(_, value)| value.is_none())
        .map(|(column, _)| column.name.clone())
        .collect();
    if !missing.is_empty() {
        warn!(
            component = "inference",
            event = "inference.schema_mismatch",
            missing = ?missing
        );
        return Err(ForecastError::SchemaMismatch { missing });
    }

    let ts_ms_utc = series.timestamps()[last_observed] + HOUR_MS;
    Ok(InferenceVector {
        ts_ms_utc,
        values: constructed.into_iter().flatten().collect(),
    })
}

/// Predicts the target for the hour after the last observation, clamped at
/// zero after the model call.
pub fn forecast_next_hour<M: Regressor>(
    model: &M,
    schema: &FeatureSchema,
    series: &AlignedSeries,
    generated_at_ms_utc: i64,
) -> Result<ForecastRecord, ForecastError> {
    if !model.is_fitted() {
        return Err(ModelError::NotFitted.into());
    }
    let vector = construct_inference_vector(series, schema)?;
    let predictions = model.predict(std::slice::from_ref(&vector.values))?;
    let [raw] = predictions.as_slice() else {
        return Err(ModelError::DimensionMismatch {
            expected: 1,
            actual: predictions.len(),
        }
        .into());
    };
    let predicted_value = raw.max(0.0);

    info!(
        component = "inference",
        event = "inference.forecast",
        prediction_ts_ms_utc = vector.ts_ms_utc,
        raw_prediction = *raw,
        predicted_value = predicted_value,
        clamped = *raw < 0.0
    );

    Ok(ForecastRecord {
        prediction_ts_ms_utc: vector.ts_ms_utc,
        predicted_value,
        generated_at_ms_utc,
    })
}
