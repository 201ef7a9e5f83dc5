//! Pipeline-level error taxonomy.

use thiserror::Error;

use crate::model::ModelError;
use crate::source::SourceError;
use crate::store::StoreError;
use crate::tables::TableError;

#[derive(Debug, Error)]
pub enum ForecastError {
    /// No raw readings, or an aligned table with nothing usable in it.
    /// Expected on a first run; pipelines surface it as a skipped run.
    #[error("data unavailable: {0}")]
    DataUnavailable(String),
    #[error("insufficient history: need {required} consecutive hourly rows, have {available}")]
    InsufficientHistory { required: usize, available: usize },
    #[error("schema mismatch: constructed vector is missing columns {missing:?}")]
    SchemaMismatch { missing: Vec<String> },
    #[error("failed to parse reading {field} value '{value}'")]
    ParseFailure { field: &'static str, value: String },
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("table error: {0}")]
    Table(#[from] TableError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ForecastError {
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::DataUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_data_unavailable_is_skippable() {
        assert!(ForecastError::DataUnavailable("empty".to_string()).is_skippable());
        assert!(!ForecastError::InsufficientHistory {
            required: 24,
            available: 23
        }
        .is_skippable());
        assert!(!ForecastError::SchemaMismatch {
            missing: vec!["hour".to_string()]
        }
        .is_skippable());
    }
}
