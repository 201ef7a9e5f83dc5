//! Next-hour air quality forecasting.
//!
//! Raw pollutant readings are stored as-is, aligned onto an hourly UTC grid,
//! turned into strictly causal features and fed to a regression model. The
//! same feature kernel serves training and single-row inference.

mod align;
mod config;
mod dashboard;
mod error;
mod features;
mod inference;
mod model;
mod monitoring;
mod observability;
mod pipeline;
mod pollutant;
mod reading;
mod source;
mod store;
mod tables;
mod training;

pub use align::{
    align_readings, interpolate_short_gaps, prune_uninformative_columns, AlignedSeries,
    AlignmentConfig, AlignmentReport, DuplicatePolicy, SeriesColumn,
    DEFAULT_MAX_INTERPOLATION_GAP_HOURS, DEFAULT_MAX_TARGET_VALUE,
};
pub use config::{
    ConfigError, ForecastConfig, PathsConfig, DEFAULT_CITY, DEFAULT_INFERENCE_LOOKBACK_HOURS,
    DEFAULT_INGEST_LOOKBACK_DAYS,
};
pub use dashboard::{
    dashboard_router, format_ts_in_tz, render_dashboard_html, ForecastLogSnapshotSource,
    ForecastSnapshot, ForecastSnapshotSource, InMemorySnapshotSource, DASHBOARD_HEADERS,
};
pub use error::ForecastError;
pub use features::{
    assert_schema_compatible, build_feature_schema, build_features, causal_feature_values,
    FeatureBuildReport, FeatureColumn, FeatureConfig, FeatureKind,
    FeatureRow, FeatureSchema, FEATURE_SCHEMA_VERSION,
};
pub use inference::{
    assess_history, construct_inference_vector, forecast_next_hour, ForecastRecord, HistoryState,
    InferenceVector,
};
pub use model::{ModelError, Regressor, RidgeRegressor, DEFAULT_RIDGE_LAMBDA};
pub use monitoring::{
    run_checks, Alert, AlertKind, CheckResults, MonitoringConfig, MonitoringReport, Severity,
};
pub use observability::{
    init_logging, log_app_bind, log_app_finish, log_app_start, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    ingest, run_forecast, run_forecast_from_table, run_training, IngestSummary, PollutantIngest,
    RunOutcome, TrainingSummary,
};
pub use pollutant::{Pollutant, UnknownPollutant, ALL_POLLUTANTS};
pub use reading::{
    format_ts_utc, parse_timestamp_utc, truncate_to_hour, RawReading, Reading, TimeRange,
    HOUR_MS,
};
pub use source::{InMemorySource, ReadingSource, SourceError};
#[cfg(feature = "openaq")]
pub use source::{OpenAqConfig, OpenAqSource, DEFAULT_OPENAQ_BASE_URL};
pub use store::{InsertReport, ReadingStore, StoreError};
pub use tables::{
    append_forecast, read_aligned_table, read_forecast_log, resolve_latest, write_aligned_table,
    write_feature_table, TableError,
};
pub use training::{
    chronological_split, evaluate, load_artifact, save_artifact, train_and_evaluate,
    EvaluationMetrics, ModelArtifact, TrainingConfig, TrainingMetrics, DEFAULT_SPLIT_FRACTION,
};
