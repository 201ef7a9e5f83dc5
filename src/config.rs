//! Validated pipeline configuration assembled from defaults and `AQF_*`
//! environment variables.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::align::{AlignmentConfig, DuplicatePolicy};
use crate::features::FeatureConfig;
use crate::monitoring::MonitoringConfig;
use crate::pollutant::Pollutant;
use crate::training::TrainingConfig;

#[cfg(feature = "openaq")]
use crate::source::OpenAqConfig;

pub const DEFAULT_CITY: &str = "Abu Dhabi";
pub const DEFAULT_INGEST_LOOKBACK_DAYS: u32 = 7;
pub const DEFAULT_INFERENCE_LOOKBACK_HOURS: u32 = 72;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {section} config: {message}")]
    Invalid {
        section: &'static str,
        message: String,
    },
    #[error("invalid value '{value}' for {var}: {message}")]
    Env {
        var: &'static str,
        value: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsConfig {
    pub store_path: PathBuf,
    pub aligned_table_path: PathBuf,
    pub feature_table_path: PathBuf,
    pub model_path: PathBuf,
    pub forecast_log_path: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self::under(PathBuf::from("data"))
    }
}

impl PathsConfig {
    pub fn under(data_dir: PathBuf) -> Self {
        Self {
            store_path: data_dir.join("readings.sqlite"),
            aligned_table_path: data_dir.join("processed").join("aligned.csv"),
            feature_table_path: data_dir.join("processed").join("features.csv"),
            model_path: data_dir.join("models").join("model.json"),
            forecast_log_path: data_dir.join("predictions.csv"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastConfig {
    pub city: String,
    pub ingest_lookback_days: u32,
    /// Hours of readings aligned before each forecast.
    pub inference_lookback_hours: u32,
    pub alignment: AlignmentConfig,
    pub features: FeatureConfig,
    pub training: TrainingConfig,
    pub monitoring: MonitoringConfig,
    pub paths: PathsConfig,
    #[cfg(feature = "openaq")]
    pub openaq: OpenAqConfig,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            city: DEFAULT_CITY.to_string(),
            ingest_lookback_days: DEFAULT_INGEST_LOOKBACK_DAYS,
            inference_lookback_hours: DEFAULT_INFERENCE_LOOKBACK_HOURS,
            alignment: AlignmentConfig::default(),
            features: FeatureConfig::default(),
            training: TrainingConfig::default(),
            monitoring: MonitoringConfig::default(),
            paths: PathsConfig::default(),
            #[cfg(feature = "openaq")]
            openaq: OpenAqConfig::default(),
        }
    }
}

impl ForecastConfig {
    pub fn target(&self) -> Pollutant {
        self.alignment.target
    }

    pub fn pollutants(&self) -> &[Pollutant] {
        &self.alignment.pollutants
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |section: &'static str| {
            move |message: String| ConfigError::Invalid { section, message }
        };
        if self.city.trim().is_empty() {
            return Err(invalid("forecast")("city must not be empty".to_string()));
        }
        if self.ingest_lookback_days == 0 {
            return Err(invalid("forecast")(
                "ingest_lookback_days must be > 0".to_string(),
            ));
        }
        self.alignment.validate().map_err(invalid("alignment"))?;
        self.features.validate().map_err(invalid("features"))?;
        let longest_lookback = self
            .features
            .lags_hours
            .iter()
            .copied()
            .chain([self.features.rolling_window_hours])
            .max()
            .unwrap_or_default();
        if self.inference_lookback_hours <= longest_lookback {
            return Err(invalid("forecast")(format!(
                "inference_lookback_hours must exceed the longest lag/window ({longest_lookback})"
            )));
        }
        self.training.validate().map_err(invalid("training"))?;
        self.monitoring.validate().map_err(invalid("monitoring"))?;
        #[cfg(feature = "openaq")]
        self.openaq.validate().map_err(invalid("openaq"))?;
        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Overlays variables from `lookup` on the defaults and validates the
    /// result. Unset or blank variables keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &'static str| {
            lookup(var)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
                .map(|raw| (var, raw))
        };
        let mut cfg = Self::default();

        if let Some(data_dir) = lookup("AQF_DATA_DIR").filter(|raw| !raw.trim().is_empty()) {
            cfg.paths = PathsConfig::under(PathBuf::from(data_dir.trim()));
        }
        if let Some((_, raw)) = get("AQF_STORE_PATH") {
            cfg.paths.store_path = PathBuf::from(raw);
        }
        if let Some((_, raw)) = get("AQF_ALIGNED_TABLE_PATH") {
            cfg.paths.aligned_table_path = PathBuf::from(raw);
        }
        if let Some((_, raw)) = get("AQF_FEATURE_TABLE_PATH") {
            cfg.paths.feature_table_path = PathBuf::from(raw);
        }
        if let Some((_, raw)) = get("AQF_MODEL_PATH") {
            cfg.paths.model_path = PathBuf::from(raw);
        }
        if let Some((_, raw)) = get("AQF_FORECAST_LOG_PATH") {
            cfg.paths.forecast_log_path = PathBuf::from(raw);
        }

        if let Some((_, raw)) = get("AQF_CITY") {
            cfg.city = raw;
        }
        if let Some((var, raw)) = get("AQF_INGEST_LOOKBACK_DAYS") {
            cfg.ingest_lookback_days = parse_number(var, &raw)?;
        }
        if let Some((var, raw)) = get("AQF_INFERENCE_LOOKBACK_HOURS") {
            cfg.inference_lookback_hours = parse_number(var, &raw)?;
        }
        if let Some((var, raw)) = get("AQF_TARGET") {
            cfg.alignment.target = parse_pollutant(var, &raw)?;
        }
        if let Some((var, raw)) = get("AQF_POLLUTANTS") {
            cfg.alignment.pollutants = raw
                .split(',')
                .map(|code| parse_pollutant(var, code))
                .collect::<Result<_, _>>()?;
        }
        if let Some((var, raw)) = get("AQF_MAX_INTERPOLATION_GAP_HOURS") {
            cfg.alignment.max_interpolation_gap_hours = parse_number(var, &raw)?;
        }
        if let Some((var, raw)) = get("AQF_DUPLICATE_POLICY") {
            cfg.alignment.duplicate_policy = match raw.to_ascii_lowercase().as_str() {
                "keep_first" | "first" => DuplicatePolicy::KeepFirst,
                "mean_across_stations" | "mean" => DuplicatePolicy::MeanAcrossStations,
                _ => {
                    return Err(env_error(
                        var,
                        &raw,
                        "expected keep_first or mean_across_stations",
                    ))
                }
            };
        }
        if let Some((var, raw)) = get("AQF_MAX_TARGET_VALUE") {
            cfg.alignment.max_target_value = match raw.to_ascii_lowercase().as_str() {
                "none" | "off" => None,
                _ => Some(parse_number(var, &raw)?),
            };
        }
        if let Some((var, raw)) = get("AQF_LAGS_HOURS") {
            cfg.features.lags_hours = raw
                .split(',')
                .map(|lag| parse_number(var, lag.trim()))
                .collect::<Result<_, _>>()?;
        }
        if let Some((var, raw)) = get("AQF_ROLLING_WINDOW_HOURS") {
            cfg.features.rolling_window_hours = parse_number(var, &raw)?;
        }
        if let Some((var, raw)) = get("AQF_SPLIT_FRACTION") {
            cfg.training.split_fraction = parse_number(var, &raw)?;
        }
        if let Some((var, raw)) = get("AQF_RIDGE_LAMBDA") {
            cfg.training.ridge_lambda = parse_number(var, &raw)?;
        }
        if let Some((var, raw)) = get("AQF_MAX_VALID_PREDICTION") {
            cfg.monitoring.max_valid_prediction = parse_number(var, &raw)?;
        }
        if let Some((var, raw)) = get("AQF_MONITOR_LOOKBACK_HOURS") {
            cfg.monitoring.lookback_hours = parse_number(var, &raw)?;
        }

        #[cfg(feature = "openaq")]
        {
            if let Some((_, raw)) = get("AQF_OPENAQ_BASE_URL") {
                cfg.openaq.base_url = raw;
            }
            cfg.openaq.api_key = get("AQF_OPENAQ_API_KEY")
                .or_else(|| get("OPENAQ_API_KEY"))
                .map(|(_, key)| key);
            if let Some((_, raw)) = get("AQF_OPENAQ_COUNTRY") {
                cfg.openaq.country_iso = raw;
            }
            if let Some((var, raw)) = get("AQF_OPENAQ_LOCATION_IDS") {
                cfg.openaq.location_ids = raw
                    .split(',')
                    .map(|id| parse_number(var, id.trim()))
                    .collect::<Result<_, _>>()?;
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_number<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|err| env_error(var, raw, &err.to_string()))
}

fn parse_pollutant(var: &'static str, raw: &str) -> Result<Pollutant, ConfigError> {
    Pollutant::parse(raw).map_err(|err| env_error(var, raw, &err.to_string()))
}

fn env_error(var: &'static str, raw: &str, message: &str) -> ConfigError {
    ConfigError::Env {
        var,
        value: raw.to_string(),
        message: message.to_string(),
    }
}
