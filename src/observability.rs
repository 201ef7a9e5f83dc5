//! Tracing subscriber setup for the `aqf_*` binaries and the lifecycle
//! events every run emits.

use std::env;
use std::net::SocketAddr;

use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::ForecastConfig;

const FALLBACK_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, e.g. `info` or `aqf=debug,axum=warn`.
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: FALLBACK_FILTER.to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

impl LoggingConfig {
    /// Overlays `AQF_LOG_LEVEL`, `AQF_LOG_FORMAT` and `AQF_LOG_TARGET` from
    /// `lookup`. Blank or unparseable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |var: &str| {
            lookup(var)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };
        let defaults = Self::default();

        Self {
            level: get("AQF_LOG_LEVEL").unwrap_or(defaults.level),
            format: get("AQF_LOG_FORMAT")
                .and_then(|raw| LogFormat::parse(&raw))
                .unwrap_or(defaults.format),
            include_target: get("AQF_LOG_TARGET")
                .and_then(|raw| parse_switch(&raw))
                .unwrap_or(defaults.include_target),
        }
    }

    /// Invalid directives degrade to `info`.
    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new(FALLBACK_FILTER))
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    LoggingConfig::from_lookup(|var| env::var(var).ok())
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.env_filter())
        .with_target(config.include_target)
        .with_ansi(config.format == LogFormat::Pretty);

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(app: &str, logging: &LoggingConfig, cfg: &ForecastConfig) {
    info!(
        component = app,
        event = "app.start",
        log_level = %logging.level,
        log_format = ?logging.format,
        include_target = logging.include_target,
        city = %cfg.city,
        target = cfg.target().as_str(),
        pollutants = ?cfg.pollutants(),
        model_path = %cfg.paths.model_path.display(),
        forecast_log_path = %cfg.paths.forecast_log_path.display()
    );
}

pub fn log_app_bind(bound_addr: SocketAddr) {
    info!(
        component = "aqf_dashboard",
        event = "app.bind",
        bind_addr = %bound_addr,
        route = "/dashboard"
    );
}

/// Final event of a batch binary: `outcome` is `completed` or `skipped`.
pub fn log_app_finish(app: &str, outcome: &str, reason: Option<&str>) {
    match reason {
        Some(reason) => warn!(component = app, event = "app.finish", outcome, reason),
        None => info!(component = app, event = "app.finish", outcome),
    }
}

fn parse_switch(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
