use std::{net::SocketAddr, sync::Arc};

use aqf::{
    dashboard_router, init_logging, log_app_bind, log_app_start, logging_config_from_env,
    ForecastConfig, ForecastLogSnapshotSource, ForecastSnapshotSource,
};
use chrono_tz::Tz;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let cfg = ForecastConfig::from_env()?;
    log_app_start("aqf_dashboard", &logging_cfg, &cfg);

    let addr: SocketAddr = std::env::var("AQF_DASHBOARD_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;
    let display_tz: Tz = std::env::var("AQF_DISPLAY_TZ")
        .unwrap_or_else(|_| "Asia/Dubai".to_string())
        .parse()
        .map_err(|err| format!("invalid AQF_DISPLAY_TZ: {err}"))?;

    let source: Arc<dyn ForecastSnapshotSource> = Arc::new(ForecastLogSnapshotSource::new(
        cfg.paths.forecast_log_path.clone(),
        cfg.target(),
        cfg.monitoring.clone(),
    ));
    let app = dashboard_router(source, display_tz);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
