use aqf::{
    init_logging, log_app_finish, log_app_start, logging_config_from_env, read_forecast_log,
    run_checks, ForecastConfig,
};
use chrono::Utc;

const APP: &str = "aqf_monitor";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let cfg = ForecastConfig::from_env()?;
    log_app_start(APP, &logging_cfg, &cfg);

    let records = read_forecast_log(&cfg.paths.forecast_log_path)?;
    if records.is_empty() {
        log_app_finish(APP, "skipped", Some("forecast log is empty"));
        return Ok(());
    }

    let report = run_checks(&records, Utc::now().timestamp_millis(), &cfg.monitoring);
    println!("{}", serde_json::to_string_pretty(&report)?);
    log_app_finish(APP, "completed", None);
    Ok(())
}
