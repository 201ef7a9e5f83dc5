use aqf::{
    init_logging, log_app_finish, log_app_start, logging_config_from_env, run_training,
    truncate_to_hour, ForecastConfig, ReadingStore, RunOutcome, TimeRange, HOUR_MS,
};
use chrono::Utc;

const APP: &str = "aqf_train";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let cfg = ForecastConfig::from_env()?;
    log_app_start(APP, &logging_cfg, &cfg);

    let store = ReadingStore::open(&cfg.paths.store_path)?;
    let end = truncate_to_hour(Utc::now().timestamp_millis()) + HOUR_MS;
    let range = TimeRange::new(0, end)?;

    match run_training(&store, &range, &cfg)? {
        RunOutcome::Completed(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            log_app_finish(APP, "completed", None);
        }
        RunOutcome::Skipped { reason } => {
            println!("training skipped: {reason}");
            log_app_finish(APP, "skipped", Some(&reason));
        }
    }
    Ok(())
}
