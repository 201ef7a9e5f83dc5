use aqf::{
    format_ts_utc, init_logging, log_app_finish, log_app_start, logging_config_from_env,
    run_forecast, run_forecast_from_table, ForecastConfig, ForecastRecord, ReadingStore,
    RunOutcome,
};
use chrono::Utc;

const APP: &str = "aqf_predict";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let cfg = ForecastConfig::from_env()?;
    log_app_start(APP, &logging_cfg, &cfg);

    let now_ms_utc = Utc::now().timestamp_millis();
    let outcome = match history_source()? {
        HistorySource::Store => {
            let store = ReadingStore::open(&cfg.paths.store_path)?;
            run_forecast(&store, now_ms_utc, &cfg)?
        }
        HistorySource::Table => run_forecast_from_table(now_ms_utc, &cfg)?,
    };

    report(outcome)
}

enum HistorySource {
    Store,
    Table,
}

/// `AQF_PREDICT_FROM`: `store` (default) or `table`.
fn history_source() -> Result<HistorySource, String> {
    match std::env::var("AQF_PREDICT_FROM") {
        Err(_) => Ok(HistorySource::Store),
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "" | "store" => Ok(HistorySource::Store),
            "table" => Ok(HistorySource::Table),
            other => Err(format!("AQF_PREDICT_FROM must be store or table, got {other}")),
        },
    }
}

fn report(outcome: RunOutcome<ForecastRecord>) -> Result<(), Box<dyn std::error::Error>> {
    match outcome {
        RunOutcome::Completed(record) => {
            println!(
                "{} predicted={:.2}",
                format_ts_utc(record.prediction_ts_ms_utc)?,
                record.predicted_value
            );
            log_app_finish(APP, "completed", None);
        }
        RunOutcome::Skipped { reason } => {
            println!("forecast skipped: {reason}");
            log_app_finish(APP, "skipped", Some(&reason));
        }
    }
    Ok(())
}
