use aqf::{
    ingest, init_logging, log_app_finish, log_app_start, logging_config_from_env, ForecastConfig,
    OpenAqSource, ReadingStore,
};
use chrono::Utc;

const APP: &str = "aqf_ingest";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;

    let cfg = ForecastConfig::from_env()?;
    log_app_start(APP, &logging_cfg, &cfg);

    let source = OpenAqSource::new(&cfg.city, cfg.openaq.clone())?;
    let mut store = ReadingStore::open(&cfg.paths.store_path)?;
    let summary = ingest(&source, &mut store, Utc::now().timestamp_millis(), &cfg)?;

    for entry in &summary.pollutants {
        println!(
            "{:<5} fetched={} inserted={} already_present={}{}",
            entry.pollutant,
            entry.fetched,
            entry.inserted,
            entry.already_present,
            entry
                .error
                .as_deref()
                .map(|err| format!(" error={err}"))
                .unwrap_or_default()
        );
    }

    if summary.failures() == summary.pollutants.len() && !summary.pollutants.is_empty() {
        log_app_finish(APP, "skipped", Some("every pollutant fetch failed"));
    } else {
        log_app_finish(APP, "completed", None);
    }
    Ok(())
}
