#![cfg(feature = "live-openaq-tests")]

use aqf::{
    truncate_to_hour, OpenAqConfig, OpenAqSource, Pollutant, ReadingSource, TimeRange, HOUR_MS,
};
use chrono::Utc;

#[test]
fn live_openaq_returns_recent_pm25_for_the_default_city() {
    let Ok(api_key) = std::env::var("OPENAQ_API_KEY") else {
        eprintln!("OPENAQ_API_KEY not set, skipping");
        return;
    };
    let cfg = OpenAqConfig {
        api_key: Some(api_key),
        ..OpenAqConfig::default()
    };
    let source = OpenAqSource::new("Abu Dhabi", cfg).expect("source should build");

    let locations = source.location_ids().expect("location lookup should succeed");
    assert!(!locations.is_empty());

    let end = truncate_to_hour(Utc::now().timestamp_millis());
    let range = TimeRange::new(end - 48 * HOUR_MS, end).unwrap();
    let readings = source
        .fetch(Pollutant::Pm25, &range)
        .expect("measurement fetch should succeed");

    for reading in &readings {
        assert_eq!(reading.pollutant, Pollutant::Pm25);
        let parsed = reading.parse().expect("live timestamps should parse");
        assert!(range.contains(parsed.ts_ms_utc));
    }
}
