//! Reading sources: the capability trait, an in-memory double and the OpenAQ
//! v3 adapter.

use thiserror::Error;

use crate::pollutant::Pollutant;
use crate::reading::{parse_timestamp_utc, RawReading, TimeRange};
use crate::store::StoreError;

#[cfg(feature = "openaq")]
pub use openaq::{OpenAqConfig, OpenAqSource, DEFAULT_OPENAQ_BASE_URL};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to build HTTP client: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("invalid source config: {0}")]
    InvalidConfig(String),
    #[error("no monitoring locations match city '{city}'")]
    NoLocations { city: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Anything that can hand back raw readings for one pollutant over a window.
/// Gaps, duplicates and out-of-order readings are normal output.
pub trait ReadingSource {
    fn fetch(&self, pollutant: Pollutant, range: &TimeRange)
        -> Result<Vec<RawReading>, SourceError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    readings: Vec<RawReading>,
}

impl InMemorySource {
    pub fn new(readings: Vec<RawReading>) -> Self {
        Self { readings }
    }

    pub fn push(&mut self, reading: RawReading) {
        self.readings.push(reading);
    }
}

impl ReadingSource for InMemorySource {
    /// Readings whose timestamp does not parse are passed through so the
    /// aligner can count and drop them.
    fn fetch(
        &self,
        pollutant: Pollutant,
        range: &TimeRange,
    ) -> Result<Vec<RawReading>, SourceError> {
        Ok(self
            .readings
            .iter()
            .filter(|reading| reading.pollutant == pollutant)
            .filter(|reading| match parse_timestamp_utc(&reading.observed_at) {
                Ok(ts_ms_utc) => range.contains(ts_ms_utc),
                Err(_) => true,
            })
            .cloned()
            .collect())
    }
}

#[cfg(feature = "openaq")]
mod openaq {
    use std::sync::Mutex;
    use std::time::Duration;

    use serde::{Deserialize, Serialize};
    use tracing::{debug, info, warn};

    use super::{ReadingSource, SourceError};
    use crate::pollutant::Pollutant;
    use crate::reading::{format_ts_utc, RawReading, TimeRange};

    pub const DEFAULT_OPENAQ_BASE_URL: &str = "https://api.openaq.org";
    const MAX_PAGE_LIMIT: u32 = 1_000;
    const LOCATION_SEARCH_LIMIT: &str = "100";
    const MAX_MEASUREMENT_PAGES: u32 = 100;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct OpenAqConfig {
        pub base_url: String,
        pub api_key: Option<String>,
        pub country_iso: String,
        /// Explicit location ids; when empty they are resolved from the city.
        pub location_ids: Vec<u64>,
        pub page_limit: u32,
        pub timeout_ms: u64,
        pub max_retries: u32,
        pub retry_backoff_ms: u64,
    }

    impl Default for OpenAqConfig {
        fn default() -> Self {
            Self {
                base_url: DEFAULT_OPENAQ_BASE_URL.to_string(),
                api_key: None,
                country_iso: "AE".to_string(),
                location_ids: Vec::new(),
                page_limit: MAX_PAGE_LIMIT,
                timeout_ms: 30_000,
                max_retries: 3,
                retry_backoff_ms: 500,
            }
        }
    }

    impl OpenAqConfig {
        pub fn validate(&self) -> Result<(), String> {
            if self.base_url.trim().is_empty() {
                return Err("base_url must not be empty".to_string());
            }
            if self.page_limit == 0 || self.page_limit > MAX_PAGE_LIMIT {
                return Err(format!("page_limit must be in 1..={MAX_PAGE_LIMIT}"));
            }
            if self.timeout_ms == 0 {
                return Err("timeout_ms must be > 0".to_string());
            }
            if self.country_iso.trim().is_empty() {
                return Err("country_iso must not be empty".to_string());
            }
            Ok(())
        }
    }

    #[derive(Debug, Deserialize)]
    struct Page<T> {
        #[serde(default)]
        meta: Option<PageMeta>,
        #[serde(default = "Vec::new")]
        results: Vec<T>,
    }

    #[derive(Debug, Deserialize)]
    struct PageMeta {
        /// A count, or a string such as ">1000" when the total is unknown.
        #[serde(default)]
        found: Option<serde_json::Value>,
    }

    impl<T> Page<T> {
        fn found(&self) -> Option<usize> {
            self.meta
                .as_ref()?
                .found
                .as_ref()?
                .as_u64()
                .and_then(|n| usize::try_from(n).ok())
        }
    }

    #[derive(Debug, Deserialize)]
    struct LocationResult {
        id: u64,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        locality: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    struct SensorResult {
        id: u64,
        #[serde(default)]
        parameter: Option<SensorParameter>,
    }

    #[derive(Debug, Deserialize)]
    struct SensorParameter {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        units: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    struct MeasurementResult {
        #[serde(default)]
        value: Option<f64>,
        #[serde(default)]
        period: Option<MeasurementPeriod>,
    }

    #[derive(Debug, Deserialize)]
    struct MeasurementPeriod {
        #[serde(rename = "datetimeFrom", default)]
        datetime_from: Option<PeriodInstant>,
    }

    #[derive(Debug, Deserialize)]
    struct PeriodInstant {
        #[serde(default)]
        utc: Option<String>,
    }

    pub(super) trait HttpFetcher: Send + Sync {
        fn get_bytes(&self, url: &str, api_key: Option<&str>) -> Result<Vec<u8>, SourceError>;
    }

    struct ReqwestBlockingFetcher {
        client: reqwest::blocking::Client,
    }

    impl ReqwestBlockingFetcher {
        fn new(timeout_ms: u64) -> Result<Self, SourceError> {
            let client = reqwest::blocking::Client::builder()
                .timeout(Duration::from_millis(timeout_ms))
                .build()
                .map_err(|err| SourceError::HttpClientBuild(err.to_string()))?;
            Ok(Self { client })
        }
    }

    impl HttpFetcher for ReqwestBlockingFetcher {
        fn get_bytes(&self, url: &str, api_key: Option<&str>) -> Result<Vec<u8>, SourceError> {
            let mut request = self
                .client
                .get(url)
                .header(reqwest::header::ACCEPT, "application/json");
            if let Some(key) = api_key {
                request = request.header("X-API-Key", key);
            }
            let response = request.send().map_err(|err| SourceError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

            let status = response.status();
            if !status.is_success() {
                return Err(SourceError::HttpRequest {
                    url: url.to_string(),
                    message: format!("unexpected HTTP status {status}"),
                });
            }

            response
                .bytes()
                .map(|bytes| bytes.to_vec())
                .map_err(|err| SourceError::HttpRequest {
                    url: url.to_string(),
                    message: err.to_string(),
                })
        }
    }

    /// OpenAQ v3: city → location ids → per-location sensor for the
    /// pollutant → that sensor's measurements.
    pub struct OpenAqSource {
        city: String,
        cfg: OpenAqConfig,
        fetcher: Box<dyn HttpFetcher>,
        resolved_locations: Mutex<Option<Vec<u64>>>,
    }

    impl OpenAqSource {
        pub fn new(city: &str, cfg: OpenAqConfig) -> Result<Self, SourceError> {
            cfg.validate().map_err(SourceError::InvalidConfig)?;
            let fetcher = ReqwestBlockingFetcher::new(cfg.timeout_ms)?;
            Ok(Self::with_fetcher(city, cfg, Box::new(fetcher)))
        }

        pub(super) fn with_fetcher(
            city: &str,
            cfg: OpenAqConfig,
            fetcher: Box<dyn HttpFetcher>,
        ) -> Self {
            Self {
                city: city.to_string(),
                cfg,
                fetcher,
                resolved_locations: Mutex::new(None),
            }
        }

        pub fn location_ids(&self) -> Result<Vec<u64>, SourceError> {
            if !self.cfg.location_ids.is_empty() {
                return Ok(self.cfg.location_ids.clone());
            }
            let mut cached = self
                .resolved_locations
                .lock()
                .map_err(|_| SourceError::InvalidConfig("location cache poisoned".to_string()))?;
            if let Some(ids) = cached.as_ref() {
                return Ok(ids.clone());
            }

            let url = locations_url(&self.cfg)?;
            let page: Page<LocationResult> = self.get_json(&url)?;
            let needle = self.city.to_lowercase();
            let ids: Vec<u64> = page
                .results
                .into_iter()
                .filter(|location| {
                    [&location.name, &location.locality].iter().any(|field| {
                        field
                            .as_deref()
                            .is_some_and(|text| text.to_lowercase().contains(&needle))
                    })
                })
                .map(|location| location.id)
                .collect();
            if ids.is_empty() {
                return Err(SourceError::NoLocations {
                    city: self.city.clone(),
                });
            }

            info!(
                component = "source",
                event = "source.locations.resolved",
                city = %self.city,
                location_count = ids.len()
            );
            *cached = Some(ids.clone());
            Ok(ids)
        }

        fn fetch_location(
            &self,
            location_id: u64,
            pollutant: Pollutant,
            range: &TimeRange,
        ) -> Result<Vec<RawReading>, SourceError> {
            let url = sensors_url(&self.cfg, location_id);
            let sensors: Page<SensorResult> = self.get_json(&url)?;
            let Some((sensor_id, unit)) = sensors.results.into_iter().find_map(|sensor| {
                let parameter = sensor.parameter?;
                let matches = parameter
                    .name
                    .as_deref()
                    .and_then(|name| Pollutant::parse(name).ok())
                    == Some(pollutant);
                matches.then(|| {
                    (
                        sensor.id,
                        parameter
                            .units
                            .unwrap_or_else(|| pollutant.default_unit().to_string()),
                    )
                })
            }) else {
                debug!(
                    component = "source",
                    event = "source.sensor.absent",
                    location_id = location_id,
                    pollutant = pollutant.as_str()
                );
                return Ok(Vec::new());
            };

            let location = location_id.to_string();
            let limit = self.cfg.page_limit.min(MAX_PAGE_LIMIT) as usize;
            let mut readings = Vec::new();
            let mut seen = 0usize;
            for page_no in 1..=MAX_MEASUREMENT_PAGES {
                let url = measurements_url(&self.cfg, sensor_id, range, page_no)?;
                let page: Page<MeasurementResult> = self.get_json(&url)?;
                let found = page.found();
                let page_len = page.results.len();
                seen += page_len;
                readings.extend(page.results.into_iter().filter_map(|row| {
                    let value = row.value?;
                    let observed_at = row.period?.datetime_from?.utc?;
                    Some(RawReading {
                        pollutant,
                        observed_at,
                        value,
                        unit: unit.clone(),
                        location: location.clone(),
                    })
                }));

                if page_len < limit || found.is_some_and(|total| seen >= total) {
                    return Ok(readings);
                }
                debug!(
                    component = "source",
                    event = "source.measurements.page",
                    sensor_id = sensor_id,
                    page = page_no,
                    results_so_far = seen
                );
            }

            warn!(
                component = "source",
                event = "source.measurements.truncated",
                sensor_id = sensor_id,
                location_id = location_id,
                max_pages = MAX_MEASUREMENT_PAGES,
                results = seen
            );
            Ok(readings)
        }

        fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, SourceError> {
            let bytes = retry(&self.cfg, || {
                self.fetcher.get_bytes(url, self.cfg.api_key.as_deref())
            })?;
            serde_json::from_slice(&bytes).map_err(|err| SourceError::Decode {
                url: url.to_string(),
                message: err.to_string(),
            })
        }
    }

    impl ReadingSource for OpenAqSource {
        fn fetch(
            &self,
            pollutant: Pollutant,
            range: &TimeRange,
        ) -> Result<Vec<RawReading>, SourceError> {
            let location_ids = self.location_ids()?;
            info!(
                component = "source",
                event = "source.fetch.start",
                pollutant = pollutant.as_str(),
                city = %self.city,
                location_count = location_ids.len(),
                start_ts_ms_utc = range.start_ts_ms_utc,
                end_ts_ms_utc_exclusive = range.end_ts_ms_utc_exclusive
            );

            let mut readings = Vec::new();
            let mut failed_locations = 0usize;
            for location_id in location_ids {
                match self.fetch_location(location_id, pollutant, range) {
                    Ok(mut batch) => readings.append(&mut batch),
                    Err(err) => {
                        failed_locations += 1;
                        warn!(
                            component = "source",
                            event = "source.location.failed",
                            location_id = location_id,
                            pollutant = pollutant.as_str(),
                            error = %err
                        );
                    }
                }
            }

            info!(
                component = "source",
                event = "source.fetch.finish",
                pollutant = pollutant.as_str(),
                readings = readings.len(),
                failed_locations = failed_locations
            );
            Ok(readings)
        }
    }

    fn locations_url(cfg: &OpenAqConfig) -> Result<String, SourceError> {
        build_url(
            &format!("{}/v3/locations", cfg.base_url.trim_end_matches('/')),
            &[
                ("iso", cfg.country_iso.as_str()),
                ("limit", LOCATION_SEARCH_LIMIT),
            ],
        )
    }

    fn sensors_url(cfg: &OpenAqConfig, location_id: u64) -> String {
        format!(
            "{}/v3/locations/{location_id}/sensors",
            cfg.base_url.trim_end_matches('/')
        )
    }

    pub(super) fn measurements_url(
        cfg: &OpenAqConfig,
        sensor_id: u64,
        range: &TimeRange,
        page: u32,
    ) -> Result<String, SourceError> {
        let date_from = format_ts_utc(range.start_ts_ms_utc)
            .map_err(|err| SourceError::InvalidConfig(err.to_string()))?;
        let date_to = format_ts_utc(range.end_ts_ms_utc_exclusive)
            .map_err(|err| SourceError::InvalidConfig(err.to_string()))?;
        let limit = cfg.page_limit.min(MAX_PAGE_LIMIT).to_string();
        let page = page.to_string();
        build_url(
            &format!(
                "{}/v3/sensors/{sensor_id}/measurements",
                cfg.base_url.trim_end_matches('/')
            ),
            &[
                ("date_from", date_from.as_str()),
                ("date_to", date_to.as_str()),
                ("limit", limit.as_str()),
                ("page", page.as_str()),
            ],
        )
    }

    fn build_url(base: &str, params: &[(&str, &str)]) -> Result<String, SourceError> {
        reqwest::Url::parse_with_params(base, params)
            .map(|url| url.to_string())
            .map_err(|err| SourceError::InvalidConfig(format!("invalid url {base}: {err}")))
    }

    fn retry<T>(
        cfg: &OpenAqConfig,
        mut f: impl FnMut() -> Result<T, SourceError>,
    ) -> Result<T, SourceError> {
        let mut attempt: u32 = 0;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= cfg.max_retries => return Err(err),
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    let shift = attempt.saturating_sub(1).min(10);
                    let sleep_ms = cfg.retry_backoff_ms.saturating_mul(1u64 << shift);
                    debug!(
                        component = "source",
                        event = "source.request.retry",
                        attempt = attempt,
                        sleep_ms = sleep_ms,
                        error = %err
                    );
                    std::thread::sleep(Duration::from_millis(sleep_ms));
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::collections::HashMap;
        use std::sync::atomic::{AtomicUsize, Ordering};

        const START_TS_MS: i64 = 1_704_067_200_000;

        #[derive(Default)]
        struct MockFetcher {
            responses: HashMap<String, Vec<u8>>,
            failures_before_success: usize,
            calls: AtomicUsize,
        }

        impl MockFetcher {
            fn with(mut self, url: &str, body: &str) -> Self {
                self.responses.insert(url.to_string(), body.as_bytes().to_vec());
                self
            }
        }

        impl HttpFetcher for MockFetcher {
            fn get_bytes(&self, url: &str, _: Option<&str>) -> Result<Vec<u8>, SourceError> {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call < self.failures_before_success {
                    return Err(SourceError::HttpRequest {
                        url: url.to_string(),
                        message: "transient".to_string(),
                    });
                }
                self.responses
                    .get(url)
                    .cloned()
                    .ok_or_else(|| SourceError::HttpRequest {
                        url: url.to_string(),
                        message: "missing mock response".to_string(),
                    })
            }
        }

        fn cfg() -> OpenAqConfig {
            OpenAqConfig {
                base_url: "http://openaq.test".to_string(),
                retry_backoff_ms: 0,
                ..OpenAqConfig::default()
            }
        }

        fn range() -> TimeRange {
            TimeRange::new(START_TS_MS, START_TS_MS + 3 * 3_600_000).unwrap()
        }

        fn fixture() -> MockFetcher {
            let cfg = cfg();
            MockFetcher::default()
                .with(
                    &locations_url(&cfg).unwrap(),
                    r#"{"results":[
                        {"id":11,"name":"Abu Dhabi - Khalifa City","locality":null},
                        {"id":12,"name":"Hamdan Street","locality":"Abu Dhabi"},
                        {"id":13,"name":"Dubai Marina","locality":"Dubai"}
                    ]}"#,
                )
                .with(
                    &sensors_url(&cfg, 11),
                    r#"{"results":[
                        {"id":101,"parameter":{"name":"no2","units":"µg/m³"}},
                        {"id":102,"parameter":{"name":"pm25","units":"µg/m³"}}
                    ]}"#,
                )
                .with(
                    &measurements_url(&cfg, 102, &range(), 1).unwrap(),
                    r#"{"results":[
                        {"value":21.5,"period":{"datetimeFrom":{"utc":"2024-01-01T00:00:00Z"}}},
                        {"value":null,"period":{"datetimeFrom":{"utc":"2024-01-01T01:00:00Z"}}},
                        {"value":23.0,"period":{}}
                    ]}"#,
                )
        }

        #[test]
        fn resolves_city_locations_by_name_or_locality() {
            let source = OpenAqSource::with_fetcher("abu dhabi", cfg(), Box::new(fixture()));
            assert_eq!(source.location_ids().unwrap(), vec![11, 12]);
        }

        #[test]
        fn maps_measurements_and_skips_incomplete_results() {
            let source = OpenAqSource::with_fetcher("Abu Dhabi", cfg(), Box::new(fixture()));
            // Location 12 has no sensors response and is skipped with a warning.
            let readings = source.fetch(Pollutant::Pm25, &range()).unwrap();

            assert_eq!(readings.len(), 1);
            assert_eq!(readings[0].observed_at, "2024-01-01T00:00:00Z");
            assert_eq!(readings[0].value, 21.5);
            assert_eq!(readings[0].location, "11");
        }

        #[test]
        fn pollutant_without_sensor_yields_nothing() {
            let source = OpenAqSource::with_fetcher("Abu Dhabi", cfg(), Box::new(fixture()));
            assert!(source.fetch(Pollutant::O3, &range()).unwrap().is_empty());
        }

        #[test]
        fn transient_failures_are_retried() {
            let fetcher = MockFetcher {
                failures_before_success: 2,
                ..fixture()
            };
            let source = OpenAqSource::with_fetcher("Abu Dhabi", cfg(), Box::new(fetcher));
            assert_eq!(source.location_ids().unwrap(), vec![11, 12]);
        }

        #[test]
        fn unknown_city_is_an_error() {
            let source = OpenAqSource::with_fetcher("Sharjah", cfg(), Box::new(fixture()));
            assert!(matches!(
                source.location_ids().unwrap_err(),
                SourceError::NoLocations { .. }
            ));
        }

        #[test]
        fn measurements_url_carries_window_and_capped_limit() {
            let cfg = OpenAqConfig {
                page_limit: 500,
                ..cfg()
            };
            let url = measurements_url(&cfg, 7, &range(), 3).unwrap();
            assert!(url.starts_with("http://openaq.test/v3/sensors/7/measurements?"));
            assert!(url.contains("date_from=2024-01-01T00%3A00%3A00Z"));
            assert!(url.contains("limit=500"));
            assert!(url.contains("page=3"));
        }

        fn paged_fixture(cfg: &OpenAqConfig, page_1: &str) -> MockFetcher {
            MockFetcher::default()
                .with(
                    &sensors_url(cfg, 11),
                    r#"{"results":[{"id":102,"parameter":{"name":"pm25","units":"µg/m³"}}]}"#,
                )
                .with(&measurements_url(cfg, 102, &range(), 1).unwrap(), page_1)
                .with(
                    &measurements_url(cfg, 102, &range(), 2).unwrap(),
                    r#"{"results":[
                        {"value":3.0,"period":{"datetimeFrom":{"utc":"2024-01-01T02:00:00Z"}}}
                    ]}"#,
                )
        }

        fn paged_cfg() -> OpenAqConfig {
            OpenAqConfig {
                page_limit: 2,
                location_ids: vec![11],
                ..cfg()
            }
        }

        #[test]
        fn full_measurement_page_is_followed_by_the_next() {
            let cfg = paged_cfg();
            let fetcher = paged_fixture(
                &cfg,
                r#"{"meta":{"found":">2"},"results":[
                    {"value":1.0,"period":{"datetimeFrom":{"utc":"2024-01-01T00:00:00Z"}}},
                    {"value":2.0,"period":{"datetimeFrom":{"utc":"2024-01-01T01:00:00Z"}}}
                ]}"#,
            );
            let source = OpenAqSource::with_fetcher("Abu Dhabi", cfg, Box::new(fetcher));

            let readings = source.fetch(Pollutant::Pm25, &range()).unwrap();
            let values: Vec<f64> = readings.iter().map(|r| r.value).collect();
            assert_eq!(values, vec![1.0, 2.0, 3.0]);
        }

        #[test]
        fn paging_stops_once_found_count_is_reached() {
            let cfg = paged_cfg();
            let fetcher = MockFetcher::default()
                .with(
                    &sensors_url(&cfg, 11),
                    r#"{"results":[{"id":102,"parameter":{"name":"pm25","units":"µg/m³"}}]}"#,
                )
                .with(
                    &measurements_url(&cfg, 102, &range(), 1).unwrap(),
                    r#"{"meta":{"found":2},"results":[
                        {"value":1.0,"period":{"datetimeFrom":{"utc":"2024-01-01T00:00:00Z"}}},
                        {"value":2.0,"period":{"datetimeFrom":{"utc":"2024-01-01T01:00:00Z"}}}
                    ]}"#,
                );
            let source = OpenAqSource::with_fetcher("Abu Dhabi", cfg, Box::new(fetcher));

            // A request for page 2 would hit a missing mock and fail the location.
            assert_eq!(source.fetch(Pollutant::Pm25, &range()).unwrap().len(), 2);
        }
    }
}
