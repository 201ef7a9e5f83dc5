//! Read-only HTTP view over the forecast log.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ForecastError;
use crate::inference::ForecastRecord;
use crate::monitoring::{run_checks, MonitoringConfig, MonitoringReport};
use crate::pollutant::Pollutant;
use crate::tables::{read_forecast_log, resolve_latest};

pub const DASHBOARD_HEADERS: [&str; 3] = ["Prediction Hour", "Predicted Value", "Generated At"];

/// Resolved forecasts, newest prediction hour first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastSnapshot {
    pub target: Pollutant,
    pub records: Vec<ForecastRecord>,
    pub monitoring: Option<MonitoringReport>,
}

impl ForecastSnapshot {
    pub fn empty(target: Pollutant) -> Self {
        Self {
            target,
            records: Vec::new(),
            monitoring: None,
        }
    }
}

pub trait ForecastSnapshotSource: Send + Sync + 'static {
    fn snapshot(&self) -> Result<ForecastSnapshot, ForecastError>;
}

#[derive(Clone)]
pub struct InMemorySnapshotSource {
    inner: Arc<RwLock<ForecastSnapshot>>,
}

impl InMemorySnapshotSource {
    pub fn new(snapshot: ForecastSnapshot) -> Self {
        Self {
            inner: Arc::new(RwLock::new(snapshot)),
        }
    }

    pub fn replace_snapshot(&self, snapshot: ForecastSnapshot) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = snapshot;
    }
}

impl ForecastSnapshotSource for InMemorySnapshotSource {
    fn snapshot(&self) -> Result<ForecastSnapshot, ForecastError> {
        let guard = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard.clone())
    }
}

/// Re-reads the forecast log on every request.
#[derive(Debug, Clone)]
pub struct ForecastLogSnapshotSource {
    path: PathBuf,
    target: Pollutant,
    monitoring: MonitoringConfig,
    max_rows: usize,
}

impl ForecastLogSnapshotSource {
    pub fn new(path: PathBuf, target: Pollutant, monitoring: MonitoringConfig) -> Self {
        Self {
            path,
            target,
            monitoring,
            max_rows: 7 * 24,
        }
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }
}

impl ForecastSnapshotSource for ForecastLogSnapshotSource {
    fn snapshot(&self) -> Result<ForecastSnapshot, ForecastError> {
        let records = read_forecast_log(&self.path)?;
        let monitoring = if records.is_empty() {
            None
        } else {
            Some(run_checks(
                &records,
                Utc::now().timestamp_millis(),
                &self.monitoring,
            ))
        };

        let mut resolved = resolve_latest(&records);
        resolved.reverse();
        resolved.truncate(self.max_rows);

        Ok(ForecastSnapshot {
            target: self.target,
            records: resolved,
            monitoring,
        })
    }
}

pub fn dashboard_router(source: Arc<dyn ForecastSnapshotSource>, display_tz: Tz) -> Router {
    Router::new()
        .route("/dashboard", get(get_dashboard_html))
        .route("/forecasts", get(get_forecasts))
        .with_state(DashboardAppState { source, display_tz })
}

pub fn format_ts_in_tz(ts_ms_utc: i64, tz: Tz) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ts_ms_utc) {
        Some(ts) => ts.with_timezone(&tz).format("%Y-%m-%d %H:%M %Z").to_string(),
        None => "-".to_string(),
    }
}

pub fn render_dashboard_html(snapshot: &ForecastSnapshot, display_tz: Tz) -> String {
    let target = snapshot.target.as_str();

    let mut out = String::new();
    out.push_str("<!DOCTYPE html><html><head><meta charset=\"utf-8\">\n");
    out.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
    out.push_str(&format!(
        "<title>{} Forecast Dashboard</title>\n",
        escape_html(&target.to_uppercase())
    ));
    out.push_str("<style>:root{--bg:#eef2f0;--card:#ffffff;--ink:#182026;--muted:#5f6a73;--line:#d7dce1;--head:#1f3d33;--warn:#fff1c2;--warnink:#7a5500}*{box-sizing:border-box}body{margin:0;color:var(--ink);font-family:\"Avenir Next\",\"Segoe UI\",sans-serif;background:linear-gradient(160deg,var(--bg),#e3ecf2);min-height:100vh}.shell{max-width:960px;margin:0 auto;padding:24px 18px 28px}.hero{background:linear-gradient(135deg,#1f3d33 0%,#3b6b58 100%);color:#f5faf7;border-radius:16px;padding:18px 20px}.hero h1{margin:0 0 8px;font-size:1.5rem}.hero-meta{display:flex;gap:16px;flex-wrap:wrap;font-size:.92rem;color:#d6e8df}.card{margin-top:16px;background:var(--card);border:1px solid #cbd4db;border-radius:16px;overflow:hidden}.table-wrap{overflow:auto;max-height:75vh}table{width:100%;border-collapse:collapse}thead th{position:sticky;top:0;background:var(--head);color:#f2f7f4;font-size:.8rem;text-transform:uppercase;letter-spacing:.04em;padding:10px;text-align:left}tbody td{font-size:.86rem;padding:9px 10px;border-bottom:1px solid var(--line);white-space:nowrap}tbody tr:nth-child(even){background:#fafcfb}.alerts{margin:0;padding:10px 14px 10px 30px;background:var(--warn);color:var(--warnink);font-size:.84rem}.empty{padding:18px;color:var(--muted)}</style>\n");
    out.push_str("</head><body><main class=\"shell\">\n");
    out.push_str(&format!(
        "<section class=\"hero\"><h1>{} next-hour forecast</h1>",
        escape_html(&target.to_uppercase())
    ));
    out.push_str("<div class=\"hero-meta\">\n");
    out.push_str(&format!(
        "<span>Forecasts: {}</span>",
        snapshot.records.len()
    ));
    out.push_str(&format!(
        "<span>Time zone: {}</span>",
        escape_html(display_tz.name())
    ));
    out.push_str(&format!(
        "<span>Rendered: {}</span>",
        escape_html(&format_ts_in_tz(Utc::now().timestamp_millis(), display_tz))
    ));
    if let Some(report) = &snapshot.monitoring {
        let status = if report.all_passed {
            "all checks passed"
        } else {
            "alerts raised"
        };
        out.push_str(&format!("<span>Monitoring: {status}</span>"));
    }
    out.push_str("</div></section>\n");

    out.push_str("<section class=\"card\">");
    if let Some(report) = snapshot.monitoring.as_ref().filter(|r| !r.alerts.is_empty()) {
        out.push_str("<ul class=\"alerts\">");
        for alert in &report.alerts {
            out.push_str("<li>");
            out.push_str(&escape_html(&alert.message));
            out.push_str("</li>");
        }
        out.push_str("</ul>");
    }

    if snapshot.records.is_empty() {
        out.push_str("<div class=\"empty\">No forecasts logged yet.</div></section>");
        out.push_str("</main></body></html>\n");
        return out;
    }

    out.push_str("<div class=\"table-wrap\"><table id=\"forecast-table\">\n<thead><tr>");
    for header in DASHBOARD_HEADERS {
        out.push_str("<th>");
        out.push_str(&escape_html(header));
        out.push_str("</th>");
    }
    out.push_str("</tr></thead><tbody>\n");

    for (idx, record) in snapshot.records.iter().enumerate() {
        out.push_str(&format!("<tr data-row=\"{idx}\">"));
        let cells = [
            format_ts_in_tz(record.prediction_ts_ms_utc, display_tz),
            format!("{:.2}", record.predicted_value),
            format_ts_in_tz(record.generated_at_ms_utc, display_tz),
        ];
        for cell in cells {
            out.push_str("<td>");
            out.push_str(&escape_html(&cell));
            out.push_str("</td>");
        }
        out.push_str("</tr>\n");
    }

    out.push_str("</tbody></table></div></section>");
    out.push_str("</main></body></html>\n");
    out
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[derive(Clone)]
struct DashboardAppState {
    source: Arc<dyn ForecastSnapshotSource>,
    display_tz: Tz,
}

async fn get_dashboard_html(State(state): State<DashboardAppState>) -> Response {
    match load_snapshot(&state).await {
        Ok(snapshot) => {
            info!(
                component = "dashboard",
                event = "http.dashboard.request",
                records = snapshot.records.len()
            );
            Html(render_dashboard_html(&snapshot, state.display_tz)).into_response()
        }
        Err(err) => snapshot_failed("/dashboard", &err),
    }
}

async fn get_forecasts(State(state): State<DashboardAppState>) -> Response {
    match load_snapshot(&state).await {
        Ok(snapshot) => {
            info!(
                component = "dashboard",
                event = "http.snapshot.request",
                records = snapshot.records.len()
            );
            Json(snapshot).into_response()
        }
        Err(err) => snapshot_failed("/forecasts", &err),
    }
}

/// Snapshot sources may read files, so they run on the blocking pool.
async fn load_snapshot(state: &DashboardAppState) -> Result<ForecastSnapshot, ForecastError> {
    let source = Arc::clone(&state.source);
    tokio::task::spawn_blocking(move || source.snapshot())
        .await
        .map_err(|err| ForecastError::InvalidInput(format!("snapshot task failed: {err}")))?
}

fn snapshot_failed(route: &'static str, err: &ForecastError) -> Response {
    warn!(
        component = "dashboard",
        event = "http.snapshot.error",
        route,
        error = %err
    );
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "forecast log unavailable".to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::append_forecast;
    use tempfile::tempdir;

    const HOUR0: i64 = 1_704_067_200_000;
    const HOUR_MS: i64 = 3_600_000;

    fn record(hour: i64, value: f64, generated_offset_ms: i64) -> ForecastRecord {
        ForecastRecord {
            prediction_ts_ms_utc: HOUR0 + hour * HOUR_MS,
            predicted_value: value,
            generated_at_ms_utc: HOUR0 + (hour - 1) * HOUR_MS + generated_offset_ms,
        }
    }

    #[test]
    fn times_render_in_the_display_time_zone() {
        assert_eq!(format_ts_in_tz(HOUR0, chrono_tz::UTC), "2024-01-01 00:00 UTC");
        assert!(format_ts_in_tz(HOUR0, chrono_tz::Asia::Dubai).starts_with("2024-01-01 04:00"));
    }

    #[test]
    fn rendered_html_lists_each_forecast() {
        let snapshot = ForecastSnapshot {
            target: Pollutant::Pm25,
            records: vec![record(2, 18.25, 0), record(1, 17.0, 0)],
            monitoring: None,
        };

        let html = render_dashboard_html(&snapshot, chrono_tz::UTC);
        assert!(html.contains("forecast-table"));
        assert!(html.contains("PM25 next-hour forecast"));
        assert!(html.contains("<td>18.25</td>"));
        assert!(html.contains("data-row=\"1\""));
        assert!(!html.contains("data-row=\"2\""));
    }

    #[test]
    fn empty_snapshot_renders_placeholder() {
        let html = render_dashboard_html(&ForecastSnapshot::empty(Pollutant::Pm25), chrono_tz::UTC);
        assert!(html.contains("No forecasts logged yet."));
        assert!(!html.contains("<table"));
    }

    #[test]
    fn escape_html_handles_markup() {
        assert_eq!(escape_html("<a href='x'>&</a>"), "&lt;a href=&#39;x&#39;&gt;&amp;&lt;/a&gt;");
    }

    #[test]
    fn log_source_resolves_newest_first_and_caps_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("predictions.csv");
        append_forecast(&path, &record(1, 10.0, 0)).unwrap();
        append_forecast(&path, &record(2, 11.0, 0)).unwrap();
        append_forecast(&path, &record(1, 12.0, 60_000)).unwrap();
        append_forecast(&path, &record(3, 13.0, 0)).unwrap();

        let source =
            ForecastLogSnapshotSource::new(path, Pollutant::Pm25, MonitoringConfig::default())
                .with_max_rows(2);
        let snapshot = source.snapshot().unwrap();

        let values: Vec<f64> = snapshot.records.iter().map(|r| r.predicted_value).collect();
        assert_eq!(values, vec![13.0, 11.0]);
        assert!(snapshot.monitoring.is_some());
    }

    #[test]
    fn missing_log_gives_empty_snapshot() {
        let dir = tempdir().unwrap();
        let source = ForecastLogSnapshotSource::new(
            dir.path().join("absent.csv"),
            Pollutant::Pm25,
            MonitoringConfig::default(),
        );
        let snapshot = source.snapshot().unwrap();
        assert_eq!(snapshot, ForecastSnapshot::empty(Pollutant::Pm25));
    }
}
