//! Health checks over recent forecasts. Reports only, never gates.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::inference::ForecastRecord;
use crate::reading::HOUR_MS;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub lookback_hours: u32,
    pub max_valid_prediction: f64,
    pub max_coefficient_of_variation: f64,
    pub min_records_for_variance: usize,
    pub max_gap_hours: u32,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            lookback_hours: 7 * 24,
            max_valid_prediction: 500.0,
            max_coefficient_of_variation: 1.0,
            min_records_for_variance: 10,
            max_gap_hours: 2,
        }
    }
}

impl MonitoringConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.lookback_hours == 0 {
            return Err("lookback_hours must be > 0".to_string());
        }
        if !self.max_valid_prediction.is_finite() || self.max_valid_prediction <= 0.0 {
            return Err("max_valid_prediction must be a positive finite number".to_string());
        }
        if !self.max_coefficient_of_variation.is_finite() || self.max_coefficient_of_variation <= 0.0
        {
            return Err("max_coefficient_of_variation must be a positive finite number".to_string());
        }
        if self.min_records_for_variance < 2 {
            return Err("min_records_for_variance must be >= 2".to_string());
        }
        if self.max_gap_hours == 0 {
            return Err("max_gap_hours must be > 0".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    OutOfRange,
    HighVariance,
    MissingPredictions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResults {
    pub range: bool,
    pub variance: bool,
    pub gaps: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringReport {
    pub checked_at_ms_utc: i64,
    pub records_checked: usize,
    pub checks: CheckResults,
    pub alerts: Vec<Alert>,
    pub all_passed: bool,
}

/// Runs every check over records generated within the lookback window
/// ending at `now_ms_utc`.
pub fn run_checks(
    records: &[ForecastRecord],
    now_ms_utc: i64,
    cfg: &MonitoringConfig,
) -> MonitoringReport {
    let cutoff = now_ms_utc - i64::from(cfg.lookback_hours) * HOUR_MS;
    let recent: Vec<&ForecastRecord> = records
        .iter()
        .filter(|record| record.generated_at_ms_utc >= cutoff)
        .collect();

    let mut alerts = Vec::new();
    let checks = CheckResults {
        range: check_range(&recent, cfg, &mut alerts),
        variance: check_variance(&recent, cfg, &mut alerts),
        gaps: check_gaps(&recent, cfg, &mut alerts),
    };
    let all_passed = checks.range && checks.variance && checks.gaps;

    if all_passed {
        info!(
            component = "monitoring",
            event = "monitoring.passed",
            records_checked = recent.len()
        );
    } else {
        for alert in &alerts {
            warn!(
                component = "monitoring",
                event = "monitoring.alert",
                kind = ?alert.kind,
                severity = ?alert.severity,
                message = %alert.message
            );
        }
    }

    MonitoringReport {
        checked_at_ms_utc: now_ms_utc,
        records_checked: recent.len(),
        checks,
        alerts,
        all_passed,
    }
}

fn check_range(records: &[&ForecastRecord], cfg: &MonitoringConfig, alerts: &mut Vec<Alert>) -> bool {
    let out_of_range = records
        .iter()
        .filter(|r| r.predicted_value < 0.0 || r.predicted_value > cfg.max_valid_prediction)
        .count();
    if out_of_range == 0 {
        return true;
    }
    alerts.push(Alert {
        kind: AlertKind::OutOfRange,
        severity: Severity::Warning,
        message: format!(
            "{out_of_range} predictions out of valid range (0-{})",
            cfg.max_valid_prediction
        ),
    });
    false
}

fn check_variance(
    records: &[&ForecastRecord],
    cfg: &MonitoringConfig,
    alerts: &mut Vec<Alert>,
) -> bool {
    if records.len() < cfg.min_records_for_variance {
        return true;
    }
    let n = records.len() as f64;
    let mean = records.iter().map(|r| r.predicted_value).sum::<f64>() / n;
    let variance = records
        .iter()
        .map(|r| (r.predicted_value - mean).powi(2))
        .sum::<f64>()
        / (n - 1.0);
    let cv = if mean > 0.0 { variance.sqrt() / mean } else { 0.0 };
    if cv <= cfg.max_coefficient_of_variation {
        return true;
    }
    alerts.push(Alert {
        kind: AlertKind::HighVariance,
        severity: Severity::Warning,
        message: format!("high prediction variance detected (CV={cv:.2})"),
    });
    false
}

fn check_gaps(records: &[&ForecastRecord], cfg: &MonitoringConfig, alerts: &mut Vec<Alert>) -> bool {
    let mut dates: Vec<i64> = records.iter().map(|r| r.prediction_ts_ms_utc).collect();
    dates.sort_unstable();
    let max_gap_ms = i64::from(cfg.max_gap_hours) * HOUR_MS;
    let gap_count = dates
        .windows(2)
        .filter(|pair| pair[1] - pair[0] > max_gap_ms)
        .count();
    if gap_count == 0 {
        return true;
    }
    alerts.push(Alert {
        kind: AlertKind::MissingPredictions,
        severity: Severity::Info,
        message: format!("{gap_count} gaps detected in hourly predictions"),
    });
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW_MS: i64 = 1_704_067_200_000;

    fn hourly(values: &[f64]) -> Vec<ForecastRecord> {
        values
            .iter()
            .enumerate()
            .map(|(i, value)| ForecastRecord {
                prediction_ts_ms_utc: NOW_MS - (values.len() - i) as i64 * HOUR_MS,
                predicted_value: *value,
                generated_at_ms_utc: NOW_MS - (values.len() - i) as i64 * HOUR_MS,
            })
            .collect()
    }

    #[test]
    fn steady_hourly_forecasts_pass_every_check() {
        let report = run_checks(&hourly(&[20.0; 12]), NOW_MS, &MonitoringConfig::default());
        assert!(report.all_passed);
        assert_eq!(report.records_checked, 12);
        assert!(report.alerts.is_empty());
    }

    #[test]
    fn out_of_range_and_gaps_raise_alerts() {
        let mut records = hourly(&[20.0, 650.0, 21.0]);
        records[2].prediction_ts_ms_utc += 5 * HOUR_MS;
        let report = run_checks(&records, NOW_MS, &MonitoringConfig::default());

        assert!(!report.checks.range);
        assert!(!report.checks.gaps);
        assert!(report.checks.variance);
        let kinds: Vec<AlertKind> = report.alerts.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::OutOfRange, AlertKind::MissingPredictions]);
    }

    #[test]
    fn variance_check_needs_enough_records() {
        let spiky = [1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 100.0];
        let report = run_checks(&hourly(&spiky), NOW_MS, &MonitoringConfig::default());
        assert!(!report.checks.variance);

        let report = run_checks(&hourly(&spiky[1..]), NOW_MS, &MonitoringConfig::default());
        assert!(report.checks.variance);
    }

    #[test]
    fn records_older_than_lookback_are_ignored() {
        let mut records = hourly(&[20.0, 900.0]);
        records[1].generated_at_ms_utc = NOW_MS - 30 * 24 * HOUR_MS;
        let report = run_checks(&records, NOW_MS, &MonitoringConfig::default());
        assert!(report.all_passed);
        assert_eq!(report.records_checked, 1);
    }
}
