use std::cell::Cell;
use std::f64::consts::TAU;

use aqf::{
    build_feature_schema, build_features, evaluate, forecast_next_hour, format_ts_utc,
    read_forecast_log, run_forecast, run_training, AlignedSeries, FeatureConfig, ForecastConfig,
    ForecastError, InMemorySource, ModelError, PathsConfig, Pollutant, RawReading, Regressor,
    RidgeRegressor, SeriesColumn, TimeRange, HOUR_MS,
};
use tempfile::tempdir;

const START_TS_MS: i64 = 1_735_689_600_000; // 2025-01-01T00:00:00Z

fn sinusoid(hour: i64) -> f64 {
    40.0 + 10.0 * (hour as f64 * TAU / 24.0).sin()
}

fn pm25_series(hours: i64) -> AlignedSeries {
    AlignedSeries::new(
        Pollutant::Pm25,
        (0..hours).map(|h| START_TS_MS + h * HOUR_MS).collect(),
        vec![SeriesColumn {
            pollutant: Pollutant::Pm25,
            values: (0..hours).map(|h| Some(sinusoid(h))).collect(),
        }],
    )
    .unwrap()
}

fn pm25_source(hours: impl IntoIterator<Item = i64>) -> InMemorySource {
    InMemorySource::new(
        hours
            .into_iter()
            .map(|h| RawReading {
                pollutant: Pollutant::Pm25,
                observed_at: format_ts_utc(START_TS_MS + h * HOUR_MS).unwrap(),
                value: sinusoid(h),
                unit: "µg/m³".to_string(),
                location: "station".to_string(),
            })
            .collect(),
    )
}

fn config(dir: &std::path::Path) -> ForecastConfig {
    ForecastConfig {
        paths: PathsConfig::under(dir.to_path_buf()),
        ..ForecastConfig::default()
    }
}

/// Counts predict calls and always answers zero.
#[derive(Default)]
struct CountingModel {
    predict_calls: Cell<usize>,
}

impl Regressor for CountingModel {
    fn fit(&mut self, _features: &[Vec<f64>], _targets: &[f64]) -> Result<(), ModelError> {
        Ok(())
    }

    fn predict(&self, features: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
        self.predict_calls.set(self.predict_calls.get() + 1);
        Ok(vec![0.0; features.len()])
    }

    fn is_fitted(&self) -> bool {
        true
    }
}

#[test]
fn ridge_beats_persistence_on_a_noiseless_sinusoid() {
    let series = pm25_series(100);
    let (schema, rows, _) = build_features(&series, &FeatureConfig::default()).unwrap();
    let split_ts = START_TS_MS + 80 * HOUR_MS;
    let (train, test): (Vec<_>, Vec<_>) = rows.iter().partition(|row| row.ts_ms_utc < split_ts);
    assert_eq!(test.len(), 20);

    let mut model = RidgeRegressor::default();
    let train_x: Vec<Vec<f64>> = train.iter().map(|row| row.values.clone()).collect();
    let train_y: Vec<f64> = train.iter().map(|row| row.target).collect();
    model.fit(&train_x, &train_y).unwrap();

    let test_x: Vec<Vec<f64>> = test.iter().map(|row| row.values.clone()).collect();
    let actual: Vec<f64> = test.iter().map(|row| row.target).collect();
    let predicted = model.predict(&test_x).unwrap();
    let model_rmse = evaluate(&actual, &predicted).unwrap().rmse;

    let naive_rmse = {
        let squared: f64 = (80..100)
            .map(|h| (sinusoid(h) - sinusoid(h - 1)).powi(2))
            .sum();
        (squared / 20.0).sqrt()
    };

    assert!(naive_rmse > 1.0);
    assert!(
        model_rmse < naive_rmse,
        "model rmse {model_rmse} should beat persistence {naive_rmse}"
    );
    assert_eq!(schema.column_names()[0], "pm25_lag_1h");
}

#[test]
fn training_run_reports_model_and_baseline_metrics() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    let range = TimeRange::new(START_TS_MS, START_TS_MS + 100 * HOUR_MS).unwrap();

    let summary = run_training(&pm25_source(0..100), &range, &cfg)
        .unwrap()
        .completed()
        .unwrap();

    let baseline = summary.metrics.baseline.unwrap();
    assert_eq!(summary.features.output_rows, 76);
    assert_eq!(summary.metrics.train_rows + summary.metrics.test_rows, 76);
    assert!(summary.metrics.model.rmse < baseline.rmse);
    assert!(cfg.paths.model_path.exists());
}

#[test]
fn training_with_a_single_feature_row_is_skipped() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    let range = TimeRange::new(START_TS_MS, START_TS_MS + 25 * HOUR_MS).unwrap();

    let outcome = run_training(&pm25_source(0..25), &range, &cfg).unwrap();

    assert!(outcome.is_skipped());
    assert!(!cfg.paths.model_path.exists());
}

#[test]
fn twenty_three_hours_of_history_is_insufficient_and_appends_nothing() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    let range = TimeRange::new(START_TS_MS, START_TS_MS + 100 * HOUR_MS).unwrap();
    run_training(&pm25_source(0..100), &range, &cfg).unwrap();

    let recent = pm25_source(200..223);
    let now = START_TS_MS + 223 * HOUR_MS;
    let err = run_forecast(&recent, now, &cfg).unwrap_err();

    assert!(matches!(
        err,
        ForecastError::InsufficientHistory {
            required: 24,
            available: 23
        }
    ));
    assert!(read_forecast_log(&cfg.paths.forecast_log_path)
        .unwrap()
        .is_empty());

    let enough = pm25_source(200..224);
    let record = run_forecast(&enough, now + HOUR_MS, &cfg)
        .unwrap()
        .completed()
        .unwrap();
    assert_eq!(record.prediction_ts_ms_utc, START_TS_MS + 224 * HOUR_MS);
    assert_eq!(read_forecast_log(&cfg.paths.forecast_log_path).unwrap().len(), 1);
}

#[test]
fn missing_schema_column_fails_before_predict() {
    let schema = build_feature_schema(Pollutant::Pm25, &[Pollutant::No2], &FeatureConfig::default());
    let mut no2: Vec<Option<f64>> = (0..48).map(|h| Some(10.0 + h as f64)).collect();
    no2[47] = None;
    let series = AlignedSeries::new(
        Pollutant::Pm25,
        (0..48).map(|h| START_TS_MS + h * HOUR_MS).collect(),
        vec![
            SeriesColumn {
                pollutant: Pollutant::Pm25,
                values: (0..48).map(|h| Some(sinusoid(h))).collect(),
            },
            SeriesColumn {
                pollutant: Pollutant::No2,
                values: no2,
            },
        ],
    )
    .unwrap();

    let model = CountingModel::default();
    let err = forecast_next_hour(&model, &schema, &series, START_TS_MS + 48 * HOUR_MS).unwrap_err();

    match err {
        ForecastError::SchemaMismatch { missing } => assert_eq!(missing, vec!["no2_lag_1h"]),
        other => panic!("expected SchemaMismatch, got {other:?}"),
    }
    assert_eq!(model.predict_calls.get(), 0);
}

#[test]
fn negative_predictions_are_clamped_to_zero() {
    struct Negative;
    impl Regressor for Negative {
        fn fit(&mut self, _: &[Vec<f64>], _: &[f64]) -> Result<(), ModelError> {
            Ok(())
        }
        fn predict(&self, features: &[Vec<f64>]) -> Result<Vec<f64>, ModelError> {
            Ok(vec![-3.5; features.len()])
        }
        fn is_fitted(&self) -> bool {
            true
        }
    }

    let series = pm25_series(30);
    let schema = build_feature_schema(Pollutant::Pm25, &[], &FeatureConfig::default());
    let record = forecast_next_hour(&Negative, &schema, &series, START_TS_MS + 30 * HOUR_MS).unwrap();
    assert_eq!(record.predicted_value, 0.0);
    assert_eq!(record.prediction_ts_ms_utc, START_TS_MS + 30 * HOUR_MS);
}
