use aqf::{
    build_feature_schema, build_features, causal_feature_values, construct_inference_vector,
    AlignedSeries, FeatureConfig, Pollutant, SeriesColumn, HOUR_MS,
};

const START_TS_MS: i64 = 1_735_689_600_000; // 2025-01-01T00:00:00Z

fn pm25_series(values: Vec<Option<f64>>) -> AlignedSeries {
    let ts = (0..values.len() as i64)
        .map(|idx| START_TS_MS + idx * HOUR_MS)
        .collect();
    AlignedSeries::new(
        Pollutant::Pm25,
        ts,
        vec![SeriesColumn {
            pollutant: Pollutant::Pm25,
            values,
        }],
    )
    .unwrap()
}

fn wavy(hours: usize) -> Vec<Option<f64>> {
    (0..hours)
        .map(|h| Some(35.0 + 12.0 * (h as f64 * 0.37).sin() + (h % 5) as f64))
        .collect()
}

/// Rolling mean that includes the row it labels. Kept only to show the
/// regression test can tell the two apart.
fn unshifted_rolling_mean(series: &AlignedSeries, row: usize, window: usize) -> f64 {
    let target = series.target_values().unwrap();
    let values: Vec<f64> = target[row + 1 - window..=row]
        .iter()
        .map(|v| v.unwrap())
        .collect();
    values.iter().sum::<f64>() / values.len() as f64
}

#[test]
fn rolling_features_at_t_ignore_the_target_at_t() {
    let series = pm25_series(wavy(48));
    let cfg = FeatureConfig::default();
    let schema = build_feature_schema(Pollutant::Pm25, &[], &cfg);
    let mean_idx = schema.index_of("pm25_rolling_mean_24h").unwrap();
    let std_idx = schema.index_of("pm25_rolling_std_24h").unwrap();
    let lag_idx = schema.index_of("pm25_lag_1h").unwrap();

    for row in [24, 30, 47] {
        let before = causal_feature_values(&schema, &series, row).unwrap();
        let mutated = series
            .with_value(Pollutant::Pm25, row, Some(10_000.0))
            .unwrap();
        let after = causal_feature_values(&schema, &mutated, row).unwrap();

        assert_eq!(before[mean_idx], after[mean_idx], "rolling mean at {row}");
        assert_eq!(before[std_idx], after[std_idx], "rolling std at {row}");
        assert_eq!(before[lag_idx], after[lag_idx], "lag 1h at {row}");
        assert_eq!(before, after);
    }
}

#[test]
fn unshifted_rolling_mean_fixture_does_leak() {
    let series = pm25_series(wavy(48));
    let mutated = series
        .with_value(Pollutant::Pm25, 30, Some(10_000.0))
        .unwrap();

    assert_ne!(
        unshifted_rolling_mean(&series, 30, 24),
        unshifted_rolling_mean(&mutated, 30, 24)
    );
}

#[test]
fn training_rows_carry_the_shifted_window() {
    let series = pm25_series(wavy(48));
    let (schema, rows, _) = build_features(&series, &FeatureConfig::default()).unwrap();
    let mean_idx = schema.index_of("pm25_rolling_mean_24h").unwrap();
    let target = series.target_values().unwrap();

    for row in &rows {
        let position = ((row.ts_ms_utc - START_TS_MS) / HOUR_MS) as usize;
        let expected = target[position - 24..position]
            .iter()
            .map(|v| v.unwrap())
            .sum::<f64>()
            / 24.0;
        assert!((row.values[mean_idx] - expected).abs() < 1e-9);
        assert_eq!(row.target, target[position].unwrap());
    }
}

#[test]
fn inference_vector_matches_builder_row_for_the_next_hour() {
    let full = pm25_series(wavy(60));
    let (schema, rows, _) = build_features(&full, &FeatureConfig::default()).unwrap();

    for last_observed in [30usize, 41, 58] {
        let history = pm25_series(full.target_values().unwrap()[..=last_observed].to_vec());
        let vector = construct_inference_vector(&history, &schema).unwrap();

        let expected_ts = START_TS_MS + (last_observed as i64 + 1) * HOUR_MS;
        assert_eq!(vector.ts_ms_utc, expected_ts);
        let builder_row = rows
            .iter()
            .find(|row| row.ts_ms_utc == expected_ts)
            .unwrap();

        for name in ["pm25_rolling_mean_24h", "pm25_rolling_std_24h", "pm25_lag_24h"] {
            let idx = schema.index_of(name).unwrap();
            assert_eq!(vector.values[idx], builder_row.values[idx], "{name}");
        }
        assert_eq!(vector.values, builder_row.values);
    }
}

#[test]
fn schema_order_and_fingerprint_are_deterministic() {
    let cfg = FeatureConfig::default();
    let a = build_feature_schema(Pollutant::Pm25, &[Pollutant::No2, Pollutant::O3], &cfg);
    let b = build_feature_schema(Pollutant::Pm25, &[Pollutant::No2, Pollutant::O3], &cfg);
    assert_eq!(a, b);
    assert_eq!(
        a.column_names(),
        vec![
            "no2_lag_1h",
            "o3_lag_1h",
            "pm25_lag_1h",
            "pm25_lag_2h",
            "pm25_lag_3h",
            "pm25_lag_24h",
            "pm25_rolling_mean_24h",
            "pm25_rolling_std_24h",
            "hour",
            "day_of_week",
            "month",
        ]
    );

    let without_o3 = build_feature_schema(Pollutant::Pm25, &[Pollutant::No2], &cfg);
    assert_ne!(a.fingerprint, without_o3.fingerprint);
}
