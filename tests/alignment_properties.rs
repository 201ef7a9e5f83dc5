use aqf::{
    align_readings, build_features, format_ts_utc, read_aligned_table, write_aligned_table,
    AlignedSeries, AlignmentConfig, DuplicatePolicy, FeatureConfig, Pollutant, RawReading,
    HOUR_MS,
};
use tempfile::tempdir;

const START_TS_MS: i64 = 1_735_689_600_000; // 2025-01-01T00:00:00Z

fn reading(pollutant: Pollutant, ts_ms_utc: i64, value: f64, location: &str) -> RawReading {
    RawReading {
        pollutant,
        observed_at: format_ts_utc(ts_ms_utc).unwrap(),
        value,
        unit: pollutant.default_unit().to_string(),
        location: location.to_string(),
    }
}

fn hourly(pollutant: Pollutant, hours: impl IntoIterator<Item = i64>) -> Vec<RawReading> {
    hours
        .into_iter()
        .map(|h| {
            reading(
                pollutant,
                START_TS_MS + h * HOUR_MS,
                20.0 + (h % 7) as f64 * 1.5,
                "station-a",
            )
        })
        .collect()
}

fn series_to_readings(series: &AlignedSeries) -> Vec<RawReading> {
    let mut out = Vec::new();
    for column in series.columns() {
        for (ts, value) in series.timestamps().iter().zip(&column.values) {
            if let Some(value) = value {
                out.push(reading(column.pollutant, *ts, *value, "aligned"));
            }
        }
    }
    out
}

fn mixed_input() -> Vec<RawReading> {
    let mut readings = hourly(Pollutant::Pm25, (0..40).filter(|h| !(10..14).contains(h)));
    readings.extend(hourly(Pollutant::No2, (0..40).filter(|h| h % 3 != 0)));
    readings.push(RawReading {
        observed_at: "2025-01-01T05:20:00+04:00".to_string(),
        ..reading(Pollutant::Pm25, START_TS_MS, 99.0, "station-b")
    });
    readings.push(RawReading {
        observed_at: "not a timestamp".to_string(),
        ..reading(Pollutant::Pm25, START_TS_MS, 1.0, "station-b")
    });
    readings
}

#[test]
fn aligning_twice_is_byte_identical() {
    let dir = tempdir().unwrap();
    let cfg = AlignmentConfig::default();

    let (first, report) = align_readings(&mixed_input(), &cfg).unwrap();
    assert_eq!(report.parse_failures, 1);
    let first_path = dir.path().join("first.csv");
    write_aligned_table(&first_path, &first).unwrap();

    let (again, _) = align_readings(&mixed_input(), &cfg).unwrap();
    assert_eq!(first, again);

    let persisted = read_aligned_table(&first_path, Pollutant::Pm25).unwrap();
    let (second, _) = align_readings(&series_to_readings(&persisted), &cfg).unwrap();
    let second_path = dir.path().join("second.csv");
    write_aligned_table(&second_path, &second).unwrap();

    assert_eq!(
        std::fs::read(&first_path).unwrap(),
        std::fs::read(&second_path).unwrap()
    );
}

#[test]
fn five_hour_gap_is_filled_and_ten_hour_gap_is_not() {
    let hours = (0..60).filter(|h| !(10..15).contains(h) && !(30..40).contains(h));
    let (series, report) =
        align_readings(&hourly(Pollutant::Pm25, hours), &AlignmentConfig::default()).unwrap();
    let target = series.target_values().unwrap();

    assert_eq!(series.len(), 60);
    assert!(target[10..15].iter().all(Option::is_some));
    assert!(target[30..40].iter().all(Option::is_none));
    assert_eq!(report.interpolated_cells, 5);
    assert_eq!(report.missing_cells_after_interpolation, 10);

    let left = target[9].unwrap();
    let right = target[15].unwrap();
    let expected = left + (right - left) * 3.0 / 6.0;
    assert!((target[12].unwrap() - expected).abs() < 1e-9);
}

#[test]
fn leading_and_trailing_gaps_stay_missing() {
    let mut readings = hourly(Pollutant::Pm25, 3..20);
    readings.extend(hourly(Pollutant::No2, 0..24));
    let (series, _) = align_readings(&readings, &AlignmentConfig::default()).unwrap();
    let target = series.target_values().unwrap();

    assert_eq!(series.len(), 24);
    assert!(target[..3].iter().all(Option::is_none));
    assert!(target[20..].iter().all(Option::is_none));
}

#[test]
fn column_null_on_every_target_row_is_pruned_without_row_loss() {
    let pm25_hours: Vec<i64> = (0..60).filter(|h| !(30..40).contains(h)).collect();
    let base = hourly(Pollutant::Pm25, pm25_hours.clone());

    let mut with_so2 = base.clone();
    with_so2.extend(hourly(Pollutant::So2, 31..39));

    let cfg = AlignmentConfig::default();
    let (plain, _) = align_readings(&base, &cfg).unwrap();
    let (pruned, report) = align_readings(&with_so2, &cfg).unwrap();

    assert_eq!(report.pruned_columns, vec![Pollutant::So2]);
    assert!(pruned.column(Pollutant::So2).is_none());
    assert_eq!(pruned.len(), plain.len());

    let (schema, rows, features) = build_features(&pruned, &FeatureConfig::default()).unwrap();
    let (_, plain_rows, _) = build_features(&plain, &FeatureConfig::default()).unwrap();
    assert!(schema.column_names().iter().all(|name| !name.starts_with("so2")));
    assert_eq!(rows.len(), plain_rows.len());
    assert_eq!(features.output_rows, rows.len() as u64);
}

#[test]
fn duplicate_policy_controls_same_timestamp_readings() {
    let ts = START_TS_MS;
    let readings = vec![
        reading(Pollutant::Pm25, ts, 10.0, "a"),
        reading(Pollutant::Pm25, ts, 30.0, "b"),
        reading(Pollutant::Pm25, ts + HOUR_MS, 12.0, "a"),
    ];

    let (keep_first, report) = align_readings(&readings, &AlignmentConfig::default()).unwrap();
    assert_eq!(report.duplicates_collapsed, 1);
    assert_eq!(keep_first.target_values().unwrap()[0], Some(10.0));

    let cfg = AlignmentConfig {
        duplicate_policy: DuplicatePolicy::MeanAcrossStations,
        ..AlignmentConfig::default()
    };
    let (averaged, _) = align_readings(&readings, &cfg).unwrap();
    assert_eq!(averaged.target_values().unwrap()[0], Some(20.0));
}

#[test]
fn sub_hour_readings_are_averaged_into_their_hour() {
    let readings = vec![
        reading(Pollutant::Pm25, START_TS_MS, 10.0, "a"),
        RawReading {
            observed_at: "2025-01-01T00:30:00Z".to_string(),
            ..reading(Pollutant::Pm25, START_TS_MS, 20.0, "a")
        },
        reading(Pollutant::Pm25, START_TS_MS + HOUR_MS, 12.0, "a"),
    ];
    let (series, _) = align_readings(&readings, &AlignmentConfig::default()).unwrap();
    assert_eq!(series.target_values().unwrap()[0], Some(15.0));
}

#[test]
fn nothing_usable_is_data_unavailable() {
    let readings = vec![RawReading {
        observed_at: "garbage".to_string(),
        ..reading(Pollutant::Pm25, START_TS_MS, 1.0, "a")
    }];
    let err = align_readings(&readings, &AlignmentConfig::default()).unwrap_err();
    assert!(err.is_skippable());
}
