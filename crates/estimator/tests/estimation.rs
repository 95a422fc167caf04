use approx::assert_abs_diff_eq;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serial_test::serial;

use pmkrig::chunker::ChunkConfig;
use pmkrig::corrections::{CorrectionTable, LinearCorrection};
use pmkrig::matrix::MatrixConfig;
use pmkrig::schedule::{LengthScaleSchedule, LengthScales, Schedule};
use pmkrig::{
    hours, AreaConfig, BoundingBox, CancellationToken, EstimateError, EstimateStatus, Estimator,
    EstimatorConfig, MemoryStore, QueryLocation, RetryPolicy, SensorReading, SensorStore,
    TimeRange,
};

const SENSORS: [(&str, f64, f64); 3] = [
    ("S1", 40.760, -111.890),
    ("S2", 40.768, -111.880),
    ("S3", 40.752, -111.878),
];

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 1, 10, 0, 0, 0).unwrap()
}

fn centroid() -> QueryLocation {
    let n = SENSORS.len() as f64;
    QueryLocation::new(
        SENSORS.iter().map(|s| s.1).sum::<f64>() / n,
        SENSORS.iter().map(|s| s.2).sum::<f64>() / n,
    )
    .with_elevation(1300.)
}

fn area() -> AreaConfig {
    AreaConfig::new("slc", "Salt Lake City", chrono_tz::America::Denver).length_scales(
        LengthScaleSchedule::new().default_value(LengthScales {
            space: 4300.,
            time: 1.,
            elevation: 100.,
        }),
    )
}

fn reading(id: &str, lat: f64, lon: f64, timestamp: DateTime<Utc>, value: f64) -> SensorReading {
    SensorReading {
        sensor_id: id.to_string(),
        latitude: lat,
        longitude: lon,
        elevation: Some(1300.),
        timestamp,
        value,
        sensor_model: Some("PMS5003".to_string()),
        sensor_source: Some("airu".to_string()),
    }
}

/// Readings of every sensor each `step_minutes` from `from_h` to `to_h` hours after t0
fn readings<V: Fn(usize, f64) -> f64>(
    step_minutes: i64,
    from_h: i64,
    to_h: i64,
    value: V,
) -> Vec<SensorReading> {
    let mut readings = vec![];
    let mut t = t0() + Duration::hours(from_h) + Duration::minutes(1);
    while t <= t0() + Duration::hours(to_h) {
        let h = (t - t0()).num_seconds() as f64 / 3600.;
        for (i, (id, lat, lon)) in SENSORS.iter().enumerate() {
            readings.push(reading(id, *lat, *lon, t, value(i, h)));
        }
        t += Duration::minutes(step_minutes);
    }
    readings
}

fn hourly_times(n: i64) -> Vec<DateTime<Utc>> {
    (0..n).map(|h| t0() + Duration::hours(h)).collect()
}

fn hourly_config() -> EstimatorConfig {
    EstimatorConfig::default().matrix(MatrixConfig {
        bin_minutes: 60.,
        ..MatrixConfig::default()
    })
}

#[test]
fn test_constant_field_end_to_end() {
    let store = MemoryStore::new(readings(60, 0, 24, |_, _| 12.));
    let estimator = Estimator::new(hourly_config(), store).unwrap();
    let times = hourly_times(24);
    let estimates = estimator
        .compute_estimates(&area(), &times, &[centroid()], &CancellationToken::new())
        .unwrap();

    assert_eq!(estimates.predictions.dim(), (1, 24));
    assert!(estimates.is_complete(), "{:?}", estimates.status);
    let midpoint = estimates.predictions[[0, 12]];
    assert_abs_diff_eq!(midpoint, 12., epsilon = 2.);
    let variance = estimates.variances[[0, 12]];
    assert!(variance < pmkrig_gp::DEFAULT_SIGNAL_VARIANCE);
    assert!(variance > -1e-6);
    assert_eq!(estimates.elevations.to_vec(), vec![1300.]);
}

#[test]
fn test_one_chunk_or_two_chunks() {
    let value = |s: usize, h: f64| 20. + 5. * (2. * std::f64::consts::PI * h / 12.).sin() + s as f64;
    let store = MemoryStore::new(readings(8, -5, 53, value));
    let times = hourly_times(48);
    let locations = [centroid(), QueryLocation::new(40.764, -111.885)];

    let single = Estimator::new(
        EstimatorConfig::default().chunks(ChunkConfig {
            chunk_factor: 48.,
            padding_factor: 3.,
        }),
        store.clone(),
    )
    .unwrap()
    .compute_estimates(&area(), &times, &locations, &CancellationToken::new())
    .unwrap();
    let split = Estimator::new(
        EstimatorConfig::default()
            .chunks(ChunkConfig {
                chunk_factor: 24.,
                padding_factor: 3.,
            })
            .parallel(false),
        store,
    )
    .unwrap()
    .compute_estimates(&area(), &times, &locations, &CancellationToken::new())
    .unwrap();

    assert!(single.is_complete() && split.is_complete());
    // split between hours 23 and 24, padding is 3 hours
    for t in (2..=20).chain(27..=45) {
        for l in 0..locations.len() {
            let (a, b) = (single.predictions[[l, t]], split.predictions[[l, t]]);
            assert!(
                (a - b).abs() <= 0.01 * a.abs(),
                "location {l} hour {t}: {a} vs {b}"
            );
        }
    }
}

#[test]
fn test_predictions_are_never_negative() {
    let store = MemoryStore::new(readings(60, -3, 12, |s, h| -3. - s as f64 + 0.1 * h));
    let estimator = Estimator::new(hourly_config().apply_corrections(false), store).unwrap();
    let locations = [centroid(), QueryLocation::new(40.70, -111.95)];
    let estimates = estimator
        .compute_estimates(&area(), &hourly_times(10), &locations, &CancellationToken::new())
        .unwrap();
    assert!(estimates.is_complete());
    assert!(estimates.predictions.iter().all(|v| *v >= 0.));
    assert_eq!(estimates.predictions[[0, 5]], 0.);
    assert!(estimates.status_messages()[0].ends_with(", no correction applied"));
}

#[test]
fn test_correction_factors() {
    let store = MemoryStore::new(readings(60, -4, 28, |_, _| 12.));
    let corrected_area = area().corrections(CorrectionTable::new().insert(
        "PMS5003",
        Schedule::new().default_value(LinearCorrection {
            slope: 0.5,
            intercept: 0.,
            note: "half".to_string(),
        }),
    ));
    let times = hourly_times(24);
    let estimator = Estimator::new(hourly_config(), store).unwrap();
    let raw = estimator
        .compute_estimates(&area(), &times, &[centroid()], &CancellationToken::new())
        .unwrap();
    let corrected = estimator
        .compute_estimates(&corrected_area, &times, &[centroid()], &CancellationToken::new())
        .unwrap();
    assert_abs_diff_eq!(
        corrected.predictions[[0, 12]],
        0.5 * raw.predictions[[0, 12]],
        epsilon = 1e-6
    );
    assert_eq!(
        corrected.status_messages()[12],
        "Success, correction factors applied"
    );
}

#[test]
fn test_time_aggregates() {
    // two readings per hour and sensor, 10 then 14
    let store = MemoryStore::new(readings(30, -4, 28, |_, h| if h.fract() < 0.5 { 10. } else { 14. }));
    let estimator = Estimator::new(
        EstimatorConfig::default().aggregation_hours(Some(1.)),
        store,
    )
    .unwrap();
    let estimates = estimator
        .compute_estimates(&area(), &hourly_times(24), &[centroid()], &CancellationToken::new())
        .unwrap();
    assert!(estimates.is_complete(), "{:?}", estimates.status);
    assert_abs_diff_eq!(estimates.predictions[[0, 12]], 12., epsilon = 2.);
    assert!(estimates.variances.iter().all(|v| *v > -1e-6 && *v < 1.));
    assert_eq!(estimates.aggregation_hours, Some(1.));
    assert_eq!(
        estimates.status_messages()[0],
        "Success, aggregation of 1 hours, correction factors applied"
    );
}

#[test]
fn test_full_covariance() {
    let store = MemoryStore::new(readings(60, 0, 24, |_, _| 12.));
    let locations = [centroid(), QueryLocation::new(40.764, -111.885).with_elevation(1300.)];
    let times = hourly_times(24);
    let estimator = Estimator::new(hourly_config().full_covariance(true), store).unwrap();
    let estimates = estimator
        .compute_estimates(&area(), &times, &locations, &CancellationToken::new())
        .unwrap();
    assert!(estimates.is_complete());
    let cov = estimates.covariances.as_ref().expect("covariances");
    assert_eq!(cov.dim(), (24, 2, 2));
    for t in 0..times.len() {
        for l in 0..locations.len() {
            assert_abs_diff_eq!(cov[[t, l, l]], estimates.variances[[l, t]], epsilon = 1e-9);
        }
        assert_abs_diff_eq!(cov[[t, 0, 1]], cov[[t, 1, 0]], epsilon = 1e-9);
    }

    let later: Vec<_> = times.iter().map(|t| *t + Duration::days(30)).collect();
    let estimates = estimator
        .compute_estimates(&area(), &later, &locations, &CancellationToken::new())
        .unwrap();
    let cov = estimates.covariances.as_ref().expect("covariances");
    assert!(cov[[0, 1, 1]].is_infinite());
    assert_eq!(cov[[0, 0, 1]], 0.);
}

struct FailingStore;

impl SensorStore for FailingStore {
    fn fetch(&self, _: &BoundingBox, _: &TimeRange) -> pmkrig::Result<Vec<SensorReading>> {
        Err(EstimateError::Store("connection refused".to_string()))
    }
}

#[test]
fn test_store_failures() {
    let times = hourly_times(6);
    let estimator =
        Estimator::new(EstimatorConfig::default().retry(RetryPolicy::no_retry()), FailingStore)
            .unwrap();
    let estimates = estimator
        .compute_estimates(&area(), &times, &[centroid()], &CancellationToken::new())
        .unwrap();
    assert!(matches!(estimates.status[0], EstimateStatus::StoreFailure(_)));
    assert!(estimates.variances.iter().all(|v| v.is_infinite()));
    assert!(estimates.predictions.iter().all(|v| *v == 0.));

    let policy = RetryPolicy {
        max_retries: 3,
        timeout_ms: 0,
        ..RetryPolicy::default()
    };
    let estimator = Estimator::new(EstimatorConfig::default().retry(policy), FailingStore).unwrap();
    let estimates = estimator
        .compute_estimates(&area(), &times, &[centroid()], &CancellationToken::new())
        .unwrap();
    assert_eq!(estimates.status, vec![EstimateStatus::StoreTimeout; 6]);
}

#[test]
fn test_degraded_requests() {
    let times = hourly_times(30);
    let estimator = Estimator::new(
        EstimatorConfig::default(),
        MemoryStore::new(readings(8, 0, 30, |_, _| 10.)),
    )
    .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let estimates = estimator
        .compute_estimates(&area(), &times, &[centroid()], &cancel)
        .unwrap();
    assert_eq!(estimates.status, vec![EstimateStatus::Cancelled; 30]);

    let expired = CancellationToken::with_timeout(std::time::Duration::ZERO);
    let estimates = estimator
        .compute_estimates(&area(), &times, &[centroid()], &expired)
        .unwrap();
    assert_eq!(estimates.status[29], EstimateStatus::TimedOut);

    let no_scales = AreaConfig::new("empty", "No length scales", chrono_tz::UTC);
    let estimates = estimator
        .compute_estimates(&no_scales, &times, &[centroid()], &CancellationToken::new())
        .unwrap();
    assert_eq!(estimates.status[0], EstimateStatus::LengthScaleMissing);
    assert_eq!(
        estimates.status_messages()[0],
        "Length scale parameter error, correction factors applied"
    );

    let later: Vec<_> = times.iter().map(|t| *t + Duration::days(30)).collect();
    let estimates = estimator
        .compute_estimates(&area(), &later, &[centroid()], &CancellationToken::new())
        .unwrap();
    assert_eq!(estimates.status[0], EstimateStatus::ZeroSensorData);
    assert!(estimates.variances[[0, 0]].is_infinite());
}

#[test]
fn test_partial_data_only_degrades_its_chunk() {
    // readings stop after 15 hours, the second chunk starts at hour 20
    let estimator = Estimator::new(
        EstimatorConfig::default(),
        MemoryStore::new(readings(8, -3, 15, |_, _| 10.)),
    )
    .unwrap();
    let estimates = estimator
        .compute_estimates(&area(), &hourly_times(40), &[centroid()], &CancellationToken::new())
        .unwrap();
    assert!(estimates.status[..20].iter().all(|s| *s == EstimateStatus::Success));
    assert!(estimates.status[20..]
        .iter()
        .all(|s| *s == EstimateStatus::ZeroSensorData));
    assert!(estimates.predictions[[0, 5]] > 5.);
}

#[test]
fn test_malformed_requests() {
    let estimator = Estimator::new(EstimatorConfig::default(), MemoryStore::default()).unwrap();
    let cancel = CancellationToken::new();
    assert!(estimator
        .compute_estimates(&area(), &[], &[centroid()], &cancel)
        .is_err());
    assert!(estimator
        .compute_estimates(&area(), &hourly_times(2), &[], &cancel)
        .is_err());
    let mut unsorted = hourly_times(3);
    unsorted.swap(0, 2);
    assert!(estimator
        .compute_estimates(&area(), &unsorted, &[centroid()], &cancel)
        .is_err());
    assert!(estimator
        .compute_estimates(&area(), &hourly_times(2), &[QueryLocation::new(95., 0.)], &cancel)
        .is_err());

    let estimates = estimator
        .compute_estimates(
            &area(),
            &hourly_times(2),
            &[QueryLocation::new(-85., 0.)],
            &cancel,
        )
        .unwrap();
    assert!(matches!(estimates.status[0], EstimateStatus::InvalidQuery(_)));
}

#[test]
#[serial]
fn test_logger_init_is_idempotent() {
    std::env::set_var("PMKRIG_LOG", "debug");
    let range = TimeRange::new(t0(), t0() + hours(2.));
    assert_eq!(range.sample(1.).unwrap().len(), 3);
    assert!(Estimator::new(EstimatorConfig::default(), MemoryStore::default()).is_ok());
    assert!(Estimator::new(EstimatorConfig::default(), MemoryStore::default()).is_ok());
    std::env::remove_var("PMKRIG_LOG");
}

#[test]
fn test_package_metadata() {
    assert_eq!(env!("CARGO_PKG_NAME"), "pmkrig");
    assert_eq!(env!("CARGO_PKG_AUTHORS"), "");
    assert_eq!(env!("CARGO_PKG_LICENSE"), "Apache-2.0");
}
