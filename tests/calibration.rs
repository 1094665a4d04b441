//! Integration tests for null calibration.
//!
//! These use small `streams` / `length` to keep CI fast.  For production calibration use
//! at least a few hundred thousand null observations per key.

use skewtrace::monitor::{calibrate_threshold_from_max_scores, ThresholdCalibration};
use skewtrace::special::chi_square_quantile;
use skewtrace::{
    CalibrationCache, CalibrationKey, EstimatorConfig, NullCalibration, NullMethod,
    CALIBRATION_FORMAT_VERSION,
};

// ---------------------------------------------------------------------------
// Monte Carlo null
// ---------------------------------------------------------------------------

#[test]
fn monte_carlo_null_is_deterministic() {
    let est = EstimatorConfig::new(4);
    let a = NullCalibration::monte_carlo(est, 50, 5, 500, 99).unwrap();
    let b = NullCalibration::monte_carlo(est, 50, 5, 500, 99).unwrap();
    assert_eq!(a, b, "same seed must give same null");
    assert_eq!(a.samples(), 5 * 10);
    assert_eq!(a.version, CALIBRATION_FORMAT_VERSION);
}

#[test]
fn monte_carlo_null_scores_are_sorted_and_non_negative() {
    let est = EstimatorConfig::new(3).with_decay(0.98);
    let cal = NullCalibration::monte_carlo(est, 25, 4, 1_000, 7).unwrap();
    let s = cal.null_scores();
    assert!(s.windows(2).all(|w| w[0] <= w[1]));
    for &x in s {
        assert!(x.is_finite() && x >= 0.0, "score {x} is invalid");
    }
}

#[test]
fn monte_carlo_matches_chi_square_for_cumulative_estimator() {
    // λ = 1: n·Σβ̂²/N is Pearson's statistic, asymptotically χ²(N − 1).
    let est = EstimatorConfig::new(4);
    let cal = NullCalibration::monte_carlo(est, 100, 100, 2_000, 42).unwrap();
    let mc = cal.threshold(0.95).unwrap();
    let analytic = chi_square_quantile(0.95, 3.0).unwrap();
    assert!(
        (mc - analytic).abs() < 1.5,
        "Monte Carlo 0.95 threshold {mc:.3} far from χ² {analytic:.3}"
    );
}

#[test]
fn higher_quantile_gives_higher_threshold() {
    let est = EstimatorConfig::new(5);
    let cal = NullCalibration::monte_carlo(est, 50, 10, 1_000, 3).unwrap();
    let loose = cal.threshold(0.90).unwrap();
    let strict = cal.threshold(0.99).unwrap();
    assert!(strict >= loose, "strict {strict:.3} should be ≥ loose {loose:.3}");

    let analytic = NullCalibration::analytic(CalibrationKey::new(5, 50, 1.0)).unwrap();
    assert!(analytic.threshold(0.99).unwrap() > analytic.threshold(0.90).unwrap());
}

// ---------------------------------------------------------------------------
// CalibrationCache
// ---------------------------------------------------------------------------

#[test]
fn cache_reuses_calibration_per_key() {
    let mut cache = CalibrationCache::new();
    let est = EstimatorConfig::new(3);
    let method = NullMethod::MonteCarlo {
        streams: 3,
        length: 300,
        seed: 1,
    };
    let a = cache.get_or_calibrate(est, 30, method).unwrap();
    assert_eq!(cache.len(), 1);
    let b = cache.get_or_calibrate(est, 30, method).unwrap();
    assert_eq!(a, b);
    assert_eq!(cache.len(), 1);

    // Another cadence or decay is another key.
    cache.get_or_calibrate(est, 60, method).unwrap();
    cache
        .get_or_calibrate(est.with_decay(0.99), 30, method)
        .unwrap();
    assert_eq!(cache.len(), 3);
}

#[test]
fn cache_recalibrates_when_method_changes() {
    let mut cache = CalibrationCache::new();
    let est = EstimatorConfig::new(3);
    let mc = cache
        .get_or_calibrate(
            est,
            30,
            NullMethod::MonteCarlo {
                streams: 2,
                length: 300,
                seed: 1,
            },
        )
        .unwrap();
    let an = cache.get_or_calibrate(est, 30, NullMethod::Analytic).unwrap();
    assert_ne!(mc.method, an.method);
    assert_eq!(an.method, NullMethod::Analytic);
    let key = CalibrationKey::new(3, 30, 1.0);
    assert_eq!(cache.get(&key).map(|c| c.method), Some(NullMethod::Analytic));
}

#[test]
fn cache_drops_stale_versions() {
    let mut cache = CalibrationCache::new();
    let mut old = NullCalibration::analytic(CalibrationKey::new(4, 10, 1.0)).unwrap();
    old.version = CALIBRATION_FORMAT_VERSION + 1;
    cache.insert(old);
    cache.insert(NullCalibration::analytic(CalibrationKey::new(5, 10, 1.0)).unwrap());
    assert_eq!(cache.len(), 2);
    cache.retain_current();
    assert_eq!(cache.len(), 1);
    assert!(cache.get(&CalibrationKey::new(5, 10, 1.0)).is_some());
}

// ---------------------------------------------------------------------------
// grid calibration (deterministic)
// ---------------------------------------------------------------------------

#[test]
fn calibrate_from_scores_finds_correct_threshold() {
    // Known scores: 1.0, 2.0, 3.0, 4.0, 5.0.  alpha=0.2 → top 20% = 1 of 5 → threshold=4.5.
    let mut scores = vec![1.0, 2.0, 3.0, 4.0, 5.0];
    let grid = vec![0.5, 1.5, 2.5, 3.5, 4.5, 5.5];
    let cal = calibrate_threshold_from_max_scores(&mut scores, &grid, 0.2, 1.96, false);
    // fa at 4.5: only score 5.0 > 4.5 → fa=1/5=0.2.
    assert!(cal.grid_satisfied);
    assert!((cal.fa_hat - 0.2).abs() < 1e-9, "fa_hat={}", cal.fa_hat);
    assert_eq!(cal.threshold, 4.5);
}

#[test]
fn calibrate_from_scores_empty_grid_returns_unsatisfied() {
    let mut scores = vec![1.0, 2.0];
    let cal: ThresholdCalibration =
        calibrate_threshold_from_max_scores(&mut scores, &[], 0.1, 1.96, false);
    assert!(!cal.grid_satisfied);
    assert_eq!(cal.threshold, 0.0);
}

#[test]
fn calibrate_from_scores_impossible_constraint_not_satisfied() {
    // All scores > every grid point → fa_hat always high → alpha=0.001 won't be satisfied.
    let mut scores: Vec<f64> = (0..100).map(|i| i as f64 * 0.1).collect();
    let grid = vec![0.1, 0.2, 0.3];
    let cal = calibrate_threshold_from_max_scores(&mut scores, &grid, 0.001, 1.96, false);
    assert!(!cal.grid_satisfied);
}

#[test]
fn grid_threshold_needs_empirical_null() {
    let analytic = NullCalibration::analytic(CalibrationKey::new(3, 10, 1.0)).unwrap();
    assert!(analytic.grid_threshold(&[1.0, 2.0], 0.1, 1.96, false).is_err());

    let cal = NullCalibration::from_scores(
        CalibrationKey::new(3, 10, 1.0),
        NullMethod::MonteCarlo {
            streams: 1,
            length: 50,
            seed: 0,
        },
        vec![1.0, 2.0, 3.0, 4.0, 5.0],
    )
    .unwrap();
    let t = cal
        .grid_threshold(&[0.5, 1.5, 2.5, 3.5, 4.5, 5.5], 0.2, 1.96, false)
        .unwrap();
    assert_eq!(t.threshold, 4.5);
}
