use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use skewtrace::monitor::{drift_simplex, wilson_bounds, DriftMetric};
use skewtrace::{statistic, AdaptiveEstimator, EstimatorConfig, NullCalibration, Observation};
use std::hint::black_box;

fn bench_monitor(c: &mut Criterion) {
    // Frequency vectors drifting slowly away from uniform.
    let k = 6usize;
    let steps = 1024usize;
    let freqs: Vec<Vec<f64>> = (0..steps)
        .map(|t| {
            let tilt = 0.1 * (t as f64) / (steps as f64);
            let mut p = vec![(1.0 - tilt) / k as f64; k];
            p[0] += tilt;
            p
        })
        .collect();

    let mut group = c.benchmark_group("monitor_drift");
    for metric in [
        DriftMetric::MaxAbs,
        DriftMetric::Rao,
        DriftMetric::JensenShannon,
        DriftMetric::Hellinger,
    ] {
        group.bench_with_input(
            BenchmarkId::new("drift_simplex", format!("{metric:?}")),
            &metric,
            |b, &m| {
                b.iter(|| {
                    let mut acc = 0.0f64;
                    for w in freqs.windows(2) {
                        acc += drift_simplex(&w[0], &w[1], m, 1e-9).unwrap_or(0.0);
                    }
                    black_box(acc);
                })
            },
        );
    }
    group.bench_function("wilson_bounds", |b| {
        b.iter(|| {
            let mut acc = 0.0f64;
            for n in 1..=steps as u64 {
                acc += wilson_bounds(n / 3, n, 1.96).1;
            }
            black_box(acc);
        })
    });
    group.finish();

    // Detector scoring against a Monte Carlo null.
    let est_cfg = EstimatorConfig::new(k).with_decay(0.99);
    let null = NullCalibration::monte_carlo(est_cfg, 100, 8, 5_000, 1).unwrap();
    let obs: Vec<Observation> = (0..100u64)
        .map(|t| Observation::new((t as usize * 7) % k, t))
        .collect();
    let mut est = AdaptiveEstimator::new(est_cfg).unwrap();
    let estimates = est.update(&obs).unwrap();

    let mut group = c.benchmark_group("detector");
    group.bench_function("statistic", |b| b.iter(|| black_box(statistic(&estimates))));
    group.bench_function("score", |b| {
        b.iter(|| black_box(skewtrace::score(&estimates, &null, 0.99).unwrap()))
    });
    group.bench_function("monte_carlo_null", |b| {
        b.iter(|| black_box(NullCalibration::monte_carlo(est_cfg, 100, 2, 2_000, 3).unwrap()))
    });
    group.finish();
}

criterion_group!(benches, bench_monitor);
criterion_main!(benches);
