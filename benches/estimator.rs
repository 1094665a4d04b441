use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use skewtrace::{
    AdaptiveEstimator, BiasProfile, DriftResetConfig, EstimatorConfig, NoiseModel, Observation,
    Simulator, SimulatorConfig,
};
use std::hint::black_box;

fn bench_estimator(c: &mut Criterion) {
    let n = 6usize;
    let profile = BiasProfile::single(n, 0, 0.5).unwrap();
    let sim = SimulatorConfig::new(n, 20_000, profile, NoiseModel::None, 42);
    let obs: Vec<Observation> = Simulator::run(&sim).unwrap().stream.iter().cloned().collect();

    let mut group = c.benchmark_group("estimator_update");
    for chunk in [10usize, 100, 1_000] {
        group.bench_with_input(BenchmarkId::new("cumulative", chunk), &chunk, |b, &len| {
            b.iter(|| {
                let mut est = AdaptiveEstimator::new(EstimatorConfig::new(n)).unwrap();
                for ch in obs.chunks(len) {
                    black_box(est.update(ch).unwrap());
                }
            })
        });
    }
    group.bench_function("decay+drift/100", |b| {
        let cfg = EstimatorConfig::new(n)
            .with_decay(0.995)
            .with_drift(DriftResetConfig::default());
        b.iter(|| {
            let mut est = AdaptiveEstimator::new(cfg).unwrap();
            for ch in obs.chunks(100) {
                black_box(est.update(ch).unwrap());
            }
        })
    });
    group.finish();

    let mut group = c.benchmark_group("simulator");
    group.bench_function("static/20k", |b| b.iter(|| black_box(Simulator::run(&sim).unwrap())));
    let walk = SimulatorConfig {
        noise: NoiseModel::RandomWalk {
            drift_rate: 0.01,
            bound: 0.3,
        },
        ..sim.clone()
    };
    group.bench_function("random_walk/20k", |b| {
        b.iter(|| black_box(Simulator::run(&walk).unwrap()))
    });
    group.finish();
}

criterion_group!(benches, bench_estimator);
criterion_main!(benches);
