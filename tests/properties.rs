use proptest::prelude::*;
use skewtrace::{
    renormalize, statistic, AdaptiveEstimator, BetaEstimate, BiasProfile, CalibrationCache,
    EstimateFlags, EstimatorConfig, IntervalMethod, NoiseModel, NullMethod, Observation,
    PipelineConfig, RenormConfig, SimulatorConfig, run_once,
};

fn estimate(i: usize, beta: f64, n_var: f64) -> BetaEstimate {
    BetaEstimate {
        category_index: i,
        point_estimate: beta,
        variance: 0.0,
        confidence_width: 0.0,
        window_start: 0,
        window_end: 0,
        sample_count: n_var as u64,
        effective_samples: n_var,
        variance_samples: n_var,
        frequency: 0.0,
        flags: EstimateFlags::default(),
    }
}

fn pipeline_config(n: usize, length: u64, seed: u64, noise: NoiseModel) -> PipelineConfig {
    let mut beta = vec![-0.3 / (n - 1) as f64; n];
    beta[0] = 0.3;
    let profile = BiasProfile::constant(&beta).unwrap();
    let mut cfg = PipelineConfig::new(SimulatorConfig::new(n, length, profile, noise, seed));
    cfg.chunk_size = 64;
    cfg.detector.method = NullMethod::Analytic;
    cfg
}

proptest! {
    #[test]
    fn renormalized_probabilities_lie_on_the_simplex(
        beta in prop::collection::vec(-1.5f64..3.0, 2..=8),
    ) {
        let n = beta.len();
        match renormalize(n, &beta, 0, RenormConfig::default()) {
            Ok(r) => {
                prop_assert_eq!(r.probs.len(), n);
                prop_assert!(r.probs.iter().all(|&p| p >= 0.0));
                let s: f64 = r.probs.iter().sum();
                prop_assert!((s - 1.0).abs() < 1e-9, "sum {}", s);
            }
            Err(e) => {
                let is_invalid_profile = matches!(e, skewtrace::Error::InvalidProfile { .. });
                prop_assert!(is_invalid_profile);
            }
        }
    }

    #[test]
    fn centered_profiles_need_no_renormalization(
        raw in prop::collection::vec(-0.5f64..0.5, 2..=8),
    ) {
        let mean = raw.iter().sum::<f64>() / raw.len() as f64;
        let beta: Vec<f64> = raw.iter().map(|b| b - mean).collect();
        let r = renormalize(beta.len(), &beta, 0, RenormConfig::default()).unwrap();
        prop_assert!(!r.rescaled);
        prop_assert!(r.clipped.is_empty());
    }

    #[test]
    fn score_never_decreases_when_a_bias_grows(
        beta in prop::collection::vec(-1.0f64..2.0, 2..=8),
        which in 0usize..8,
        grow in 0.0f64..1.0,
        n_var in 1.0f64..10_000.0,
    ) {
        let i = which % beta.len();
        let base: Vec<BetaEstimate> =
            beta.iter().enumerate().map(|(k, &b)| estimate(k, b, n_var)).collect();
        let mut bigger = base.clone();
        let b = bigger[i].point_estimate;
        bigger[i].point_estimate = b + grow * b.signum();
        prop_assert!(statistic(&bigger).0 >= statistic(&base).0);
    }

    #[test]
    fn interval_contains_point_estimate(
        cats in prop::collection::vec(0usize..4, 1..300),
        interval in prop_oneof![
            Just(IntervalMethod::Wald),
            Just(IntervalMethod::Wilson),
            Just(IntervalMethod::Conservative),
        ],
        decay in 0.9f64..=1.0,
    ) {
        let cfg = EstimatorConfig::new(4).with_decay(decay).with_interval(interval, 1.96);
        let mut est = AdaptiveEstimator::new(cfg).unwrap();
        let obs: Vec<Observation> =
            cats.iter().enumerate().map(|(t, &c)| Observation::new(c, t as u64)).collect();
        for e in est.update(&obs).unwrap() {
            prop_assert!(e.confidence_width >= 0.0);
            prop_assert!(e.lower() <= e.point_estimate && e.point_estimate <= e.upper());
            prop_assert!((-1.0..=3.0).contains(&e.point_estimate));
        }
    }

    #[test]
    fn identical_seeds_give_identical_runs(seed in any::<u64>()) {
        let noise = NoiseModel::RandomWalk { drift_rate: 0.01, bound: 0.3 };
        let mut cache = CalibrationCache::new();
        let a = run_once(pipeline_config(4, 640, seed, noise), &mut cache).unwrap();
        let b = run_once(pipeline_config(4, 640, seed, noise), &mut cache).unwrap();
        prop_assert_eq!(a.stream().categories(), b.stream().categories());
        prop_assert_eq!(a.estimates(), b.estimates());
        prop_assert_eq!(a.scores(), b.scores());
        prop_assert_eq!(a.renorm_audit(), b.renorm_audit());
    }
}

#[test]
fn conservative_width_shrinks_and_estimates_converge() {
    let beta = [0.6, -0.2, -0.2, -0.2];
    let profile = BiasProfile::constant(&beta).unwrap();
    let sim = SimulatorConfig::new(4, 50_000, profile, NoiseModel::None, 9);
    let stream = skewtrace::Simulator::run(&sim).unwrap().stream;
    let obs: Vec<Observation> = stream.iter().cloned().collect();

    let cfg = EstimatorConfig::new(4).with_interval(IntervalMethod::Conservative, 4.0);
    let mut est = AdaptiveEstimator::new(cfg).unwrap();
    let mut prev_width = f64::INFINITY;
    for (k, chunk) in obs.chunks(5_000).enumerate() {
        let e = est.update(chunk).unwrap();
        assert!(e[0].confidence_width <= prev_width);
        prev_width = e[0].confidence_width;
        let err = e
            .iter()
            .zip(&beta)
            .map(|(e, b)| (e.point_estimate - b).abs())
            .fold(0.0, f64::max);
        assert!(err <= e[0].confidence_width, "chunk {k}: error {err} beyond width");
    }
    assert!(prev_width < 0.06);
}
