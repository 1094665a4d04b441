//! `skewtrace`: bias-coefficient inference for nominally uniform categorical processes.
//!
//! Designed for "is this die fair?" problems at scale: a process should pick one of `N`
//! outcomes uniformly (dice, shuffles, load balancers, sampling frames), but something may
//! be tilting it, possibly in a way that drifts over time. `skewtrace` simulates such
//! processes, estimates the tilt online, and flags windows whose tilt is statistically
//! implausible under fairness.
//!
//! Every category `i` carries a bias coefficient `β_i` with the law
//!
//! ```text
//!   P_i = (1 / N) * (1 + β_i),     β_i ∈ (-1, N - 1]
//! ```
//!
//! so `β = 0` is the fair process. A profile need not sum to zero: when `Σ P_i` drifts away
//! from 1 (or a `β_i` leaves the range) the simulator clips and rescales it, and records the
//! correction.
//!
//! **Stages:**
//! - [`Simulator`] / [`SimulatorSession`]: seeded generation from a [`BiasProfile`]
//!   (static or time-varying β curves) perturbed by a [`NoiseModel`]. Invalid β vectors
//!   are clipped and renormalized; every correction is recorded in a [`RenormAudit`].
//! - [`AdaptiveEstimator`]: online `β̂` with exponential forgetting, Kish effective sample
//!   sizes, Wilson or normal intervals and a drift-triggered partial reset.
//! - [`AnomalyDetector`]: a χ²-style fairness score per evaluation point, thresholded
//!   against an analytic or Monte Carlo null ([`NullCalibration`]) cached per
//!   `(N, window, λ)` in a [`CalibrationCache`].
//! - [`Pipeline`]: chunked orchestration with budgets, cancellation, a data-error policy
//!   and an optional damped feedback loop from score to simulated drift rate.
//!
//! **Supporting modules:**
//! - Probability-law helpers ([`renormalize`], [`probabilities_to_beta`],
//!   [`inverse_mass_probabilities`], [`weight_profile`]).
//! - [`monitor`]: simplex drift metrics, Wilson/normal bounds, grid threshold calibration.
//! - [`special`]: χ² CDF, tail and quantiles (via `statrs`).
//! - [`diagnostics`]: goodness of fit, entropy gaps, rolling diagnostics, one-hot
//!   correlations.
//! - [`charge`]: an electrostatic toy bias source and the matching effect estimator.
//!
//! **Non-goals:**
//! - No persistence, plotting or file output: [`PipelineRun`] flattens to rows and the
//!   caller decides where they go (the `serde` feature derives the traits).
//! - No causal attribution. A flagged window says the process is not fair, not why.
//!
//! # Logging
//!
//! The crate emits [`tracing`](https://docs.rs/tracing) events (`warn` for renormalization
//! clips and skipped chunks, `info` for state transitions, calibrations and drift resets,
//! `debug` per cycle) and never installs a subscriber.
//!
//! # Features
//!
//! - `serde`: `Serialize`/`Deserialize` for configurations, calibrations and export rows.
//! - `parallel`: Monte Carlo null calibration and [`run_batch`] on the rayon pool.
//!
//! # Example
//!
//! ```rust
//! use skewtrace::{
//!     BiasProfile, CalibrationCache, NoiseModel, NullMethod, Pipeline, PipelineConfig,
//!     PipelineState, SimulatorConfig,
//! };
//!
//! let profile = BiasProfile::single(4, 0, 0.6).unwrap();
//! let sim = SimulatorConfig::new(4, 5_000, profile, NoiseModel::None, 7);
//! let mut cfg = PipelineConfig::new(sim);
//! cfg.detector.method = NullMethod::Analytic;
//!
//! let mut pipeline = Pipeline::new(cfg).unwrap();
//! pipeline.calibrate(&mut CalibrationCache::new()).unwrap();
//! let run = pipeline.run();
//!
//! assert_eq!(run.status(), &PipelineState::Completed);
//! assert!(run.first_flag().is_some());
//! ```

#![forbid(unsafe_code)]

mod error;
pub use error::*;

mod stream;
pub use stream::*;

mod law;
pub use law::*;

mod profile;
pub use profile::*;

mod simulate;
pub use simulate::*;

mod estimator;
pub use estimator::*;

mod detector;
pub use detector::*;

mod pipeline;
pub use pipeline::*;

mod utils;
pub use utils::*;

pub mod charge;
pub mod diagnostics;
pub mod monitor;
pub mod special;

pub use charge::{estimate_charge_effect, simulate_charge_profile, ChargeConfig, ChargeProfile};
pub use monitor::{
    calibrate_threshold_from_max_scores, drift_simplex, normal_bounds, wilson_bounds, DriftMetric,
    ThresholdCalibration,
};
