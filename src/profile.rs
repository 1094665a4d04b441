//! Ground-truth bias profiles and noise models consumed by the simulator.
//!
//! A [`BiasProfile`] assigns each category a deterministic curve `β_i(t)`; a [`NoiseModel`]
//! layers seeded per-step jitter on top. The estimator never sees either.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::error::{Error, Result};
use crate::law::probabilities_to_beta;

/// Deterministic β trajectory for one category.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BetaCurve {
    /// `β(t) = value`.
    Constant(f64),
    /// `β(t) = start + rate * t`.
    Linear { start: f64, rate: f64 },
    /// Linear interpolation between `(step, β)` knots; flat before the first and after the
    /// last knot. Steps must be strictly increasing.
    PiecewiseLinear(Vec<(u64, f64)>),
    /// `β(t) = offset + amplitude * sin(2π t / period + phase)`.
    Sinusoid {
        offset: f64,
        amplitude: f64,
        period: f64,
        phase: f64,
    },
    /// Precomputed per-step values; the last value is held after the table ends.
    Tabulated(Vec<f64>),
}

impl BetaCurve {
    /// Evaluate the curve at step `t`.
    pub fn at(&self, t: u64) -> f64 {
        match self {
            BetaCurve::Constant(b) => *b,
            BetaCurve::Linear { start, rate } => start + rate * (t as f64),
            BetaCurve::PiecewiseLinear(knots) => piecewise_at(knots, t),
            BetaCurve::Sinusoid {
                offset,
                amplitude,
                period,
                phase,
            } => offset + amplitude * (std::f64::consts::TAU * (t as f64) / period + phase).sin(),
            BetaCurve::Tabulated(values) => {
                let i = (t as usize).min(values.len().saturating_sub(1));
                values.get(i).copied().unwrap_or(0.0)
            }
        }
    }

    /// Whether the curve is constant in time.
    pub fn is_static(&self) -> bool {
        match self {
            BetaCurve::Constant(_) => true,
            BetaCurve::Linear { rate, .. } => *rate == 0.0,
            BetaCurve::PiecewiseLinear(knots) => knots.windows(2).all(|w| w[0].1 == w[1].1),
            BetaCurve::Sinusoid { amplitude, .. } => *amplitude == 0.0,
            BetaCurve::Tabulated(values) => values.windows(2).all(|w| w[0] == w[1]),
        }
    }

    /// The same curve with every β value multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        match self {
            BetaCurve::Constant(b) => BetaCurve::Constant(b * factor),
            BetaCurve::Linear { start, rate } => BetaCurve::Linear {
                start: start * factor,
                rate: rate * factor,
            },
            BetaCurve::PiecewiseLinear(knots) => {
                BetaCurve::PiecewiseLinear(knots.iter().map(|&(s, b)| (s, b * factor)).collect())
            }
            BetaCurve::Sinusoid {
                offset,
                amplitude,
                period,
                phase,
            } => BetaCurve::Sinusoid {
                offset: offset * factor,
                amplitude: amplitude * factor,
                period: *period,
                phase: *phase,
            },
            BetaCurve::Tabulated(values) => {
                BetaCurve::Tabulated(values.iter().map(|b| b * factor).collect())
            }
        }
    }

    fn validate(&self, category: usize) -> Result<()> {
        let bad = |what: &str| {
            Error::profile(0, format!("curve for category {category}: {what}"))
        };
        match self {
            BetaCurve::Constant(b) if !b.is_finite() => Err(bad("value is not finite")),
            BetaCurve::Linear { start, rate } if !(start.is_finite() && rate.is_finite()) => {
                Err(bad("start/rate must be finite"))
            }
            BetaCurve::PiecewiseLinear(knots) => {
                if knots.is_empty() {
                    return Err(bad("needs at least one knot"));
                }
                if knots.iter().any(|(_, b)| !b.is_finite()) {
                    return Err(bad("knot value is not finite"));
                }
                if knots.windows(2).any(|w| w[0].0 >= w[1].0) {
                    return Err(bad("knot steps must be strictly increasing"));
                }
                Ok(())
            }
            BetaCurve::Sinusoid {
                offset,
                amplitude,
                period,
                phase,
            } => {
                if !(offset.is_finite() && amplitude.is_finite() && phase.is_finite()) {
                    return Err(bad("sinusoid parameters must be finite"));
                }
                if !(period.is_finite() && *period > 0.0) {
                    return Err(bad("sinusoid period must be positive"));
                }
                Ok(())
            }
            BetaCurve::Tabulated(values) => {
                if values.is_empty() {
                    return Err(bad("table is empty"));
                }
                if values.iter().any(|b| !b.is_finite()) {
                    return Err(bad("table value is not finite"));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn piecewise_at(knots: &[(u64, f64)], t: u64) -> f64 {
    let Some(&(s0, b0)) = knots.first() else {
        return 0.0;
    };
    if t <= s0 {
        return b0;
    }
    let idx = knots.partition_point(|&(s, _)| s <= t);
    if idx >= knots.len() {
        return knots[knots.len() - 1].1;
    }
    let (sa, ba) = knots[idx - 1];
    let (sb, bb) = knots[idx];
    let frac = ((t - sa) as f64) / ((sb - sa) as f64);
    ba + (bb - ba) * frac
}

/// Per-category ground-truth β curves.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BiasProfile {
    curves: Vec<BetaCurve>,
}

impl BiasProfile {
    /// Build a profile from one curve per category (`N >= 2`).
    pub fn new(curves: Vec<BetaCurve>) -> Result<Self> {
        if curves.len() <= 1 {
            return Err(Error::config(format!(
                "a bias profile needs at least 2 categories (got {})",
                curves.len()
            )));
        }
        for (i, c) in curves.iter().enumerate() {
            c.validate(i)?;
        }
        Ok(Self { curves })
    }

    /// All-zero profile: the null hypothesis.
    pub fn zero(n: usize) -> Result<Self> {
        Self::new(vec![BetaCurve::Constant(0.0); n])
    }

    /// Static profile with the given β per category.
    pub fn constant(beta: &[f64]) -> Result<Self> {
        Self::new(beta.iter().map(|&b| BetaCurve::Constant(b)).collect())
    }

    /// Static profile with one biased category and every other at zero.
    pub fn single(n: usize, category: usize, beta: f64) -> Result<Self> {
        if category >= n {
            return Err(Error::config(format!(
                "category {category} outside [0, {n})"
            )));
        }
        let mut b = vec![0.0; n];
        b[category] = beta;
        Self::constant(&b)
    }

    /// Static profile reproducing a probability vector.
    pub fn from_probabilities(probs: &[f64]) -> Result<Self> {
        Self::constant(&probabilities_to_beta(probs, 1e-9)?)
    }

    /// Tabulated profile from a `steps × N` series (e.g. from [`random_walk_series`]).
    pub fn from_series(series: &[Vec<f64>]) -> Result<Self> {
        let n = series.first().map_or(0, Vec::len);
        if series.iter().any(|row| row.len() != n) {
            return Err(Error::config("series rows must all have the same length"));
        }
        let curves = (0..n)
            .map(|i| BetaCurve::Tabulated(series.iter().map(|row| row[i]).collect()))
            .collect();
        Self::new(curves)
    }

    /// Number of categories.
    pub fn n(&self) -> usize {
        self.curves.len()
    }

    pub fn curves(&self) -> &[BetaCurve] {
        &self.curves
    }

    /// Whether every curve is constant in time.
    pub fn is_static(&self) -> bool {
        self.curves.iter().all(BetaCurve::is_static)
    }

    /// β vector at step `t`, written into `out` (resized to `N`).
    pub fn beta_into(&self, t: u64, out: &mut Vec<f64>) {
        out.clear();
        out.extend(self.curves.iter().map(|c| c.at(t)));
    }

    /// β vector at step `t`.
    pub fn beta_at(&self, t: u64) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.n());
        self.beta_into(t, &mut out);
        out
    }

    /// The same profile with every β multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            curves: self.curves.iter().map(|c| c.scaled(factor)).collect(),
        }
    }

    /// Replace the curve for one category.
    pub fn with_curve(&self, category: usize, curve: BetaCurve) -> Result<Self> {
        if category >= self.n() {
            return Err(Error::config(format!(
                "category {category} outside [0, {})",
                self.n()
            )));
        }
        let mut curves = self.curves.clone();
        curves[category] = curve;
        Self::new(curves)
    }

    /// Steps whose noiseless β must be checked at setup for a run of `length` draws.
    ///
    /// Clipping makes the renormalized mass non-linear in `t`, so a time-varying profile is
    /// checked at every step; a static one only at step 0.
    pub(crate) fn validation_steps(&self, length: u64) -> std::ops::RangeInclusive<u64> {
        if self.is_static() {
            0..=0
        } else {
            0..=length.saturating_sub(1)
        }
    }
}

/// Seeded per-step perturbation of the profile.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NoiseModel {
    /// No perturbation: the profile is used exactly.
    #[default]
    None,
    /// Bounded random walk: each step adds `N(0, drift_rate)` increments, re-centers them to
    /// zero mean across categories and clips the walk to `±bound`.
    RandomWalk { drift_rate: f64, bound: f64 },
    /// Independent per-step Gaussian jitter `N(0, sigma)` on each β.
    Jitter { sigma: f64 },
}

impl NoiseModel {
    pub fn validate(&self) -> Result<()> {
        match *self {
            NoiseModel::None => Ok(()),
            NoiseModel::RandomWalk { drift_rate, bound } => {
                if !(drift_rate.is_finite() && drift_rate >= 0.0) {
                    return Err(Error::config("drift_rate must be finite and >= 0"));
                }
                if !(bound.is_finite() && bound > 0.0 && bound < 1.0) {
                    return Err(Error::config("random-walk bound must lie in (0, 1)"));
                }
                Ok(())
            }
            NoiseModel::Jitter { sigma } => {
                if !(sigma.is_finite() && sigma >= 0.0) {
                    return Err(Error::config("jitter sigma must be finite and >= 0"));
                }
                Ok(())
            }
        }
    }

    /// Per-step drift scale (`0` for a static model).
    pub fn drift_rate(&self) -> f64 {
        match *self {
            NoiseModel::None => 0.0,
            NoiseModel::RandomWalk { drift_rate, .. } => drift_rate,
            NoiseModel::Jitter { sigma } => sigma,
        }
    }

    /// The same model with its drift scale replaced. `None` is left unchanged.
    pub fn with_drift_rate(&self, rate: f64) -> Self {
        match *self {
            NoiseModel::None => NoiseModel::None,
            NoiseModel::RandomWalk { bound, .. } => NoiseModel::RandomWalk {
                drift_rate: rate,
                bound,
            },
            NoiseModel::Jitter { .. } => NoiseModel::Jitter { sigma: rate },
        }
    }
}

fn check_series_args(n: usize, steps: usize, clip: f64) -> Result<()> {
    if n <= 1 {
        return Err(Error::config("series needs at least 2 categories"));
    }
    if steps == 0 {
        return Err(Error::config("series needs at least 1 step"));
    }
    if !(clip > 0.0 && clip < 1.0) {
        return Err(Error::config("clip must lie in (0, 1)"));
    }
    Ok(())
}

fn center_and_clip(row: &mut [f64], clip: f64) {
    let mean = row.iter().sum::<f64>() / (row.len() as f64);
    for b in row.iter_mut() {
        *b = (*b - mean).clamp(-clip, clip);
    }
}

fn normal(scale: f64) -> Result<Normal<f64>> {
    Normal::new(0.0, scale).map_err(|e| Error::config(format!("invalid normal scale: {e}")))
}

/// Centered, clipped Gaussian random-walk β series (`steps × n`).
pub fn random_walk_series(
    n: usize,
    steps: usize,
    scale: f64,
    clip: f64,
    seed: u64,
) -> Result<Vec<Vec<f64>>> {
    check_series_args(n, steps, clip)?;
    let dist = normal(scale)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut current = vec![0.0; n];
    let mut out = Vec::with_capacity(steps);
    for _ in 0..steps {
        for b in current.iter_mut() {
            *b += dist.sample(&mut rng);
        }
        center_and_clip(&mut current, clip);
        out.push(current.clone());
    }
    Ok(out)
}

/// Per-category sinusoidal β series with random frequency, phase and amplitude, centered
/// per step and clipped.
pub fn sinusoidal_series(
    n: usize,
    steps: usize,
    scale: f64,
    clip: f64,
    seed: u64,
) -> Result<Vec<Vec<f64>>> {
    check_series_args(n, steps, clip)?;
    let amp_dist = Normal::new(scale, scale / 3.0)
        .map_err(|e| Error::config(format!("invalid amplitude scale: {e}")))?;
    let mut rng = StdRng::seed_from_u64(seed);
    let freqs: Vec<f64> = (0..n).map(|_| rng.gen_range(0.5..1.5)).collect();
    let phases: Vec<f64> = (0..n)
        .map(|_| rng.gen_range(0.0..std::f64::consts::TAU))
        .collect();
    let amps: Vec<f64> = (0..n).map(|_| amp_dist.sample(&mut rng)).collect();
    let horizon = steps as f64;
    let mut out = Vec::with_capacity(steps);
    for t in 0..steps {
        let mut row: Vec<f64> = (0..n)
            .map(|i| {
                amps[i] * (std::f64::consts::TAU * freqs[i] * (t as f64) / horizon + phases[i]).sin()
            })
            .collect();
        center_and_clip(&mut row, clip);
        out.push(row);
    }
    Ok(out)
}

/// Configuration for [`cyclic_walk_series`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CyclicDriftConfig {
    pub steps: usize,
    pub n: usize,
    /// Standard deviation of the random-walk increment.
    pub walk_scale: f64,
    /// Amplitude of the sinusoid applied to category 0.
    pub sin_amplitude: f64,
    /// Period of the sinusoid in steps; `0` disables it.
    pub sin_period: usize,
    pub clip: f64,
    pub seed: u64,
}

impl Default for CyclicDriftConfig {
    fn default() -> Self {
        Self {
            steps: 1_000,
            n: 6,
            walk_scale: 0.03,
            sin_amplitude: 0.08,
            sin_period: 120,
            clip: 0.95,
            seed: 7,
        }
    }
}

/// Random walk for every category with an extra cyclical term on category 0, modelling a
/// periodic mechanical bias.
pub fn cyclic_walk_series(cfg: CyclicDriftConfig) -> Result<Vec<Vec<f64>>> {
    check_series_args(cfg.n, cfg.steps, cfg.clip)?;
    let dist = normal(cfg.walk_scale)?;
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let phase = rng.gen_range(0.0..std::f64::consts::TAU);
    let mut current = vec![0.0; cfg.n];
    let mut out = Vec::with_capacity(cfg.steps);
    for t in 0..cfg.steps {
        for b in current.iter_mut() {
            *b += dist.sample(&mut rng);
        }
        let mean = current.iter().sum::<f64>() / (cfg.n as f64);
        for b in current.iter_mut() {
            *b -= mean;
        }
        if cfg.sin_period > 0 && cfg.sin_amplitude != 0.0 {
            current[0] += cfg.sin_amplitude
                * (std::f64::consts::TAU * (t as f64) / (cfg.sin_period as f64) + phase).sin();
        }
        for b in current.iter_mut() {
            *b = b.clamp(-cfg.clip, cfg.clip);
        }
        out.push(current.clone());
    }
    Ok(out)
}
