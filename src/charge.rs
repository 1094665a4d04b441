//! Electrostatic toy bias: per-category charges mapped to β through a Coulomb-like force.
//!
//! Charges are sampled from `N(0, q_scale)` and damped by relative humidity. The net force
//! on category `i` is approximated as `k·q_i·(Σq − q_i)/d²`, scaled to a dimensionless β,
//! clipped, and combined with a small mechanical perturbation.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::error::{Error, Result};
use crate::law::uniform_law_probabilities;
use crate::profile::BiasProfile;
use crate::simulate::draw_category;

/// Coulomb constant (N·m²·C⁻²).
pub const K_COULOMB: f64 = 8.987_551_792_3e9;
/// Average separation between draw balls (m).
pub const PAIRWISE_DISTANCE_M: f64 = 0.05;
/// Newtons to dimensionless β.
pub const BETA_SCALE: f64 = 1e-6;
/// Standard deviation of residual mechanical β.
pub const MECHANICAL_BETA_SCALE: f64 = 0.01;
/// Symmetric clip applied to electrostatic and combined β.
pub const BETA_CLIP: f64 = 0.95;

/// Charge damping multiplier for relative humidity `h` (percent): `clip(1 − h/100, 0.1, 1)`.
pub fn humidity_scale(humidity: f64) -> f64 {
    (1.0 - humidity / 100.0).clamp(0.1, 1.0)
}

/// Parameters of [`simulate_charge_profile`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChargeConfig {
    pub n: usize,
    /// Standard deviation of the charge prior before humidity damping (C).
    pub q_scale: f64,
    /// Relative humidity (percent).
    pub humidity: f64,
    /// Draws used to produce the synthetic counts.
    pub trials: u64,
    pub seed: u64,
}

impl Default for ChargeConfig {
    fn default() -> Self {
        Self {
            n: 6,
            q_scale: 1e-9,
            humidity: 40.0,
            trials: 200,
            seed: 0,
        }
    }
}

impl ChargeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n < 2 {
            return Err(Error::config("charge profile needs at least 2 categories"));
        }
        if self.trials == 0 {
            return Err(Error::config("trials must be positive"));
        }
        if !(self.q_scale.is_finite() && self.q_scale >= 0.0) {
            return Err(Error::config("q_scale must be finite and >= 0"));
        }
        if !self.humidity.is_finite() {
            return Err(Error::config("humidity must be finite"));
        }
        Ok(())
    }
}

/// Sampled charges, the β they induce, and one synthetic batch of counts.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChargeProfile {
    /// Per-category charge (C), after humidity damping.
    pub charges: Vec<f64>,
    pub beta: Vec<f64>,
    pub probs: Vec<f64>,
    pub counts: Vec<u64>,
}

impl ChargeProfile {
    /// The induced β as a static profile for the simulator.
    pub fn to_profile(&self) -> Result<BiasProfile> {
        BiasProfile::constant(&self.beta)
    }

    /// Total synthetic draws.
    pub fn trials(&self) -> u64 {
        self.counts.iter().sum()
    }
}

/// Sample charges, map them to β and draw `trials` outcomes.
pub fn simulate_charge_profile(cfg: ChargeConfig) -> Result<ChargeProfile> {
    cfg.validate()?;
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let damping = humidity_scale(cfg.humidity);

    let q_dist = Normal::new(0.0, cfg.q_scale)
        .map_err(|e| Error::config(format!("invalid q_scale: {e}")))?;
    let charges: Vec<f64> = (0..cfg.n)
        .map(|_| q_dist.sample(&mut rng) * damping)
        .collect();
    let net: f64 = charges.iter().sum();

    let mech = Normal::new(0.0, MECHANICAL_BETA_SCALE)
        .map_err(|e| Error::config(format!("invalid mechanical scale: {e}")))?;
    let beta: Vec<f64> = charges
        .iter()
        .map(|&q| {
            let force = K_COULOMB * q * (net - q) / (PAIRWISE_DISTANCE_M * PAIRWISE_DISTANCE_M);
            let elec = (force * BETA_SCALE).clamp(-BETA_CLIP, BETA_CLIP);
            (elec + mech.sample(&mut rng)).clamp(-BETA_CLIP, BETA_CLIP)
        })
        .collect();

    let probs = uniform_law_probabilities(cfg.n, &beta)?;
    let mut counts = vec![0u64; cfg.n];
    for _ in 0..cfg.trials {
        counts[draw_category(&probs, rng.gen::<f64>())] += 1;
    }
    Ok(ChargeProfile {
        charges,
        beta,
        probs,
        counts,
    })
}

/// Slope of logit deviation on centered charge.
///
/// With `p_i = counts_i / trials` (clipped to `[1e-9, 1 − 1e-9]`) and
/// `y_i = logit(p_i) − logit(1/n)`, returns `Σ(q_i − q̄)·y_i / (Σ(q_i − q̄)² + 1e-24)`.
/// A positive slope means positively charged categories are drawn more often.
pub fn estimate_charge_effect(charges: &[f64], counts: &[u64], trials: u64) -> Result<f64> {
    if charges.len() != counts.len() {
        return Err(Error::config("charges and counts must have the same length"));
    }
    if charges.is_empty() {
        return Err(Error::InsufficientData("no categories".to_string()));
    }
    if trials == 0 {
        return Err(Error::InsufficientData("trials must be positive".to_string()));
    }
    let n = charges.len() as f64;
    let logit = |p: f64| (p / (1.0 - p)).ln();
    let baseline = logit(1.0 / n);
    let q_mean = charges.iter().sum::<f64>() / n;

    let mut num = 0.0;
    let mut den = 1e-24;
    for (&q, &c) in charges.iter().zip(counts) {
        let p = (c as f64 / trials as f64).clamp(1e-9, 1.0 - 1e-9);
        let dq = q - q_mean;
        num += dq * (logit(p) - baseline);
        den += dq * dq;
    }
    Ok(num / den)
}
