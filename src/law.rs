//! The bias law `P_i = (1/N)(1 + β_i)` and its auditable renormalization.

use crate::error::{Error, Result};

/// β of a category whose frequency is `f` among `n` categories.
#[inline]
pub fn beta_from_frequency(n: usize, f: f64) -> f64 {
    (n as f64) * f - 1.0
}

/// Frequency implied by `beta` among `n` categories (inverse of [`beta_from_frequency`]).
#[inline]
pub fn frequency_from_beta(n: usize, beta: f64) -> f64 {
    (1.0 + beta) / (n as f64)
}

/// Strict form of the law: map β to probabilities, rejecting negative or collapsed mass.
///
/// The result is normalized to sum to 1. Use [`renormalize`] when clipping is acceptable.
pub fn uniform_law_probabilities(n: usize, beta: &[f64]) -> Result<Vec<f64>> {
    if beta.len() != n {
        return Err(Error::config(format!(
            "beta has {} entries but the process has {n} categories",
            beta.len()
        )));
    }
    let adjusted: Vec<f64> = beta.iter().map(|&b| frequency_from_beta(n, b)).collect();
    if adjusted.iter().any(|p| !p.is_finite() || *p < 0.0) {
        return Err(Error::profile(0, "bias coefficients yield negative probabilities"));
    }
    let total: f64 = adjusted.iter().sum();
    if total <= 0.0 {
        return Err(Error::profile(0, "bias coefficients collapse the probability mass"));
    }
    Ok(adjusted.into_iter().map(|p| p / total).collect())
}

/// Map a probability vector back to β coefficients.
pub fn probabilities_to_beta(probs: &[f64], tol: f64) -> Result<Vec<f64>> {
    if probs.is_empty() {
        return Err(Error::config("probabilities cannot be empty"));
    }
    if probs.iter().any(|p| !p.is_finite() || *p < 0.0) {
        return Err(Error::config("probabilities must be finite and non-negative"));
    }
    let total: f64 = probs.iter().sum();
    if (total - 1.0).abs() > tol {
        return Err(Error::config(format!(
            "probabilities must sum to 1 (got {total})"
        )));
    }
    let n = probs.len();
    Ok(probs.iter().map(|&p| beta_from_frequency(n, p)).collect())
}

/// Tolerances for [`renormalize`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RenormConfig {
    /// Total mass within `1 ± tol` is accepted without rescaling.
    pub tol: f64,
    /// Largest `|mass - 1|` (after clipping) that may still be rescaled. Beyond this the
    /// profile is rejected with [`Error::InvalidProfile`].
    pub max_mass_deviation: f64,
}

impl Default for RenormConfig {
    fn default() -> Self {
        Self {
            tol: 1e-9,
            max_mass_deviation: 0.5,
        }
    }
}

impl RenormConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.tol.is_finite() && self.tol >= 0.0) {
            return Err(Error::config("renormalization tol must be finite and >= 0"));
        }
        if !(self.max_mass_deviation.is_finite() && self.max_mass_deviation > self.tol) {
            return Err(Error::config(
                "max_mass_deviation must be finite and larger than tol",
            ));
        }
        Ok(())
    }
}

/// Output of [`renormalize`]: the probabilities actually used plus an audit of what changed.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Renormalized {
    /// Probabilities (non-negative, summing to 1 within `tol`).
    pub probs: Vec<f64>,
    /// `Σ (1 + β_i) / N` before any clipping.
    pub raw_mass: f64,
    /// Mass after clipping, before rescaling.
    pub clipped_mass: f64,
    /// Categories whose β fell outside `(-1, N-1]` and were clipped.
    pub clipped: Vec<usize>,
    /// Whether the vector was rescaled to unit mass.
    pub rescaled: bool,
}

impl Renormalized {
    /// Whether the requested profile was altered in any way.
    pub fn is_adjusted(&self) -> bool {
        self.rescaled || !self.clipped.is_empty()
    }

    /// β implied by the probabilities actually used (the realized ground truth).
    pub fn realized_beta(&self) -> Vec<f64> {
        let n = self.probs.len();
        self.probs.iter().map(|&p| beta_from_frequency(n, p)).collect()
    }
}

/// Turn a β vector into a valid probability vector, clipping and rescaling as needed.
///
/// - β below `-1` is clipped to `-1` (probability 0); β above `N-1` is clipped to `N-1`.
/// - If the clipped mass is within `tol` of 1 it is used as is; otherwise it is rescaled,
///   provided it lies within `max_mass_deviation` of 1.
///
/// Fails with [`Error::InvalidProfile`] on non-finite β, a length mismatch, collapsed mass,
/// or a mass too far from 1 to renormalize.
pub fn renormalize(n: usize, beta: &[f64], step: u64, cfg: RenormConfig) -> Result<Renormalized> {
    if beta.len() != n {
        return Err(Error::profile(
            step,
            format!("profile has {} categories, expected {n}", beta.len()),
        ));
    }
    if let Some(i) = beta.iter().position(|b| !b.is_finite()) {
        return Err(Error::profile(step, format!("beta[{i}] is not finite")));
    }
    let nf = n as f64;
    let upper = nf - 1.0;

    let mut raw_mass = 0.0;
    let mut clipped = Vec::new();
    let mut probs = Vec::with_capacity(n);
    for (i, &b) in beta.iter().enumerate() {
        raw_mass += (1.0 + b) / nf;
        let bc = if b < -1.0 {
            clipped.push(i);
            -1.0
        } else if b > upper {
            clipped.push(i);
            upper
        } else {
            b
        };
        probs.push((1.0 + bc) / nf);
    }

    let clipped_mass: f64 = probs.iter().sum();
    if clipped_mass <= 0.0 {
        return Err(Error::profile(step, "probability mass collapsed to zero"));
    }
    let deviation = (clipped_mass - 1.0).abs();
    if deviation > cfg.max_mass_deviation {
        return Err(Error::profile(
            step,
            format!(
                "mass {clipped_mass:.6} deviates from 1 by more than {}",
                cfg.max_mass_deviation
            ),
        ));
    }
    let rescaled = deviation > cfg.tol;
    if rescaled {
        for p in probs.iter_mut() {
            *p /= clipped_mass;
        }
    }
    Ok(Renormalized {
        probs,
        raw_mass,
        clipped_mass,
        clipped,
        rescaled,
    })
}

/// Convert outcome weights into probabilities: heavier outcomes are drawn less often.
///
/// `p_i ∝ w_i^{-softness}`.
pub fn inverse_mass_probabilities(weights: &[f64], softness: f64) -> Result<Vec<f64>> {
    if weights.is_empty() {
        return Err(Error::config("weights cannot be empty"));
    }
    if weights.iter().any(|w| !(w.is_finite() && *w > 0.0)) {
        return Err(Error::config("weights must be finite and strictly positive"));
    }
    if !(softness.is_finite() && softness > 0.0) {
        return Err(Error::config("softness must be positive"));
    }
    let inv: Vec<f64> = weights.iter().map(|w| w.powf(-softness)).collect();
    let total: f64 = inv.iter().sum();
    Ok(inv.into_iter().map(|x| x / total).collect())
}

/// Linearly spaced weights from `1.0` to `heaviness` (inclusive) for `n` outcomes.
pub fn weight_profile(n: usize, heaviness: f64) -> Result<Vec<f64>> {
    if n <= 1 {
        return Err(Error::config("weight profile needs at least 2 outcomes"));
    }
    if !(heaviness.is_finite() && heaviness > 0.0) {
        return Err(Error::config("heaviness must be positive"));
    }
    let step = (heaviness - 1.0) / ((n - 1) as f64);
    Ok((0..n).map(|i| 1.0 + step * (i as f64)).collect())
}
