//! Count-based diagnostics: goodness of fit, entropy and co-occurrence structure.

use crate::error::{Error, Result};
use crate::special::chi_square_sf;

/// Simplex tolerance for probability vectors passed to this module.
const TOL: f64 = 1e-8;

/// Pearson goodness-of-fit result.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChiSquareTest {
    pub statistic: f64,
    pub dof: usize,
    pub p_value: f64,
}

/// `Σ (o − e)² / e` with `len − 1` degrees of freedom.
pub fn chi_square_test(observed: &[f64], expected: &[f64]) -> Result<ChiSquareTest> {
    if observed.len() != expected.len() {
        return Err(Error::config("observed and expected must have the same length"));
    }
    if observed.len() < 2 {
        return Err(Error::config("goodness of fit needs at least 2 categories"));
    }
    if expected.iter().any(|&e| !(e.is_finite() && e > 0.0)) {
        return Err(Error::config("expected counts must be positive"));
    }
    let statistic: f64 = observed
        .iter()
        .zip(expected)
        .map(|(&o, &e)| (o - e) * (o - e) / e)
        .sum();
    let dof = observed.len() - 1;
    Ok(ChiSquareTest {
        statistic,
        dof,
        p_value: chi_square_sf(statistic, dof as f64)?.clamp(0.0, 1.0),
    })
}

/// Shannon entropy in bits.
///
/// Computed as `H(p) = ln N − KL(p ‖ uniform)`, with the divergence (and the simplex check)
/// from `logp`.
pub fn shannon_entropy(probs: &[f64]) -> Result<f64> {
    logp::validate_simplex(probs, TOL)?;
    if probs.is_empty() {
        return Err(logp::Error::Empty.into());
    }
    let n = probs.len() as f64;
    let uniform = vec![1.0 / n; probs.len()];
    let kl = logp::kl_divergence(probs, &uniform, TOL)?;
    Ok(((n.ln() - kl) / std::f64::consts::LN_2).max(0.0))
}

/// `H(empirical) − H(baseline)`; negative when the empirical law is more concentrated.
pub fn entropy_gap(empirical: &[f64], baseline: &[f64]) -> Result<f64> {
    if empirical.len() != baseline.len() {
        return Err(Error::config("probability vectors must have the same length"));
    }
    Ok(shannon_entropy(empirical)? - shannon_entropy(baseline)?)
}

/// One row of [`rolling_diagnostics`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RollingDiagnostic {
    /// Index of the last draw in the window.
    pub step: usize,
    pub chi2_stat: f64,
    pub chi2_p_value: f64,
    pub entropy_gap: f64,
}

/// Chi-square and entropy gap over every full sliding window of `window_size` draws.
pub fn rolling_diagnostics(
    draws: &[usize],
    baseline: &[f64],
    window_size: usize,
) -> Result<Vec<RollingDiagnostic>> {
    logp::validate_simplex(baseline, TOL)?;
    if window_size <= 1 {
        return Err(Error::config("window size must be greater than 1"));
    }
    if draws.len() < window_size {
        return Err(Error::InsufficientData(format!(
            "{} draws cannot fill a window of {window_size}",
            draws.len()
        )));
    }
    let n = baseline.len();
    if let Some(&bad) = draws.iter().find(|&&d| d >= n) {
        return Err(Error::config(format!("draw {bad} outside [0, {n})")));
    }
    let w = window_size as f64;
    let expected: Vec<f64> = baseline.iter().map(|p| p * w).collect();
    let baseline_entropy = shannon_entropy(baseline)?;

    let mut counts = vec![0u64; n];
    for &d in &draws[..window_size] {
        counts[d] += 1;
    }
    let mut out = Vec::with_capacity(draws.len() - window_size + 1);
    let mut observed = vec![0.0; n];
    let mut empirical = vec![0.0; n];
    for end in window_size..=draws.len() {
        if end > window_size {
            counts[draws[end - window_size - 1]] -= 1;
            counts[draws[end - 1]] += 1;
        }
        for i in 0..n {
            observed[i] = counts[i] as f64;
            empirical[i] = observed[i] / w;
        }
        let chi = chi_square_test(&observed, &expected)?;
        out.push(RollingDiagnostic {
            step: end - 1,
            chi2_stat: chi.statistic,
            chi2_p_value: chi.p_value,
            entropy_gap: shannon_entropy(&empirical)? - baseline_entropy,
        });
    }
    Ok(out)
}

/// Pearson correlation matrix of one-hot encoded draws (`n × n`, row-major).
///
/// Entries involving a category with zero variance (never or always drawn) are 0.
pub fn outcome_correlation_matrix(draws: &[usize], n: usize) -> Result<Vec<Vec<f64>>> {
    if n <= 1 {
        return Err(Error::config("correlation needs at least 2 categories"));
    }
    if draws.is_empty() {
        return Err(Error::InsufficientData("no draws".to_string()));
    }
    if let Some(&bad) = draws.iter().find(|&&d| d >= n) {
        return Err(Error::config(format!("draw {bad} outside [0, {n})")));
    }
    let m = draws.len() as f64;
    let mut p = vec![0.0; n];
    for &d in draws {
        p[d] += 1.0;
    }
    for x in p.iter_mut() {
        *x /= m;
    }
    // One-hot columns: cov(i, i) = p_i(1 − p_i), cov(i, j) = −p_i p_j.
    let sd: Vec<f64> = p.iter().map(|&x| (x * (1.0 - x)).sqrt()).collect();
    let mut corr = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            if sd[i] == 0.0 || sd[j] == 0.0 {
                continue;
            }
            corr[i][j] = if i == j {
                1.0
            } else {
                -p[i] * p[j] / (sd[i] * sd[j])
            };
        }
    }
    Ok(corr)
}
