//! Monitoring primitives: simplex drift metrics, proportion intervals, threshold calibration.
//!
//! This module is policy-light: the estimator uses it for drift resets and confidence widths,
//! the detector for null quantiles and grid calibration.

use crate::error::Result;

/// Categorical drift metric used for comparing two frequency vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DriftMetric {
    /// Largest per-category absolute difference (in `[0, 1]`).
    #[default]
    MaxAbs,
    /// Fisher–Rao (Rao) distance on the simplex (radians, in `[0, π]`).
    Rao,
    /// Jensen–Shannon divergence (nats, in `[0, ln 2]`).
    JensenShannon,
    /// Hellinger distance (in `[0, 1]`).
    Hellinger,
}

impl DriftMetric {
    /// Largest change a single observation can cause in a frequency vector built from `w`
    /// units of weight, measured in this metric. `None` when no closed-form bound is used.
    pub fn single_step_bound(self, w: f64) -> Option<f64> {
        match self {
            DriftMetric::MaxAbs if w > 0.0 => Some(1.0 / w),
            _ => None,
        }
    }
}

/// Compute drift between two simplex distributions.
///
/// Both inputs are checked with [`logp::validate_simplex`]; violations surface as
/// [`Error::InvalidConfig`](crate::Error::InvalidConfig).
pub fn drift_simplex(p: &[f64], q: &[f64], metric: DriftMetric, tol: f64) -> Result<f64> {
    Ok(match metric {
        DriftMetric::MaxAbs => max_abs_difference(p, q, tol)?,
        DriftMetric::Rao => 2.0 * bhattacharyya_coefficient(p, q, tol)?.acos(),
        DriftMetric::JensenShannon => {
            check_pair(p, q, tol)?;
            logp::jensen_shannon_divergence(p, q, tol)?
        }
        DriftMetric::Hellinger => (1.0 - bhattacharyya_coefficient(p, q, tol)?).max(0.0).sqrt(),
    })
}

fn check_pair(p: &[f64], q: &[f64], tol: f64) -> std::result::Result<(), logp::Error> {
    if p.len() != q.len() {
        return Err(logp::Error::LengthMismatch(p.len(), q.len()));
    }
    logp::validate_simplex(p, tol)?;
    logp::validate_simplex(q, tol)?;
    if p.is_empty() {
        return Err(logp::Error::Empty);
    }
    Ok(())
}

fn max_abs_difference(p: &[f64], q: &[f64], tol: f64) -> Result<f64> {
    check_pair(p, q, tol)?;
    Ok(p.iter()
        .zip(q)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f64::max))
}

fn bhattacharyya_coefficient(p: &[f64], q: &[f64], tol: f64) -> Result<f64> {
    check_pair(p, q, tol)?;
    let bc: f64 = p
        .iter()
        .zip(q)
        .map(|(&pi, &qi)| (pi.max(0.0) * qi.max(0.0)).sqrt())
        .sum();
    // Tiny floating error can push this past 1.
    Ok(bc.clamp(0.0, 1.0))
}

/// Wilson score interval for a proportion `p_hat` observed over `n` (possibly fractional)
/// effective trials.
///
/// Returns `(lower, upper, half_width)`, with bounds clamped into `[0,1]`.
pub fn wilson_interval(p_hat: f64, n: f64, z: f64) -> (f64, f64, f64) {
    if !(n.is_finite() && n > 0.0) {
        return (0.0, 1.0, 0.5);
    }
    let p_hat = p_hat.clamp(0.0, 1.0);
    let z = sanitize_z(z);
    let z2 = z * z;

    // center = (p + z^2/(2n)) / (1 + z^2/n)
    // radius = z * sqrt(p(1-p)/n + z^2/(4n^2)) / (1 + z^2/n)
    let denom = 1.0 + z2 / n;
    let center = (p_hat + z2 / (2.0 * n)) / denom;
    let rad = (z * ((p_hat * (1.0 - p_hat) / n) + (z2 / (4.0 * n * n))).sqrt()) / denom;
    let lo = (center - rad).clamp(0.0, 1.0);
    let hi = (center + rad).clamp(0.0, 1.0);
    (lo, hi, (hi - lo) / 2.0)
}

/// Wilson interval from integer counts.
pub fn wilson_bounds(successes: u64, trials: u64, z: f64) -> (f64, f64, f64) {
    if trials == 0 {
        return (0.0, 1.0, 0.5);
    }
    let k = successes.min(trials) as f64;
    let n = trials as f64;
    wilson_interval(k / n, n, z)
}

/// Wald (normal-approximation) interval: `p ± z·sqrt(p(1-p)/n)`, clamped into `[0,1]`.
///
/// The half-width is reported before clamping so it stays a pure function of `(p, n, z)`.
pub fn normal_bounds(p_hat: f64, n: f64, z: f64) -> (f64, f64, f64) {
    if !(n.is_finite() && n > 0.0) {
        return (0.0, 1.0, 0.5);
    }
    let p_hat = p_hat.clamp(0.0, 1.0);
    let half = sanitize_z(z) * (p_hat * (1.0 - p_hat) / n).sqrt();
    (
        (p_hat - half).clamp(0.0, 1.0),
        (p_hat + half).clamp(0.0, 1.0),
        half,
    )
}

/// Worst-case (`p = 1/2`) Wald half-width: `z / (2·sqrt(n))`. Strictly decreasing in `n`.
pub fn conservative_half_width(n: f64, z: f64) -> f64 {
    if !(n.is_finite() && n > 0.0) {
        return 0.5;
    }
    sanitize_z(z) * 0.5 / n.sqrt()
}

fn sanitize_z(z: f64) -> f64 {
    if z.is_finite() && z > 0.0 {
        z
    } else {
        1.96
    }
}

/// Empirical `q`-quantile of an ascending slice (nearest rank: the smallest value `x` with at
/// least `⌈q·n⌉` samples `<= x`). `None` for an empty slice.
pub fn empirical_quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let n = sorted.len();
    let q = if q.is_finite() { q.clamp(0.0, 1.0) } else { 1.0 };
    let rank = ((q * n as f64).ceil() as usize).clamp(1, n);
    Some(sorted[rank - 1])
}

/// Result of calibrating a score threshold against a null score distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ThresholdCalibration {
    /// Chosen threshold (from the provided grid).
    pub threshold: f64,
    /// Empirical false-alarm estimate: \(\hat p = \#\{S > h\}/n\).
    pub fa_hat: f64,
    /// Wilson upper bound for the false-alarm probability at the same threshold.
    pub fa_wilson_hi: f64,
    /// Number of null samples used.
    pub trials: u64,
    /// Whether some grid point satisfied the requested constraint.
    pub grid_satisfied: bool,
}

/// Calibrate a threshold \(h\) from null scores.
///
/// Picks the *smallest* grid threshold satisfying:
/// - empirical mode: \(\hat P[S > h] \le \alpha\), or
/// - Wilson-conservative mode (when `require_wilson=true`): `wilson_hi <= alpha`.
///
/// Scores strictly above the threshold count as false alarms, matching the detector's
/// `score > threshold` rule. `null_scores` is sorted in place. With an empty grid the
/// threshold is `0.0`; with no scores it is the last grid point; both report
/// `grid_satisfied=false`.
#[must_use]
pub fn calibrate_threshold_from_max_scores(
    null_scores: &mut [f64],
    grid: &[f64],
    alpha: f64,
    z: f64,
    require_wilson: bool,
) -> ThresholdCalibration {
    let trials = null_scores.len() as u64;
    let Some(&last) = grid.last() else {
        return ThresholdCalibration {
            threshold: 0.0,
            fa_hat: 1.0,
            fa_wilson_hi: 1.0,
            trials,
            grid_satisfied: false,
        };
    };
    if trials == 0 {
        return ThresholdCalibration {
            threshold: last,
            fa_hat: 1.0,
            fa_wilson_hi: 1.0,
            trials,
            grid_satisfied: false,
        };
    }
    debug_assert!(
        grid.windows(2).all(|w| w[0] <= w[1]),
        "threshold grid must be nondecreasing"
    );

    let alpha = if alpha.is_finite() {
        alpha.clamp(0.0, 1.0)
    } else {
        0.0
    };
    null_scores.sort_by(|a, b| a.total_cmp(b));

    let at = |thr: f64| {
        let idx = null_scores.partition_point(|&x| x <= thr);
        let fa_count = (null_scores.len() - idx) as u64;
        let (_lo, hi, _half) = wilson_bounds(fa_count, trials, z);
        ((fa_count as f64) / (trials as f64), hi)
    };

    for &thr in grid {
        let (fa, hi) = at(thr);
        let ok = if require_wilson { hi <= alpha } else { fa <= alpha };
        if ok {
            return ThresholdCalibration {
                threshold: thr,
                fa_hat: fa,
                fa_wilson_hi: hi,
                trials,
                grid_satisfied: true,
            };
        }
    }
    let (fa, hi) = at(last);
    ThresholdCalibration {
        threshold: last,
        fa_hat: fa,
        fa_wilson_hi: hi,
        trials,
        grid_satisfied: false,
    }
}
