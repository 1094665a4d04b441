//! Anomaly scoring against the uniform-process null.
//!
//! At each evaluation point the statistic is
//!
//! ```text
//! S = Σ_i z_i²,   z_i² = n_var · β̂_i² / N
//! ```
//!
//! which is Pearson's χ² for cumulative counts and approximately `χ²(N−1)` under `β = 0` for
//! any forgetting factor. The threshold comes from a [`NullCalibration`]: either the analytic
//! χ² quantile or an empirical quantile of statistics collected by streaming zero-bias
//! simulations through an identically configured estimator.

use std::collections::HashMap;

use tracing::info;

use crate::error::{Error, Result};
use crate::estimator::{AdaptiveEstimator, BetaEstimate, EstimatorConfig};
use crate::law::RenormConfig;
use crate::monitor::{calibrate_threshold_from_max_scores, empirical_quantile};
use crate::profile::{BiasProfile, NoiseModel};
use crate::simulate::SimulatorSession;
use crate::special::chi_square_quantile;
use crate::utils::{derive_seed, labeled_seed};

/// Format version of [`NullCalibration`] artifacts. Cached artifacts with another version are
/// ignored.
pub const CALIBRATION_FORMAT_VERSION: u32 = 1;

/// How the null distribution is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NullMethod {
    /// `χ²(N−1)` quantile.
    Analytic,
    /// Zero-bias simulation through the estimator.
    MonteCarlo {
        /// Independent null streams.
        streams: usize,
        /// Observations per stream.
        length: u64,
        seed: u64,
    },
}

impl Default for NullMethod {
    fn default() -> Self {
        NullMethod::MonteCarlo {
            streams: 50,
            length: 10_000,
            seed: 0,
        }
    }
}

/// Detector configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DetectorConfig {
    /// Null quantile used as the flagging threshold.
    pub quantile: f64,
    pub method: NullMethod,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            quantile: 0.99,
            method: NullMethod::default(),
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.quantile > 0.0 && self.quantile < 1.0) {
            return Err(Error::config(format!(
                "anomaly quantile must lie in (0, 1) (got {})",
                self.quantile
            )));
        }
        if let NullMethod::MonteCarlo { streams, length, .. } = self.method {
            if streams == 0 || length == 0 {
                return Err(Error::config("Monte Carlo calibration needs streams and length > 0"));
            }
        }
        Ok(())
    }
}

/// Cache key: category count, evaluation cadence and forgetting factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CalibrationKey {
    pub n: usize,
    pub window_size: usize,
    /// `λ.to_bits()`, so the key is hashable.
    pub decay_bits: u64,
}

impl CalibrationKey {
    pub fn new(n: usize, window_size: usize, decay: f64) -> Self {
        Self {
            n,
            window_size,
            decay_bits: decay.to_bits(),
        }
    }

    pub fn decay(&self) -> f64 {
        f64::from_bits(self.decay_bits)
    }
}

/// A calibrated null distribution.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NullCalibration {
    pub version: u32,
    pub key: CalibrationKey,
    pub method: NullMethod,
    /// Sorted null statistics (empty for analytic calibrations).
    null_scores: Vec<f64>,
}

impl NullCalibration {
    /// Analytic `χ²(N−1)` null.
    pub fn analytic(key: CalibrationKey) -> Result<Self> {
        if key.n <= 1 {
            return Err(Error::config("calibration needs at least 2 categories"));
        }
        Ok(Self {
            version: CALIBRATION_FORMAT_VERSION,
            key,
            method: NullMethod::Analytic,
            null_scores: Vec::new(),
        })
    }

    /// Empirical null from precomputed statistics.
    pub fn from_scores(key: CalibrationKey, method: NullMethod, mut scores: Vec<f64>) -> Result<Self> {
        scores.retain(|s| s.is_finite());
        if scores.is_empty() {
            return Err(Error::InsufficientData("no null statistics".to_string()));
        }
        scores.sort_by(|a, b| a.total_cmp(b));
        Ok(Self {
            version: CALIBRATION_FORMAT_VERSION,
            key,
            method,
            null_scores: scores,
        })
    }

    /// Simulate `streams` zero-bias streams of `length` observations, feed each through a
    /// fresh estimator with `est` in chunks of `window_size`, and collect the statistic at
    /// every evaluation point.
    pub fn monte_carlo(
        est: EstimatorConfig,
        window_size: usize,
        streams: usize,
        length: u64,
        seed: u64,
    ) -> Result<Self> {
        est.validate()?;
        if window_size == 0 {
            return Err(Error::config("window size must be positive"));
        }
        if streams == 0 || length == 0 {
            return Err(Error::config("Monte Carlo calibration needs streams and length > 0"));
        }
        let key = CalibrationKey::new(est.n, window_size, est.decay);
        let base = labeled_seed(seed, "null-calibration");

        #[cfg(feature = "parallel")]
        let per_stream: Result<Vec<Vec<f64>>> = {
            use rayon::prelude::*;
            (0..streams)
                .into_par_iter()
                .map(|s| null_stream_scores(est, window_size, length, derive_seed(base, s as u64)))
                .collect()
        };
        #[cfg(not(feature = "parallel"))]
        let per_stream: Result<Vec<Vec<f64>>> = (0..streams)
            .map(|s| null_stream_scores(est, window_size, length, derive_seed(base, s as u64)))
            .collect();

        let scores: Vec<f64> = per_stream?.into_iter().flatten().collect();
        let cal = Self::from_scores(
            key,
            NullMethod::MonteCarlo {
                streams,
                length,
                seed,
            },
            scores,
        )?;
        info!(
            n = est.n,
            window_size,
            decay = est.decay,
            samples = cal.null_scores.len(),
            "null calibration complete"
        );
        Ok(cal)
    }

    /// Run the calibration described by `method` for an estimator configuration.
    pub fn calibrate(est: EstimatorConfig, window_size: usize, method: NullMethod) -> Result<Self> {
        match method {
            NullMethod::Analytic => {
                est.validate()?;
                Self::analytic(CalibrationKey::new(est.n, window_size, est.decay))
            }
            NullMethod::MonteCarlo {
                streams,
                length,
                seed,
            } => Self::monte_carlo(est, window_size, streams, length, seed),
        }
    }

    /// Number of null statistics behind an empirical calibration.
    pub fn samples(&self) -> usize {
        self.null_scores.len()
    }

    pub fn null_scores(&self) -> &[f64] {
        &self.null_scores
    }

    /// Degrees of freedom of the analytic null.
    pub fn dof(&self) -> f64 {
        (self.key.n - 1) as f64
    }

    /// Flagging threshold at `quantile`.
    pub fn threshold(&self, quantile: f64) -> Result<f64> {
        match self.method {
            NullMethod::Analytic => chi_square_quantile(quantile, self.dof()),
            NullMethod::MonteCarlo { .. } => empirical_quantile(&self.null_scores, quantile)
                .ok_or_else(|| Error::InsufficientData("empty null calibration".to_string())),
        }
    }

    /// Smallest grid threshold whose null false-alarm rate is at most `alpha`, optionally
    /// requiring the Wilson upper bound to satisfy it. Only for empirical calibrations.
    pub fn grid_threshold(
        &self,
        grid: &[f64],
        alpha: f64,
        z: f64,
        require_wilson: bool,
    ) -> Result<crate::monitor::ThresholdCalibration> {
        if self.null_scores.is_empty() {
            return Err(Error::InsufficientData(
                "grid calibration needs empirical null statistics".to_string(),
            ));
        }
        let mut scores = self.null_scores.clone();
        Ok(calibrate_threshold_from_max_scores(&mut scores, grid, alpha, z, require_wilson))
    }
}

fn null_stream_scores(
    est: EstimatorConfig,
    window_size: usize,
    length: u64,
    seed: u64,
) -> Result<Vec<f64>> {
    let profile = BiasProfile::zero(est.n)?;
    let mut sim = SimulatorSession::from_parts(est.n, seed, RenormConfig::default(), false);
    let mut estimator = AdaptiveEstimator::new(est)?;
    let mut out = Vec::with_capacity((length as usize).div_ceil(window_size));
    let mut remaining = length;
    while remaining > 0 {
        let len = remaining.min(window_size as u64) as usize;
        let chunk = sim.next_chunk(&profile, &NoiseModel::None, len)?;
        let estimates = estimator.update(&chunk)?;
        out.push(statistic(&estimates).0);
        remaining -= len as u64;
    }
    Ok(out)
}

/// Versioned calibration store keyed by [`CalibrationKey`].
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CalibrationCache {
    entries: HashMap<CalibrationKey, NullCalibration>,
}

impl CalibrationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A current-version calibration for `key`, if cached.
    pub fn get(&self, key: &CalibrationKey) -> Option<&NullCalibration> {
        self.entries
            .get(key)
            .filter(|c| c.version == CALIBRATION_FORMAT_VERSION)
    }

    pub fn insert(&mut self, calibration: NullCalibration) {
        self.entries.insert(calibration.key, calibration);
    }

    /// Return the cached calibration for this estimator and cadence, computing (and caching)
    /// it when missing, stale, or produced by a different method.
    pub fn get_or_calibrate(
        &mut self,
        est: EstimatorConfig,
        window_size: usize,
        method: NullMethod,
    ) -> Result<NullCalibration> {
        let key = CalibrationKey::new(est.n, window_size, est.decay);
        if let Some(c) = self.get(&key).filter(|c| c.method == method) {
            return Ok(c.clone());
        }
        let c = NullCalibration::calibrate(est, window_size, method)?;
        self.insert(c.clone());
        Ok(c)
    }

    /// Drop artifacts written with another format version.
    pub fn retain_current(&mut self) {
        self.entries
            .retain(|_, c| c.version == CALIBRATION_FORMAT_VERSION);
    }
}

/// Anomaly score for one evaluation point.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AnomalyScore {
    pub window_end: u64,
    pub score: f64,
    pub flagged: bool,
    /// Category indices by descending contribution (ties by index).
    pub contributing_categories: Vec<usize>,
    /// `z_i²` indexed by category.
    pub contributions: Vec<f64>,
    pub threshold: f64,
    pub calibration_version: u32,
}

/// `(S, z²)` for one evaluation point.
pub fn statistic(estimates: &[BetaEstimate]) -> (f64, Vec<f64>) {
    let n = estimates.len().max(1) as f64;
    let z2: Vec<f64> = estimates
        .iter()
        .map(|e| e.variance_samples * e.point_estimate * e.point_estimate / n)
        .collect();
    (z2.iter().sum(), z2)
}

/// Score one evaluation point against a null calibration.
pub fn score(
    estimates: &[BetaEstimate],
    null: &NullCalibration,
    quantile: f64,
) -> Result<AnomalyScore> {
    let Some(first) = estimates.first() else {
        return Err(Error::InsufficientData("no estimates to score".to_string()));
    };
    if estimates.len() != null.key.n {
        return Err(Error::config(format!(
            "calibration covers {} categories, got {} estimates",
            null.key.n,
            estimates.len()
        )));
    }
    let threshold = null.threshold(quantile)?;
    let (s, contributions) = statistic(estimates);
    let mut ranked: Vec<usize> = (0..contributions.len()).collect();
    ranked.sort_by(|&a, &b| contributions[b].total_cmp(&contributions[a]).then(a.cmp(&b)));
    Ok(AnomalyScore {
        window_end: first.window_end,
        score: s,
        flagged: s > threshold,
        contributing_categories: ranked,
        contributions,
        threshold,
        calibration_version: null.version,
    })
}

/// Detector holding its configuration and, once calibrated, the null model.
#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    cfg: DetectorConfig,
    calibration: Option<NullCalibration>,
    threshold: f64,
}

impl AnomalyDetector {
    pub fn new(cfg: DetectorConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            calibration: None,
            threshold: f64::INFINITY,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.cfg
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibration.is_some()
    }

    pub fn calibration(&self) -> Option<&NullCalibration> {
        self.calibration.as_ref()
    }

    /// Threshold in use (`+∞` before calibration).
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Install a calibration; rejects artifacts of another format version.
    pub fn install(&mut self, calibration: NullCalibration) -> Result<()> {
        if calibration.version != CALIBRATION_FORMAT_VERSION {
            return Err(Error::config(format!(
                "calibration format version {} is not {}",
                calibration.version, CALIBRATION_FORMAT_VERSION
            )));
        }
        self.threshold = calibration.threshold(self.cfg.quantile)?;
        self.calibration = Some(calibration);
        Ok(())
    }

    /// Calibrate for an estimator configuration and cadence through `cache`.
    pub fn calibrate(
        &mut self,
        est: EstimatorConfig,
        window_size: usize,
        cache: &mut CalibrationCache,
    ) -> Result<()> {
        let c = cache.get_or_calibrate(est, window_size, self.cfg.method)?;
        self.install(c)
    }

    /// Fails with [`Error::UncalibratedDetector`] before a calibration is installed.
    pub fn score(&self, estimates: &[BetaEstimate]) -> Result<AnomalyScore> {
        let null = self.calibration.as_ref().ok_or(Error::UncalibratedDetector)?;
        score(estimates, null, self.cfg.quantile)
    }
}
