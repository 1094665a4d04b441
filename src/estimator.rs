//! Online β estimation with exponential forgetting and drift resets.
//!
//! Per category the estimator keeps decayed sums
//!
//! ```text
//! S_i ← λ·S_i + 1[x = i]      W ← λ·W + 1      Σw² ← λ²·Σw² + 1
//! ```
//!
//! so `f̂_i = S_i / W` and `β̂_i = N·f̂_i − 1`. The effective sample size is `W` (saturating at
//! `1/(1−λ)`); confidence widths use the Kish size `W²/Σw²`, which equals `W` when `λ = 1`.
//!
//! Drift handling compares the current frequency vector with the one recorded
//! `reference_window` observations earlier. When the distance exceeds the threshold, all sums
//! are multiplied by `reset_fraction`: `f̂` is unchanged but the estimator's memory (and so
//! its confidence) shrinks, letting new data dominate quickly.

use std::collections::VecDeque;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::law::beta_from_frequency;
use crate::monitor::{conservative_half_width, drift_simplex, normal_bounds, wilson_interval, DriftMetric};
use crate::stream::{Observation, OutcomeStream, TimeWindow};

/// Confidence interval construction for a category frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IntervalMethod {
    /// Normal approximation `z·sqrt(f(1-f)/n)`.
    Wald,
    /// Wilson score interval.
    #[default]
    Wilson,
    /// Worst-case `f = 1/2`; depends only on the sample size.
    Conservative,
}

/// Drift-reset parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DriftResetConfig {
    pub metric: DriftMetric,
    /// Distance above which the memory is cut.
    pub threshold: f64,
    /// Lag, in observations, between the compared frequency vectors.
    pub reference_window: usize,
    /// Factor in `(0,1)` applied to every sum on reset.
    pub reset_fraction: f64,
}

impl Default for DriftResetConfig {
    fn default() -> Self {
        Self {
            metric: DriftMetric::MaxAbs,
            threshold: 0.05,
            reference_window: 200,
            reset_fraction: 0.25,
        }
    }
}

impl DriftResetConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err(Error::config("drift threshold must be finite and > 0"));
        }
        if self.reference_window == 0 {
            return Err(Error::config("reference window must be at least 1"));
        }
        if !(self.reset_fraction > 0.0 && self.reset_fraction < 1.0) {
            return Err(Error::config("reset fraction must lie in (0, 1)"));
        }
        // A lone observation moves f̂ by at most 1/W <= 1/reference_window in L∞.
        if self.metric == DriftMetric::MaxAbs
            && self.threshold * (self.reference_window as f64) <= 1.0
        {
            return Err(Error::config(format!(
                "drift threshold {} with reference window {} lets one observation trigger a reset",
                self.threshold, self.reference_window
            )));
        }
        Ok(())
    }
}

/// Estimator configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EstimatorConfig {
    /// Category count `N`.
    pub n: usize,
    /// Forgetting factor `λ ∈ (0, 1]`; `1` gives the cumulative average.
    pub decay: f64,
    pub interval: IntervalMethod,
    /// Critical value of the interval.
    pub z: f64,
    /// Drift resets; `None` disables them.
    pub drift: Option<DriftResetConfig>,
    /// Kish sample size below which estimates are flagged `low_sample`.
    pub min_samples: f64,
    /// Numerical tolerance for the frequency invariants.
    pub tol: f64,
}

impl EstimatorConfig {
    /// Cumulative (λ = 1) Wilson estimator without drift resets.
    pub fn new(n: usize) -> Self {
        Self {
            n,
            decay: 1.0,
            interval: IntervalMethod::Wilson,
            z: 1.96,
            drift: None,
            min_samples: 30.0,
            tol: 1e-9,
        }
    }

    pub fn with_decay(mut self, decay: f64) -> Self {
        self.decay = decay;
        self
    }

    pub fn with_interval(mut self, interval: IntervalMethod, z: f64) -> Self {
        self.interval = interval;
        self.z = z;
        self
    }

    pub fn with_drift(mut self, drift: DriftResetConfig) -> Self {
        self.drift = Some(drift);
        self
    }

    /// Saturation value of the effective sample size, `1/(1−λ)` (infinite when `λ = 1`).
    pub fn max_effective_samples(&self) -> f64 {
        if self.decay >= 1.0 {
            f64::INFINITY
        } else {
            1.0 / (1.0 - self.decay)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.n <= 1 {
            return Err(Error::config(format!(
                "category count must be at least 2 (got {})",
                self.n
            )));
        }
        if !(self.decay > 0.0 && self.decay <= 1.0) {
            return Err(Error::config(format!("decay must lie in (0, 1] (got {})", self.decay)));
        }
        if !(self.z.is_finite() && self.z > 0.0) {
            return Err(Error::config("z must be finite and > 0"));
        }
        if !(self.min_samples.is_finite() && self.min_samples >= 0.0) {
            return Err(Error::config("min_samples must be finite and >= 0"));
        }
        if !(self.tol.is_finite() && self.tol >= 0.0) {
            return Err(Error::config("tol must be finite and >= 0"));
        }
        if let Some(d) = &self.drift {
            d.validate()?;
        }
        Ok(())
    }
}

/// Diagnostic flags attached to an estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EstimateFlags {
    /// The frequency left `[0, 1]` through rounding and was clipped back.
    pub clipped: bool,
    /// A drift reset happened since the previous evaluation point.
    pub drift_reset: bool,
    /// The variance sample size is below `min_samples`.
    pub low_sample: bool,
}

impl EstimateFlags {
    pub fn any(&self) -> bool {
        self.clipped || self.drift_reset || self.low_sample
    }
}

/// β estimate for one category at one evaluation point.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BetaEstimate {
    pub category_index: usize,
    /// `β̂_i = N·f̂_i − 1`.
    pub point_estimate: f64,
    /// Variance of `β̂_i`: `N²·f̂(1−f̂)/n_var`.
    pub variance: f64,
    /// Half-width of the β interval at the configured `z`.
    pub confidence_width: f64,
    /// First timestamp of the estimator's current memory (creation or last drift reset).
    pub window_start: u64,
    pub window_end: u64,
    /// Observations consumed since `window_start` (inclusive).
    pub sample_count: u64,
    /// `W`.
    pub effective_samples: f64,
    /// `W²/Σw²`.
    pub variance_samples: f64,
    /// `f̂_i`.
    pub frequency: f64,
    pub flags: EstimateFlags,
}

impl BetaEstimate {
    pub fn lower(&self) -> f64 {
        self.point_estimate - self.confidence_width
    }

    pub fn upper(&self) -> f64 {
        self.point_estimate + self.confidence_width
    }

    /// Whether `beta` lies inside `[lower, upper]`.
    pub fn covers(&self, beta: f64) -> bool {
        self.lower() <= beta && beta <= self.upper()
    }
}

/// Record of a drift reset.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DriftReset {
    pub timestamp: u64,
    pub distance: f64,
    /// `W` right after the reset.
    pub effective_samples: f64,
}

/// Online estimator. Owns its state; feed it with [`AdaptiveEstimator::update`].
#[derive(Debug, Clone)]
pub struct AdaptiveEstimator {
    cfg: EstimatorConfig,
    sums: Vec<f64>,
    weight: f64,
    weight_sq: f64,
    window_start: Option<u64>,
    last_timestamp: Option<u64>,
    since_reset: u64,
    total: u64,
    // f̂ snapshots, oldest first; holds at most `reference_window` entries.
    snapshots: VecDeque<Vec<f64>>,
    freq: Vec<f64>,
    clipped: bool,
    reset_pending: bool,
    resets: Vec<DriftReset>,
}

impl AdaptiveEstimator {
    pub fn new(cfg: EstimatorConfig) -> Result<Self> {
        cfg.validate()?;
        let cap = cfg.drift.map_or(0, |d| d.reference_window);
        Ok(Self {
            sums: vec![0.0; cfg.n],
            weight: 0.0,
            weight_sq: 0.0,
            window_start: None,
            last_timestamp: None,
            since_reset: 0,
            total: 0,
            snapshots: VecDeque::with_capacity(cap),
            freq: vec![0.0; cfg.n],
            clipped: false,
            reset_pending: false,
            resets: Vec::new(),
            cfg,
        })
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.cfg
    }

    /// Total observations consumed.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// `W`.
    pub fn effective_samples(&self) -> f64 {
        self.weight
    }

    /// `W²/Σw²` (0 before any observation).
    pub fn variance_samples(&self) -> f64 {
        if self.weight_sq > 0.0 {
            self.weight * self.weight / self.weight_sq
        } else {
            0.0
        }
    }

    /// Current frequency vector (all zeros before any observation).
    pub fn frequencies(&self) -> &[f64] {
        &self.freq
    }

    pub fn drift_resets(&self) -> &[DriftReset] {
        &self.resets
    }

    /// Consume a chunk of observations and return one estimate per category at its end.
    ///
    /// The chunk is validated first; a rejected chunk leaves the estimator untouched.
    /// Fails with [`Error::InsufficientData`] on an empty chunk and
    /// [`Error::InvalidObservation`] on an out-of-range category or a decreasing timestamp.
    pub fn update(&mut self, chunk: &[Observation]) -> Result<Vec<BetaEstimate>> {
        if chunk.is_empty() {
            return Err(Error::InsufficientData("update received an empty chunk".to_string()));
        }
        let mut last = self.last_timestamp;
        for o in chunk {
            if o.category_index() >= self.cfg.n {
                return Err(Error::observation(
                    o.timestamp(),
                    format!("category {} outside [0, {})", o.category_index(), self.cfg.n),
                ));
            }
            if last.is_some_and(|t| o.timestamp() < t) {
                return Err(Error::observation(
                    o.timestamp(),
                    "timestamp precedes previously consumed observation",
                ));
            }
            last = Some(o.timestamp());
        }
        for o in chunk {
            self.observe(o.category_index(), o.timestamp());
        }
        debug!(
            consumed = chunk.len(),
            effective = self.weight,
            "estimator updated"
        );
        self.current()
    }

    /// Estimates at the most recent observation.
    pub fn current(&mut self) -> Result<Vec<BetaEstimate>> {
        let (Some(start), Some(end)) = (self.window_start, self.last_timestamp) else {
            return Err(Error::InsufficientData("no observations consumed".to_string()));
        };
        let flags = EstimateFlags {
            clipped: self.clipped,
            drift_reset: self.reset_pending,
            low_sample: self.variance_samples() < self.cfg.min_samples,
        };
        self.clipped = false;
        self.reset_pending = false;
        let nf = self.cfg.n as f64;
        let n_var = self.variance_samples();
        Ok(self
            .freq
            .iter()
            .enumerate()
            .map(|(i, &f)| {
                let half = match self.cfg.interval {
                    IntervalMethod::Wald => normal_bounds(f, n_var, self.cfg.z).2,
                    IntervalMethod::Wilson => wilson_interval(f, n_var, self.cfg.z).2,
                    IntervalMethod::Conservative => conservative_half_width(n_var, self.cfg.z),
                };
                BetaEstimate {
                    category_index: i,
                    point_estimate: beta_from_frequency(self.cfg.n, f),
                    variance: nf * nf * f * (1.0 - f) / n_var,
                    confidence_width: nf * half,
                    window_start: start,
                    window_end: end,
                    sample_count: self.since_reset,
                    effective_samples: self.weight,
                    variance_samples: n_var,
                    frequency: f,
                    flags,
                }
            })
            .collect())
    }

    fn observe(&mut self, category: usize, timestamp: u64) {
        let lambda = self.cfg.decay;
        for s in self.sums.iter_mut() {
            *s *= lambda;
        }
        self.sums[category] += 1.0;
        self.weight = lambda * self.weight + 1.0;
        self.weight_sq = lambda * lambda * self.weight_sq + 1.0;
        self.window_start.get_or_insert(timestamp);
        self.last_timestamp = Some(timestamp);
        self.since_reset += 1;
        self.total += 1;
        self.refresh_frequencies();

        if let Some(drift) = self.cfg.drift {
            self.check_drift(drift, timestamp);
        }
    }

    fn refresh_frequencies(&mut self) {
        let mut clipped = false;
        for (f, &s) in self.freq.iter_mut().zip(&self.sums) {
            let raw = s / self.weight;
            let c = raw.clamp(0.0, 1.0);
            clipped |= (raw - c).abs() > self.cfg.tol;
            *f = c;
        }
        self.clipped |= clipped;
    }

    fn check_drift(&mut self, drift: DriftResetConfig, timestamp: u64) {
        if self.snapshots.len() < drift.reference_window {
            self.snapshots.push_back(self.freq.clone());
            return;
        }
        let Some(mut old) = self.snapshots.pop_front() else {
            return;
        };
        // A failed comparison (only possible through rounding) counts as no drift.
        let distance = drift_simplex(&old, &self.freq, drift.metric, 1e-6).unwrap_or(0.0);
        if distance > drift.threshold {
            let r = drift.reset_fraction;
            for s in self.sums.iter_mut() {
                *s *= r;
            }
            self.weight *= r;
            // Scaling Σw² by r (not r²) shrinks the Kish size by r, so widths grow after a reset.
            self.weight_sq *= r;
            self.snapshots.clear();
            self.snapshots.push_back(self.freq.clone());
            self.window_start = Some(timestamp);
            self.since_reset = 1;
            self.reset_pending = true;
            self.resets.push(DriftReset {
                timestamp,
                distance,
                effective_samples: self.weight,
            });
            info!(timestamp, distance, effective = self.weight, "drift reset");
        } else {
            old.copy_from_slice(&self.freq);
            self.snapshots.push_back(old);
        }
    }

    /// Batch estimate over the observations of `stream` inside `window`, using a fresh
    /// estimator with configuration `cfg`.
    ///
    /// Fails with [`Error::InsufficientData`] when the window holds no observation.
    pub fn estimate(
        cfg: EstimatorConfig,
        stream: &OutcomeStream,
        window: TimeWindow,
    ) -> Result<Vec<BetaEstimate>> {
        if cfg.n != stream.n() {
            return Err(Error::config(format!(
                "estimator expects {} categories, stream has {}",
                cfg.n,
                stream.n()
            )));
        }
        let obs: Vec<Observation> = stream.window(window).cloned().collect();
        if obs.is_empty() {
            return Err(Error::InsufficientData(format!(
                "no observations in [{}, {}]",
                window.start(),
                window.end()
            )));
        }
        let mut est = Self::new(cfg)?;
        est.update(&obs)
    }

    /// [`AdaptiveEstimator::estimate`] over raw bounds; fails with [`Error::InvalidWindow`]
    /// when `end < start`.
    pub fn estimate_range(
        cfg: EstimatorConfig,
        stream: &OutcomeStream,
        start: u64,
        end: u64,
    ) -> Result<Vec<BetaEstimate>> {
        Self::estimate(cfg, stream, TimeWindow::new(start, end)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(cats: &[usize]) -> Vec<Observation> {
        cats.iter()
            .enumerate()
            .map(|(t, &c)| Observation::new(c, t as u64))
            .collect()
    }

    #[test]
    fn cumulative_frequencies_match_counts() {
        let mut e = AdaptiveEstimator::new(EstimatorConfig::new(3)).unwrap();
        let est = e.update(&obs(&[0, 0, 1, 2, 0, 1])).unwrap();
        assert_eq!(est.len(), 3);
        assert!((est[0].frequency - 0.5).abs() < 1e-12);
        assert!((est[0].point_estimate - 0.5).abs() < 1e-12);
        assert!((est[2].point_estimate - (-0.5)).abs() < 1e-12);
        assert_eq!(est[0].sample_count, 6);
        assert_eq!((est[0].window_start, est[0].window_end), (0, 5));
        assert!((est[0].effective_samples - 6.0).abs() < 1e-12);
        assert!((est[0].variance_samples - 6.0).abs() < 1e-12);
        assert!(est[0].flags.low_sample);
        let s: f64 = est.iter().map(|b| b.frequency).sum();
        assert!((s - 1.0).abs() < 1e-12);
    }

    #[test]
    fn empty_update_is_insufficient_data() {
        let mut e = AdaptiveEstimator::new(EstimatorConfig::new(2)).unwrap();
        assert!(matches!(e.update(&[]), Err(Error::InsufficientData(_))));
        assert!(matches!(e.current(), Err(Error::InsufficientData(_))));
    }

    #[test]
    fn rejected_chunk_leaves_state_untouched() {
        let mut e = AdaptiveEstimator::new(EstimatorConfig::new(2)).unwrap();
        e.update(&obs(&[0, 1])).unwrap();
        let bad = [Observation::new(0, 5), Observation::new(2, 6)];
        assert!(matches!(
            e.update(&bad),
            Err(Error::InvalidObservation { timestamp: 6, .. })
        ));
        assert_eq!(e.total(), 2);
        let stale = [Observation::new(0, 0)];
        assert!(matches!(
            e.update(&stale),
            Err(Error::InvalidObservation { timestamp: 0, .. })
        ));
        assert!(e.update(&[Observation::new(0, 1)]).is_ok());
        let back = [Observation::new(1, 7), Observation::new(1, 3)];
        assert!(e.update(&back).is_err());
        assert_eq!(e.total(), 3);
    }

    #[test]
    fn decay_saturates_effective_samples() {
        let cfg = EstimatorConfig::new(2).with_decay(0.9);
        let mut e = AdaptiveEstimator::new(cfg).unwrap();
        let cats: Vec<usize> = (0..500).map(|i| i % 2).collect();
        let est = e.update(&obs(&cats)).unwrap();
        assert!((est[0].effective_samples - cfg.max_effective_samples()).abs() < 1e-6);
        // Kish size for geometric weights: (1+λ)/(1−λ) = 19.
        assert!((est[0].variance_samples - 19.0).abs() < 1e-6);
    }

    #[test]
    fn conservative_width_strictly_shrinks_without_drift() {
        let cfg = EstimatorConfig::new(4).with_interval(IntervalMethod::Conservative, 1.96);
        let mut e = AdaptiveEstimator::new(cfg).unwrap();
        let mut prev = f64::INFINITY;
        for k in 0..20u64 {
            let chunk: Vec<Observation> =
                (0..10).map(|i| Observation::new((i % 4) as usize, k * 10 + i)).collect();
            let w = e.update(&chunk).unwrap()[0].confidence_width;
            assert!(w < prev, "k={k} w={w} prev={prev}");
            prev = w;
        }
    }

    #[test]
    fn drift_reset_keeps_frequencies_and_widens_interval() {
        let drift = DriftResetConfig {
            metric: DriftMetric::MaxAbs,
            threshold: 0.1,
            reference_window: 50,
            reset_fraction: 0.2,
        };
        let cfg = EstimatorConfig::new(2)
            .with_decay(0.98)
            .with_interval(IntervalMethod::Conservative, 1.96)
            .with_drift(drift);
        let mut e = AdaptiveEstimator::new(cfg).unwrap();
        let balanced: Vec<Observation> =
            (0..400).map(|t| Observation::new((t % 2) as usize, t)).collect();
        let before = e.update(&balanced).unwrap();
        // The start-up transient may already have reset once.
        let resets_before = e.drift_resets().len();

        // All-zero run: f̂_0 climbs until the lagged comparison exceeds 0.1.
        let mut after = None;
        for t in 400..1_000u64 {
            let est = e.update(&[Observation::new(0, t)]).unwrap();
            if est[0].flags.drift_reset {
                after = Some(est);
                break;
            }
        }
        let after = after.expect("drift reset");
        assert_eq!(e.drift_resets().len(), resets_before + 1);
        let reset = *e.drift_resets().last().unwrap();
        assert!(reset.distance > 0.1);
        assert!(after[0].frequency > before[0].frequency);
        assert!(after[0].confidence_width > before[0].confidence_width);
        assert_eq!(after[0].window_start, reset.timestamp);
        assert_eq!(after[0].sample_count, 1);
        let s: f64 = after.iter().map(|b| b.frequency).sum();
        assert!((s - 1.0).abs() < 1e-9);
    }

    #[test]
    fn drift_config_rejects_single_observation_trigger() {
        let bad = DriftResetConfig {
            threshold: 0.01,
            reference_window: 50,
            ..DriftResetConfig::default()
        };
        assert!(matches!(bad.validate(), Err(Error::InvalidConfig(_))));
        assert!(DriftResetConfig::default().validate().is_ok());
    }

    #[test]
    fn config_validation() {
        assert!(EstimatorConfig::new(1).validate().is_err());
        assert!(EstimatorConfig::new(3).with_decay(0.0).validate().is_err());
        assert!(EstimatorConfig::new(3).with_decay(1.5).validate().is_err());
        assert!(EstimatorConfig::new(3).with_interval(IntervalMethod::Wald, -1.0).validate().is_err());
    }

    #[test]
    fn windowed_batch_estimate() {
        let mut s = OutcomeStream::new(2).unwrap();
        s.ingest(obs(&[0, 0, 0, 1, 1, 1, 1, 1])).unwrap();
        let cfg = EstimatorConfig::new(2);
        let est = AdaptiveEstimator::estimate_range(cfg, &s, 3, 7).unwrap();
        assert_eq!(est[1].frequency, 1.0);
        assert_eq!(est[1].sample_count, 5);
        assert!(matches!(
            AdaptiveEstimator::estimate_range(cfg, &s, 20, 30),
            Err(Error::InsufficientData(_))
        ));
        assert!(matches!(
            AdaptiveEstimator::estimate_range(cfg, &s, 5, 2),
            Err(Error::InvalidWindow { start: 5, end: 2 })
        ));
    }
}
