//! Orchestration: source → estimator → detector, with an optional feedback loop.
//!
//! A [`Pipeline`] moves `Configured → Running → Completed | Failed`. Every cycle pulls one
//! chunk from its [`ChunkSource`], appends it to the run's stream, updates the estimator and
//! scores the chunk's evaluation point. In feedback mode the latest score nudges the
//! simulator's drift rate for the next chunk by a damped, bounded step.
//!
//! Configuration errors are returned by [`Pipeline::new`] before any data exists. Errors
//! raised while running are handled by class: data errors are skipped or abort per
//! [`DataErrorPolicy`], budget exhaustion and fatal errors end the run as `Failed`. Either
//! way the returned [`PipelineRun`] keeps everything produced so far.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::detector::{AnomalyDetector, AnomalyScore, CalibrationCache, DetectorConfig, NullCalibration};
use crate::error::{Error, ErrorClass, Result};
use crate::estimator::{AdaptiveEstimator, BetaEstimate, DriftReset, EstimateFlags, EstimatorConfig};
use crate::monitor::wilson_bounds;
use crate::profile::NoiseModel;
use crate::simulate::{RenormAudit, SimulatorConfig, SimulatorSession};
use crate::stream::{Covariates, Observation, OutcomeStream};

/// What to do with a chunk that fails with a data-class error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataErrorPolicy {
    /// Drop the chunk, record it, keep going.
    Skip,
    /// End the run as `Failed`.
    #[default]
    Abort,
}

/// Resource limits for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Budget {
    pub max_cycles: Option<u64>,
    pub wall_clock: Option<Duration>,
}

/// Damped drift-rate feedback.
///
/// Per cycle: `step = clamp(damping·(1 − score/threshold), ±max_step)` and
/// `rate ← clamp(rate·exp(step), min_drift_rate, max_drift_rate)`. Scores below the threshold
/// raise the drift rate, scores above lower it.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FeedbackConfig {
    pub damping: f64,
    pub max_step: f64,
    pub min_drift_rate: f64,
    pub max_drift_rate: f64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            damping: 0.2,
            max_step: 0.1,
            min_drift_rate: 1e-4,
            max_drift_rate: 0.05,
        }
    }
}

impl FeedbackConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.damping > 0.0 && self.damping <= 1.0) {
            return Err(Error::config("feedback damping must lie in (0, 1]"));
        }
        if !(self.max_step.is_finite() && self.max_step > 0.0) {
            return Err(Error::config("feedback max_step must be finite and > 0"));
        }
        if !(self.min_drift_rate > 0.0
            && self.max_drift_rate.is_finite()
            && self.min_drift_rate <= self.max_drift_rate)
        {
            return Err(Error::config(
                "feedback drift-rate bounds must satisfy 0 < min <= max < inf",
            ));
        }
        Ok(())
    }
}

/// One feedback decision.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FeedbackStep {
    pub cycle: u64,
    pub score: f64,
    pub threshold: f64,
    /// Log-scale step applied to the drift rate.
    pub step: f64,
    pub drift_rate_before: f64,
    pub drift_rate_after: f64,
}

/// Stateless controller; the pipeline hands it immutable snapshots.
#[derive(Debug, Clone, Copy)]
pub struct FeedbackController {
    cfg: FeedbackConfig,
}

impl FeedbackController {
    pub fn new(cfg: FeedbackConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    /// Next noise model given the current one and the latest score.
    pub fn next(&self, cycle: u64, noise: &NoiseModel, score: &AnomalyScore) -> (NoiseModel, FeedbackStep) {
        let c = &self.cfg;
        let before = noise.drift_rate();
        let step = if score.threshold.is_finite() && score.threshold > 0.0 && score.score.is_finite() {
            (c.damping * (1.0 - score.score / score.threshold)).clamp(-c.max_step, c.max_step)
        } else {
            0.0
        };
        let after = (before * step.exp()).clamp(c.min_drift_rate, c.max_drift_rate);
        (
            noise.with_drift_rate(after),
            FeedbackStep {
                cycle,
                score: score.score,
                threshold: score.threshold,
                step,
                drift_rate_before: before,
                drift_rate_after: after,
            },
        )
    }
}

/// Cooperative cancellation flag, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Where chunks come from.
pub trait ChunkSource {
    /// Category count of emitted observations.
    fn n(&self) -> usize;

    fn is_exhausted(&self) -> bool;

    /// Next chunk of at most `max_len` observations. `sim` is the current simulator snapshot;
    /// sources that do not simulate ignore it.
    fn next_chunk(&mut self, max_len: usize, sim: &SimulatorConfig) -> Result<Vec<Observation>>;

    /// Whether the source follows changes to `sim` (required for feedback).
    fn follows_simulator(&self) -> bool {
        false
    }

    /// Renormalization audit accumulated so far, if the source simulates.
    fn renorm_audit(&self) -> Option<&RenormAudit> {
        None
    }
}

/// Simulator-backed source emitting `length` observations in total.
#[derive(Debug, Clone)]
pub struct SimulatedSource {
    session: SimulatorSession,
    length: u64,
}

impl SimulatedSource {
    pub fn new(cfg: &SimulatorConfig) -> Result<Self> {
        Ok(Self {
            session: SimulatorSession::new(cfg)?,
            length: cfg.length,
        })
    }
}

impl ChunkSource for SimulatedSource {
    fn n(&self) -> usize {
        self.session.last_probabilities().len()
    }

    fn is_exhausted(&self) -> bool {
        self.session.step() >= self.length
    }

    fn next_chunk(&mut self, max_len: usize, sim: &SimulatorConfig) -> Result<Vec<Observation>> {
        let len = (self.length - self.session.step()).min(max_len as u64) as usize;
        self.session.next_chunk(&sim.profile, &sim.noise, len)
    }

    fn follows_simulator(&self) -> bool {
        true
    }

    fn renorm_audit(&self) -> Option<&RenormAudit> {
        Some(self.session.audit())
    }
}

/// Pre-recorded chunks (e.g. ingested measurement records), replayed in order.
#[derive(Debug, Clone)]
pub struct IngestedSource {
    n: usize,
    chunks: VecDeque<Vec<Observation>>,
}

impl IngestedSource {
    pub fn new(n: usize, chunks: Vec<Vec<Observation>>) -> Result<Self> {
        if n <= 1 {
            return Err(Error::config(format!("category count must be at least 2 (got {n})")));
        }
        Ok(Self {
            n,
            chunks: chunks.into(),
        })
    }
}

impl ChunkSource for IngestedSource {
    fn n(&self) -> usize {
        self.n
    }

    fn is_exhausted(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunks are replayed as recorded; `max_len` does not split them.
    fn next_chunk(&mut self, _max_len: usize, _sim: &SimulatorConfig) -> Result<Vec<Observation>> {
        self.chunks
            .pop_front()
            .ok_or_else(|| Error::InsufficientData("source exhausted".to_string()))
    }
}

/// Full pipeline configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PipelineConfig {
    pub simulator: SimulatorConfig,
    pub estimator: EstimatorConfig,
    pub detector: DetectorConfig,
    pub feedback: Option<FeedbackConfig>,
    /// Observations per cycle; also the detector's evaluation cadence.
    pub chunk_size: usize,
    pub budget: Budget,
    pub data_errors: DataErrorPolicy,
    /// Retention cap of the run's stream (`None` keeps everything).
    pub retention: Option<usize>,
}

impl PipelineConfig {
    /// Defaults around a simulator configuration: cumulative Wilson estimator, 0.99 Monte
    /// Carlo null, chunks of 100, no feedback, no budget.
    pub fn new(simulator: SimulatorConfig) -> Self {
        Self {
            estimator: EstimatorConfig::new(simulator.n),
            simulator,
            detector: DetectorConfig::default(),
            feedback: None,
            chunk_size: 100,
            budget: Budget::default(),
            data_errors: DataErrorPolicy::default(),
            retention: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.simulator.validate()?;
        self.estimator.validate()?;
        self.detector.validate()?;
        if self.estimator.n != self.simulator.n {
            return Err(Error::config(format!(
                "estimator expects {} categories, simulator produces {}",
                self.estimator.n, self.simulator.n
            )));
        }
        if self.chunk_size == 0 {
            return Err(Error::config("chunk size must be positive"));
        }
        if let Some(fb) = &self.feedback {
            fb.validate()?;
            if matches!(self.simulator.noise, NoiseModel::None) {
                return Err(Error::config("feedback needs a noise model with a drift rate"));
            }
        }
        if self.retention == Some(0) {
            return Err(Error::config("retention must be at least 1"));
        }
        Ok(())
    }
}

/// Pipeline lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineState {
    Configured,
    Running,
    Completed,
    Failed(Error),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed(_))
    }
}

/// A chunk dropped under [`DataErrorPolicy::Skip`].
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedChunk {
    pub cycle: u64,
    pub error: Error,
}

/// Immutable record of one run.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    config: PipelineConfig,
    final_simulator: SimulatorConfig,
    stream: OutcomeStream,
    estimates: Vec<BetaEstimate>,
    scores: Vec<AnomalyScore>,
    renorm_audit: RenormAudit,
    skipped: Vec<SkippedChunk>,
    feedback: Vec<FeedbackStep>,
    drift_resets: Vec<DriftReset>,
    status: PipelineState,
    partial: bool,
    cycles: u64,
    elapsed: Duration,
}

impl PipelineRun {
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Simulator snapshot after the last feedback step.
    pub fn final_simulator(&self) -> &SimulatorConfig {
        &self.final_simulator
    }

    pub fn stream(&self) -> &OutcomeStream {
        &self.stream
    }

    /// Estimates, `N` per evaluation point, ordered by `window_end`.
    pub fn estimates(&self) -> &[BetaEstimate] {
        &self.estimates
    }

    /// Estimates of the last evaluation point.
    pub fn latest_estimates(&self) -> &[BetaEstimate] {
        let n = self.config.estimator.n;
        &self.estimates[self.estimates.len().saturating_sub(n)..]
    }

    pub fn scores(&self) -> &[AnomalyScore] {
        &self.scores
    }

    pub fn renorm_audit(&self) -> &RenormAudit {
        &self.renorm_audit
    }

    pub fn skipped(&self) -> &[SkippedChunk] {
        &self.skipped
    }

    pub fn feedback(&self) -> &[FeedbackStep] {
        &self.feedback
    }

    pub fn drift_resets(&self) -> &[DriftReset] {
        &self.drift_resets
    }

    /// `Completed` or `Failed(reason)`.
    pub fn status(&self) -> &PipelineState {
        &self.status
    }

    /// Whether the run stopped before its source was exhausted.
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// Cycles executed, including skipped ones.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// First flagged evaluation point.
    pub fn first_flag(&self) -> Option<&AnomalyScore> {
        self.scores.iter().find(|s| s.flagged)
    }

    /// Fraction of flagged evaluation points and its Wilson upper bound (z = 1.96).
    pub fn flag_rate(&self) -> (f64, f64) {
        let flagged = self.scores.iter().filter(|s| s.flagged).count() as u64;
        let total = self.scores.len() as u64;
        let (_lo, hi, _half) = wilson_bounds(flagged, total, 1.96);
        let rate = if total == 0 {
            0.0
        } else {
            flagged as f64 / total as f64
        };
        (rate, hi)
    }

    pub fn observation_rows(&self) -> Vec<ObservationRow> {
        self.stream
            .iter()
            .map(|o| ObservationRow {
                timestamp: o.timestamp(),
                category_index: o.category_index(),
                covariates: o.covariates().cloned(),
            })
            .collect()
    }

    pub fn estimate_rows(&self) -> Vec<EstimateRow> {
        self.estimates
            .iter()
            .map(|e| EstimateRow {
                window_start: e.window_start,
                window_end: e.window_end,
                category_index: e.category_index,
                point_estimate: e.point_estimate,
                variance: e.variance,
                confidence_width: e.confidence_width,
                sample_count: e.sample_count,
                effective_samples: e.effective_samples,
                flags: e.flags,
            })
            .collect()
    }

    pub fn score_rows(&self) -> Vec<ScoreRow> {
        self.scores
            .iter()
            .map(|s| ScoreRow {
                window_end: s.window_end,
                score: s.score,
                threshold: s.threshold,
                flagged: s.flagged,
                top_category: s.contributing_categories.first().copied(),
            })
            .collect()
    }

    /// Every row: observations, then estimates, then scores.
    pub fn rows(&self) -> Vec<ExportRow> {
        let mut rows: Vec<ExportRow> = self
            .observation_rows()
            .into_iter()
            .map(ExportRow::Observation)
            .collect();
        rows.extend(self.estimate_rows().into_iter().map(ExportRow::Estimate));
        rows.extend(self.score_rows().into_iter().map(ExportRow::Score));
        rows
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObservationRow {
    pub timestamp: u64,
    pub category_index: usize,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub covariates: Option<Covariates>,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EstimateRow {
    pub window_start: u64,
    pub window_end: u64,
    pub category_index: usize,
    pub point_estimate: f64,
    pub variance: f64,
    pub confidence_width: f64,
    pub sample_count: u64,
    pub effective_samples: f64,
    pub flags: EstimateFlags,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScoreRow {
    pub window_end: u64,
    pub score: f64,
    pub threshold: f64,
    pub flagged: bool,
    pub top_category: Option<usize>,
}

/// One flattened row of a [`PipelineRun`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum ExportRow {
    Observation(ObservationRow),
    Estimate(EstimateRow),
    Score(ScoreRow),
}

/// A configured pipeline, ready to run once.
pub struct Pipeline {
    cfg: PipelineConfig,
    state: PipelineState,
    source: Box<dyn ChunkSource + Send>,
    stream: OutcomeStream,
    estimator: AdaptiveEstimator,
    detector: AnomalyDetector,
    feedback: Option<FeedbackController>,
    cancel: CancelToken,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state)
            .field("chunk_size", &self.cfg.chunk_size)
            .field("calibrated", &self.detector.is_calibrated())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Validate `cfg` and build a simulator-backed pipeline in the `Configured` state.
    pub fn new(cfg: PipelineConfig) -> Result<Self> {
        cfg.validate()?;
        let source = SimulatedSource::new(&cfg.simulator)?;
        Self::with_source(cfg, Box::new(source))
    }

    /// Build a pipeline over an arbitrary source.
    pub fn with_source(cfg: PipelineConfig, source: Box<dyn ChunkSource + Send>) -> Result<Self> {
        cfg.validate()?;
        if source.n() != cfg.estimator.n {
            return Err(Error::config(format!(
                "source emits {} categories, estimator expects {}",
                source.n(),
                cfg.estimator.n
            )));
        }
        if cfg.feedback.is_some() && !source.follows_simulator() {
            return Err(Error::config("feedback needs a simulator-backed source"));
        }
        let feedback = cfg.feedback.map(FeedbackController::new).transpose()?;
        let stream = match cfg.retention {
            Some(cap) => OutcomeStream::with_retention(cfg.estimator.n, cap)?,
            None => OutcomeStream::new(cfg.estimator.n)?,
        };
        Ok(Self {
            stream,
            estimator: AdaptiveEstimator::new(cfg.estimator)?,
            detector: AnomalyDetector::new(cfg.detector)?,
            state: PipelineState::Configured,
            source,
            feedback,
            cancel: CancelToken::new(),
            cfg,
        })
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// A handle that cancels this pipeline between chunks.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Calibrate the detector for this pipeline's estimator and chunk size through `cache`.
    pub fn calibrate(&mut self, cache: &mut CalibrationCache) -> Result<()> {
        self.detector
            .calibrate(self.cfg.estimator, self.cfg.chunk_size, cache)
    }

    /// Install a precomputed calibration.
    pub fn install_calibration(&mut self, calibration: NullCalibration) -> Result<()> {
        self.detector.install(calibration)
    }

    /// Run to a terminal state.
    pub fn run(mut self) -> PipelineRun {
        let started = Instant::now();
        let mut sim = self.cfg.simulator.clone();
        let mut estimates = Vec::new();
        let mut scores = Vec::new();
        let mut skipped = Vec::new();
        let mut feedback = Vec::new();
        let mut cycles = 0u64;
        let mut partial = false;

        self.transition(PipelineState::Running);
        let status = loop {
            if self.source.is_exhausted() {
                break PipelineState::Completed;
            }
            if self.cancel.is_cancelled() {
                info!(cycles, "pipeline cancelled");
                partial = true;
                break PipelineState::Completed;
            }
            if let Some(err) = self.budget_exhausted(cycles, started) {
                partial = true;
                break PipelineState::Failed(err);
            }

            let outcome = self
                .source
                .next_chunk(self.cfg.chunk_size, &sim)
                .and_then(|chunk| self.process(chunk));
            cycles += 1;
            let (chunk_estimates, score) = match outcome {
                Ok(v) => v,
                Err(e) if e.class() == ErrorClass::Data && self.cfg.data_errors == DataErrorPolicy::Skip => {
                    warn!(cycle = cycles - 1, error = %e, "skipping chunk");
                    skipped.push(SkippedChunk {
                        cycle: cycles - 1,
                        error: e,
                    });
                    continue;
                }
                Err(e) => {
                    partial = true;
                    break PipelineState::Failed(e);
                }
            };
            debug!(
                cycle = cycles - 1,
                window_end = score.window_end,
                score = score.score,
                flagged = score.flagged,
                "cycle complete"
            );

            if let Some(ctl) = &self.feedback {
                let (noise, step) = ctl.next(cycles - 1, &sim.noise, &score);
                sim = SimulatorConfig { noise, ..sim };
                feedback.push(step);
            }
            estimates.extend(chunk_estimates);
            scores.push(score);
        };
        self.transition(status.clone());

        PipelineRun {
            renorm_audit: self.source.renorm_audit().cloned().unwrap_or_default(),
            drift_resets: self.estimator.drift_resets().to_vec(),
            config: self.cfg,
            final_simulator: sim,
            stream: self.stream,
            estimates,
            scores,
            skipped,
            feedback,
            status,
            partial,
            cycles,
            elapsed: started.elapsed(),
        }
    }

    fn process(&mut self, chunk: Vec<Observation>) -> Result<(Vec<BetaEstimate>, AnomalyScore)> {
        if chunk.is_empty() {
            return Err(Error::InsufficientData("source produced an empty chunk".to_string()));
        }
        // Scoring needs a calibration; fail before touching any state.
        if !self.detector.is_calibrated() {
            return Err(Error::UncalibratedDetector);
        }
        // Stream and estimator validate chunks identically and reject without mutating.
        self.stream.ingest(chunk.iter().cloned())?;
        let estimates = self.estimator.update(&chunk)?;
        let score = self.detector.score(&estimates)?;
        Ok((estimates, score))
    }

    fn budget_exhausted(&self, cycles: u64, started: Instant) -> Option<Error> {
        let b = &self.cfg.budget;
        if let Some(max) = b.max_cycles {
            if cycles >= max {
                return Some(Error::BudgetExceeded(format!("cycle limit {max} reached")));
            }
        }
        if let Some(limit) = b.wall_clock {
            if started.elapsed() >= limit {
                return Some(Error::BudgetExceeded(format!(
                    "wall-clock limit {limit:?} reached"
                )));
            }
        }
        None
    }

    fn transition(&mut self, next: PipelineState) {
        match &next {
            PipelineState::Failed(e) => warn!(from = ?self.state, error = %e, "pipeline failed"),
            _ => info!(from = ?self.state, to = ?next, "pipeline state change"),
        }
        self.state = next;
    }
}

/// Calibrate (through `cache`) and run one configuration.
pub fn run_once(cfg: PipelineConfig, cache: &mut CalibrationCache) -> Result<PipelineRun> {
    let mut p = Pipeline::new(cfg)?;
    p.calibrate(cache)?;
    Ok(p.run())
}

/// Run independent configurations. Calibrations are computed once per key through `cache`;
/// with the `parallel` feature the runs themselves execute on the rayon pool.
pub fn run_batch(configs: Vec<PipelineConfig>, cache: &mut CalibrationCache) -> Vec<Result<PipelineRun>> {
    let prepared: Vec<Result<(PipelineConfig, NullCalibration)>> = configs
        .into_iter()
        .map(|cfg| {
            cfg.validate()?;
            let c = cache.get_or_calibrate(cfg.estimator, cfg.chunk_size, cfg.detector.method)?;
            Ok((cfg, c))
        })
        .collect();

    let run = |p: Result<(PipelineConfig, NullCalibration)>| -> Result<PipelineRun> {
        let (cfg, c) = p?;
        let mut pipeline = Pipeline::new(cfg)?;
        pipeline.install_calibration(c)?;
        Ok(pipeline.run())
    };

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        prepared.into_par_iter().map(run).collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        prepared.into_iter().map(run).collect()
    }
}
