//! Synthetic outcome streams with injected, possibly drifting, bias.
//!
//! Each step evaluates the [`BiasProfile`], applies the [`NoiseModel`], renormalizes the result
//! into a probability vector (see [`crate::law::renormalize`]) and draws one category by
//! inverse-CDF sampling. Everything random flows from one `StdRng` seeded with
//! `seed_from_u64`, so identical seeds give identical streams.
//!
//! Renormalization is never silent: every stretch of steps that needed clipping or rescaling is
//! recorded in a [`RenormAudit`] and logged once when it starts.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::law::{renormalize, RenormConfig, Renormalized};
use crate::profile::{BiasProfile, NoiseModel};
use crate::stream::{Observation, OutcomeStream};

/// Full simulator configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SimulatorConfig {
    /// Category count `N`.
    pub n: usize,
    /// Number of observations to generate.
    pub length: u64,
    pub profile: BiasProfile,
    pub noise: NoiseModel,
    pub seed: u64,
    pub renorm: RenormConfig,
    /// Keep the per-step probability vectors in the output (memory: `length × N`).
    pub trace_probabilities: bool,
}

impl SimulatorConfig {
    /// Configuration with default renormalization and no probability trace.
    pub fn new(n: usize, length: u64, profile: BiasProfile, noise: NoiseModel, seed: u64) -> Self {
        Self {
            n,
            length,
            profile,
            noise,
            seed,
            renorm: RenormConfig::default(),
            trace_probabilities: false,
        }
    }

    /// Check every parameter, and that the noiseless profile renormalizes at every step.
    ///
    /// Fails with [`Error::InvalidConfig`] or [`Error::InvalidProfile`].
    pub fn validate(&self) -> Result<()> {
        if self.n <= 1 {
            return Err(Error::config(format!(
                "category count must be at least 2 (got {})",
                self.n
            )));
        }
        if self.length == 0 {
            return Err(Error::config("length must be positive"));
        }
        if self.profile.n() != self.n {
            return Err(Error::config(format!(
                "profile has {} categories, simulator expects {}",
                self.profile.n(),
                self.n
            )));
        }
        self.noise.validate()?;
        self.renorm.validate()?;
        let mut beta = Vec::with_capacity(self.n);
        for step in self.profile.validation_steps(self.length) {
            self.profile.beta_into(step, &mut beta);
            renormalize(self.n, &beta, step, self.renorm)?;
        }
        Ok(())
    }
}

/// A run of consecutive steps that shared the same renormalization adjustment.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RenormEvent {
    pub first_step: u64,
    pub last_step: u64,
    /// Categories clipped to the `(-1, N-1]` range during this run.
    pub clipped: Vec<usize>,
    pub rescaled: bool,
    /// Raw mass `Σ(1 + β_i)/N` at `first_step`.
    pub raw_mass: f64,
    /// Largest `|clipped_mass - 1|` seen during this run.
    pub max_mass_deviation: f64,
}

/// Audit trail of every renormalization the simulator performed.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RenormAudit {
    /// Steps whose probabilities were rescaled.
    pub steps_rescaled: u64,
    /// Steps where at least one category was clipped.
    pub steps_clipped: u64,
    /// Run-length encoded adjustment history.
    pub events: Vec<RenormEvent>,
}

impl RenormAudit {
    /// Whether no step was adjusted.
    pub fn is_clean(&self) -> bool {
        self.events.is_empty()
    }

    fn record(&mut self, step: u64, r: &Renormalized) {
        if !r.is_adjusted() {
            return;
        }
        if r.rescaled {
            self.steps_rescaled += 1;
        }
        if !r.clipped.is_empty() {
            self.steps_clipped += 1;
        }
        let deviation = (r.clipped_mass - 1.0).abs();
        if let Some(last) = self.events.last_mut() {
            if last.last_step + 1 == step && last.clipped == r.clipped && last.rescaled == r.rescaled
            {
                last.last_step = step;
                last.max_mass_deviation = last.max_mass_deviation.max(deviation);
                return;
            }
        }
        warn!(
            step,
            raw_mass = r.raw_mass,
            clipped = ?r.clipped,
            rescaled = r.rescaled,
            "bias profile renormalized"
        );
        self.events.push(RenormEvent {
            first_step: step,
            last_step: step,
            clipped: r.clipped.clone(),
            rescaled: r.rescaled,
            raw_mass: r.raw_mass,
            max_mass_deviation: deviation,
        });
    }
}

/// Result of a one-shot simulation.
#[derive(Debug, Clone)]
pub struct SimulationOutput {
    pub stream: OutcomeStream,
    pub audit: RenormAudit,
    /// Probabilities used at the final step.
    pub final_probabilities: Vec<f64>,
    /// Per-step probabilities, when `trace_probabilities` was set.
    pub probabilities: Option<Vec<Vec<f64>>>,
}

impl SimulationOutput {
    /// β implied by the final step's probabilities: the realized ground truth after
    /// renormalization.
    pub fn final_realized_beta(&self) -> Vec<f64> {
        let n = self.final_probabilities.len();
        self.final_probabilities
            .iter()
            .map(|&p| crate::law::beta_from_frequency(n, p))
            .collect()
    }
}

/// Stateful generator that can emit a stream in chunks.
///
/// The profile and noise model are passed per chunk, so a caller may swap them between chunks
/// (the feedback loop does). The RNG, random-walk state and step counter carry over: with an
/// unchanged configuration, chunked generation reproduces one-shot generation exactly.
#[derive(Debug, Clone)]
pub struct SimulatorSession {
    n: usize,
    renorm: RenormConfig,
    rng: StdRng,
    walk: Vec<f64>,
    step: u64,
    beta: Vec<f64>,
    audit: RenormAudit,
    last_probs: Vec<f64>,
    trace: Option<Vec<Vec<f64>>>,
}

impl SimulatorSession {
    /// Start a session from a validated configuration.
    pub fn new(cfg: &SimulatorConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self::from_parts(cfg.n, cfg.seed, cfg.renorm, cfg.trace_probabilities))
    }

    pub(crate) fn from_parts(n: usize, seed: u64, renorm: RenormConfig, trace: bool) -> Self {
        Self {
            n,
            renorm,
            rng: StdRng::seed_from_u64(seed),
            walk: vec![0.0; n],
            step: 0,
            beta: Vec::with_capacity(n),
            audit: RenormAudit::default(),
            last_probs: vec![1.0 / (n as f64); n],
            trace: trace.then(Vec::new),
        }
    }

    /// Number of steps generated so far (also the next timestamp).
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn audit(&self) -> &RenormAudit {
        &self.audit
    }

    /// Probabilities used at the most recent step (uniform before the first step).
    pub fn last_probabilities(&self) -> &[f64] {
        &self.last_probs
    }

    /// Generate `len` observations, timestamped by step number.
    pub fn next_chunk(
        &mut self,
        profile: &BiasProfile,
        noise: &NoiseModel,
        len: usize,
    ) -> Result<Vec<Observation>> {
        if profile.n() != self.n {
            return Err(Error::config(format!(
                "profile has {} categories, session expects {}",
                profile.n(),
                self.n
            )));
        }
        noise.validate()?;
        let dist = match *noise {
            NoiseModel::None => None,
            NoiseModel::RandomWalk { drift_rate, .. } => Some(normal(drift_rate)?),
            NoiseModel::Jitter { sigma } => Some(normal(sigma)?),
        };

        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            let step = self.step;
            profile.beta_into(step, &mut self.beta);
            match (noise, &dist) {
                (NoiseModel::RandomWalk { bound, .. }, Some(d)) => {
                    for w in self.walk.iter_mut() {
                        *w += d.sample(&mut self.rng);
                    }
                    let mean = self.walk.iter().sum::<f64>() / (self.n as f64);
                    for (w, b) in self.walk.iter_mut().zip(self.beta.iter_mut()) {
                        *w = (*w - mean).clamp(-bound, *bound);
                        *b += *w;
                    }
                }
                (NoiseModel::Jitter { .. }, Some(d)) => {
                    for b in self.beta.iter_mut() {
                        *b += d.sample(&mut self.rng);
                    }
                }
                _ => {}
            }

            let r = renormalize(self.n, &self.beta, step, self.renorm)?;
            self.audit.record(step, &r);
            let category = draw_category(&r.probs, self.rng.gen::<f64>());
            out.push(Observation::new(category, step));
            if let Some(trace) = self.trace.as_mut() {
                trace.push(r.probs.clone());
            }
            self.last_probs = r.probs;
            self.step += 1;
        }
        debug!(step = self.step, len, "simulated chunk");
        Ok(out)
    }

    fn into_output(self, stream: OutcomeStream) -> SimulationOutput {
        SimulationOutput {
            stream,
            audit: self.audit,
            final_probabilities: self.last_probs,
            probabilities: self.trace,
        }
    }
}

fn normal(scale: f64) -> Result<Normal<f64>> {
    Normal::new(0.0, scale).map_err(|e| Error::config(format!("invalid noise scale: {e}")))
}

/// Inverse-CDF draw: the first category whose cumulative probability exceeds `u`.
///
/// Falls back to the last category with positive mass to absorb floating-point shortfall.
pub(crate) fn draw_category(probs: &[f64], u: f64) -> usize {
    let mut acc = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        acc += p;
        if u < acc {
            return i;
        }
    }
    probs.iter().rposition(|&p| p > 0.0).unwrap_or(0)
}

/// One-shot simulator.
#[derive(Debug, Clone, Copy, Default)]
pub struct Simulator;

impl Simulator {
    /// Generate a complete stream from `cfg`.
    pub fn run(cfg: &SimulatorConfig) -> Result<SimulationOutput> {
        let mut session = SimulatorSession::new(cfg)?;
        let len = usize::try_from(cfg.length)
            .map_err(|_| Error::config("length does not fit in memory"))?;
        let obs = session.next_chunk(&cfg.profile, &cfg.noise, len)?;
        let mut stream = OutcomeStream::new(cfg.n)?;
        stream.ingest(obs)?;
        Ok(session.into_output(stream))
    }
}

/// `generate(N, length, bias_profile, noise_model, seed) → OutcomeStream`.
pub fn generate(
    n: usize,
    length: u64,
    profile: &BiasProfile,
    noise: NoiseModel,
    seed: u64,
) -> Result<OutcomeStream> {
    let cfg = SimulatorConfig::new(n, length, profile.clone(), noise, seed);
    Ok(Simulator::run(&cfg)?.stream)
}
