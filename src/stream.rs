//! Outcome stream data model: immutable observations in an append-only sequence.

use std::collections::{BTreeMap, VecDeque};

use crate::error::{Error, Result};

/// Named numeric side-channel values attached to an observation.
pub type Covariates = BTreeMap<String, f64>;

/// A single recorded outcome.
///
/// Fields are private: once constructed an observation cannot be mutated.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Observation {
    category_index: usize,
    timestamp: u64,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    covariates: Option<Covariates>,
}

impl Observation {
    /// Create an observation without covariates.
    pub fn new(category_index: usize, timestamp: u64) -> Self {
        Self {
            category_index,
            timestamp,
            covariates: None,
        }
    }

    /// Attach covariates (builder style, consumes `self`).
    pub fn with_covariates(mut self, covariates: Covariates) -> Self {
        self.covariates = Some(covariates);
        self
    }

    pub fn category_index(&self) -> usize {
        self.category_index
    }

    /// Monotonic sequence number or wall-clock milliseconds; the stream only requires
    /// that it never decreases.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn covariates(&self) -> Option<&Covariates> {
        self.covariates.as_ref()
    }

    /// Look up a single covariate by name.
    pub fn covariate(&self, name: &str) -> Option<f64> {
        self.covariates.as_ref().and_then(|c| c.get(name).copied())
    }
}

/// Inclusive timestamp range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeWindow {
    start: u64,
    end: u64,
}

impl TimeWindow {
    /// Fails with [`Error::InvalidWindow`] when `end < start`.
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if end < start {
            return Err(Error::InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn contains(&self, timestamp: u64) -> bool {
        self.start <= timestamp && timestamp <= self.end
    }
}

/// Ordered, append-only sequence of observations over a fixed category count `N`.
///
/// Invariants:
/// - every stored `category_index` is in `[0, N)`;
/// - timestamps never decrease;
/// - `N` never changes.
///
/// An optional retention cap bounds memory for streaming use: once the cap is reached the
/// oldest observation is evicted on each push. Callers feeding an incremental estimator have
/// already consumed evicted observations, so they are outside every active window.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OutcomeStream {
    n: usize,
    retention: Option<usize>,
    buf: VecDeque<Observation>,
    evicted: u64,
    last_timestamp: Option<u64>,
}

impl OutcomeStream {
    /// Create an empty, unbounded stream over `n` categories (`n >= 2`).
    pub fn new(n: usize) -> Result<Self> {
        if n <= 1 {
            return Err(Error::config(format!(
                "category count must be at least 2 (got {n})"
            )));
        }
        Ok(Self {
            n,
            retention: None,
            buf: VecDeque::new(),
            evicted: 0,
            last_timestamp: None,
        })
    }

    /// Create a stream retaining at most `cap` observations (minimum 1).
    pub fn with_retention(n: usize, cap: usize) -> Result<Self> {
        let mut s = Self::new(n)?;
        s.retention = Some(cap.max(1));
        Ok(s)
    }

    /// Declared category count.
    pub fn n(&self) -> usize {
        self.n
    }

    pub fn retention(&self) -> Option<usize> {
        self.retention
    }

    /// Number of observations currently retained.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Number of observations evicted by retention or [`OutcomeStream::evict_before`].
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Total observations ever appended (retained + evicted).
    pub fn total_appended(&self) -> u64 {
        self.evicted + self.buf.len() as u64
    }

    /// Timestamp of the most recent observation.
    pub fn last_timestamp(&self) -> Option<u64> {
        self.last_timestamp
    }

    /// Timestamp a simulator should assign to its next observation.
    pub fn next_timestamp(&self) -> u64 {
        self.last_timestamp.map_or(0, |t| t.saturating_add(1))
    }

    /// Iterate over retained observations (oldest to newest).
    pub fn iter(&self) -> impl Iterator<Item = &Observation> + '_ {
        self.buf.iter()
    }

    /// Iterate over retained observations whose timestamp lies in `window`.
    pub fn window(&self, window: TimeWindow) -> impl Iterator<Item = &Observation> + '_ {
        self.buf.iter().filter(move |o| window.contains(o.timestamp))
    }

    /// Retained category labels, oldest first.
    pub fn categories(&self) -> Vec<usize> {
        self.buf.iter().map(|o| o.category_index).collect()
    }

    /// Per-category counts over retained observations.
    pub fn counts(&self) -> Vec<u64> {
        let mut c = vec![0u64; self.n];
        for o in &self.buf {
            c[o.category_index] += 1;
        }
        c
    }

    /// Check an observation against the stream contract without appending it.
    pub fn validate(&self, obs: &Observation) -> Result<()> {
        Self::check(self.n, self.last_timestamp, obs)
    }

    fn check(n: usize, last: Option<u64>, obs: &Observation) -> Result<()> {
        if obs.category_index >= n {
            return Err(Error::observation(
                obs.timestamp,
                format!("category {} outside [0, {n})", obs.category_index),
            ));
        }
        if let Some(last) = last {
            if obs.timestamp < last {
                return Err(Error::observation(
                    obs.timestamp,
                    format!("timestamp precedes previous observation at {last}"),
                ));
            }
        }
        if let Some(cov) = &obs.covariates {
            if let Some((name, _)) = cov.iter().find(|(_, v)| !v.is_finite()) {
                return Err(Error::observation(
                    obs.timestamp,
                    format!("covariate `{name}` is not finite"),
                ));
            }
        }
        Ok(())
    }

    /// Append one observation, rejecting it with [`Error::InvalidObservation`] if it breaks
    /// the stream contract. Out-of-range categories are never clamped.
    pub fn push(&mut self, obs: Observation) -> Result<()> {
        self.validate(&obs)?;
        self.push_unchecked(obs);
        Ok(())
    }

    fn push_unchecked(&mut self, obs: Observation) {
        if let Some(cap) = self.retention {
            if self.buf.len() == cap {
                self.buf.pop_front();
                self.evicted += 1;
            }
        }
        self.last_timestamp = Some(obs.timestamp);
        self.buf.push_back(obs);
    }

    /// Ingest a batch of external records.
    ///
    /// All-or-nothing: every record is validated (in order, against the running timestamp)
    /// before any is appended, so a rejected batch leaves the stream untouched.
    /// Returns the number of appended records.
    pub fn ingest<I>(&mut self, records: I) -> Result<usize>
    where
        I: IntoIterator<Item = Observation>,
    {
        let records: Vec<Observation> = records.into_iter().collect();
        let mut last = self.last_timestamp;
        for obs in &records {
            Self::check(self.n, last, obs)?;
            last = Some(obs.timestamp);
        }
        let appended = records.len();
        for obs in records {
            self.push_unchecked(obs);
        }
        Ok(appended)
    }

    /// Evict every retained observation older than `timestamp`.
    ///
    /// Callers pass the earliest start of their active estimator windows.
    pub fn evict_before(&mut self, timestamp: u64) -> usize {
        let mut k = 0usize;
        while self.buf.front().is_some_and(|o| o.timestamp < timestamp) {
            self.buf.pop_front();
            k += 1;
        }
        self.evicted += k as u64;
        k
    }
}
