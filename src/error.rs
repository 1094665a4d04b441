//! Error taxonomy shared by every stage of the pipeline.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error class, used by the orchestrator to pick a recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorClass {
    /// Detected at setup; aborts before any data is produced.
    Config,
    /// Surfaced per chunk; may be skipped or abort depending on policy.
    Data,
    /// Fatal to any run that hits it.
    Fatal,
    /// Resource budget exhausted; the run ends with partial results.
    Budget,
}

/// Errors produced by the simulator, estimator, detector and orchestrator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A configuration value is out of its domain (e.g. `N <= 1`, `length == 0`).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A bias profile cannot be turned into a valid probability vector.
    #[error("invalid bias profile at step {step}: {reason}")]
    InvalidProfile {
        /// Simulation step at which the profile was evaluated.
        step: u64,
        /// What went wrong.
        reason: String,
    },

    /// An ingested observation violates the stream contract.
    #[error("invalid observation at timestamp {timestamp}: {reason}")]
    InvalidObservation {
        /// Timestamp of the rejected record.
        timestamp: u64,
        /// What went wrong.
        reason: String,
    },

    /// An estimate was requested over zero observations.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// `window_end < window_start`.
    #[error("invalid window: end {end} precedes start {start}")]
    InvalidWindow {
        /// Requested start.
        start: u64,
        /// Requested end.
        end: u64,
    },

    /// Scoring was attempted before a null calibration was installed.
    #[error("anomaly detector used before null calibration")]
    UncalibratedDetector,

    /// The cycle count or wall-clock budget ran out.
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),
}

impl Error {
    /// The recovery class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidConfig(_) | Error::InvalidProfile { .. } => ErrorClass::Config,
            Error::InvalidObservation { .. }
            | Error::InsufficientData(_)
            | Error::InvalidWindow { .. } => ErrorClass::Data,
            Error::UncalibratedDetector => ErrorClass::Fatal,
            Error::BudgetExceeded(_) => ErrorClass::Budget,
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::InvalidConfig(msg.into())
    }

    pub(crate) fn profile(step: u64, reason: impl Into<String>) -> Self {
        Error::InvalidProfile {
            step,
            reason: reason.into(),
        }
    }

    pub(crate) fn observation(timestamp: u64, reason: impl Into<String>) -> Self {
        Error::InvalidObservation {
            timestamp,
            reason: reason.into(),
        }
    }
}

impl From<logp::Error> for Error {
    fn from(e: logp::Error) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
