//! Error types returned by the sampler.

#[cfg(feature = "serde-1")]
use serde::Serialize;
use thiserror::Error;

/// Errors raised by the public entry points.
#[cfg_attr(feature = "serde-1", derive(Serialize))]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The caller used the API incorrectly. Raised synchronously, before any state changes.
    #[error("misuse: {0}")]
    Misuse(#[from] MisuseError),

    /// The sampler hit a numerical dead end it cannot escape.
    #[error("numeric failure: {0}")]
    Numeric(#[from] NumericFailure),

    /// An internal invariant was broken.
    #[error("consistency failure: {0}")]
    Consistency(String),
}

#[cfg_attr(feature = "serde-1", derive(Serialize))]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MisuseError {
    #[error("mcmc was called before initialise")]
    NotInitialised,

    #[error("at least one observation sequence is required")]
    EmptyInput,

    #[error("sequence {index} is empty")]
    EmptySequence { index: usize },

    #[error("symbol in sequence {index} is not part of the alphabet")]
    UnknownSymbol { index: usize },

    #[error("initialise needs at least one seed state")]
    ZeroInitialStates,

    #[error("save_every must be positive")]
    ZeroSaveEvery,

    #[error("ncores must be positive")]
    ZeroCores,

    #[error("a non-zero kappa prior was supplied for a non-sticky model")]
    KappaPriorWithoutStickiness,

    #[error("invalid prior for {name}: {reason}")]
    InvalidPrior { name: &'static str, reason: String },

    #[error("invalid sampler configuration: {reason}")]
    InvalidConfig { reason: String },
}

#[cfg_attr(feature = "serde-1", derive(Serialize))]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NumericFailure {
    /// Every state has zero forward mass at some time step under the current slice.
    #[error("forward mass underflowed in sequence {sequence} at time {time}")]
    ForwardUnderflow { sequence: usize, time: usize },

    #[error("reservoir mass {beta_u:e} cannot be split any further")]
    ReservoirExhausted { beta_u: f64 },

    #[error("Metropolis-Hastings ratio for {parameter} is not finite")]
    NonFiniteRatio { parameter: &'static str },

    #[error("invalid parameters for {what}")]
    InvalidDistribution { what: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;
