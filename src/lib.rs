//! This library contains a Rust implementation of the hierarchical Dirichlet process Hidden Markov
//! model (HDP-HMM) for discrete observations, in both its plain and its sticky variant. The number
//! of hidden states is not fixed in advance: states are born and die as the sampler runs.
//! Inference uses beam sampling for the hidden state sequences, the auxiliary table-count scheme
//! for the top-level weights, and Metropolis-Hastings for the concentration hyperparameters.
//!
//! See [`HdpHmm`](struct.HdpHmm.html) for detailed documentation on how to work with this library.
//!
//! Below, the model is fit to a sequence that alternates between two regimes.
//!
//! ```
//! use hdphmm::{HdpHmm, McmcOptions};
//! use rand::SeedableRng;
//! use rand_xoshiro::Xoshiro256PlusPlus;
//!
//! let regimes: Vec<u8> = [0, 1, 0, 1, 1, 0, 2, 3, 3, 2, 3, 2]
//!     .iter()
//!     .cycle()
//!     .take(120)
//!     .cloned()
//!     .collect();
//! let mut rng = Xoshiro256PlusPlus::seed_from_u64(1337);
//! let mut model = HdpHmm::new(&[regimes], true).unwrap();
//! model.initialise(5, &mut rng).unwrap();
//! let diagnostics = model
//!     .mcmc(&McmcOptions::new(50).burn_in(25).save_every(5), &mut rng)
//!     .unwrap();
//! assert!(diagnostics.is_complete());
//! assert_eq!(diagnostics.parameters.len(), 5);
//! let (_labels, hmm) = model.to_finite_hmm().unwrap();
//! assert_eq!(hmm.k(), 4);
//! ```
//!
//! ## Model
//!
//! $$
//! β \sim \mathrm{GEM}(γ), \quad
//! π_j \sim \mathrm{DP}(α + κ, \frac{αβ + κδ_j}{α + κ}), \quad
//! φ_k \sim \mathrm{Dir}(α_φ / |Σ|), \quad
//! z_t \sim π_{z_{t-1}}, \quad
//! y_t \sim φ_{z_t}
//! $$
//!
//! with $κ = 0$ for the non-sticky model. The weights of states that have not been materialized
//! yet are kept in a single reservoir, $β_u$ at the top level and $π_{j,u}$ in every transition
//! row.
//!
//! ## Logging
//!
//! The sampler reports through [`tracing`](https://docs.rs/tracing): a span per `mcmc` call, a
//! `debug` event per sweep, `trace` events for births and deaths, and `warn` events when state
//! expansion is truncated or a sweep fails. No subscriber is installed by the library.
//!
//! ## Notes
//!
//! *A Sticky HDP-HMM with Application to Speaker Diarization* by Fox et al., 2011 and *Beam
//! Sampling for the Infinite Hidden Markov Model* by Van Gael et al., 2008 describe the model and
//! the sampler.
//!
//! I have attempted to make the math notation readable both as rendered HTML and from the source
//! code.
mod beam;
mod config;
mod diagnostics;
mod error;
mod hmm;
mod hyper;
mod label;
mod model;
mod ndarray_utils;
mod registry;
mod rvs;
mod stick;
mod store;

pub use crate::config::{McmcOptions, SamplerConfig};
pub use crate::diagnostics::{Diagnostics, ParameterSnapshot, SweepFailure};
pub use crate::error::{Error, MisuseError, NumericFailure, Result};
pub use crate::hmm::{FiniteHmm, HmmFilterItem, HmmFilterIter, HmmSample, HmmSampleIter};
pub use crate::hyper::{FixedPrior, GammaPrior, Hyperparameter, Hyperparameters, Prior, Priors};
pub use crate::label::{Source, StateLabel};
pub use crate::model::HdpHmm;
pub use crate::registry::{StateParams, StateRegistry, TransitionRow};
pub use crate::stick::StickBreaker;
pub use crate::store::{Alphabet, EmissionCounts, TransitionCounts};

/// Create a fast RNG with reproducible outputs that isn't necessarily cryptographically strong.
#[cfg(test)]
pub(crate) fn new_rng() -> rand_xoshiro::Xoshiro256PlusPlus {
    use rand::SeedableRng;
    rand_xoshiro::Xoshiro256PlusPlus::seed_from_u64(1337)
}
