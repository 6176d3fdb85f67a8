//! Sampler tuning knobs and the options of a single `mcmc` run.
use crate::error::{MisuseError, Result};
use crate::hyper::Hyperparameter;
#[cfg(feature = "serde-1")]
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Settings that stay fixed for the lifetime of a model.
#[cfg_attr(feature = "serde-1", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct SamplerConfig {
    /// σ of the log-normal Metropolis-Hastings proposal for α
    pub alpha_proposal_scale: f64,
    /// σ for γ
    pub gamma_proposal_scale: f64,
    /// σ for κ
    pub kappa_proposal_scale: f64,
    /// σ for α_φ
    pub alpha_phi_proposal_scale: f64,
    /// Metropolis-Hastings steps per hyperparameter per sweep
    pub mh_steps: usize,
    /// β_k below which a state without any assignments is deleted
    pub prune_threshold: f64,
    /// The smallest mass the reservoir β_u may be left with after a split
    pub reservoir_floor: f64,
    /// No more states than this are materialized during expansion
    pub max_states: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            alpha_proposal_scale: 0.5,
            gamma_proposal_scale: 0.5,
            kappa_proposal_scale: 0.5,
            alpha_phi_proposal_scale: 0.5,
            mh_steps: 1,
            prune_threshold: 1e-12,
            reservoir_floor: 1e-300,
            max_states: 1000,
        }
    }
}

impl SamplerConfig {
    pub fn with_proposal_scale(mut self, which: Hyperparameter, scale: f64) -> Self {
        match which {
            Hyperparameter::Alpha => self.alpha_proposal_scale = scale,
            Hyperparameter::Gamma => self.gamma_proposal_scale = scale,
            Hyperparameter::Kappa => self.kappa_proposal_scale = scale,
            Hyperparameter::AlphaPhi => self.alpha_phi_proposal_scale = scale,
        }
        self
    }

    pub fn with_mh_steps(mut self, mh_steps: usize) -> Self {
        self.mh_steps = mh_steps;
        self
    }

    pub fn with_prune_threshold(mut self, prune_threshold: f64) -> Self {
        self.prune_threshold = prune_threshold;
        self
    }

    pub fn with_reservoir_floor(mut self, reservoir_floor: f64) -> Self {
        self.reservoir_floor = reservoir_floor;
        self
    }

    pub fn with_max_states(mut self, max_states: usize) -> Self {
        self.max_states = max_states;
        self
    }

    pub fn proposal_scale(&self, which: Hyperparameter) -> f64 {
        match which {
            Hyperparameter::Alpha => self.alpha_proposal_scale,
            Hyperparameter::Gamma => self.gamma_proposal_scale,
            Hyperparameter::Kappa => self.kappa_proposal_scale,
            Hyperparameter::AlphaPhi => self.alpha_phi_proposal_scale,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let invalid = |reason: String| -> Result<()> {
            Err(MisuseError::InvalidConfig { reason }.into())
        };
        for &which in Hyperparameter::ALL.iter() {
            let scale = self.proposal_scale(which);
            if !(scale > 0.0) || !scale.is_finite() {
                return invalid(format!("proposal scale for {} is {}", which, scale));
            }
        }
        if !(self.prune_threshold >= 0.0) {
            return invalid(format!("prune threshold {}", self.prune_threshold));
        }
        if !(self.reservoir_floor > 0.0 && self.reservoir_floor < 0.5) {
            return invalid(format!("reservoir floor {}", self.reservoir_floor));
        }
        if self.max_states == 0 {
            return invalid("max_states must be positive".to_string());
        }
        Ok(())
    }
}

/// The arguments of one call to [`HdpHmm::mcmc`](crate::HdpHmm::mcmc).
///
/// ```
/// use hdphmm::McmcOptions;
///
/// let options = McmcOptions::new(500).burn_in(100).save_every(10).ncores(4);
/// assert_eq!(options.n, 500);
/// ```
#[derive(Clone, Debug)]
pub struct McmcOptions {
    /// Total number of sweeps, burn-in included
    pub n: usize,
    /// Sweeps at the start of the run that are not recorded
    pub burn_in: usize,
    /// Record a full parameter snapshot every this many retained sweeps
    pub save_every: usize,
    /// Size of the worker pool
    pub ncores: usize,
    /// Whether to record parameter snapshots at all
    pub snapshot_parameters: bool,
    /// Polled between sweeps. Once set, the run stops and returns what it has.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl McmcOptions {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            burn_in: 0,
            save_every: 1,
            ncores: 1,
            snapshot_parameters: true,
            cancel: None,
        }
    }

    pub fn burn_in(mut self, burn_in: usize) -> Self {
        self.burn_in = burn_in;
        self
    }

    pub fn save_every(mut self, save_every: usize) -> Self {
        self.save_every = save_every;
        self
    }

    pub fn ncores(mut self, ncores: usize) -> Self {
        self.ncores = ncores;
        self
    }

    pub fn snapshot_parameters(mut self, snapshot_parameters: bool) -> Self {
        self.snapshot_parameters = snapshot_parameters;
        self
    }

    pub fn cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.save_every == 0 {
            return Err(MisuseError::ZeroSaveEvery.into());
        }
        if self.ncores == 0 {
            return Err(MisuseError::ZeroCores.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn default_config_is_valid() {
        assert!(SamplerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_scales() {
        let config = SamplerConfig::default().with_proposal_scale(Hyperparameter::Kappa, 0.0);
        match config.validate() {
            Err(Error::Misuse(MisuseError::InvalidConfig { reason })) => {
                assert!(reason.contains("kappa"))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(SamplerConfig::default()
            .with_max_states(0)
            .validate()
            .is_err());
        assert!(SamplerConfig::default()
            .with_reservoir_floor(0.0)
            .validate()
            .is_err());
    }

    #[test]
    fn mcmc_options_validation() {
        assert!(McmcOptions::new(10).validate().is_ok());
        assert_eq!(
            McmcOptions::new(10).save_every(0).validate(),
            Err(Error::Misuse(MisuseError::ZeroSaveEvery))
        );
        assert_eq!(
            McmcOptions::new(10).ncores(0).validate(),
            Err(Error::Misuse(MisuseError::ZeroCores))
        );
    }

    #[cfg(feature = "serde-1")]
    #[test]
    fn config_serde_round_trip() {
        let config = SamplerConfig::default()
            .with_mh_steps(3)
            .with_max_states(50);
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SamplerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
