//! What an `mcmc` run reports back.
use crate::error::Error;
use crate::hyper::{Hyperparameter, Hyperparameters};
use crate::label::StateLabel;
#[cfg(feature = "serde-1")]
use serde::Serialize;
use std::collections::BTreeMap;

/// A full copy of $π$, $φ$ and $β$ at one retained sweep.
#[cfg_attr(feature = "serde-1", derive(Serialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterSnapshot<S: Ord> {
    pub sweep: usize,
    /// The start row, $π_{start,k}$
    pub p_initial: BTreeMap<StateLabel, f64>,
    /// $π_{j,k}$ for every active $j$ and $k$
    pub p_transition: BTreeMap<StateLabel, BTreeMap<StateLabel, f64>>,
    /// $φ_{k,o}$ keyed by the caller's symbols
    pub p_emission: BTreeMap<StateLabel, BTreeMap<S, f64>>,
    pub beta: BTreeMap<StateLabel, f64>,
    pub beta_reservoir: f64,
}

/// The sweep a run stopped at and the reason.
#[cfg_attr(feature = "serde-1", derive(Serialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct SweepFailure {
    pub sweep: usize,
    pub error: Error,
}

/// Per-sweep traces of a run. Scalar traces have one entry per retained sweep; `parameters` has
/// one entry per saved snapshot.
#[cfg_attr(feature = "serde-1", derive(Serialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostics<S: Ord> {
    /// The (zero-based) index of each retained sweep
    pub sweeps: Vec<usize>,
    pub state_count: Vec<usize>,
    /// $\ln p(y, z | π, φ)$
    pub log_likelihood: Vec<f64>,
    /// $-\ln p(y, z, π, φ, β, θ)$: the negative log joint density of the data, the assignments, the
    /// current parameter draws and the hyperparameters
    pub neglogp: Vec<f64>,
    pub hyperparameters: Vec<Hyperparameters>,
    pub parameters: Vec<ParameterSnapshot<S>>,
    /// Fraction of accepted Metropolis-Hastings proposals per hyperparameter. Hyperparameters that
    /// were held fixed do not appear.
    pub acceptance: BTreeMap<Hyperparameter, f64>,
    /// Sweeps that ran to completion, burn-in included
    pub sweeps_completed: usize,
    pub failure: Option<SweepFailure>,
    pub cancelled: bool,
}

impl<S: Ord> Default for Diagnostics<S> {
    fn default() -> Self {
        Self {
            sweeps: vec![],
            state_count: vec![],
            log_likelihood: vec![],
            neglogp: vec![],
            hyperparameters: vec![],
            parameters: vec![],
            acceptance: BTreeMap::new(),
            sweeps_completed: 0,
            failure: None,
            cancelled: false,
        }
    }
}

impl<S: Ord> Diagnostics<S> {
    /// The number of retained sweeps.
    pub fn len(&self) -> usize {
        self.sweeps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sweeps.is_empty()
    }

    /// True when the run neither failed nor was cancelled.
    pub fn is_complete(&self) -> bool {
        self.failure.is_none() && !self.cancelled
    }

    pub fn mean_state_count(&self) -> Option<f64> {
        if self.state_count.is_empty() {
            None
        } else {
            Some(self.state_count.iter().sum::<usize>() as f64 / self.state_count.len() as f64)
        }
    }

    /// The trace of a single hyperparameter.
    pub fn trace(&self, which: Hyperparameter) -> Vec<f64> {
        self.hyperparameters
            .iter()
            .map(|hyper| hyper.get(which))
            .collect()
    }
}

/// Counts Metropolis-Hastings proposals and acceptances over a run.
#[derive(Clone, Debug, Default)]
pub(crate) struct AcceptanceTally {
    proposed: BTreeMap<Hyperparameter, usize>,
    accepted: BTreeMap<Hyperparameter, usize>,
}

impl AcceptanceTally {
    pub fn record(&mut self, which: Hyperparameter, accepted: bool) {
        *self.proposed.entry(which).or_insert(0) += 1;
        if accepted {
            *self.accepted.entry(which).or_insert(0) += 1;
        }
    }

    pub fn merge(&mut self, other: &AcceptanceTally) {
        for (&which, &n) in &other.proposed {
            *self.proposed.entry(which).or_insert(0) += n;
        }
        for (&which, &n) in &other.accepted {
            *self.accepted.entry(which).or_insert(0) += n;
        }
    }

    pub fn rates(&self) -> BTreeMap<Hyperparameter, f64> {
        self.proposed
            .iter()
            .map(|(&which, &n)| {
                let accepted = self.accepted.get(&which).cloned().unwrap_or(0);
                (which, accepted as f64 / n as f64)
            })
            .collect()
    }
}
