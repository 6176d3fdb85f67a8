//! The top-level Dirichlet process weights $β$ in their truncated stick-breaking form.
//!
//! Only the sticks of active states are kept explicitly. Everything that has not been broken off
//! yet lives in a single reservoir $β_u$, so that
//!
//! $$\sum_{k} β_k + β_u = 1.$$
use crate::error::{NumericFailure, Result};
use crate::hyper::Hyperparameters;
use crate::label::{Source, StateLabel};
use crate::rvs::{sample_binomial, sample_dirichlet, sample_ln_beta, sample_table_count};
use crate::store::TransitionCounts;
use rand::Rng;
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq)]
pub struct StickBreaker {
    weights: BTreeMap<StateLabel, f64>,
    reservoir: f64,
}

impl Default for StickBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl StickBreaker {
    /// All mass starts in the reservoir.
    pub fn new() -> Self {
        Self {
            weights: BTreeMap::new(),
            reservoir: 1.0,
        }
    }

    /// $β_k$ for an active label.
    pub fn weight(&self, label: StateLabel) -> Option<f64> {
        self.weights.get(&label).cloned()
    }

    /// $β_u$, the mass of every state that has not been materialized.
    pub fn reservoir(&self) -> f64 {
        self.reservoir
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn contains(&self, label: StateLabel) -> bool {
        self.weights.contains_key(&label)
    }

    pub fn labels(&self) -> impl Iterator<Item = StateLabel> + '_ {
        self.weights.keys().cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = (StateLabel, f64)> + '_ {
        self.weights.iter().map(|(&label, &weight)| (label, weight))
    }

    pub fn total(&self) -> f64 {
        self.weights.values().sum::<f64>() + self.reservoir
    }

    /// Break a new stick for `label` off the reservoir: $b \sim \mathrm{Beta}(1, γ)$,
    /// $β_{k★} = b β_u$ and $β_u ← (1 - b) β_u$.
    ///
    /// Both products are formed in log space, so a break that takes nearly all of $β_u$ still leaves
    /// a positive remainder. The reservoir is kept at or above `floor`; a clamp adds at most `floor`
    /// to the total mass. Returns the new weight.
    pub fn split_reservoir<R: Rng + ?Sized>(
        &mut self,
        label: StateLabel,
        gamma: f64,
        floor: f64,
        rng: &mut R,
    ) -> Result<f64> {
        debug_assert!(!self.weights.contains_key(&label));
        if !(self.reservoir > 0.0) {
            return Err(NumericFailure::ReservoirExhausted {
                beta_u: self.reservoir,
            }
            .into());
        }
        let (ln_b, ln_rest) = sample_ln_beta(1.0, gamma, rng)?;
        let ln_reservoir = self.reservoir.ln();
        let broken = (ln_reservoir + ln_b).exp();
        self.reservoir = (ln_reservoir + ln_rest).exp().max(floor);
        self.weights.insert(label, broken);
        Ok(broken)
    }

    /// Redraw the whole of $β$ from $\mathrm{Dir}(\bar m_{·1}, \ldots, \bar m_{·K}, γ)$. States without
    /// any tables end up with a weight of exactly zero. The reservoir is kept at or above `floor`.
    pub fn resample<R: Rng + ?Sized>(
        &mut self,
        tables: &TableCounts,
        gamma: f64,
        floor: f64,
        rng: &mut R,
    ) -> Result<()> {
        let concentrations: Vec<f64> = self
            .weights
            .keys()
            .map(|label| tables.get(*label) as f64)
            .chain(std::iter::once(gamma))
            .collect();
        let draws = sample_dirichlet(&concentrations, rng)?;
        for (weight, draw) in self.weights.values_mut().zip(&draws) {
            *weight = *draw;
        }
        self.reservoir = draws[draws.len() - 1].max(floor);
        Ok(())
    }

    /// Drop a label, returning its mass to the reservoir.
    pub fn remove(&mut self, label: StateLabel) -> Option<f64> {
        let weight = self.weights.remove(&label)?;
        self.reservoir += weight;
        Some(weight)
    }

    /// Labels whose weight has fallen below `threshold`.
    pub fn below(&self, threshold: f64) -> Vec<StateLabel> {
        self.iter()
            .filter(|&(_, weight)| weight < threshold)
            .map(|(label, _)| label)
            .collect()
    }
}

/// The auxiliary table counts $\bar m_{·k}$, summed over the restaurants (transition rows) they
/// were drawn in.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableCounts {
    per_state: BTreeMap<StateLabel, usize>,
}

impl TableCounts {
    pub fn get(&self, label: StateLabel) -> usize {
        self.per_state.get(&label).cloned().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.per_state.values().sum()
    }

    /// The number of states with at least one table.
    pub fn occupied(&self) -> usize {
        self.per_state.values().filter(|&&m| m > 0).count()
    }

    /// Draw $m_{jk}$ for every transition pair with $n_{jk} > 0$ and sum them per destination.
    ///
    /// In a sticky model the self-transition restaurant is seeded with $αβ_j + κ$, and the override
    /// tables are then removed again: $w_j \sim \mathrm{Binomial}(m_{jj}, ρ / (ρ + β_j (1 - ρ)))$ with
    /// $ρ = κ / (α + κ)$, leaving $\bar m_{jj} = m_{jj} - w_j$.
    pub fn sample<R: Rng + ?Sized>(
        transitions: &TransitionCounts,
        stick: &StickBreaker,
        hyper: &Hyperparameters,
        rng: &mut R,
    ) -> Result<Self> {
        let mut per_state = BTreeMap::new();
        let rho = if hyper.kappa > 0.0 {
            hyper.kappa / (hyper.alpha + hyper.kappa)
        } else {
            0.0
        };
        for (source, label, n) in transitions.iter() {
            let beta = stick.weight(label).unwrap_or(0.0);
            let is_self = source == Source::State(label);
            let concentration = hyper.alpha * beta + if is_self { hyper.kappa } else { 0.0 };
            let mut m = sample_table_count(concentration, n, rng);
            if is_self && rho > 0.0 {
                let override_prob = rho / (rho + beta * (1.0 - rho));
                m -= sample_binomial(m, override_prob, rng)?;
            }
            *per_state.entry(label).or_insert(0) += m;
        }
        Ok(Self { per_state })
    }
}
