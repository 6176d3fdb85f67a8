//! The active states and the parameters each of them owns: a transition row $π_k$ and an emission
//! distribution $φ_k$.
use crate::error::{Error, Result};
use crate::hyper::Hyperparameters;
use crate::label::{LabelPool, Source, StateLabel};
use crate::rvs::{sample_dirichlet, sample_ln_beta};
use crate::stick::StickBreaker;
use crate::store::{EmissionCounts, TransitionCounts};
use ndarray::prelude::*;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::collections::BTreeMap;
use tracing::trace;

/// A distribution over the active labels plus the reservoir slot $π_{j,u}$.
#[derive(Clone, Debug, PartialEq)]
pub struct TransitionRow {
    weights: BTreeMap<StateLabel, f64>,
    reservoir: f64,
}

impl TransitionRow {
    /// $π_{j,k}$, or zero for a label this row has no column for.
    pub fn prob(&self, label: StateLabel) -> f64 {
        self.weights.get(&label).cloned().unwrap_or(0.0)
    }

    /// $π_{j,u}$
    pub fn reservoir(&self) -> f64 {
        self.reservoir
    }

    pub fn sum(&self) -> f64 {
        self.weights.values().sum::<f64>() + self.reservoir
    }

    pub fn iter(&self) -> impl Iterator<Item = (StateLabel, f64)> + '_ {
        self.weights.iter().map(|(&label, &p)| (label, p))
    }

    /// Hand a fraction $b$ of the reservoir to a new column, given $\ln b$ and $\ln(1 - b)$.
    fn split_reservoir(&mut self, label: StateLabel, ln_b: f64, ln_rest: f64) {
        let ln_reservoir = self.reservoir.ln();
        self.weights.insert(label, (ln_reservoir + ln_b).exp());
        self.reservoir = (ln_reservoir + ln_rest).exp();
    }

    fn fold_into_reservoir(&mut self, label: StateLabel) {
        if let Some(p) = self.weights.remove(&label) {
            self.reservoir += p;
        }
    }
}

/// Everything a single active state owns.
#[derive(Clone, Debug, PartialEq)]
pub struct StateParams {
    pub transition: TransitionRow,
    pub emission: Array1<f64>,
}

/// Draw $π_j \sim \mathrm{Dir}(αβ_1 + κ1[j=1] + n_{j1}, \ldots, αβ_K + κ1[j=K] + n_{jK}, αβ_u)$.
///
/// Without counts this is the prior; the diagonal boost only applies to state rows.
pub fn draw_transition_row<R: Rng + ?Sized>(
    source: Source,
    stick: &StickBreaker,
    hyper: &Hyperparameters,
    counts: Option<&BTreeMap<StateLabel, usize>>,
    rng: &mut R,
) -> Result<TransitionRow> {
    let labels: Vec<StateLabel> = stick.labels().collect();
    let concentrations: Vec<f64> = stick
        .iter()
        .map(|(label, beta)| {
            let mut c = hyper.alpha * beta;
            if source == Source::State(label) {
                c += hyper.kappa;
            }
            if let Some(n) = counts.and_then(|row| row.get(&label)) {
                c += *n as f64;
            }
            c
        })
        .chain(std::iter::once(hyper.alpha * stick.reservoir()))
        .collect();
    let draws = sample_dirichlet(&concentrations, rng)?;
    Ok(TransitionRow {
        weights: labels.into_iter().zip(draws.iter().cloned()).collect(),
        reservoir: draws[draws.len() - 1],
    })
}

/// Draw $φ_k \sim \mathrm{Dir}(α_φ / |Σ| + m_{k,1}, \ldots, α_φ / |Σ| + m_{k,|Σ|})$.
pub fn draw_emission<R: Rng + ?Sized>(
    alpha_phi: f64,
    alphabet_size: usize,
    counts: Option<&[usize]>,
    rng: &mut R,
) -> Result<Array1<f64>> {
    let base = alpha_phi / alphabet_size as f64;
    let concentrations: Vec<f64> = (0..alphabet_size)
        .map(|o| base + counts.map_or(0, |c| c[o]) as f64)
        .collect();
    Ok(Array1::from_vec(sample_dirichlet(&concentrations, rng)?))
}

/// Owns the label pool, the start row, and the parameters of every active state.
///
/// The set of active labels always matches the labels of the [`StickBreaker`] it is used with, and
/// every row carries exactly one column per active label.
#[derive(Clone, Debug)]
pub struct StateRegistry {
    pool: LabelPool,
    start: TransitionRow,
    states: BTreeMap<StateLabel, StateParams>,
    alphabet_size: usize,
}

impl StateRegistry {
    pub fn new(alphabet_size: usize) -> Self {
        Self {
            pool: LabelPool::default(),
            start: TransitionRow {
                weights: BTreeMap::new(),
                reservoir: 1.0,
            },
            states: BTreeMap::new(),
            alphabet_size,
        }
    }

    pub fn alphabet_size(&self) -> usize {
        self.alphabet_size
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn contains(&self, label: StateLabel) -> bool {
        self.states.contains_key(&label)
    }

    pub fn labels(&self) -> impl Iterator<Item = StateLabel> + '_ {
        self.states.keys().cloned()
    }

    pub fn get(&self, label: StateLabel) -> Option<&StateParams> {
        self.states.get(&label)
    }

    pub fn iter(&self) -> impl Iterator<Item = (StateLabel, &StateParams)> + '_ {
        self.states.iter().map(|(&label, params)| (label, params))
    }

    /// The transition row of `source`.
    pub fn row(&self, source: Source) -> Option<&TransitionRow> {
        match source {
            Source::Start => Some(&self.start),
            Source::State(label) => self.states.get(&label).map(|params| &params.transition),
        }
    }

    /// Every transition row, start first.
    pub fn rows(&self) -> impl Iterator<Item = (Source, &TransitionRow)> + '_ {
        std::iter::once((Source::Start, &self.start)).chain(
            self.states
                .iter()
                .map(|(&label, params)| (Source::State(label), &params.transition)),
        )
    }

    /// Materialize a fresh state.
    ///
    /// The new stick is split off $β_u$, every existing row hands it the fraction
    /// $b_j \sim \mathrm{Beta}(αβ_{k★}, αβ_u)$ of its reservoir, and the new state's own row and
    /// emission distribution are drawn from their priors.
    pub fn birth<R: Rng + ?Sized>(
        &mut self,
        stick: &mut StickBreaker,
        hyper: &Hyperparameters,
        floor: f64,
        rng: &mut R,
    ) -> Result<StateLabel> {
        let label = self.pool.allocate();
        let beta = match stick.split_reservoir(label, hyper.gamma, floor, rng) {
            Ok(beta) => beta,
            Err(e) => {
                self.pool.release(label);
                return Err(e);
            }
        };
        let beta_u = stick.reservoir();
        let rows = std::iter::once(&mut self.start)
            .chain(self.states.values_mut().map(|params| &mut params.transition));
        for row in rows {
            let (ln_b, ln_rest) = sample_ln_beta(hyper.alpha * beta, hyper.alpha * beta_u, rng)?;
            row.split_reservoir(label, ln_b, ln_rest);
        }
        let transition = draw_transition_row(Source::State(label), stick, hyper, None, rng)?;
        let emission = draw_emission(hyper.alpha_phi, self.alphabet_size, None, rng)?;
        self.states.insert(
            label,
            StateParams {
                transition,
                emission,
            },
        );
        trace!(%label, beta, beta_u, "birth");
        Ok(label)
    }

    /// Remove a state, folding its stick and every column that points at it back into the
    /// reservoirs. The label becomes available for reuse.
    pub fn death(&mut self, label: StateLabel, stick: &mut StickBreaker) -> Result<()> {
        if self.states.remove(&label).is_none() {
            return Err(Error::Consistency(format!("death of inactive state {}", label)));
        }
        stick.remove(label);
        self.start.fold_into_reservoir(label);
        for params in self.states.values_mut() {
            params.transition.fold_into_reservoir(label);
        }
        self.pool.release(label);
        trace!(%label, beta_u = stick.reservoir(), "death");
        Ok(())
    }

    /// Redraw the start row and every $π_k$ and $φ_k$ from their posteriors.
    ///
    /// Each row is drawn on `pool` with its own stream, seeded from `rng` in label order, so the
    /// result does not depend on the number of workers. The active set becomes the labels of
    /// `stick`.
    pub fn resample_all<R: Rng + ?Sized>(
        &mut self,
        stick: &StickBreaker,
        hyper: &Hyperparameters,
        transitions: &TransitionCounts,
        emissions: &EmissionCounts,
        pool: &ThreadPool,
        rng: &mut R,
    ) -> Result<()> {
        let sources: Vec<(Source, u64)> = std::iter::once(Source::Start)
            .chain(stick.labels().map(Source::State))
            .map(|source| (source, rng.gen()))
            .collect();
        let alphabet_size = self.alphabet_size;
        let drawn: Vec<(Source, TransitionRow, Option<Array1<f64>>)> = pool.install(|| {
            sources
                .par_iter()
                .map(|&(source, seed)| {
                    let mut t_rng = Xoshiro256PlusPlus::seed_from_u64(seed);
                    let row = draw_transition_row(
                        source,
                        stick,
                        hyper,
                        transitions.row(source),
                        &mut t_rng,
                    )?;
                    let emission = match source {
                        Source::Start => None,
                        Source::State(label) => Some(draw_emission(
                            hyper.alpha_phi,
                            alphabet_size,
                            emissions.get(label),
                            &mut t_rng,
                        )?),
                    };
                    Ok((source, row, emission))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let mut states = BTreeMap::new();
        for (source, transition, emission) in drawn {
            match (source, emission) {
                (Source::Start, _) => self.start = transition,
                (Source::State(label), Some(emission)) => {
                    states.insert(
                        label,
                        StateParams {
                            transition,
                            emission,
                        },
                    );
                }
                (Source::State(label), None) => {
                    return Err(Error::Consistency(format!(
                        "no emission drawn for {}",
                        label
                    )))
                }
            }
        }
        self.states = states;
        Ok(())
    }

    /// Hand out a label without any parameters. Only used while seeding the chain, before the
    /// first [`StateRegistry::resample_all`].
    pub(crate) fn allocate_label(&mut self) -> StateLabel {
        self.pool.allocate()
    }

    /// Verify that every row is a distribution over exactly the labels of `stick`.
    pub fn check(&self, stick: &StickBreaker, tolerance: f64) -> Result<()> {
        if !self.labels().eq(stick.labels()) {
            return Err(Error::Consistency(
                "registry and stick disagree on the active labels".to_string(),
            ));
        }
        for (source, row) in self.rows() {
            if !row.weights.keys().cloned().eq(stick.labels()) {
                return Err(Error::Consistency(format!(
                    "row {} does not cover the active labels",
                    source
                )));
            }
            if row.iter().any(|(_, p)| !(p >= 0.0)) || !(row.reservoir >= 0.0) {
                return Err(Error::Consistency(format!(
                    "row {} has a negative entry",
                    source
                )));
            }
            if (row.sum() - 1.0).abs() > tolerance {
                return Err(Error::Consistency(format!(
                    "row {} sums to {}",
                    source,
                    row.sum()
                )));
            }
        }
        for (label, params) in self.iter() {
            if params.emission.len() != self.alphabet_size
                || (params.emission.sum() - 1.0).abs() > tolerance
            {
                return Err(Error::Consistency(format!(
                    "emission of {} is not a distribution over the alphabet",
                    label
                )));
            }
        }
        Ok(())
    }
}
