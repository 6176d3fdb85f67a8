//! The HDP-HMM itself: construction, initialisation and the MCMC driver.
use crate::beam::{draw_slices, sample_path, ParamSnapshot};
use crate::config::{McmcOptions, SamplerConfig};
use crate::diagnostics::{AcceptanceTally, Diagnostics, ParameterSnapshot, SweepFailure};
use crate::error::{Error, MisuseError, Result};
use crate::hmm::FiniteHmm;
use crate::hyper::{
    ln_emission_density, ln_stick_density, ln_stick_prior, ln_table_marginal,
    ln_transition_density, metropolis_log_normal, Hyperparameter, Hyperparameters, Priors,
};
use crate::label::{Source, StateLabel};
use crate::registry::StateRegistry;
use crate::stick::{StickBreaker, TableCounts};
use crate::store::{Alphabet, EmissionCounts, SequenceStore, TransitionCounts};
use itertools::Itertools;
use ndarray::prelude::*;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fmt::Debug;
use std::io::{self, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info_span, warn};

/// Sums of probabilities must be within this of one.
const TOLERANCE: f64 = 1e-9;

/// Everything a sweep reads and writes. Sweeps run on a copy and replace the original only once
/// they complete.
#[derive(Clone, Debug)]
struct ChainState {
    stick: StickBreaker,
    registry: StateRegistry,
    store: SequenceStore,
    hyper: Hyperparameters,
}

/// A hierarchical Dirichlet process HMM over sequences of symbols of type `S`, optionally sticky.
///
/// ```
/// use hdphmm::{HdpHmm, McmcOptions};
/// use rand::SeedableRng;
/// use rand_xoshiro::Xoshiro256PlusPlus;
///
/// let sequences = vec![vec!['a', 'a', 'b', 'b', 'a', 'a', 'b', 'b']; 5];
/// let mut rng = Xoshiro256PlusPlus::seed_from_u64(1337);
/// let mut model = HdpHmm::new(&sequences, false).unwrap();
/// model.initialise(4, &mut rng).unwrap();
/// let diagnostics = model
///     .mcmc(&McmcOptions::new(20).burn_in(10), &mut rng)
///     .unwrap();
/// assert_eq!(diagnostics.state_count.len(), 10);
/// assert!(diagnostics.is_complete());
/// ```
#[derive(Clone, Debug)]
pub struct HdpHmm<S> {
    alphabet: Alphabet<S>,
    sticky: bool,
    priors: Priors,
    config: SamplerConfig,
    observations: Arc<Vec<Array1<usize>>>,
    chain: Option<ChainState>,
}

impl<S: Ord + Clone + Debug> HdpHmm<S> {
    /// Build a model over `sequences`, using the symbols that occur in them as the alphabet.
    pub fn new<Q: AsRef<[S]>>(sequences: &[Q], sticky: bool) -> Result<Self> {
        Self::with_alphabet(sequences, Alphabet::observed(sequences), sticky)
    }

    /// Build a model over an explicit alphabet, which may contain symbols that are never observed.
    pub fn with_alphabet<Q: AsRef<[S]>>(
        sequences: &[Q],
        alphabet: Alphabet<S>,
        sticky: bool,
    ) -> Result<Self> {
        let observations = alphabet.encode(sequences)?;
        Ok(Self {
            alphabet,
            sticky,
            priors: Priors::default_for(sticky),
            config: SamplerConfig::default(),
            observations: Arc::new(observations),
            chain: None,
        })
    }

    /// Replace the hyperparameter priors. Discards any initialised chain.
    pub fn with_priors(mut self, priors: Priors) -> Result<Self> {
        priors.validate(self.sticky)?;
        self.priors = priors;
        self.chain = None;
        Ok(self)
    }

    /// Replace the sampler settings. Discards any initialised chain.
    pub fn with_config(mut self, config: SamplerConfig) -> Result<Self> {
        config.validate()?;
        self.config = config;
        self.chain = None;
        Ok(self)
    }

    pub fn alphabet(&self) -> &Alphabet<S> {
        &self.alphabet
    }

    pub fn is_sticky(&self) -> bool {
        self.sticky
    }

    /// The prior of each hyperparameter, for drawing prior-predictive samples.
    pub fn priors(&self) -> &Priors {
        &self.priors
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn is_initialised(&self) -> bool {
        self.chain.is_some()
    }

    pub fn hyperparameters(&self) -> Option<Hyperparameters> {
        self.chain.as_ref().map(|chain| chain.hyper)
    }

    /// The active states, in label order.
    pub fn state_labels(&self) -> Vec<StateLabel> {
        self.chain
            .as_ref()
            .map(|chain| chain.registry.labels().collect())
            .unwrap_or_default()
    }

    pub fn state_count(&self) -> usize {
        self.chain.as_ref().map_or(0, |chain| chain.registry.len())
    }

    /// The current latent assignment of every sequence.
    pub fn assignments(&self) -> Option<&[Vec<StateLabel>]> {
        self.chain.as_ref().map(|chain| chain.store.assignments())
    }

    pub fn transition_counts(&self) -> Option<&TransitionCounts> {
        self.chain.as_ref().map(|chain| chain.store.transition_counts())
    }

    pub fn emission_counts(&self) -> Option<&EmissionCounts> {
        self.chain.as_ref().map(|chain| chain.store.emission_counts())
    }

    /// The top-level weights $β$.
    pub fn stick(&self) -> Option<&StickBreaker> {
        self.chain.as_ref().map(|chain| &chain.stick)
    }

    /// $π$ and $φ$ of the active states.
    pub fn registry(&self) -> Option<&StateRegistry> {
        self.chain.as_ref().map(|chain| &chain.registry)
    }

    /// Seed the chain with `k0` states.
    ///
    /// Hyperparameters are drawn from their priors, $β$ is grown by `k0` stick breaks, every
    /// observation is assigned to one of the seed states uniformly at random, and $π$ and $φ$ are
    /// drawn given those assignments. Calling this again restarts the chain.
    pub fn initialise<R: Rng>(&mut self, k0: usize, rng: &mut R) -> Result<()> {
        if k0 == 0 {
            return Err(MisuseError::ZeroInitialStates.into());
        }
        let hyper = self.priors.draw(rng)?;
        let mut stick = StickBreaker::new();
        let mut registry = StateRegistry::new(self.alphabet.len());
        let mut labels = Vec::with_capacity(k0);
        for _ in 0..k0 {
            let label = registry.allocate_label();
            stick.split_reservoir(label, hyper.gamma, self.config.reservoir_floor, rng)?;
            labels.push(label);
        }
        let assignments = self
            .observations
            .iter()
            .map(|ys| (0..ys.len()).map(|_| labels[rng.gen_range(0, k0)]).collect())
            .collect();
        let store = SequenceStore::new(self.observations.clone(), assignments, self.alphabet.len());
        registry.resample_all(
            &stick,
            &hyper,
            store.transition_counts(),
            store.emission_counts(),
            &build_pool(1)?,
            rng,
        )?;
        let chain = ChainState {
            stick,
            registry,
            store,
            hyper,
        };
        check_chain(&chain)?;
        self.chain = Some(chain);
        Ok(())
    }

    /// Run `options.n` sweeps and report the sweeps after burn-in.
    ///
    /// Misuse is reported as an error before anything runs. A sweep that fails (for example with
    /// a [`NumericFailure`](crate::NumericFailure)) ends the run: the returned diagnostics hold
    /// everything recorded before it, [`Diagnostics::failure`] names the failing sweep, and the
    /// model is left as it was after the last completed sweep. Cancellation works the same way.
    pub fn mcmc<R: Rng>(&mut self, options: &McmcOptions, rng: &mut R) -> Result<Diagnostics<S>> {
        options.validate()?;
        if self.chain.is_none() {
            return Err(MisuseError::NotInitialised.into());
        }
        let mut diagnostics = Diagnostics::default();
        if options.n == 0 {
            return Ok(diagnostics);
        }
        let pool = build_pool(options.ncores)?;
        let span = info_span!(
            "mcmc",
            n = options.n,
            burn_in = options.burn_in,
            save_every = options.save_every,
            ncores = options.ncores
        );
        let _enter = span.enter();

        let mut acceptance = AcceptanceTally::default();
        for sweep in 0..options.n {
            if let Some(cancel) = &options.cancel {
                if cancel.load(Ordering::SeqCst) {
                    debug!(sweep, "cancelled");
                    diagnostics.cancelled = true;
                    break;
                }
            }
            let mut chain = match &self.chain {
                Some(chain) => chain.clone(),
                None => return Err(MisuseError::NotInitialised.into()),
            };
            let mut tally = AcceptanceTally::default();
            if let Err(error) = self.sweep(&mut chain, &pool, &mut tally, rng) {
                warn!(sweep, %error, "sweep failed");
                diagnostics.failure = Some(SweepFailure { sweep, error });
                break;
            }
            acceptance.merge(&tally);
            diagnostics.sweeps_completed += 1;

            let log_likelihood = log_likelihood(&chain);
            let neglogp = -(log_likelihood
                + ln_parameter_density(&chain)
                + self.priors.ln_pdf(&chain.hyper));
            debug!(
                sweep,
                states = chain.registry.len(),
                neglogp,
                alpha = chain.hyper.alpha,
                gamma = chain.hyper.gamma,
                kappa = chain.hyper.kappa,
                alpha_phi = chain.hyper.alpha_phi
            );
            if sweep >= options.burn_in {
                diagnostics.sweeps.push(sweep);
                diagnostics.state_count.push(chain.registry.len());
                diagnostics.log_likelihood.push(log_likelihood);
                diagnostics.neglogp.push(neglogp);
                diagnostics.hyperparameters.push(chain.hyper);
                if options.snapshot_parameters && (sweep - options.burn_in) % options.save_every == 0
                {
                    diagnostics
                        .parameters
                        .push(self.parameter_snapshot(sweep, &chain));
                }
            }
            self.chain = Some(chain);
        }
        diagnostics.acceptance = acceptance.rates();
        Ok(diagnostics)
    }

    /// One full sweep, phase by phase.
    fn sweep<R: Rng>(
        &self,
        chain: &mut ChainState,
        pool: &ThreadPool,
        acceptance: &mut AcceptanceTally,
        rng: &mut R,
    ) -> Result<()> {
        // (i) Beam-resample every sequence and (ii) commit the new counts
        self.resample_assignments(chain, pool, rng)?;
        check_phase(chain, "beam")?;

        // (iii) Table counts and β
        let tables = TableCounts::sample(
            chain.store.transition_counts(),
            &chain.stick,
            &chain.hyper,
            rng,
        )?;
        chain.stick.resample(
            &tables,
            chain.hyper.gamma,
            self.config.reservoir_floor,
            rng,
        )?;
        check_phase(chain, "beta")?;

        // (iv) π and φ
        chain.registry.resample_all(
            &chain.stick,
            &chain.hyper,
            chain.store.transition_counts(),
            chain.store.emission_counts(),
            pool,
            rng,
        )?;
        check_phase(chain, "pi")?;

        // (v) Hyperparameters
        self.resample_hyperparameters(chain, &tables, acceptance, rng)?;

        // (vi) Prune
        for label in chain.stick.below(self.config.prune_threshold) {
            if !chain.store.is_used(label) {
                chain.registry.death(label, &mut chain.stick)?;
            }
        }
        check_phase(chain, "prune")?;
        if cfg!(debug_assertions) {
            check_pruned(chain, self.config.prune_threshold)?;
        }
        Ok(())
    }

    /// Draw slices, grow the state space until every slice is covered, then sample a new path for
    /// every sequence.
    fn resample_assignments<R: Rng>(
        &self,
        chain: &mut ChainState,
        pool: &ThreadPool,
        rng: &mut R,
    ) -> Result<()> {
        let snapshot = ParamSnapshot::new(&chain.registry);
        let seeds: Vec<u64> = (0..chain.store.len()).map(|_| rng.gen()).collect();
        let assignments = chain.store.assignments();
        let sliced: Vec<(Vec<f64>, Xoshiro256PlusPlus)> = pool.install(|| {
            seeds
                .par_iter()
                .zip(assignments.par_iter())
                .map(|(&seed, z)| {
                    let mut t_rng = Xoshiro256PlusPlus::seed_from_u64(seed);
                    let slices = draw_slices(&snapshot, z, &mut t_rng)?;
                    Ok((slices, t_rng))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let min_slice = sliced
            .iter()
            .flat_map(|(slices, _)| slices.iter().cloned())
            .fold(f64::INFINITY, f64::min);
        while max_reservoir(&chain.registry) > min_slice {
            if chain.registry.len() >= self.config.max_states {
                warn!(
                    states = chain.registry.len(),
                    min_slice, "state expansion truncated"
                );
                break;
            }
            chain.registry.birth(
                &mut chain.stick,
                &chain.hyper,
                self.config.reservoir_floor,
                rng,
            )?;
        }

        let snapshot = ParamSnapshot::new(&chain.registry);
        let observations = &self.observations;
        let paths: Vec<Vec<StateLabel>> = pool.install(|| {
            sliced
                .into_par_iter()
                .enumerate()
                .map(|(sequence, (slices, mut t_rng))| {
                    sample_path(
                        sequence,
                        observations[sequence].view(),
                        &slices,
                        &snapshot,
                        &mut t_rng,
                    )
                })
                .collect::<Result<Vec<_>>>()
        })?;
        for (sequence, z) in paths.into_iter().enumerate() {
            chain.store.commit(sequence, z)?;
        }
        Ok(())
    }

    /// Metropolis-Hastings updates of every hyperparameter that is not held fixed, each conditional
    /// on the current β, π and φ. The γ target also carries the table configuration it generated.
    fn resample_hyperparameters<R: Rng>(
        &self,
        chain: &mut ChainState,
        tables: &TableCounts,
        acceptance: &mut AcceptanceTally,
        rng: &mut R,
    ) -> Result<()> {
        for &which in Hyperparameter::ALL.iter() {
            let prior = self.priors.get(which);
            if prior.fixed_value().is_some() {
                continue;
            }
            let scale = self.config.proposal_scale(which);
            for _ in 0..self.config.mh_steps {
                let hyper = chain.hyper;
                let stick = &chain.stick;
                let registry = &chain.registry;
                let ln_target = |x: f64| {
                    let ln_likelihood = match which {
                        Hyperparameter::Alpha => {
                            ln_transition_density(x, hyper.kappa, stick, registry)
                        }
                        Hyperparameter::Kappa => {
                            ln_transition_density(hyper.alpha, x, stick, registry)
                        }
                        Hyperparameter::Gamma => {
                            ln_table_marginal(x, tables.occupied(), tables.total())
                                + ln_stick_density(x, tables, stick)
                        }
                        Hyperparameter::AlphaPhi => ln_emission_density(x, registry),
                    };
                    ln_likelihood + prior.ln_pdf(x)
                };
                let (value, accepted) =
                    metropolis_log_normal(which, hyper.get(which), scale, ln_target, rng)?;
                chain.hyper.set(which, value);
                acceptance.record(which, accepted);
            }
        }
        Ok(())
    }

    fn parameter_snapshot(&self, sweep: usize, chain: &ChainState) -> ParameterSnapshot<S> {
        let registry = &chain.registry;
        let p_initial = registry
            .row(Source::Start)
            .map(|row| row.iter().collect())
            .unwrap_or_default();
        let p_transition = registry
            .iter()
            .map(|(label, params)| (label, params.transition.iter().collect()))
            .collect();
        let p_emission = registry
            .iter()
            .map(|(label, params)| {
                let by_symbol = self
                    .alphabet
                    .symbols()
                    .iter()
                    .cloned()
                    .zip(params.emission.iter().cloned())
                    .collect();
                (label, by_symbol)
            })
            .collect();
        ParameterSnapshot {
            sweep,
            p_initial,
            p_transition,
            p_emission,
            beta: chain.stick.iter().collect(),
            beta_reservoir: chain.stick.reservoir(),
        }
    }

    /// Verify the bookkeeping of the current chain: $β$, every $π$ row and every $φ$ are
    /// distributions over the active states; every state used by an assignment is active; and the
    /// incrementally maintained counts match a recount from scratch.
    pub fn check_invariants(&self) -> Result<()> {
        match &self.chain {
            Some(chain) => check_chain(chain),
            None => Err(MisuseError::NotInitialised.into()),
        }
    }

    /// The current posterior sample as a finite HMM over the active states, which are returned in
    /// the order of the matrix rows. The reservoir mass of every row is dropped and the rest
    /// renormalised.
    pub fn to_finite_hmm(&self) -> Result<(Vec<StateLabel>, FiniteHmm)> {
        let chain = self
            .chain
            .as_ref()
            .ok_or(Error::Misuse(MisuseError::NotInitialised))?;
        let registry = &chain.registry;
        let labels: Vec<StateLabel> = registry.labels().collect();
        let k = labels.len();
        let truncated = |source: Source| -> Array1<f64> {
            let row: Array1<f64> = registry
                .row(source)
                .map(|row| labels.iter().map(|&label| row.prob(label)).collect())
                .unwrap_or_else(|| Array1::zeros(k));
            let sum = row.sum();
            if sum > 0.0 {
                row / sum
            } else {
                Array1::from_elem(k, 1.0 / k as f64)
            }
        };
        let mut a = Array2::zeros((k, k));
        let mut b = Array2::zeros((k, self.alphabet.len()));
        for (i, (label, params)) in registry.iter().enumerate() {
            a.row_mut(i).assign(&truncated(Source::State(label)));
            b.row_mut(i).assign(&params.emission);
        }
        let pi = truncated(Source::Start);
        Ok((labels, FiniteHmm::new(a, b, pi)))
    }

    /// Write $β$, every transition row, and every emission distribution in a human-readable form.
    pub fn write_probabilities<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let chain = match &self.chain {
            Some(chain) => chain,
            None => return writeln!(out, "not initialised"),
        };
        let row = |entries: Vec<(StateLabel, f64)>, reservoir: f64| {
            entries
                .iter()
                .map(|(label, p)| format!("{}={:.4}", label, p))
                .chain(std::iter::once(format!("new={:.4}", reservoir)))
                .join(" ")
        };
        writeln!(
            out,
            "beta: {}",
            row(chain.stick.iter().collect(), chain.stick.reservoir())
        )?;
        for (source, transition) in chain.registry.rows() {
            writeln!(
                out,
                "pi[{}]: {}",
                source,
                row(transition.iter().collect(), transition.reservoir())
            )?;
        }
        for (label, params) in chain.registry.iter() {
            let emission = self
                .alphabet
                .symbols()
                .iter()
                .zip(params.emission.iter())
                .map(|(symbol, p)| format!("{:?}={:.4}", symbol, p))
                .join(" ");
            writeln!(out, "phi[{}]: {}", label, emission)?;
        }
        Ok(())
    }

    /// Print [`HdpHmm::write_probabilities`] to standard output.
    pub fn print_probabilities(&self) {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        if let Err(e) = self.write_probabilities(&mut handle) {
            warn!(error = %e, "could not print probabilities");
        }
    }
}

fn build_pool(ncores: usize) -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(ncores)
        .build()
        .map_err(|e| {
            MisuseError::InvalidConfig {
                reason: e.to_string(),
            }
            .into()
        })
}

fn max_reservoir(registry: &StateRegistry) -> f64 {
    registry
        .rows()
        .map(|(_, row)| row.reservoir())
        .fold(0.0, f64::max)
}

/// $\ln p(y, z | π, φ)$ from the sufficient statistics.
fn log_likelihood(chain: &ChainState) -> f64 {
    let registry = &chain.registry;
    let transitions: f64 = chain
        .store
        .transition_counts()
        .iter()
        .map(|(source, label, n)| {
            let p = registry.row(source).map_or(0.0, |row| row.prob(label));
            n as f64 * p.ln()
        })
        .sum();
    let emissions: f64 = chain
        .store
        .emission_counts()
        .iter()
        .map(|(label, counts)| {
            registry.get(label).map_or(f64::NEG_INFINITY, |params| {
                counts
                    .iter()
                    .zip(params.emission.iter())
                    .filter(|(n, _)| **n > 0)
                    .map(|(&n, &p)| n as f64 * p.ln())
                    .sum()
            })
        })
        .sum();
    transitions + emissions
}

/// $\ln p(π | α, β, κ) + \ln p(φ | α_φ) + \ln p(β | γ)$ at the current draws.
fn ln_parameter_density(chain: &ChainState) -> f64 {
    let hyper = &chain.hyper;
    ln_transition_density(hyper.alpha, hyper.kappa, &chain.stick, &chain.registry)
        + ln_emission_density(hyper.alpha_phi, &chain.registry)
        + ln_stick_prior(hyper.gamma, &chain.stick)
}

fn check_chain(chain: &ChainState) -> Result<()> {
    let total = chain.stick.total();
    if (total - 1.0).abs() > TOLERANCE {
        return Err(Error::Consistency(format!("beta sums to {}", total)));
    }
    chain.registry.check(&chain.stick, TOLERANCE)?;
    if let Some(label) = chain
        .store
        .used_labels()
        .into_iter()
        .find(|&label| !chain.registry.contains(label))
    {
        return Err(Error::Consistency(format!(
            "{} is assigned but not active",
            label
        )));
    }
    let (transitions, emissions) = chain.store.recount();
    if &transitions != chain.store.transition_counts() || &emissions != chain.store.emission_counts()
    {
        return Err(Error::Consistency(
            "incremental counts differ from a recount".to_string(),
        ));
    }
    Ok(())
}

fn check_phase(chain: &ChainState, phase: &'static str) -> Result<()> {
    if cfg!(debug_assertions) {
        check_chain(chain)
            .map_err(|e| Error::Consistency(format!("after the {} phase: {}", phase, e)))
    } else {
        Ok(())
    }
}

fn check_pruned(chain: &ChainState, threshold: f64) -> Result<()> {
    match chain
        .stick
        .below(threshold)
        .into_iter()
        .find(|&label| !chain.store.is_used(label))
    {
        Some(label) => Err(Error::Consistency(format!(
            "unused state {} survived pruning",
            label
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmm::HmmSample;
    use crate::hyper::{FixedPrior, GammaPrior};
    use crate::new_rng;
    use ndarray::array;
    use spectral::prelude::*;
    use std::sync::atomic::AtomicBool;

    fn repeated(pattern: &[usize], times: usize, copies: usize) -> Vec<Vec<usize>> {
        let sequence: Vec<usize> = pattern
            .iter()
            .cloned()
            .cycle()
            .take(pattern.len() * times)
            .collect();
        vec![sequence; copies]
    }

    fn initialised(sequences: &[Vec<usize>], sticky: bool, k0: usize) -> HdpHmm<usize> {
        let mut model = HdpHmm::new(sequences, sticky).unwrap();
        model.initialise(k0, &mut new_rng()).unwrap();
        model
    }

    #[test]
    fn construction_rejects_bad_input() {
        let empty: Vec<Vec<usize>> = vec![];
        assert_eq!(
            HdpHmm::new(&empty, false).err(),
            Some(Error::Misuse(MisuseError::EmptyInput))
        );
        assert_eq!(
            HdpHmm::new(&[vec![0usize, 1], vec![]], false).err(),
            Some(Error::Misuse(MisuseError::EmptySequence { index: 1 }))
        );
        let alphabet = Alphabet::new(vec!['a', 'b']);
        assert_eq!(
            HdpHmm::with_alphabet(&[vec!['a', 'c']], alphabet, false).err(),
            Some(Error::Misuse(MisuseError::UnknownSymbol { index: 0 }))
        );
    }

    #[test]
    fn kappa_prior_needs_a_sticky_model() {
        let model = HdpHmm::new(&[vec![0usize, 1]], false).unwrap();
        let priors = Priors::default_for(true);
        assert_eq!(
            model.with_priors(priors).err(),
            Some(Error::Misuse(MisuseError::KappaPriorWithoutStickiness))
        );
    }

    #[test]
    fn initialise_seeds_the_chain() {
        let sequences = repeated(&[0, 1, 2], 5, 3);
        let model = initialised(&sequences, false, 4);
        assert!(model.is_initialised());
        assert_eq!(model.state_count(), 4);
        assert_eq!(model.hyperparameters().unwrap().kappa, 0.0);
        assert!(model.check_invariants().is_ok());
        let assignments = model.assignments().unwrap();
        assert_eq!(assignments.len(), 3);
        assert_eq!(assignments[0].len(), 15);
    }

    #[test]
    fn initialise_rejects_zero_states() {
        let mut model = HdpHmm::new(&[vec![0usize]], false).unwrap();
        assert_eq!(
            model.initialise(0, &mut new_rng()),
            Err(Error::Misuse(MisuseError::ZeroInitialStates))
        );
    }

    /// Calling `mcmc` too early is misuse, and zero sweeps is an empty result.
    #[test]
    fn mcmc_misuse_and_empty_runs() {
        let sequences = repeated(&[0, 1], 4, 2);
        let mut model = HdpHmm::new(&sequences, false).unwrap();
        let rng = &mut new_rng();
        assert_eq!(
            model.mcmc(&McmcOptions::new(10), rng).err(),
            Some(Error::Misuse(MisuseError::NotInitialised))
        );
        model.initialise(3, rng).unwrap();
        let diagnostics = model.mcmc(&McmcOptions::new(0), rng).unwrap();
        assert!(diagnostics.is_empty());
        assert!(diagnostics.parameters.is_empty());
        assert_eq!(diagnostics.sweeps_completed, 0);
        assert_eq!(
            model.mcmc(&McmcOptions::new(5).save_every(0), rng).err(),
            Some(Error::Misuse(MisuseError::ZeroSaveEvery))
        );
    }

    #[test]
    fn invariants_hold_after_every_sweep() {
        let sequences = vec![vec![0, 1, 2, 1, 0, 0, 2, 2, 1], vec![2, 2, 2, 0, 1]];
        let rng = &mut new_rng();
        for &sticky in &[false, true] {
            let mut model = HdpHmm::new(&sequences, sticky).unwrap();
            model.initialise(5, rng).unwrap();
            for _ in 0..30 {
                let diagnostics = model.mcmc(&McmcOptions::new(1), rng).unwrap();
                assert!(diagnostics.is_complete(), "{:?}", diagnostics.failure);
                model.check_invariants().unwrap();
                let used: std::collections::BTreeSet<_> =
                    model.assignments().unwrap().iter().flatten().cloned().collect();
                assert_eq!(
                    used,
                    model
                        .state_labels()
                        .into_iter()
                        .collect::<std::collections::BTreeSet<_>>()
                );
            }
        }
    }

    #[test]
    fn diagnostics_follow_burn_in_and_save_every() {
        let sequences = repeated(&[0, 1, 2], 4, 3);
        let mut model = initialised(&sequences, true, 3);
        let options = McmcOptions::new(25).burn_in(5).save_every(4);
        let diagnostics = model.mcmc(&options, &mut new_rng()).unwrap();
        assert_eq!(diagnostics.sweeps, (5..25).collect::<Vec<_>>());
        assert_eq!(diagnostics.state_count.len(), 20);
        assert_eq!(diagnostics.neglogp.len(), 20);
        assert_eq!(diagnostics.hyperparameters.len(), 20);
        assert_eq!(
            diagnostics
                .parameters
                .iter()
                .map(|p| p.sweep)
                .collect::<Vec<_>>(),
            vec![5, 9, 13, 17, 21]
        );
        assert_eq!(diagnostics.sweeps_completed, 25);
        assert_eq!(diagnostics.acceptance.len(), 4);
        for snapshot in &diagnostics.parameters {
            let total = snapshot.beta.values().sum::<f64>() + snapshot.beta_reservoir;
            assert_that(&total).is_close_to(1.0, 1e-9);
            for emission in snapshot.p_emission.values() {
                assert_eq!(emission.len(), 3);
            }
        }
    }

    #[test]
    fn fixed_hyperparameters_are_never_proposed() {
        let sequences = repeated(&[0, 1], 5, 2);
        let priors = Priors::default_for(false)
            .with(Hyperparameter::Alpha, Arc::new(FixedPrior(3.0)))
            .with(
                Hyperparameter::Gamma,
                Arc::new(GammaPrior::new(1.0, 1.0).unwrap()),
            );
        let mut model = HdpHmm::new(&sequences, false)
            .unwrap()
            .with_priors(priors)
            .unwrap();
        let rng = &mut new_rng();
        model.initialise(2, rng).unwrap();
        let diagnostics = model.mcmc(&McmcOptions::new(10), rng).unwrap();
        assert!(diagnostics.trace(Hyperparameter::Alpha).iter().all(|&a| a == 3.0));
        assert!(diagnostics.trace(Hyperparameter::Kappa).iter().all(|&k| k == 0.0));
        assert!(!diagnostics.acceptance.contains_key(&Hyperparameter::Alpha));
        assert!(!diagnostics.acceptance.contains_key(&Hyperparameter::Kappa));
        assert!(diagnostics.acceptance.contains_key(&Hyperparameter::Gamma));
    }

    #[test]
    fn cancellation_stops_between_sweeps() {
        let sequences = repeated(&[0, 1], 5, 2);
        let mut model = initialised(&sequences, false, 2);
        let cancel = Arc::new(AtomicBool::new(true));
        let diagnostics = model
            .mcmc(&McmcOptions::new(10).cancel(cancel), &mut new_rng())
            .unwrap();
        assert!(diagnostics.cancelled);
        assert_eq!(diagnostics.sweeps_completed, 0);
        assert!(model.check_invariants().is_ok());
    }

    #[test]
    fn reproducible_for_any_number_of_cores() {
        let sequences = vec![
            vec![0, 0, 1, 1, 2, 2, 0, 0, 1, 1],
            vec![2, 2, 2, 1, 1, 0],
            vec![1, 0, 1, 0, 2],
        ];
        let run = |ncores| {
            let mut model = initialised(&sequences, true, 4);
            let diagnostics = model
                .mcmc(&McmcOptions::new(15).ncores(ncores), &mut new_rng())
                .unwrap();
            (diagnostics, model.assignments().unwrap().to_vec())
        };
        let (one, z_one) = run(1);
        let (again, z_again) = run(1);
        let (four, z_four) = run(4);
        assert_eq!(one, again);
        assert_eq!(z_one, z_again);
        assert_eq!(one, four);
        assert_eq!(z_one, z_four);
    }

    #[test]
    fn finite_hmm_matches_the_posterior_sample() {
        let sequences = repeated(&[0, 1, 2], 5, 2);
        let mut model = initialised(&sequences, false, 3);
        model.mcmc(&McmcOptions::new(5), &mut new_rng()).unwrap();
        let (labels, hmm) = model.to_finite_hmm().unwrap();
        assert_eq!(labels, model.state_labels());
        assert_eq!(hmm.n(), labels.len());
        assert_eq!(hmm.k(), 3);
        let registry = model.registry().unwrap();
        for (i, &label) in labels.iter().enumerate() {
            assert_eq!(hmm.b.row(i), registry.get(label).unwrap().emission);
        }
    }

    #[test]
    fn writes_probabilities() {
        let sequences = vec![vec!['x', 'y', 'x']];
        let mut model = HdpHmm::new(&sequences, false).unwrap();
        let mut out = Vec::new();
        model.write_probabilities(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "not initialised\n");

        model.initialise(2, &mut new_rng()).unwrap();
        let mut out = Vec::new();
        model.write_probabilities(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1 + 3 + 2);
        assert!(lines[0].starts_with("beta: s0="));
        assert!(lines[1].starts_with("pi[start]: s0="));
        assert!(lines[4].starts_with("phi[s0]: 'x'="));
    }

    #[test]
    fn unobserved_symbols_receive_emission_mass() {
        let sequences = vec![vec![0usize, 0, 0]];
        let mut model =
            HdpHmm::with_alphabet(&sequences, Alphabet::new(0..4usize), false).unwrap();
        model.initialise(1, &mut new_rng()).unwrap();
        let registry = model.registry().unwrap();
        let (_, params) = registry.iter().next().unwrap();
        assert_eq!(params.emission.len(), 4);
        assert_that(&params.emission.sum()).is_close_to(1.0, 1e-9);
    }

    fn two_regimes(rng: &mut Xoshiro256PlusPlus, copies: usize, half: usize) -> Vec<Vec<usize>> {
        (0..copies)
            .map(|_| {
                (0..2 * half)
                    .map(|t| (if t < half { 0 } else { 2 }) + rng.gen_range(0, 2))
                    .collect()
            })
            .collect()
    }

    fn switches(assignments: &[Vec<StateLabel>]) -> usize {
        assignments
            .iter()
            .map(|z| z.iter().tuple_windows().filter(|(a, b)| a != b).count())
            .sum()
    }

    fn most_common(z: &[StateLabel]) -> StateLabel {
        let mut counts = std::collections::BTreeMap::new();
        for &label in z {
            *counts.entry(label).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .max_by_key(|&(_, n)| n)
            .map(|(label, _)| label)
            .unwrap()
    }

    /// An up-and-down sweep through six symbols settles on about one state per position of the
    /// cycle, and the fit improves.
    #[test]
    fn up_and_down_pattern() {
        let sequences = repeated(&[0, 1, 2, 3, 4, 5, 4, 3, 2, 1, 0], 20, 10);
        let mut model = initialised(&sequences, false, 20);
        let diagnostics = model.mcmc(&McmcOptions::new(300), &mut new_rng()).unwrap();
        assert!(diagnostics.is_complete(), "{:?}", diagnostics.failure);
        let early = diagnostics.log_likelihood[..10].iter().sum::<f64>() / 10.0;
        let late = diagnostics.log_likelihood[290..].iter().sum::<f64>() / 10.0;
        assert_that(&late).is_greater_than(early);
        let mean_states = diagnostics.state_count[150..].iter().sum::<usize>() as f64 / 150.0;
        assert_that(&mean_states).is_greater_than_or_equal_to(6.0);
        assert_that(&mean_states).is_less_than_or_equal_to(20.0);
    }

    /// A constant sequence is explained by one state that (nearly) always emits its symbol.
    #[test]
    fn constant_sequence() {
        let sequences = vec![vec![0usize; 100]];
        let priors = Priors::default_for(false)
            .with(Hyperparameter::Alpha, Arc::new(FixedPrior(0.1)))
            .with(Hyperparameter::Gamma, Arc::new(FixedPrior(0.1)))
            .with(Hyperparameter::AlphaPhi, Arc::new(FixedPrior(1.0)));
        let mut model = HdpHmm::with_alphabet(&sequences, Alphabet::new(vec![0usize, 1]), false)
            .unwrap()
            .with_priors(priors)
            .unwrap();
        let rng = &mut new_rng();
        model.initialise(1, rng).unwrap();
        let diagnostics = model
            .mcmc(&McmcOptions::new(200).burn_in(100), rng)
            .unwrap();
        assert!(diagnostics.is_complete(), "{:?}", diagnostics.failure);
        assert_that(&diagnostics.mean_state_count().unwrap()).is_less_than(1.5);

        let dominant = most_common(&model.assignments().unwrap()[0]);
        let phi = &model.registry().unwrap().get(dominant).unwrap().emission;
        assert_that(&phi[0]).is_greater_than(0.9);
    }

    /// Two regimes with disjoint symbols end up in different states with few crossings.
    #[test]
    fn two_separated_regimes() {
        let rng = &mut new_rng();
        let sequences = two_regimes(rng, 4, 40);
        for &sticky in &[false, true] {
            let mut model = HdpHmm::new(&sequences, sticky).unwrap();
            model.initialise(5, rng).unwrap();
            let diagnostics = model.mcmc(&McmcOptions::new(200), rng).unwrap();
            assert!(diagnostics.is_complete(), "{:?}", diagnostics.failure);

            let registry = model.registry().unwrap();
            let low_regime = |label: StateLabel| {
                let phi = &registry.get(label).unwrap().emission;
                phi[0] + phi[1] > 0.5
            };
            let assignments = model.assignments().unwrap();
            let crossings: usize = assignments
                .iter()
                .map(|z| {
                    z.iter()
                        .map(|&label| low_regime(label))
                        .tuple_windows()
                        .filter(|(a, b)| a != b)
                        .count()
                })
                .sum();
            assert_that(&crossings).is_less_than_or_equal_to(3 * sequences.len());
            for z in assignments {
                assert_ne!(most_common(&z[..40]), most_common(&z[40..]));
            }
        }
    }

    /// With the same data and hyperparameters, stickiness means fewer state changes.
    #[test]
    fn stickiness_lengthens_dwell_times() {
        let rng = &mut new_rng();
        let sequences = two_regimes(rng, 4, 40);
        let mean_switches = |sticky: bool, rng: &mut Xoshiro256PlusPlus| {
            let mut priors = Priors::default_for(sticky)
                .with(Hyperparameter::Alpha, Arc::new(FixedPrior(1.0)))
                .with(Hyperparameter::Gamma, Arc::new(FixedPrior(1.0)))
                .with(Hyperparameter::AlphaPhi, Arc::new(FixedPrior(1.0)));
            if sticky {
                priors = priors.with(Hyperparameter::Kappa, Arc::new(FixedPrior(20.0)));
            }
            let mut model = HdpHmm::new(&sequences, sticky)
                .unwrap()
                .with_priors(priors)
                .unwrap();
            model.initialise(5, rng).unwrap();
            model.mcmc(&McmcOptions::new(50), rng).unwrap();
            let mut total = 0;
            for _ in 0..50 {
                let diagnostics = model.mcmc(&McmcOptions::new(1), rng).unwrap();
                assert!(diagnostics.is_complete(), "{:?}", diagnostics.failure);
                total += switches(model.assignments().unwrap());
            }
            total as f64 / 50.0
        };
        let plain = mean_switches(false, &mut *rng);
        let sticky = mean_switches(true, &mut *rng);
        assert_that(&sticky).is_less_than(0.5 * plain);
    }

    /// Data from a slowly switching HMM, fit with a fixed κ, keeps most transitions on the diagonal.
    #[test]
    fn sticky_fit_favours_self_transitions() {
        let truth = FiniteHmm::new(
            array![[0.95, 0.025, 0.025], [0.025, 0.95, 0.025], [0.025, 0.025, 0.95]],
            array![[0.9, 0.05, 0.05], [0.05, 0.9, 0.05], [0.05, 0.05, 0.9]],
            array![1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0],
        );
        let rng = &mut new_rng();
        let sequences: Vec<Vec<usize>> = (0..10)
            .map(|_| truth.sampler(&mut *rng).take(100).map(|sample| sample.y).collect())
            .collect();
        let priors =
            Priors::default_for(true).with(Hyperparameter::Kappa, Arc::new(FixedPrior(20.0)));
        let mut model = HdpHmm::new(&sequences, true)
            .unwrap()
            .with_priors(priors)
            .unwrap();
        model.initialise(5, rng).unwrap();
        model.mcmc(&McmcOptions::new(100), rng).unwrap();

        let (mut rate, mut states) = (0.0, 0.0);
        let sweeps = 50;
        for _ in 0..sweeps {
            let diagnostics = model.mcmc(&McmcOptions::new(1), rng).unwrap();
            assert!(diagnostics.is_complete(), "{:?}", diagnostics.failure);
            let (mut own, mut all) = (0, 0);
            for (source, destination, n) in model.transition_counts().unwrap().iter() {
                if source == Source::Start {
                    continue;
                }
                all += n;
                if source == Source::State(destination) {
                    own += n;
                }
            }
            rate += own as f64 / all as f64;
            states += model.state_count() as f64;
        }
        let (rate, states) = (rate / sweeps as f64, states / sweeps as f64);
        assert_that(&rate).is_greater_than(1.0 - 1.0 / states);
    }

    /// Data simulated from a known three-state HMM yields emission distributions and transition
    /// rows close to the truth once states are matched up, and smoothing with the fit recovers the
    /// hidden states about as well as smoothing with the truth.
    #[test]
    fn recovers_known_hmm() {
        let truth = FiniteHmm::new(
            array![[0.9, 0.05, 0.05], [0.05, 0.9, 0.05], [0.05, 0.05, 0.9]],
            array![
                [0.8, 0.1, 0.05, 0.05],
                [0.05, 0.85, 0.05, 0.05],
                [0.05, 0.05, 0.8, 0.1]
            ],
            array![1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0],
        );
        let rng = &mut new_rng();
        let samples: Vec<Vec<HmmSample>> = (0..20)
            .map(|_| truth.sampler(&mut *rng).take(100).collect())
            .collect();
        let sequences: Vec<Vec<usize>> = samples
            .iter()
            .map(|sequence| sequence.iter().map(|sample| sample.y).collect())
            .collect();
        let mut model =
            HdpHmm::with_alphabet(&sequences, Alphabet::new(0..4usize), false).unwrap();
        model.initialise(5, rng).unwrap();
        let diagnostics = model.mcmc(&McmcOptions::new(300), rng).unwrap();
        assert!(diagnostics.is_complete(), "{:?}", diagnostics.failure);

        let counts = model.emission_counts().unwrap();
        let (labels, fitted) = model.to_finite_hmm().unwrap();
        let index_of = |label: StateLabel| labels.iter().position(|&l| l == label).unwrap();
        let top: Vec<usize> = labels
            .iter()
            .cloned()
            .sorted_by_key(|&label| std::cmp::Reverse(counts.occupancy(label)))
            .take(3)
            .map(index_of)
            .collect();
        assert_eq!(top.len(), 3);
        let total_variation = |p: ArrayView1<f64>, q: ArrayView1<f64>| 0.5 * (&p - &q).mapv(f64::abs).sum();

        // matched[row] is the fitted state standing in for true state `row`
        let matched: Vec<usize> = top
            .iter()
            .cloned()
            .permutations(3)
            .min_by(|x, y| {
                let worst = |m: &Vec<usize>| {
                    m.iter()
                        .enumerate()
                        .map(|(row, &i)| total_variation(fitted.b.row(i), truth.b.row(row)))
                        .fold(0.0, f64::max)
                };
                worst(x).partial_cmp(&worst(y)).unwrap()
            })
            .unwrap();
        for (row, &i) in matched.iter().enumerate() {
            assert_that(&total_variation(fitted.b.row(i), truth.b.row(row))).is_less_than(0.1);
            let restricted: Array1<f64> = matched.iter().map(|&j| fitted.a[(i, j)]).collect();
            let restricted = &restricted / restricted.sum();
            assert_that(&total_variation(restricted.view(), truth.a.row(row))).is_less_than(0.1);
        }

        let argmax = |p: ArrayView1<f64>| {
            p.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (i, &x)| if x > best.1 { (i, x) } else { best })
                .0
        };
        let (mut fitted_hits, mut truth_hits, mut total) = (0, 0, 0);
        for sequence in &samples {
            let ys: Array1<usize> = sequence.iter().map(|sample| sample.y).collect();
            let fitted_smooth = fitted.smooth(&ys);
            let truth_smooth = truth.smooth(&ys);
            for (t, sample) in sequence.iter().enumerate() {
                let guess = argmax(fitted_smooth.row(t));
                if matched.get(sample.x) == Some(&guess) {
                    fitted_hits += 1;
                }
                if argmax(truth_smooth.row(t)) == sample.x {
                    truth_hits += 1;
                }
                total += 1;
            }
        }
        let fitted_accuracy = fitted_hits as f64 / total as f64;
        let truth_accuracy = truth_hits as f64 / total as f64;
        assert_that(&fitted_accuracy).is_greater_than_or_equal_to(truth_accuracy - 0.05);
    }

    /// Starting from a very small γ, every break takes nearly all of the remaining stick and the
    /// reservoir lives at the floor.
    #[test]
    fn initialise_with_tiny_gamma() {
        let sequences = repeated(&[0, 1, 2], 5, 3);
        let priors = Priors::default_for(false)
            .with(Hyperparameter::Alpha, Arc::new(FixedPrior(0.01)))
            .with(Hyperparameter::Gamma, Arc::new(FixedPrior(0.01)));
        for seed in 0..20 {
            let mut model = HdpHmm::new(&sequences, false)
                .unwrap()
                .with_priors(priors.clone())
                .unwrap();
            let rng = &mut Xoshiro256PlusPlus::seed_from_u64(seed);
            model.initialise(5, rng).unwrap();
            assert_eq!(model.state_count(), 5);
            model.check_invariants().unwrap();
        }
    }

    #[test]
    fn neglogp_covers_the_parameter_draws() {
        let sequences = repeated(&[0, 1, 2, 2], 5, 3);
        let mut model = initialised(&sequences, true, 3);
        let diagnostics = model.mcmc(&McmcOptions::new(3), &mut new_rng()).unwrap();
        assert!(diagnostics.is_complete(), "{:?}", diagnostics.failure);
        let chain = model.chain.as_ref().unwrap();
        let hyper = chain.hyper;
        let expected = -(log_likelihood(chain)
            + ln_transition_density(hyper.alpha, hyper.kappa, &chain.stick, &chain.registry)
            + ln_emission_density(hyper.alpha_phi, &chain.registry)
            + ln_stick_prior(hyper.gamma, &chain.stick)
            + model.priors.ln_pdf(&hyper));
        assert!(expected.is_finite());
        assert_that(&diagnostics.neglogp[2]).is_close_to(expected, 1e-6);
    }
}
