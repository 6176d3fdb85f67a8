//! Concentration and stickiness hyperparameters, their priors, and the Metropolis-Hastings updates
//! that resample them.
use crate::error::{MisuseError, NumericFailure, Result};
use crate::label::Source;
use crate::registry::StateRegistry;
use crate::rvs::{ln_dirichlet_pdf, ln_gamma, sample_gamma};
use crate::stick::{StickBreaker, TableCounts};
use rand::distributions::Open01;
use rand::{Rng, RngCore};
use rand_distr::StandardNormal;
#[cfg(feature = "serde-1")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// The names of the four hyperparameters.
#[cfg_attr(feature = "serde-1", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Hyperparameter {
    /// $α$, the concentration of each transition row around $β$
    Alpha,
    /// $γ$, the concentration of the top-level process
    Gamma,
    /// $κ$, the extra self-transition mass
    Kappa,
    /// $α_φ$, the concentration of the symmetric emission prior
    AlphaPhi,
}

impl Hyperparameter {
    pub const ALL: [Hyperparameter; 4] = [
        Hyperparameter::Alpha,
        Hyperparameter::Gamma,
        Hyperparameter::Kappa,
        Hyperparameter::AlphaPhi,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Hyperparameter::Alpha => "alpha",
            Hyperparameter::Gamma => "gamma",
            Hyperparameter::Kappa => "kappa",
            Hyperparameter::AlphaPhi => "alpha_phi",
        }
    }
}

impl fmt::Display for Hyperparameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Current values of the hyperparameters. $κ = 0$ exactly when the model is not sticky.
#[cfg_attr(feature = "serde-1", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Hyperparameters {
    pub alpha: f64,
    pub gamma: f64,
    pub kappa: f64,
    pub alpha_phi: f64,
}

impl Hyperparameters {
    pub fn get(&self, which: Hyperparameter) -> f64 {
        match which {
            Hyperparameter::Alpha => self.alpha,
            Hyperparameter::Gamma => self.gamma,
            Hyperparameter::Kappa => self.kappa,
            Hyperparameter::AlphaPhi => self.alpha_phi,
        }
    }

    pub fn set(&mut self, which: Hyperparameter, value: f64) {
        match which {
            Hyperparameter::Alpha => self.alpha = value,
            Hyperparameter::Gamma => self.gamma = value,
            Hyperparameter::Kappa => self.kappa = value,
            Hyperparameter::AlphaPhi => self.alpha_phi = value,
        }
    }
}

/// A prior over one positive hyperparameter.
pub trait Prior: Send + Sync + fmt::Debug {
    /// Log density, up to a constant. Values outside the support give $-∞$.
    fn ln_pdf(&self, x: f64) -> f64;

    /// Draw a value from the prior.
    fn draw(&self, rng: &mut dyn RngCore) -> Result<f64>;

    /// `Some(value)` if the prior is a point mass; the hyperparameter is then never proposed.
    fn fixed_value(&self) -> Option<f64> {
        None
    }
}

/// $\mathrm{Gamma}(\text{shape}, \text{rate})$
#[cfg_attr(feature = "serde-1", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GammaPrior {
    shape: f64,
    rate: f64,
}

impl GammaPrior {
    pub fn new(shape: f64, rate: f64) -> Result<Self> {
        if !(shape > 0.0 && shape.is_finite() && rate > 0.0 && rate.is_finite()) {
            return Err(MisuseError::InvalidPrior {
                name: "gamma",
                reason: format!("shape {} and rate {} must be positive", shape, rate),
            }
            .into());
        }
        Ok(Self { shape, rate })
    }

    pub fn shape(&self) -> f64 {
        self.shape
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl Prior for GammaPrior {
    fn ln_pdf(&self, x: f64) -> f64 {
        if !(x > 0.0) || !x.is_finite() {
            return f64::NEG_INFINITY;
        }
        self.shape * self.rate.ln() - ln_gamma(self.shape) + (self.shape - 1.0) * x.ln()
            - self.rate * x
    }

    fn draw(&self, rng: &mut dyn RngCore) -> Result<f64> {
        sample_gamma(self.shape, self.rate, rng)
    }
}

/// A point mass. Hyperparameters with a fixed prior keep their value for the whole run.
#[cfg_attr(feature = "serde-1", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FixedPrior(pub f64);

impl Prior for FixedPrior {
    fn ln_pdf(&self, x: f64) -> f64 {
        if x == self.0 {
            0.0
        } else {
            f64::NEG_INFINITY
        }
    }

    fn draw(&self, _rng: &mut dyn RngCore) -> Result<f64> {
        Ok(self.0)
    }

    fn fixed_value(&self) -> Option<f64> {
        Some(self.0)
    }
}

/// One prior per hyperparameter.
#[derive(Clone, Debug)]
pub struct Priors {
    alpha: Arc<dyn Prior>,
    gamma: Arc<dyn Prior>,
    kappa: Arc<dyn Prior>,
    alpha_phi: Arc<dyn Prior>,
}

impl Priors {
    /// Weakly informative Gamma priors. Without stickiness $κ$ is pinned to zero.
    pub fn default_for(sticky: bool) -> Self {
        let weak = Arc::new(GammaPrior {
            shape: 2.0,
            rate: 0.5,
        });
        let kappa: Arc<dyn Prior> = if sticky {
            Arc::new(GammaPrior {
                shape: 2.0,
                rate: 0.1,
            })
        } else {
            Arc::new(FixedPrior(0.0))
        };
        Self {
            alpha: weak.clone(),
            gamma: weak.clone(),
            kappa,
            alpha_phi: weak,
        }
    }

    /// Replace the prior of one hyperparameter.
    pub fn with(mut self, which: Hyperparameter, prior: Arc<dyn Prior>) -> Self {
        match which {
            Hyperparameter::Alpha => self.alpha = prior,
            Hyperparameter::Gamma => self.gamma = prior,
            Hyperparameter::Kappa => self.kappa = prior,
            Hyperparameter::AlphaPhi => self.alpha_phi = prior,
        }
        self
    }

    pub fn get(&self, which: Hyperparameter) -> &dyn Prior {
        match which {
            Hyperparameter::Alpha => self.alpha.as_ref(),
            Hyperparameter::Gamma => self.gamma.as_ref(),
            Hyperparameter::Kappa => self.kappa.as_ref(),
            Hyperparameter::AlphaPhi => self.alpha_phi.as_ref(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Hyperparameter, &dyn Prior)> + '_ {
        Hyperparameter::ALL
            .iter()
            .map(move |&which| (which, self.get(which)))
    }

    /// Draw a full set of hyperparameters from the priors.
    pub fn draw(&self, rng: &mut dyn RngCore) -> Result<Hyperparameters> {
        let mut hyper = Hyperparameters {
            alpha: 0.0,
            gamma: 0.0,
            kappa: 0.0,
            alpha_phi: 0.0,
        };
        for (which, prior) in self.iter() {
            hyper.set(which, prior.draw(rng)?);
        }
        Ok(hyper)
    }

    /// $\sum \ln p(θ)$ over every hyperparameter.
    pub fn ln_pdf(&self, hyper: &Hyperparameters) -> f64 {
        self.iter()
            .map(|(which, prior)| prior.ln_pdf(hyper.get(which)))
            .sum()
    }

    /// Check that the priors can be used with a model of the given stickiness.
    pub(crate) fn validate(&self, sticky: bool) -> Result<()> {
        if !sticky && self.kappa.fixed_value() != Some(0.0) {
            return Err(MisuseError::KappaPriorWithoutStickiness.into());
        }
        for (which, prior) in self.iter() {
            if let Some(value) = prior.fixed_value() {
                let valid = match which {
                    Hyperparameter::Kappa => value >= 0.0,
                    _ => value > 0.0,
                };
                if !valid || !value.is_finite() {
                    return Err(MisuseError::InvalidPrior {
                        name: which.name(),
                        reason: format!("fixed value {} is out of range", value),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }
}

/// $\sum_j \ln \mathrm{Dir}(π_j | αβ_1 + κ_j 1[j=1], \ldots, αβ_K + κ_j 1[j=K], αβ_u)$: the density
/// of the current transition rows given $β$, where $κ_j = κ$ for states and $0$ for the start row.
pub fn ln_transition_density(
    alpha: f64,
    kappa: f64,
    stick: &StickBreaker,
    registry: &StateRegistry,
) -> f64 {
    registry
        .rows()
        .map(|(source, row)| {
            let (concentrations, probs): (Vec<f64>, Vec<f64>) = stick
                .iter()
                .map(|(label, beta)| {
                    let mut c = alpha * beta;
                    if source == Source::State(label) {
                        c += kappa;
                    }
                    (c, row.prob(label))
                })
                .chain(std::iter::once((alpha * stick.reservoir(), row.reservoir())))
                .unzip();
            ln_dirichlet_pdf(&concentrations, &probs)
        })
        .sum()
}

/// The likelihood of the table configuration under the top-level process:
/// $K \ln γ + \ln Γ(γ) - \ln Γ(γ + \bar m_{··})$.
pub fn ln_table_marginal(gamma: f64, occupied: usize, tables: usize) -> f64 {
    occupied as f64 * gamma.ln() + ln_gamma(gamma) - ln_gamma(gamma + tables as f64)
}

/// $\ln \mathrm{Dir}(β | \bar m_{·1}, \ldots, \bar m_{·K}, γ)$, the density of the current $β$ given
/// the table counts it was drawn from.
pub fn ln_stick_density(gamma: f64, tables: &TableCounts, stick: &StickBreaker) -> f64 {
    let (concentrations, probs): (Vec<f64>, Vec<f64>) = stick
        .iter()
        .map(|(label, beta)| (tables.get(label) as f64, beta))
        .chain(std::iter::once((gamma, stick.reservoir())))
        .unzip();
    ln_dirichlet_pdf(&concentrations, &probs)
}

/// The stick-breaking prior of $β$ taken in label order,
///
/// $$K \ln γ + (γ - 1) \ln β_u - \sum_{k=1}^K \ln R_k, \quad R_k = β_u + \sum_{i \geq k} β_i,$$
///
/// which is the density of $K$ independent $\mathrm{Beta}(1, γ)$ breaks after the change of
/// variables to the weights.
pub fn ln_stick_prior(gamma: f64, stick: &StickBreaker) -> f64 {
    let weights: Vec<f64> = stick.iter().map(|(_, beta)| beta).collect();
    let mut remaining = stick.reservoir();
    let mut ln_remaining = 0.0;
    for beta in weights.iter().rev() {
        remaining += beta;
        ln_remaining += remaining.ln();
    }
    weights.len() as f64 * gamma.ln() + (gamma - 1.0) * stick.reservoir().ln() - ln_remaining
}

/// $\sum_k \ln \mathrm{Dir}(φ_k | α_φ / |Σ|)$, the density of the current emission distributions
/// under the symmetric prior.
pub fn ln_emission_density(alpha_phi: f64, registry: &StateRegistry) -> f64 {
    let concentrations = vec![alpha_phi / registry.alphabet_size() as f64; registry.alphabet_size()];
    registry
        .iter()
        .map(|(_, params)| ln_dirichlet_pdf(&concentrations, &params.emission.to_vec()))
        .sum()
}

/// One Metropolis-Hastings step with the log-normal proposal $x' = x e^{σε}$.
///
/// `ln_target` is the unnormalized log posterior. The proposal is asymmetric on the original
/// scale, so the ratio carries the Jacobian $x' / x$. Proposals outside the support
/// ($\ln p = -∞$) are rejected; a NaN or $+∞$ ratio is a [`NumericFailure::NonFiniteRatio`].
///
/// Returns the new value and whether the proposal was accepted.
pub fn metropolis_log_normal<F, R>(
    which: Hyperparameter,
    current: f64,
    scale: f64,
    ln_target: F,
    rng: &mut R,
) -> Result<(f64, bool)>
where
    F: Fn(f64) -> f64,
    R: Rng + ?Sized,
{
    let epsilon: f64 = rng.sample(StandardNormal);
    let proposal = current * (scale * epsilon).exp();
    if !(proposal > 0.0) || !proposal.is_finite() {
        return Ok((current, false));
    }
    let ln_ratio = ln_target(proposal) - ln_target(current) + proposal.ln() - current.ln();
    if ln_ratio.is_nan() || ln_ratio == f64::INFINITY {
        return Err(NumericFailure::NonFiniteRatio {
            parameter: which.name(),
        }
        .into());
    }
    let u: f64 = rng.sample(Open01);
    if u.ln() < ln_ratio {
        Ok((proposal, true))
    } else {
        Ok((current, false))
    }
}
