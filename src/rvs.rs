//! Random primitives: Gamma, Beta, Dirichlet and categorical draws, plus the log-space helpers they
//! lean on.
//!
//! Gamma variates are drawn in log space so that Dirichlet components with tiny concentrations
//! (which are routine in an HDP, where a parameter is `α·β_k` for a small `β_k`) do not underflow
//! before they are normalized. A concentration of exactly zero yields a component of exactly zero.
use crate::error::{NumericFailure, Result};
use rand::distributions::{Distribution, Open01};
use rand::Rng;
use rand_distr::{Binomial, Gamma};
use std::f64;

const LANCZOS_G: f64 = 7.0;
const LANCZOS_COEFFS: [f64; 9] = [
    0.999_999_999_999_809_9,
    676.520_368_121_885_1,
    -1_259.139_216_722_402_8,
    771.323_428_777_653_1,
    -176.615_029_162_140_6,
    12.507_343_278_686_905,
    -0.138_571_095_265_720_12,
    9.984_369_578_019_572e-6,
    1.505_632_735_149_311_6e-7,
];

/// $\ln Γ(x)$ via the Lanczos approximation, with reflection below 1/2.
pub fn ln_gamma(x: f64) -> f64 {
    if x.is_nan() {
        return f64::NAN;
    }
    if x == 0.0 || x == f64::INFINITY {
        return f64::INFINITY;
    }
    if x < 0.5 {
        let sin = (f64::consts::PI * x).sin();
        if sin == 0.0 {
            return f64::INFINITY;
        }
        return f64::consts::PI.ln() - sin.abs().ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let a = LANCZOS_COEFFS
        .iter()
        .enumerate()
        .skip(1)
        .fold(LANCZOS_COEFFS[0], |acc, (i, c)| acc + c / (x + i as f64));
    let t = x + LANCZOS_G + 0.5;
    0.5 * (2.0 * f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + a.ln()
}

/// $\ln \sum_i e^{x_i}$, computed without overflow. Returns $-∞$ for an empty slice or when every
/// element is $-∞$.
pub fn logsumexp(xs: &[f64]) -> f64 {
    let max = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY || max == f64::INFINITY {
        return max;
    }
    max + xs.iter().map(|x| (x - max).exp()).sum::<f64>().ln()
}

/// Draw $\ln X$ where $X \sim \mathrm{Gamma}(\text{shape}, 1)$.
///
/// For shape below one this uses $X = Y U^{1/\text{shape}}$ with $Y \sim \mathrm{Gamma}(\text{shape} + 1, 1)$,
/// so the result stays finite even when $X$ itself would underflow.
pub fn sample_ln_gamma<R: Rng + ?Sized>(shape: f64, rng: &mut R) -> Result<f64> {
    if shape == 0.0 {
        return Ok(f64::NEG_INFINITY);
    }
    if !(shape > 0.0) || !shape.is_finite() {
        return Err(NumericFailure::InvalidDistribution { what: "gamma" }.into());
    }
    if shape < 1.0 {
        let boosted = gamma(shape + 1.0)?.sample(rng);
        let u: f64 = rng.sample(Open01);
        Ok(boosted.ln() + u.ln() / shape)
    } else {
        Ok(gamma(shape)?.sample(rng).ln())
    }
}

fn gamma(shape: f64) -> Result<Gamma<f64>> {
    Gamma::new(shape, 1.0).map_err(|_| NumericFailure::InvalidDistribution { what: "gamma" }.into())
}

/// Draw from $\mathrm{Gamma}(\text{shape}, \text{rate})$.
pub fn sample_gamma<R: Rng + ?Sized>(shape: f64, rate: f64, rng: &mut R) -> Result<f64> {
    if !(rate > 0.0) || !rate.is_finite() {
        return Err(NumericFailure::InvalidDistribution { what: "gamma" }.into());
    }
    Ok(sample_ln_gamma(shape, rng)?.exp() / rate)
}

/// Draw $X \sim \mathrm{Beta}(a, b)$ and return $(\ln X, \ln(1 - X))$.
///
/// Both logs come straight from the Gamma variates, so $1 - X$ keeps its precision when $X$ is
/// within rounding of one. Either parameter may be zero, but not both.
pub fn sample_ln_beta<R: Rng + ?Sized>(a: f64, b: f64, rng: &mut R) -> Result<(f64, f64)> {
    let ln_a = sample_ln_gamma(a, rng)?;
    let ln_b = sample_ln_gamma(b, rng)?;
    let total = logsumexp(&[ln_a, ln_b]);
    if !total.is_finite() {
        return Err(NumericFailure::InvalidDistribution { what: "beta" }.into());
    }
    Ok((ln_a - total, ln_b - total))
}

/// Draw from a Dirichlet distribution with the given concentrations.
///
/// Zero concentrations are allowed and produce exact zeros, but at least one concentration must be
/// positive. The result sums to one.
pub fn sample_dirichlet<R: Rng + ?Sized>(alphas: &[f64], rng: &mut R) -> Result<Vec<f64>> {
    let ln_draws = alphas
        .iter()
        .map(|&alpha| sample_ln_gamma(alpha, rng))
        .collect::<Result<Vec<f64>>>()?;
    let total = logsumexp(&ln_draws);
    if !total.is_finite() {
        return Err(NumericFailure::InvalidDistribution { what: "dirichlet" }.into());
    }
    let mut probs: Vec<f64> = ln_draws.iter().map(|x| (x - total).exp()).collect();
    let sum: f64 = probs.iter().sum();
    probs.iter_mut().for_each(|p| *p /= sum);
    Ok(probs)
}

/// $\ln \mathrm{Dir}(p | c)$.
///
/// A component with zero concentration is a point mass at zero: it is skipped when `p` is zero
/// there and makes the density vanish otherwise. Entries that underflowed to zero under a positive
/// concentration are evaluated at the smallest positive float.
pub fn ln_dirichlet_pdf(concentrations: &[f64], probs: &[f64]) -> f64 {
    debug_assert_eq!(concentrations.len(), probs.len());
    let mut total = 0.0;
    let mut ln_pdf = 0.0;
    for (&c, &p) in concentrations.iter().zip(probs) {
        if c == 0.0 {
            if p > 0.0 {
                return f64::NEG_INFINITY;
            }
            continue;
        }
        total += c;
        ln_pdf += (c - 1.0) * p.max(f64::MIN_POSITIVE).ln() - ln_gamma(c);
    }
    if total == 0.0 {
        return 0.0;
    }
    ln_pdf + ln_gamma(total)
}

/// Draw an index with probability proportional to `exp(ln_weights[i])`.
///
/// Returns `None` when every weight is $-∞$.
pub fn sample_categorical_ln<R: Rng + ?Sized>(ln_weights: &[f64], rng: &mut R) -> Option<usize> {
    let total = logsumexp(ln_weights);
    if !total.is_finite() {
        return None;
    }
    let mut u: f64 = rng.gen();
    let mut last_possible = None;
    for (i, w) in ln_weights.iter().enumerate() {
        let p = (w - total).exp();
        if p > 0.0 {
            last_possible = Some(i);
        }
        if u < p {
            return Some(i);
        }
        u -= p;
    }
    // Rounding can leave a sliver of u unaccounted for
    last_possible
}

/// Draw the number of occupied tables when `n` customers enter a Chinese restaurant with the given
/// concentration: $\sum_{i=0}^{n-1} \mathrm{Bernoulli}(c / (c + i))$.
///
/// The first customer always opens a table, even when the concentration is zero.
pub fn sample_table_count<R: Rng + ?Sized>(concentration: f64, n: usize, rng: &mut R) -> usize {
    (0..n)
        .filter(|&i| i == 0 || rng.gen::<f64>() * (concentration + i as f64) < concentration)
        .count()
}

pub fn sample_binomial<R: Rng + ?Sized>(n: usize, p: f64, rng: &mut R) -> Result<usize> {
    if n == 0 {
        return Ok(0);
    }
    let binomial = Binomial::new(n as u64, p.max(0.0).min(1.0))
        .map_err(|_| NumericFailure::InvalidDistribution { what: "binomial" })?;
    Ok(binomial.sample(rng) as usize)
}

/// Sample from a [categorical distribution](https://en.wikipedia.org/wiki/Categorical_distribution)
/// where the weight for each category is a float.
#[derive(Clone, Debug)]
pub struct WeightedChoiceFloat {
    cmf: Vec<f64>,
}

impl WeightedChoiceFloat {
    pub fn from_pmf(pmf: &[f64]) -> Self {
        let cmf = pmf
            .iter()
            .scan(0.0, |state, x| {
                *state += x;
                Some(*state)
            })
            .collect();
        Self { cmf }
    }
}

impl Distribution<usize> for WeightedChoiceFloat {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let total = self.cmf.last().cloned().unwrap_or(0.0);
        let sampled_uniform = rng.gen::<f64>() * total;
        self.cmf
            .iter()
            .position(|&x| sampled_uniform < x)
            .unwrap_or_else(|| self.cmf.len().saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::new_rng;
    use spectral::prelude::*;

    #[test]
    fn ln_gamma_integers() {
        let factorials = [1.0, 1.0, 2.0, 6.0, 24.0, 120.0, 720.0f64];
        for (n, f) in factorials.iter().enumerate() {
            assert_that(&ln_gamma((n + 1) as f64)).is_close_to(f.ln(), 1e-10);
        }
    }

    #[test]
    fn ln_gamma_half() {
        assert_that(&ln_gamma(0.5)).is_close_to(f64::consts::PI.sqrt().ln(), 1e-10);
        assert_that(&ln_gamma(1e-3)).is_close_to(6.907_178_885_383_853_7, 1e-8);
    }

    #[test]
    fn logsumexp_is_stable() {
        assert_that(&logsumexp(&[0.0, 0.0])).is_close_to(2.0f64.ln(), 1e-12);
        assert_that(&logsumexp(&[-1000.0, 0.0])).is_close_to(0.0, 1e-12);
        assert_that(&logsumexp(&[1000.0, 1000.0])).is_close_to(1000.0 + 2.0f64.ln(), 1e-9);
        assert_eq!(
            logsumexp(&[f64::NEG_INFINITY, f64::NEG_INFINITY]),
            f64::NEG_INFINITY
        );
        assert_eq!(logsumexp(&[]), f64::NEG_INFINITY);
    }

    #[test]
    fn gamma_mean() {
        let rng = &mut new_rng();
        let n = 20_000;
        let mean = (0..n)
            .map(|_| sample_gamma(3.0, 2.0, rng).unwrap())
            .sum::<f64>()
            / n as f64;
        assert_that(&mean).is_close_to(1.5, 0.05);
    }

    #[test]
    fn tiny_shape_stays_finite_in_log_space() {
        let rng = &mut new_rng();
        for _ in 0..100 {
            let x = sample_ln_gamma(1e-8, rng).unwrap();
            assert!(x.is_finite());
        }
    }

    #[test]
    fn gamma_rejects_negative_shape() {
        let rng = &mut new_rng();
        assert!(sample_ln_gamma(-1.0, rng).is_err());
        assert!(sample_ln_gamma(f64::NAN, rng).is_err());
    }

    #[test]
    fn beta_mean() {
        let rng = &mut new_rng();
        let n = 20_000;
        let mean = (0..n)
            .map(|_| sample_ln_beta(2.0, 6.0, rng).unwrap().0.exp())
            .sum::<f64>()
            / n as f64;
        assert_that(&mean).is_close_to(0.25, 0.01);
    }

    #[test]
    fn dirichlet_sums_to_one() {
        let rng = &mut new_rng();
        for _ in 0..1000 {
            let p = sample_dirichlet(&[1e-6, 0.3, 4.0, 1e-3], rng).unwrap();
            assert_that(&p.iter().sum::<f64>()).is_close_to(1.0, 1e-12);
            for x in p {
                assert_that(&x).is_greater_than_or_equal_to(0.0);
            }
        }
    }

    #[test]
    fn dirichlet_zero_concentration_is_zero() {
        let rng = &mut new_rng();
        let p = sample_dirichlet(&[0.0, 1.0, 0.0], rng).unwrap();
        assert_eq!(p, vec![0.0, 1.0, 0.0]);
        assert!(sample_dirichlet(&[0.0, 0.0], rng).is_err());
    }

    #[test]
    fn dirichlet_means() {
        let rng = &mut new_rng();
        let n = 10_000;
        let mut sums = [0.0; 3];
        for _ in 0..n {
            for (s, p) in sums
                .iter_mut()
                .zip(sample_dirichlet(&[1.0, 2.0, 5.0], rng).unwrap())
            {
                *s += p;
            }
        }
        assert_that(&(sums[0] / n as f64)).is_close_to(0.125, 0.01);
        assert_that(&(sums[1] / n as f64)).is_close_to(0.25, 0.01);
        assert_that(&(sums[2] / n as f64)).is_close_to(0.625, 0.01);
    }

    #[test]
    fn categorical_ln_skips_impossible() {
        let rng = &mut new_rng();
        for _ in 0..100 {
            let i = sample_categorical_ln(&[f64::NEG_INFINITY, 0.0, f64::NEG_INFINITY], rng);
            assert_eq!(i, Some(1));
        }
        assert_eq!(
            sample_categorical_ln(&[f64::NEG_INFINITY, f64::NEG_INFINITY], rng),
            None
        );
    }

    #[test]
    fn table_count_bounds() {
        let rng = &mut new_rng();
        assert_eq!(sample_table_count(1.0, 0, rng), 0);
        assert_eq!(sample_table_count(0.0, 5, rng), 1);
        for _ in 0..100 {
            let m = sample_table_count(0.5, 10, rng);
            assert_that(&m).is_greater_than_or_equal_to(1);
            assert_that(&m).is_less_than_or_equal_to(10);
        }
    }

    #[test]
    fn binomial_edges() {
        let rng = &mut new_rng();
        assert_eq!(sample_binomial(0, 0.5, rng).unwrap(), 0);
        assert_eq!(sample_binomial(7, 1.0, rng).unwrap(), 7);
        assert_eq!(sample_binomial(7, 0.0, rng).unwrap(), 0);
    }

    #[test]
    fn weighted_choice_unit() {
        let wcf = WeightedChoiceFloat::from_pmf(&[1.0]);
        assert_eq!(0, wcf.sample(&mut new_rng()))
    }

    #[test]
    fn weighted_choice_first() {
        let wcf = WeightedChoiceFloat::from_pmf(&[1.0, 0.0]);
        assert_eq!(0, wcf.sample(&mut new_rng()))
    }

    #[test]
    fn weighted_choice_last() {
        let wcf = WeightedChoiceFloat::from_pmf(&[0.0, 1.0]);
        assert_eq!(1, wcf.sample(&mut new_rng()))
    }

    #[test]
    fn weighted_choice_middle() {
        let wcf = WeightedChoiceFloat::from_pmf(&[0.0, 1.0, 0.0]);
        assert_eq!(1, wcf.sample(&mut new_rng()))
    }

    #[test]
    fn ln_beta_keeps_the_complement() {
        let rng = &mut new_rng();
        for _ in 0..1000 {
            let (ln_x, ln_rest) = sample_ln_beta(1.0, 0.01, rng).unwrap();
            assert!(ln_rest.is_finite());
            assert!(ln_rest < 0.0);
            assert_that(&(ln_x.exp() + ln_rest.exp())).is_close_to(1.0, 1e-12);
        }
    }

    #[test]
    fn dirichlet_pdf_matches_beta_density() {
        // Beta(2, 3) at 0.25 is 12 * 0.25 * 0.75^2
        let expected = (12.0 * 0.25 * 0.75f64.powi(2)).ln();
        assert_that(&ln_dirichlet_pdf(&[2.0, 3.0], &[0.25, 0.75])).is_close_to(expected, 1e-9);
        // The uniform Dirichlet over three components has density 2
        assert_that(&ln_dirichlet_pdf(&[1.0, 1.0, 1.0], &[0.2, 0.3, 0.5]))
            .is_close_to(2.0f64.ln(), 1e-9);
    }

    #[test]
    fn dirichlet_pdf_zero_concentrations() {
        assert_that(&ln_dirichlet_pdf(&[2.0, 0.0, 3.0], &[0.25, 0.0, 0.75]))
            .is_close_to(ln_dirichlet_pdf(&[2.0, 3.0], &[0.25, 0.75]), 1e-12);
        assert_eq!(
            ln_dirichlet_pdf(&[2.0, 0.0, 3.0], &[0.25, 0.1, 0.65]),
            f64::NEG_INFINITY
        );
    }
}
