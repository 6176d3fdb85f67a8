//! A time-invariant Hidden Markov model with a fixed, finite number of states.
//!
//! This is what a posterior sample of the HDP-HMM looks like once the reservoir is dropped; see
//! [`HdpHmm::to_finite_hmm`](crate::HdpHmm::to_finite_hmm).
use crate::ndarray_utils::*;
use crate::rvs::WeightedChoiceFloat;
use ndarray::prelude::*;
use ndarray::s;
use rand::distributions::Distribution;
use rand::Rng;
use spectral::prelude::*;

const TOLERANCE: f64 = 1e-5;

/// A finite HMM, including values for each parameter.
///
/// # Math
///
/// The HMM is used to predict a sequence of observations:
///
/// $$Y=(Y_0=y_0, Y_1=y_1, \ldots, Y_{T-1}=y_{T-1})$$
///
/// ...where each $y_t \in [0, K)$.
///
/// It accomplishes this with latent variables for hidden state $X=(X_0, \ldots, X_{T-1})$ where each
/// $x_t \in [0, N)$.
///
/// The HMM has three parameters:
/// * $A$, the $N × N$ state transition matrix: $a_{ij}=P(X_t=j|X_{t-1}=i)$
/// * $B$, the $N × K$ observation matrix: $b_{ik}=P(Y_t=y_k|X_t=i)$
/// * $π$, the $N$-length initial state distribution: $π_i=P(X_1=i)$
#[derive(Clone, Debug, PartialEq)]
pub struct FiniteHmm {
    pub a: Array2<f64>,
    pub b: Array2<f64>,
    pub pi: Array1<f64>,
}

impl FiniteHmm {
    /// Create a new HMM with the given parameters.
    ///
    /// Panics if any of:
    /// - Dimensions are invalid
    /// - Probability distributions are invalid
    pub fn new(a: Array2<f64>, b: Array2<f64>, pi: Array1<f64>) -> Self {
        // Check all dimensions
        {
            asserting("B must have a positive number of rows")
                .that(&b.rows())
                .is_greater_than(0);
            asserting("B must have a positive number of columns")
                .that(&b.cols())
                .is_greater_than(0);
            assert_eq!(
                a.rows(),
                b.rows(),
                "A and B must have the same number of rows"
            );
            assert_eq!(a.rows(), a.cols(), "A must be square");
            assert_eq!(a.rows(), pi.len(), "π must be of length N");
        }

        for (name, m) in [("A", &a), ("B", &b)].iter() {
            for x in m.iter() {
                assert_that(x).is_greater_than_or_equal_to(0.0)
            }
            for row in m.genrows() {
                asserting(&format!("Each row of {} must sum to 1", name))
                    .that(&row.sum())
                    .is_close_to(1.0, TOLERANCE);
            }
        }

        for pi_i in &pi {
            assert_that(pi_i).is_greater_than_or_equal_to(0.0)
        }
        asserting("π must sum to 1")
            .that(&pi.sum())
            .is_close_to(1.0, TOLERANCE);

        Self { a, b, pi }
    }

    /// $N$, the number of states in this HMM
    pub fn n(&self) -> usize {
        self.b.rows()
    }

    /// $K$, the number of possible observations that this model can emit
    pub fn k(&self) -> usize {
        self.b.cols()
    }

    /// An endless iterator of states and the observations they emit.
    pub fn sampler<'a, R: Rng + ?Sized>(&'a self, rng: &'a mut R) -> HmmSampleIter<'a, R> {
        let choices = |m: &Array2<f64>| {
            m.genrows()
                .into_iter()
                .map(|row| WeightedChoiceFloat::from_pmf(&row.to_vec()))
                .collect::<Vec<_>>()
        };
        HmmSampleIter {
            a_weighted_choices: choices(&self.a),
            b_weighted_choices: choices(&self.b),
            c_weighted_choice: WeightedChoiceFloat::from_pmf(&self.pi.to_vec()),
            rng,
            current_state: None,
        }
    }

    /// Given an iterator of observations, this returns a new iterator that yields the probability
    /// of being in each hidden state at each time step, given the observations so far.
    ///
    /// Panics if an observation is out of bounds or impossible under the model.
    pub fn filter<I>(&self, ys: I) -> HmmFilterIter<I::IntoIter>
    where
        I: IntoIterator<Item = usize>,
    {
        HmmFilterIter {
            hmm: self,
            observations: ys.into_iter(),
            current_item: None,
        }
    }

    // Backwards: given observations after (not including) time t, what is the probability that
    // we are in each state at time t?
    //
    // Since this iterator runs backwards, it is collected backwards into the Vec. When iterated
    // backwards, element `t` of the iterator contains the p_states at time `t`.
    fn filter_backwards(&self, ys: &Array1<usize>) -> Vec<Array1<f64>> {
        ys.iter()
            .rev()
            .scan(
                None,
                |p_states_option: &mut Option<Array1<f64>>, &observation| {
                    let (new, old) = if let Some(p_states) = p_states_option {
                        (
                            self.a.dot(p_states) * self.b.column(observation),
                            self.a.dot(p_states),
                        )
                    } else {
                        (self.b.column(observation).to_owned(), uniform(self.n()))
                    };
                    *p_states_option = Some(new.normalize("filter_backwards_new"));
                    Some(old.normalize("filter_backwards_old"))
                },
            )
            .collect()
    }

    /// Given a sequence of observations, compute the probability of being in any given state at
    /// each point in time.
    ///
    /// Return a $T × N$ matrix where element (t, k) is the probability that we are in state k at
    /// time t. This is the forward-backward algorithm.
    pub fn smooth(&self, ys: &Array1<usize>) -> Array2<f64> {
        let forwards = self.filter(ys.iter().cloned());
        let backwards = self.filter_backwards(&ys);

        let mut to_return = Array2::zeros((ys.len(), self.n()));
        forwards
            .zip(backwards.iter().rev())
            .enumerate()
            .for_each(|(t, (forward, backward))| {
                to_return
                    .slice_mut(s![t, ..])
                    .assign(&(forward.p_states * backward).normalize("smooth"))
            });
        to_return
    }
}

fn uniform(n: usize) -> Array1<f64> {
    Array1::from_elem(n, 1.0 / (n as f64))
}

/// The item yielded by `HmmSampleIter`
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct HmmSample {
    pub x: usize,
    pub y: usize,
}

/// An iterator that returns random samples from an HMM
pub struct HmmSampleIter<'a, R: Rng + ?Sized + 'a> {
    a_weighted_choices: Vec<WeightedChoiceFloat>,
    b_weighted_choices: Vec<WeightedChoiceFloat>,
    c_weighted_choice: WeightedChoiceFloat,
    rng: &'a mut R,
    current_state: Option<usize>,
}

impl<'a, R: Rng + ?Sized> Iterator for HmmSampleIter<'a, R> {
    type Item = HmmSample;

    fn next(&mut self) -> Option<Self::Item> {
        let state = if let Some(current_state) = self.current_state {
            self.a_weighted_choices[current_state].sample(self.rng)
        } else {
            self.c_weighted_choice.sample(self.rng)
        };
        self.current_state = Some(state);
        Some(HmmSample {
            x: state,
            y: self.b_weighted_choices[state].sample(self.rng),
        })
    }
}

/// The item yielded by the `HmmFilterIter`.
#[derive(Clone, Debug, PartialEq)]
pub struct HmmFilterItem {
    /// The probability that we are in each state currently
    pub p_states: Array1<f64>,
}

/// This is an iterator returned by `FiniteHmm::filter`.
pub struct HmmFilterIter<'a, I>
where
    I: Iterator<Item = usize>,
{
    hmm: &'a FiniteHmm,
    observations: I,
    current_item: Option<HmmFilterItem>,
}

impl<'a, I> Iterator for HmmFilterIter<'a, I>
where
    I: Iterator<Item = usize>,
{
    type Item = HmmFilterItem;

    fn next(&mut self) -> Option<Self::Item> {
        self.observations.next().map(|observation| {
            let observation_probs = self.hmm.b.column(observation).to_owned();
            let transition_probs = if let Some(ref current_item) = self.current_item {
                current_item.p_states.dot(&self.hmm.a)
            } else {
                self.hmm.pi.to_owned()
            };
            let p_states = (observation_probs * transition_probs).normalize("filter");
            let item = HmmFilterItem { p_states };
            self.current_item = Some(item.clone());
            item
        })
    }
}
