//! Beam sampling of one latent sequence.
//!
//! A slice variable $u_t \sim U(0, π_{z_{t-1}, z_t})$ is drawn for every time step. Given the
//! slices, only transitions with $π_{j,k} > u_t$ are possible, so the forward filter runs over a
//! finite set of states even though the model has infinitely many. The slice density cancels the
//! transition probability, which leaves an indicator:
//!
//! $$
//! f_t(k) ∝ φ_{k, y_t} \sum_{j : π_{j,k} > u_t} f_{t-1}(j)
//! $$
use crate::error::{Error, NumericFailure, Result};
use crate::label::StateLabel;
use crate::registry::StateRegistry;
use crate::rvs::{logsumexp, sample_categorical_ln};
use ndarray::prelude::*;
use rand::distributions::Open01;
use rand::Rng;

/// A dense, read-only copy of $π$ and $φ$ that workers can share during one beam pass.
///
/// Rows `0..K` of `pi` are the active states in label order and row `K` is the start row. Column
/// `K` holds the reservoir $π_{j,u}$.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamSnapshot {
    labels: Vec<StateLabel>,
    pi: Array2<f64>,
    ln_phi: Array2<f64>,
}

impl ParamSnapshot {
    pub fn new(registry: &StateRegistry) -> Self {
        let labels: Vec<StateLabel> = registry.labels().collect();
        let k = labels.len();
        let mut pi = Array2::zeros((k + 1, k + 1));
        let mut ln_phi = Array2::zeros((k, registry.alphabet_size()));
        for (i, (_, params)) in registry.iter().enumerate() {
            ln_phi
                .row_mut(i)
                .assign(&params.emission.mapv(|p: f64| p.ln()));
        }
        for (source, row) in registry.rows() {
            let i = source
                .label()
                .and_then(|label| labels.binary_search(&label).ok())
                .unwrap_or(k);
            for (j, &label) in labels.iter().enumerate() {
                pi[(i, j)] = row.prob(label);
            }
            pi[(i, k)] = row.reservoir();
        }
        Self { labels, pi, ln_phi }
    }

    #[cfg(test)]
    pub(crate) fn from_parts(labels: Vec<StateLabel>, pi: Array2<f64>, phi: Array2<f64>) -> Self {
        Self {
            labels,
            pi,
            ln_phi: phi.mapv(f64::ln),
        }
    }

    /// $K$, the number of active states.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn start(&self) -> usize {
        self.labels.len()
    }

    fn index_of(&self, label: StateLabel) -> Result<usize> {
        self.labels
            .binary_search(&label)
            .map_err(|_| Error::Consistency(format!("{} is not an active state", label)))
    }

    /// $\max_j π_{j,u}$ over every row, start included.
    pub fn max_reservoir(&self) -> f64 {
        let k = self.start();
        self.pi.column(k).iter().cloned().fold(0.0, f64::max)
    }
}

/// Draw $u_t \sim U(0, π_{z_{t-1}, z_t})$ for the current assignment, with $z_{-1}$ the start row.
pub fn draw_slices<R: Rng + ?Sized>(
    snapshot: &ParamSnapshot,
    z: &[StateLabel],
    rng: &mut R,
) -> Result<Vec<f64>> {
    let mut previous = snapshot.start();
    z.iter()
        .map(|&label| {
            let current = snapshot.index_of(label)?;
            let p = snapshot.pi[(previous, current)];
            previous = current;
            let u: f64 = rng.sample(Open01);
            Ok(u * p)
        })
        .collect()
}

/// Run the sliced forward filter. Returns a $T × K$ matrix of log filtering probabilities, each row
/// normalized.
pub fn forward_filter(
    sequence: usize,
    ys: ArrayView1<usize>,
    slices: &[f64],
    snapshot: &ParamSnapshot,
) -> Result<Array2<f64>> {
    let k = snapshot.len();
    let mut forward = Array2::from_elem((ys.len(), k), f64::NEG_INFINITY);
    let mut incoming = Vec::with_capacity(k + 1);
    for (t, &y) in ys.iter().enumerate() {
        for j in 0..k {
            incoming.clear();
            if t == 0 {
                if snapshot.pi[(snapshot.start(), j)] > slices[0] {
                    incoming.push(0.0);
                }
            } else {
                incoming.extend(
                    (0..k)
                        .filter(|&i| snapshot.pi[(i, j)] > slices[t])
                        .map(|i| forward[(t - 1, i)]),
                );
            }
            forward[(t, j)] = snapshot.ln_phi[(j, y)] + logsumexp(&incoming);
        }
        let total = logsumexp(forward.row(t).as_slice().unwrap_or(&[]));
        if !total.is_finite() {
            return Err(NumericFailure::ForwardUnderflow { sequence, time: t }.into());
        }
        forward.row_mut(t).mapv_inplace(|f| f - total);
    }
    Ok(forward)
}

/// Draw $z_{T-1} ∝ f_{T-1}$, then $z_t ∝ f_t(k) 1[π_{k, z_{t+1}} > u_{t+1}]$ going backwards.
pub fn backward_sample<R: Rng + ?Sized>(
    sequence: usize,
    forward: &Array2<f64>,
    slices: &[f64],
    snapshot: &ParamSnapshot,
    rng: &mut R,
) -> Result<Vec<StateLabel>> {
    let (t_len, k) = forward.dim();
    let mut path = vec![0; t_len];
    let mut weights = vec![f64::NEG_INFINITY; k];
    for t in (0..t_len).rev() {
        for (j, weight) in weights.iter_mut().enumerate() {
            let reachable = t + 1 == t_len || snapshot.pi[(j, path[t + 1])] > slices[t + 1];
            *weight = if reachable {
                forward[(t, j)]
            } else {
                f64::NEG_INFINITY
            };
        }
        path[t] = sample_categorical_ln(&weights, rng)
            .ok_or(NumericFailure::ForwardUnderflow { sequence, time: t })?;
    }
    Ok(path.into_iter().map(|i| snapshot.labels[i]).collect())
}

/// Draw a fresh assignment for one sequence given its slices.
pub fn sample_path<R: Rng + ?Sized>(
    sequence: usize,
    ys: ArrayView1<usize>,
    slices: &[f64],
    snapshot: &ParamSnapshot,
    rng: &mut R,
) -> Result<Vec<StateLabel>> {
    let forward = forward_filter(sequence, ys, slices, snapshot)?;
    backward_sample(sequence, &forward, slices, snapshot, rng)
}
