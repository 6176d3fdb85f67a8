//! Observation sequences, their latent assignments, and the sufficient statistics derived from them.
use crate::error::{Error, MisuseError, Result};
use crate::label::{Source, StateLabel};
use itertools::Itertools;
use ndarray::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::sync::Arc;

/// The finite set of symbols that observations are drawn from, kept in sorted order so that each
/// symbol has a dense index.
#[derive(Clone, Debug, PartialEq)]
pub struct Alphabet<S> {
    symbols: Vec<S>,
}

impl<S: Ord + Clone + Debug> Alphabet<S> {
    pub fn new<I: IntoIterator<Item = S>>(symbols: I) -> Self {
        let symbols = symbols.into_iter().sorted().dedup().collect();
        Self { symbols }
    }

    /// The symbols that occur anywhere in `sequences`.
    pub fn observed<'a, I, Q>(sequences: I) -> Self
    where
        I: IntoIterator<Item = &'a Q>,
        Q: AsRef<[S]> + ?Sized + 'a,
    {
        Self::new(
            sequences
                .into_iter()
                .flat_map(|sequence| sequence.as_ref().iter().cloned()),
        )
    }

    /// $|Σ|$
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn index_of(&self, symbol: &S) -> Option<usize> {
        self.symbols.binary_search(symbol).ok()
    }

    pub fn symbol(&self, index: usize) -> &S {
        &self.symbols[index]
    }

    pub fn symbols(&self) -> &[S] {
        &self.symbols
    }

    /// Translate every sequence to dense symbol indices.
    pub fn encode<'a, I, Q>(&self, sequences: I) -> Result<Vec<Array1<usize>>>
    where
        I: IntoIterator<Item = &'a Q>,
        Q: AsRef<[S]> + ?Sized + 'a,
    {
        let encoded = sequences
            .into_iter()
            .enumerate()
            .map(|(index, sequence)| {
                let sequence = sequence.as_ref();
                if sequence.is_empty() {
                    return Err(MisuseError::EmptySequence { index }.into());
                }
                sequence
                    .iter()
                    .map(|symbol| {
                        self.index_of(symbol)
                            .ok_or_else(|| MisuseError::UnknownSymbol { index }.into())
                    })
                    .collect::<Result<Array1<usize>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        if encoded.is_empty() {
            return Err(MisuseError::EmptyInput.into());
        }
        Ok(encoded)
    }
}

/// $n_{j,k}$: the number of adjacent pairs $(z_t = j, z_{t+1} = k)$, with the first state of each
/// sequence counted against [`Source::Start`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransitionCounts {
    rows: BTreeMap<Source, BTreeMap<StateLabel, usize>>,
}

impl TransitionCounts {
    pub fn get(&self, source: Source, destination: StateLabel) -> usize {
        self.rows
            .get(&source)
            .and_then(|row| row.get(&destination))
            .cloned()
            .unwrap_or(0)
    }

    /// The non-zero counts out of `source`.
    pub fn row(&self, source: Source) -> Option<&BTreeMap<StateLabel, usize>> {
        self.rows.get(&source)
    }

    pub fn rows(&self) -> impl Iterator<Item = (Source, &BTreeMap<StateLabel, usize>)> + '_ {
        self.rows.iter().map(|(&source, row)| (source, row))
    }

    /// Every non-zero $(j, k, n_{jk})$.
    pub fn iter(&self) -> impl Iterator<Item = (Source, StateLabel, usize)> + '_ {
        self.rows
            .iter()
            .flat_map(|(&source, row)| row.iter().map(move |(&label, &n)| (source, label, n)))
    }

    pub fn total(&self) -> usize {
        self.iter().map(|(_, _, n)| n).sum()
    }

    pub(crate) fn add(&mut self, source: Source, destination: StateLabel, n: usize) {
        *self
            .rows
            .entry(source)
            .or_insert_with(BTreeMap::new)
            .entry(destination)
            .or_insert(0) += n;
    }

    pub(crate) fn remove(&mut self, source: Source, destination: StateLabel) -> Result<()> {
        let row = self.rows.get_mut(&source);
        let n = match row.and_then(|row| row.get_mut(&destination)) {
            Some(n) => n,
            None => {
                return Err(Error::Consistency(format!(
                    "removing transition {} -> {} that was never counted",
                    source, destination
                )))
            }
        };
        *n -= 1;
        if *n == 0 {
            if let Some(row) = self.rows.get_mut(&source) {
                row.remove(&destination);
                if row.is_empty() {
                    self.rows.remove(&source);
                }
            }
        }
        Ok(())
    }

    fn tally(&mut self, z: &[StateLabel]) {
        for (i, &label) in z.iter().enumerate() {
            let source = if i == 0 {
                Source::Start
            } else {
                Source::State(z[i - 1])
            };
            self.add(source, label, 1);
        }
    }

    fn untally(&mut self, z: &[StateLabel]) -> Result<()> {
        for (i, &label) in z.iter().enumerate() {
            let source = if i == 0 {
                Source::Start
            } else {
                Source::State(z[i - 1])
            };
            self.remove(source, label)?;
        }
        Ok(())
    }
}

/// $m_{k,o}$: the number of times state $k$ emits symbol $o$.
#[derive(Clone, Debug, PartialEq)]
pub struct EmissionCounts {
    alphabet_size: usize,
    counts: BTreeMap<StateLabel, Vec<usize>>,
}

impl EmissionCounts {
    pub fn new(alphabet_size: usize) -> Self {
        Self {
            alphabet_size,
            counts: BTreeMap::new(),
        }
    }

    pub fn alphabet_size(&self) -> usize {
        self.alphabet_size
    }

    /// The emission tally of `label`, or `None` if the state never occurs.
    pub fn get(&self, label: StateLabel) -> Option<&[usize]> {
        self.counts.get(&label).map(|counts| counts.as_slice())
    }

    /// The number of time steps assigned to `label`.
    pub fn occupancy(&self, label: StateLabel) -> usize {
        self.get(label).map_or(0, |counts| counts.iter().sum())
    }

    pub fn iter(&self) -> impl Iterator<Item = (StateLabel, &[usize])> + '_ {
        self.counts
            .iter()
            .map(|(&label, counts)| (label, counts.as_slice()))
    }

    fn tally(&mut self, z: &[StateLabel], ys: ArrayView1<usize>) {
        let alphabet_size = self.alphabet_size;
        for (&label, &y) in z.iter().zip(ys) {
            self.counts
                .entry(label)
                .or_insert_with(|| vec![0; alphabet_size])[y] += 1;
        }
    }

    fn untally(&mut self, z: &[StateLabel], ys: ArrayView1<usize>) -> Result<()> {
        for (&label, &y) in z.iter().zip(ys) {
            let counts = match self.counts.get_mut(&label) {
                Some(counts) if counts[y] > 0 => counts,
                _ => {
                    return Err(Error::Consistency(format!(
                        "removing emission of symbol {} by state {} that was never counted",
                        y, label
                    )))
                }
            };
            counts[y] -= 1;
            if counts.iter().all(|&c| c == 0) {
                self.counts.remove(&label);
            }
        }
        Ok(())
    }
}

/// Owns the observation sequences (shared, read-only) and a parallel array of latent assignments.
/// Sufficient statistics are maintained incrementally as assignments are committed.
#[derive(Clone, Debug)]
pub struct SequenceStore {
    observations: Arc<Vec<Array1<usize>>>,
    assignments: Vec<Vec<StateLabel>>,
    transitions: TransitionCounts,
    emissions: EmissionCounts,
}

impl SequenceStore {
    /// `assignments` must be parallel to `observations`.
    pub fn new(
        observations: Arc<Vec<Array1<usize>>>,
        assignments: Vec<Vec<StateLabel>>,
        alphabet_size: usize,
    ) -> Self {
        assert_eq!(observations.len(), assignments.len());
        let mut store = Self {
            observations,
            assignments,
            transitions: TransitionCounts::default(),
            emissions: EmissionCounts::new(alphabet_size),
        };
        let (transitions, emissions) = store.recount();
        store.transitions = transitions;
        store.emissions = emissions;
        store
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// The total number of observations across every sequence.
    pub fn total_len(&self) -> usize {
        self.observations.iter().map(|ys| ys.len()).sum()
    }

    pub fn observations(&self) -> &[Array1<usize>] {
        &self.observations
    }

    pub fn assignments(&self) -> &[Vec<StateLabel>] {
        &self.assignments
    }

    pub fn transition_counts(&self) -> &TransitionCounts {
        &self.transitions
    }

    pub fn emission_counts(&self) -> &EmissionCounts {
        &self.emissions
    }

    /// Replace the assignment of one sequence, updating the counts in place.
    pub fn commit(&mut self, sequence: usize, z: Vec<StateLabel>) -> Result<()> {
        let ys = match self.observations.get(sequence) {
            Some(ys) if ys.len() == z.len() => ys.view(),
            Some(ys) => {
                return Err(Error::Consistency(format!(
                    "assignment of length {} for sequence {} of length {}",
                    z.len(),
                    sequence,
                    ys.len()
                )))
            }
            None => {
                return Err(Error::Consistency(format!(
                    "commit to unknown sequence {}",
                    sequence
                )))
            }
        };
        let old = std::mem::replace(&mut self.assignments[sequence], z);
        self.transitions.untally(&old)?;
        self.emissions.untally(&old, ys)?;
        self.transitions.tally(&self.assignments[sequence]);
        self.emissions.tally(&self.assignments[sequence], ys);
        Ok(())
    }

    /// Rebuild both tallies from scratch.
    pub fn recount(&self) -> (TransitionCounts, EmissionCounts) {
        let mut transitions = TransitionCounts::default();
        let mut emissions = EmissionCounts::new(self.emissions.alphabet_size);
        for (z, ys) in self.assignments.iter().zip(self.observations.iter()) {
            transitions.tally(z);
            emissions.tally(z, ys.view());
        }
        (transitions, emissions)
    }

    pub fn is_used(&self, label: StateLabel) -> bool {
        self.emissions.get(label).is_some()
    }

    pub fn used_labels(&self) -> BTreeSet<StateLabel> {
        self.assignments.iter().flatten().cloned().collect()
    }
}
