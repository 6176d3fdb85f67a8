//! Opaque identifiers for latent states.
#[cfg(feature = "serde-1")]
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// The identifier of a latent state. Labels are stable for as long as the state is alive; a label
/// released by a dead state may later be handed to a newborn one.
#[cfg_attr(feature = "serde-1", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StateLabel(pub(crate) u32);

impl StateLabel {
    pub fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for StateLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// The origin of a transition: either the distinguished start row or an active state.
#[cfg_attr(feature = "serde-1", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Source {
    Start,
    State(StateLabel),
}

impl Source {
    pub fn label(self) -> Option<StateLabel> {
        match self {
            Source::Start => None,
            Source::State(label) => Some(label),
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Start => write!(f, "start"),
            Source::State(label) => label.fmt(f),
        }
    }
}

/// Hands out labels from a monotonically increasing counter, recycling released labels first.
#[derive(Clone, Debug, Default)]
pub(crate) struct LabelPool {
    next: u32,
    free: BTreeSet<u32>,
}

impl LabelPool {
    pub fn allocate(&mut self) -> StateLabel {
        if let Some(&id) = self.free.iter().next() {
            self.free.remove(&id);
            StateLabel(id)
        } else {
            self.next += 1;
            StateLabel(self.next - 1)
        }
    }

    pub fn release(&mut self, label: StateLabel) {
        debug_assert!(label.0 < self.next);
        self.free.insert(label.0);
    }
}
