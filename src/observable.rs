use crate::molecule::MoleculeType;
use crate::pattern::{Pattern, matches_complex};
use crate::population::Population;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObservableKind {
    /// Counts template embeddings over the molecule population; kept
    /// incrementally from per-molecule match counts.
    Molecules,
    /// Counts complexes matching the template, once per complex;
    /// evaluated on demand and requires complex tracking.
    Species,
}

#[derive(Clone, Debug)]
pub struct ObservableSpec {
    pub name: String,
    pub kind: ObservableKind,
    pub pattern: Pattern,
}

#[derive(Clone, Debug)]
pub struct Observable {
    pub name: String,
    pub kind: ObservableKind,
    pub pattern: Pattern,
    /// Aggregate embedding count; meaningful for Molecules observables.
    pub counter: i64,
}

impl Observable {
    pub fn new(spec: &ObservableSpec) -> Self {
        Self {
            name: spec.name.clone(),
            kind: spec.kind,
            pattern: spec.pattern.clone(),
            counter: 0,
        }
    }

    pub fn value(&self, types: &[MoleculeType], pop: &Population) -> f64 {
        match self.kind {
            ObservableKind::Molecules => self.counter as f64,
            ObservableKind::Species => pop
                .complexes
                .live()
                .filter(|c| matches_complex(&self.pattern, types, pop, &c.members))
                .count() as f64,
        }
    }
}
