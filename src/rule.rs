use std::collections::HashMap;

use meval::Expr;

use crate::SimError;
use crate::function::eval_observable_expression;
use crate::molecule::{MolId, MoleculeType, TypeId};
use crate::observable::Observable;
use crate::pattern::{MappingSet, Pattern, match_all};
use crate::population::Population;
use crate::reactant::ReactantList;

#[derive(Clone, Debug)]
pub enum RateLaw {
    Constant { value: f64 },
    /// Linked to a named parameter; re-resolved on parameter updates.
    Parameter { name: String, value: f64 },
    /// Observable-dependent rate, re-evaluated after every firing.
    Expression { expr_src: String, expr: Expr },
}

#[derive(Clone, Debug, PartialEq)]
pub enum RuleKind {
    Basic,
    /// Distribution of rates: the mapping weight at `position` is the value
    /// of local function `function` on the mapped root molecule.
    Dor { position: usize, function: usize },
}

/// Where a transformation applies. For reactant positions `site` indexes
/// the pattern's site list and resolves through the chosen mapping; for
/// product positions (`pos >= n_reactants`, counted in `Add` declaration
/// order) `node` must be 0 and `site` is a raw component index.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransformTarget {
    pub pos: usize,
    pub node: usize,
    pub site: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteMode {
    WholeComplex,
    MoleculeOnly,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Transformation {
    ChangeState {
        target: TransformTarget,
        value: i64,
    },
    Bind {
        a: TransformTarget,
        b: TransformTarget,
        /// When false, drawing both ends inside one complex is a null event.
        allow_same_complex: bool,
    },
    Unbind {
        target: TransformTarget,
    },
    Add {
        type_id: TypeId,
        states: Vec<i64>,
    },
    Delete {
        pos: usize,
        node: usize,
        mode: DeleteMode,
    },
    IncrementPopulation {
        pos: usize,
    },
    DecrementPopulation {
        pos: usize,
    },
}

#[derive(Clone, Debug)]
pub struct RuleSpec {
    pub name: String,
    pub reactants: Vec<Pattern>,
    pub transformations: Vec<Transformation>,
    pub rate: RateLaw,
    pub kind: RuleKind,
    pub total_rate: bool,
}

impl RuleSpec {
    pub fn validate(&self, types: &[MoleculeType], n_local_fns: usize) -> Result<(), SimError> {
        let what = format!("rule {}", self.name);
        for pattern in &self.reactants {
            pattern.validate(types, &what)?;
        }
        let n_reactants = self.reactants.len();
        let mut product_types: Vec<TypeId> = Vec::new();
        for tf in &self.transformations {
            match tf {
                Transformation::ChangeState { target, .. } | Transformation::Unbind { target } => {
                    self.check_target(types, &product_types, target, &what)?;
                }
                Transformation::Bind { a, b, .. } => {
                    self.check_target(types, &product_types, a, &what)?;
                    self.check_target(types, &product_types, b, &what)?;
                }
                Transformation::Add { type_id, states } => {
                    let ty = types.get(*type_id).ok_or_else(|| {
                        SimError::Model(format!("{what}: product of unknown molecule type"))
                    })?;
                    if states.len() != ty.components.len() {
                        return Err(SimError::Model(format!(
                            "{what}: product state vector does not match type {}",
                            ty.name
                        )));
                    }
                    product_types.push(*type_id);
                }
                Transformation::Delete { pos, node, .. } => {
                    let pattern = self.reactants.get(*pos).ok_or_else(|| {
                        SimError::Model(format!("{what}: delete position out of range"))
                    })?;
                    if *node >= pattern.molecules.len() {
                        return Err(SimError::Model(format!(
                            "{what}: delete node out of range"
                        )));
                    }
                }
                Transformation::IncrementPopulation { pos }
                | Transformation::DecrementPopulation { pos } => {
                    let pattern = self.reactants.get(*pos).ok_or_else(|| {
                        SimError::Model(format!("{what}: population op position out of range"))
                    })?;
                    if !types[pattern.root_type()].population_type {
                        return Err(SimError::Model(format!(
                            "{what}: population op on a non-population reactant"
                        )));
                    }
                }
            }
        }
        if let RuleKind::Dor { position, function } = &self.kind {
            if *position >= n_reactants {
                return Err(SimError::Model(format!(
                    "{what}: weighted reactant position out of range"
                )));
            }
            if *function >= n_local_fns {
                return Err(SimError::Model(format!(
                    "{what}: references an unknown local function"
                )));
            }
            if self.total_rate {
                return Err(SimError::Model(format!(
                    "{what}: TotalRate cannot be combined with a rate distribution"
                )));
            }
        }
        Ok(())
    }

    fn check_target(
        &self,
        types: &[MoleculeType],
        product_types: &[TypeId],
        t: &TransformTarget,
        what: &str,
    ) -> Result<(), SimError> {
        let n_reactants = self.reactants.len();
        if t.pos < n_reactants {
            let pattern = &self.reactants[t.pos];
            let pm = pattern.molecules.get(t.node).ok_or_else(|| {
                SimError::Model(format!("{what}: transformation node out of range"))
            })?;
            if t.site >= pm.sites.len() {
                return Err(SimError::Model(format!(
                    "{what}: transformation site index {} is not constrained by the template",
                    t.site
                )));
            }
            Ok(())
        } else {
            let add_idx = t.pos - n_reactants;
            let ty = product_types.get(add_idx).ok_or_else(|| {
                SimError::Model(format!(
                    "{what}: transformation targets a product that is not yet added"
                ))
            })?;
            if t.node != 0 {
                return Err(SimError::Model(format!(
                    "{what}: product targets use node 0"
                )));
            }
            if t.site >= types[*ty].components.len() {
                return Err(SimError::Model(format!(
                    "{what}: product component index out of range"
                )));
            }
            Ok(())
        }
    }
}

/// Runtime state of one rule: its reactant lists, propensity and counters.
#[derive(Clone, Debug)]
pub struct Rule {
    pub id: usize,
    pub name: String,
    pub reactants: Vec<Pattern>,
    pub transformations: Vec<Transformation>,
    pub rate: RateLaw,
    pub kind: RuleKind,
    pub total_rate: bool,
    pub lists: Vec<ReactantList>,
    /// Reactant positions grouped by identical templates; the corrected
    /// count divides the double-counting of each group away.
    pub sym_groups: Vec<Vec<usize>>,
    pub pop_position: Vec<bool>,
    pub a: f64,
    pub fire_count: u64,
    /// Rules whose membership can change when this one fires; used only
    /// under connectivity inference.
    pub connected: Vec<usize>,
}

impl Rule {
    pub fn from_spec(id: usize, spec: &RuleSpec, types: &[MoleculeType]) -> Self {
        let mut sym_groups: Vec<Vec<usize>> = Vec::new();
        for (p, pattern) in spec.reactants.iter().enumerate() {
            match sym_groups
                .iter_mut()
                .find(|g| spec.reactants[g[0]] == *pattern)
            {
                Some(g) => g.push(p),
                None => sym_groups.push(vec![p]),
            }
        }
        let pop_position = spec
            .reactants
            .iter()
            .map(|r| types[r.root_type()].population_type)
            .collect();
        Self {
            id,
            name: spec.name.clone(),
            reactants: spec.reactants.clone(),
            transformations: spec.transformations.clone(),
            rate: spec.rate.clone(),
            kind: spec.kind.clone(),
            total_rate: spec.total_rate,
            lists: spec.reactants.iter().map(|_| ReactantList::default()).collect(),
            sym_groups,
            pop_position,
            a: 0.0,
            fire_count: 0,
            connected: Vec::new(),
        }
    }

    pub fn n_reactants(&self) -> usize {
        self.reactants.len()
    }

    pub fn raw_count(&self, position: usize) -> usize {
        self.lists[position].len()
    }

    /// Try to register `m` at reactant position `p`, one list entry per
    /// distinct embedding. Mapping ids are recorded on the molecule for
    /// later targeted removal. DOR entries take the molecule's cached
    /// rate factor as their weight.
    pub fn try_add(&mut self, types: &[MoleculeType], pop: &mut Population, m: MolId, p: usize) {
        let pattern = &self.reactants[p];
        if pop.mol(m).type_id != pattern.root_type() {
            return;
        }
        let maps = match_all(pattern, types, pop, m);
        if maps.is_empty() {
            return;
        }
        let ty = &types[pop.mol(m).type_id];
        let slot = ty
            .slot_index(self.id, p)
            .expect("reactant slot must be wired for the root type");
        let multiplicity = if ty.population_type {
            pop.mol(m).population as f64
        } else {
            1.0
        };
        let weight = self.dor_weight(ty, pop, m, p);
        for ms in maps {
            let id = self.lists[p].insert(ms, multiplicity);
            if let Some(w) = weight {
                self.lists[p].set_weight(id, w * multiplicity);
            }
            pop.mol_mut(m).slot_mappings[slot].insert(id);
        }
    }

    /// Remove every mapping `m` holds at position `p`.
    pub fn remove(&mut self, types: &[MoleculeType], pop: &mut Population, m: MolId, p: usize) {
        let ty = &types[pop.mol(m).type_id];
        let Some(slot) = ty.slot_index(self.id, p) else {
            return;
        };
        let ids = std::mem::take(&mut pop.mol_mut(m).slot_mappings[slot]);
        for id in ids {
            self.lists[p].remove(id);
        }
    }

    /// Refresh membership of `m` at every position rooted at its type.
    pub fn update_membership(&mut self, types: &[MoleculeType], pop: &mut Population, m: MolId) {
        let ty_id = pop.mol(m).type_id;
        for p in 0..self.reactants.len() {
            if self.reactants[p].root_type() != ty_id {
                continue;
            }
            self.remove(types, pop, m, p);
            if pop.mol(m).alive {
                self.try_add(types, pop, m, p);
            }
        }
    }

    fn dor_weight(
        &self,
        ty: &MoleculeType,
        pop: &Population,
        m: MolId,
        p: usize,
    ) -> Option<f64> {
        match &self.kind {
            RuleKind::Dor { position, function } if *position == p => {
                let idx = ty.type_i_fns.iter().position(|&f| f == *function)?;
                Some(pop.mol(m).local_fn_values[idx])
            }
            _ => None,
        }
    }

    /// Push a fresh local-function value into the weights of every mapping
    /// `m` holds at the weighted position.
    pub fn notify_rate_factor_change(
        &mut self,
        types: &[MoleculeType],
        pop: &Population,
        m: MolId,
        value: f64,
    ) {
        let RuleKind::Dor { position, .. } = self.kind else {
            return;
        };
        let ty = &types[pop.mol(m).type_id];
        if self.reactants[position].root_type() != ty.id {
            return;
        }
        let Some(slot) = ty.slot_index(self.id, position) else {
            return;
        };
        let multiplicity = if ty.population_type {
            pop.mol(m).population as f64
        } else {
            1.0
        };
        let ids: Vec<u64> = pop.mol(m).slot_mappings[slot].iter().copied().collect();
        for id in ids {
            self.lists[position].set_weight(id, value * multiplicity);
        }
    }

    /// Corrected reactant-count product: within a group of identical
    /// templates the shared count enters as a falling factorial divided by
    /// the group-size factorial, so homodimerisation contributes
    /// n(n-1)/2 and an identical population pair n(n-1)/2 on the lumped
    /// counts.
    pub fn corrected_count_product(&self, skip: Option<usize>) -> f64 {
        let mut product = 1.0;
        for group in &self.sym_groups {
            let members: Vec<usize> = group
                .iter()
                .copied()
                .filter(|p| Some(*p) != skip)
                .collect();
            if members.is_empty() {
                continue;
            }
            let n = self.lists[members[0]].multiplicity_sum();
            let k = members.len();
            product *= falling_factorial(n, k) / factorial(k);
        }
        product
    }

    pub fn update_a(
        &mut self,
        observables: &[Observable],
        types: &[MoleculeType],
        pop: &Population,
        params: &HashMap<String, f64>,
    ) -> Result<f64, SimError> {
        let k = match &self.rate {
            RateLaw::Constant { value } | RateLaw::Parameter { value, .. } => *value,
            RateLaw::Expression { expr, expr_src } => eval_observable_expression(
                expr,
                &format!("rate of rule {} (`{}`)", self.name, expr_src),
                observables,
                types,
                pop,
                params,
            )?,
        };
        let a = if self.total_rate {
            if self
                .lists
                .iter()
                .all(|l| l.multiplicity_sum() >= 1.0)
            {
                k
            } else {
                0.0
            }
        } else {
            match &self.kind {
                RuleKind::Basic => k * self.corrected_count_product(None),
                RuleKind::Dor { position, .. } => {
                    k * self.lists[*position].weight_sum()
                        * self.corrected_count_product(Some(*position))
                }
            }
        };
        if !a.is_finite() {
            return Err(SimError::Numeric(format!(
                "propensity of rule {} is not finite",
                self.name
            )));
        }
        if a < -1e-9 {
            return Err(SimError::Numeric(format!(
                "propensity of rule {} is negative ({a})",
                self.name
            )));
        }
        self.a = a.max(0.0);
        Ok(self.a)
    }

    /// Draw one concrete mapping per reactant position. `draw` must yield
    /// uniform numbers in (0, 1], one consumed per position.
    pub fn pick_mappings(&self, mut draw: impl FnMut() -> f64) -> Option<Vec<MappingSet>> {
        let mut picked = Vec::with_capacity(self.lists.len());
        for (p, list) in self.lists.iter().enumerate() {
            let u = draw();
            let idx = match &self.kind {
                RuleKind::Dor { position, .. } if *position == p => list.pick_by_weight(u),
                _ if self.pop_position[p] => list.pick_by_multiplicity(u),
                _ => list.pick_uniform(u),
            }?;
            picked.push(list.get(idx).clone());
        }
        Some(picked)
    }

    /// Re-resolve a parameter-linked rate constant.
    pub fn refresh_rate(&mut self, params: &HashMap<String, f64>) -> Result<(), SimError> {
        if let RateLaw::Parameter { name, value } = &mut self.rate {
            *value = *params.get(name.as_str()).ok_or_else(|| {
                SimError::Model(format!("rate parameter {name} is not defined"))
            })?;
        }
        Ok(())
    }
}

pub fn falling_factorial(value: f64, count: usize) -> f64 {
    match count {
        0 => 1.0,
        1 => value,
        _ if value < count as f64 => 0.0,
        _ => {
            let mut acc = 1.0;
            for i in 0..count {
                acc *= value - i as f64;
            }
            acc
        }
    }
}

fn factorial(k: usize) -> f64 {
    (1..=k).map(|i| i as f64).product()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falling_factorial_basics() {
        assert_eq!(falling_factorial(5.0, 0), 1.0);
        assert_eq!(falling_factorial(5.0, 1), 5.0);
        assert_eq!(falling_factorial(100.0, 2), 9900.0);
        assert_eq!(falling_factorial(3.0, 4), 0.0);
    }

    #[test]
    fn factorial_divisor_matches_symmetry() {
        assert_eq!(factorial(1), 1.0);
        assert_eq!(factorial(2), 2.0);
        assert_eq!(factorial(3), 6.0);
    }
}
