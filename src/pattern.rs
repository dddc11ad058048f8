use std::collections::HashSet;

use crate::SimError;
use crate::molecule::{MolId, MoleculeType, TypeId};
use crate::population::Population;

/// Which component of the molecule a site constraint refers to: a specific
/// component, or any member of an equivalence class of symmetric components.
#[derive(Clone, Debug, PartialEq)]
pub enum SiteRef {
    Exact(usize),
    Class(usize),
}

#[derive(Clone, Debug, PartialEq)]
pub enum BondSpec {
    /// No constraint on the bond slot.
    Any,
    Free,
    /// Bonded to anything.
    Bonded,
    /// Bonded to a specific site of another pattern molecule.
    To { molecule: usize, site: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub struct SitePattern {
    pub site: SiteRef,
    pub state: Option<i64>,
    pub bond: BondSpec,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatternMolecule {
    pub type_id: TypeId,
    pub sites: Vec<SitePattern>,
}

/// A rooted template: molecule 0 is the root, every later molecule must be
/// bonded to an earlier one so a match can be grown outward from the root.
#[derive(Clone, Debug, PartialEq)]
pub struct Pattern {
    pub molecules: Vec<PatternMolecule>,
}

/// A concrete embedding of a pattern: one molecule per pattern node and
/// one concrete component per site constraint.
#[derive(Clone, Debug)]
pub struct MappingSet {
    pub mols: Vec<MolId>,
    pub sites: Vec<Vec<usize>>,
}

impl Pattern {
    pub fn root_type(&self) -> TypeId {
        self.molecules[0].type_id
    }

    pub fn mentions_type(&self, ty: TypeId) -> bool {
        self.molecules.iter().any(|m| m.type_id == ty)
    }

    pub fn validate(&self, types: &[MoleculeType], what: &str) -> Result<(), SimError> {
        if self.molecules.is_empty() {
            return Err(SimError::Model(format!("{what}: empty pattern")));
        }
        for (i, pm) in self.molecules.iter().enumerate() {
            let ty = types.get(pm.type_id).ok_or_else(|| {
                SimError::Model(format!("{what}: pattern references an unknown molecule type"))
            })?;
            let mut class_use = vec![0usize; ty.eq_classes.len()];
            let mut anchored = i == 0;
            for (si, sp) in pm.sites.iter().enumerate() {
                let n_states = match &sp.site {
                    SiteRef::Exact(c) => {
                        if *c >= ty.components.len() {
                            return Err(SimError::Model(format!(
                                "{what}: component index {} out of range for type {}",
                                c, ty.name
                            )));
                        }
                        ty.components[*c].states.len()
                    }
                    SiteRef::Class(cl) => {
                        if *cl >= ty.eq_classes.len() {
                            return Err(SimError::Model(format!(
                                "{what}: unknown symmetric component class on type {}",
                                ty.name
                            )));
                        }
                        class_use[*cl] += 1;
                        if class_use[*cl] > ty.eq_classes[*cl].len() {
                            return Err(SimError::Model(format!(
                                "{what}: more `{}` sites constrained than type {} declares",
                                ty.eq_class_names[*cl], ty.name
                            )));
                        }
                        let first = ty.eq_classes[*cl][0];
                        ty.components[first].states.len()
                    }
                };
                if let Some(v) = sp.state {
                    let is_int = match &sp.site {
                        SiteRef::Exact(c) => ty.components[*c].is_integer,
                        SiteRef::Class(cl) => ty.components[ty.eq_classes[*cl][0]].is_integer,
                    };
                    if !is_int && (v < 0 || v as usize >= n_states.max(1)) {
                        return Err(SimError::Model(format!(
                            "{what}: state value {} out of range for type {}",
                            v, ty.name
                        )));
                    }
                }
                match &sp.bond {
                    BondSpec::To { molecule, site } => {
                        if ty.population_type {
                            return Err(SimError::Model(format!(
                                "{what}: population type {} cannot carry bonds",
                                ty.name
                            )));
                        }
                        let peer = self.molecules.get(*molecule).ok_or_else(|| {
                            SimError::Model(format!("{what}: bond edge to a missing pattern molecule"))
                        })?;
                        let back = peer.sites.get(*site).ok_or_else(|| {
                            SimError::Model(format!("{what}: bond edge to a missing pattern site"))
                        })?;
                        match &back.bond {
                            BondSpec::To { molecule: bm, site: bs } if *bm == i && *bs == si => {}
                            _ => {
                                return Err(SimError::Model(format!(
                                    "{what}: bond edges must be declared from both ends"
                                )));
                            }
                        }
                        if *molecule < i {
                            anchored = true;
                        }
                    }
                    BondSpec::Bonded if ty.population_type => {
                        return Err(SimError::Model(format!(
                            "{what}: population type {} cannot carry bonds",
                            ty.name
                        )));
                    }
                    _ => {}
                }
            }
            if !anchored {
                return Err(SimError::Model(format!(
                    "{what}: pattern molecule {} is not bonded to any earlier molecule",
                    i
                )));
            }
        }
        Ok(())
    }
}

/// Enumerate every embedding of `pattern` whose root node maps to `root`.
/// Symmetric (class) sites produce one mapping set per injective component
/// assignment, which is how symmetric multiplicity reaches the rate law.
pub fn match_all(
    pattern: &Pattern,
    types: &[MoleculeType],
    pop: &Population,
    root: MolId,
) -> Vec<MappingSet> {
    let mol = pop.mol(root);
    if !mol.alive || mol.type_id != pattern.root_type() {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut mols: Vec<Option<MolId>> = vec![None; pattern.molecules.len()];
    let mut sites: Vec<Vec<usize>> = pattern
        .molecules
        .iter()
        .map(|pm| vec![usize::MAX; pm.sites.len()])
        .collect();
    assign_node(pattern, types, pop, 0, root, &mut mols, &mut sites, &mut out);
    out
}

/// Number of embeddings rooted at `root`; the per-molecule observable count.
pub fn match_count(pattern: &Pattern, types: &[MoleculeType], pop: &Population, root: MolId) -> u32 {
    match_all(pattern, types, pop, root).len() as u32
}

/// Match-once over a complex: true if any member embeds the pattern.
pub fn matches_complex(
    pattern: &Pattern,
    types: &[MoleculeType],
    pop: &Population,
    members: &[MolId],
) -> bool {
    members
        .iter()
        .any(|&m| !match_all(pattern, types, pop, m).is_empty())
}

#[allow(clippy::too_many_arguments)]
fn assign_node(
    pattern: &Pattern,
    types: &[MoleculeType],
    pop: &Population,
    node: usize,
    candidate: MolId,
    mols: &mut Vec<Option<MolId>>,
    sites: &mut Vec<Vec<usize>>,
    out: &mut Vec<MappingSet>,
) {
    let pm = &pattern.molecules[node];
    let m = pop.mol(candidate);
    if !m.alive || m.type_id != pm.type_id {
        return;
    }
    if types[m.type_id].population_type && m.population <= 0 {
        return;
    }
    if mols.iter().any(|&a| a == Some(candidate)) {
        return;
    }
    mols[node] = Some(candidate);
    assign_sites(pattern, types, pop, node, 0, mols, sites, out);
    mols[node] = None;
}

#[allow(clippy::too_many_arguments)]
fn assign_sites(
    pattern: &Pattern,
    types: &[MoleculeType],
    pop: &Population,
    node: usize,
    site_idx: usize,
    mols: &mut Vec<Option<MolId>>,
    sites: &mut Vec<Vec<usize>>,
    out: &mut Vec<MappingSet>,
) {
    let pm = &pattern.molecules[node];
    if site_idx == pm.sites.len() {
        advance(pattern, types, pop, node, mols, sites, out);
        return;
    }
    let mol_id = mols[node].expect("node must be assigned");
    let m = pop.mol(mol_id);
    let ty = &types[m.type_id];
    let sp = &pm.sites[site_idx];

    let candidates: Vec<usize> = match &sp.site {
        SiteRef::Exact(c) => vec![*c],
        SiteRef::Class(cl) => ty.eq_classes[*cl]
            .iter()
            .copied()
            .filter(|c| !sites[node][..site_idx].contains(c))
            .collect(),
    };

    for comp in candidates {
        if let Some(v) = sp.state {
            if m.states[comp] != v {
                continue;
            }
        }
        let bond = m.bonds[comp];
        let ok = match &sp.bond {
            BondSpec::Any => true,
            BondSpec::Free => bond.is_none(),
            BondSpec::Bonded => bond.is_some(),
            BondSpec::To { molecule, site } => match bond {
                None => false,
                Some((peer, peer_comp)) => {
                    match mols[*molecule] {
                        // Peer already placed: the bond must land exactly
                        // there. An intramolecular edge whose partner site is
                        // still unassigned passes for now; the final sweep
                        // verifies it.
                        Some(assigned) => {
                            assigned == peer
                                && match sites[*molecule][*site] {
                                    usize::MAX => true,
                                    c => c == peer_comp,
                                }
                        }
                        // Peer not placed yet: type must agree, the rest is
                        // checked when that node is anchored through this bond.
                        None => pop.mol(peer).type_id == pattern.molecules[*molecule].type_id,
                    }
                }
            },
        };
        if !ok {
            continue;
        }
        sites[node][site_idx] = comp;
        assign_sites(pattern, types, pop, node, site_idx + 1, mols, sites, out);
        sites[node][site_idx] = usize::MAX;
    }
}

#[allow(clippy::too_many_arguments)]
fn advance(
    pattern: &Pattern,
    types: &[MoleculeType],
    pop: &Population,
    node: usize,
    mols: &mut Vec<Option<MolId>>,
    sites: &mut Vec<Vec<usize>>,
    out: &mut Vec<MappingSet>,
) {
    let next = node + 1;
    if next == pattern.molecules.len() {
        if full_check(pattern, pop, mols, sites) {
            out.push(MappingSet {
                mols: mols.iter().map(|m| m.unwrap()).collect(),
                sites: sites.clone(),
            });
        }
        return;
    }
    // The candidate for the next node is forced through its first bond edge
    // into the already-placed prefix.
    let pm = &pattern.molecules[next];
    for sp in &pm.sites {
        if let BondSpec::To { molecule, site } = &sp.bond {
            if *molecule < next {
                let anchor_mol = match mols[*molecule] {
                    Some(a) => a,
                    None => continue,
                };
                let anchor_comp = sites[*molecule][*site];
                if anchor_comp == usize::MAX {
                    continue;
                }
                match pop.mol(anchor_mol).bonds[anchor_comp] {
                    Some((peer, _)) => {
                        assign_node(pattern, types, pop, next, peer, mols, sites, out);
                    }
                    None => {}
                }
                return;
            }
        }
    }
}

/// Final sweep: every declared bond edge must be realised, both ways.
fn full_check(
    pattern: &Pattern,
    pop: &Population,
    mols: &[Option<MolId>],
    sites: &[Vec<usize>],
) -> bool {
    let placed: HashSet<MolId> = mols.iter().map(|m| m.unwrap()).collect();
    if placed.len() != mols.len() {
        return false;
    }
    for (i, pm) in pattern.molecules.iter().enumerate() {
        for (s, sp) in pm.sites.iter().enumerate() {
            if let BondSpec::To { molecule, site } = &sp.bond {
                let here = (mols[i].unwrap(), sites[i][s]);
                let there = (mols[*molecule].unwrap(), sites[*molecule][*site]);
                if pop.mol(here.0).bonds[here.1] != Some(there) {
                    return false;
                }
            }
        }
    }
    true
}
