use std::collections::VecDeque;

use crate::molecule::{ComplexId, MolId, Molecule, MoleculeType, TypeId};

/// A connected set of molecules under the bond relation.
#[derive(Clone, Debug)]
pub struct Complex {
    pub id: ComplexId,
    pub members: Vec<MolId>,
    /// Membership count per molecule type.
    pub type_counts: Vec<usize>,
    /// Lazily cached canonical label; cleared whenever a member mutates.
    pub canonical: Option<String>,
}

impl Complex {
    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn count_of_type(&self, ty: TypeId) -> usize {
        self.type_counts[ty]
    }

    pub fn invalidate_label(&mut self) {
        self.canonical = None;
    }
}

/// Registry of all complexes, with id reuse through a free queue.
/// Ids are stable while a complex is live.
#[derive(Clone, Debug, Default)]
pub struct ComplexRegistry {
    complexes: Vec<Complex>,
    free: VecDeque<ComplexId>,
    n_types: usize,
}

impl ComplexRegistry {
    pub fn new(n_types: usize) -> Self {
        Self {
            complexes: Vec::new(),
            free: VecDeque::new(),
            n_types,
        }
    }

    pub fn create(&mut self, member: MolId, ty: TypeId) -> ComplexId {
        let mut type_counts = vec![0; self.n_types];
        type_counts[ty] = 1;
        match self.free.pop_front() {
            Some(id) => {
                let c = &mut self.complexes[id];
                c.members = vec![member];
                c.type_counts = type_counts;
                c.canonical = None;
                id
            }
            None => {
                let id = self.complexes.len();
                self.complexes.push(Complex {
                    id,
                    members: vec![member],
                    type_counts,
                    canonical: None,
                });
                id
            }
        }
    }

    pub fn get(&self, id: ComplexId) -> &Complex {
        &self.complexes[id]
    }

    pub fn get_mut(&mut self, id: ComplexId) -> &mut Complex {
        &mut self.complexes[id]
    }

    pub fn is_live(&self, id: ComplexId) -> bool {
        id < self.complexes.len() && !self.complexes[id].members.is_empty()
    }

    /// Move every member of `from` into `into`. The freed id goes to the
    /// back of the reuse queue and the survivor's label is invalidated.
    /// Returns the member list of the absorbed complex so the caller can
    /// repoint the molecules.
    pub fn merge(&mut self, into: ComplexId, from: ComplexId) -> Vec<MolId> {
        debug_assert_ne!(into, from);
        let moved = std::mem::take(&mut self.complexes[from].members);
        let from_counts = std::mem::take(&mut self.complexes[from].type_counts);
        let c = &mut self.complexes[into];
        c.members.extend_from_slice(&moved);
        for (t, n) in from_counts.iter().enumerate() {
            c.type_counts[t] += n;
        }
        c.canonical = None;
        self.complexes[from].type_counts = vec![0; self.n_types];
        self.complexes[from].canonical = None;
        self.free.push_back(from);
        moved
    }

    pub fn remove_member(&mut self, id: ComplexId, member: MolId, ty: TypeId) {
        let c = &mut self.complexes[id];
        if let Some(pos) = c.members.iter().position(|&m| m == member) {
            c.members.swap_remove(pos);
            c.type_counts[ty] -= 1;
            c.canonical = None;
        }
        if c.members.is_empty() {
            self.free.push_back(id);
        }
    }

    pub fn live(&self) -> impl Iterator<Item = &Complex> {
        self.complexes.iter().filter(|c| !c.members.is_empty())
    }

    pub fn live_count(&self) -> usize {
        self.live().count()
    }
}

/// Deterministic canonical label for a complex.
///
/// For each candidate root the complex is encoded by a breadth-first walk
/// that numbers molecules in discovery order and visits bonds in component
/// order, so the per-root string depends only on graph structure; the
/// label is the lexicographic minimum over roots. Isomorphic complexes
/// therefore receive equal labels.
pub fn canonical_label(
    types: &[MoleculeType],
    molecules: &[Molecule],
    members: &[MolId],
) -> String {
    let mut best: Option<String> = None;
    for &root in members {
        let s = rooted_label(types, molecules, root, members.len());
        if best.as_ref().is_none_or(|b| s < *b) {
            best = Some(s);
        }
    }
    best.unwrap_or_default()
}

fn rooted_label(types: &[MoleculeType], molecules: &[Molecule], root: MolId, size: usize) -> String {
    use std::collections::HashMap;
    let mut order: HashMap<MolId, usize> = HashMap::with_capacity(size);
    let mut queue = VecDeque::new();
    order.insert(root, 0);
    queue.push_back(root);
    let mut out = String::new();
    while let Some(id) = queue.pop_front() {
        let m = &molecules[id];
        let ty = &types[m.type_id];
        out.push_str(&ty.name);
        out.push('(');
        for (c, def) in ty.components.iter().enumerate() {
            if c > 0 {
                out.push(',');
            }
            out.push_str(&def.name);
            if !def.states.is_empty() || def.is_integer {
                out.push('~');
                out.push_str(&ty.state_name(c, m.states[c]));
            }
            if let Some((peer, pc)) = m.bonds[c] {
                let idx = match order.get(&peer) {
                    Some(&i) => i,
                    None => {
                        let i = order.len();
                        order.insert(peer, i);
                        queue.push_back(peer);
                        i
                    }
                };
                out.push_str(&format!("!{}@{}", idx, pc));
            }
        }
        out.push(')');
        out.push('.');
    }
    out
}
