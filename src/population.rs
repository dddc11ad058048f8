use std::collections::{HashSet, VecDeque};

use crate::SimError;
use crate::complex::ComplexRegistry;
use crate::molecule::{MolId, Molecule, MoleculeType};

/// Owns the molecule arena and the complex partition. Molecule types are
/// passed in by the caller; everything here is id-indexed.
#[derive(Clone, Debug)]
pub struct Population {
    pub molecules: Vec<Molecule>,
    free_slots: Vec<MolId>,
    /// Live instances per molecule type.
    pub instances: Vec<Vec<MolId>>,
    pub complexes: ComplexRegistry,
    next_uid: u64,
    pub live_count: usize,
    /// Universal traversal limit. `None` is unbounded; a finite cap bounds
    /// every breadth-first walk, including split detection, which is then
    /// exact only for complexes smaller than the cap.
    pub traversal_limit: Option<usize>,
    pub molecule_limit: usize,
}

impl Population {
    pub fn new(n_types: usize, traversal_limit: Option<usize>, molecule_limit: usize) -> Self {
        Self {
            molecules: Vec::new(),
            free_slots: Vec::new(),
            instances: vec![Vec::new(); n_types],
            complexes: ComplexRegistry::new(n_types),
            next_uid: 0,
            live_count: 0,
            traversal_limit,
            molecule_limit,
        }
    }

    pub fn mol(&self, id: MolId) -> &Molecule {
        &self.molecules[id]
    }

    pub fn mol_mut(&mut self, id: MolId) -> &mut Molecule {
        &mut self.molecules[id]
    }

    /// Create a molecule with default states in a fresh singleton complex.
    pub fn create_molecule(&mut self, ty: &MoleculeType) -> Result<MolId, SimError> {
        if self.live_count + 1 > self.molecule_limit {
            return Err(SimError::Capacity(format!(
                "global molecule limit of {} reached while adding a molecule of type {}",
                self.molecule_limit, ty.name
            )));
        }
        let uid = self.next_uid;
        self.next_uid += 1;
        let id = match self.free_slots.pop() {
            Some(slot) => {
                self.molecules[slot] = Molecule::new(uid, ty);
                slot
            }
            None => {
                self.molecules.push(Molecule::new(uid, ty));
                self.molecules.len() - 1
            }
        };
        self.molecules[id].complex = self.complexes.create(id, ty.id);
        self.instances[ty.id].push(id);
        self.live_count += 1;
        Ok(id)
    }

    /// Retire a molecule. All bonds must already be cleared.
    pub fn destroy_molecule(&mut self, ty: &MoleculeType, id: MolId) {
        debug_assert!(self.molecules[id].bonds.iter().all(|b| b.is_none()));
        let cx = self.molecules[id].complex;
        self.complexes.remove_member(cx, id, ty.id);
        if let Some(pos) = self.instances[ty.id].iter().position(|&m| m == id) {
            self.instances[ty.id].swap_remove(pos);
        }
        self.molecules[id].alive = false;
        self.free_slots.push(id);
        self.live_count -= 1;
    }

    pub fn set_component_state(&mut self, id: MolId, component: usize, value: i64) {
        self.molecules[id].states[component] = value;
        let cx = self.molecules[id].complex;
        self.complexes.get_mut(cx).invalidate_label();
    }

    pub fn set_population(&mut self, id: MolId, count: i64) {
        self.molecules[id].population = count;
        let cx = self.molecules[id].complex;
        self.complexes.get_mut(cx).invalidate_label();
    }

    /// Establish a symmetric bond. Both slots must be open. Merges the two
    /// complexes, smaller into larger, recycling the smaller id.
    pub fn bind(&mut self, m1: MolId, c1: usize, m2: MolId, c2: usize) -> Result<(), SimError> {
        if m1 == m2 && c1 == c2 {
            return Err(SimError::Model(
                "cannot bind a component to itself".to_string(),
            ));
        }
        if !self.molecules[m1].is_site_open(c1) || !self.molecules[m2].is_site_open(c2) {
            return Err(SimError::Model(format!(
                "bind target site is already bonded (molecules {} and {})",
                self.molecules[m1].uid, self.molecules[m2].uid
            )));
        }
        self.molecules[m1].bonds[c1] = Some((m2, c2));
        self.molecules[m2].bonds[c2] = Some((m1, c1));

        let cx1 = self.molecules[m1].complex;
        let cx2 = self.molecules[m2].complex;
        if cx1 == cx2 {
            self.complexes.get_mut(cx1).invalidate_label();
            return Ok(());
        }
        let (into, from) = if self.complexes.get(cx1).size() >= self.complexes.get(cx2).size() {
            (cx1, cx2)
        } else {
            (cx2, cx1)
        };
        let moved = self.complexes.merge(into, from);
        for m in moved {
            self.molecules[m].complex = into;
        }
        Ok(())
    }

    /// Clear a bond from either end. Returns both endpoints, peer second.
    /// May split the complex; split detection re-traverses from the peer
    /// endpoint under the traversal limit.
    pub fn unbind(&mut self, m: MolId, c: usize) -> Result<((MolId, usize), (MolId, usize)), SimError> {
        let (peer, pc) = self.molecules[m].bonds[c].ok_or_else(|| {
            SimError::Model(format!(
                "unbind on a free site (molecule {})",
                self.molecules[m].uid
            ))
        })?;
        self.molecules[m].bonds[c] = None;
        self.molecules[peer].bonds[pc] = None;

        let cx = self.molecules[m].complex;
        self.complexes.get_mut(cx).invalidate_label();
        if m == peer {
            return Ok(((m, c), (peer, pc)));
        }

        let reachable = self.traverse(peer, self.traversal_limit);
        if !reachable.contains(&m) {
            // Disconnected: move the peer side onto a fresh complex id.
            let peer_ty = self.molecules[peer].type_id;
            self.complexes.remove_member(cx, peer, peer_ty);
            let fresh = self.complexes.create(peer, peer_ty);
            self.molecules[peer].complex = fresh;
            for &other in reachable.iter().skip(1) {
                let t = self.molecules[other].type_id;
                self.complexes.remove_member(cx, other, t);
                self.complexes.get_mut(fresh).members.push(other);
                self.complexes.get_mut(fresh).type_counts[t] += 1;
                self.molecules[other].complex = fresh;
            }
            self.complexes.get_mut(fresh).invalidate_label();
        }
        Ok(((m, c), (peer, pc)))
    }

    /// Breadth-first walk over bond links, `start` included, visiting
    /// molecules up to `limit` hops away. Returns discovery order.
    pub fn traverse(&self, start: MolId, limit: Option<usize>) -> Vec<MolId> {
        let mut seen: HashSet<MolId> = HashSet::new();
        let mut out = Vec::new();
        let mut queue: VecDeque<(MolId, usize)> = VecDeque::new();
        seen.insert(start);
        queue.push_back((start, 0));
        while let Some((id, depth)) = queue.pop_front() {
            out.push(id);
            if limit.is_some_and(|l| depth >= l) {
                continue;
            }
            for bond in &self.molecules[id].bonds {
                if let Some((peer, _)) = bond {
                    if seen.insert(*peer) {
                        queue.push_back((*peer, depth + 1));
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::molecule::ComponentDef;

    fn two_site_type(id: usize, name: &str) -> MoleculeType {
        MoleculeType::new(
            id,
            name,
            vec![ComponentDef::site("l"), ComponentDef::site("r")],
            false,
        )
    }

    fn chain_of(pop: &mut Population, ty: &MoleculeType, n: usize) -> Vec<MolId> {
        let ids: Vec<MolId> = (0..n).map(|_| pop.create_molecule(ty).unwrap()).collect();
        for w in ids.windows(2) {
            pop.bind(w[0], 1, w[1], 0).unwrap();
        }
        ids
    }

    #[test]
    fn bind_merges_and_unbind_splits() {
        let ty = two_site_type(0, "A");
        let mut pop = Population::new(1, None, 1000);
        let ids = chain_of(&mut pop, &ty, 3);
        let cx = pop.mol(ids[0]).complex;
        assert!(ids.iter().all(|&m| pop.mol(m).complex == cx));
        assert_eq!(pop.complexes.get(cx).size(), 3);
        assert_eq!(pop.complexes.live_count(), 1);

        let ((a, ac), (b, _)) = pop.unbind(ids[1], 1).unwrap();
        assert_eq!((a, ac), (ids[1], 1));
        assert_eq!(b, ids[2]);
        assert_ne!(pop.mol(ids[2]).complex, pop.mol(ids[0]).complex);
        assert_eq!(pop.mol(ids[0]).complex, pop.mol(ids[1]).complex);
        assert_eq!(pop.complexes.live_count(), 2);
        assert_eq!(pop.complexes.get(pop.mol(ids[2]).complex).size(), 1);
    }

    #[test]
    fn bind_then_unbind_restores_partition() {
        let ty = two_site_type(0, "A");
        let mut pop = Population::new(1, None, 1000);
        let a = pop.create_molecule(&ty).unwrap();
        let b = pop.create_molecule(&ty).unwrap();
        let cx_a = pop.mol(a).complex;
        let cx_b = pop.mol(b).complex;
        pop.bind(a, 1, b, 0).unwrap();
        pop.unbind(a, 1).unwrap();
        assert!(pop.mol(a).bonds.iter().all(|s| s.is_none()));
        assert!(pop.mol(b).bonds.iter().all(|s| s.is_none()));
        assert_ne!(pop.mol(a).complex, pop.mol(b).complex);
        // One of the two original ids was recycled into the fresh complex.
        let mut now = vec![pop.mol(a).complex, pop.mol(b).complex];
        let mut then = vec![cx_a, cx_b];
        now.sort_unstable();
        then.sort_unstable();
        assert_eq!(now, then);
    }

    #[test]
    fn unbind_on_a_ring_keeps_one_complex() {
        let ty = two_site_type(0, "A");
        let mut pop = Population::new(1, None, 1000);
        let ids = chain_of(&mut pop, &ty, 3);
        pop.bind(ids[2], 1, ids[0], 0).unwrap();
        pop.unbind(ids[0], 1).unwrap();
        let cx = pop.mol(ids[0]).complex;
        assert!(ids.iter().all(|&m| pop.mol(m).complex == cx));
        assert_eq!(pop.complexes.live_count(), 1);
    }

    #[test]
    fn traversal_limit_caps_the_walk() {
        let ty = two_site_type(0, "A");
        let mut pop = Population::new(1, None, 1000);
        let ids = chain_of(&mut pop, &ty, 5);
        assert_eq!(pop.traverse(ids[0], None).len(), 5);
        assert_eq!(pop.traverse(ids[0], Some(2)).len(), 3);
        assert_eq!(pop.traverse(ids[2], Some(1)).len(), 3);
    }

    #[test]
    fn molecule_limit_rejects_creation() {
        let ty = two_site_type(0, "A");
        let mut pop = Population::new(1, None, 2);
        pop.create_molecule(&ty).unwrap();
        pop.create_molecule(&ty).unwrap();
        let err = pop.create_molecule(&ty).unwrap_err();
        assert!(matches!(err, SimError::Capacity(_)));
    }

    #[test]
    fn destroyed_slots_are_reused_with_fresh_uids() {
        let ty = two_site_type(0, "A");
        let mut pop = Population::new(1, None, 10);
        let a = pop.create_molecule(&ty).unwrap();
        let uid_a = pop.mol(a).uid;
        pop.destroy_molecule(&ty, a);
        assert_eq!(pop.live_count, 0);
        let b = pop.create_molecule(&ty).unwrap();
        assert_eq!(b, a);
        assert_ne!(pop.mol(b).uid, uid_a);
        assert_eq!(pop.instances[0], vec![b]);
    }
}
