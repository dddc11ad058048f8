use std::collections::HashMap;

use crate::pattern::MappingSet;

/// Dense store of the current embeddings for one (rule, reactant position).
/// Mapping ids are monotonically assigned and stay valid until removal, so
/// molecules can hold them for targeted deletes; storage is swap-removed.
#[derive(Clone, Debug, Default)]
pub struct ReactantList {
    mappings: Vec<MappingSet>,
    ids: Vec<u64>,
    /// Multiplicity per mapping: 1 for particle reactants, the lumped
    /// population count for population reactants.
    multiplicities: Vec<f64>,
    /// Rate factor per mapping; only meaningful on a DOR position.
    weights: Vec<f64>,
    slot_of: HashMap<u64, usize>,
    next_id: u64,
    multiplicity_sum: f64,
    weight_sum: f64,
}

impl ReactantList {
    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Total multiplicity; equals `len()` when every reactant is a particle.
    pub fn multiplicity_sum(&self) -> f64 {
        self.multiplicity_sum
    }

    pub fn weight_sum(&self) -> f64 {
        self.weight_sum
    }

    pub fn insert(&mut self, mapping: MappingSet, multiplicity: f64) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.slot_of.insert(id, self.mappings.len());
        self.mappings.push(mapping);
        self.ids.push(id);
        self.multiplicities.push(multiplicity);
        self.weights.push(0.0);
        self.multiplicity_sum += multiplicity;
        id
    }

    pub fn remove(&mut self, id: u64) -> Option<MappingSet> {
        let slot = self.slot_of.remove(&id)?;
        self.multiplicity_sum -= self.multiplicities[slot];
        self.weight_sum -= self.weights[slot];
        let mapping = self.mappings.swap_remove(slot);
        self.ids.swap_remove(slot);
        self.multiplicities.swap_remove(slot);
        self.weights.swap_remove(slot);
        if slot < self.mappings.len() {
            self.slot_of.insert(self.ids[slot], slot);
        }
        Some(mapping)
    }

    pub fn get_by_id(&self, id: u64) -> Option<&MappingSet> {
        self.slot_of.get(&id).map(|&slot| &self.mappings[slot])
    }

    pub fn get(&self, slot: usize) -> &MappingSet {
        &self.mappings[slot]
    }

    pub fn set_weight(&mut self, id: u64, weight: f64) {
        if let Some(&slot) = self.slot_of.get(&id) {
            self.weight_sum += weight - self.weights[slot];
            self.weights[slot] = weight;
        }
    }

    /// Uniform pick over mappings; the incoming draw is in (0, 1].
    pub fn pick_uniform(&self, u: f64) -> Option<usize> {
        if self.mappings.is_empty() {
            return None;
        }
        let idx = (u * self.mappings.len() as f64) as usize;
        Some(idx.min(self.mappings.len() - 1))
    }

    /// Multiplicity-weighted pick, cumulative scan in slot order.
    pub fn pick_by_multiplicity(&self, u: f64) -> Option<usize> {
        Self::cumulative_pick(&self.multiplicities, self.multiplicity_sum, u)
    }

    /// Rate-factor-weighted pick for DOR positions.
    pub fn pick_by_weight(&self, u: f64) -> Option<usize> {
        Self::cumulative_pick(&self.weights, self.weight_sum, u)
    }

    fn cumulative_pick(values: &[f64], total: f64, u: f64) -> Option<usize> {
        if values.is_empty() || total <= 0.0 {
            return None;
        }
        let target = u * total;
        let mut acc = 0.0;
        let mut last = None;
        for (i, &v) in values.iter().enumerate() {
            if v <= 0.0 {
                continue;
            }
            acc += v;
            last = Some(i);
            if target <= acc {
                return Some(i);
            }
        }
        last
    }

    /// Recompute the running sums; counters drift after many increments.
    pub fn refresh_sums(&mut self) {
        self.multiplicity_sum = self.multiplicities.iter().sum();
        self.weight_sum = self.weights.iter().sum();
    }
}
