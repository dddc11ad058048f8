use std::collections::BTreeSet;

pub type MolId = usize;
pub type TypeId = usize;
pub type ComplexId = usize;

pub const NO_COMPLEX: ComplexId = usize::MAX;

#[derive(Clone, Debug, PartialEq)]
pub struct ComponentDef {
    pub name: String,
    /// Legal symbolic states; empty for a pure binding site.
    pub states: Vec<String>,
    pub default_state: i64,
    /// Integer-valued components hold an arbitrary i64 instead of a state index.
    pub is_integer: bool,
}

impl ComponentDef {
    pub fn site(name: &str) -> Self {
        Self {
            name: name.to_string(),
            states: Vec::new(),
            default_state: 0,
            is_integer: false,
        }
    }

    pub fn with_states(name: &str, states: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            states: states.iter().map(|s| s.to_string()).collect(),
            default_state: 0,
            is_integer: false,
        }
    }
}

/// Immutable description of a molecule type, plus the static wiring
/// (reactant slots, observables, local functions) filled in when the
/// model is compiled.
#[derive(Clone, Debug)]
pub struct MoleculeType {
    pub id: TypeId,
    pub name: String,
    pub components: Vec<ComponentDef>,
    /// Component index -> equivalence class index.
    pub eq_class_of: Vec<usize>,
    /// Equivalence class -> member component indices, in declaration order.
    pub eq_classes: Vec<Vec<usize>>,
    /// Generic (shared) component name per equivalence class.
    pub eq_class_names: Vec<String>,
    pub population_type: bool,

    /// (rule index, reactant position) pairs whose root template is this type.
    pub slots: Vec<(usize, usize)>,
    /// Indices of Molecules observables rooted at this type.
    pub mol_observables: Vec<usize>,
    /// Local functions taking this type as an argument.
    pub type_i_fns: Vec<usize>,
    /// Local functions whose observables mention this type.
    pub type_ii_fns: Vec<usize>,
}

impl MoleculeType {
    /// Components sharing a name form an equivalence class and are renamed
    /// name1, name2, ... internally, keeping the shared name as the generic
    /// class name.
    pub fn new(id: TypeId, name: &str, components: Vec<ComponentDef>, population_type: bool) -> Self {
        let counts: Vec<usize> = components
            .iter()
            .map(|c| components.iter().filter(|o| o.name == c.name).count())
            .collect();

        let mut renamed = components;
        let mut eq_class_of = vec![usize::MAX; renamed.len()];
        let mut eq_classes: Vec<Vec<usize>> = Vec::new();
        let mut eq_class_names: Vec<String> = Vec::new();

        let mut i = 0;
        while i < renamed.len() {
            if eq_class_of[i] != usize::MAX {
                i += 1;
                continue;
            }
            if counts[i] > 1 {
                let generic = renamed[i].name.clone();
                let class = eq_classes.len();
                let members: Vec<usize> = (0..renamed.len())
                    .filter(|&j| renamed[j].name == generic)
                    .collect();
                for (ord, &j) in members.iter().enumerate() {
                    eq_class_of[j] = class;
                    renamed[j].name = format!("{}{}", generic, ord + 1);
                }
                eq_classes.push(members);
                eq_class_names.push(generic);
            }
            i += 1;
        }

        Self {
            id,
            name: name.to_string(),
            components: renamed,
            eq_class_of,
            eq_classes,
            eq_class_names,
            population_type,
            slots: Vec::new(),
            mol_observables: Vec::new(),
            type_i_fns: Vec::new(),
            type_ii_fns: Vec::new(),
        }
    }

    pub fn component_index(&self, name: &str) -> Option<usize> {
        self.components.iter().position(|c| c.name == name)
    }

    pub fn class_index(&self, generic: &str) -> Option<usize> {
        self.eq_class_names.iter().position(|n| n == generic)
    }

    pub fn is_symmetric_component(&self, c: usize) -> bool {
        self.eq_class_of[c] != usize::MAX
    }

    /// Resolve a symbolic state name to its encoded value.
    pub fn state_value(&self, component: usize, state: &str) -> Option<i64> {
        self.components[component]
            .states
            .iter()
            .position(|s| s == state)
            .map(|v| v as i64)
    }

    pub fn state_name(&self, component: usize, value: i64) -> String {
        let def = &self.components[component];
        if def.is_integer || def.states.is_empty() {
            value.to_string()
        } else {
            def.states
                .get(value as usize)
                .cloned()
                .unwrap_or_else(|| value.to_string())
        }
    }

    pub fn slot_index(&self, rule: usize, position: usize) -> Option<usize> {
        self.slots.iter().position(|&(r, p)| r == rule && p == position)
    }
}

/// A molecule instance. All cross-references are ids; the owning arena
/// lives in `Population`.
#[derive(Clone, Debug)]
pub struct Molecule {
    pub uid: u64,
    pub type_id: TypeId,
    pub alive: bool,
    pub complex: ComplexId,
    pub states: Vec<i64>,
    /// Per-component bond slot: peer molecule and peer component index.
    pub bonds: Vec<Option<(MolId, usize)>>,
    /// Lumped count, meaningful for population types only.
    pub population: i64,
    /// Contribution per observable of this type: embedding count times the
    /// population multiplicity.
    pub obs_matches: Vec<i64>,
    /// Mapping ids held per (rule, position) slot of this type. A set,
    /// since symmetric sites can map one molecule several times.
    pub slot_mappings: Vec<BTreeSet<u64>>,
    /// Cached values of the Type-I local functions of this type.
    pub local_fn_values: Vec<f64>,
}

impl Molecule {
    pub fn new(uid: u64, ty: &MoleculeType) -> Self {
        Self {
            uid,
            type_id: ty.id,
            alive: true,
            complex: NO_COMPLEX,
            states: ty.components.iter().map(|c| c.default_state).collect(),
            bonds: vec![None; ty.components.len()],
            population: if ty.population_type { 0 } else { 1 },
            obs_matches: vec![0; ty.mol_observables.len()],
            slot_mappings: vec![BTreeSet::new(); ty.slots.len()],
            local_fn_values: vec![0.0; ty.type_i_fns.len()],
        }
    }

    pub fn is_site_open(&self, c: usize) -> bool {
        self.bonds[c].is_none()
    }

    pub fn degree(&self) -> usize {
        self.bonds.iter().filter(|b| b.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symmetric_components_are_renamed_into_classes() {
        let ty = MoleculeType::new(
            0,
            "L",
            vec![
                ComponentDef::site("r"),
                ComponentDef::site("r"),
                ComponentDef::site("r"),
                ComponentDef::site("t"),
                ComponentDef::site("t"),
            ],
            false,
        );
        assert_eq!(ty.eq_classes.len(), 2);
        assert_eq!(ty.eq_class_names, vec!["r", "t"]);
        assert_eq!(ty.components[0].name, "r1");
        assert_eq!(ty.components[2].name, "r3");
        assert_eq!(ty.components[4].name, "t2");
        assert_eq!(ty.eq_classes[0], vec![0, 1, 2]);
        assert!(ty.is_symmetric_component(1));
        assert_eq!(ty.component_index("r2"), Some(1));
        assert_eq!(ty.class_index("r"), Some(0));
    }

    #[test]
    fn unique_components_keep_their_names() {
        let ty = MoleculeType::new(
            0,
            "A",
            vec![ComponentDef::with_states("s", &["off", "on"]), ComponentDef::site("b")],
            false,
        );
        assert!(ty.eq_classes.is_empty());
        assert_eq!(ty.component_index("s"), Some(0));
        assert_eq!(ty.state_value(0, "on"), Some(1));
        assert_eq!(ty.state_name(0, 1), "on");
    }

    #[test]
    fn fresh_molecule_takes_defaults() {
        let mut def = ComponentDef::with_states("s", &["u", "p"]);
        def.default_state = 1;
        let ty = MoleculeType::new(3, "K", vec![def, ComponentDef::site("d")], false);
        let m = Molecule::new(7, &ty);
        assert_eq!(m.states, vec![1, 0]);
        assert_eq!(m.bonds, vec![None, None]);
        assert!(m.alive);
        assert_eq!(m.degree(), 0);
    }
}
