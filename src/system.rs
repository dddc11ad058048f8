use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Instant;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::SimError;
use crate::complex::canonical_label;
use crate::function::{GlobalFunction, GlobalFunctionSpec, LocalFunction, LocalFunctionSpec};
use crate::molecule::{MolId, MoleculeType, TypeId};
use crate::observable::{Observable, ObservableKind, ObservableSpec};
use crate::pattern::{MappingSet, match_count};
use crate::population::Population;
use crate::rule::{
    DeleteMode, RateLaw, Rule, RuleKind, RuleSpec, TransformTarget, Transformation,
};

const TIME_EPSILON: f64 = 1e-12;
const PROPENSITY_TOLERANCE: f64 = 1e-9;

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub track_complexes: bool,
    pub traversal_limit: Option<usize>,
    pub molecule_limit: usize,
    pub use_connectivity: bool,
    pub verbose: bool,
    /// Wall-clock cap in seconds, checked at sample boundaries.
    pub max_cpu_time: Option<f64>,
    pub output_global_functions: bool,
    pub output_event_counter: bool,
    pub keep_firing_log: bool,
    pub log_buffer_size: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            track_complexes: true,
            traversal_limit: None,
            molecule_limit: 100_000,
            use_connectivity: false,
            verbose: false,
            max_cpu_time: None,
            output_global_functions: false,
            output_event_counter: false,
            keep_firing_log: false,
            log_buffer_size: 10_000,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SeedMolecule {
    pub type_id: TypeId,
    pub states: Vec<i64>,
}

/// One initial species: a connected assembly instantiated `count` times,
/// or a population molecule whose lumped count is `count`.
#[derive(Clone, Debug)]
pub struct SeedSpecies {
    pub molecules: Vec<SeedMolecule>,
    /// Bonds between (molecule index, component) pairs.
    pub bonds: Vec<((usize, usize), (usize, usize))>,
    pub count: i64,
}

/// Immutable, validated blueprint of a simulation. Compiling wires the
/// static lookup tables into the molecule types so running systems can be
/// stamped out cheaply (and in parallel for ensembles).
#[derive(Clone, Debug)]
pub struct Model {
    pub types: Vec<MoleculeType>,
    pub params: HashMap<String, f64>,
    pub seed_species: Vec<SeedSpecies>,
    pub observables: Vec<ObservableSpec>,
    pub global_fns: Vec<GlobalFunctionSpec>,
    pub local_fns: Vec<LocalFunctionSpec>,
    pub rules: Vec<RuleSpec>,
    pub config: SimConfig,
    /// Per rule: rules whose membership its firing can disturb.
    pub connected: Vec<Vec<usize>>,
}

impl Model {
    pub fn compile(&mut self) -> Result<(), SimError> {
        for ty in &mut self.types {
            ty.slots.clear();
            ty.mol_observables.clear();
            ty.type_i_fns.clear();
            ty.type_ii_fns.clear();
        }
        for lf in &mut self.local_fns {
            lf.arg_types.clear();
        }

        for rule in &mut self.rules {
            if let RateLaw::Parameter { name, value } = &mut rule.rate {
                *value = *self.params.get(name.as_str()).ok_or_else(|| {
                    SimError::Model(format!(
                        "rule {} references undefined parameter {}",
                        rule.name, name
                    ))
                })?;
            }
            match &rule.rate {
                RateLaw::Constant { value } | RateLaw::Parameter { value, .. } => {
                    if !value.is_finite() {
                        return Err(SimError::Model(format!(
                            "rule {} has a non-finite rate constant",
                            rule.name
                        )));
                    }
                }
                RateLaw::Expression { .. } => {}
            }
        }

        for rule in &self.rules {
            rule.validate(&self.types, self.local_fns.len())?;
        }
        for obs in &self.observables {
            obs.pattern
                .validate(&self.types, &format!("observable {}", obs.name))?;
            if obs.kind == ObservableKind::Species && !self.config.track_complexes {
                return Err(SimError::Model(format!(
                    "observable {} counts species but complex tracking is disabled",
                    obs.name
                )));
            }
        }
        for lf in &self.local_fns {
            for lo in &lf.observables {
                lo.pattern
                    .validate(&self.types, &format!("local function {}", lf.name))?;
            }
        }
        self.validate_seed_species()?;

        for (r, rule) in self.rules.iter().enumerate() {
            for (p, pattern) in rule.reactants.iter().enumerate() {
                self.types[pattern.root_type()].slots.push((r, p));
            }
        }
        for (i, obs) in self.observables.iter().enumerate() {
            if obs.kind == ObservableKind::Molecules {
                self.types[obs.pattern.root_type()].mol_observables.push(i);
            }
        }
        for rule in &self.rules {
            if let RuleKind::Dor { position, function } = &rule.kind {
                let root = rule.reactants[*position].root_type();
                let lf = &mut self.local_fns[*function];
                if !lf.arg_types.contains(&root) {
                    lf.arg_types.push(root);
                }
                if !self.types[root].type_i_fns.contains(function) {
                    self.types[root].type_i_fns.push(*function);
                }
            }
        }
        for (f, lf) in self.local_fns.iter().enumerate() {
            for ty in 0..self.types.len() {
                let reads = lf.observables.iter().any(|o| o.pattern.mentions_type(ty));
                if reads && !self.types[ty].type_ii_fns.contains(&f) {
                    self.types[ty].type_ii_fns.push(f);
                }
            }
        }

        self.connected = self.infer_connectivity();
        Ok(())
    }

    fn validate_seed_species(&self) -> Result<(), SimError> {
        for (i, sp) in self.seed_species.iter().enumerate() {
            let what = format!("initial species {i}");
            if sp.molecules.is_empty() {
                return Err(SimError::Model(format!("{what}: no molecules")));
            }
            if sp.count < 0 {
                return Err(SimError::Model(format!("{what}: negative count")));
            }
            for sm in &sp.molecules {
                let ty = self.types.get(sm.type_id).ok_or_else(|| {
                    SimError::Model(format!("{what}: unknown molecule type"))
                })?;
                if sm.states.len() != ty.components.len() {
                    return Err(SimError::Model(format!(
                        "{what}: state vector does not match type {}",
                        ty.name
                    )));
                }
                if ty.population_type && (sp.molecules.len() > 1 || !sp.bonds.is_empty()) {
                    return Err(SimError::Model(format!(
                        "{what}: population type {} cannot be part of an assembly",
                        ty.name
                    )));
                }
            }
            let mut used: HashSet<(usize, usize)> = HashSet::new();
            for &((a, ac), (b, bc)) in &sp.bonds {
                for &(m, c) in &[(a, ac), (b, bc)] {
                    let sm = sp.molecules.get(m).ok_or_else(|| {
                        SimError::Model(format!("{what}: bond references a missing molecule"))
                    })?;
                    if c >= self.types[sm.type_id].components.len() {
                        return Err(SimError::Model(format!(
                            "{what}: bond references a missing component"
                        )));
                    }
                    if !used.insert((m, c)) {
                        return Err(SimError::Model(format!(
                            "{what}: component bonded twice"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Static rule adjacency: rule B is connected to rule A when A's
    /// transformation write-set intersects B's template read-set. Used only
    /// under `use_connectivity`; unsound if a rate law reads state outside
    /// its own templates.
    fn infer_connectivity(&self) -> Vec<Vec<usize>> {
        struct Footprint {
            pairs: HashSet<(TypeId, usize)>,
            types: HashSet<TypeId>,
            all_types: bool,
        }

        let resolve_sites = |rule: &RuleSpec, t: &TransformTarget| -> (TypeId, Vec<usize>) {
            if t.pos < rule.reactants.len() {
                let pm = &rule.reactants[t.pos].molecules[t.node];
                let ty = &self.types[pm.type_id];
                let comps = match &pm.sites[t.site].site {
                    crate::pattern::SiteRef::Exact(c) => vec![*c],
                    crate::pattern::SiteRef::Class(cl) => ty.eq_classes[*cl].clone(),
                };
                (pm.type_id, comps)
            } else {
                // Product targets are resolved against the added types.
                let mut add_types = rule.transformations.iter().filter_map(|tf| match tf {
                    Transformation::Add { type_id, .. } => Some(*type_id),
                    _ => None,
                });
                let ty = add_types.nth(t.pos - rule.reactants.len()).unwrap_or(0);
                (ty, vec![t.site])
            }
        };

        let writes: Vec<Footprint> = self
            .rules
            .iter()
            .map(|rule| {
                let mut fp = Footprint {
                    pairs: HashSet::new(),
                    types: HashSet::new(),
                    all_types: false,
                };
                for tf in &rule.transformations {
                    match tf {
                        Transformation::ChangeState { target, .. }
                        | Transformation::Unbind { target } => {
                            let (ty, comps) = resolve_sites(rule, target);
                            fp.pairs.extend(comps.into_iter().map(|c| (ty, c)));
                        }
                        Transformation::Bind { a, b, .. } => {
                            for t in [a, b] {
                                let (ty, comps) = resolve_sites(rule, t);
                                fp.pairs.extend(comps.into_iter().map(|c| (ty, c)));
                            }
                        }
                        Transformation::Add { type_id, .. } => {
                            fp.types.insert(*type_id);
                            for c in 0..self.types[*type_id].components.len() {
                                fp.pairs.insert((*type_id, c));
                            }
                        }
                        Transformation::Delete { pos, node, mode } => {
                            match mode {
                                DeleteMode::MoleculeOnly => {
                                    let ty = rule.reactants[*pos].molecules[*node].type_id;
                                    fp.types.insert(ty);
                                }
                                // The complex can contain anything.
                                DeleteMode::WholeComplex => fp.all_types = true,
                            }
                        }
                        Transformation::IncrementPopulation { pos }
                        | Transformation::DecrementPopulation { pos } => {
                            fp.types.insert(rule.reactants[*pos].root_type());
                        }
                    }
                }
                fp
            })
            .collect();

        let reads: Vec<Footprint> = self
            .rules
            .iter()
            .map(|rule| {
                let mut fp = Footprint {
                    pairs: HashSet::new(),
                    types: HashSet::new(),
                    all_types: false,
                };
                for pattern in &rule.reactants {
                    for pm in &pattern.molecules {
                        fp.types.insert(pm.type_id);
                        let ty = &self.types[pm.type_id];
                        for sp in &pm.sites {
                            let comps = match &sp.site {
                                crate::pattern::SiteRef::Exact(c) => vec![*c],
                                crate::pattern::SiteRef::Class(cl) => ty.eq_classes[*cl].clone(),
                            };
                            fp.pairs.extend(comps.into_iter().map(|c| (pm.type_id, c)));
                        }
                    }
                }
                fp
            })
            .collect();

        (0..self.rules.len())
            .map(|a| {
                (0..self.rules.len())
                    .filter(|&b| {
                        a == b
                            || writes[a].all_types
                            || writes[a].pairs.intersection(&reads[b].pairs).next().is_some()
                            || writes[a].types.intersection(&reads[b].types).next().is_some()
                    })
                    .collect()
            })
            .collect()
    }
}

/// Binary-indexed sum over per-rule propensities; selection descends
/// left-first, so equal cumulative targets resolve in rule insertion order.
#[derive(Clone, Debug)]
struct PropensityTree {
    len: usize,
    leaf_count: usize,
    data: Vec<f64>,
}

impl PropensityTree {
    fn new(len: usize) -> Self {
        let base = len.max(1);
        let leaf_count = base.next_power_of_two();
        Self {
            len,
            leaf_count,
            data: vec![0.0; leaf_count * 2],
        }
    }

    fn rebuild(&mut self, values: &[f64]) {
        debug_assert_eq!(values.len(), self.len);
        self.data.fill(0.0);
        for (idx, &value) in values.iter().enumerate() {
            self.data[self.leaf_count + idx] = value;
        }
        for idx in (1..self.leaf_count).rev() {
            self.data[idx] = self.data[idx << 1] + self.data[idx << 1 | 1];
        }
    }

    fn total(&self) -> f64 {
        self.data[1]
    }

    fn update(&mut self, idx: usize, value: f64) {
        let mut pos = self.leaf_count + idx;
        self.data[pos] = value;
        while pos > 1 {
            pos >>= 1;
            self.data[pos] = self.data[pos << 1] + self.data[pos << 1 | 1];
        }
    }

    fn select(&self, mut target: f64) -> usize {
        debug_assert!(self.len > 0);
        let mut node = 1usize;
        while node < self.leaf_count {
            let left = self.data[node << 1];
            if left > 0.0 && target <= left {
                node <<= 1;
            } else {
                target -= left;
                node = (node << 1) | 1;
            }
        }
        let idx = node - self.leaf_count;
        if idx >= self.len { self.len - 1 } else { idx }
    }
}

#[derive(Clone, Debug)]
pub struct FiringRecord {
    pub time: f64,
    pub rule: usize,
    pub mols: Vec<u64>,
    pub bonds_made: Vec<(u64, usize, u64, usize)>,
    pub bonds_broken: Vec<(u64, usize, u64, usize)>,
}

/// Observable stream, row-major: one row per sample time.
#[derive(Clone, Debug, Default)]
pub struct SampleTable {
    pub columns: Vec<String>,
    pub data: Vec<f64>,
}

impl SampleTable {
    pub fn n_rows(&self) -> usize {
        if self.columns.is_empty() {
            0
        } else {
            self.data.len() / self.columns.len()
        }
    }

    pub fn row(&self, i: usize) -> &[f64] {
        let w = self.columns.len();
        &self.data[i * w..(i + 1) * w]
    }

    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let c = self.columns.iter().position(|n| n == name)?;
        let w = self.columns.len();
        Some(self.data.iter().skip(c).step_by(w).copied().collect())
    }

    pub fn write_text(&self, out: &mut impl Write, csv: bool) -> std::io::Result<()> {
        let sep = if csv { "," } else { " " };
        if csv {
            writeln!(out, "{}", self.columns.join(sep))?;
        } else {
            writeln!(out, "# {}", self.columns.join(sep))?;
        }
        for i in 0..self.n_rows() {
            let row: Vec<String> = self.row(i).iter().map(|v| format!("{v:.6}")).collect();
            writeln!(out, "{}", row.join(sep))?;
        }
        Ok(())
    }
}

enum FireOutcome {
    Fired,
    Null,
}

/// A running simulation: one mutable state, one RNG, consumed strictly in
/// the order time draw, rule draw, then one draw per reactant position.
pub struct System {
    pub types: Vec<MoleculeType>,
    pub params: HashMap<String, f64>,
    pub pop: Population,
    pub rules: Vec<Rule>,
    pub observables: Vec<Observable>,
    pub global_fns: Vec<GlobalFunction>,
    pub local_fns: Vec<LocalFunction>,
    pub config: SimConfig,
    rng: ChaCha8Rng,
    prop_tree: PropensityTree,
    pub a_tot: f64,
    pub time: f64,
    pub event_count: u64,
    pub null_event_count: u64,
    pub firing_log: Vec<FiringRecord>,
    log_writer: Option<BufWriter<File>>,
    /// Rules with expression rate laws; recomputed after every firing.
    expression_rules: Vec<usize>,
    /// DOR rules per local function.
    dor_users: Vec<Vec<usize>>,
}

impl System {
    pub fn new(model: &Model, seed: u64) -> Result<Self, SimError> {
        let types = model.types.clone();
        let mut pop = Population::new(
            types.len(),
            model.config.traversal_limit,
            model.config.molecule_limit,
        );

        for sp in &model.seed_species {
            let first_ty = sp.molecules[0].type_id;
            if types[first_ty].population_type {
                let id = pop.create_molecule(&types[first_ty])?;
                pop.mol_mut(id).states = sp.molecules[0].states.clone();
                pop.set_population(id, sp.count);
                continue;
            }
            for _ in 0..sp.count {
                let ids: Vec<MolId> = sp
                    .molecules
                    .iter()
                    .map(|sm| {
                        let id = pop.create_molecule(&types[sm.type_id])?;
                        pop.mol_mut(id).states = sm.states.clone();
                        Ok(id)
                    })
                    .collect::<Result<_, SimError>>()?;
                for &((a, ac), (b, bc)) in &sp.bonds {
                    pop.bind(ids[a], ac, ids[b], bc)?;
                }
            }
        }

        let rules: Vec<Rule> = model
            .rules
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let mut r = Rule::from_spec(i, spec, &types);
                r.connected = model.connected.get(i).cloned().unwrap_or_default();
                r
            })
            .collect();
        let observables: Vec<Observable> = model.observables.iter().map(Observable::new).collect();
        let global_fns: Vec<GlobalFunction> =
            model.global_fns.iter().map(GlobalFunction::new).collect();
        let local_fns: Vec<LocalFunction> = model.local_fns.iter().map(LocalFunction::new).collect();

        let expression_rules = rules
            .iter()
            .enumerate()
            .filter(|(_, r)| matches!(r.rate, RateLaw::Expression { .. }))
            .map(|(i, _)| i)
            .collect();
        let mut dor_users = vec![Vec::new(); local_fns.len()];
        for (i, r) in rules.iter().enumerate() {
            if let RuleKind::Dor { function, .. } = &r.kind {
                dor_users[*function].push(i);
            }
        }

        let mut sys = Self {
            prop_tree: PropensityTree::new(rules.len()),
            rng: ChaCha8Rng::seed_from_u64(seed),
            a_tot: 0.0,
            time: 0.0,
            event_count: 0,
            null_event_count: 0,
            firing_log: Vec::new(),
            log_writer: None,
            expression_rules,
            dor_users,
            types,
            params: model.params.clone(),
            pop,
            rules,
            observables,
            global_fns,
            local_fns,
            config: model.config.clone(),
        };
        sys.prepare()?;
        Ok(sys)
    }

    pub fn register_log_file(&mut self, path: &str) -> Result<(), SimError> {
        let file = File::create(path)
            .map_err(|e| SimError::InvalidArgument(format!("cannot open log file {path}: {e}")))?;
        self.log_writer = Some(BufWriter::new(file));
        Ok(())
    }

    /// Match every molecule against every rule and observable, seed the
    /// local-function caches and build the propensity aggregate.
    fn prepare(&mut self) -> Result<(), SimError> {
        let all: Vec<MolId> = self
            .pop
            .instances
            .iter()
            .flat_map(|v| v.iter().copied())
            .collect();
        let disturbed: BTreeSet<MolId> = all.into_iter().collect();
        self.refresh_local_functions(&disturbed)?;
        let Self { types, pop, rules, .. } = self;
        for rule in rules.iter_mut() {
            for p in 0..rule.n_reactants() {
                let root = rule.reactants[p].root_type();
                let instances = pop.instances[root].clone();
                for m in instances {
                    rule.try_add(types, pop, m, p);
                }
            }
        }
        self.refresh_observables(&disturbed);
        self.refresh_global_functions()?;
        self.rebuild_propensities()
    }

    /// Full propensity rebuild; also used after parameter updates.
    pub fn rebuild_propensities(&mut self) -> Result<(), SimError> {
        let Self {
            types,
            pop,
            rules,
            observables,
            params,
            ..
        } = self;
        let mut values = Vec::with_capacity(rules.len());
        for rule in rules.iter_mut() {
            for list in &mut rule.lists {
                list.refresh_sums();
            }
            values.push(rule.update_a(observables, types, pop, params)?);
        }
        self.prop_tree.rebuild(&values);
        self.a_tot = self.prop_tree.total();
        self.check_a_tot()
    }

    fn check_a_tot(&mut self) -> Result<(), SimError> {
        if !self.a_tot.is_finite() {
            return Err(SimError::Numeric(
                "total propensity is not finite".to_string(),
            ));
        }
        if self.a_tot < -PROPENSITY_TOLERANCE {
            return Err(SimError::Numeric(format!(
                "total propensity is negative ({})",
                self.a_tot
            )));
        }
        self.a_tot = self.a_tot.max(0.0);
        Ok(())
    }

    pub fn set_parameter(&mut self, name: &str, value: f64) -> Result<(), SimError> {
        if !self.params.contains_key(name) {
            return Err(SimError::Model(format!("parameter {name} is not defined")));
        }
        self.params.insert(name.to_string(), value);
        for rule in &mut self.rules {
            rule.refresh_rate(&self.params)?;
        }
        self.refresh_global_functions()?;
        self.rebuild_propensities()
    }

    fn sample_columns(&self) -> Vec<String> {
        let mut cols = vec!["time".to_string()];
        cols.extend(self.observables.iter().map(|o| o.name.clone()));
        if self.config.output_global_functions {
            cols.extend(self.global_fns.iter().map(|f| f.name.clone()));
        }
        if self.config.output_event_counter {
            cols.push("events".to_string());
        }
        cols
    }

    fn push_sample(&self, table: &mut SampleTable) {
        table.data.push(self.time);
        for o in &self.observables {
            table.data.push(o.value(&self.types, &self.pop));
        }
        if self.config.output_global_functions {
            for f in &self.global_fns {
                table.data.push(f.value);
            }
        }
        if self.config.output_event_counter {
            table.data.push(self.event_count as f64);
        }
    }

    /// Run for `duration` simulated seconds, emitting `n_samples` equally
    /// spaced samples after the initial row. A draw whose waiting time
    /// crosses the next boundary is discarded and redrawn there.
    pub fn sim(&mut self, duration: f64, n_samples: usize) -> Result<SampleTable, SimError> {
        if duration <= 0.0 {
            return Err(SimError::InvalidArgument(
                "duration must be positive".to_string(),
            ));
        }
        let started = Instant::now();
        let t0 = self.time;
        let n = n_samples.max(1);
        let dt_sample = duration / n as f64;
        let mut table = SampleTable {
            columns: self.sample_columns(),
            data: Vec::with_capacity((n + 1) * (1 + self.observables.len())),
        };
        self.push_sample(&mut table);

        for i in 1..=n {
            let boundary = t0 + dt_sample * i as f64;
            loop {
                let tau = self.draw_tau();
                if self.time + tau + TIME_EPSILON >= boundary {
                    self.time = boundary;
                    break;
                }
                self.time += tau;
                self.fire_next()?;
            }
            self.push_sample(&mut table);
            self.flush_firing_log()?;
            if self.config.verbose {
                println!(
                    "\tt = {:.6}\tevents = {}\tnull = {}",
                    self.time, self.event_count, self.null_event_count
                );
            }
            if let Some(cap) = self.config.max_cpu_time {
                if started.elapsed().as_secs_f64() > cap {
                    // Wall-clock cap hit: freeze the state into the
                    // remaining sample rows and stop.
                    for _ in (i + 1)..=n {
                        self.push_sample(&mut table);
                    }
                    break;
                }
            }
        }
        Ok(table)
    }

    /// Fire events until the next waiting time would cross `t`; never
    /// advances past `t`.
    pub fn step_to(&mut self, t: f64) -> Result<f64, SimError> {
        loop {
            let tau = self.draw_tau();
            if self.time + tau > t {
                break;
            }
            self.time += tau;
            self.fire_next()?;
        }
        Ok(self.time)
    }

    /// Run for `duration`, then reset the clock to its previous value.
    pub fn equilibrate(&mut self, duration: f64) -> Result<(), SimError> {
        let t0 = self.time;
        self.step_to(t0 + duration)?;
        self.time = t0;
        Ok(())
    }

    /// Advance by exactly one event (real or null). Returns false at a
    /// dead state, without consuming any random numbers.
    pub fn single_step(&mut self) -> Result<bool, SimError> {
        let tau = self.draw_tau();
        if !tau.is_finite() {
            return Ok(false);
        }
        self.time += tau;
        self.fire_next()?;
        Ok(true)
    }

    /// Exponential waiting time; infinite at a dead state, in which case
    /// no random number is consumed.
    fn draw_tau(&mut self) -> f64 {
        if self.a_tot > 0.0 {
            let u1: f64 = self.rng.r#gen();
            -u1.ln() / self.a_tot
        } else {
            f64::INFINITY
        }
    }

    fn fire_next(&mut self) -> Result<(), SimError> {
        let u2: f64 = self.rng.r#gen();
        let rule_idx = self.prop_tree.select(u2 * self.a_tot);
        match self.fire(rule_idx)? {
            FireOutcome::Fired => {
                self.event_count += 1;
                self.rules[rule_idx].fire_count += 1;
            }
            FireOutcome::Null => {
                self.null_event_count += 1;
            }
        }
        Ok(())
    }

    fn fire(&mut self, rule_idx: usize) -> Result<FireOutcome, SimError> {
        let n_positions = self.rules[rule_idx].n_reactants();
        let draws: Vec<f64> = (0..n_positions).map(|_| self.rng.r#gen()).collect();
        let mut draw_iter = draws.into_iter();
        let mappings: Vec<MappingSet> = self.rules[rule_idx]
            .pick_mappings(|| draw_iter.next().unwrap_or(0.0))
            .ok_or_else(|| {
                SimError::Numeric(format!(
                    "rule {} was selected with an empty reactant list",
                    self.rules[rule_idx].name
                ))
            })?;
        let transformations = self.rules[rule_idx].transformations.clone();
        let n_reactants = self.rules[rule_idx].n_reactants();

        // Drawing the same particle at two positions invalidates the event.
        let mut participants: Vec<MolId> = Vec::new();
        for ms in &mappings {
            for &m in &ms.mols {
                if participants.contains(&m) {
                    if !self.types[self.pop.mol(m).type_id].population_type {
                        return Ok(FireOutcome::Null);
                    }
                } else {
                    participants.push(m);
                }
            }
        }

        // Same-complex rejection for binds that demand separate complexes.
        for tf in &transformations {
            if let Transformation::Bind {
                a,
                b,
                allow_same_complex: false,
            } = tf
            {
                if a.pos < n_reactants && b.pos < n_reactants {
                    let ma = mappings[a.pos].mols[a.node];
                    let mb = mappings[b.pos].mols[b.node];
                    if self.pop.mol(ma).complex == self.pop.mol(mb).complex {
                        return Ok(FireOutcome::Null);
                    }
                }
            }
        }

        // The whole event must fit under the molecule cap before any
        // mutation happens.
        let n_adds = transformations
            .iter()
            .filter(|t| matches!(t, Transformation::Add { .. }))
            .count();
        if self.pop.live_count + n_adds > self.pop.molecule_limit {
            return Err(SimError::Capacity(format!(
                "firing rule {} would exceed the global molecule limit of {}",
                self.rules[rule_idx].name, self.pop.molecule_limit
            )));
        }

        let limit = self.pop.traversal_limit;
        let mut disturbed: BTreeSet<MolId> = BTreeSet::new();
        for &m in &participants {
            disturbed.extend(self.pop.traverse(m, limit));
        }

        let mut obs_deltas = vec![0i64; self.observables.len()];
        let mut touched: BTreeSet<MolId> = participants.iter().copied().collect();
        let mut products: Vec<MolId> = Vec::new();
        let mut bonds_made = Vec::new();
        let mut bonds_broken = Vec::new();

        {
            let Self {
                types,
                pop,
                rules,
                ..
            } = self;
            for tf in &transformations {
                match tf {
                    Transformation::ChangeState { target, value } => {
                        let (m, c) = resolve_target(&mappings, &products, n_reactants, pop, target)?;
                        pop.set_component_state(m, c, *value);
                        touched.insert(m);
                    }
                    Transformation::Bind { a, b, .. } => {
                        let (ma, ca) = resolve_target(&mappings, &products, n_reactants, pop, a)?;
                        let (mb, cb) = resolve_target(&mappings, &products, n_reactants, pop, b)?;
                        pop.bind(ma, ca, mb, cb)?;
                        bonds_made.push((pop.mol(ma).uid, ca, pop.mol(mb).uid, cb));
                        touched.insert(ma);
                        touched.insert(mb);
                    }
                    Transformation::Unbind { target } => {
                        let (m, c) = resolve_target(&mappings, &products, n_reactants, pop, target)?;
                        let ((ua, uac), (ub, ubc)) = pop.unbind(m, c)?;
                        bonds_broken.push((pop.mol(ua).uid, uac, pop.mol(ub).uid, ubc));
                        touched.insert(ua);
                        touched.insert(ub);
                    }
                    Transformation::Add { type_id, states } => {
                        let id = pop.create_molecule(&types[*type_id])?;
                        pop.mol_mut(id).states = states.clone();
                        products.push(id);
                        touched.insert(id);
                    }
                    Transformation::Delete { pos, node, mode } => {
                        let root = mappings[*pos].mols[*node];
                        if !pop.mol(root).alive {
                            continue;
                        }
                        let targets: Vec<MolId> = match mode {
                            DeleteMode::WholeComplex => {
                                pop.complexes.get(pop.mol(root).complex).members.clone()
                            }
                            DeleteMode::MoleculeOnly => vec![root],
                        };
                        for d in targets {
                            if !pop.mol(d).alive {
                                continue;
                            }
                            for c in 0..pop.mol(d).bonds.len() {
                                if pop.mol(d).bonds[c].is_some() {
                                    let ((ua, uac), (ub, ubc)) = pop.unbind(d, c)?;
                                    bonds_broken.push((
                                        pop.mol(ua).uid,
                                        uac,
                                        pop.mol(ub).uid,
                                        ubc,
                                    ));
                                    touched.insert(ub);
                                }
                            }
                            let ty_id = pop.mol(d).type_id;
                            let slots = types[ty_id].slots.clone();
                            for (r, p) in slots {
                                rules[r].remove(types, pop, d, p);
                            }
                            for (k, &obs_idx) in types[ty_id].mol_observables.iter().enumerate() {
                                obs_deltas[obs_idx] -= pop.mol(d).obs_matches[k];
                            }
                            pop.mol_mut(d).obs_matches.fill(0);
                            pop.destroy_molecule(&types[ty_id], d);
                            touched.remove(&d);
                            disturbed.remove(&d);
                        }
                    }
                    Transformation::IncrementPopulation { pos } => {
                        let m = mappings[*pos].mols[0];
                        let count = pop.mol(m).population + 1;
                        pop.set_population(m, count);
                        touched.insert(m);
                    }
                    Transformation::DecrementPopulation { pos } => {
                        let m = mappings[*pos].mols[0];
                        let count = pop.mol(m).population - 1;
                        if count < 0 {
                            return Err(SimError::Numeric(format!(
                                "population of {} fell below zero",
                                types[pop.mol(m).type_id].name
                            )));
                        }
                        pop.set_population(m, count);
                        touched.insert(m);
                    }
                }
            }
        }

        // Post-firing neighbourhoods, within the traversal limit.
        let touched_alive: Vec<MolId> = touched
            .iter()
            .copied()
            .filter(|&m| self.pop.mol(m).alive)
            .collect();
        for &m in &touched_alive {
            disturbed.extend(self.pop.traverse(m, limit));
        }
        disturbed.retain(|&m| self.pop.mol(m).alive);

        self.update_membership(rule_idx, &disturbed);
        self.apply_observable_deltas(&disturbed, obs_deltas);
        self.refresh_global_functions()?;
        self.refresh_local_functions(&disturbed)?;
        self.update_propensities(rule_idx)?;

        if self.config.keep_firing_log || self.log_writer.is_some() {
            let mols = participants
                .iter()
                .map(|&m| self.pop.mol(m).uid)
                .chain(products.iter().map(|&m| self.pop.mol(m).uid))
                .collect();
            self.firing_log.push(FiringRecord {
                time: self.time,
                rule: rule_idx,
                mols,
                bonds_made,
                bonds_broken,
            });
        }
        Ok(FireOutcome::Fired)
    }

    fn update_membership(&mut self, fired: usize, disturbed: &BTreeSet<MolId>) {
        let Self {
            types,
            pop,
            rules,
            config,
            ..
        } = self;
        let targets: Vec<usize> = if config.use_connectivity {
            rules[fired].connected.clone()
        } else {
            (0..rules.len()).collect()
        };
        for &m in disturbed {
            for &r in &targets {
                rules[r].update_membership(types, pop, m);
            }
        }
    }

    /// Per-molecule match flags first, the aggregate afterwards.
    fn apply_observable_deltas(&mut self, disturbed: &BTreeSet<MolId>, mut deltas: Vec<i64>) {
        let Self {
            types,
            pop,
            observables,
            ..
        } = self;
        for &m in disturbed {
            let ty = &types[pop.mol(m).type_id];
            let mult = if ty.population_type {
                pop.mol(m).population
            } else {
                1
            };
            for (k, &obs_idx) in ty.mol_observables.iter().enumerate() {
                let count = match_count(&observables[obs_idx].pattern, types, pop, m) as i64;
                let contribution = count * mult;
                let old = pop.mol(m).obs_matches[k];
                if contribution != old {
                    deltas[obs_idx] += contribution - old;
                    pop.mol_mut(m).obs_matches[k] = contribution;
                }
            }
        }
        for (obs, delta) in observables.iter_mut().zip(deltas) {
            obs.counter += delta;
        }
    }

    fn refresh_observables(&mut self, disturbed: &BTreeSet<MolId>) {
        self.apply_observable_deltas(disturbed, vec![0; self.observables.len()]);
    }

    fn refresh_global_functions(&mut self) -> Result<(), SimError> {
        let Self {
            types,
            pop,
            observables,
            global_fns,
            params,
            ..
        } = self;
        for f in global_fns.iter_mut() {
            f.value = f.evaluate(observables, types, pop, params)?;
        }
        Ok(())
    }

    /// Re-evaluate local functions around the disturbed molecules: Type I
    /// directly on each argument molecule, Type II spread across the
    /// argument types present in its complex. Fresh values are pushed into
    /// the weighted reactant lists of the dependent DOR rules.
    fn refresh_local_functions(&mut self, disturbed: &BTreeSet<MolId>) -> Result<(), SimError> {
        if self.local_fns.is_empty() {
            return Ok(());
        }
        let mut pending: Vec<(usize, MolId)> = Vec::new();
        let mut seen: BTreeSet<(usize, MolId)> = BTreeSet::new();
        for &m in disturbed {
            let ty = &self.types[self.pop.mol(m).type_id];
            for &f in &ty.type_i_fns {
                if seen.insert((f, m)) {
                    pending.push((f, m));
                }
            }
            for &f in &ty.type_ii_fns {
                let members = self
                    .pop
                    .complexes
                    .get(self.pop.mol(m).complex)
                    .members
                    .clone();
                for member in members {
                    let mt = self.pop.mol(member).type_id;
                    if self.local_fns[f].arg_types.contains(&mt) && seen.insert((f, member)) {
                        pending.push((f, member));
                    }
                }
            }
        }
        for (f, m) in pending {
            let value = {
                let Self {
                    types,
                    pop,
                    observables,
                    local_fns,
                    params,
                    ..
                } = self;
                local_fns[f].evaluate(f, types, pop, observables, params, m)?
            };
            let ty = &self.types[self.pop.mol(m).type_id];
            if let Some(idx) = ty.type_i_fns.iter().position(|&g| g == f) {
                self.pop.mol_mut(m).local_fn_values[idx] = value;
            }
            let users = self.dor_users[f].clone();
            let Self {
                types, pop, rules, ..
            } = self;
            for r in users {
                rules[r].notify_rate_factor_change(types, pop, m, value);
            }
        }
        Ok(())
    }

    fn update_propensities(&mut self, fired: usize) -> Result<(), SimError> {
        let affected: Vec<usize> = if self.config.use_connectivity {
            let mut set: BTreeSet<usize> = self.rules[fired].connected.iter().copied().collect();
            set.insert(fired);
            set.extend(self.expression_rules.iter().copied());
            set.into_iter().collect()
        } else {
            (0..self.rules.len()).collect()
        };
        let Self {
            types,
            pop,
            rules,
            observables,
            params,
            prop_tree,
            ..
        } = self;
        for r in affected {
            let a = rules[r].update_a(observables, types, pop, params)?;
            prop_tree.update(r, a);
        }
        self.a_tot = self.prop_tree.total();
        self.check_a_tot()
    }

    fn flush_firing_log(&mut self) -> Result<(), SimError> {
        if self.firing_log.len() < self.config.log_buffer_size {
            return Ok(());
        }
        if let Some(w) = self.log_writer.as_mut() {
            for rec in &self.firing_log {
                write_firing_record(w, &self.rules, rec)
                    .map_err(|e| SimError::InvalidArgument(format!("log write failed: {e}")))?;
            }
            self.firing_log.clear();
        } else if self.config.keep_firing_log {
            let excess = self.firing_log.len() - self.config.log_buffer_size;
            self.firing_log.drain(..excess);
        }
        Ok(())
    }

    /// Write out and drain whatever the log still buffers.
    pub fn finish_firing_log(&mut self) -> Result<Vec<FiringRecord>, SimError> {
        if let Some(w) = self.log_writer.as_mut() {
            for rec in &self.firing_log {
                write_firing_record(w, &self.rules, rec)
                    .map_err(|e| SimError::InvalidArgument(format!("log write failed: {e}")))?;
            }
            w.flush()
                .map_err(|e| SimError::InvalidArgument(format!("log write failed: {e}")))?;
        }
        Ok(std::mem::take(&mut self.firing_log))
    }

    /// Terminal species census: canonical label per live complex, counted
    /// with population multiplicity for lumped singletons.
    pub fn species_census(&mut self) -> Result<Vec<(String, i64)>, SimError> {
        if !self.config.track_complexes {
            return Err(SimError::InvalidArgument(
                "species output requires complex tracking".to_string(),
            ));
        }
        let mut counts: Vec<(String, i64)> = Vec::new();
        let ids: Vec<usize> = self.pop.complexes.live().map(|c| c.id).collect();
        for id in ids {
            let label = {
                let c = self.pop.complexes.get(id);
                match &c.canonical {
                    Some(l) => l.clone(),
                    None => canonical_label(&self.types, &self.pop.molecules, &c.members),
                }
            };
            self.pop.complexes.get_mut(id).canonical = Some(label.clone());
            let c = self.pop.complexes.get(id);
            let n = if c.members.len() == 1 {
                let m = self.pop.mol(c.members[0]);
                if self.types[m.type_id].population_type {
                    m.population
                } else {
                    1
                }
            } else {
                1
            };
            match counts.iter_mut().find(|(l, _)| *l == label) {
                Some((_, total)) => *total += n,
                None => counts.push((label, n)),
            }
        }
        counts.sort();
        Ok(counts)
    }

    pub fn firing_counts(&self) -> Vec<(String, u64)> {
        self.rules
            .iter()
            .map(|r| (r.name.clone(), r.fire_count))
            .collect()
    }
}

fn resolve_target(
    mappings: &[MappingSet],
    products: &[MolId],
    n_reactants: usize,
    pop: &Population,
    t: &TransformTarget,
) -> Result<(MolId, usize), SimError> {
    let (m, c) = if t.pos < n_reactants {
        let ms = &mappings[t.pos];
        (ms.mols[t.node], ms.sites[t.node][t.site])
    } else {
        let idx = t.pos - n_reactants;
        let m = *products.get(idx).ok_or_else(|| {
            SimError::Model("transformation targets a product that was never added".to_string())
        })?;
        (m, t.site)
    };
    if !pop.mol(m).alive {
        return Err(SimError::Model(
            "transformation references a deleted molecule".to_string(),
        ));
    }
    Ok((m, c))
}

fn write_firing_record(
    w: &mut impl Write,
    rules: &[Rule],
    rec: &FiringRecord,
) -> std::io::Result<()> {
    write!(w, "{:.6}\t{}\tmols:", rec.time, rules[rec.rule].name)?;
    for uid in &rec.mols {
        write!(w, " {uid}")?;
    }
    for (a, ac, b, bc) in &rec.bonds_made {
        write!(w, "\t+{a}.{ac}-{b}.{bc}")?;
    }
    for (a, ac, b, bc) in &rec.bonds_broken {
        write!(w, "\t-{a}.{ac}-{b}.{bc}")?;
    }
    writeln!(w)
}

pub fn derive_seed(seed: Option<u64>, trajectory: u64) -> u64 {
    const GOLDEN_GAMMA: u64 = 0x9E3779B97F4A7C15;
    let base = seed.unwrap_or(0xDEADBEEFCAFEBABE);
    let mut z = base ^ (trajectory.wrapping_mul(GOLDEN_GAMMA));
    // SplitMix64
    z = z.wrapping_add(GOLDEN_GAMMA);
    let mut result = z;
    result = (result ^ (result >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    result = (result ^ (result >> 27)).wrapping_mul(0x94D049BB133111EB);
    result ^ (result >> 31)
}

pub struct EnsembleOutput {
    pub columns: Vec<String>,
    pub data: Vec<f64>,
    pub n_trajectories: usize,
    pub n_times: usize,
}

/// Independent trajectories in parallel, one freshly stamped `System` and
/// one derived seed per trajectory.
pub fn run_ensemble(
    model: &Model,
    duration: f64,
    n_samples: usize,
    n_trajectories: usize,
    n_threads: Option<usize>,
    seed: Option<u64>,
) -> Result<EnsembleOutput, SimError> {
    if n_trajectories == 0 {
        return Err(SimError::InvalidArgument(
            "number of trajectories must be greater than zero".to_string(),
        ));
    }
    let probe = System::new(model, derive_seed(seed, 0))?;
    let columns = probe.sample_columns();
    drop(probe);
    let n_times = n_samples.max(1) + 1;
    let stride = n_times * columns.len();
    let mut data = vec![0f64; n_trajectories * stride];

    let simulate = |data: &mut Vec<f64>| -> Result<(), SimError> {
        data.par_chunks_mut(stride)
            .enumerate()
            .try_for_each(|(traj_idx, chunk)| {
                let mut sys = System::new(model, derive_seed(seed, traj_idx as u64))?;
                let table = sys.sim(duration, n_samples)?;
                chunk.copy_from_slice(&table.data);
                Ok(())
            })
    };

    match n_threads {
        Some(n) => rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build()
            .map_err(|e| SimError::ThreadPool(e.to_string()))?
            .install(|| simulate(&mut data))?,
        None => simulate(&mut data)?,
    }

    Ok(EnsembleOutput {
        columns,
        data,
        n_trajectories,
        n_times,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propensity_tree_selects_expected_indices() {
        let props = vec![1.0, 3.0, 6.0];
        let mut tree = PropensityTree::new(props.len());
        tree.rebuild(&props);
        let total = tree.total();
        assert_eq!(tree.select(0.0), 0);
        assert_eq!(tree.select(0.1 * total), 0);
        assert_eq!(tree.select(0.2 * total), 1);
        assert_eq!(tree.select(0.6 * total), 2);
        assert_eq!(tree.select(0.95 * total), 2);
    }

    #[test]
    fn propensity_tree_handles_zero_entries() {
        let props = vec![0.0, 2.0, 0.0, 5.0];
        let mut tree = PropensityTree::new(props.len());
        tree.rebuild(&props);
        let total = tree.total();
        assert_eq!(tree.select(0.01 * total), 1);
        assert_eq!(tree.select(0.4 * total), 3);
        assert_eq!(tree.select(0.9 * total), 3);
    }

    #[test]
    fn propensity_tree_updates_after_modifications() {
        let props = vec![2.0, 3.0];
        let mut tree = PropensityTree::new(props.len());
        tree.rebuild(&props);
        assert_eq!(tree.total(), 5.0);
        tree.update(1, 1.0);
        assert!((tree.total() - 3.0).abs() < 1e-12);
        assert_eq!(tree.select(0.5), 0);
        assert_eq!(tree.select(2.1), 1);
    }

    #[test]
    fn derive_seed_is_deterministic() {
        let s1 = derive_seed(Some(42), 5);
        let s2 = derive_seed(Some(42), 5);
        assert_eq!(s1, s2);
        assert_ne!(derive_seed(Some(42), 5), derive_seed(Some(42), 6));
    }
}
