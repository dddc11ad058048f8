use super::*;

use std::collections::HashMap;

use crate::function::compile_expression;
use crate::molecule::{ComponentDef, MoleculeType, TypeId};
use crate::observable::ObservableKind;
use crate::pattern::{BondSpec, Pattern, PatternMolecule, SitePattern, SiteRef};
use crate::rule::{DeleteMode, RateLaw, RuleKind, RuleSpec, TransformTarget, Transformation};
use crate::system::{Model, SeedMolecule, SeedSpecies, SimConfig, System};

fn pat(type_id: TypeId, sites: Vec<SitePattern>) -> Pattern {
    Pattern {
        molecules: vec![PatternMolecule { type_id, sites }],
    }
}

fn site(c: usize, state: Option<i64>, bond: BondSpec) -> SitePattern {
    SitePattern {
        site: SiteRef::Exact(c),
        state,
        bond,
    }
}

fn class_site(cl: usize, bond: BondSpec) -> SitePattern {
    SitePattern {
        site: SiteRef::Class(cl),
        state: None,
        bond,
    }
}

fn target(pos: usize, node: usize, site: usize) -> TransformTarget {
    TransformTarget { pos, node, site }
}

fn seed(type_id: TypeId, states: Vec<i64>, count: i64) -> SeedSpecies {
    SeedSpecies {
        molecules: vec![SeedMolecule { type_id, states }],
        bonds: Vec::new(),
        count,
    }
}

fn build(
    types: Vec<MoleculeType>,
    seed_species: Vec<SeedSpecies>,
    observables: Vec<observable::ObservableSpec>,
    rules: Vec<RuleSpec>,
) -> Model {
    let mut model = Model {
        types,
        params: HashMap::new(),
        seed_species,
        observables,
        global_fns: Vec::new(),
        local_fns: Vec::new(),
        rules,
        config: SimConfig::default(),
        connected: Vec::new(),
    };
    model.compile().unwrap();
    model
}

fn recompile(model: &mut Model) {
    model.compile().unwrap();
}

fn obs(name: &str, pattern: Pattern) -> observable::ObservableSpec {
    observable::ObservableSpec {
        name: name.to_string(),
        kind: ObservableKind::Molecules,
        pattern,
    }
}

fn species_obs(name: &str, pattern: Pattern) -> observable::ObservableSpec {
    observable::ObservableSpec {
        name: name.to_string(),
        kind: ObservableKind::Species,
        pattern,
    }
}

fn two_state_model(copies: i64) -> Model {
    let a = MoleculeType::new(
        0,
        "A",
        vec![ComponentDef::with_states("s", &["0", "1"])],
        false,
    );
    let rules = vec![
        RuleSpec {
            name: "on".to_string(),
            reactants: vec![pat(0, vec![site(0, Some(0), BondSpec::Any)])],
            transformations: vec![Transformation::ChangeState {
                target: target(0, 0, 0),
                value: 1,
            }],
            rate: RateLaw::Constant { value: 1.0 },
            kind: RuleKind::Basic,
            total_rate: false,
        },
        RuleSpec {
            name: "off".to_string(),
            reactants: vec![pat(0, vec![site(0, Some(1), BondSpec::Any)])],
            transformations: vec![Transformation::ChangeState {
                target: target(0, 0, 0),
                value: 0,
            }],
            rate: RateLaw::Constant { value: 1.0 },
            kind: RuleKind::Basic,
            total_rate: false,
        },
    ];
    build(
        vec![a],
        vec![seed(0, vec![0], copies)],
        vec![
            obs("A_off", pat(0, vec![site(0, Some(0), BondSpec::Any)])),
            obs("A_on", pat(0, vec![site(0, Some(1), BondSpec::Any)])),
        ],
        rules,
    )
}

fn homodimer_model(copies: i64, rate: f64) -> Model {
    let a = MoleculeType::new(0, "A", vec![ComponentDef::site("b")], false);
    let rules = vec![RuleSpec {
        name: "dimerise".to_string(),
        reactants: vec![
            pat(0, vec![site(0, None, BondSpec::Free)]),
            pat(0, vec![site(0, None, BondSpec::Free)]),
        ],
        transformations: vec![Transformation::Bind {
            a: target(0, 0, 0),
            b: target(1, 0, 0),
            allow_same_complex: true,
        }],
        rate: RateLaw::Constant { value: rate },
        kind: RuleKind::Basic,
        total_rate: false,
    }];
    build(
        vec![a],
        vec![seed(0, vec![0], copies)],
        vec![obs("free_A", pat(0, vec![site(0, None, BondSpec::Free)]))],
        rules,
    )
}

/// A(r).B(l,r).C(l) chain with a rule that cuts the B-C bond.
fn chain_model() -> Model {
    let a = MoleculeType::new(0, "A", vec![ComponentDef::site("r")], false);
    let b = MoleculeType::new(
        1,
        "B",
        vec![ComponentDef::site("l"), ComponentDef::site("r")],
        false,
    );
    let c = MoleculeType::new(2, "C", vec![ComponentDef::site("l")], false);
    let assembly = SeedSpecies {
        molecules: vec![
            SeedMolecule { type_id: 0, states: vec![0] },
            SeedMolecule { type_id: 1, states: vec![0, 0] },
            SeedMolecule { type_id: 2, states: vec![0] },
        ],
        bonds: vec![((0, 0), (1, 0)), ((1, 1), (2, 0))],
        count: 1,
    };
    let cut = RuleSpec {
        name: "cut".to_string(),
        reactants: vec![pat(1, vec![site(1, None, BondSpec::Bonded)])],
        transformations: vec![Transformation::Unbind {
            target: target(0, 0, 0),
        }],
        rate: RateLaw::Constant { value: 1.0 },
        kind: RuleKind::Basic,
        total_rate: false,
    };
    build(
        vec![a, b, c],
        vec![assembly],
        vec![species_obs(
            "linked_BC",
            pat(1, vec![site(1, None, BondSpec::Bonded)]),
        )],
        vec![cut],
    )
}

#[test]
fn two_state_switch_settles_at_half_occupancy() {
    let model = two_state_model(100);
    let mut sys = System::new(&model, 42).unwrap();
    let table = sys.sim(1000.0, 1000).unwrap();
    assert_eq!(table.n_rows(), 1001);
    let on = table.column("A_on").unwrap();
    let tail = &on[501..];
    let mean: f64 = tail.iter().sum::<f64>() / tail.len() as f64;
    // Single-sample sd is 5 at equilibrium; stay within three of those.
    assert!(
        (mean - 50.0).abs() < 15.0,
        "tail mean {mean} too far from 50"
    );
    // Conservation at every sample.
    let off = table.column("A_off").unwrap();
    for (x, y) in on.iter().zip(&off) {
        assert_eq!(x + y, 100.0);
    }
    assert!(sys.event_count > 0);
}

#[test]
fn fixed_seed_reproduces_the_stream_exactly() {
    let model = two_state_model(50);
    let t1 = System::new(&model, 7).unwrap().sim(10.0, 100).unwrap();
    let t2 = System::new(&model, 7).unwrap().sim(10.0, 100).unwrap();
    assert_eq!(t1.data, t2.data);
    let t3 = System::new(&model, 8).unwrap().sim(10.0, 100).unwrap();
    assert_ne!(t1.data, t3.data);
}

#[test]
fn homodimerisation_propensity_uses_the_pair_count() {
    let model = homodimer_model(100, 0.01);
    let sys = System::new(&model, 1).unwrap();
    assert!((sys.rules[0].a - 49.5).abs() < 1e-9);
    assert!((sys.a_tot - 49.5).abs() < 1e-9);
    assert_eq!(sys.rules[0].raw_count(0), 100);
    assert_eq!(sys.rules[0].raw_count(1), 100);
}

#[test]
fn homodimerisation_fires_and_rescales() {
    let model = homodimer_model(100, 0.01);
    let mut sys = System::new(&model, 3).unwrap();
    while sys.event_count == 0 {
        // A draw can land on the same monomer twice; that is a null event.
        assert!(sys.single_step().unwrap());
    }
    let free = sys.observables[0].counter;
    assert_eq!(free, 98);
    assert!((sys.rules[0].a - 0.01 * 98.0 * 97.0 / 2.0).abs() < 1e-9);
    assert!(sys.time > 0.0);
    // Two monomers now share one complex.
    assert_eq!(sys.pop.complexes.live_count(), 99);
}

#[test]
fn propensity_aggregate_matches_per_rule_sum() {
    let model = two_state_model(30);
    let mut sys = System::new(&model, 11).unwrap();
    for _ in 0..200 {
        sys.single_step().unwrap();
        let total: f64 = sys.rules.iter().map(|r| r.a).sum();
        assert!((sys.a_tot - total).abs() < 1e-9);
    }
}

#[test]
fn cutting_a_chain_splits_the_complex() {
    let model = chain_model();
    let mut sys = System::new(&model, 5).unwrap();
    assert_eq!(sys.pop.complexes.live_count(), 1);
    assert_eq!(sys.observables[0].value(&sys.types, &sys.pop), 1.0);
    assert!(sys.single_step().unwrap());
    assert_eq!(sys.event_count, 1);
    assert_eq!(sys.pop.complexes.live_count(), 2);
    let a = sys.pop.instances[0][0];
    let b = sys.pop.instances[1][0];
    let c = sys.pop.instances[2][0];
    assert_eq!(sys.pop.mol(a).complex, sys.pop.mol(b).complex);
    assert_ne!(sys.pop.mol(c).complex, sys.pop.mol(b).complex);
    assert_eq!(sys.pop.complexes.get(sys.pop.mol(c).complex).size(), 1);
    // The species observable no longer sees a bonded B.
    assert_eq!(sys.observables[0].value(&sys.types, &sys.pop), 0.0);
    // Nothing left to fire.
    assert_eq!(sys.a_tot, 0.0);
    // Census sees the two fragments.
    let census = sys.species_census().unwrap();
    assert_eq!(census.len(), 2);
    assert!(census.iter().all(|(_, n)| *n == 1));
}

#[test]
fn weighted_selection_follows_local_context() {
    // A carries three symmetric b sites; one A holds three B, another one B.
    let a = MoleculeType::new(
        0,
        "A",
        vec![
            ComponentDef::with_states("s", &["u", "p"]),
            ComponentDef::site("b"),
            ComponentDef::site("b"),
            ComponentDef::site("b"),
        ],
        false,
    );
    let b = MoleculeType::new(1, "B", vec![ComponentDef::site("a")], false);
    let bound_b = pat(1, vec![site(0, None, BondSpec::Bonded)]);
    let local_fn = function::LocalFunctionSpec {
        name: "nb".to_string(),
        expr_src: "bcnt".to_string(),
        expr: compile_expression("bcnt", "nb").unwrap(),
        observables: vec![function::LocalObservable {
            name: "bcnt".to_string(),
            pattern: bound_b,
        }],
        arg_types: Vec::new(),
    };
    let rule = RuleSpec {
        name: "act".to_string(),
        reactants: vec![pat(0, vec![site(0, None, BondSpec::Any)])],
        transformations: vec![Transformation::ChangeState {
            target: target(0, 0, 0),
            value: 1,
        }],
        rate: RateLaw::Constant { value: 1.0 },
        kind: RuleKind::Dor {
            position: 0,
            function: 0,
        },
        total_rate: false,
    };
    let assembly = |n_bs: usize| {
        let mut molecules = vec![SeedMolecule {
            type_id: 0,
            states: vec![0, 0, 0, 0],
        }];
        let mut bonds = Vec::new();
        for i in 0..n_bs {
            molecules.push(SeedMolecule {
                type_id: 1,
                states: vec![0],
            });
            bonds.push(((0usize, 1 + i), (1 + i, 0usize)));
        }
        SeedSpecies {
            molecules,
            bonds,
            count: 1,
        }
    };
    let mut model = Model {
        types: vec![a, b],
        params: HashMap::new(),
        seed_species: vec![assembly(3), assembly(1)],
        observables: vec![],
        global_fns: Vec::new(),
        local_fns: vec![local_fn],
        rules: vec![rule],
        config: SimConfig::default(),
        connected: Vec::new(),
    };
    recompile(&mut model);

    let sys = System::new(&model, 9).unwrap();
    let list = &sys.rules[0].lists[0];
    assert_eq!(list.len(), 2);
    assert!((list.weight_sum() - 4.0).abs() < 1e-12);
    assert!((sys.rules[0].a - 4.0).abs() < 1e-12);
    // Cumulative weights 3 then 1: the first A wins 3/4 of the draws.
    assert_eq!(list.pick_by_weight(0.74), Some(0));
    assert_eq!(list.pick_by_weight(0.76), Some(1));

    // The function is scoped to A; asking about a B is a scope error.
    let b_mol = sys.pop.instances[1][0];
    let err = sys.local_fns[0]
        .evaluate(0, &sys.types, &sys.pop, &sys.observables, &sys.params, b_mol)
        .unwrap_err();
    assert!(matches!(err, SimError::Scope { .. }));
}

#[test]
fn symmetric_sites_triple_the_reactant_multiplicity() {
    let l = MoleculeType::new(
        0,
        "L",
        vec![
            ComponentDef::site("r"),
            ComponentDef::site("r"),
            ComponentDef::site("r"),
        ],
        false,
    );
    let r = MoleculeType::new(1, "R", vec![ComponentDef::site("l")], false);
    let rule = RuleSpec {
        name: "attach".to_string(),
        reactants: vec![
            pat(0, vec![class_site(0, BondSpec::Free)]),
            pat(1, vec![site(0, None, BondSpec::Free)]),
        ],
        transformations: vec![Transformation::Bind {
            a: target(0, 0, 0),
            b: target(1, 0, 0),
            allow_same_complex: true,
        }],
        rate: RateLaw::Constant { value: 2.0 },
        kind: RuleKind::Basic,
        total_rate: false,
    };
    let model = build(
        vec![l, r],
        vec![seed(0, vec![0, 0, 0], 1), seed(1, vec![0], 1)],
        vec![],
        vec![rule],
    );
    let mut sys = System::new(&model, 13).unwrap();
    assert_eq!(sys.rules[0].raw_count(0), 3);
    assert_eq!(sys.rules[0].raw_count(1), 1);
    assert!((sys.rules[0].a - 2.0 * 3.0).abs() < 1e-12);
    assert!(sys.single_step().unwrap());
    assert_eq!(sys.event_count, 1);
    // One r is used up; the multiplicity drops with it.
    assert_eq!(sys.rules[0].raw_count(0), 2);
    assert_eq!(sys.rules[0].raw_count(1), 0);
    assert_eq!(sys.a_tot, 0.0);
}

#[test]
fn same_complex_bind_is_a_null_event() {
    // One dimer with two dangling sites; the rule insists on separate
    // complexes, so the only candidate pairing is rejected.
    let a = MoleculeType::new(
        0,
        "A",
        vec![ComponentDef::site("x"), ComponentDef::site("y")],
        false,
    );
    let dimer = SeedSpecies {
        molecules: vec![
            SeedMolecule {
                type_id: 0,
                states: vec![0, 0],
            },
            SeedMolecule {
                type_id: 0,
                states: vec![0, 0],
            },
        ],
        bonds: vec![((0, 1), (1, 0))],
        count: 1,
    };
    let rule = RuleSpec {
        name: "close".to_string(),
        reactants: vec![
            pat(0, vec![site(0, None, BondSpec::Free)]),
            pat(0, vec![site(1, None, BondSpec::Free)]),
        ],
        transformations: vec![Transformation::Bind {
            a: target(0, 0, 0),
            b: target(1, 0, 0),
            allow_same_complex: false,
        }],
        rate: RateLaw::Constant { value: 1.0 },
        kind: RuleKind::Basic,
        total_rate: false,
    };
    let model = build(vec![a], vec![dimer], vec![], vec![rule]);
    let mut sys = System::new(&model, 21).unwrap();
    assert!(sys.a_tot > 0.0);
    assert!(sys.single_step().unwrap());
    assert_eq!(sys.null_event_count, 1);
    assert_eq!(sys.event_count, 0);
    assert!(sys.time > 0.0);
    // No bond was formed.
    let m0 = sys.pop.instances[0][0];
    assert!(sys.pop.mol(m0).bonds[0].is_none());
    assert_eq!(sys.pop.complexes.live_count(), 1);
}

#[test]
fn dead_state_emits_samples_without_consuming_randomness() {
    let a = MoleculeType::new(0, "A", vec![ComponentDef::site("b")], false);
    let model = build(
        vec![a],
        vec![seed(0, vec![0], 5)],
        vec![obs("all_A", pat(0, vec![]))],
        vec![],
    );
    let mut s1 = System::new(&model, 1).unwrap();
    let mut s2 = System::new(&model, 999).unwrap();
    let t1 = s1.sim(10.0, 20).unwrap();
    let t2 = s2.sim(10.0, 20).unwrap();
    // No randomness was touched, so wildly different seeds agree.
    assert_eq!(t1.data, t2.data);
    assert_eq!(s1.event_count, 0);
    assert_eq!(t1.n_rows(), 21);
    assert!(t1.column("all_A").unwrap().iter().all(|&v| v == 5.0));
    assert!(!s1.single_step().unwrap());
}

#[test]
fn capacity_overflow_aborts_with_state_intact() {
    let a = MoleculeType::new(0, "A", vec![], false);
    let birth = RuleSpec {
        name: "birth".to_string(),
        reactants: vec![],
        transformations: vec![Transformation::Add {
            type_id: 0,
            states: vec![],
        }],
        rate: RateLaw::Constant { value: 1.0 },
        kind: RuleKind::Basic,
        total_rate: false,
    };
    let mut model = Model {
        types: vec![a],
        params: HashMap::new(),
        seed_species: vec![seed(0, vec![], 2)],
        observables: vec![],
        global_fns: Vec::new(),
        local_fns: Vec::new(),
        rules: vec![birth],
        config: SimConfig {
            molecule_limit: 2,
            ..SimConfig::default()
        },
        connected: Vec::new(),
    };
    recompile(&mut model);
    let mut sys = System::new(&model, 2).unwrap();
    assert_eq!(sys.pop.live_count, 2);
    let err = sys.single_step().unwrap_err();
    assert!(matches!(err, SimError::Capacity(_)));
    assert_eq!(sys.pop.live_count, 2);
    assert_eq!(sys.event_count, 0);
}

#[test]
fn equilibration_leaves_the_clock_untouched() {
    let model = two_state_model(20);
    let mut sys = System::new(&model, 17).unwrap();
    sys.equilibrate(5.0).unwrap();
    assert_eq!(sys.time, 0.0);
    assert!(sys.event_count > 0);
    // And samples taken afterwards start from the equilibrated state.
    let table = sys.sim(1.0, 10).unwrap();
    assert_eq!(table.row(0)[0], 0.0);
}

#[test]
fn step_to_never_crosses_the_stop_time() {
    let model = two_state_model(20);
    let mut sys = System::new(&model, 23).unwrap();
    let reached = sys.step_to(0.5).unwrap();
    assert!(reached <= 0.5);
    assert_eq!(reached, sys.time);
    assert!(sys.event_count > 0);
}

#[test]
fn population_pairs_use_the_discrete_correction() {
    let p = MoleculeType::new(0, "P", vec![], true);
    let fuse = RuleSpec {
        name: "consume_pair".to_string(),
        reactants: vec![pat(0, vec![]), pat(0, vec![])],
        transformations: vec![
            Transformation::DecrementPopulation { pos: 0 },
            Transformation::DecrementPopulation { pos: 1 },
        ],
        rate: RateLaw::Constant { value: 1.0 },
        kind: RuleKind::Basic,
        total_rate: false,
    };
    let model = build(
        vec![p],
        vec![seed(0, vec![], 10)],
        vec![obs("P_total", pat(0, vec![]))],
        vec![fuse],
    );
    let mut sys = System::new(&model, 31).unwrap();
    assert!((sys.rules[0].a - 45.0).abs() < 1e-9, "n(n-1)/2 of 10");
    assert_eq!(sys.observables[0].counter, 10);
    assert!(sys.single_step().unwrap());
    let m = sys.pop.instances[0][0];
    assert_eq!(sys.pop.mol(m).population, 8);
    assert_eq!(sys.observables[0].counter, 8);
    assert!((sys.rules[0].a - 28.0).abs() < 1e-9, "n(n-1)/2 of 8");
}

#[test]
fn total_rate_ignores_reactant_counts() {
    let a = MoleculeType::new(
        0,
        "A",
        vec![ComponentDef::with_states("s", &["0", "1"])],
        false,
    );
    let rule = RuleSpec {
        name: "macro_rate".to_string(),
        reactants: vec![pat(0, vec![site(0, Some(0), BondSpec::Any)])],
        transformations: vec![Transformation::ChangeState {
            target: target(0, 0, 0),
            value: 1,
        }],
        rate: RateLaw::Constant { value: 3.5 },
        kind: RuleKind::Basic,
        total_rate: true,
    };
    let model = build(vec![a], vec![seed(0, vec![0], 80)], vec![], vec![rule]);
    let sys = System::new(&model, 37).unwrap();
    assert!((sys.rules[0].a - 3.5).abs() < 1e-12);
}

#[test]
fn expression_rates_track_observables() {
    let a = MoleculeType::new(
        0,
        "A",
        vec![ComponentDef::with_states("s", &["0", "1"])],
        false,
    );
    let rule = RuleSpec {
        name: "driven".to_string(),
        reactants: vec![pat(0, vec![site(0, Some(0), BondSpec::Any)])],
        transformations: vec![Transformation::ChangeState {
            target: target(0, 0, 0),
            value: 1,
        }],
        rate: RateLaw::Expression {
            expr_src: "k0 / (1 + A_on)".to_string(),
            expr: compile_expression("k0 / (1 + A_on)", "test").unwrap(),
        },
        kind: RuleKind::Basic,
        total_rate: false,
    };
    let mut model = Model {
        types: vec![a],
        params: HashMap::from([("k0".to_string(), 2.0)]),
        seed_species: vec![seed(0, vec![0], 10)],
        observables: vec![obs("A_on", pat(0, vec![site(0, Some(1), BondSpec::Any)]))],
        global_fns: Vec::new(),
        local_fns: Vec::new(),
        rules: vec![rule],
        config: SimConfig::default(),
        connected: Vec::new(),
    };
    recompile(&mut model);
    let mut sys = System::new(&model, 41).unwrap();
    assert!((sys.rules[0].a - 2.0 * 10.0).abs() < 1e-9);
    assert!(sys.single_step().unwrap());
    // One molecule switched on: 9 candidates left, rate constant halves.
    assert!((sys.rules[0].a - (2.0 / 2.0) * 9.0).abs() < 1e-9);
}

#[test]
fn parameter_updates_rebuild_propensities() {
    let mut model = homodimer_model(10, 1.0);
    model.params.insert("kon".to_string(), 1.0);
    model.rules[0].rate = RateLaw::Parameter {
        name: "kon".to_string(),
        value: 0.0,
    };
    recompile(&mut model);
    let mut sys = System::new(&model, 43).unwrap();
    assert!((sys.rules[0].a - 45.0).abs() < 1e-9);
    sys.set_parameter("kon", 2.0).unwrap();
    assert!((sys.rules[0].a - 90.0).abs() < 1e-9);
    assert!((sys.a_tot - 90.0).abs() < 1e-9);
}

#[test]
fn deleting_a_molecule_retires_it_everywhere() {
    let a = MoleculeType::new(0, "A", vec![ComponentDef::site("b")], false);
    let decay = RuleSpec {
        name: "decay".to_string(),
        reactants: vec![pat(0, vec![])],
        transformations: vec![Transformation::Delete {
            pos: 0,
            node: 0,
            mode: DeleteMode::MoleculeOnly,
        }],
        rate: RateLaw::Constant { value: 1.0 },
        kind: RuleKind::Basic,
        total_rate: false,
    };
    let model = build(
        vec![a],
        vec![seed(0, vec![0], 3)],
        vec![obs("count_A", pat(0, vec![]))],
        vec![decay],
    );
    let mut sys = System::new(&model, 47).unwrap();
    assert_eq!(sys.observables[0].counter, 3);
    for expected in [2i64, 1, 0] {
        assert!(sys.single_step().unwrap());
        assert_eq!(sys.observables[0].counter, expected);
        assert_eq!(sys.pop.live_count as i64, expected);
        assert!((sys.a_tot - expected as f64).abs() < 1e-12);
    }
    assert!(!sys.single_step().unwrap());
    assert_eq!(sys.pop.complexes.live_count(), 0);
}

#[test]
fn whole_complex_delete_takes_the_partners_along() {
    let model = {
        let a = MoleculeType::new(0, "A", vec![ComponentDef::site("r")], false);
        let b = MoleculeType::new(1, "B", vec![ComponentDef::site("l")], false);
        let dimer = SeedSpecies {
            molecules: vec![
                SeedMolecule {
                    type_id: 0,
                    states: vec![0],
                },
                SeedMolecule {
                    type_id: 1,
                    states: vec![0],
                },
            ],
            bonds: vec![((0, 0), (1, 0))],
            count: 2,
        };
        let kill = RuleSpec {
            name: "kill".to_string(),
            reactants: vec![pat(0, vec![site(0, None, BondSpec::Bonded)])],
            transformations: vec![Transformation::Delete {
                pos: 0,
                node: 0,
                mode: DeleteMode::WholeComplex,
            }],
            rate: RateLaw::Constant { value: 1.0 },
            kind: RuleKind::Basic,
            total_rate: false,
        };
        build(
            vec![a, b],
            vec![dimer],
            vec![obs("count_B", pat(1, vec![]))],
            vec![kill],
        )
    };
    let mut sys = System::new(&model, 53).unwrap();
    assert_eq!(sys.pop.live_count, 4);
    assert!(sys.single_step().unwrap());
    assert_eq!(sys.pop.live_count, 2);
    assert_eq!(sys.observables[0].counter, 1);
    assert_eq!(sys.pop.complexes.live_count(), 1);
}

#[test]
fn connectivity_inference_links_writers_to_readers() {
    let model = two_state_model(10);
    // Both rules write A.s and both read A.s, so each connects to both.
    assert_eq!(model.connected[0], vec![0, 1]);
    assert_eq!(model.connected[1], vec![0, 1]);
}

#[test]
fn ensembles_are_reproducible_and_per_trajectory_seeded() {
    let model = two_state_model(10);
    let out1 = system::run_ensemble(&model, 5.0, 10, 3, Some(2), Some(99)).unwrap();
    let out2 = system::run_ensemble(&model, 5.0, 10, 3, Some(1), Some(99)).unwrap();
    assert_eq!(out1.data, out2.data);
    assert_eq!(out1.n_trajectories, 3);
    assert_eq!(out1.n_times, 11);
    let stride = out1.n_times * out1.columns.len();
    assert_ne!(out1.data[..stride], out1.data[stride..2 * stride]);
}
