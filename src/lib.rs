#![allow(unsafe_op_in_unsafe_fn)]

use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;

use numpy::{IxDyn, PyArrayDyn, PyArrayMethods};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::{PyAnyMethods, PyDict, PyList};
use thiserror::Error;

pub mod complex;
pub mod function;
pub mod molecule;
pub mod observable;
pub mod pattern;
pub mod population;
pub mod reactant;
pub mod rule;
pub mod system;

#[cfg(test)]
mod tests;

use function::{GlobalFunctionSpec, LocalFunctionSpec, LocalObservable, compile_expression};
use molecule::{ComponentDef, MoleculeType, TypeId};
use observable::{ObservableKind, ObservableSpec};
use pattern::{BondSpec, Pattern, PatternMolecule, SitePattern, SiteRef};
use rule::{DeleteMode, RateLaw, RuleKind, RuleSpec, TransformTarget, Transformation};
use system::{
    FiringRecord, Model, SampleTable, SeedMolecule, SeedSpecies, SimConfig, System, run_ensemble,
};

#[derive(Debug, Error)]
pub enum SimError {
    #[error("model error: {0}")]
    Model(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("capacity error: {0}")]
    Capacity(String),
    #[error(
        "local function {function} (index {index}) is not defined for its argument molecule; \
         defined for types: {arg_types:?}"
    )]
    Scope {
        function: String,
        index: usize,
        arg_types: Vec<String>,
    },
    #[error("numeric error: {0}")]
    Numeric(String),
    #[error("thread pool error: {0}")]
    ThreadPool(String),
}

impl From<SimError> for PyErr {
    fn from(err: SimError) -> Self {
        PyValueError::new_err(err.to_string())
    }
}

fn item<'py>(
    dict: &Bound<'py, PyDict>,
    key: &str,
    what: &str,
) -> Result<Option<Bound<'py, PyAny>>, SimError> {
    let v = dict
        .get_item(key)
        .map_err(|_| SimError::InvalidArgument(format!("{what}: failed to read field `{key}`")))?;
    Ok(v.filter(|v| !v.is_none()))
}

fn req_item<'py>(
    dict: &Bound<'py, PyDict>,
    key: &str,
    what: &str,
) -> Result<Bound<'py, PyAny>, SimError> {
    item(dict, key, what)?
        .ok_or_else(|| SimError::InvalidArgument(format!("{what}: missing field `{key}`")))
}

fn as_dict<'py>(obj: &Bound<'py, PyAny>, what: &str) -> Result<Bound<'py, PyDict>, SimError> {
    obj.cast::<PyDict>()
        .map(|d| d.clone())
        .map_err(|_| SimError::InvalidArgument(format!("{what} must be a mapping")))
}

fn as_entries<'py>(obj: &Bound<'py, PyAny>, what: &str) -> Result<Vec<Bound<'py, PyAny>>, SimError> {
    let py = obj.py();
    let entries: Vec<Py<PyAny>> = obj
        .extract()
        .map_err(|_| SimError::InvalidArgument(format!("{what} must be a sequence")))?;
    Ok(entries.into_iter().map(|e| e.bind(py).clone()).collect())
}

fn extract_string(obj: &Bound<'_, PyAny>, what: &str) -> Result<String, SimError> {
    obj.extract()
        .map_err(|_| SimError::InvalidArgument(format!("{what} must be a string")))
}

struct TypeTable {
    types: Vec<MoleculeType>,
}

impl TypeTable {
    fn lookup(&self, name: &str, what: &str) -> Result<TypeId, SimError> {
        self.types
            .iter()
            .position(|t| t.name == name)
            .ok_or_else(|| SimError::Model(format!("{what}: unknown molecule type `{name}`")))
    }
}

fn parse_molecule_types(model: &Bound<'_, PyDict>) -> Result<TypeTable, SimError> {
    let raw = req_item(model, "molecule_types", "model")?;
    let mut types: Vec<MoleculeType> = Vec::new();
    for (i, entry) in as_entries(&raw, "molecule_types")?.iter().enumerate() {
        let what = format!("molecule type {i}");
        let d = as_dict(entry, &what)?;
        let name = extract_string(&req_item(&d, "name", &what)?, "molecule type name")?;
        if types.iter().any(|t| t.name == name) {
            return Err(SimError::Model(format!("duplicate molecule type `{name}`")));
        }
        let population = match item(&d, "population", &what)? {
            Some(v) => v.extract().map_err(|_| {
                SimError::InvalidArgument(format!("{what}: `population` must be a bool"))
            })?,
            None => false,
        };
        let mut components = Vec::new();
        if let Some(raw_comps) = item(&d, "components", &what)? {
            for centry in as_entries(&raw_comps, &format!("{what} components"))? {
                let cd = as_dict(&centry, &format!("{what} component"))?;
                let cname = extract_string(&req_item(&cd, "name", &what)?, "component name")?;
                let states: Vec<String> = match item(&cd, "states", &what)? {
                    Some(v) => v.extract().map_err(|_| {
                        SimError::InvalidArgument(format!(
                            "{what}: component states must be a sequence of strings"
                        ))
                    })?,
                    None => Vec::new(),
                };
                let is_integer = match item(&cd, "integer", &what)? {
                    Some(v) => v.extract().map_err(|_| {
                        SimError::InvalidArgument(format!("{what}: `integer` must be a bool"))
                    })?,
                    None => false,
                };
                let default_state = match item(&cd, "default", &what)? {
                    Some(v) => {
                        if let Ok(n) = v.extract::<i64>() {
                            n
                        } else {
                            let s = extract_string(&v, "default state")?;
                            states.iter().position(|x| *x == s).ok_or_else(|| {
                                SimError::Model(format!(
                                    "{what}: default state `{s}` is not a declared state of `{cname}`"
                                ))
                            })? as i64
                        }
                    }
                    None => 0,
                };
                components.push(ComponentDef {
                    name: cname,
                    states,
                    default_state,
                    is_integer,
                });
            }
        }
        types.push(MoleculeType::new(types.len(), &name, components, population));
    }
    if types.is_empty() {
        return Err(SimError::Model(
            "model must declare at least one molecule type".to_string(),
        ));
    }
    Ok(TypeTable { types })
}

fn parse_parameters(model: &Bound<'_, PyDict>) -> Result<HashMap<String, f64>, SimError> {
    let mut params = HashMap::new();
    if let Some(raw) = item(model, "parameters", "model")? {
        let d = as_dict(&raw, "parameters")?;
        for (k, v) in d.iter() {
            let name = extract_string(&k, "parameter name")?;
            let value: f64 = v.extract().map_err(|_| {
                SimError::InvalidArgument(format!("parameter {name} must be a number"))
            })?;
            if !value.is_finite() {
                return Err(SimError::Model(format!("parameter {name} is not finite")));
            }
            params.insert(name, value);
        }
    }
    Ok(params)
}

/// Resolve a site name on a type: an exact (possibly renamed) component, or
/// the generic name of a symmetric class.
fn resolve_site(ty: &MoleculeType, name: &str, what: &str) -> Result<SiteRef, SimError> {
    if let Some(c) = ty.component_index(name) {
        return Ok(SiteRef::Exact(c));
    }
    if let Some(cl) = ty.class_index(name) {
        return Ok(SiteRef::Class(cl));
    }
    Err(SimError::Model(format!(
        "{what}: type {} has no component `{name}`",
        ty.name
    )))
}

fn site_state_component(ty: &MoleculeType, site: &SiteRef) -> usize {
    match site {
        SiteRef::Exact(c) => *c,
        SiteRef::Class(cl) => ty.eq_classes[*cl][0],
    }
}

fn parse_state_value(
    ty: &MoleculeType,
    component: usize,
    obj: &Bound<'_, PyAny>,
    what: &str,
) -> Result<i64, SimError> {
    if let Ok(s) = obj.extract::<String>() {
        return ty.state_value(component, &s).ok_or_else(|| {
            SimError::Model(format!(
                "{what}: `{s}` is not a state of {}.{}",
                ty.name, ty.components[component].name
            ))
        });
    }
    if let Ok(n) = obj.extract::<i64>() {
        let def = &ty.components[component];
        if !def.is_integer && (n < 0 || n as usize >= def.states.len().max(1)) {
            return Err(SimError::Model(format!(
                "{what}: state {n} out of range for {}.{}",
                ty.name, def.name
            )));
        }
        return Ok(n);
    }
    Err(SimError::InvalidArgument(format!(
        "{what}: states must be given as names or integers"
    )))
}

fn parse_pattern(
    table: &TypeTable,
    obj: &Bound<'_, PyAny>,
    what: &str,
) -> Result<Pattern, SimError> {
    let d = as_dict(obj, what)?;
    let raw_mols = req_item(&d, "molecules", what)?;
    let mut molecules: Vec<PatternMolecule> = Vec::new();
    // Bond labels collect (molecule, site slot) pairs to tie together.
    let mut labels: HashMap<i64, Vec<(usize, usize)>> = HashMap::new();
    for (mi, mentry) in as_entries(&raw_mols, what)?.iter().enumerate() {
        let md = as_dict(mentry, &format!("{what} molecule {mi}"))?;
        let tname = extract_string(&req_item(&md, "type", what)?, "pattern molecule type")?;
        let type_id = table.lookup(&tname, what)?;
        let ty = &table.types[type_id];
        let mut sites = Vec::new();
        if let Some(raw_sites) = item(&md, "components", what)? {
            for sentry in as_entries(&raw_sites, what)? {
                let sd = as_dict(&sentry, &format!("{what} site"))?;
                let sname = extract_string(&req_item(&sd, "component", what)?, "component")?;
                let site = resolve_site(ty, &sname, what)?;
                let state = match item(&sd, "state", what)? {
                    Some(v) => Some(parse_state_value(
                        ty,
                        site_state_component(ty, &site),
                        &v,
                        what,
                    )?),
                    None => None,
                };
                // A listed component is free unless the bond says otherwise.
                let mut bond = BondSpec::Free;
                if let Some(b) = item(&sd, "bond", what)? {
                    if let Ok(label) = b.extract::<i64>() {
                        labels.entry(label).or_default().push((mi, sites.len()));
                        bond = BondSpec::Any; // patched below
                    } else {
                        let s = extract_string(&b, "bond")?;
                        bond = match s.as_str() {
                            "free" => BondSpec::Free,
                            "bonded" => BondSpec::Bonded,
                            "any" => BondSpec::Any,
                            other => {
                                return Err(SimError::InvalidArgument(format!(
                                    "{what}: unrecognized bond spec `{other}`"
                                )));
                            }
                        };
                    }
                }
                sites.push(SitePattern { site, state, bond });
            }
        }
        molecules.push(PatternMolecule { type_id, sites });
    }
    for (label, ends) in labels {
        if ends.len() != 2 {
            return Err(SimError::Model(format!(
                "{what}: bond label {label} must appear exactly twice"
            )));
        }
        let (am, asite) = ends[0];
        let (bm, bsite) = ends[1];
        molecules[am].sites[asite].bond = BondSpec::To {
            molecule: bm,
            site: bsite,
        };
        molecules[bm].sites[bsite].bond = BondSpec::To {
            molecule: am,
            site: asite,
        };
    }
    Ok(Pattern { molecules })
}

/// Concrete molecule spec for species and product templates: every site
/// resolves to one component, symmetric names are assigned in declaration
/// order.
fn parse_concrete_molecule(
    table: &TypeTable,
    md: &Bound<'_, PyDict>,
    what: &str,
) -> Result<(TypeId, Vec<i64>, Vec<(usize, Option<i64>)>), SimError> {
    let tname = extract_string(&req_item(md, "type", what)?, "molecule type")?;
    let type_id = table.lookup(&tname, what)?;
    let ty = &table.types[type_id];
    let mut states: Vec<i64> = ty.components.iter().map(|c| c.default_state).collect();
    let mut used = vec![false; ty.components.len()];
    let mut bonds: Vec<(usize, Option<i64>)> = Vec::new();
    if let Some(raw_sites) = item(md, "components", what)? {
        for sentry in as_entries(&raw_sites, what)? {
            let sd = as_dict(&sentry, what)?;
            let sname = extract_string(&req_item(&sd, "component", what)?, "component")?;
            let comp = match resolve_site(ty, &sname, what)? {
                SiteRef::Exact(c) => c,
                SiteRef::Class(cl) => *ty.eq_classes[cl]
                    .iter()
                    .find(|&&c| !used[c])
                    .ok_or_else(|| {
                        SimError::Model(format!("{what}: all `{sname}` components already used"))
                    })?,
            };
            used[comp] = true;
            if let Some(v) = item(&sd, "state", what)? {
                states[comp] = parse_state_value(ty, comp, &v, what)?;
            }
            let label = match item(&sd, "bond", what)? {
                Some(b) => Some(b.extract::<i64>().map_err(|_| {
                    SimError::InvalidArgument(format!(
                        "{what}: bonds in concrete molecules must be integer labels"
                    ))
                })?),
                None => None,
            };
            bonds.push((comp, label));
        }
    }
    Ok((type_id, states, bonds))
}

fn parse_species(table: &TypeTable, model: &Bound<'_, PyDict>) -> Result<Vec<SeedSpecies>, SimError> {
    let mut out = Vec::new();
    let Some(raw) = item(model, "species", "model")? else {
        return Ok(out);
    };
    for (i, entry) in as_entries(&raw, "species")?.iter().enumerate() {
        let what = format!("initial species {i}");
        let d = as_dict(entry, &what)?;
        let count: i64 = req_item(&d, "count", &what)?
            .extract()
            .map_err(|_| SimError::InvalidArgument(format!("{what}: `count` must be an integer")))?;
        let raw_mols = req_item(&d, "molecules", &what)?;
        let mut molecules = Vec::new();
        let mut labels: HashMap<i64, Vec<(usize, usize)>> = HashMap::new();
        for (mi, mentry) in as_entries(&raw_mols, &what)?.iter().enumerate() {
            let md = as_dict(mentry, &what)?;
            let (type_id, states, bonds) = parse_concrete_molecule(table, &md, &what)?;
            for (comp, label) in bonds {
                if let Some(l) = label {
                    labels.entry(l).or_default().push((mi, comp));
                }
            }
            molecules.push(SeedMolecule { type_id, states });
        }
        let mut bonds = Vec::new();
        for (label, ends) in labels {
            if ends.len() != 2 {
                return Err(SimError::Model(format!(
                    "{what}: bond label {label} must appear exactly twice"
                )));
            }
            bonds.push((ends[0], ends[1]));
        }
        bonds.sort();
        out.push(SeedSpecies {
            molecules,
            bonds,
            count,
        });
    }
    Ok(out)
}

fn parse_observables(
    table: &TypeTable,
    model: &Bound<'_, PyDict>,
) -> Result<Vec<ObservableSpec>, SimError> {
    let mut out = Vec::new();
    let Some(raw) = item(model, "observables", "model")? else {
        return Ok(out);
    };
    for (i, entry) in as_entries(&raw, "observables")?.iter().enumerate() {
        let what = format!("observable {i}");
        let d = as_dict(entry, &what)?;
        let name = extract_string(&req_item(&d, "name", &what)?, "observable name")?;
        let kind = match item(&d, "type", &what)? {
            Some(v) => match extract_string(&v, "observable type")?.as_str() {
                "molecules" => ObservableKind::Molecules,
                "species" => ObservableKind::Species,
                other => {
                    return Err(SimError::InvalidArgument(format!(
                        "observable {name}: unrecognized type `{other}`"
                    )));
                }
            },
            None => ObservableKind::Molecules,
        };
        let pattern = parse_pattern(
            table,
            &req_item(&d, "pattern", &what)?,
            &format!("observable {name}"),
        )?;
        out.push(ObservableSpec {
            name,
            kind,
            pattern,
        });
    }
    Ok(out)
}

fn parse_global_functions(model: &Bound<'_, PyDict>) -> Result<Vec<GlobalFunctionSpec>, SimError> {
    let mut out = Vec::new();
    let Some(raw) = item(model, "functions", "model")? else {
        return Ok(out);
    };
    for entry in as_entries(&raw, "functions")? {
        let d = as_dict(&entry, "function")?;
        let name = extract_string(&req_item(&d, "name", "function")?, "function name")?;
        let expr_src = extract_string(
            &req_item(&d, "expression", "function")?,
            "function expression",
        )?;
        let expr = compile_expression(&expr_src, &format!("function {name}"))?;
        out.push(GlobalFunctionSpec {
            name,
            expr_src,
            expr,
        });
    }
    Ok(out)
}

fn parse_local_functions(
    table: &TypeTable,
    model: &Bound<'_, PyDict>,
) -> Result<Vec<LocalFunctionSpec>, SimError> {
    let mut out = Vec::new();
    let Some(raw) = item(model, "local_functions", "model")? else {
        return Ok(out);
    };
    for entry in as_entries(&raw, "local_functions")? {
        let d = as_dict(&entry, "local function")?;
        let name = extract_string(&req_item(&d, "name", "local function")?, "name")?;
        let what = format!("local function {name}");
        let expr_src = extract_string(&req_item(&d, "expression", &what)?, "expression")?;
        let expr = compile_expression(&expr_src, &what)?;
        let mut observables = Vec::new();
        if let Some(raw_obs) = item(&d, "observables", &what)? {
            for oentry in as_entries(&raw_obs, &what)? {
                let od = as_dict(&oentry, &what)?;
                let oname = extract_string(&req_item(&od, "name", &what)?, "observable name")?;
                let pattern = parse_pattern(table, &req_item(&od, "pattern", &what)?, &what)?;
                observables.push(LocalObservable {
                    name: oname,
                    pattern,
                });
            }
        }
        out.push(LocalFunctionSpec {
            name,
            expr_src,
            expr,
            observables,
            arg_types: Vec::new(),
        });
    }
    Ok(out)
}

fn parse_target(obj: &Bound<'_, PyAny>, what: &str) -> Result<TransformTarget, SimError> {
    let (pos, node, site): (usize, usize, usize) = obj.extract().map_err(|_| {
        SimError::InvalidArgument(format!(
            "{what}: targets must be (position, molecule, site) triples"
        ))
    })?;
    Ok(TransformTarget { pos, node, site })
}

/// The component a target resolves to, for state-name lookup.
fn target_component(
    table: &TypeTable,
    reactants: &[Pattern],
    product_types: &[TypeId],
    t: &TransformTarget,
    what: &str,
) -> Result<(TypeId, usize), SimError> {
    if t.pos < reactants.len() {
        let pm = reactants[t.pos]
            .molecules
            .get(t.node)
            .ok_or_else(|| SimError::Model(format!("{what}: target molecule out of range")))?;
        let sp = pm
            .sites
            .get(t.site)
            .ok_or_else(|| SimError::Model(format!("{what}: target site out of range")))?;
        let ty = &table.types[pm.type_id];
        Ok((pm.type_id, site_state_component(ty, &sp.site)))
    } else {
        let ty = *product_types
            .get(t.pos - reactants.len())
            .ok_or_else(|| SimError::Model(format!("{what}: target product out of range")))?;
        Ok((ty, t.site))
    }
}

fn parse_rules(
    table: &TypeTable,
    model: &Bound<'_, PyDict>,
    local_fns: &[LocalFunctionSpec],
) -> Result<Vec<RuleSpec>, SimError> {
    let mut out = Vec::new();
    let Some(raw) = item(model, "rules", "model")? else {
        return Ok(out);
    };
    for (i, entry) in as_entries(&raw, "rules")?.iter().enumerate() {
        let d = as_dict(entry, &format!("rule {i}"))?;
        let name = match item(&d, "name", "rule")? {
            Some(v) => extract_string(&v, "rule name")?,
            None => format!("rule{i}"),
        };
        let what = format!("rule {name}");
        let mut reactants = Vec::new();
        if let Some(raw_r) = item(&d, "reactants", &what)? {
            for (p, rentry) in as_entries(&raw_r, &what)?.iter().enumerate() {
                reactants.push(parse_pattern(
                    table,
                    rentry,
                    &format!("{what} reactant {p}"),
                )?);
            }
        }
        let rate_obj = req_item(&d, "rate", &what)?;
        let rate = if let Ok(v) = rate_obj.extract::<f64>() {
            RateLaw::Constant { value: v }
        } else {
            let rd = as_dict(&rate_obj, &format!("{what} rate"))?;
            if let Some(p) = item(&rd, "parameter", &what)? {
                RateLaw::Parameter {
                    name: extract_string(&p, "rate parameter")?,
                    value: 0.0,
                }
            } else if let Some(e) = item(&rd, "expression", &what)? {
                let expr_src = extract_string(&e, "rate expression")?;
                let expr = compile_expression(&expr_src, &what)?;
                RateLaw::Expression { expr_src, expr }
            } else {
                return Err(SimError::InvalidArgument(format!(
                    "{what}: rate must be a number, {{\"parameter\"}} or {{\"expression\"}}"
                )));
            }
        };
        let total_rate = match item(&d, "total_rate", &what)? {
            Some(v) => v.extract().map_err(|_| {
                SimError::InvalidArgument(format!("{what}: `total_rate` must be a bool"))
            })?,
            None => false,
        };
        let kind = match item(&d, "dor", &what)? {
            Some(v) => {
                let dd = as_dict(&v, &format!("{what} dor"))?;
                let position: usize = req_item(&dd, "position", &what)?.extract().map_err(|_| {
                    SimError::InvalidArgument(format!("{what}: dor position must be an integer"))
                })?;
                let fname = extract_string(&req_item(&dd, "function", &what)?, "dor function")?;
                let function = local_fns
                    .iter()
                    .position(|f| f.name == fname)
                    .ok_or_else(|| {
                        SimError::Model(format!("{what}: unknown local function `{fname}`"))
                    })?;
                RuleKind::Dor { position, function }
            }
            None => RuleKind::Basic,
        };

        let mut transformations = Vec::new();
        let mut product_types: Vec<TypeId> = Vec::new();
        let raw_tf = req_item(&d, "transformations", &what)?;
        for tentry in as_entries(&raw_tf, &what)? {
            let td = as_dict(&tentry, &what)?;
            let op = extract_string(&req_item(&td, "op", &what)?, "op")?;
            match op.as_str() {
                "change_state" => {
                    let target = parse_target(&req_item(&td, "target", &what)?, &what)?;
                    let (ty_id, comp) =
                        target_component(table, &reactants, &product_types, &target, &what)?;
                    let value = parse_state_value(
                        &table.types[ty_id],
                        comp,
                        &req_item(&td, "state", &what)?,
                        &what,
                    )?;
                    transformations.push(Transformation::ChangeState { target, value });
                }
                "bind" => {
                    let a = parse_target(&req_item(&td, "a", &what)?, &what)?;
                    let b = parse_target(&req_item(&td, "b", &what)?, &what)?;
                    let separate = match item(&td, "separate_complexes", &what)? {
                        Some(v) => v.extract().map_err(|_| {
                            SimError::InvalidArgument(format!(
                                "{what}: `separate_complexes` must be a bool"
                            ))
                        })?,
                        None => false,
                    };
                    transformations.push(Transformation::Bind {
                        a,
                        b,
                        allow_same_complex: !separate,
                    });
                }
                "unbind" => {
                    let target = parse_target(&req_item(&td, "target", &what)?, &what)?;
                    transformations.push(Transformation::Unbind { target });
                }
                "add" => {
                    let (type_id, states, bonds) = parse_concrete_molecule(table, &td, &what)?;
                    if bonds.iter().any(|(_, l)| l.is_some()) {
                        return Err(SimError::Model(format!(
                            "{what}: products are created unbound; bind them explicitly"
                        )));
                    }
                    product_types.push(type_id);
                    transformations.push(Transformation::Add { type_id, states });
                }
                "delete" => {
                    let pos: usize = req_item(&td, "pos", &what)?.extract().map_err(|_| {
                        SimError::InvalidArgument(format!("{what}: delete pos must be an integer"))
                    })?;
                    let node: usize = match item(&td, "node", &what)? {
                        Some(v) => v.extract().map_err(|_| {
                            SimError::InvalidArgument(format!(
                                "{what}: delete node must be an integer"
                            ))
                        })?,
                        None => 0,
                    };
                    let mode = match item(&td, "mode", &what)? {
                        Some(v) => match extract_string(&v, "delete mode")?.as_str() {
                            "complex" => DeleteMode::WholeComplex,
                            "molecule" => DeleteMode::MoleculeOnly,
                            other => {
                                return Err(SimError::InvalidArgument(format!(
                                    "{what}: unrecognized delete mode `{other}`"
                                )));
                            }
                        },
                        None => DeleteMode::MoleculeOnly,
                    };
                    transformations.push(Transformation::Delete { pos, node, mode });
                }
                "inc_population" => {
                    let pos: usize = req_item(&td, "pos", &what)?.extract().map_err(|_| {
                        SimError::InvalidArgument(format!("{what}: pos must be an integer"))
                    })?;
                    transformations.push(Transformation::IncrementPopulation { pos });
                }
                "dec_population" => {
                    let pos: usize = req_item(&td, "pos", &what)?.extract().map_err(|_| {
                        SimError::InvalidArgument(format!("{what}: pos must be an integer"))
                    })?;
                    transformations.push(Transformation::DecrementPopulation { pos });
                }
                other => {
                    return Err(SimError::InvalidArgument(format!(
                        "{what}: unrecognized transformation `{other}`"
                    )));
                }
            }
        }

        out.push(RuleSpec {
            name,
            reactants,
            transformations,
            rate,
            kind,
            total_rate,
        });
    }
    Ok(out)
}

pub fn parse_model(model: &Bound<'_, PyDict>, config: SimConfig) -> Result<Model, SimError> {
    let table = parse_molecule_types(model)?;
    let params = parse_parameters(model)?;
    let seed_species = parse_species(&table, model)?;
    let observables = parse_observables(&table, model)?;
    let global_fns = parse_global_functions(model)?;
    let local_fns = parse_local_functions(&table, model)?;
    let rules = parse_rules(&table, model, &local_fns)?;
    let mut compiled = Model {
        types: table.types,
        params,
        seed_species,
        observables,
        global_fns,
        local_fns,
        rules,
        config,
        connected: Vec::new(),
    };
    compiled.compile()?;
    Ok(compiled)
}

struct RunExtras {
    events: u64,
    null_events: u64,
    species: Option<Vec<(String, i64)>>,
    firing_counts: Option<Vec<(String, u64)>>,
    firing_log: Option<(Vec<String>, Vec<FiringRecord>)>,
}

fn table_into_py(py: Python<'_>, table: &SampleTable) -> PyResult<Py<PyAny>> {
    let dims = vec![table.n_rows(), table.columns.len()];
    let array = unsafe { PyArrayDyn::<f64>::new(py, IxDyn(&dims), false) };
    unsafe {
        array
            .as_slice_mut()
            .map_err(|_| PyValueError::new_err("failed to export samples"))?
            .copy_from_slice(&table.data);
    }
    Ok(array.into_any().unbind())
}

fn extras_into_py(py: Python<'_>, table: &SampleTable, extras: RunExtras) -> PyResult<Py<PyAny>> {
    let d = PyDict::new(py);
    d.set_item("columns", table.columns.clone())?;
    d.set_item("events", extras.events)?;
    d.set_item("null_events", extras.null_events)?;
    if let Some(species) = extras.species {
        let sd = PyDict::new(py);
        for (label, count) in species {
            sd.set_item(label, count)?;
        }
        d.set_item("species", sd)?;
    }
    if let Some(counts) = extras.firing_counts {
        let cd = PyDict::new(py);
        for (name, count) in counts {
            cd.set_item(name, count)?;
        }
        d.set_item("firing_counts", cd)?;
    }
    if let Some((rule_names, log)) = extras.firing_log {
        let entries = PyList::empty(py);
        for rec in log {
            let e = PyDict::new(py);
            e.set_item("time", rec.time)?;
            e.set_item("rule", rule_names[rec.rule].clone())?;
            e.set_item("molecules", rec.mols)?;
            e.set_item("bonds_made", rec.bonds_made)?;
            e.set_item("bonds_broken", rec.bonds_broken)?;
            entries.append(e)?;
        }
        d.set_item("firing_log", entries)?;
    }
    Ok(d.into_any().unbind())
}

#[pyfunction(signature = (
    model,
    t_end,
    n_samples,
    seed=None,
    equilibration=None,
    verbose=false,
    max_cpu_time=None,
    track_complexes=true,
    traversal_limit=None,
    molecule_limit=100_000,
    use_connectivity=false,
    output_global_functions=false,
    output_event_counter=false,
    output_path=None,
    csv=false,
    firing_log=false,
    rxn_log_path=None,
    log_buffer_size=10_000,
    species_census=false,
    firing_counts=false
))]
#[allow(clippy::too_many_arguments)]
pub fn simulate_model(
    py: Python<'_>,
    model: &Bound<'_, PyDict>,
    t_end: f64,
    n_samples: usize,
    seed: Option<u64>,
    equilibration: Option<f64>,
    verbose: bool,
    max_cpu_time: Option<f64>,
    track_complexes: bool,
    traversal_limit: Option<usize>,
    molecule_limit: usize,
    use_connectivity: bool,
    output_global_functions: bool,
    output_event_counter: bool,
    output_path: Option<String>,
    csv: bool,
    firing_log: bool,
    rxn_log_path: Option<String>,
    log_buffer_size: usize,
    species_census: bool,
    firing_counts: bool,
) -> PyResult<Py<PyAny>> {
    let config = SimConfig {
        track_complexes,
        traversal_limit,
        molecule_limit,
        use_connectivity,
        verbose,
        max_cpu_time,
        output_global_functions,
        output_event_counter,
        keep_firing_log: firing_log,
        log_buffer_size,
    };
    let compiled = parse_model(model, config)?;
    let want_extras = firing_log || species_census || firing_counts;

    let result: Result<(SampleTable, RunExtras), SimError> = py.detach(move || {
        let mut sys = System::new(&compiled, system::derive_seed(seed, 0))?;
        if let Some(path) = &rxn_log_path {
            sys.register_log_file(path)?;
        }
        if let Some(d) = equilibration {
            sys.equilibrate(d)?;
        }
        let table = sys.sim(t_end, n_samples)?;
        if let Some(path) = &output_path {
            let file = File::create(path).map_err(|e| {
                SimError::InvalidArgument(format!("cannot open output file {path}: {e}"))
            })?;
            let mut w = BufWriter::new(file);
            table
                .write_text(&mut w, csv)
                .map_err(|e| SimError::InvalidArgument(format!("output write failed: {e}")))?;
        }
        let log = sys.finish_firing_log()?;
        let extras = RunExtras {
            events: sys.event_count,
            null_events: sys.null_event_count,
            species: if species_census {
                Some(sys.species_census()?)
            } else {
                None
            },
            firing_counts: if firing_counts {
                Some(sys.firing_counts())
            } else {
                None
            },
            firing_log: if firing_log {
                let names = sys.rules.iter().map(|r| r.name.clone()).collect();
                Some((names, log))
            } else {
                None
            },
        };
        Ok((table, extras))
    });
    let (table, extras) = result?;

    let samples = table_into_py(py, &table)?;
    if want_extras {
        let extras_obj = extras_into_py(py, &table, extras)?;
        let tuple = pyo3::types::PyTuple::new(py, [samples, extras_obj])?;
        Ok(tuple.into_any().unbind())
    } else {
        Ok(samples)
    }
}

#[pyfunction(signature = (
    model,
    t_end,
    n_samples,
    n_trajectories,
    n_threads=None,
    seed=None,
    track_complexes=true,
    traversal_limit=None,
    molecule_limit=100_000,
    use_connectivity=false,
    output_global_functions=false,
    output_event_counter=false
))]
#[allow(clippy::too_many_arguments)]
pub fn simulate_ensemble(
    py: Python<'_>,
    model: &Bound<'_, PyDict>,
    t_end: f64,
    n_samples: usize,
    n_trajectories: usize,
    n_threads: Option<usize>,
    seed: Option<u64>,
    track_complexes: bool,
    traversal_limit: Option<usize>,
    molecule_limit: usize,
    use_connectivity: bool,
    output_global_functions: bool,
    output_event_counter: bool,
) -> PyResult<Py<PyAny>> {
    let config = SimConfig {
        track_complexes,
        traversal_limit,
        molecule_limit,
        use_connectivity,
        output_global_functions,
        output_event_counter,
        ..SimConfig::default()
    };
    let compiled = parse_model(model, config)?;
    let output =
        py.detach(move || run_ensemble(&compiled, t_end, n_samples, n_trajectories, n_threads, seed))?;
    let dims = vec![output.n_trajectories, output.n_times, output.columns.len()];
    let array = unsafe { PyArrayDyn::<f64>::new(py, IxDyn(&dims), false) };
    unsafe {
        array
            .as_slice_mut()
            .map_err(|_| PyValueError::new_err("failed to export ensemble data"))?
            .copy_from_slice(&output.data);
    }
    Ok(array.into_any().unbind())
}

#[pymodule]
fn rulesim(_py: Python<'_>, module: &Bound<'_, PyModule>) -> PyResult<()> {
    module.add_function(wrap_pyfunction!(simulate_model, module)?)?;
    module.add_function(wrap_pyfunction!(simulate_ensemble, module)?)?;
    Ok(())
}
