use std::collections::HashMap;

use meval::{Context, ContextProvider, Expr};

use crate::SimError;
use crate::molecule::{MolId, MoleculeType, TypeId};
use crate::observable::Observable;
use crate::pattern::{Pattern, match_count};
use crate::population::Population;

#[derive(Clone, Debug)]
pub struct GlobalFunctionSpec {
    pub name: String,
    pub expr_src: String,
    pub expr: Expr,
}

/// System-wide scalar over observables and parameters. The cached value is
/// refreshed after every firing and on parameter updates.
#[derive(Clone, Debug)]
pub struct GlobalFunction {
    pub name: String,
    pub expr_src: String,
    pub expr: Expr,
    pub value: f64,
}

impl GlobalFunction {
    pub fn new(spec: &GlobalFunctionSpec) -> Self {
        Self {
            name: spec.name.clone(),
            expr_src: spec.expr_src.clone(),
            expr: spec.expr.clone(),
            value: 0.0,
        }
    }

    pub fn evaluate(
        &self,
        observables: &[Observable],
        types: &[MoleculeType],
        pop: &Population,
        params: &HashMap<String, f64>,
    ) -> Result<f64, SimError> {
        eval_observable_expression(&self.expr, &self.name, observables, types, pop, params)
    }
}

/// Evaluate an expression over observable counts and parameters; shared by
/// global functions and expression rate laws.
pub fn eval_observable_expression(
    expr: &Expr,
    what: &str,
    observables: &[Observable],
    types: &[MoleculeType],
    pop: &Population,
    params: &HashMap<String, f64>,
) -> Result<f64, SimError> {
    let ctx = ObservableContext {
        observables,
        types,
        pop,
        params,
    };
    let v = expr
        .eval_with_context((ctx, Context::new()))
        .map_err(|e| SimError::Model(format!("{what} failed to evaluate: {e}")))?;
    if !v.is_finite() {
        return Err(SimError::Numeric(format!(
            "{what} evaluated to a non-finite value"
        )));
    }
    Ok(v)
}

struct ObservableContext<'a> {
    observables: &'a [Observable],
    types: &'a [MoleculeType],
    pop: &'a Population,
    params: &'a HashMap<String, f64>,
}

impl ContextProvider for ObservableContext<'_> {
    fn get_var(&self, name: &str) -> Option<f64> {
        if let Some(o) = self.observables.iter().find(|o| o.name == name) {
            return Some(o.value(self.types, self.pop));
        }
        self.params.get(name).copied()
    }
}

/// A pattern counted within the complex of the argument molecule.
#[derive(Clone, Debug)]
pub struct LocalObservable {
    pub name: String,
    pub pattern: Pattern,
}

#[derive(Clone, Debug)]
pub struct LocalFunctionSpec {
    pub name: String,
    pub expr_src: String,
    pub expr: Expr,
    pub observables: Vec<LocalObservable>,
    /// Filled at model compile time from the rules that use the function.
    pub arg_types: Vec<TypeId>,
}

/// Complex-scoped scalar, parameterised by a molecule. Evaluation walks
/// the argument's complex, counts the local observables there and feeds
/// them to the expression alongside parameters and global observables.
#[derive(Clone, Debug)]
pub struct LocalFunction {
    pub name: String,
    pub expr_src: String,
    pub expr: Expr,
    pub observables: Vec<LocalObservable>,
    /// Molecule types this function may be evaluated on; registered by the
    /// DOR rules that use it.
    pub arg_types: Vec<TypeId>,
}

impl LocalFunction {
    pub fn new(spec: &LocalFunctionSpec) -> Self {
        Self {
            name: spec.name.clone(),
            expr_src: spec.expr_src.clone(),
            expr: spec.expr.clone(),
            observables: spec.observables.clone(),
            arg_types: spec.arg_types.clone(),
        }
    }

    pub fn evaluate(
        &self,
        index: usize,
        types: &[MoleculeType],
        pop: &Population,
        observables: &[Observable],
        params: &HashMap<String, f64>,
        arg: MolId,
    ) -> Result<f64, SimError> {
        let arg_ty = pop.mol(arg).type_id;
        if !self.arg_types.contains(&arg_ty) {
            return Err(SimError::Scope {
                function: self.name.clone(),
                index,
                arg_types: self.arg_types.iter().map(|&t| types[t].name.clone()).collect(),
            });
        }
        let members = pop.traverse(arg, None);
        let mut counts: Vec<(String, f64)> = Vec::with_capacity(self.observables.len());
        for lo in &self.observables {
            let mut n = 0.0;
            for &m in &members {
                let k = match_count(&lo.pattern, types, pop, m);
                if k > 0 {
                    let mol = pop.mol(m);
                    let mult = if types[mol.type_id].population_type {
                        mol.population as f64
                    } else {
                        1.0
                    };
                    n += k as f64 * mult;
                }
            }
            counts.push((lo.name.clone(), n));
        }
        let ctx = LocalContext {
            counts: &counts,
            observables,
            types,
            pop,
            params,
        };
        let v = self
            .expr
            .eval_with_context((ctx, Context::new()))
            .map_err(|e| {
                SimError::Model(format!(
                    "local function {} failed to evaluate: {}",
                    self.name, e
                ))
            })?;
        if !v.is_finite() {
            return Err(SimError::Numeric(format!(
                "local function {} evaluated to a non-finite value",
                self.name
            )));
        }
        Ok(v)
    }
}

struct LocalContext<'a> {
    counts: &'a [(String, f64)],
    observables: &'a [Observable],
    types: &'a [MoleculeType],
    pop: &'a Population,
    params: &'a HashMap<String, f64>,
}

impl ContextProvider for LocalContext<'_> {
    fn get_var(&self, name: &str) -> Option<f64> {
        if let Some((_, v)) = self.counts.iter().find(|(n, _)| n == name) {
            return Some(*v);
        }
        if let Some(v) = self.params.get(name) {
            return Some(*v);
        }
        self.observables
            .iter()
            .find(|o| o.name == name)
            .map(|o| o.value(self.types, self.pop))
    }
}

pub fn compile_expression(src: &str, what: &str) -> Result<Expr, SimError> {
    src.parse::<Expr>()
        .map_err(|e| SimError::Model(format!("{what}: cannot parse expression `{src}`: {e}")))
}
