//! Constraint solving over the usage-kind lattice.
//!
//! The solver takes a bag of kind inequalities and produces a canonical
//! form: per variable at most one constant lower bound (the least upper
//! bound of its constant predecessors), at most one constant upper bound
//! (the greatest lower bound of its constant successors), plus the
//! variable-to-variable edges. It fails when a constant edge violates the
//! lattice order or a variable's feasible window is empty.
//!
//! At generalisation time the solver additionally simplifies: variables
//! whose feasible window is a single point are pinned, chains through
//! polarity-determined variables are collapsed, and variables that are
//! neither kept nor reachable from kept ones are eliminated with their
//! paths preserved.

use std::collections::{BTreeMap, BTreeSet};

use affe_types::{Kind, KindConst, KindVarId, Type, Variance};

use crate::typeck::Env;
use crate::{Constraint, InferError, Provenance, Unifier};

/// Options for the generalisation-time simplification pass.
pub struct SimplifyOptions {
    /// Variables that must survive: free in the result scheme or in the
    /// environment.
    pub keep: BTreeSet<KindVarId>,
    /// Polarity of each kind variable in the result type.
    pub variance: BTreeMap<KindVarId, Variance>,
    /// Variables below this level belong to outer scopes and are never
    /// rewritten or eliminated.
    pub gen_floor: u32,
}

#[derive(Default)]
struct Graph {
    lower: BTreeMap<KindVarId, (KindConst, Provenance)>,
    upper: BTreeMap<KindVarId, (KindConst, Provenance)>,
    edges: BTreeMap<(KindVarId, KindVarId), Provenance>,
}

impl Graph {
    fn add_lower(&mut self, var: KindVarId, constant: KindConst, provenance: &Provenance) -> bool {
        match self.lower.get_mut(&var) {
            Some((existing, _)) => {
                let merged = existing.lub(constant);
                let changed = merged != *existing;
                *existing = merged;
                changed
            }
            None => {
                self.lower.insert(var, (constant, provenance.clone()));
                true
            }
        }
    }

    fn add_upper(&mut self, var: KindVarId, constant: KindConst, provenance: &Provenance) -> bool {
        match self.upper.get_mut(&var) {
            Some((existing, _)) => {
                let merged = existing.glb(constant);
                let changed = merged != *existing;
                *existing = merged;
                changed
            }
            None => {
                self.upper.insert(var, (constant, provenance.clone()));
                true
            }
        }
    }

    fn vars(&self) -> BTreeSet<KindVarId> {
        let mut vars: BTreeSet<KindVarId> = self.lower.keys().copied().collect();
        vars.extend(self.upper.keys().copied());
        for (a, b) in self.edges.keys() {
            vars.insert(*a);
            vars.insert(*b);
        }
        vars
    }

    fn in_edges(&self, var: KindVarId) -> Vec<KindVarId> {
        self.edges
            .keys()
            .filter(|(_, b)| *b == var)
            .map(|(a, _)| *a)
            .collect()
    }

    fn out_edges(&self, var: KindVarId) -> Vec<KindVarId> {
        self.edges
            .keys()
            .filter(|(a, _)| *a == var)
            .map(|(_, b)| *b)
            .collect()
    }
}

/// Solve a set of kind constraints to canonical form.
///
/// Equalities between types must already have been discharged; only
/// `Constraint::KindLeq` items are meaningful here. With `simplify`
/// options the solver also compresses and eliminates variables for the
/// generaliser; without them it only canonicalises and checks
/// feasibility, leaving every variable in place.
pub fn solve(
    unifier: &mut Unifier,
    constraints: Vec<Constraint>,
    simplify: Option<&SimplifyOptions>,
) -> Result<Vec<Constraint>, InferError> {
    let mut work: Vec<(Kind, Kind, Provenance)> = constraints
        .into_iter()
        .filter_map(|c| match c {
            Constraint::KindLeq {
                lhs,
                rhs,
                provenance,
            } => Some((lhs, rhs, provenance)),
            Constraint::TypeEqual { .. } => None,
        })
        .collect();

    let mut keep = simplify.map(|options| options.keep.clone()).unwrap_or_default();
    let graph = loop {
        let mut graph = classify(unifier, &work)?;
        propagate(&mut graph);
        check_feasible(&graph)?;

        let mut changed = pin_single_point_windows(unifier, &graph);
        changed |= merge_equal_pairs(unifier, &graph, &mut keep);
        if let Some(options) = simplify {
            changed |= collapse_polar_chains(unifier, &graph, options, &mut keep);
        }
        if !changed {
            if let Some(options) = simplify {
                eliminate(&mut graph, unifier, options, &keep);
            }
            break graph;
        }
        // Something was linked; rebuild the graph so the links resolve.
        work = rebuild_work(&graph);
    };

    Ok(emit(unifier, &graph))
}

fn classify(
    unifier: &mut Unifier,
    work: &[(Kind, Kind, Provenance)],
) -> Result<Graph, InferError> {
    let mut graph = Graph::default();
    for (lhs, rhs, provenance) in work {
        let lhs = unifier.resolve_kind(lhs);
        let rhs = unifier.resolve_kind(rhs);
        match (&lhs, &rhs) {
            (Kind::GenericVar(v), _) | (_, Kind::GenericVar(v)) => {
                return Err(InferError::AlreadyGeneralised {
                    term: Kind::GenericVar(*v).to_string(),
                });
            }
            (Kind::Const(c1), Kind::Const(c2)) => {
                if !c1.leq(*c2) {
                    return Err(InferError::KindMismatch {
                        left: lhs.clone(),
                        right: rhs.clone(),
                    });
                }
            }
            (Kind::Var(v), Kind::Const(c)) => {
                graph.add_upper(*v, *c, provenance);
            }
            (Kind::Const(c), Kind::Var(v)) => {
                graph.add_lower(*v, *c, provenance);
            }
            (Kind::Var(a), Kind::Var(b)) => {
                if a != b {
                    graph
                        .edges
                        .entry((*a, *b))
                        .or_insert_with(|| provenance.clone());
                }
            }
        }
    }
    Ok(graph)
}

/// Push constant bounds along variable edges until nothing moves: for an
/// edge a ≤ b, b inherits a's lower bounds and a inherits b's upper
/// bounds. Terminates because the lattice is finite.
fn propagate(graph: &mut Graph) {
    loop {
        let mut changed = false;
        let edges: Vec<(KindVarId, KindVarId)> = graph.edges.keys().copied().collect();
        for (a, b) in edges {
            let provenance = graph.edges[&(a, b)].clone();
            if let Some((low, _)) = graph.lower.get(&a).cloned() {
                changed |= graph.add_lower(b, low, &provenance);
            }
            if let Some((up, _)) = graph.upper.get(&b).cloned() {
                changed |= graph.add_upper(a, up, &provenance);
            }
        }
        if !changed {
            break;
        }
    }
}

fn check_feasible(graph: &Graph) -> Result<(), InferError> {
    for var in graph.vars() {
        let lower = graph.lower.get(&var).map(|(c, _)| *c);
        let upper = graph.upper.get(&var).map(|(c, _)| *c);
        if let (Some(low), Some(up)) = (lower, upper)
            && !low.leq(up)
        {
            return Err(InferError::KindInfeasible {
                lower: Kind::Const(low),
                var: Kind::Var(var),
                upper: Kind::Const(up),
            });
        }
    }
    Ok(())
}

/// Link every variable whose feasible window is a single lattice point.
fn pin_single_point_windows(unifier: &mut Unifier, graph: &Graph) -> bool {
    let mut changed = false;
    for var in graph.vars() {
        let low = graph
            .lower
            .get(&var)
            .map(|(c, _)| *c)
            .unwrap_or(KindConst::BOTTOM);
        let up = graph
            .upper
            .get(&var)
            .map(|(c, _)| *c)
            .unwrap_or(KindConst::TOP);
        if low == up {
            unifier.link_kind_var(var, Kind::Const(low));
            changed = true;
        }
    }
    changed
}

/// Merge the members of two-cycles: `a ≤ b` together with `b ≤ a` proves
/// the two variables equal, so one is linked onto the other. The
/// survivor inherits keep status so elimination cannot drop it.
fn merge_equal_pairs(
    unifier: &mut Unifier,
    graph: &Graph,
    keep: &mut BTreeSet<KindVarId>,
) -> bool {
    let mut changed = false;
    for (a, b) in graph.edges.keys() {
        if a < b
            && graph.edges.contains_key(&(*b, *a))
            && unifier.kind_var_level(*a).is_some()
            && unifier.kind_var_level(*b).is_some()
        {
            unifier.link_kind_var(*a, Kind::Var(*b));
            if keep.contains(a) {
                keep.insert(*b);
            }
            changed = true;
        }
    }
    changed
}

/// Collapse a variable determined by a single neighbour when its polarity
/// says no generality is lost: a strictly positive variable with exactly
/// one incoming edge and no constant lower bound takes its predecessor's
/// value; dually for a strictly negative variable with one outgoing edge.
/// The surviving neighbour inherits keep status.
fn collapse_polar_chains(
    unifier: &mut Unifier,
    graph: &Graph,
    options: &SimplifyOptions,
    keep: &mut BTreeSet<KindVarId>,
) -> bool {
    let mut changed = false;
    for var in graph.vars() {
        let Some(level) = unifier.kind_var_level(var) else {
            continue;
        };
        if level < options.gen_floor {
            continue;
        }
        match options.variance.get(&var) {
            Some(Variance::Pos) => {
                let ins = graph.in_edges(var);
                if graph.out_edges(var).is_empty()
                    && !graph.lower.contains_key(&var)
                    && ins.len() == 1
                    && unifier.kind_var_level(ins[0]).is_some()
                {
                    unifier.link_kind_var(var, Kind::Var(ins[0]));
                    if keep.contains(&var) {
                        keep.insert(ins[0]);
                    }
                    changed = true;
                }
            }
            Some(Variance::Neg) => {
                let outs = graph.out_edges(var);
                if graph.in_edges(var).is_empty()
                    && !graph.upper.contains_key(&var)
                    && outs.len() == 1
                    && unifier.kind_var_level(outs[0]).is_some()
                {
                    unifier.link_kind_var(var, Kind::Var(outs[0]));
                    if keep.contains(&var) {
                        keep.insert(outs[0]);
                    }
                    changed = true;
                }
            }
            _ => {}
        }
    }
    changed
}

/// Remove variables that are neither kept nor outer-scoped, preserving
/// connectivity between the survivors with bypass edges.
fn eliminate(
    graph: &mut Graph,
    unifier: &Unifier,
    options: &SimplifyOptions,
    keep: &BTreeSet<KindVarId>,
) {
    let victims: Vec<KindVarId> = graph
        .vars()
        .into_iter()
        .filter(|v| {
            !keep.contains(v)
                && unifier
                    .kind_var_level(*v)
                    .is_some_and(|level| level >= options.gen_floor)
        })
        .collect();

    for victim in victims {
        let ins = graph.in_edges(victim);
        let outs = graph.out_edges(victim);
        for a in &ins {
            for b in &outs {
                if a != b && !graph.edges.contains_key(&(*a, *b)) {
                    let provenance = graph.edges[&(*a, victim)].clone();
                    graph.edges.insert((*a, *b), provenance);
                }
            }
        }
        graph.edges.retain(|(a, b), _| *a != victim && *b != victim);
        graph.lower.remove(&victim);
        graph.upper.remove(&victim);
    }
}

fn rebuild_work(graph: &Graph) -> Vec<(Kind, Kind, Provenance)> {
    let mut work = Vec::new();
    for (var, (c, provenance)) in &graph.lower {
        work.push((Kind::Const(*c), Kind::Var(*var), provenance.clone()));
    }
    for (var, (c, provenance)) in &graph.upper {
        work.push((Kind::Var(*var), Kind::Const(*c), provenance.clone()));
    }
    for ((a, b), provenance) in &graph.edges {
        work.push((Kind::Var(*a), Kind::Var(*b), provenance.clone()));
    }
    work
}

/// Emit the canonical constraint list: non-trivial constant bounds plus
/// the surviving variable edges.
fn emit(unifier: &mut Unifier, graph: &Graph) -> Vec<Constraint> {
    let mut out = Vec::new();
    for (var, (c, provenance)) in &graph.lower {
        if unifier.kind_var_level(*var).is_none() {
            continue;
        }
        if *c != KindConst::BOTTOM {
            out.push(Constraint::KindLeq {
                lhs: Kind::Const(*c),
                rhs: Kind::Var(*var),
                provenance: provenance.clone(),
            });
        }
    }
    for (var, (c, provenance)) in &graph.upper {
        if unifier.kind_var_level(*var).is_none() {
            continue;
        }
        if *c != KindConst::TOP {
            out.push(Constraint::KindLeq {
                lhs: Kind::Var(*var),
                rhs: Kind::Const(*c),
                provenance: provenance.clone(),
            });
        }
    }
    for ((a, b), provenance) in &graph.edges {
        if unifier.kind_var_level(*a).is_none() || unifier.kind_var_level(*b).is_none() {
            continue;
        }
        out.push(Constraint::KindLeq {
            lhs: Kind::Var(*a),
            rhs: Kind::Var(*b),
            provenance: provenance.clone(),
        });
    }
    out
}

// ---------------------------------------------------------------------------
// Variance collection
// ---------------------------------------------------------------------------

/// Compute the polarity of every kind variable occurring in `ty`.
///
/// The walk is covariant on the result side and contravariant under an
/// arrow's parameter. Constructor arguments follow the variance declared
/// in the constructor's kind scheme, defaulting to invariant.
pub fn kind_polarities(
    unifier: &mut Unifier,
    env: &Env,
    ty: &Type,
) -> BTreeMap<KindVarId, Variance> {
    let mut map = BTreeMap::new();
    walk_polarities(unifier, env, ty, Variance::Pos, &mut map);
    map
}

fn record_polarity(
    unifier: &mut Unifier,
    kind: &Kind,
    polarity: Variance,
    map: &mut BTreeMap<KindVarId, Variance>,
) {
    if let Kind::Var(v) = unifier.resolve_kind(kind) {
        map.entry(v)
            .and_modify(|existing| *existing = existing.combine(polarity))
            .or_insert(polarity);
    }
}

fn walk_polarities(
    unifier: &mut Unifier,
    env: &Env,
    ty: &Type,
    polarity: Variance,
    map: &mut BTreeMap<KindVarId, Variance>,
) {
    match unifier.shorten(ty) {
        Type::Var(v) => {
            let kind = unifier.kind_of_var(v);
            record_polarity(unifier, &kind, polarity, map);
        }
        Type::GenericVar(_) => {}
        Type::Tuple(items) => {
            for item in &items {
                walk_polarities(unifier, env, item, polarity, map);
            }
        }
        Type::Arrow(param, kind, result) => {
            record_polarity(unifier, &kind, polarity, map);
            walk_polarities(unifier, env, &param, polarity.flip(), map);
            walk_polarities(unifier, env, &result, polarity, map);
        }
        Type::Borrow(_, kind, inner) => {
            record_polarity(unifier, &kind, polarity, map);
            walk_polarities(unifier, env, &inner, polarity, map);
        }
        Type::App(name, args) => {
            let declared: Vec<Variance> = env
                .find_type(&name)
                .map(|scheme| scheme.variance.clone())
                .unwrap_or_default();
            for (index, arg) in args.iter().enumerate() {
                let effective = match declared.get(index).copied().unwrap_or(Variance::Invar) {
                    Variance::Pos => polarity,
                    Variance::Neg => polarity.flip(),
                    Variance::Invar => Variance::Invar,
                };
                walk_polarities(unifier, env, arg, effective, map);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use affe_ast::Span;
    use affe_types::{Region, Usage};

    use crate::Reason;

    fn prov() -> Provenance {
        Provenance::new(Span::synthetic(), Reason::FunctionArg)
    }

    fn leq(lhs: Kind, rhs: Kind) -> Constraint {
        Constraint::KindLeq {
            lhs,
            rhs,
            provenance: prov(),
        }
    }

    #[test]
    fn constant_edge_violations_fail() {
        let mut unifier = Unifier::with_var_offsets(0, 0);
        let err = solve(
            &mut unifier,
            vec![leq(Kind::lin(Region::Global), Kind::un(Region::Global))],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, InferError::KindMismatch { .. }));
    }

    #[test]
    fn crossed_bounds_are_infeasible() {
        let mut unifier = Unifier::with_var_offsets(0, 0);
        let var = unifier.fresh_kind();
        let err = solve(
            &mut unifier,
            vec![
                leq(Kind::lin(Region::Global), var.clone()),
                leq(var, Kind::Const(KindConst::new(Usage::Un, Region::Never))),
            ],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, InferError::KindInfeasible { .. }));
    }

    #[test]
    fn bounds_propagate_through_edges() {
        let mut unifier = Unifier::with_var_offsets(0, 0);
        let a = unifier.fresh_kind();
        let b = unifier.fresh_kind();
        // lin ≤ a, a ≤ b, b ≤ un@never: infeasible only via the edge.
        let err = solve(
            &mut unifier,
            vec![
                leq(Kind::lin(Region::Global), a.clone()),
                leq(a, b.clone()),
                leq(b, Kind::Const(KindConst::new(Usage::Un, Region::Never))),
            ],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, InferError::KindInfeasible { .. }));
    }

    #[test]
    fn single_point_windows_pin_the_variable() {
        let mut unifier = Unifier::with_var_offsets(0, 0);
        let var = unifier.fresh_kind();
        let top = Kind::Const(KindConst::TOP);
        let residue = solve(
            &mut unifier,
            vec![leq(top.clone(), var.clone()), leq(var.clone(), top.clone())],
            None,
        )
        .expect("solvable");
        assert!(residue.is_empty());
        assert_eq!(unifier.resolve_kind(&var), top);
    }

    #[test]
    fn vacuous_bounds_are_dropped() {
        let mut unifier = Unifier::with_var_offsets(0, 0);
        let var = unifier.fresh_kind();
        let residue = solve(
            &mut unifier,
            vec![
                leq(Kind::Const(KindConst::BOTTOM), var.clone()),
                leq(var, Kind::Const(KindConst::TOP)),
            ],
            None,
        )
        .expect("solvable");
        assert!(residue.is_empty());
    }

    #[test]
    fn canonical_form_folds_constant_bounds() {
        let mut unifier = Unifier::with_var_offsets(0, 0);
        let var = unifier.fresh_kind();
        let residue = solve(
            &mut unifier,
            vec![
                leq(var.clone(), Kind::Const(KindConst::new(Usage::Aff, Region::Never))),
                leq(var.clone(), Kind::Const(KindConst::new(Usage::Un, Region::Never))),
            ],
            None,
        )
        .expect("solvable");
        // Both upper bounds fold into their glb.
        assert_eq!(residue.len(), 1);
        match &residue[0] {
            Constraint::KindLeq { lhs, rhs, .. } => {
                assert_eq!(lhs, &var);
                assert_eq!(
                    rhs,
                    &Kind::Const(KindConst::new(Usage::Un, Region::Never))
                );
            }
            other => panic!("unexpected residue {other:?}"),
        }
    }
}
