//! Property tests for the lattice, the multiplicity algebra, and the
//! solver, using proptest.
//!
//! These stress invariants that must hold for ANY input, not just
//! hand-picked examples:
//!
//! 1. The kind lattice is a partial order with correct bounds
//! 2. Sequential merge is commutative up to kind-list permutation;
//!    parallel merge is idempotent on identical arms
//! 3. The occurs check rejects every self-embedding
//! 4. Resolution is idempotent after arbitrary unification
//! 5. The solver's canonical form is a fixed point

use proptest::prelude::*;

use affe_ast::{Access, Name, NameSupply, Span};
use affe_types::{Kind, KindConst, KindVarId, Region, Type, Usage};

use crate::multiplicity::{Multiplicity, Use};
use crate::{Constraint, ConstraintSet, InferenceContext, Provenance, Reason, builtins, solve};

fn prov() -> Provenance {
    Provenance::new(Span::synthetic(), Reason::SequentialReuse)
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

fn arb_usage() -> impl Strategy<Value = Usage> {
    prop::sample::select(&[Usage::Un, Usage::Aff, Usage::Lin][..])
}

fn arb_region() -> impl Strategy<Value = Region> {
    prop_oneof![
        Just(Region::Global),
        (0u32..4).prop_map(Region::Scope),
        Just(Region::Never),
    ]
}

fn arb_const() -> impl Strategy<Value = KindConst> {
    (arb_usage(), arb_region()).prop_map(|(usage, region)| KindConst::new(usage, region))
}

/// Kinds for multiplicity entries; these never reach the solver, so
/// unregistered variable ids are fine.
fn arb_kind() -> impl Strategy<Value = Kind> {
    prop_oneof![
        (0u32..4).prop_map(|id| Kind::Var(KindVarId(id))),
        arb_const().prop_map(Kind::Const),
    ]
}

fn arb_use() -> impl Strategy<Value = Use> {
    prop_oneof![
        Just(Use::Shadow),
        prop::collection::vec(arb_kind(), 1..3).prop_map(|ks| Use::Borrow(Access::Read, ks)),
        prop::collection::vec(arb_kind(), 1..3).prop_map(|ks| Use::Borrow(Access::Write, ks)),
        prop::collection::vec(arb_kind(), 1..3).prop_map(Use::Normal),
    ]
}

const NAME_POOL: &[(&str, u32)] = &[("x", 0), ("y", 1), ("z", 2)];

fn arb_multiplicity() -> impl Strategy<Value = Multiplicity> {
    prop::collection::vec(prop::option::of(arb_use()), NAME_POOL.len()).prop_map(|uses| {
        let mut mult = Multiplicity::new();
        for ((text, tag), entry) in NAME_POOL.iter().zip(uses) {
            if let Some(used) = entry {
                match used {
                    Use::Shadow => {
                        mult.record_borrow(Name::new(*text, *tag), Access::Read, Kind::Var(KindVarId(0)));
                        mult.exit_scope(&[Name::new(*text, *tag)]);
                    }
                    Use::Borrow(access, kinds) => {
                        let name = Name::new(*text, *tag);
                        let mut rest = kinds.into_iter();
                        mult.record_borrow(name.clone(), access, rest.next().expect("non-empty"));
                        for kind in rest {
                            let mut single = Multiplicity::new();
                            single.record_borrow(name.clone(), access, kind);
                            if let Ok(merged) =
                                mult.clone().seq_merge(single, &prov(), &mut ConstraintSet::new())
                            {
                                mult = merged;
                            }
                        }
                    }
                    Use::Normal(kinds) => {
                        let name = Name::new(*text, *tag);
                        let mut rest = kinds.into_iter();
                        mult.record_use(name.clone(), rest.next().expect("non-empty"));
                        for kind in rest {
                            let mut single = Multiplicity::new();
                            single.record_use(name.clone(), kind);
                            if let Ok(merged) =
                                mult.clone().seq_merge(single, &prov(), &mut ConstraintSet::new())
                            {
                                mult = merged;
                            }
                        }
                    }
                }
            }
        }
        mult
    })
}

/// Canonical view of a multiplicity map: per name, the use flavour and
/// its kind list sorted by a structural key.
fn canonical(mult: &Multiplicity) -> Vec<(u32, u8, Vec<(u8, u32, u8, u64)>)> {
    let mut out = Vec::new();
    for name in mult.names() {
        let (flavour, kinds) = match mult.get(name).expect("name is present") {
            Use::Shadow => (0u8, Vec::new()),
            Use::Borrow(Access::Read, ks) => (1, ks.clone()),
            Use::Borrow(Access::Write, ks) => (2, ks.clone()),
            Use::Normal(ks) => (3, ks.clone()),
        };
        let mut keys: Vec<_> = kinds.iter().map(kind_key).collect();
        keys.sort_unstable();
        out.push((name.tag, flavour, keys));
    }
    out
}

fn kind_key(kind: &Kind) -> (u8, u32, u8, u64) {
    match kind {
        Kind::Var(v) => (0, v.0, 0, 0),
        Kind::GenericVar(v) => (1, v.0, 0, 0),
        Kind::Const(c) => {
            let usage = match c.usage {
                Usage::Un => 0,
                Usage::Aff => 1,
                Usage::Lin => 2,
            };
            let region = match c.region {
                Region::Global => 0,
                Region::Scope(depth) => 1 + u64::from(depth),
                Region::Never => u64::MAX,
            };
            (2, 0, usage, region)
        }
    }
}

// ---------------------------------------------------------------------------
// Lattice laws
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn leq_is_reflexive(a in arb_const()) {
        prop_assert!(a.leq(a));
    }

    #[test]
    fn leq_is_antisymmetric(a in arb_const(), b in arb_const()) {
        if a.leq(b) && b.leq(a) {
            prop_assert_eq!(a, b);
        }
    }

    #[test]
    fn leq_is_transitive(a in arb_const(), b in arb_const(), c in arb_const()) {
        if a.leq(b) && b.leq(c) {
            prop_assert!(a.leq(c));
        }
    }

    #[test]
    fn lub_is_the_least_upper_bound(a in arb_const(), b in arb_const(), c in arb_const()) {
        let join = a.lub(b);
        prop_assert!(a.leq(join) && b.leq(join));
        prop_assert_eq!(a.lub(b), b.lub(a));
        if a.leq(c) && b.leq(c) {
            prop_assert!(join.leq(c));
        }
    }

    #[test]
    fn glb_is_the_greatest_lower_bound(a in arb_const(), b in arb_const(), c in arb_const()) {
        let meet = a.glb(b);
        prop_assert!(meet.leq(a) && meet.leq(b));
        prop_assert_eq!(a.glb(b), b.glb(a));
        if c.leq(a) && c.leq(b) {
            prop_assert!(c.leq(meet));
        }
    }

    #[test]
    fn extremes_bound_everything(a in arb_const()) {
        prop_assert!(KindConst::BOTTOM.leq(a));
        prop_assert!(a.leq(KindConst::TOP));
    }
}

// ---------------------------------------------------------------------------
// Multiplicity algebra
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn seq_merge_is_commutative_up_to_permutation(
        a in arb_multiplicity(),
        b in arb_multiplicity(),
    ) {
        let mut out = ConstraintSet::new();
        let left = a.clone().seq_merge(b.clone(), &prov(), &mut out);
        let right = b.seq_merge(a, &prov(), &mut out);
        match (left, right) {
            (Ok(l), Ok(r)) => prop_assert_eq!(canonical(&l), canonical(&r)),
            (Err(_), Err(_)) => {}
            (l, r) => prop_assert!(false, "asymmetric outcome: {l:?} versus {r:?}"),
        }
    }

    #[test]
    fn seq_merge_is_associative_up_to_permutation(
        a in arb_multiplicity(),
        b in arb_multiplicity(),
        c in arb_multiplicity(),
    ) {
        let mut out = ConstraintSet::new();
        let left = a
            .clone()
            .seq_merge(b.clone(), &prov(), &mut out)
            .and_then(|ab| ab.seq_merge(c.clone(), &prov(), &mut out));
        let right = b
            .seq_merge(c, &prov(), &mut out)
            .and_then(|bc| a.seq_merge(bc, &prov(), &mut out));
        match (left, right) {
            (Ok(l), Ok(r)) => prop_assert_eq!(canonical(&l), canonical(&r)),
            (Err(_), Err(_)) => {}
            (l, r) => prop_assert!(false, "non-associative outcome: {l:?} versus {r:?}"),
        }
    }

    #[test]
    fn par_merge_is_idempotent_on_identical_arms(a in arb_multiplicity()) {
        let merged = a.clone().par_merge(a.clone()).expect("identical arms merge");
        prop_assert_eq!(canonical(&merged), canonical(&a));
    }

    #[test]
    fn par_merge_outcome_is_direction_independent(
        a in arb_multiplicity(),
        b in arb_multiplicity(),
    ) {
        let left = a.clone().par_merge(b.clone());
        let right = b.par_merge(a);
        match (left, right) {
            (Ok(l), Ok(r)) => {
                // The surviving flavours and list lengths agree; which
                // equal-length owned list is kept is a tie-break.
                let l = canonical(&l);
                let r = canonical(&r);
                prop_assert_eq!(l.len(), r.len());
                for (le, re) in l.iter().zip(&r) {
                    prop_assert_eq!(le.0, re.0);
                    prop_assert_eq!(le.1, re.1);
                    prop_assert_eq!(le.2.len(), re.2.len());
                }
            }
            (Err(_), Err(_)) => {}
            (l, r) => prop_assert!(false, "asymmetric outcome: {l:?} versus {r:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Occurs check and resolution
// ---------------------------------------------------------------------------

/// Recipes for embedding a variable inside a compound type.
#[derive(Debug, Clone)]
enum Embed {
    InTuple,
    InArrowParam,
    InArrowResult,
    InBorrow,
}

fn arb_embedding() -> impl Strategy<Value = Vec<Embed>> {
    prop::collection::vec(
        prop::sample::select(
            &[
                Embed::InTuple,
                Embed::InArrowParam,
                Embed::InArrowResult,
                Embed::InBorrow,
            ][..],
        ),
        1..4,
    )
}

proptest! {
    #[test]
    fn every_self_embedding_is_rejected(layers in arb_embedding()) {
        let mut supply = NameSupply::new();
        let env = builtins::initial_env(&mut supply);
        let mut ctx = InferenceContext::with_var_offsets(0, 0);
        let var = ctx.fresh_type();

        let mut ty = var.clone();
        for layer in layers {
            ty = match layer {
                Embed::InTuple => Type::Tuple(vec![ty, env.prims().int_type()]),
                Embed::InArrowParam => Type::arrow(ty, ctx.fresh_kind(), env.prims().int_type()),
                Embed::InArrowResult => Type::arrow(env.prims().int_type(), ctx.fresh_kind(), ty),
                Embed::InBorrow => Type::borrow(Access::Read, ctx.fresh_kind(), ty),
            };
        }

        ctx.require_equal(&var, &ty, prov());
        let err = ctx.normalize(&env).expect_err("self-embedding must fail");
        prop_assert!(matches!(err, crate::InferError::RecursiveType));
    }

    #[test]
    fn resolution_is_idempotent(chain in prop::collection::vec(0usize..4, 1..6)) {
        let mut supply = NameSupply::new();
        let env = builtins::initial_env(&mut supply);
        let mut ctx = InferenceContext::with_var_offsets(0, 0);

        let vars: Vec<Type> = (0..4).map(|_| ctx.fresh_type()).collect();
        for (index, target) in chain.iter().enumerate() {
            let source = &vars[index % vars.len()];
            if source != &vars[*target] {
                // Unifying two variables can never fail.
                ctx.require_equal(source, &vars[*target], prov());
            }
        }
        ctx.normalize(&env).expect("variable chains unify");

        for var in &vars {
            let once = ctx.unifier.resolve(var);
            let twice = ctx.unifier.resolve(&once);
            prop_assert_eq!(once, twice);
        }
    }
}

// ---------------------------------------------------------------------------
// Solver canonical form
// ---------------------------------------------------------------------------

fn bound_pairs(constraints: &[Constraint]) -> Vec<((u8, u32, u8, u64), (u8, u32, u8, u64))> {
    let mut out: Vec<_> = constraints
        .iter()
        .filter_map(|c| match c {
            Constraint::KindLeq { lhs, rhs, .. } => Some((kind_key(lhs), kind_key(rhs))),
            Constraint::TypeEqual { .. } => None,
        })
        .collect();
    out.sort_unstable();
    out
}

proptest! {
    #[test]
    fn solving_is_a_fixed_point(
        picks in prop::collection::vec((0usize..6, 0usize..6), 0..8),
        consts in prop::collection::vec(arb_const(), 2),
    ) {
        let mut ctx = InferenceContext::with_var_offsets(0, 0);
        let mut kinds: Vec<Kind> = (0..4).map(|_| ctx.fresh_kind()).collect();
        kinds.push(Kind::Const(consts[0]));
        kinds.push(Kind::Const(consts[1]));

        let constraints: Vec<Constraint> = picks
            .iter()
            .map(|(l, r)| Constraint::KindLeq {
                lhs: kinds[*l].clone(),
                rhs: kinds[*r].clone(),
                provenance: prov(),
            })
            .collect();

        let Ok(first) = solve::solve(&mut ctx.unifier, constraints, None) else {
            // Unsatisfiable inputs are fine; the property is about the
            // canonical form of satisfiable ones.
            return Ok(());
        };
        let second = solve::solve(&mut ctx.unifier, first.clone(), None)
            .expect("canonical residue stays satisfiable");
        prop_assert_eq!(bound_pairs(&first), bound_pairs(&second));
    }
}
