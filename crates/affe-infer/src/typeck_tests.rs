//! Tests for expression-level inference and let-generalisation.
//!
//! Each test constructs an AST by hand and checks the inferred scheme
//! structurally. This is verbose but precise — we know exactly what we
//! are testing, and no parser sits between the test and the checker.

use std::collections::BTreeMap;

use affe_ast::{
    Access, Arm, Expr, ExprKind, Lit, Name, NameSupply, Pattern, PatternKind, RecFlag, Span,
    Spanned,
};
use affe_types::{
    Kind, KindConst, KindVarId, Region, Type, TypeScheme, TypeVarId, Usage, Variance,
};

use crate::typeck::{Env, TypeDecl, generalize, infer_top, instantiate, make_type_decl, make_type_scheme};
use crate::{InferError, InferenceContext, builtins};

// ---------------------------------------------------------------------------
// Helpers for constructing AST nodes
// ---------------------------------------------------------------------------

fn sp(node: ExprKind) -> Expr {
    Spanned::new(node, Span::synthetic())
}

fn pat(node: PatternKind) -> Pattern {
    Spanned::new(node, Span::synthetic())
}

fn lit_int(n: i64) -> Expr {
    sp(ExprKind::Lit(Lit::Int(n)))
}

fn var(name: &Name) -> Expr {
    sp(ExprKind::Var(name.clone()))
}

fn pvar(name: &Name) -> Pattern {
    pat(PatternKind::Var(name.clone()))
}

fn lam(param: &Name, body: Expr) -> Expr {
    sp(ExprKind::Lambda(pvar(param), Box::new(body)))
}

fn app(func: Expr, args: Vec<Expr>) -> Expr {
    sp(ExprKind::App(Box::new(func), args))
}

fn let_in(name: &Name, value: Expr, body: Expr) -> Expr {
    sp(ExprKind::Let {
        rec: RecFlag::NonRec,
        pattern: pvar(name),
        value: Box::new(value),
        body: Box::new(body),
    })
}

fn borrow(access: Access, name: &Name) -> Expr {
    sp(ExprKind::Borrow(access, name.clone()))
}

fn region(names: Vec<Name>, body: Expr) -> Expr {
    sp(ExprKind::Region {
        names,
        body: Box::new(body),
    })
}

fn un_never() -> Kind {
    Kind::Const(KindConst::new(Usage::Un, Region::Never))
}

fn setup() -> (NameSupply, Env, InferenceContext) {
    let mut supply = NameSupply::new();
    let env = builtins::initial_env(&mut supply);
    let ctx = InferenceContext::with_var_offsets(0, 0);
    (supply, env, ctx)
}

fn infer(
    ctx: &mut InferenceContext,
    env: &Env,
    supply: &mut NameSupply,
    decl_name: &str,
    expr: Expr,
) -> Result<TypeScheme, InferError> {
    let name = supply.fresh(decl_name);
    infer_top(ctx, env, RecFlag::NonRec, &name, &expr).map(|(_, _, scheme)| scheme)
}

// ---------------------------------------------------------------------------
// Alpha-equivalence of schemes (for idempotence checks)
// ---------------------------------------------------------------------------

fn alpha_eq(left: &TypeScheme, right: &TypeScheme) -> bool {
    let mut tys = BTreeMap::new();
    let mut kinds = BTreeMap::new();
    left.kind_vars.len() == right.kind_vars.len()
        && left.type_vars.len() == right.type_vars.len()
        && left.constraint.len() == right.constraint.len()
        && alpha_eq_type(&left.ty, &right.ty, &mut tys, &mut kinds)
}

fn alpha_eq_type(
    left: &Type,
    right: &Type,
    tys: &mut BTreeMap<TypeVarId, TypeVarId>,
    kinds: &mut BTreeMap<KindVarId, KindVarId>,
) -> bool {
    match (left, right) {
        (Type::GenericVar(a), Type::GenericVar(b)) => *tys.entry(*a).or_insert(*b) == *b,
        (Type::Var(a), Type::Var(b)) => a == b,
        (Type::App(n1, args1), Type::App(n2, args2)) => {
            n1 == n2
                && args1.len() == args2.len()
                && args1
                    .iter()
                    .zip(args2)
                    .all(|(a, b)| alpha_eq_type(a, b, tys, kinds))
        }
        (Type::Tuple(items1), Type::Tuple(items2)) => {
            items1.len() == items2.len()
                && items1
                    .iter()
                    .zip(items2)
                    .all(|(a, b)| alpha_eq_type(a, b, tys, kinds))
        }
        (Type::Arrow(p1, k1, r1), Type::Arrow(p2, k2, r2)) => {
            alpha_eq_kind(k1, k2, kinds)
                && alpha_eq_type(p1, p2, tys, kinds)
                && alpha_eq_type(r1, r2, tys, kinds)
        }
        (Type::Borrow(a1, k1, t1), Type::Borrow(a2, k2, t2)) => {
            a1 == a2 && alpha_eq_kind(k1, k2, kinds) && alpha_eq_type(t1, t2, tys, kinds)
        }
        _ => false,
    }
}

fn alpha_eq_kind(left: &Kind, right: &Kind, kinds: &mut BTreeMap<KindVarId, KindVarId>) -> bool {
    match (left, right) {
        (Kind::GenericVar(a), Kind::GenericVar(b)) => *kinds.entry(*a).or_insert(*b) == *b,
        (a, b) => a == b,
    }
}

// ---------------------------------------------------------------------------
// Generalisation of the classics
// ---------------------------------------------------------------------------

#[test]
fn identity_generalises_with_quantified_kinds() {
    let (mut supply, env, mut ctx) = setup();
    let x = supply.fresh("x");
    let scheme = infer(&mut ctx, &env, &mut supply, "id", lam(&x, var(&x))).expect("id infers");

    assert_eq!(scheme.type_vars.len(), 1);
    assert_eq!(scheme.kind_vars.len(), 2);
    assert!(scheme.constraint.is_empty());
    match &scheme.ty {
        Type::Arrow(param, Kind::GenericVar(_), result) => {
            assert!(matches!(param.as_ref(), Type::GenericVar(_)));
            assert_eq!(param, result);
        }
        other => panic!("unexpected scheme body: {other}"),
    }
}

#[test]
fn twice_forces_an_unrestricted_function_argument() {
    let (mut supply, env, mut ctx) = setup();
    let f = supply.fresh("f");
    let x = supply.fresh("x");
    // twice = fun f -> fun x -> f (f x)
    let expr = lam(&f, lam(&x, app(var(&f), vec![app(var(&f), vec![var(&x)])])));
    let scheme = infer(&mut ctx, &env, &mut supply, "twice", expr).expect("twice infers");

    assert_eq!(scheme.type_vars.len(), 1);
    let (Type::Arrow(param, _, result), [bound]) = (&scheme.ty, &scheme.constraint[..]) else {
        panic!("unexpected scheme: {scheme}");
    };
    let Type::Arrow(_, param_kind, _) = param.as_ref() else {
        panic!("parameter is not a function: {param}");
    };
    let Type::Arrow(_, result_kind, _) = result.as_ref() else {
        panic!("result is not a function: {result}");
    };
    // The doubly-used argument arrow keeps one kind on both sides, and
    // that kind is constrained to be unrestricted.
    assert_eq!(param_kind, result_kind);
    assert_eq!(&bound.lhs, param_kind);
    assert_eq!(bound.rhs, un_never());
}

#[test]
fn swap_permutes_tuple_components() {
    let (mut supply, env, mut ctx) = setup();
    let p = supply.fresh("p");
    let a = supply.fresh("a");
    let b = supply.fresh("b");
    // swap = fun p -> match p with (a, b) -> (b, a)
    let expr = sp(ExprKind::Lambda(
        pvar(&p),
        Box::new(sp(ExprKind::Match {
            borrow: None,
            scrutinee: Box::new(var(&p)),
            arms: vec![Arm {
                pattern: pat(PatternKind::Tuple(vec![pvar(&a), pvar(&b)])),
                body: sp(ExprKind::Tuple(vec![var(&b), var(&a)])),
            }],
        })),
    ));
    let scheme = infer(&mut ctx, &env, &mut supply, "swap", expr).expect("swap infers");

    assert_eq!(scheme.type_vars.len(), 2);
    // Components keep arbitrary kinds: no unrestricted bound appears.
    assert!(
        scheme
            .constraint
            .iter()
            .all(|bound| bound.rhs != un_never()),
        "swap must not restrict its components: {scheme}"
    );
    let Type::Arrow(param, _, result) = &scheme.ty else {
        panic!("unexpected scheme body: {scheme}");
    };
    let (Type::Tuple(ins), Type::Tuple(outs)) = (param.as_ref(), result.as_ref()) else {
        panic!("swap is not tuple-to-tuple: {scheme}");
    };
    assert_eq!(ins[0], outs[1]);
    assert_eq!(ins[1], outs[0]);
}

#[test]
fn duplicating_a_parameter_requires_unrestricted_kind() {
    let (mut supply, env, mut ctx) = setup();
    let x = supply.fresh("x");
    // share = fun x -> (x, x)
    let expr = lam(&x, sp(ExprKind::Tuple(vec![var(&x), var(&x)])));
    let scheme = infer(&mut ctx, &env, &mut supply, "share", expr).expect("share infers");

    assert_eq!(scheme.type_vars.len(), 1);
    assert_eq!(scheme.constraint.len(), 1);
    // The constraint is on the parameter's kind.
    assert_eq!(scheme.constraint[0].lhs, scheme.type_vars[0].1);
    assert_eq!(scheme.constraint[0].rhs, un_never());
}

#[test]
fn borrowing_the_parameter_returns_a_read_borrow() {
    let (mut supply, env, mut ctx) = setup();
    let x = supply.fresh("x");
    // r = fun x -> &x
    let expr = lam(&x, borrow(Access::Read, &x));
    let scheme = infer(&mut ctx, &env, &mut supply, "r", expr).expect("r infers");

    assert!(scheme.constraint.is_empty());
    let Type::Arrow(param, _, result) = &scheme.ty else {
        panic!("unexpected scheme body: {scheme}");
    };
    let Type::Borrow(Access::Read, _, inner) = result.as_ref() else {
        panic!("result is not a read borrow: {scheme}");
    };
    assert_eq!(param, inner);
}

// ---------------------------------------------------------------------------
// Multiplicity violations
// ---------------------------------------------------------------------------

#[test]
fn read_then_write_borrow_is_a_use_mismatch() {
    let (mut supply, env, mut ctx) = setup();
    let x = supply.fresh("x");
    let y = supply.fresh("y");
    // bad_borrow = fun x -> let y = &x in &!x
    let expr = lam(
        &x,
        let_in(&y, borrow(Access::Read, &x), borrow(Access::Write, &x)),
    );
    let err = infer(&mut ctx, &env, &mut supply, "bad_borrow", expr).unwrap_err();
    assert!(matches!(err, InferError::UseMismatch { .. }), "got {err}");
}

#[test]
fn borrowing_and_consuming_side_by_side_is_a_use_mismatch() {
    let (mut supply, env, mut ctx) = setup();
    let x = supply.fresh("x");
    // fun x -> (&x, x)
    let expr = lam(
        &x,
        sp(ExprKind::Tuple(vec![borrow(Access::Read, &x), var(&x)])),
    );
    let err = infer(&mut ctx, &env, &mut supply, "clash", expr).unwrap_err();
    assert!(matches!(err, InferError::UseMismatch { .. }), "got {err}");
}

#[test]
fn match_arms_are_alternatives_not_reuses() {
    let (mut supply, env, mut ctx) = setup();
    let b = supply.fresh("b");
    let x = supply.fresh("x");
    // fun b -> fun x -> match b with _ -> x | _ -> x
    let expr = lam(
        &b,
        lam(
            &x,
            sp(ExprKind::Match {
                borrow: None,
                scrutinee: Box::new(var(&b)),
                arms: vec![
                    Arm {
                        pattern: pat(PatternKind::Wildcard),
                        body: var(&x),
                    },
                    Arm {
                        pattern: pat(PatternKind::Wildcard),
                        body: var(&x),
                    },
                ],
            }),
        ),
    );
    let scheme = infer(&mut ctx, &env, &mut supply, "pick", expr).expect("pick infers");

    // x is consumed once whichever arm fires, so its kind stays free.
    let x_kind = &scheme.type_vars[1].1;
    assert!(
        scheme.constraint.iter().all(|bound| &bound.lhs != x_kind),
        "x must not be restricted: {scheme}"
    );
}

// ---------------------------------------------------------------------------
// Value restriction
// ---------------------------------------------------------------------------

#[test]
fn applications_stay_monomorphic_lambdas_generalise() {
    let (mut supply, env, mut ctx) = setup();
    let make = env.lookup_name("array_make").expect("array_make exists");

    let expansive = app(var(&make), vec![lit_int(1), lit_int(2)]);
    let scheme = infer(&mut ctx, &env, &mut supply, "arr", expansive).expect("array infers");
    assert!(scheme.is_mono(), "mutable container must stay mono: {scheme}");

    let z = supply.fresh("z");
    let scheme = infer(&mut ctx, &env, &mut supply, "gen", lam(&z, var(&z)))
        .expect("lambda infers");
    assert!(!scheme.is_mono(), "lambda must generalise: {scheme}");
}

#[test]
fn empty_arrays_generalise_but_filled_ones_do_not() {
    let (mut supply, env, mut ctx) = setup();
    let empty = sp(ExprKind::Array(vec![]));
    let scheme = infer(&mut ctx, &env, &mut supply, "empty", empty).expect("empty infers");
    assert!(!scheme.is_mono());

    let filled = sp(ExprKind::Array(vec![lit_int(1)]));
    let scheme = infer(&mut ctx, &env, &mut supply, "filled", filled).expect("filled infers");
    assert!(scheme.is_mono());
}

// ---------------------------------------------------------------------------
// Occurs check
// ---------------------------------------------------------------------------

#[test]
fn self_application_is_a_recursive_type() {
    let (mut supply, env, mut ctx) = setup();
    let x = supply.fresh("x");
    // fun x -> x x
    let expr = lam(&x, app(var(&x), vec![var(&x)]));
    let err = infer(&mut ctx, &env, &mut supply, "omega", expr).unwrap_err();
    assert!(matches!(err, InferError::RecursiveType), "got {err}");
}

// ---------------------------------------------------------------------------
// Regions and borrows
// ---------------------------------------------------------------------------

#[test]
fn a_borrow_cannot_escape_its_region() {
    let (mut supply, env, mut ctx) = setup();
    let x = supply.fresh("x");
    // fun x -> region[x] { &x }
    let expr = lam(&x, region(vec![x.clone()], borrow(Access::Read, &x)));
    let err = infer(&mut ctx, &env, &mut supply, "esc", expr).unwrap_err();
    assert!(matches!(err, InferError::KindInfeasible { .. }), "got {err}");
}

#[test]
fn borrows_work_inside_their_region() {
    let (mut supply, env, mut ctx) = setup();
    let get = env.lookup_name("array_get").expect("array_get exists");
    let x = supply.fresh("x");
    let v = supply.fresh("v");
    // fun x -> let v = region[x] { array_get (&x) 0 } in v
    let expr = lam(
        &x,
        let_in(
            &v,
            region(
                vec![x.clone()],
                app(var(&get), vec![borrow(Access::Read, &x), lit_int(0)]),
            ),
            var(&v),
        ),
    );
    let scheme = infer(&mut ctx, &env, &mut supply, "read_first", expr).expect("region reads");

    let Type::Arrow(param, _, _) = &scheme.ty else {
        panic!("unexpected scheme body: {scheme}");
    };
    assert!(
        matches!(param.as_ref(), Type::App(name, _) if name.text == "array"),
        "parameter should be an array: {scheme}"
    );
}

#[test]
fn the_owner_is_usable_after_its_region() {
    let (mut supply, env, mut ctx) = setup();
    let get = env.lookup_name("array_get").expect("array_get exists");
    let free = env.lookup_name("array_free").expect("array_free exists");
    let x = supply.fresh("x");
    let v = supply.fresh("v");
    let w = supply.fresh("w");
    // fun x -> let v = region[x] { array_get (&x) 0 } in let w = array_free x in v
    let expr = lam(
        &x,
        let_in(
            &v,
            region(
                vec![x.clone()],
                app(var(&get), vec![borrow(Access::Read, &x), lit_int(0)]),
            ),
            let_in(&w, app(var(&free), vec![var(&x)]), var(&v)),
        ),
    );
    infer(&mut ctx, &env, &mut supply, "consume_after", expr)
        .expect("the owner is released when its region closes");
}

// ---------------------------------------------------------------------------
// Recursive bindings
// ---------------------------------------------------------------------------

#[test]
fn let_rec_rejects_non_variable_patterns() {
    let (mut supply, env, mut ctx) = setup();
    let x = supply.fresh("x");
    let expr = sp(ExprKind::Let {
        rec: RecFlag::Rec,
        pattern: pat(PatternKind::Tuple(vec![pvar(&x)])),
        value: Box::new(lit_int(0)),
        body: Box::new(lit_int(0)),
    });
    let err = infer(&mut ctx, &env, &mut supply, "bad_rec", expr).unwrap_err();
    assert!(matches!(err, InferError::IllegalRecPattern { .. }), "got {err}");
}

#[test]
fn recursive_functions_infer_and_stay_shared() {
    let (mut supply, env, mut ctx) = setup();
    let name = supply.fresh("diverge");
    let n = supply.fresh("n");
    // let rec diverge = fun n -> diverge n
    let expr = lam(&n, app(var(&name), vec![var(&n)]));
    let (residue, env2, scheme) =
        infer_top(&mut ctx, &env, RecFlag::Rec, &name, &expr).expect("rec infers");

    assert!(residue.is_empty(), "unexpected residue: {residue:?}");
    assert!(!scheme.is_mono());
    assert!(matches!(scheme.ty, Type::Arrow(..)));
    // The self-referential arrow must be shareable.
    assert!(
        scheme.constraint.iter().any(|bound| bound.rhs == un_never()),
        "recursion requires an unrestricted closure: {scheme}"
    );
    assert!(env2.find_value(&name).is_ok());
}

// ---------------------------------------------------------------------------
// Type declarations and annotations
// ---------------------------------------------------------------------------

#[test]
fn box_declaration_reflects_its_payload_kind() {
    let (mut supply, env, mut ctx) = setup();
    let box_name = supply.fresh("box");
    let box_ctor = supply.fresh("Box");
    let param = ctx.unifier.fresh_type_var();
    let param_kind = ctx.unifier.kind_of_var(param);

    let decl = TypeDecl {
        name: box_name.clone(),
        params: vec![param],
        result: param_kind,
        variance: vec![Variance::Pos],
        constructors: vec![(box_ctor.clone(), vec![Type::Var(param)])],
    };
    let (env, kind_scheme) = make_type_decl(&mut ctx, &env, &decl).expect("box declares");

    assert_eq!(kind_scheme.arity(), 1);
    assert_eq!(kind_scheme.kind_vars.len(), 1);
    // box of a k-kinded payload is itself k-kinded.
    assert_eq!(kind_scheme.params[0], kind_scheme.result);

    // Wrap and unwrap through the constructor.
    let y = supply.fresh("y");
    let unwrap = sp(ExprKind::Match {
        borrow: None,
        scrutinee: Box::new(sp(ExprKind::Construct(box_ctor.clone(), vec![lit_int(5)]))),
        arms: vec![Arm {
            pattern: pat(PatternKind::Constructor(box_ctor.clone(), vec![pvar(&y)])),
            body: var(&y),
        }],
    });
    let scheme = infer(&mut ctx, &env, &mut supply, "unwrapped", unwrap).expect("unwrap infers");
    assert_eq!(scheme.ty, env.prims().int_type());
}

#[test]
fn constructor_pattern_arity_is_checked() {
    let (mut supply, env, mut ctx) = setup();
    let box_name = supply.fresh("box");
    let box_ctor = supply.fresh("Box");
    let param = ctx.unifier.fresh_type_var();
    let param_kind = ctx.unifier.kind_of_var(param);
    let decl = TypeDecl {
        name: box_name,
        params: vec![param],
        result: param_kind,
        variance: vec![Variance::Pos],
        constructors: vec![(box_ctor.clone(), vec![Type::Var(param)])],
    };
    let (env, _) = make_type_decl(&mut ctx, &env, &decl).expect("box declares");

    let y = supply.fresh("y");
    let z = supply.fresh("z");
    let expr = sp(ExprKind::Match {
        borrow: None,
        scrutinee: Box::new(sp(ExprKind::Construct(box_ctor.clone(), vec![lit_int(1)]))),
        arms: vec![Arm {
            pattern: pat(PatternKind::Constructor(
                box_ctor.clone(),
                vec![pvar(&y), pvar(&z)],
            )),
            body: var(&y),
        }],
    });
    let err = infer(&mut ctx, &env, &mut supply, "overfull", expr).unwrap_err();
    assert!(matches!(
        err,
        InferError::ArityMismatch {
            expected: 1,
            actual: 2
        }
    ));
}

#[test]
fn annotations_close_into_schemes() {
    let (mut supply, env, mut ctx) = setup();
    let name = supply.fresh("annotated_id");
    let v = ctx.fresh_type();
    let k = ctx.fresh_kind();
    let ty = Type::arrow(v.clone(), k, v);
    let (env2, scheme) =
        make_type_scheme(&mut ctx, &env, &name, &ty).expect("annotation closes");

    assert_eq!(scheme.type_vars.len(), 1);
    assert!(matches!(&scheme.ty, Type::Arrow(p, _, r) if p == r));
    assert!(env2.find_value(&name).is_ok());
}

#[test]
fn unknown_names_and_types_are_reported() {
    let (mut supply, env, mut ctx) = setup();
    let ghost = supply.fresh("ghost");
    let err = infer(&mut ctx, &env, &mut supply, "lookup", var(&ghost)).unwrap_err();
    assert!(matches!(err, InferError::UnknownName { .. }));

    let ghost_ty = supply.fresh("phantom");
    let name = supply.fresh("x");
    let annotated = Type::App(ghost_ty, vec![]);
    let err = make_type_scheme(&mut ctx, &env, &name, &annotated).unwrap_err();
    assert!(matches!(err, InferError::UnknownType { .. }));
}

// ---------------------------------------------------------------------------
// Scheme stability
// ---------------------------------------------------------------------------

#[test]
fn reinferring_an_instantiation_reproduces_the_scheme() {
    let (mut supply, env, mut ctx) = setup();
    let x = supply.fresh("x");
    let first = infer(&mut ctx, &env, &mut supply, "id", lam(&x, var(&x))).expect("id infers");

    // Instantiate the scheme one level in and regeneralise; the result
    // must be the same scheme up to renaming.
    ctx.unifier.enter_level();
    let instance = instantiate(&mut ctx, &first, Span::synthetic());
    ctx.unifier.leave_level();
    ctx.normalize(&env).expect("instantiated constraints are satisfiable");
    let second = generalize(&mut ctx, &env, 1, &instance).expect("regeneralises");

    assert!(alpha_eq(&first, &second), "{first} versus {second}");
}

#[test]
fn instantiated_scheme_constraints_are_satisfiable() {
    let (mut supply, env, mut ctx) = setup();
    let f = supply.fresh("f");
    let x = supply.fresh("x");
    let expr = lam(&f, lam(&x, app(var(&f), vec![app(var(&f), vec![var(&x)])])));
    let scheme = infer(&mut ctx, &env, &mut supply, "twice", expr).expect("twice infers");

    for _ in 0..3 {
        ctx.unifier.enter_level();
        let _ = instantiate(&mut ctx, &scheme, Span::synthetic());
        ctx.unifier.leave_level();
        ctx.normalize(&env)
            .expect("every instantiation of a produced scheme solves");
    }
}
