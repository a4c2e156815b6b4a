//! Expression-level inference with value-restricted let-generalisation.
//!
//! This module walks AST expressions and infers their types, threading a
//! multiplicity map alongside. Key features:
//!
//! - Let-generalisation: non-expansive `let` right-hand sides get schemes
//! - Instantiation: each use of a scheme gets fresh variables, with the
//!   scheme's kind constraints re-emitted
//! - Multiplicity: every rule reports how it consumed each variable, and
//!   binder/region exits discharge the corresponding obligations
//!
//! Every rule ends by normalising the pending constraints, so errors
//! surface at the earliest possible point.

use std::collections::{BTreeMap, BTreeSet};

use affe_ast::{
    Access, Expr, ExprKind, Lit, Name, Pattern, PatternKind, RecFlag, Span, is_nonexpansive,
};
use affe_types::{
    Kind, KindBound, KindConst, KindScheme, KindVarId, Region, Type, TypeScheme, TypeVarId, Usage,
    Variance, free_kind_vars, free_type_vars,
};

use crate::builtins::Prims;
use crate::multiplicity::{Multiplicity, Use};
use crate::{Constraint, InferError, InferenceContext, Provenance, Reason, solve};

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// The typing environment: value schemes, type-constructor kind schemes,
/// and data-constructor schemes, plus the primitive names they build on.
#[derive(Debug, Clone)]
pub struct Env {
    prims: Prims,
    values: BTreeMap<Name, TypeScheme>,
    types: BTreeMap<Name, KindScheme>,
    constructors: BTreeMap<Name, TypeScheme>,
}

impl Env {
    pub fn new(prims: Prims) -> Self {
        Self {
            prims,
            values: BTreeMap::new(),
            types: BTreeMap::new(),
            constructors: BTreeMap::new(),
        }
    }

    pub fn prims(&self) -> &Prims {
        &self.prims
    }

    pub fn add_value(&mut self, name: Name, scheme: TypeScheme) {
        self.values.insert(name, scheme);
    }

    pub fn remove_value(&mut self, name: &Name) {
        self.values.remove(name);
    }

    pub fn find_value(&self, name: &Name) -> Result<&TypeScheme, InferError> {
        self.values.get(name).ok_or(InferError::UnknownName {
            name: name.clone(),
        })
    }

    pub fn add_type(&mut self, name: Name, scheme: KindScheme) {
        self.types.insert(name, scheme);
    }

    pub fn find_type(&self, name: &Name) -> Result<&KindScheme, InferError> {
        self.types.get(name).ok_or(InferError::UnknownType {
            name: name.clone(),
        })
    }

    pub fn add_constructor(&mut self, name: Name, scheme: TypeScheme) {
        self.constructors.insert(name, scheme);
    }

    pub fn find_constructor(&self, name: &Name) -> Result<&TypeScheme, InferError> {
        self.constructors.get(name).ok_or(InferError::UnknownName {
            name: name.clone(),
        })
    }

    /// Every value scheme currently in scope.
    pub fn value_schemes(&self) -> impl Iterator<Item = &TypeScheme> {
        self.values.values()
    }

    /// Look a binding up by its printable label. Intended for harness
    /// and test code reaching for builtins; checked code resolves names
    /// by tag.
    pub fn lookup_name(&self, text: &str) -> Option<Name> {
        self.values
            .keys()
            .chain(self.types.keys())
            .chain(self.constructors.keys())
            .find(|name| name.text == text)
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// Binders
// ---------------------------------------------------------------------------

/// A pattern binding together with the kind its exit obligations are
/// phrased in.
#[derive(Debug, Clone)]
pub(crate) struct Binder {
    name: Name,
    scheme: TypeScheme,
    kind: Kind,
}

/// Run `f` with the binders in scope, removing them again on both the
/// success and the failure path.
fn with_bindings<T>(
    env: &mut Env,
    binders: &[Binder],
    f: impl FnOnce(&mut Env) -> Result<T, InferError>,
) -> Result<T, InferError> {
    for binder in binders {
        env.add_value(binder.name.clone(), binder.scheme.clone());
    }
    let result = f(env);
    for binder in binders {
        env.remove_value(&binder.name);
    }
    result
}

fn at(span: Span, reason: Reason) -> Provenance {
    Provenance::new(span, reason)
}

fn un_never() -> Kind {
    Kind::Const(KindConst::new(Usage::Un, Region::Never))
}

// ---------------------------------------------------------------------------
// Instantiation
// ---------------------------------------------------------------------------

/// Instantiate a type scheme: every quantified kind and type variable is
/// replaced by a fresh one (via call-local mapping tables) and the
/// scheme's constraint is re-emitted over the fresh kinds.
pub fn instantiate(ctx: &mut InferenceContext, scheme: &TypeScheme, span: Span) -> Type {
    if scheme.is_mono() && scheme.constraint.is_empty() {
        return scheme.ty.clone();
    }

    let mut kind_mapping = BTreeMap::new();
    for kv in &scheme.kind_vars {
        kind_mapping.insert(*kv, ctx.fresh_kind());
    }
    let mut type_mapping = BTreeMap::new();
    for (tv, kind) in &scheme.type_vars {
        let kind = inst_kind(kind, &kind_mapping);
        type_mapping.insert(*tv, ctx.unifier.fresh_type_var_with_kind(kind));
    }
    for bound in &scheme.constraint {
        ctx.require_leq(
            inst_kind(&bound.lhs, &kind_mapping),
            inst_kind(&bound.rhs, &kind_mapping),
            at(span, Reason::Instantiation),
        );
    }
    inst_type(&scheme.ty, &type_mapping, &kind_mapping)
}

fn inst_kind(kind: &Kind, kind_mapping: &BTreeMap<KindVarId, Kind>) -> Kind {
    match kind {
        Kind::GenericVar(v) => kind_mapping
            .get(v)
            .expect("scheme quantifies every generic kind variable it mentions")
            .clone(),
        other => other.clone(),
    }
}

fn inst_type(
    ty: &Type,
    type_mapping: &BTreeMap<TypeVarId, TypeVarId>,
    kind_mapping: &BTreeMap<KindVarId, Kind>,
) -> Type {
    match ty {
        Type::GenericVar(tv) => Type::Var(
            *type_mapping
                .get(tv)
                .expect("scheme quantifies every generic type variable it mentions"),
        ),
        Type::Var(tv) => Type::Var(*tv),
        Type::App(name, args) => Type::App(
            name.clone(),
            args.iter()
                .map(|a| inst_type(a, type_mapping, kind_mapping))
                .collect(),
        ),
        Type::Tuple(items) => Type::Tuple(
            items
                .iter()
                .map(|i| inst_type(i, type_mapping, kind_mapping))
                .collect(),
        ),
        Type::Arrow(param, kind, result) => Type::arrow(
            inst_type(param, type_mapping, kind_mapping),
            inst_kind(kind, kind_mapping),
            inst_type(result, type_mapping, kind_mapping),
        ),
        Type::Borrow(access, kind, inner) => Type::borrow(
            *access,
            inst_kind(kind, kind_mapping),
            inst_type(inner, type_mapping, kind_mapping),
        ),
    }
}

// ---------------------------------------------------------------------------
// Generalisation
// ---------------------------------------------------------------------------

/// Generalise a type at the given level floor: simplify the constraints
/// under the type's variances, quantify every variable at or above the
/// floor, freeze the quantified occurrences into generic form, and embed
/// the constraints whose variables are all quantified. The rest of the
/// constraints stay in the context as residue.
pub fn generalize(
    ctx: &mut InferenceContext,
    env: &Env,
    gen_floor: u32,
    ty: &Type,
) -> Result<TypeScheme, InferError> {
    let resolved = ctx.unifier.resolve(ty);
    let variance = solve::kind_polarities(&mut ctx.unifier, env, &resolved);

    let mut keep: BTreeSet<KindVarId> = free_kind_vars(&resolved);
    for tv in free_type_vars(&resolved) {
        if let Kind::Var(kv) = ctx.unifier.kind_of_var(tv) {
            keep.insert(kv);
        }
    }
    env_kind_vars(ctx, env, &mut keep);

    let options = solve::SimplifyOptions {
        keep,
        variance,
        gen_floor,
    };
    ctx.normalize_for_generalisation(env, &options)?;

    // Simplification may have linked variables; re-resolve before
    // collecting the quantifiers.
    let resolved = ctx.unifier.resolve(ty);

    let mut gen_tyvars = Vec::new();
    ordered_type_vars(&resolved, &mut gen_tyvars);
    gen_tyvars.retain(|tv| {
        ctx.unifier
            .type_var_unbound_level(*tv)
            .is_some_and(|level| level >= gen_floor)
    });

    let mut gen_kvars: Vec<KindVarId> = Vec::new();
    let mut tyvar_kinds: Vec<(TypeVarId, Kind)> = Vec::new();
    for tv in &gen_tyvars {
        let kind = ctx.unifier.kind_of_var(*tv);
        if let Kind::Var(kv) = kind
            && ctx
                .unifier
                .kind_var_level(kv)
                .is_some_and(|level| level >= gen_floor)
            && !gen_kvars.contains(&kv)
        {
            gen_kvars.push(kv);
        }
        tyvar_kinds.push((*tv, kind));
    }
    for kv in ordered_kind_vars(&resolved) {
        if ctx
            .unifier
            .kind_var_level(kv)
            .is_some_and(|level| level >= gen_floor)
            && !gen_kvars.contains(&kv)
        {
            gen_kvars.push(kv);
        }
    }

    let quantified: BTreeSet<KindVarId> = gen_kvars.iter().copied().collect();
    let constraint = partition_bounds(ctx, &quantified)?;

    let quantified_tys: BTreeSet<TypeVarId> = gen_tyvars.iter().copied().collect();
    let body = freeze_type(&resolved, &quantified_tys, &quantified)?;
    let type_vars = tyvar_kinds
        .into_iter()
        .map(|(tv, kind)| Ok((tv, freeze_kind(&kind, &quantified)?)))
        .collect::<Result<Vec<_>, InferError>>()?;

    Ok(TypeScheme {
        kind_vars: gen_kvars,
        type_vars,
        constraint,
        ty: body,
    })
}

/// Split the canonical residue: bounds all of whose variable endpoints
/// are quantified move into the scheme (in generic form); the rest stay
/// behind to be resolved, or refuted, later.
fn partition_bounds(
    ctx: &mut InferenceContext,
    quantified: &BTreeSet<KindVarId>,
) -> Result<Vec<KindBound>, InferError> {
    let canonical = ctx.take_normalized();
    let mut embedded = Vec::new();
    let mut residual = Vec::new();
    for constraint in canonical {
        let Constraint::KindLeq {
            lhs,
            rhs,
            provenance,
        } = constraint
        else {
            continue;
        };
        let lhs = ctx.unifier.resolve_kind(&lhs);
        let rhs = ctx.unifier.resolve_kind(&rhs);
        let mut vars = Vec::new();
        for kind in [&lhs, &rhs] {
            if let Kind::Var(v) = kind {
                vars.push(*v);
            }
        }
        if !vars.is_empty() && vars.iter().all(|v| quantified.contains(v)) {
            embedded.push(KindBound::new(
                freeze_kind(&lhs, quantified)?,
                freeze_kind(&rhs, quantified)?,
            ));
        } else {
            residual.push(Constraint::KindLeq {
                lhs,
                rhs,
                provenance,
            });
        }
    }
    ctx.restore_normalized(residual);
    Ok(embedded)
}

fn freeze_kind(kind: &Kind, quantified: &BTreeSet<KindVarId>) -> Result<Kind, InferError> {
    match kind {
        Kind::Var(v) if quantified.contains(v) => Ok(Kind::GenericVar(*v)),
        Kind::GenericVar(v) => Err(InferError::AlreadyGeneralised {
            term: Kind::GenericVar(*v).to_string(),
        }),
        other => Ok(other.clone()),
    }
}

fn freeze_type(
    ty: &Type,
    quantified_tys: &BTreeSet<TypeVarId>,
    quantified_kinds: &BTreeSet<KindVarId>,
) -> Result<Type, InferError> {
    match ty {
        Type::Var(tv) if quantified_tys.contains(tv) => Ok(Type::GenericVar(*tv)),
        Type::Var(tv) => Ok(Type::Var(*tv)),
        Type::GenericVar(tv) => Err(InferError::AlreadyGeneralised {
            term: Type::GenericVar(*tv).to_string(),
        }),
        Type::App(name, args) => Ok(Type::App(
            name.clone(),
            args.iter()
                .map(|a| freeze_type(a, quantified_tys, quantified_kinds))
                .collect::<Result<_, _>>()?,
        )),
        Type::Tuple(items) => Ok(Type::Tuple(
            items
                .iter()
                .map(|i| freeze_type(i, quantified_tys, quantified_kinds))
                .collect::<Result<_, _>>()?,
        )),
        Type::Arrow(param, kind, result) => Ok(Type::arrow(
            freeze_type(param, quantified_tys, quantified_kinds)?,
            freeze_kind(kind, quantified_kinds)?,
            freeze_type(result, quantified_tys, quantified_kinds)?,
        )),
        Type::Borrow(access, kind, inner) => Ok(Type::borrow(
            *access,
            freeze_kind(kind, quantified_kinds)?,
            freeze_type(inner, quantified_tys, quantified_kinds)?,
        )),
    }
}

/// Type variables of a resolved tree in order of first occurrence.
fn ordered_type_vars(ty: &Type, out: &mut Vec<TypeVarId>) {
    match ty {
        Type::Var(v) => {
            if !out.contains(v) {
                out.push(*v);
            }
        }
        Type::GenericVar(_) => {}
        Type::App(_, args) | Type::Tuple(args) => {
            for arg in args {
                ordered_type_vars(arg, out);
            }
        }
        Type::Arrow(param, _, result) => {
            ordered_type_vars(param, out);
            ordered_type_vars(result, out);
        }
        Type::Borrow(_, _, inner) => ordered_type_vars(inner, out),
    }
}

/// Kind variables syntactically present in a resolved tree, in order of
/// first occurrence.
fn ordered_kind_vars(ty: &Type) -> Vec<KindVarId> {
    fn walk(ty: &Type, out: &mut Vec<KindVarId>) {
        match ty {
            Type::Var(_) | Type::GenericVar(_) => {}
            Type::App(_, args) | Type::Tuple(args) => {
                for arg in args {
                    walk(arg, out);
                }
            }
            Type::Arrow(param, kind, result) => {
                if let Kind::Var(v) = kind
                    && !out.contains(v)
                {
                    out.push(*v);
                }
                walk(param, out);
                walk(result, out);
            }
            Type::Borrow(_, kind, inner) => {
                if let Kind::Var(v) = kind
                    && !out.contains(v)
                {
                    out.push(*v);
                }
                walk(inner, out);
            }
        }
    }
    let mut out = Vec::new();
    walk(ty, &mut out);
    out
}

/// Kind variables the environment can still see; the solver must not
/// eliminate them.
fn env_kind_vars(ctx: &mut InferenceContext, env: &Env, out: &mut BTreeSet<KindVarId>) {
    let schemes: Vec<TypeScheme> = env.value_schemes().cloned().collect();
    for scheme in schemes {
        let resolved = ctx.unifier.resolve(&scheme.ty);
        out.extend(free_kind_vars(&resolved));
        for tv in free_type_vars(&resolved) {
            if let Kind::Var(kv) = ctx.unifier.kind_of_var(tv) {
                out.insert(kv);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

fn infer_pattern(
    ctx: &mut InferenceContext,
    env: &Env,
    pattern: &Pattern,
) -> Result<(Vec<Binder>, Type), InferError> {
    match &pattern.node {
        PatternKind::Wildcard => {
            let ty = ctx.fresh_type();
            // Matching `_` silently discards the value, so it must be
            // affine or weaker.
            let kind = ctx.kind_of(env, &ty, &at(pattern.span, Reason::Weakening))?;
            ctx.require_leq(
                kind,
                Kind::Const(KindConst::new(Usage::Aff, Region::Never)),
                at(pattern.span, Reason::Weakening),
            );
            Ok((Vec::new(), ty))
        }
        PatternKind::Var(name) => {
            let ty = ctx.fresh_type();
            let kind = ctx.kind_of(env, &ty, &at(pattern.span, Reason::Weakening))?;
            let binder = Binder {
                name: name.clone(),
                scheme: TypeScheme::mono(ty.clone()),
                kind,
            };
            Ok((vec![binder], ty))
        }
        PatternKind::Tuple(items) => {
            let mut binders = Vec::new();
            let mut types = Vec::new();
            for item in items {
                let (item_binders, item_ty) = infer_pattern(ctx, env, item)?;
                binders.extend(item_binders);
                types.push(item_ty);
            }
            Ok((binders, Type::Tuple(types)))
        }
        PatternKind::Constructor(name, args) => {
            let scheme = env.find_constructor(name)?.clone();
            let mut ctor_ty = instantiate(ctx, &scheme, pattern.span);
            let expected = arrow_arity(ctx, &ctor_ty);
            if expected != args.len() {
                return Err(InferError::ArityMismatch {
                    expected,
                    actual: args.len(),
                });
            }
            let mut binders = Vec::new();
            for arg in args {
                let (arg_binders, arg_ty) = infer_pattern(ctx, env, arg)?;
                binders.extend(arg_binders);
                match ctx.unifier.shorten(&ctor_ty) {
                    Type::Arrow(param, _, rest) => {
                        ctx.require_equal(&arg_ty, &param, at(arg.span, Reason::PatternMatch));
                        ctor_ty = *rest;
                    }
                    _ => unreachable!("constructor arity was checked"),
                }
            }
            ctx.normalize(env)?;
            Ok((binders, ctor_ty))
        }
    }
}

/// Pattern inference under a match borrow modifier: the scrutinee is a
/// borrow, components are destructured through it, and every bound
/// variable receives a borrow of its component at the scrutinee borrow's
/// kind. Returns the borrowed payload type.
fn infer_pattern_borrowed(
    ctx: &mut InferenceContext,
    env: &Env,
    pattern: &Pattern,
    access: Access,
    borrow_kind: &Kind,
) -> Result<(Vec<Binder>, Type), InferError> {
    match &pattern.node {
        PatternKind::Wildcard => {
            // Discarding a borrow consumes nothing.
            Ok((Vec::new(), ctx.fresh_type()))
        }
        PatternKind::Var(name) => {
            let payload = ctx.fresh_type();
            let binder = Binder {
                name: name.clone(),
                scheme: TypeScheme::mono(Type::borrow(
                    access,
                    borrow_kind.clone(),
                    payload.clone(),
                )),
                kind: borrow_kind.clone(),
            };
            Ok((vec![binder], payload))
        }
        PatternKind::Tuple(items) => {
            let mut binders = Vec::new();
            let mut types = Vec::new();
            for item in items {
                let (item_binders, item_ty) =
                    infer_pattern_borrowed(ctx, env, item, access, borrow_kind)?;
                binders.extend(item_binders);
                types.push(item_ty);
            }
            Ok((binders, Type::Tuple(types)))
        }
        PatternKind::Constructor(name, args) => {
            let scheme = env.find_constructor(name)?.clone();
            let mut ctor_ty = instantiate(ctx, &scheme, pattern.span);
            let expected = arrow_arity(ctx, &ctor_ty);
            if expected != args.len() {
                return Err(InferError::ArityMismatch {
                    expected,
                    actual: args.len(),
                });
            }
            let mut binders = Vec::new();
            for arg in args {
                let (arg_binders, arg_ty) =
                    infer_pattern_borrowed(ctx, env, arg, access, borrow_kind)?;
                binders.extend(arg_binders);
                match ctx.unifier.shorten(&ctor_ty) {
                    Type::Arrow(param, _, rest) => {
                        ctx.require_equal(&arg_ty, &param, at(arg.span, Reason::PatternMatch));
                        ctor_ty = *rest;
                    }
                    _ => unreachable!("constructor arity was checked"),
                }
            }
            ctx.normalize(env)?;
            Ok((binders, ctor_ty))
        }
    }
}

fn arrow_arity(ctx: &mut InferenceContext, ty: &Type) -> usize {
    let mut count = 0;
    let mut head = ctx.unifier.shorten(ty);
    while let Type::Arrow(_, _, rest) = head {
        count += 1;
        head = ctx.unifier.shorten(&rest);
    }
    count
}

fn describe_pattern(pattern: &PatternKind) -> String {
    match pattern {
        PatternKind::Wildcard => "_".to_string(),
        PatternKind::Var(name) => name.text.clone(),
        PatternKind::Tuple(_) => "a tuple pattern".to_string(),
        PatternKind::Constructor(name, _) => format!("a `{name}` pattern"),
    }
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

fn lit_type(env: &Env, lit: &Lit) -> Type {
    match lit {
        Lit::Int(_) => env.prims().int_type(),
        Lit::Bool(_) => env.prims().bool_type(),
        Lit::String(_) => env.prims().string_type(),
        Lit::Unit => env.prims().unit_type(),
    }
}

/// Infer one expression, producing its multiplicity map and type. The
/// environment is extended for sub-derivations and restored on the way
/// out; the constraint set is normalised before returning.
pub fn infer_expr(
    ctx: &mut InferenceContext,
    env: &mut Env,
    expr: &Expr,
) -> Result<(Multiplicity, Type), InferError> {
    let span = expr.span;
    match &expr.node {
        ExprKind::Lit(lit) => Ok((Multiplicity::new(), lit_type(env, lit))),

        ExprKind::Var(name) => {
            let scheme = env.find_value(name)?.clone();
            let ty = instantiate(ctx, &scheme, span);
            let kind = ctx.kind_of(env, &ty, &at(span, Reason::VarBinding))?;
            let mut mult = Multiplicity::new();
            mult.record_use(name.clone(), kind);
            ctx.normalize(env)?;
            Ok((mult, ty))
        }

        ExprKind::Borrow(access, name) => {
            let scheme = env.find_value(name)?.clone();
            let inner = instantiate(ctx, &scheme, span);
            let kind = ctx.fresh_kind();
            let mut mult = Multiplicity::new();
            mult.record_borrow(name.clone(), *access, kind.clone());
            ctx.normalize(env)?;
            Ok((mult, Type::borrow(*access, kind, inner)))
        }

        ExprKind::Reborrow(access, name) => {
            let scheme = env.find_value(name)?.clone();
            let source = instantiate(ctx, &scheme, span);
            // The source must itself hold an exclusive borrow.
            let payload = ctx.fresh_type();
            let source_kind = ctx.fresh_kind();
            ctx.require_equal(
                &source,
                &Type::borrow(Access::Write, source_kind, payload.clone()),
                at(span, Reason::BorrowPayload),
            );
            ctx.normalize(env)?;
            let kind = ctx.fresh_kind();
            let mut mult = Multiplicity::new();
            mult.record_borrow(name.clone(), *access, kind.clone());
            Ok((mult, Type::borrow(*access, kind, payload)))
        }

        ExprKind::Lambda(pattern, body) => {
            let (binders, param_ty) = infer_pattern(ctx, env, pattern)?;
            let (mut mult, body_ty) =
                with_bindings(env, &binders, |env| infer_expr(ctx, env, body))?;
            for binder in &binders {
                mult.exit_binder(
                    &binder.name,
                    &binder.kind,
                    &at(pattern.span, Reason::Weakening),
                    ctx.constraints_mut(),
                );
            }
            // What remains in the map was captured from the enclosing
            // scope; a linear capture forces a linear closure.
            let arrow_kind = ctx.fresh_kind();
            mult.constrain_all(&arrow_kind, &at(span, Reason::ArrowCapture), ctx.constraints_mut());
            ctx.normalize(env)?;
            Ok((mult, Type::arrow(param_ty, arrow_kind, body_ty)))
        }

        ExprKind::App(func, args) => {
            let (mut mult, mut fun_ty) = infer_expr(ctx, env, func)?;
            for arg in args {
                let (arg_mult, arg_ty) = infer_expr(ctx, env, arg)?;
                mult = mult.seq_merge(
                    arg_mult,
                    &at(arg.span, Reason::SequentialReuse),
                    ctx.constraints_mut(),
                )?;
                let kind = ctx.fresh_kind();
                let result = ctx.fresh_type();
                ctx.require_equal(
                    &fun_ty,
                    &Type::arrow(arg_ty, kind, result.clone()),
                    at(arg.span, Reason::FunctionArg),
                );
                ctx.normalize(env)?;
                fun_ty = result;
            }
            Ok((mult, fun_ty))
        }

        ExprKind::Construct(name, args) => {
            let scheme = env.find_constructor(name)?.clone();
            let mut ctor_ty = instantiate(ctx, &scheme, span);
            let mut mult = Multiplicity::new();
            for arg in args {
                let (arg_mult, arg_ty) = infer_expr(ctx, env, arg)?;
                mult = mult.seq_merge(
                    arg_mult,
                    &at(arg.span, Reason::SequentialReuse),
                    ctx.constraints_mut(),
                )?;
                let kind = ctx.fresh_kind();
                let result = ctx.fresh_type();
                ctx.require_equal(
                    &ctor_ty,
                    &Type::arrow(arg_ty, kind, result.clone()),
                    at(arg.span, Reason::FunctionArg),
                );
                ctx.normalize(env)?;
                ctor_ty = result;
            }
            Ok((mult, ctor_ty))
        }

        ExprKind::Tuple(items) => {
            let mut mult = Multiplicity::new();
            let mut types = Vec::new();
            for item in items {
                let (item_mult, item_ty) = infer_expr(ctx, env, item)?;
                mult = mult.seq_merge(
                    item_mult,
                    &at(item.span, Reason::SequentialReuse),
                    ctx.constraints_mut(),
                )?;
                types.push(item_ty);
            }
            ctx.normalize(env)?;
            Ok((mult, Type::Tuple(types)))
        }

        ExprKind::Array(items) => {
            let elem_ty = ctx.fresh_type();
            let mut mult = Multiplicity::new();
            for item in items {
                let (item_mult, item_ty) = infer_expr(ctx, env, item)?;
                mult = mult.seq_merge(
                    item_mult,
                    &at(item.span, Reason::SequentialReuse),
                    ctx.constraints_mut(),
                )?;
                ctx.require_equal(&item_ty, &elem_ty, at(item.span, Reason::ElementAgreement));
            }
            ctx.normalize(env)?;
            let array = Type::App(env.prims().array_name().clone(), vec![elem_ty]);
            Ok((mult, array))
        }

        ExprKind::Let {
            rec: RecFlag::NonRec,
            pattern,
            value,
            body,
        } => {
            ctx.unifier.enter_level();
            let value_outcome = infer_expr(ctx, env, value);
            ctx.unifier.leave_level();
            let (value_mult, value_ty) = value_outcome?;
            ctx.normalize(env)?;

            let gen_floor = ctx.unifier.level() + 1;
            let binders = match (&pattern.node, is_nonexpansive(value)) {
                (PatternKind::Var(name), true) => {
                    // The exit obligation is phrased in the kind the
                    // binding has before quantification.
                    let kind =
                        ctx.kind_of(env, &value_ty, &at(pattern.span, Reason::Weakening))?;
                    let scheme = generalize(ctx, env, gen_floor, &value_ty)?;
                    vec![Binder {
                        name: name.clone(),
                        scheme,
                        kind,
                    }]
                }
                _ => {
                    let (binders, pattern_ty) = infer_pattern(ctx, env, pattern)?;
                    ctx.require_equal(
                        &pattern_ty,
                        &value_ty,
                        at(pattern.span, Reason::PatternMatch),
                    );
                    ctx.normalize(env)?;
                    binders
                }
            };

            let (body_mult, body_ty) =
                with_bindings(env, &binders, |env| infer_expr(ctx, env, body))?;
            let mut mult = value_mult.seq_merge(
                body_mult,
                &at(span, Reason::SequentialReuse),
                ctx.constraints_mut(),
            )?;
            for binder in &binders {
                mult.exit_binder(
                    &binder.name,
                    &binder.kind,
                    &at(pattern.span, Reason::Weakening),
                    ctx.constraints_mut(),
                );
            }
            ctx.normalize(env)?;
            Ok((mult, body_ty))
        }

        ExprKind::Let {
            rec: RecFlag::Rec,
            pattern,
            value,
            body,
        } => {
            let PatternKind::Var(name) = &pattern.node else {
                return Err(InferError::IllegalRecPattern {
                    pattern: describe_pattern(&pattern.node),
                });
            };

            ctx.unifier.enter_level();
            let pre_ty = ctx.fresh_type();
            let pre_kind = ctx.kind_of(env, &pre_ty, &at(span, Reason::RecBinding))?;
            // The binding refers to itself, so it must be shareable.
            ctx.require_leq(pre_kind.clone(), un_never(), at(span, Reason::RecBinding));
            let pre_binder = Binder {
                name: name.clone(),
                scheme: TypeScheme::mono(pre_ty.clone()),
                kind: pre_kind.clone(),
            };
            let value_outcome = with_bindings(env, std::slice::from_ref(&pre_binder), |env| {
                infer_expr(ctx, env, value)
            });
            ctx.unifier.leave_level();
            let (value_mult, value_ty) = value_outcome?;
            ctx.require_equal(&pre_ty, &value_ty, at(value.span, Reason::RecBinding));
            ctx.normalize(env)?;

            let gen_floor = ctx.unifier.level() + 1;
            let scheme = if is_nonexpansive(value) {
                generalize(ctx, env, gen_floor, &value_ty)?
            } else {
                TypeScheme::mono(ctx.unifier.resolve(&value_ty))
            };
            let binder = Binder {
                name: name.clone(),
                scheme,
                kind: pre_kind,
            };

            let (body_mult, body_ty) =
                with_bindings(env, std::slice::from_ref(&binder), |env| {
                    infer_expr(ctx, env, body)
                })?;
            let mut mult = value_mult.seq_merge(
                body_mult,
                &at(span, Reason::SequentialReuse),
                ctx.constraints_mut(),
            )?;
            mult.exit_binder(
                name,
                &binder.kind,
                &at(span, Reason::Weakening),
                ctx.constraints_mut(),
            );
            ctx.normalize(env)?;
            Ok((mult, body_ty))
        }

        ExprKind::Match {
            borrow,
            scrutinee,
            arms,
        } => {
            let (scrut_mult, scrut_ty) = infer_expr(ctx, env, scrutinee)?;
            let result_ty = ctx.fresh_type();
            let mut merged_arms: Option<Multiplicity> = None;

            for arm in arms {
                let (binders, pattern_ty) = match borrow {
                    None => infer_pattern(ctx, env, &arm.pattern)?,
                    Some(access) => {
                        let borrow_kind = ctx.fresh_kind();
                        let (binders, payload_ty) = infer_pattern_borrowed(
                            ctx,
                            env,
                            &arm.pattern,
                            *access,
                            &borrow_kind,
                        )?;
                        (binders, Type::borrow(*access, borrow_kind, payload_ty))
                    }
                };
                ctx.require_equal(
                    &pattern_ty,
                    &scrut_ty,
                    at(arm.pattern.span, Reason::PatternMatch),
                );
                ctx.normalize(env)?;

                let (mut arm_mult, arm_ty) =
                    with_bindings(env, &binders, |env| infer_expr(ctx, env, &arm.body))?;
                for binder in &binders {
                    arm_mult.exit_binder(
                        &binder.name,
                        &binder.kind,
                        &at(arm.pattern.span, Reason::Weakening),
                        ctx.constraints_mut(),
                    );
                }
                ctx.require_equal(&arm_ty, &result_ty, at(arm.body.span, Reason::MatchArms));
                ctx.normalize(env)?;

                merged_arms = Some(match merged_arms {
                    None => arm_mult,
                    Some(previous) => previous.par_merge(arm_mult)?,
                });
            }

            let mult = match merged_arms {
                Some(arms_mult) => scrut_mult.seq_merge(
                    arms_mult,
                    &at(span, Reason::SequentialReuse),
                    ctx.constraints_mut(),
                )?,
                None => scrut_mult,
            };
            ctx.normalize(env)?;
            Ok((mult, result_ty))
        }

        ExprKind::Region { names, body } => {
            let outer = ctx.unifier.level();
            ctx.unifier.enter_level();
            let inner = ctx.unifier.level();
            let body_outcome = infer_expr(ctx, env, body);
            ctx.unifier.leave_level();
            let (mut mult, body_ty) = body_outcome?;

            // Borrow kinds opened on the region's names cannot name a
            // region older than this one.
            for name in names {
                if let Some(Use::Borrow(_, kinds)) = mult.get(name) {
                    for kind in kinds.clone() {
                        ctx.require_leq(
                            Kind::un(Region::Scope(inner)),
                            kind,
                            at(span, Reason::RegionExit),
                        );
                    }
                }
            }
            mult.exit_scope(names);

            // The region's result must be first-class outside it.
            let result_kind = ctx.kind_of(env, &body_ty, &at(span, Reason::RegionEscape))?;
            ctx.require_leq(
                result_kind,
                Kind::lin(Region::Scope(outer)),
                at(span, Reason::RegionEscape),
            );
            ctx.normalize(env)?;
            Ok((mult, body_ty))
        }
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Infer a top-level value declaration: infer the body one level in,
/// generalise at the top level (honouring the value restriction), verify
/// the residue, and return it with the extended environment and the
/// resulting scheme.
pub fn infer_top(
    ctx: &mut InferenceContext,
    env: &Env,
    rec: RecFlag,
    name: &Name,
    expr: &Expr,
) -> Result<(Vec<KindBound>, Env, TypeScheme), InferError> {
    debug_assert_eq!(ctx.unifier.level(), 0, "top-level declarations start at level 0");
    let mut working = env.clone();
    ctx.unifier.enter_level();
    let outcome = infer_top_body(ctx, &mut working, rec, name, expr);
    ctx.unifier.leave_level();
    let (_multiplicity, ty) = outcome?;
    ctx.normalize(&working)?;

    let scheme = if is_nonexpansive(expr) {
        generalize(ctx, &working, 1, &ty)?
    } else {
        // The value restriction leaves the type monomorphic; publish its
        // leftover variables as weak so later declarations cannot
        // quantify them.
        let resolved = ctx.unifier.resolve(&ty);
        ctx.unifier.demote_to_level(&resolved, 0);
        TypeScheme::mono(resolved)
    };

    let residue = ctx.residue();
    let mut env_out = env.clone();
    env_out.add_value(name.clone(), scheme.clone());
    Ok((residue, env_out, scheme))
}

fn infer_top_body(
    ctx: &mut InferenceContext,
    env: &mut Env,
    rec: RecFlag,
    name: &Name,
    expr: &Expr,
) -> Result<(Multiplicity, Type), InferError> {
    match rec {
        RecFlag::NonRec => infer_expr(ctx, env, expr),
        RecFlag::Rec => {
            let pre_ty = ctx.fresh_type();
            let pre_kind = ctx.kind_of(env, &pre_ty, &at(expr.span, Reason::RecBinding))?;
            ctx.require_leq(pre_kind.clone(), un_never(), at(expr.span, Reason::RecBinding));
            let binder = Binder {
                name: name.clone(),
                scheme: TypeScheme::mono(pre_ty.clone()),
                kind: pre_kind,
            };
            let (mult, ty) = with_bindings(env, std::slice::from_ref(&binder), |env| {
                infer_expr(ctx, env, expr)
            })?;
            ctx.require_equal(&pre_ty, &ty, at(expr.span, Reason::RecBinding));
            ctx.normalize(env)?;
            Ok((mult, ty))
        }
    }
}

/// A surface type-constructor declaration.
///
/// Parameters are context-created type variables so constructor payloads
/// can mention them; their kinds are read back from the unifier when the
/// declaration's kind scheme is generalised.
#[derive(Debug, Clone)]
pub struct TypeDecl {
    pub name: Name,
    pub params: Vec<TypeVarId>,
    pub result: Kind,
    pub variance: Vec<Variance>,
    pub constructors: Vec<(Name, Vec<Type>)>,
}

/// Introduce a new type constructor: infer the kinds of its constructor
/// payloads (each bounded by the constructed kind), generalise the kind
/// scheme, and register constructor value schemes.
pub fn make_type_decl(
    ctx: &mut InferenceContext,
    env: &Env,
    decl: &TypeDecl,
) -> Result<(Env, KindScheme), InferError> {
    let span = Span::synthetic();

    // Provisional registration so payloads may mention the type itself.
    let param_kinds: Vec<Kind> = decl
        .params
        .iter()
        .map(|tv| ctx.unifier.kind_of_var(*tv))
        .collect();
    let provisional = KindScheme {
        kind_vars: Vec::new(),
        constraint: Vec::new(),
        params: param_kinds.clone(),
        variance: decl.variance.clone(),
        result: decl.result.clone(),
    };
    let mut working = env.clone();
    working.add_type(decl.name.clone(), provisional);

    // A payload more restricted than the constructed type could smuggle
    // restricted values into an unrestricted wrapper.
    for (_, payloads) in &decl.constructors {
        for payload in payloads {
            let payload_kind =
                ctx.kind_of(&working, payload, &at(span, Reason::ConstructorPayload))?;
            ctx.require_leq(
                payload_kind,
                decl.result.clone(),
                at(span, Reason::ConstructorPayload),
            );
        }
    }
    ctx.normalize(&working)?;

    // Quantify the kind variables of the parameters and result.
    let mut gen_kvars: Vec<KindVarId> = Vec::new();
    for kind in param_kinds.iter().chain(std::iter::once(&decl.result)) {
        if let Kind::Var(kv) = ctx.unifier.resolve_kind(kind)
            && !gen_kvars.contains(&kv)
        {
            gen_kvars.push(kv);
        }
    }
    let quantified: BTreeSet<KindVarId> = gen_kvars.iter().copied().collect();
    let constraint = partition_bounds(ctx, &quantified)?;

    let frozen_params = param_kinds
        .iter()
        .map(|k| {
            let k = ctx.unifier.resolve_kind(k);
            freeze_kind(&k, &quantified)
        })
        .collect::<Result<Vec<_>, _>>()?;
    let frozen_result = {
        let k = ctx.unifier.resolve_kind(&decl.result);
        freeze_kind(&k, &quantified)?
    };
    let kind_scheme = KindScheme {
        kind_vars: gen_kvars.clone(),
        constraint: constraint.clone(),
        params: frozen_params,
        variance: decl.variance.clone(),
        result: frozen_result,
    };

    let mut env_out = env.clone();
    env_out.add_type(decl.name.clone(), kind_scheme.clone());

    // Each constructor becomes a curried function value ending in the
    // declared type.
    let quantified_tys: BTreeSet<TypeVarId> = decl.params.iter().copied().collect();
    let result_ty = Type::App(
        decl.name.clone(),
        decl.params.iter().map(|tv| Type::Var(*tv)).collect(),
    );
    for (ctor_name, payloads) in &decl.constructors {
        let mut body = result_ty.clone();
        for payload in payloads.iter().rev() {
            body = Type::arrow(payload.clone(), Kind::un(Region::Global), body);
        }
        let body = {
            let resolved = ctx.unifier.resolve(&body);
            freeze_type(&resolved, &quantified_tys, &quantified)?
        };
        let type_vars = decl
            .params
            .iter()
            .map(|tv| {
                let kind = ctx.unifier.kind_of_var(*tv);
                Ok((*tv, freeze_kind(&kind, &quantified)?))
            })
            .collect::<Result<Vec<_>, InferError>>()?;
        let scheme = TypeScheme {
            kind_vars: gen_kvars.clone(),
            type_vars,
            constraint: constraint.clone(),
            ty: body,
        };
        env_out.add_constructor(ctor_name.clone(), scheme);
    }

    Ok((env_out, kind_scheme))
}

/// Compute a closed scheme for a user-written type annotation and bind
/// it in the environment.
pub fn make_type_scheme(
    ctx: &mut InferenceContext,
    env: &Env,
    name: &Name,
    ty: &Type,
) -> Result<(Env, TypeScheme), InferError> {
    let provenance = at(Span::synthetic(), Reason::Annotation);
    ctx.kind_of(env, ty, &provenance)?;
    ctx.normalize(env)?;
    let scheme = generalize(ctx, env, 0, ty)?;
    let mut env_out = env.clone();
    env_out.add_value(name.clone(), scheme.clone());
    Ok((env_out, scheme))
}
