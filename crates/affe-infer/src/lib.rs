//! Type and kind inference for Affe.
//!
//! This crate implements:
//! - A two-tier unifier over types and usage kinds, built on
//!   level-indexed unification variables
//! - A constraint solver over the Un/Aff/Lin × region lattice producing a
//!   canonical form and detecting infeasibility
//! - Multiplicity tracking: how each in-scope variable is consumed along
//!   an inference path
//! - Value-restricted generalisation informed by variance
//!
//! Inference is `Result`-based and aborts the current declaration at the
//! first type, kind, or usage mismatch. Constraints carry provenance for
//! error reporting and tracing.

pub mod builtins;
pub mod multiplicity;
pub mod solve;
pub mod trace;
pub mod typeck;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use affe_ast::Span;
use affe_types::{Kind, KindScheme, KindVarId, Type, TypeVarId};

use crate::multiplicity::Use;
use crate::typeck::Env;

/// Global counters for type/kind variable IDs.
///
/// Each `InferenceContext` allocates IDs from these counters so that no
/// two contexts ever produce the same `TypeVarId` or `KindVarId`. This
/// prevents cross-contamination when schemes produced by one context are
/// instantiated by another (which happens whenever several declarations
/// are checked against a shared environment).
static GLOBAL_TYPE_VAR: AtomicU32 = AtomicU32::new(0);
static GLOBAL_KIND_VAR: AtomicU32 = AtomicU32::new(0);

/// Allocate a fresh block of variable IDs from the global counters.
///
/// Each context requests `VAR_BLOCK_SIZE` IDs up-front so that the atomic
/// increment happens once per context rather than once per variable.
const VAR_BLOCK_SIZE: u32 = 1024;

fn alloc_var_block(counter: &AtomicU32) -> u32 {
    counter.fetch_add(VAR_BLOCK_SIZE, Ordering::Relaxed)
}

// Re-export for convenience.
pub use affe_diag::{Category, Diagnostic, DiagnosticError, SourceLocation};
pub use affe_types::TypeScheme;

// ---------------------------------------------------------------------------
// Provenance: why a constraint exists
// ---------------------------------------------------------------------------

/// Tracks the origin of a constraint for error reporting and tracing.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub span: Span,
    pub reason: Reason,
}

impl Provenance {
    pub fn new(span: Span, reason: Reason) -> Self {
        Self { span, reason }
    }
}

/// Why a constraint was generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// Application argument must fit the function's parameter.
    FunctionArg,
    /// Borrow payloads unify with their kinds equated.
    BorrowPayload,
    /// Kinds agree when a type variable is solved.
    VarBinding,
    /// A variable used more than once in sequence must be unrestricted.
    SequentialReuse,
    /// A binder dropped, or consumed more than once, must be affine.
    Weakening,
    /// Every value captured by a closure bounds the closure's kind.
    ArrowCapture,
    /// Match arms share a result type.
    MatchArms,
    /// A pattern must match its scrutinee.
    PatternMatch,
    /// A recursive binder refers to itself, so it must be shared.
    RecBinding,
    /// A borrow's kind is pinned inside the region it was opened in.
    RegionExit,
    /// A region's result must be first-class outside the region.
    RegionEscape,
    /// A constraint carried by a scheme, re-emitted at instantiation.
    Instantiation,
    /// A user-written type annotation must be well-kinded.
    Annotation,
    /// A constructor payload's kind is bounded by the constructed kind.
    ConstructorPayload,
    /// A tuple's kind upper-bounds the kinds of its components.
    TupleKind,
    /// Array elements share one type.
    ElementAgreement,
}

// ---------------------------------------------------------------------------
// Constraints
// ---------------------------------------------------------------------------

/// A constraint generated during inference.
///
/// A constraint set is the conjunction of its items; the empty set is the
/// trivially true constraint. After normalisation only kind inequalities
/// remain — every type equality has been discharged into the unifier.
#[derive(Debug, Clone)]
pub enum Constraint {
    /// Two types must be equal.
    TypeEqual {
        expected: Type,
        actual: Type,
        provenance: Provenance,
    },
    /// One kind must be below another in the lattice.
    KindLeq {
        lhs: Kind,
        rhs: Kind,
        provenance: Provenance,
    },
}

/// Constraint accumulator for one inference run.
#[derive(Debug, Clone, Default)]
pub struct ConstraintSet {
    items: Vec<Constraint>,
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, constraint: Constraint) {
        self.items.push(constraint);
    }

    pub fn extend(&mut self, constraints: impl IntoIterator<Item = Constraint>) {
        self.items.extend(constraints);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn drain(&mut self) -> Vec<Constraint> {
        std::mem::take(&mut self.items)
    }
}

// ---------------------------------------------------------------------------
// Inference errors
// ---------------------------------------------------------------------------

/// A failure of type, kind, or usage checking.
///
/// The first error aborts the current declaration; every variant carries
/// the offending terms for rendering. Source locations are attached by
/// the harness, which still has the declaration in hand.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InferError {
    #[error("cannot unify `{left}` with `{right}`")]
    TypeMismatch { left: Type, right: Type },

    #[error("cannot unify kind `{left}` with `{right}`")]
    KindMismatch { left: Kind, right: Kind },

    #[error("kind `{var}` is bounded below by `{lower}` and above by `{upper}`, which the lattice does not order")]
    KindInfeasible { lower: Kind, var: Kind, upper: Kind },

    #[error("`{name}` is {first} here but {second} elsewhere")]
    UseMismatch {
        name: affe_ast::Name,
        first: Use,
        second: Use,
    },

    #[error("this type would have to contain itself")]
    RecursiveType,

    #[error("unknown name `{name}`")]
    UnknownName { name: affe_ast::Name },

    #[error("unknown type `{name}`")]
    UnknownType { name: affe_ast::Name },

    #[error("`let rec` accepts only a variable on the left, not `{pattern}`")]
    IllegalRecPattern { pattern: String },

    #[error("quantified form `{term}` reached a context expecting an instantiated one")]
    AlreadyGeneralised { term: String },

    #[error("type constructor expects {expected} argument(s) but got {actual}")]
    ArityMismatch { expected: usize, actual: usize },
}

impl InferError {
    pub fn category(&self) -> Category {
        match self {
            InferError::TypeMismatch { .. } => Category::TypeMismatch,
            InferError::KindMismatch { .. } => Category::KindMismatch,
            InferError::KindInfeasible { .. } => Category::KindInfeasibility,
            InferError::UseMismatch { .. } => Category::UseMismatch,
            InferError::RecursiveType => Category::RecursiveType,
            InferError::UnknownName { .. } => Category::UndefinedName,
            InferError::UnknownType { .. } => Category::UndefinedType,
            InferError::IllegalRecPattern { .. } => Category::IllegalRecPattern,
            InferError::AlreadyGeneralised { .. } => Category::AlreadyGeneralised,
            InferError::ArityMismatch { .. } => Category::ArityMismatch,
        }
    }

    /// Render into a diagnostic at the given location.
    pub fn into_diagnostic(self, location: SourceLocation) -> Diagnostic {
        let category = self.category();
        Diagnostic::error(category, self.to_string())
            .at(location)
            .with_help(category.example_fix())
    }
}

/// Convert an AST span into a diagnostic location.
pub fn span_to_location(span: Span) -> SourceLocation {
    SourceLocation {
        file_id: span.file.0,
        start: span.start,
        end: span.end,
    }
}

// ---------------------------------------------------------------------------
// Unification variable state
// ---------------------------------------------------------------------------

/// State of a type unification variable.
///
/// A cell is rewritten at most once, from `Unbound` to `Link`; thereafter
/// it forwards transparently. Levels only decrease.
#[derive(Debug, Clone)]
enum TypeVarState {
    Unbound { level: u32 },
    Link(Type),
}

/// State of a kind unification variable.
#[derive(Debug, Clone)]
enum KindVarState {
    Unbound { level: u32 },
    Link(Kind),
}

// ---------------------------------------------------------------------------
// Unifier
// ---------------------------------------------------------------------------

/// The two-tier unifier: types and usage kinds.
///
/// Variable state lives in side tables keyed by id. `shorten` resolves a
/// head through link chains with path compression; `resolve` freezes a
/// whole term to tree form. Every fresh variable is tagged with the
/// current inference level, and binding a variable lowers the levels of
/// the variables on the other side.
pub struct Unifier {
    type_vars: BTreeMap<TypeVarId, TypeVarState>,
    kind_vars: BTreeMap<KindVarId, KindVarState>,
    /// The kind of each type variable, consulted when synthesising the
    /// kind of a `Type::Var` head.
    type_var_kinds: BTreeMap<TypeVarId, Kind>,
    /// Current inference level; incremented inside `let` right-hand
    /// sides and region bodies.
    level: u32,
    next_type_var: u32,
    next_kind_var: u32,
    /// When true, unification steps are recorded for observability tools.
    tracing: bool,
    steps: Vec<trace::UnifyStep>,
}

impl Unifier {
    pub fn new() -> Self {
        Self::with_var_offsets(
            alloc_var_block(&GLOBAL_TYPE_VAR),
            alloc_var_block(&GLOBAL_KIND_VAR),
        )
    }

    /// Create a unifier with explicit starting offsets for variable IDs.
    ///
    /// Production code should use `new()` (which allocates from global
    /// counters). This constructor exists for tests that need
    /// deterministic ids starting at 0.
    pub fn with_var_offsets(next_type_var: u32, next_kind_var: u32) -> Self {
        Self {
            type_vars: BTreeMap::new(),
            kind_vars: BTreeMap::new(),
            type_var_kinds: BTreeMap::new(),
            level: 0,
            next_type_var,
            next_kind_var,
            tracing: false,
            steps: Vec::new(),
        }
    }

    // -- Levels --

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn enter_level(&mut self) {
        self.level += 1;
    }

    pub fn leave_level(&mut self) {
        debug_assert!(self.level > 0, "leave_level below the top level");
        self.level -= 1;
    }

    // -- Fresh variables --

    pub fn fresh_kind_var(&mut self) -> KindVarId {
        let id = KindVarId(self.next_kind_var);
        self.next_kind_var += 1;
        self.kind_vars
            .insert(id, KindVarState::Unbound { level: self.level });
        id
    }

    pub fn fresh_kind(&mut self) -> Kind {
        Kind::Var(self.fresh_kind_var())
    }

    /// A fresh type variable whose kind is itself a fresh kind variable.
    pub fn fresh_type_var(&mut self) -> TypeVarId {
        let kind = self.fresh_kind();
        self.fresh_type_var_with_kind(kind)
    }

    /// A fresh type variable at an explicitly chosen kind.
    pub fn fresh_type_var_with_kind(&mut self, kind: Kind) -> TypeVarId {
        let id = TypeVarId(self.next_type_var);
        self.next_type_var += 1;
        self.type_vars
            .insert(id, TypeVarState::Unbound { level: self.level });
        self.type_var_kinds.insert(id, kind);
        id
    }

    pub fn fresh_type(&mut self) -> Type {
        Type::Var(self.fresh_type_var())
    }

    /// The kind recorded for a type variable.
    pub fn kind_of_var(&mut self, var: TypeVarId) -> Kind {
        let kind = self
            .type_var_kinds
            .get(&var)
            .expect("type variable registered with a kind")
            .clone();
        self.resolve_kind(&kind)
    }

    /// The level of an unbound type variable.
    fn type_var_level(&self, var: TypeVarId) -> u32 {
        match self.type_vars.get(&var) {
            Some(TypeVarState::Unbound { level }) => *level,
            _ => unreachable!("level queried on a bound or foreign type variable"),
        }
    }

    fn kind_var_state(&self, var: KindVarId) -> &KindVarState {
        self.kind_vars
            .get(&var)
            .expect("kind variable registered before use")
    }

    /// The level of a kind variable, if it is still unbound.
    pub fn kind_var_level(&self, var: KindVarId) -> Option<u32> {
        match self.kind_var_state(var) {
            KindVarState::Unbound { level } => Some(*level),
            KindVarState::Link(_) => None,
        }
    }

    /// Whether a type variable is still unbound, and at which level.
    pub fn type_var_unbound_level(&self, var: TypeVarId) -> Option<u32> {
        match self.type_vars.get(&var) {
            Some(TypeVarState::Unbound { level }) => Some(*level),
            _ => None,
        }
    }

    // -- Tracing --

    pub fn enable_tracing(&mut self) {
        self.tracing = true;
    }

    pub fn take_trace(&mut self) -> Vec<trace::UnifyStep> {
        std::mem::take(&mut self.steps)
    }

    fn push_step(&mut self, action: trace::UnifyAction, left: String, right: String, detail: String) {
        if !self.tracing {
            return;
        }
        let step = self.steps.len();
        self.steps.push(trace::UnifyStep {
            step,
            action,
            left,
            right,
            detail,
        });
    }

    // -- Link resolution --

    /// Resolve the head of a type through link chains, compressing the
    /// chain so every traversed cell points at the final head.
    pub fn shorten(&mut self, ty: &Type) -> Type {
        let mut chain = Vec::new();
        let mut head = ty.clone();
        while let Type::Var(v) = head {
            match self.type_vars.get(&v) {
                Some(TypeVarState::Link(next)) => {
                    chain.push(v);
                    head = next.clone();
                }
                _ => {
                    head = Type::Var(v);
                    break;
                }
            }
        }
        if chain.len() > 1 {
            for v in chain {
                self.type_vars.insert(v, TypeVarState::Link(head.clone()));
            }
        }
        head
    }

    /// Resolve a kind through link chains, compressing as for types.
    pub fn resolve_kind(&mut self, kind: &Kind) -> Kind {
        let mut chain = Vec::new();
        let mut head = kind.clone();
        while let Kind::Var(v) = head {
            match self.kind_var_state(v) {
                KindVarState::Link(next) => {
                    chain.push(v);
                    head = next.clone();
                }
                KindVarState::Unbound { .. } => {
                    head = Kind::Var(v);
                    break;
                }
            }
        }
        if chain.len() > 1 {
            for v in chain {
                self.kind_vars.insert(v, KindVarState::Link(head.clone()));
            }
        }
        head
    }

    /// Deeply resolve a type: every link chain is followed and every kind
    /// annotation resolved, producing a tree with only unbound variables
    /// left as `Var`.
    pub fn resolve(&mut self, ty: &Type) -> Type {
        let head = self.shorten(ty);
        match head {
            Type::Var(_) | Type::GenericVar(_) => head,
            Type::App(name, args) => {
                let args = args.iter().map(|a| self.resolve(a)).collect();
                Type::App(name, args)
            }
            Type::Tuple(items) => {
                let items = items.iter().map(|i| self.resolve(i)).collect();
                Type::Tuple(items)
            }
            Type::Arrow(param, kind, result) => {
                let param = self.resolve(&param);
                let kind = self.resolve_kind(&kind);
                let result = self.resolve(&result);
                Type::arrow(param, kind, result)
            }
            Type::Borrow(access, kind, inner) => {
                let kind = self.resolve_kind(&kind);
                let inner = self.resolve(&inner);
                Type::borrow(access, kind, inner)
            }
        }
    }

    /// Link an unbound kind variable to a kind. Used by the solver when a
    /// variable's feasible window pins it or simplification compresses it.
    pub(crate) fn link_kind_var(&mut self, var: KindVarId, kind: Kind) {
        debug_assert!(
            matches!(self.kind_var_state(var), KindVarState::Unbound { .. }),
            "kind cell linked twice"
        );
        self.kind_vars.insert(var, KindVarState::Link(kind));
    }

    // -- Level adjustment --

    /// Lower the level of a kind's unbound variable to at most `limit`.
    fn adjust_kind_level(&mut self, limit: u32, kind: &Kind) {
        if let Kind::Var(v) = self.resolve_kind(kind)
            && let Some(level) = self.kind_var_level(v)
            && level > limit
        {
            self.kind_vars
                .insert(v, KindVarState::Unbound { level: limit });
        }
    }

    /// Combined occurs check and level adjustment before linking `var` to
    /// `ty`: fails on a cycle, otherwise lowers every unbound variable in
    /// `ty` (types and kinds alike) to at most `limit`.
    fn occurs_adjust(&mut self, var: TypeVarId, limit: u32, ty: &Type) -> Result<(), InferError> {
        let head = self.shorten(ty);
        match head {
            Type::Var(v) => {
                if v == var {
                    self.push_step(
                        trace::UnifyAction::OccursCheck,
                        format!("?t{}", var.0),
                        self.display_for_trace(ty),
                        "occurs check fired, infinite type prevented".into(),
                    );
                    return Err(InferError::RecursiveType);
                }
                if let Some(level) = self.type_var_unbound_level(v)
                    && level > limit
                {
                    self.type_vars
                        .insert(v, TypeVarState::Unbound { level: limit });
                }
                let kind = self
                    .type_var_kinds
                    .get(&v)
                    .expect("type variable registered with a kind")
                    .clone();
                self.adjust_kind_level(limit, &kind);
                Ok(())
            }
            Type::GenericVar(v) => Err(InferError::AlreadyGeneralised {
                term: Type::GenericVar(v).to_string(),
            }),
            Type::App(_, args) | Type::Tuple(args) => {
                for arg in &args {
                    self.occurs_adjust(var, limit, arg)?;
                }
                Ok(())
            }
            Type::Arrow(param, kind, result) => {
                self.adjust_kind_level(limit, &kind);
                self.occurs_adjust(var, limit, &param)?;
                self.occurs_adjust(var, limit, &result)
            }
            Type::Borrow(_, kind, inner) => {
                self.adjust_kind_level(limit, &kind);
                self.occurs_adjust(var, limit, &inner)
            }
        }
    }

    /// Lower every unbound variable reachable from `ty` (types and kinds
    /// alike) to at most `limit`.
    ///
    /// Used when a monomorphic binding is published to the top-level
    /// environment: its leftover variables become weak — owned by no
    /// scope, never quantified by a later declaration.
    pub fn demote_to_level(&mut self, ty: &Type, limit: u32) {
        let head = self.shorten(ty);
        match head {
            Type::Var(v) => {
                if let Some(level) = self.type_var_unbound_level(v)
                    && level > limit
                {
                    self.type_vars
                        .insert(v, TypeVarState::Unbound { level: limit });
                }
                let kind = self
                    .type_var_kinds
                    .get(&v)
                    .expect("type variable registered with a kind")
                    .clone();
                self.adjust_kind_level(limit, &kind);
            }
            Type::GenericVar(_) => {}
            Type::App(_, args) | Type::Tuple(args) => {
                for arg in &args {
                    self.demote_to_level(arg, limit);
                }
            }
            Type::Arrow(param, kind, result) => {
                self.adjust_kind_level(limit, &kind);
                self.demote_to_level(&param, limit);
                self.demote_to_level(&result, limit);
            }
            Type::Borrow(_, kind, inner) => {
                self.adjust_kind_level(limit, &kind);
                self.demote_to_level(&inner, limit);
            }
        }
    }

    // -- Kind unification --

    /// Unify two kinds by linking: equal forms are a no-op, a variable on
    /// either side links to the other (after lowering its levels), and
    /// two distinct constants fail.
    pub fn unify_kind(&mut self, lhs: &Kind, rhs: &Kind) -> Result<(), InferError> {
        let lhs = self.resolve_kind(lhs);
        let rhs = self.resolve_kind(rhs);
        if lhs == rhs {
            return Ok(());
        }
        match (&lhs, &rhs) {
            (Kind::GenericVar(v), _) | (_, Kind::GenericVar(v)) => {
                Err(InferError::AlreadyGeneralised {
                    term: Kind::GenericVar(*v).to_string(),
                })
            }
            (Kind::Var(v), other) | (other, Kind::Var(v)) => {
                let level = self
                    .kind_var_level(*v)
                    .expect("resolved kind variable is unbound");
                self.adjust_kind_level(level, other);
                self.push_step(
                    trace::UnifyAction::BindKind,
                    lhs.to_string(),
                    rhs.to_string(),
                    format!("?k{} := {other}", v.0),
                );
                self.kind_vars
                    .insert(*v, KindVarState::Link(other.clone()));
                Ok(())
            }
            (Kind::Const(_), Kind::Const(_)) => {
                self.push_step(
                    trace::UnifyAction::Error,
                    lhs.to_string(),
                    rhs.to_string(),
                    "distinct kind constants".into(),
                );
                Err(InferError::KindMismatch {
                    left: lhs.clone(),
                    right: rhs.clone(),
                })
            }
        }
    }

    // -- Type unification --

    /// Unify two types, discharging equalities into the link tables and
    /// emitting the residual kind constraints into `out`.
    pub fn unify(
        &mut self,
        expected: &Type,
        actual: &Type,
        env: &Env,
        provenance: &Provenance,
        out: &mut ConstraintSet,
    ) -> Result<(), InferError> {
        let expected = self.shorten(expected);
        let actual = self.shorten(actual);

        match (&expected, &actual) {
            (Type::Var(a), Type::Var(b)) if a == b => {
                self.push_step(
                    trace::UnifyAction::Identity,
                    self.display_for_trace(&expected),
                    self.display_for_trace(&actual),
                    "same unification variable".into(),
                );
                Ok(())
            }

            (Type::GenericVar(v), _) | (_, Type::GenericVar(v)) => {
                Err(InferError::AlreadyGeneralised {
                    term: Type::GenericVar(*v).to_string(),
                })
            }

            (Type::Var(v), other) | (other, Type::Var(v)) => {
                self.bind_type_var(*v, other, env, provenance, out)
            }

            (Type::App(c1, args1), Type::App(c2, args2))
                if c1 == c2 && args1.len() == args2.len() =>
            {
                self.push_step(
                    trace::UnifyAction::Decompose,
                    self.display_for_trace(&expected),
                    self.display_for_trace(&actual),
                    format!("decompose `{c1}` applications"),
                );
                for (a, b) in args1.iter().zip(args2.iter()) {
                    self.unify(a, b, env, provenance, out)?;
                }
                Ok(())
            }

            (Type::Tuple(items1), Type::Tuple(items2)) if items1.len() == items2.len() => {
                self.push_step(
                    trace::UnifyAction::Decompose,
                    self.display_for_trace(&expected),
                    self.display_for_trace(&actual),
                    "decompose tuples".into(),
                );
                for (a, b) in items1.iter().zip(items2.iter()) {
                    self.unify(a, b, env, provenance, out)?;
                }
                Ok(())
            }

            (Type::Arrow(p1, k1, r1), Type::Arrow(p2, k2, r2)) => {
                self.push_step(
                    trace::UnifyAction::Decompose,
                    self.display_for_trace(&expected),
                    self.display_for_trace(&actual),
                    "decompose arrows, contravariant parameter".into(),
                );
                self.unify_kind(k1, k2)?;
                self.unify(p2, p1, env, provenance, out)?;
                self.unify(r1, r2, env, provenance, out)
            }

            (Type::Borrow(b1, k1, t1), Type::Borrow(b2, k2, t2)) if b1 == b2 => {
                self.push_step(
                    trace::UnifyAction::KindOrder,
                    self.display_for_trace(&expected),
                    self.display_for_trace(&actual),
                    "borrow kinds equated by double inequality".into(),
                );
                out.push(Constraint::KindLeq {
                    lhs: k1.clone(),
                    rhs: k2.clone(),
                    provenance: Provenance::new(provenance.span, Reason::BorrowPayload),
                });
                out.push(Constraint::KindLeq {
                    lhs: k2.clone(),
                    rhs: k1.clone(),
                    provenance: Provenance::new(provenance.span, Reason::BorrowPayload),
                });
                self.unify(t1, t2, env, provenance, out)
            }

            _ => {
                self.push_step(
                    trace::UnifyAction::Error,
                    self.display_for_trace(&expected),
                    self.display_for_trace(&actual),
                    "incompatible type shapes".into(),
                );
                let left = self.resolve(&expected);
                let right = self.resolve(&actual);
                Err(InferError::TypeMismatch { left, right })
            }
        }
    }

    fn bind_type_var(
        &mut self,
        var: TypeVarId,
        ty: &Type,
        env: &Env,
        provenance: &Provenance,
        out: &mut ConstraintSet,
    ) -> Result<(), InferError> {
        let limit = self.type_var_level(var);
        self.occurs_adjust(var, limit, ty)?;

        // The solved variable and its solution must agree on kind.
        let var_kind = self
            .type_var_kinds
            .get(&var)
            .expect("type variable registered with a kind")
            .clone();
        let ty_kind = self.kind_of(env, ty, provenance, out)?;
        let binding_prov = Provenance::new(provenance.span, Reason::VarBinding);
        out.push(Constraint::KindLeq {
            lhs: var_kind.clone(),
            rhs: ty_kind.clone(),
            provenance: binding_prov.clone(),
        });
        out.push(Constraint::KindLeq {
            lhs: ty_kind,
            rhs: var_kind,
            provenance: binding_prov,
        });

        self.push_step(
            trace::UnifyAction::Bind,
            format!("?t{}", var.0),
            self.display_for_trace(ty),
            format!("?t{} := {}", var.0, self.display_for_trace(ty)),
        );
        self.type_vars.insert(var, TypeVarState::Link(ty.clone()));
        Ok(())
    }

    // -- Kind synthesis --

    /// Synthesise the kind of a type term, emitting any constraints that
    /// the synthesis incurs.
    pub fn kind_of(
        &mut self,
        env: &Env,
        ty: &Type,
        provenance: &Provenance,
        out: &mut ConstraintSet,
    ) -> Result<Kind, InferError> {
        let head = self.shorten(ty);
        match head {
            Type::Var(v) => Ok(self.kind_of_var(v)),
            Type::GenericVar(v) => Err(InferError::AlreadyGeneralised {
                term: Type::GenericVar(v).to_string(),
            }),
            Type::App(name, args) => {
                let scheme = env.find_type(&name)?.clone();
                if scheme.arity() != args.len() {
                    return Err(InferError::ArityMismatch {
                        expected: scheme.arity(),
                        actual: args.len(),
                    });
                }
                let (params, result) = self.instantiate_kind_scheme(&scheme, provenance, out);
                for (param, arg) in params.iter().zip(args.iter()) {
                    let arg_kind = self.kind_of(env, arg, provenance, out)?;
                    self.unify_kind(param, &arg_kind)?;
                }
                Ok(result)
            }
            Type::Tuple(items) => {
                // A tuple is as restricted as its most restricted component.
                let tuple_kind = self.fresh_kind();
                for item in &items {
                    let item_kind = self.kind_of(env, item, provenance, out)?;
                    out.push(Constraint::KindLeq {
                        lhs: item_kind,
                        rhs: tuple_kind.clone(),
                        provenance: Provenance::new(provenance.span, Reason::TupleKind),
                    });
                }
                Ok(tuple_kind)
            }
            Type::Arrow(_, kind, _) => Ok(self.resolve_kind(&kind)),
            Type::Borrow(_, kind, _) => Ok(self.resolve_kind(&kind)),
        }
    }

    /// Instantiate a kind scheme with fresh kind variables, re-emitting
    /// its constraint. Arity is the caller's responsibility.
    pub(crate) fn instantiate_kind_scheme(
        &mut self,
        scheme: &KindScheme,
        provenance: &Provenance,
        out: &mut ConstraintSet,
    ) -> (Vec<Kind>, Kind) {
        let mut mapping = BTreeMap::new();
        for kv in &scheme.kind_vars {
            mapping.insert(*kv, self.fresh_kind());
        }
        for bound in &scheme.constraint {
            out.push(Constraint::KindLeq {
                lhs: subst_generic_kind(&bound.lhs, &mapping),
                rhs: subst_generic_kind(&bound.rhs, &mapping),
                provenance: Provenance::new(provenance.span, Reason::Instantiation),
            });
        }
        let params = scheme
            .params
            .iter()
            .map(|p| subst_generic_kind(p, &mapping))
            .collect();
        let result = subst_generic_kind(&scheme.result, &mapping);
        (params, result)
    }

    fn display_for_trace(&self, ty: &Type) -> String {
        ty.to_string()
    }
}

impl Default for Unifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace generic kind variables according to an instantiation table.
pub(crate) fn subst_generic_kind(kind: &Kind, mapping: &BTreeMap<KindVarId, Kind>) -> Kind {
    match kind {
        Kind::GenericVar(v) => mapping
            .get(v)
            .expect("kind scheme quantifies every generic kind variable")
            .clone(),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Inference context: fresh variable generation and constraint collection
// ---------------------------------------------------------------------------

/// Owns the unifier, the pending constraints, and the canonical residue
/// of the constraints already normalised.
pub struct InferenceContext {
    pub unifier: Unifier,
    constraints: ConstraintSet,
    /// Canonical kind inequalities surviving previous normalisations.
    normalized: Vec<Constraint>,
}

impl InferenceContext {
    pub fn new() -> Self {
        Self {
            unifier: Unifier::new(),
            constraints: ConstraintSet::new(),
            normalized: Vec::new(),
        }
    }

    /// Create with deterministic variable ID offsets (for tests).
    pub fn with_var_offsets(type_offset: u32, kind_offset: u32) -> Self {
        Self {
            unifier: Unifier::with_var_offsets(type_offset, kind_offset),
            constraints: ConstraintSet::new(),
            normalized: Vec::new(),
        }
    }

    pub fn fresh_type(&mut self) -> Type {
        self.unifier.fresh_type()
    }

    pub fn fresh_kind(&mut self) -> Kind {
        self.unifier.fresh_kind()
    }

    /// Record that two types must be equal; discharged at the next
    /// normalisation boundary.
    pub fn require_equal(&mut self, expected: &Type, actual: &Type, provenance: Provenance) {
        self.constraints.push(Constraint::TypeEqual {
            expected: expected.clone(),
            actual: actual.clone(),
            provenance,
        });
    }

    /// Record a kind inequality.
    pub fn require_leq(&mut self, lhs: Kind, rhs: Kind, provenance: Provenance) {
        self.constraints.push(Constraint::KindLeq {
            lhs,
            rhs,
            provenance,
        });
    }

    pub(crate) fn constraints_mut(&mut self) -> &mut ConstraintSet {
        &mut self.constraints
    }

    /// Synthesise a type's kind, collecting incurred constraints.
    pub fn kind_of(
        &mut self,
        env: &Env,
        ty: &Type,
        provenance: &Provenance,
    ) -> Result<Kind, InferError> {
        let Self {
            unifier,
            constraints,
            ..
        } = self;
        unifier.kind_of(env, ty, provenance, constraints)
    }

    /// Drop constraints left pending by an aborted declaration.
    ///
    /// Mutated cells are not rolled back; the canonical residue of
    /// previously normalised declarations is kept.
    pub fn discard_pending(&mut self) {
        self.constraints.drain();
    }

    /// The canonical constraint residue as plain kind bounds.
    pub fn residue(&mut self) -> Vec<affe_types::KindBound> {
        let items = self.normalized.clone();
        let mut out = Vec::new();
        for item in &items {
            if let Constraint::KindLeq { lhs, rhs, .. } = item {
                out.push(affe_types::KindBound::new(
                    self.unifier.resolve_kind(lhs),
                    self.unifier.resolve_kind(rhs),
                ));
            }
        }
        out
    }

    /// Discharge pending equalities into the unifier and re-solve the
    /// kind constraints to canonical form.
    ///
    /// Called at every inference-step boundary so constraints stay small
    /// and errors surface at the earliest point.
    pub fn normalize(&mut self, env: &Env) -> Result<(), InferError> {
        let mut kind_constraints = std::mem::take(&mut self.normalized);
        while !self.constraints.is_empty() {
            let pending = self.constraints.drain();
            for constraint in pending {
                match constraint {
                    Constraint::TypeEqual {
                        expected,
                        actual,
                        provenance,
                    } => {
                        self.unifier.unify(
                            &expected,
                            &actual,
                            env,
                            &provenance,
                            &mut self.constraints,
                        )?;
                    }
                    kind_leq @ Constraint::KindLeq { .. } => kind_constraints.push(kind_leq),
                }
            }
        }
        self.normalized = solve::solve(&mut self.unifier, kind_constraints, None)?;
        Ok(())
    }

    /// Re-solve with simplification enabled; used by the generaliser.
    pub(crate) fn normalize_for_generalisation(
        &mut self,
        env: &Env,
        options: &solve::SimplifyOptions,
    ) -> Result<(), InferError> {
        self.normalize(env)?;
        let kind_constraints = std::mem::take(&mut self.normalized);
        self.normalized = solve::solve(&mut self.unifier, kind_constraints, Some(options))?;
        Ok(())
    }

    /// Take the canonical constraints for partitioning; the caller puts
    /// the non-embedded remainder back via `restore_normalized`.
    pub(crate) fn take_normalized(&mut self) -> Vec<Constraint> {
        std::mem::take(&mut self.normalized)
    }

    pub(crate) fn restore_normalized(&mut self, remaining: Vec<Constraint>) {
        self.normalized = remaining;
    }
}

impl Default for InferenceContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod prop_tests;
#[cfg(test)]
mod typeck_tests;
