//! Type and kind representations for Affe.
//!
//! This crate defines the semantic types used by the inference engine. A
//! "kind" here is a usage qualifier — unrestricted, affine, or linear,
//! paired with a region — not a higher-order type kind. Types and kinds
//! both contain unification variables identified by integer ids; the state
//! of those variables (unbound at some level, or forwarded to a term)
//! lives in the unifier's side tables, not in the terms themselves.

use std::collections::BTreeSet;
use std::fmt;

use affe_ast::{Access, Name};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Unique identifier for a type unification variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeVarId(pub u32);

/// Unique identifier for a kind unification variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KindVarId(pub u32);

// ---------------------------------------------------------------------------
// Regions
// ---------------------------------------------------------------------------

/// A marker delimiting where a borrowed value may be used.
///
/// Regions are totally ordered: `Global` is everywhere, `Never` is
/// nowhere, and scope markers sit in between ordered by nesting depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Region {
    Global,
    /// An opaque marker created at a nested lexical scope.
    Scope(u32),
    Never,
}

impl Region {
    pub fn min(self, other: Region) -> Region {
        std::cmp::min(self, other)
    }

    pub fn max(self, other: Region) -> Region {
        std::cmp::max(self, other)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Global => write!(f, "global"),
            Region::Scope(depth) => write!(f, "'r{depth}"),
            Region::Never => write!(f, "never"),
        }
    }
}

// ---------------------------------------------------------------------------
// Usage qualifiers and the kind lattice
// ---------------------------------------------------------------------------

/// How often a value may be used: arbitrarily, at most once, exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Usage {
    Un,
    Aff,
    Lin,
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Usage::Un => write!(f, "un"),
            Usage::Aff => write!(f, "aff"),
            Usage::Lin => write!(f, "lin"),
        }
    }
}

/// A constant point of the kind lattice: a usage qualifier at a region.
///
/// The order is the product order of the usage chain and the region
/// chain. `un@global` is the unique bottom, `lin@never` the unique top.
/// The product order is partial, so this type deliberately does not
/// implement `Ord`; use [`KindConst::leq`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KindConst {
    pub usage: Usage,
    pub region: Region,
}

impl KindConst {
    pub const BOTTOM: KindConst = KindConst {
        usage: Usage::Un,
        region: Region::Global,
    };

    pub const TOP: KindConst = KindConst {
        usage: Usage::Lin,
        region: Region::Never,
    };

    pub fn new(usage: Usage, region: Region) -> Self {
        Self { usage, region }
    }

    /// Lattice order: both components must be ordered the same way.
    pub fn leq(self, other: KindConst) -> bool {
        self.usage <= other.usage && self.region <= other.region
    }

    /// Least upper bound.
    pub fn lub(self, other: KindConst) -> KindConst {
        KindConst {
            usage: self.usage.max(other.usage),
            region: self.region.max(other.region),
        }
    }

    /// Greatest lower bound.
    pub fn glb(self, other: KindConst) -> KindConst {
        KindConst {
            usage: self.usage.min(other.usage),
            region: self.region.min(other.region),
        }
    }
}

impl fmt::Display for KindConst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.region == Region::Global {
            write!(f, "{}", self.usage)
        } else {
            write!(f, "{}@{}", self.usage, self.region)
        }
    }
}

/// A usage kind: a lattice constant, or a variable.
///
/// `Var` is a unification variable whose `Unbound`/`Link` state the
/// unifier tracks by id. `GenericVar` is the immutable quantified form
/// that only appears inside scheme bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
    Const(KindConst),
    Var(KindVarId),
    GenericVar(KindVarId),
}

impl Kind {
    pub fn un(region: Region) -> Kind {
        Kind::Const(KindConst::new(Usage::Un, region))
    }

    pub fn aff(region: Region) -> Kind {
        Kind::Const(KindConst::new(Usage::Aff, region))
    }

    pub fn lin(region: Region) -> Kind {
        Kind::Const(KindConst::new(Usage::Lin, region))
    }

    pub fn as_const(&self) -> Option<KindConst> {
        match self {
            Kind::Const(c) => Some(*c),
            _ => None,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Const(c) => write!(f, "{c}"),
            Kind::Var(v) => write!(f, "?k{}", v.0),
            Kind::GenericVar(v) => write!(f, "k{}", v.0),
        }
    }
}

/// An inequality between two kinds, the only constraint form that
/// survives normalisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindBound {
    pub lhs: Kind,
    pub rhs: Kind,
}

impl KindBound {
    pub fn new(lhs: Kind, rhs: Kind) -> Self {
        Self { lhs, rhs }
    }
}

impl fmt::Display for KindBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <= {}", self.lhs, self.rhs)
    }
}

// ---------------------------------------------------------------------------
// Variance
// ---------------------------------------------------------------------------

/// Polarity of an occurrence, used to direct constraint simplification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variance {
    Pos,
    Neg,
    Invar,
}

impl Variance {
    /// Flip under a contravariant position.
    pub fn flip(self) -> Variance {
        match self {
            Variance::Pos => Variance::Neg,
            Variance::Neg => Variance::Pos,
            Variance::Invar => Variance::Invar,
        }
    }

    /// Join two occurrences of the same variable.
    pub fn combine(self, other: Variance) -> Variance {
        if self == other { self } else { Variance::Invar }
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A semantic type in Affe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    /// Quantified variable; appears only inside scheme bodies.
    GenericVar(TypeVarId),
    /// Unification variable; state tracked by the unifier.
    Var(TypeVarId),
    /// Named type constructor applied to arguments: `array(a)`.
    App(Name, Vec<Type>),
    /// `(a, b, ..)`
    Tuple(Vec<Type>),
    /// `a -{k}> b` — the kind is the arrow's residual-use kind.
    Arrow(Box<Type>, Kind, Box<Type>),
    /// `&{k}(a)` or `&!{k}(a)` — a borrow at its own kind.
    Borrow(Access, Kind, Box<Type>),
}

impl Type {
    pub fn arrow(param: Type, kind: Kind, result: Type) -> Type {
        Type::Arrow(Box::new(param), kind, Box::new(result))
    }

    pub fn borrow(access: Access, kind: Kind, inner: Type) -> Type {
        Type::Borrow(access, kind, Box::new(inner))
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::GenericVar(v) => write!(f, "'t{}", v.0),
            Type::Var(v) => write!(f, "?t{}", v.0),
            Type::App(name, args) => {
                write!(f, "{name}")?;
                if !args.is_empty() {
                    write!(f, "(")?;
                    for (i, arg) in args.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{arg}")?;
                    }
                    write!(f, ")")?;
                }
                Ok(())
            }
            Type::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Type::Arrow(param, kind, result) => {
                match param.as_ref() {
                    arrow @ Type::Arrow(..) => write!(f, "({arrow})")?,
                    other => write!(f, "{other}")?,
                }
                write!(f, " -{{{kind}}}> {result}")
            }
            Type::Borrow(access, kind, inner) => write!(f, "{access}{{{kind}}}({inner})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Schemes
// ---------------------------------------------------------------------------

/// A closed, re-instantiable type: quantified kind variables, quantified
/// type variables each carrying its kind, a normalised constraint over the
/// quantified kinds, and a tree-form body.
///
/// Schemes are constructed only by the generaliser. Their bodies contain
/// `GenericVar` forms exclusively; a unification variable inside a scheme
/// body is a bug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeScheme {
    pub kind_vars: Vec<KindVarId>,
    /// Quantified type variables in order of first occurrence, each with
    /// its (generic or constant) kind.
    pub type_vars: Vec<(TypeVarId, Kind)>,
    pub constraint: Vec<KindBound>,
    pub ty: Type,
}

impl TypeScheme {
    /// A scheme with no quantification, used where the value restriction
    /// forbids generalisation.
    pub fn mono(ty: Type) -> Self {
        Self {
            kind_vars: Vec::new(),
            type_vars: Vec::new(),
            constraint: Vec::new(),
            ty,
        }
    }

    pub fn is_mono(&self) -> bool {
        self.kind_vars.is_empty() && self.type_vars.is_empty()
    }
}

impl fmt::Display for TypeScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_mono() {
            write!(f, "forall")?;
            for kv in &self.kind_vars {
                write!(f, " k{}", kv.0)?;
            }
            for (tv, kind) in &self.type_vars {
                write!(f, " ('t{} : {kind})", tv.0)?;
            }
            write!(f, ". ")?;
        }
        for bound in &self.constraint {
            write!(f, "{bound} => ")?;
        }
        write!(f, "{}", self.ty)
    }
}

/// The kind signature of a type constructor: quantified kind variables, a
/// constraint, one kind per parameter with its declared variance, and the
/// kind of the constructed type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindScheme {
    pub kind_vars: Vec<KindVarId>,
    pub constraint: Vec<KindBound>,
    pub params: Vec<Kind>,
    /// Declared variance of each parameter; `Invar` when undeclared.
    pub variance: Vec<Variance>,
    pub result: Kind,
}

impl KindScheme {
    /// A nullary constructor at a fixed kind.
    pub fn constant(result: KindConst) -> Self {
        Self {
            kind_vars: Vec::new(),
            constraint: Vec::new(),
            params: Vec::new(),
            variance: Vec::new(),
            result: Kind::Const(result),
        }
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

impl fmt::Display for KindScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.kind_vars.is_empty() {
            write!(f, "forall")?;
            for kv in &self.kind_vars {
                write!(f, " k{}", kv.0)?;
            }
            write!(f, ". ")?;
        }
        for bound in &self.constraint {
            write!(f, "{bound} => ")?;
        }
        write!(f, "(")?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, ") -> {}", self.result)
    }
}

// ---------------------------------------------------------------------------
// Free variable computation
// ---------------------------------------------------------------------------

/// Collect the free (unification) type variables of a type.
///
/// The walk does not see through links; resolve the type against the
/// unifier first when link chains may be present.
pub fn free_type_vars(ty: &Type) -> BTreeSet<TypeVarId> {
    let mut vars = BTreeSet::new();
    collect_type_vars(ty, &mut vars);
    vars
}

fn collect_type_vars(ty: &Type, vars: &mut BTreeSet<TypeVarId>) {
    match ty {
        Type::Var(v) => {
            vars.insert(*v);
        }
        Type::GenericVar(_) => {}
        Type::App(_, args) | Type::Tuple(args) => {
            for arg in args {
                collect_type_vars(arg, vars);
            }
        }
        Type::Arrow(param, _, result) => {
            collect_type_vars(param, vars);
            collect_type_vars(result, vars);
        }
        Type::Borrow(_, _, inner) => collect_type_vars(inner, vars),
    }
}

/// Collect the free kind variables syntactically present in a type (arrow
/// and borrow kinds). Kinds attached to type variables live in the
/// unifier and are not visible here.
pub fn free_kind_vars(ty: &Type) -> BTreeSet<KindVarId> {
    let mut vars = BTreeSet::new();
    collect_kind_vars(ty, &mut vars);
    vars
}

fn collect_kind_vars(ty: &Type, vars: &mut BTreeSet<KindVarId>) {
    match ty {
        Type::Var(_) | Type::GenericVar(_) => {}
        Type::App(_, args) | Type::Tuple(args) => {
            for arg in args {
                collect_kind_vars(arg, vars);
            }
        }
        Type::Arrow(param, kind, result) => {
            kind_vars_of(kind, vars);
            collect_kind_vars(param, vars);
            collect_kind_vars(result, vars);
        }
        Type::Borrow(_, kind, inner) => {
            kind_vars_of(kind, vars);
            collect_kind_vars(inner, vars);
        }
    }
}

/// The free kind variables of a single kind term.
pub fn kind_vars_of(kind: &Kind, vars: &mut BTreeSet<KindVarId>) {
    if let Kind::Var(v) = kind {
        vars.insert(*v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lattice_extremes() {
        let points = [
            KindConst::new(Usage::Un, Region::Global),
            KindConst::new(Usage::Aff, Region::Scope(3)),
            KindConst::new(Usage::Lin, Region::Never),
            KindConst::new(Usage::Un, Region::Never),
            KindConst::new(Usage::Lin, Region::Global),
        ];
        for p in points {
            assert!(KindConst::BOTTOM.leq(p));
            assert!(p.leq(KindConst::TOP));
        }
    }

    #[test]
    fn product_order_is_partial() {
        let un_never = KindConst::new(Usage::Un, Region::Never);
        let lin_global = KindConst::new(Usage::Lin, Region::Global);
        assert!(!un_never.leq(lin_global));
        assert!(!lin_global.leq(un_never));
        assert_eq!(un_never.lub(lin_global), KindConst::TOP);
        assert_eq!(un_never.glb(lin_global), KindConst::BOTTOM);
    }

    #[test]
    fn regions_order_by_depth() {
        assert!(Region::Global < Region::Scope(0));
        assert!(Region::Scope(0) < Region::Scope(1));
        assert!(Region::Scope(u32::MAX) < Region::Never);
    }

    #[test]
    fn scheme_display_lists_quantifiers() {
        let scheme = TypeScheme {
            kind_vars: vec![KindVarId(0)],
            type_vars: vec![(TypeVarId(0), Kind::GenericVar(KindVarId(0)))],
            constraint: vec![KindBound::new(
                Kind::GenericVar(KindVarId(0)),
                Kind::Const(KindConst::new(Usage::Un, Region::Never)),
            )],
            ty: Type::arrow(
                Type::GenericVar(TypeVarId(0)),
                Kind::GenericVar(KindVarId(0)),
                Type::GenericVar(TypeVarId(0)),
            ),
        };
        let shown = scheme.to_string();
        assert!(shown.starts_with("forall k0 ('t0 : k0)."));
        assert!(shown.contains("k0 <= un@never =>"));
        assert!(shown.ends_with("'t0 -{k0}> 't0"));
    }
}
