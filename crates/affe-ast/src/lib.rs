//! AST node definitions and source spans for Affe.
//!
//! This crate defines the renamed surface syntax consumed by the type
//! checker. Every expression and pattern carries a [`Span`]; names are
//! produced by the renamer (or a [`NameSupply`] in tests) and compare by
//! their unique tag, never by spelling.

use std::collections::BTreeSet;
use std::fmt;

/// Identifies a source file in the checking session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u32);

/// A byte offset range within a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Span {
    pub file: FileId,
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(file: FileId, start: u32, end: u32) -> Self {
        Self { file, start, end }
    }

    /// Create a span that covers both `self` and `other`.
    pub fn merge(self, other: Span) -> Span {
        debug_assert_eq!(
            self.file, other.file,
            "cannot merge spans from different files"
        );
        Span {
            file: self.file,
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// A synthetic span for checker-generated nodes.
    pub fn synthetic() -> Self {
        Self {
            file: FileId(u32::MAX),
            start: 0,
            end: 0,
        }
    }
}

/// A value paired with its source location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Self { node, span }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Spanned<U> {
        Spanned {
            node: f(self.node),
            span: self.span,
        }
    }
}

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

/// A renamed identifier: a printable label plus a globally unique tag.
///
/// Equality, ordering, and hashing all go through the tag alone, so two
/// distinct binders spelled the same never collide. The renamer is the only
/// producer of tags in production; tests mint names from a [`NameSupply`].
#[derive(Debug, Clone)]
pub struct Name {
    pub text: String,
    pub tag: u32,
}

impl Name {
    pub fn new(text: impl Into<String>, tag: u32) -> Self {
        Self {
            text: text.into(),
            tag,
        }
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag
    }
}

impl Eq for Name {}

impl PartialOrd for Name {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Name {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.tag.cmp(&other.tag)
    }
}

impl std::hash::Hash for Name {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.tag.hash(state);
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

/// Mints tag-unique names.
///
/// Stands in for the renamer at the harness seam: the checker itself never
/// invents source names, but tests and builtins need a producer.
#[derive(Debug, Default)]
pub struct NameSupply {
    next: u32,
}

impl NameSupply {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self, text: impl Into<String>) -> Name {
        let tag = self.next;
        self.next += 1;
        Name::new(text, tag)
    }
}

// ---------------------------------------------------------------------------
// Literals and borrow flavours
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Lit {
    Int(i64),
    Bool(bool),
    String(String),
    Unit,
}

/// How a borrow accesses the borrowed value.
///
/// `Read` borrows (`&x`) may be shared; `Write` borrows (`&!x`) are
/// exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Access {
    Read,
    Write,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => write!(f, "&"),
            Access::Write => write!(f, "&!"),
        }
    }
}

/// Whether a `let` binding may refer to itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecFlag {
    NonRec,
    Rec,
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

pub type Expr = Spanned<ExprKind>;

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// Literal value.
    Lit(Lit),

    /// Variable reference.
    Var(Name),

    /// Borrow of a variable: `&x` or `&!x`.
    Borrow(Access, Name),

    /// Reborrow through an exclusive borrow: `&&x` or `&!&x`.
    ///
    /// The named variable must itself hold a write borrow.
    Reborrow(Access, Name),

    /// Lambda: `fun p -> body`.
    Lambda(Pattern, Box<Expr>),

    /// Application: `f a1 .. an`.
    App(Box<Expr>, Vec<Expr>),

    /// Saturated constructor application: `C (a1, .., an)`.
    ///
    /// Distinguished from [`ExprKind::App`] by the renamer so the value
    /// restriction can treat constructor payloads as non-expansive.
    Construct(Name, Vec<Expr>),

    /// Tuple: `(a, b, ..)`.
    Tuple(Vec<Expr>),

    /// Array literal: `[| a; b; .. |]`.
    Array(Vec<Expr>),

    /// Let binding: `let p = value in body`, possibly recursive.
    Let {
        rec: RecFlag,
        pattern: Pattern,
        value: Box<Expr>,
        body: Box<Expr>,
    },

    /// Match: `match e with arms` or `match& e with arms`.
    ///
    /// A borrow modifier matches the scrutinee through a borrow, binding
    /// pattern components as borrows rather than owned values.
    Match {
        borrow: Option<Access>,
        scrutinee: Box<Expr>,
        arms: Vec<Arm>,
    },

    /// Region block delimiting the scope of borrows of `names`.
    Region { names: Vec<Name>, body: Box<Expr> },
}

/// One arm of a match expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Arm {
    pub pattern: Pattern,
    pub body: Expr,
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

pub type Pattern = Spanned<PatternKind>;

#[derive(Debug, Clone, PartialEq)]
pub enum PatternKind {
    /// `_`
    Wildcard,
    /// Binds a variable.
    Var(Name),
    /// `(p, q, ..)`
    Tuple(Vec<Pattern>),
    /// `C (p, .., q)`
    Constructor(Name, Vec<Pattern>),
}

impl PatternKind {
    /// Every name bound by this pattern, in left-to-right order.
    pub fn bound_names(&self) -> Vec<Name> {
        let mut names = Vec::new();
        self.collect_bound(&mut names);
        names
    }

    fn collect_bound(&self, out: &mut Vec<Name>) {
        match self {
            PatternKind::Wildcard => {}
            PatternKind::Var(name) => out.push(name.clone()),
            PatternKind::Tuple(items) => {
                for item in items {
                    item.node.collect_bound(out);
                }
            }
            PatternKind::Constructor(_, args) => {
                for arg in args {
                    arg.node.collect_bound(out);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Syntactic classifications
// ---------------------------------------------------------------------------

/// The value restriction's syntactic test: is `expr` guaranteed not to
/// allocate mutable state when evaluated?
///
/// Only non-expansive right-hand sides of `let` bindings may be
/// generalised. Applications and non-empty array literals are expansive;
/// everything built from constants, variables, borrows, lambdas, and
/// non-expansive parts is not.
pub fn is_nonexpansive(expr: &Expr) -> bool {
    match &expr.node {
        ExprKind::Lit(_)
        | ExprKind::Var(_)
        | ExprKind::Borrow(..)
        | ExprKind::Reborrow(..)
        | ExprKind::Lambda(..) => true,
        ExprKind::App(..) => false,
        ExprKind::Construct(_, args) | ExprKind::Tuple(args) => {
            args.iter().all(is_nonexpansive)
        }
        ExprKind::Array(items) => items.is_empty(),
        ExprKind::Let { value, body, .. } => is_nonexpansive(value) && is_nonexpansive(body),
        ExprKind::Match {
            scrutinee, arms, ..
        } => is_nonexpansive(scrutinee) && arms.iter().all(|arm| is_nonexpansive(&arm.body)),
        ExprKind::Region { body, .. } => is_nonexpansive(body),
    }
}

/// Collect the free value names of an expression.
pub fn free_names(expr: &Expr) -> BTreeSet<Name> {
    let mut free = BTreeSet::new();
    collect_free(expr, &mut BTreeSet::new(), &mut free);
    free
}

fn collect_free(expr: &Expr, bound: &mut BTreeSet<Name>, free: &mut BTreeSet<Name>) {
    match &expr.node {
        ExprKind::Lit(_) => {}
        ExprKind::Var(name) | ExprKind::Borrow(_, name) | ExprKind::Reborrow(_, name) => {
            if !bound.contains(name) {
                free.insert(name.clone());
            }
        }
        ExprKind::Lambda(pattern, body) => {
            scoped(bound, &pattern.node.bound_names(), |bound| {
                collect_free(body, bound, free);
            });
        }
        ExprKind::App(func, args) => {
            collect_free(func, bound, free);
            for arg in args {
                collect_free(arg, bound, free);
            }
        }
        ExprKind::Construct(_, args) | ExprKind::Tuple(args) | ExprKind::Array(args) => {
            for arg in args {
                collect_free(arg, bound, free);
            }
        }
        ExprKind::Let {
            rec,
            pattern,
            value,
            body,
        } => {
            let binders = pattern.node.bound_names();
            match rec {
                RecFlag::NonRec => {
                    collect_free(value, bound, free);
                    scoped(bound, &binders, |bound| collect_free(body, bound, free));
                }
                RecFlag::Rec => scoped(bound, &binders, |bound| {
                    collect_free(value, bound, free);
                    collect_free(body, bound, free);
                }),
            }
        }
        ExprKind::Match {
            scrutinee, arms, ..
        } => {
            collect_free(scrutinee, bound, free);
            for arm in arms {
                scoped(bound, &arm.pattern.node.bound_names(), |bound| {
                    collect_free(&arm.body, bound, free);
                });
            }
        }
        ExprKind::Region { body, .. } => collect_free(body, bound, free),
    }
}

fn scoped(
    bound: &mut BTreeSet<Name>,
    binders: &[Name],
    f: impl FnOnce(&mut BTreeSet<Name>),
) {
    let added: Vec<Name> = binders
        .iter()
        .filter(|n| bound.insert((*n).clone()))
        .cloned()
        .collect();
    f(bound);
    for name in added {
        bound.remove(&name);
    }
}
