//! Tracing types for checker observability.
//!
//! These types capture step-by-step traces of unification, enabling
//! external tools to expose the checker's reasoning process. All tracing
//! is opt-in via `Unifier::enable_tracing()` — zero overhead when
//! disabled.

use serde::Serialize;

/// A single step in a unification trace.
#[derive(Debug, Clone, Serialize)]
pub struct UnifyStep {
    pub step: usize,
    pub action: UnifyAction,
    pub left: String,
    pub right: String,
    pub detail: String,
}

/// What action was taken during a unification step.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnifyAction {
    /// Terms are already identical — no-op.
    Identity,
    /// Structural recursion: decompose compound types.
    Decompose,
    /// Type variable linked to a type (e.g. ?t0 := int).
    Bind,
    /// Kind variable linked to a kind (e.g. ?k0 := lin).
    BindKind,
    /// A kind inequality was emitted instead of an immediate link.
    KindOrder,
    /// Occurs check fired — infinite type prevented.
    OccursCheck,
    /// Unification failed.
    Error,
}
