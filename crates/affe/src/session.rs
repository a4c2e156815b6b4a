//! The checking session: the narrow seam between the inference core and
//! its enclosing harness.
//!
//! A session owns the environment, a name supply standing in for the
//! renamer, and one long-lived inference context, so monomorphic
//! top-level bindings can share weak variables across declarations. The
//! first failure aborts the declaration at hand; the session renders it
//! into a diagnostic with the declaration's location and keeps going
//! with the next declaration.

use affe_ast::{Expr, Name, NameSupply, RecFlag, Span};
use affe_diag::{Diagnostic, DiagnosticError};
use affe_infer::typeck::{Env, TypeDecl, infer_top, make_type_decl, make_type_scheme};
use affe_infer::{InferError, InferenceContext, builtins, span_to_location};
use affe_types::{Kind, KindScheme, Type, TypeScheme, TypeVarId};

pub struct Session {
    supply: NameSupply,
    ctx: InferenceContext,
    env: Env,
    diagnostics: Vec<Diagnostic>,
}

impl Session {
    pub fn new() -> Self {
        let mut supply = NameSupply::new();
        let env = builtins::initial_env(&mut supply);
        Self {
            supply,
            ctx: InferenceContext::new(),
            env,
            diagnostics: Vec::new(),
        }
    }

    pub fn supply(&mut self) -> &mut NameSupply {
        &mut self.supply
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    /// Every diagnostic reported so far, in declaration order.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// A fresh type variable for building annotation types.
    pub fn annotation_type(&mut self) -> Type {
        self.ctx.fresh_type()
    }

    /// A fresh kind variable for building annotation types.
    pub fn annotation_kind(&mut self) -> Kind {
        self.ctx.fresh_kind()
    }

    /// A fresh type parameter for a type declaration.
    pub fn type_param(&mut self) -> TypeVarId {
        self.ctx.unifier.fresh_type_var()
    }

    /// Check a top-level value declaration and bind its scheme.
    pub fn declare_value(
        &mut self,
        rec: RecFlag,
        name: &Name,
        expr: &Expr,
    ) -> Result<TypeScheme, DiagnosticError> {
        match infer_top(&mut self.ctx, &self.env, rec, name, expr) {
            Ok((_residue, env, scheme)) => {
                self.env = env;
                Ok(scheme)
            }
            Err(error) => Err(self.report(error, expr.span)),
        }
    }

    /// Introduce a type constructor and its data constructors.
    pub fn declare_type(&mut self, decl: &TypeDecl) -> Result<KindScheme, DiagnosticError> {
        match make_type_decl(&mut self.ctx, &self.env, decl) {
            Ok((env, scheme)) => {
                self.env = env;
                Ok(scheme)
            }
            Err(error) => Err(self.report(error, Span::synthetic())),
        }
    }

    /// Close a user-written annotation into a scheme and bind it.
    pub fn declare_annotation(
        &mut self,
        name: &Name,
        ty: &Type,
    ) -> Result<TypeScheme, DiagnosticError> {
        match make_type_scheme(&mut self.ctx, &self.env, name, ty) {
            Ok((env, scheme)) => {
                self.env = env;
                Ok(scheme)
            }
            Err(error) => Err(self.report(error, Span::synthetic())),
        }
    }

    fn report(&mut self, error: InferError, span: Span) -> DiagnosticError {
        // The aborted declaration may have left constraints half
        // collected; drop them so the next declaration starts clean.
        self.ctx.discard_pending();
        let diagnostic = error.into_diagnostic(span_to_location(span));
        self.diagnostics.push(diagnostic.clone());
        DiagnosticError::single(diagnostic)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
