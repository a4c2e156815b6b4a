//! Error reporting and diagnostics for Affe.
//!
//! This crate provides structured diagnostics with source location
//! tracking. Diagnostics are created by the inference crate and the
//! harness and rendered here for display; no unification variables should
//! ever leak into user-facing text.

use std::fmt;

// ---------------------------------------------------------------------------
// Diagnostic severity and categories
// ---------------------------------------------------------------------------

/// How severe a diagnostic is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Broad category for diagnostics, one per checker failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Two types failed to unify.
    TypeMismatch,
    /// Two kind constants failed to unify.
    KindMismatch,
    /// A kind variable's constant bounds crossed in the lattice.
    KindInfeasibility,
    /// Incompatible uses of one variable (e.g. a read borrow against a
    /// write borrow).
    UseMismatch,
    /// The occurs check rejected a recursive type.
    RecursiveType,
    /// Undefined variable or constructor.
    UndefinedName,
    /// Undefined type constructor.
    UndefinedType,
    /// `let rec` with a non-variable pattern.
    IllegalRecPattern,
    /// A quantified form reached a context expecting an instantiated one.
    AlreadyGeneralised,
    /// A type constructor was applied to the wrong number of arguments.
    ArityMismatch,
}

impl Category {
    pub const ALL: [Category; 10] = [
        Category::TypeMismatch,
        Category::KindMismatch,
        Category::KindInfeasibility,
        Category::UseMismatch,
        Category::RecursiveType,
        Category::UndefinedName,
        Category::UndefinedType,
        Category::IllegalRecPattern,
        Category::AlreadyGeneralised,
        Category::ArityMismatch,
    ];

    pub fn all() -> &'static [Category] {
        &Self::ALL
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::TypeMismatch => "type_mismatch",
            Category::KindMismatch => "kind_mismatch",
            Category::KindInfeasibility => "kind_infeasibility",
            Category::UseMismatch => "use_mismatch",
            Category::RecursiveType => "recursive_type",
            Category::UndefinedName => "undefined_name",
            Category::UndefinedType => "undefined_type",
            Category::IllegalRecPattern => "illegal_rec_pattern",
            Category::AlreadyGeneralised => "already_generalised",
            Category::ArityMismatch => "arity_mismatch",
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Category::TypeMismatch => "E0001",
            Category::KindMismatch => "E0002",
            Category::KindInfeasibility => "E0003",
            Category::UseMismatch => "E0004",
            Category::RecursiveType => "E0005",
            Category::UndefinedName => "E0006",
            Category::UndefinedType => "E0007",
            Category::IllegalRecPattern => "E0008",
            Category::AlreadyGeneralised => "E0009",
            Category::ArityMismatch => "E0010",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Category::TypeMismatch => "Two types could not be made equal.",
            Category::KindMismatch => "Two usage kinds could not be made equal.",
            Category::KindInfeasibility => {
                "A usage-kind variable has no value between its lower and upper bounds."
            }
            Category::UseMismatch => {
                "A variable was consumed in ways that cannot be combined."
            }
            Category::RecursiveType => "A type would have to contain itself.",
            Category::UndefinedName => "A referenced variable or constructor is undefined.",
            Category::UndefinedType => "A referenced type constructor is undefined.",
            Category::IllegalRecPattern => {
                "Recursive bindings accept only a single variable on the left."
            }
            Category::AlreadyGeneralised => {
                "A quantified variable escaped its scheme without instantiation."
            }
            Category::ArityMismatch => {
                "A type constructor was applied to the wrong number of arguments."
            }
        }
    }

    pub fn example_fix(self) -> &'static str {
        match self {
            Category::TypeMismatch => {
                "Adjust the expression so both sides have the same shape."
            }
            Category::KindMismatch => "Align the usage qualifiers of the two sides.",
            Category::KindInfeasibility => {
                "Relax a linear use or stop duplicating the restricted value."
            }
            Category::UseMismatch => {
                "Keep read and write borrows of a variable in disjoint scopes."
            }
            Category::RecursiveType => "Introduce a named type constructor for the cycle.",
            Category::UndefinedName => "Define the missing name or fix the spelling.",
            Category::UndefinedType => "Declare the type before using it.",
            Category::IllegalRecPattern => "Bind the recursive value to a plain variable.",
            Category::AlreadyGeneralised => {
                "Instantiate the scheme before unifying with its body."
            }
            Category::ArityMismatch => {
                "Apply the constructor to exactly its declared parameters."
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Source locations (independent of affe-ast's Span)
// ---------------------------------------------------------------------------

/// A source location for diagnostics.
///
/// Uses byte offsets. Callers convert from `affe-ast` spans to this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    pub file_id: u32,
    pub start: u32,
    pub end: u32,
}

// ---------------------------------------------------------------------------
// Diagnostic
// ---------------------------------------------------------------------------

/// A structured diagnostic message.
///
/// Carries the offending terms pre-rendered into the message plus optional
/// labels, so the harness can print it without reaching back into checker
/// state.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Stable diagnostic code (e.g. E0001).
    pub code: Option<String>,
    pub severity: Severity,
    pub category: Category,
    /// Primary message: what went wrong.
    pub message: String,
    /// Where it went wrong.
    pub location: Option<SourceLocation>,
    /// Additional labeled spans.
    pub labels: Vec<DiagLabel>,
    /// Suggested fix, if any.
    pub help: Option<String>,
}

/// A labeled source span within a diagnostic.
#[derive(Debug, Clone)]
pub struct DiagLabel {
    pub location: SourceLocation,
    pub message: String,
}

impl Diagnostic {
    pub fn error(category: Category, message: impl Into<String>) -> Self {
        Self {
            code: Some(category.code().to_string()),
            severity: Severity::Error,
            category,
            message: message.into(),
            location: None,
            labels: Vec::new(),
            help: None,
        }
    }

    pub fn warning(category: Category, message: impl Into<String>) -> Self {
        Self {
            code: Some(category.code().to_string()),
            severity: Severity::Warning,
            category,
            message: message.into(),
            location: None,
            labels: Vec::new(),
            help: None,
        }
    }

    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_label(mut self, location: SourceLocation, message: impl Into<String>) -> Self {
        self.labels.push(DiagLabel {
            location,
            message: message.into(),
        });
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        if let Some(code) = &self.code {
            write!(f, "{prefix}[{code}]: {}", self.message)?;
        } else {
            write!(f, "{prefix}: {}", self.message)?;
        }
        if let Some(help) = &self.help {
            write!(f, "\n  help: {help}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error type for crates that produce diagnostics
// ---------------------------------------------------------------------------

/// Error type wrapping one or more diagnostics.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}", .0.first().map(|d| d.to_string()).unwrap_or_default())]
pub struct DiagnosticError(pub Vec<Diagnostic>);

impl DiagnosticError {
    pub fn single(diag: Diagnostic) -> Self {
        Self(vec![diag])
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_builder() {
        let loc = SourceLocation {
            file_id: 0,
            start: 4,
            end: 9,
        };
        let diag = Diagnostic::error(Category::UseMismatch, "x is borrowed and consumed")
            .at(loc)
            .with_help("split the borrow into its own region");

        assert_eq!(diag.severity, Severity::Error);
        assert_eq!(diag.code.as_deref(), Some("E0004"));
        assert_eq!(diag.category, Category::UseMismatch);
        assert!(diag.help.unwrap().contains("region"));
    }

    #[test]
    fn diagnostic_display() {
        let diag = Diagnostic::error(Category::TypeMismatch, "cannot unify int with (int, int)");
        let s = format!("{diag}");
        assert!(s.starts_with("error[E0001]: cannot unify"));
    }

    #[test]
    fn category_metadata_is_stable_and_unique() {
        let mut codes = std::collections::BTreeSet::new();
        for cat in Category::all() {
            assert!(!cat.as_str().is_empty());
            assert!(!cat.description().is_empty());
            assert!(!cat.example_fix().is_empty());
            assert!(
                codes.insert(cat.code()),
                "duplicate diagnostic code detected: {}",
                cat.code()
            );
        }
    }
}
