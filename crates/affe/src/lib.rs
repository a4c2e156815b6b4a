//! Affe: a type-checker core combining Hindley–Milner polymorphism,
//! affine and linear usage kinds, and region-delimited borrows.
//!
//! This umbrella crate wires the checking stack together behind a
//! [`Session`]: an environment seeded from the builtins, a persistent
//! inference context, and declaration entry points that convert checker
//! failures into rendered diagnostics. Parsing, renaming, and evaluation
//! live outside this workspace; a session consumes renamed ASTs.

pub mod session;

pub use affe_ast as ast;
pub use affe_diag as diag;
pub use affe_infer as infer;
pub use affe_types as types;

pub use session::Session;
