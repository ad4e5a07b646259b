//! Typed tensor-kernel IR.
//!
//! The expression tree here is what the GPU back end consumes: a typed,
//! SSA-style sum type with explicit `Let` binders. The two algebraic passes
//! that operate on it live alongside it: [`recognize`] lifts ordinary
//! arithmetic into named intrinsics, and [`lower`] expands those intrinsics
//! back into reference arithmetic.
pub mod eval;
pub mod expr;
pub mod interval;
pub mod lower;
pub mod recognize;
pub mod simplify;
pub mod ty;

pub use expr::{BinOp, CallOp, CmpOp, Expr, ForKind, Stmt};
pub use interval::{BoundsCache, ConstantInterval};
pub use ty::{Type, TypeCode};

/// Error infrastructure.
pub mod error {
    pub use anyhow::{anyhow, bail, ensure, Error, Result};
}
