//! Fixed-width symbolic expressions used to describe register values, memory contents and path
//! conditions. Expressions are immutable trees with shared subexpressions. Constructors fold
//! constants eagerly so a fully concrete computation never produces a symbolic node.

mod eval;
mod expr;
mod var;

pub use crate::eval::*;
pub use crate::expr::*;
pub use crate::var::*;

#[cfg(test)]
mod tests;
