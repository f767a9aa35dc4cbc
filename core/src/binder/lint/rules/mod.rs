//! Lint Rules
//!
//! Each file in this module contains one rule:
//!
//! - `unused_variable.rs` - Variables assigned but never read
//! - `unreachable_code.rs` - Statements after a `RETURN` in the same block

mod unreachable_code;
mod unused_variable;

pub use unreachable_code::UnreachableCodeRule;
pub use unused_variable::UnusedVariableRule;
