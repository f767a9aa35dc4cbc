//! Type definitions for the executor
//!
//! - Runtime values (Val)

pub mod values;

pub use values::Val;
