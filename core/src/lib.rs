//! PNL language engine
//!
//! Source text flows through [`parser`], [`binder`] and [`ir`] into an
//! [`ir::IrProgram`], which the [`executor`] interprets against a
//! [`executor::CapabilityProvider`]. The [`engine`] module bundles the
//! pipeline; the `pnl` binary drives it from the command line.

pub mod binder;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod ir;
pub mod parser;

// Re-export main types
pub use config::EngineConfig;
pub use engine::{compile, CompiledProgram, Engine};
pub use error::CompileError;
pub use executor::{
    CapabilityProvider, FailureKind, Interpreter, ProgramOutcome, RuntimeFailure, Val,
};
