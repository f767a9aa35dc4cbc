//! Test helpers for interpreter tests
//!
//! Common utilities for compiling programs and running them against a
//! scripted provider

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::binder::{bind, ActiveDomains, DomainPack, DomainRegistry, FunctionBinding};
use crate::config::EngineConfig;
use crate::executor::{
    Interpreter, MemoryTrace, ProgramOutcome, ScriptedOutcome, ScriptedProvider, Val,
};
use crate::ir::{lower, IrProgram};
use crate::parser::parse_program;

/// The `medical` pack used throughout the interpreter tests
pub fn registry() -> DomainRegistry {
    let mut registry = DomainRegistry::new();
    registry.register(
        DomainPack::new("medical")
            .with_function(FunctionBinding::new("triage").with_arity(1))
            .with_function(FunctionBinding::new("fetch_labs"))
            .with_function(FunctionBinding::new("fetch_imaging"))
            .with_function(FunctionBinding::new("score"))
            .with_function(FunctionBinding::new("summarize"))
            .with_function(FunctionBinding::new("notify")),
    );
    registry
}

/// Parse, bind, lower, and round-trip the IR through JSON
pub fn compile_ir(source: &str) -> Arc<IrProgram> {
    let program = parse_program(source).expect("Parse should succeed");
    let domains =
        ActiveDomains::resolve(&program, &registry(), None).expect("Domains should resolve");
    let bound = bind(&program, &domains).expect("Bind should succeed");
    let ir = lower(&bound).expect("Lower should succeed");
    let json = serde_json::to_string(&ir).expect("IR serialization failed");
    Arc::new(serde_json::from_str(&json).expect("IR deserialization failed"))
}

/// A compiled program wired to a scripted provider and an in-memory trace
pub struct Harness {
    pub interpreter: Interpreter,
    pub provider: Arc<ScriptedProvider>,
    pub trace: Arc<MemoryTrace>,
}

impl Harness {
    pub fn new(source: &str, provider: ScriptedProvider) -> Self {
        Self::with_config(source, provider, EngineConfig::default())
    }

    pub fn with_config(source: &str, provider: ScriptedProvider, config: EngineConfig) -> Self {
        let provider = Arc::new(provider);
        let trace = Arc::new(MemoryTrace::new());
        let interpreter = Interpreter::new(compile_ir(source), provider.clone())
            .with_config(config)
            .with_trace(trace.clone());
        Self {
            interpreter,
            provider,
            trace,
        }
    }

    pub async fn run(&self, args: Vec<Val>) -> ProgramOutcome {
        self.interpreter.run(args).await
    }

    pub async fn run_named(&self, inputs: BTreeMap<String, Val>) -> ProgramOutcome {
        self.interpreter.run_named(inputs).await
    }
}

pub fn ok_after(value: impl Into<Val>, secs: u64) -> ScriptedOutcome {
    ScriptedOutcome::ok(value).after(Duration::from_secs(secs))
}

pub fn err_after(message: &str, secs: u64) -> ScriptedOutcome {
    ScriptedOutcome::err(message).after(Duration::from_secs(secs))
}

/// Unwrap a successful outcome
pub fn value_of(outcome: &ProgramOutcome) -> Val {
    match &outcome.result {
        Ok(value) => value.clone(),
        Err(failure) => panic!("Expected success, got {}", failure),
    }
}

pub fn list(items: Vec<Val>) -> Val {
    Val::List(items)
}

pub fn num(n: f64) -> Val {
    Val::Num(n)
}
