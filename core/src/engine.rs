//! Compile-and-run façade
//!
//! Ties the pipeline together: source text is parsed, bound against the
//! active domain packs, linted and lowered once, then the resulting
//! [`CompiledProgram`] can be run any number of times.

use std::collections::BTreeMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::binder::lint::{lint_program, ValidationError};
use crate::binder::{bind_with_entry, ActiveDomains, DomainRegistry};
use crate::config::EngineConfig;
use crate::error::CompileError;
use crate::executor::{
    CallPolicy, CapabilityProvider, Interpreter, NoPolicy, NullTrace, ProgramOutcome, TraceSink,
    Val,
};
use crate::ir::{lower, IrProgram};
use crate::parser::parse_program;

/// A program that passed every compile stage
#[derive(Debug, Clone)]
pub struct CompiledProgram {
    pub ir: Arc<IrProgram>,
    /// SHA-256 of the source text
    pub fingerprint: String,
    /// Lint findings; none of them stop compilation
    pub warnings: Vec<ValidationError>,
}

impl CompiledProgram {
    /// First eight characters of the fingerprint, for display
    pub fn short_fingerprint(&self) -> &str {
        &self.fingerprint[..8.min(self.fingerprint.len())]
    }
}

/// Parse, bind, lint and lower `source`
pub fn compile(
    source: &str,
    registry: &DomainRegistry,
    config: &EngineConfig,
) -> Result<CompiledProgram, CompileError> {
    let program = parse_program(source)?;
    let domains = ActiveDomains::resolve(&program, registry, config.domains.active.as_deref())?;
    let bound = bind_with_entry(&program, &domains, config.executor.entry.as_deref())?;

    let warnings = lint_program(&bound.program);
    for finding in &warnings {
        warn!(rule = finding.rule_id, "{}", finding);
    }

    let ir = lower(&bound)?;
    let fingerprint = hash_source(source);
    debug!(
        entry = %ir.entry,
        functions = ir.functions.len(),
        fingerprint = &fingerprint[..8],
        "Program compiled"
    );

    Ok(CompiledProgram {
        ir: Arc::new(ir),
        fingerprint,
        warnings,
    })
}

/// Hash program source using SHA256
pub fn hash_source(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Configuration, domain packs and a provider bundled for repeated runs
pub struct Engine {
    config: EngineConfig,
    registry: DomainRegistry,
    provider: Arc<dyn CapabilityProvider>,
    policy: Arc<dyn CallPolicy>,
    sink: Arc<dyn TraceSink>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        registry: DomainRegistry,
        provider: Arc<dyn CapabilityProvider>,
    ) -> Self {
        Self {
            config,
            registry,
            provider,
            policy: Arc::new(NoPolicy),
            sink: Arc::new(NullTrace),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn CallPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_trace(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &DomainRegistry {
        &self.registry
    }

    pub fn compile(&self, source: &str) -> Result<CompiledProgram, CompileError> {
        compile(source, &self.registry, &self.config)
    }

    /// Run the entry function with inputs matched to parameters by name
    pub async fn run(
        &self,
        compiled: &CompiledProgram,
        inputs: BTreeMap<String, Val>,
    ) -> ProgramOutcome {
        self.interpreter(compiled).run_named(inputs).await
    }

    /// Compile and run in one step
    pub async fn run_source(
        &self,
        source: &str,
        inputs: BTreeMap<String, Val>,
    ) -> Result<ProgramOutcome, CompileError> {
        let compiled = self.compile(source)?;
        Ok(self.run(&compiled, inputs).await)
    }

    fn interpreter(&self, compiled: &CompiledProgram) -> Interpreter {
        Interpreter::new(compiled.ir.clone(), self.provider.clone())
            .with_config(self.config.clone())
            .with_policy(self.policy.clone())
            .with_trace(self.sink.clone())
            .with_fingerprint(compiled.fingerprint.clone())
    }
}
