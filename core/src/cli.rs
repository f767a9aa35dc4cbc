use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::binder::DomainRegistry;
use crate::config::EngineConfig;
use crate::engine::{CompiledProgram, Engine};
use crate::error::CompileError;
use crate::executor::{JsonLinesTrace, NullTrace, ScriptedProvider, TraceSink, Val};

#[derive(Parser)]
#[command(name = "pnl")]
#[command(about = "PNL - structured control flow over fallible capability calls", long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default search)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Options shared by every command that compiles a program
#[derive(Args, Debug, Clone)]
pub struct ProgramArgs {
    /// PNL source file
    pub file: PathBuf,

    /// Activate a domain pack, replacing the program's #DOMAIN directives
    #[arg(short = 'd', long = "domain")]
    pub domains: Vec<String>,

    /// TOML file with domain pack definitions
    #[arg(long)]
    pub packs: Option<PathBuf>,

    /// Entry function (overrides #ENTRY and `main`)
    #[arg(short = 'e', long)]
    pub entry: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse, bind and lint a program
    Check {
        #[command(flatten)]
        program: ProgramArgs,
    },

    /// Print the lowered IR as JSON
    Ir {
        #[command(flatten)]
        program: ProgramArgs,
    },

    /// Run a program against scripted capability responses
    Run {
        #[command(flatten)]
        program: ProgramArgs,

        /// Entry input as name=value; values parse as JSON, else as text
        #[arg(short = 'i', long = "input", value_parser = parse_input)]
        inputs: Vec<(String, Val)>,

        /// TOML file with scripted responses per function
        #[arg(short = 'r', long)]
        responses: Option<PathBuf>,

        /// Write the execution trace as JSON lines
        #[arg(short = 't', long)]
        trace: Option<PathBuf>,
    },
}

/// Run the CLI by parsing process arguments
pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();
    run_cli_with_args(cli).await
}

/// Run the CLI with provided arguments
pub async fn run_cli_from_args(args: Vec<String>) -> Result<()> {
    let cli = Cli::try_parse_from(args)?;
    run_cli_with_args(cli).await
}

async fn run_cli_with_args(cli: Cli) -> Result<()> {
    // Load configuration before reading any program so config errors come first
    let base = EngineConfig::builder()
        .config_path(cli.config.clone())
        .build()
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Check { program } => {
            let (_, compiled) = prepare(&base, &program)?;
            for warning in &compiled.warnings {
                eprintln!("{}: {}", program.file.display(), warning);
            }
            println!(
                "✓ {} (entry: {}, {} functions, version: {})",
                program.file.display(),
                compiled.ir.entry,
                compiled.ir.functions.len(),
                compiled.short_fingerprint()
            );
        }

        Commands::Ir { program } => {
            let (_, compiled) = prepare(&base, &program)?;
            let json = serde_json::to_string_pretty(compiled.ir.as_ref())
                .context("Failed to serialize IR")?;
            println!("{}", json);
        }

        Commands::Run {
            program,
            inputs,
            responses,
            trace,
        } => {
            let (config, compiled) = prepare(&base, &program)?;

            let provider = match &responses {
                Some(path) => ScriptedProvider::load(path)
                    .with_context(|| format!("Failed to load responses from {}", path.display()))?,
                None => ScriptedProvider::new(),
            };
            let sink: Arc<dyn TraceSink> = match &trace {
                Some(path) => Arc::new(
                    JsonLinesTrace::create(path)
                        .with_context(|| format!("Failed to create trace file {}", path.display()))?,
                ),
                None => Arc::new(NullTrace),
            };

            let registry = load_registry(&config)?;
            let engine = Engine::new(config, registry, Arc::new(provider)).with_trace(sink);
            let inputs: BTreeMap<String, Val> = inputs.into_iter().collect();
            let outcome = engine.run(&compiled, inputs).await;

            match &outcome.result {
                Ok(value) => {
                    let json = serde_json::to_string_pretty(&value.to_json())
                        .context("Failed to serialize result")?;
                    println!("{}", json);
                    eprintln!(
                        "✓ Run {} completed in {:?} ({} retries)",
                        outcome.run_id, outcome.elapsed, outcome.retries
                    );
                }
                Err(failure) => {
                    bail!(
                        "{}: run {} failed: {}",
                        program.file.display(),
                        outcome.run_id,
                        failure
                    );
                }
            }
        }
    }

    Ok(())
}

/// Apply command-line overrides, then read and compile the program
fn prepare(base: &EngineConfig, program: &ProgramArgs) -> Result<(EngineConfig, CompiledProgram)> {
    let mut config = base.clone();
    if !program.domains.is_empty() {
        config.domains.active = Some(program.domains.clone());
    }
    if let Some(packs) = &program.packs {
        config.domains.packs = Some(packs.clone());
    }
    if let Some(entry) = &program.entry {
        config.executor.entry = Some(entry.clone());
    }
    config.validate()?;

    let registry = load_registry(&config)?;
    let source = std::fs::read_to_string(&program.file)
        .with_context(|| format!("Failed to read {}", program.file.display()))?;
    let compiled = crate::engine::compile(&source, &registry, &config)
        .map_err(|e| anyhow!(render_compile_error(&program.file, &e)))?;
    Ok((config, compiled))
}

fn load_registry(config: &EngineConfig) -> Result<DomainRegistry> {
    match &config.domains.packs {
        Some(path) => DomainRegistry::load(path)
            .with_context(|| format!("Failed to load domain packs from {}", path.display())),
        None => Ok(DomainRegistry::new()),
    }
}

/// `file:line:col: stage error: message`
fn render_compile_error(file: &Path, err: &CompileError) -> String {
    match err.span() {
        Some(span) => format!(
            "{}:{}:{}: {} error: {}",
            file.display(),
            span.line,
            span.col,
            err.stage(),
            err
        ),
        None => format!("{}: {} error: {}", file.display(), err.stage(), err),
    }
}

/// Parse `name=value`. The value is JSON when it parses as JSON, else text.
fn parse_input(raw: &str) -> Result<(String, Val), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{}'", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing input name in '{}'", raw));
    }
    let value = serde_json::from_str::<serde_json::Value>(value)
        .map(Val::from)
        .unwrap_or_else(|_| Val::Str(value.to_string()));
    Ok((name.to_string(), value))
}
