//! Interpreter for lowered programs
//!
//! One controlling task walks a function's block graph. Branch conditions,
//! loops and transactional regions run inline; parallel branches and AWAIT
//! calls run as Tokio tasks that only the controlling task joins. Every
//! failure raised inside a frame is offered to the [`RollbackManager`]
//! before it leaves that frame.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod errors;
mod expressions;
pub mod frame;
mod parallel;
pub mod policy;
pub mod provider;
pub mod rollback;
pub mod stdlib;
pub mod trace;
pub mod types;

#[cfg(test)]
mod tests;

pub use errors::{CallError, FailureKind, RuntimeFailure};
pub use frame::{Bindings, Frame, FrameState};
pub use policy::{Admission, CallBudget, CallPolicy, NoPolicy, ResultCache};
pub use provider::{CallRequest, CapabilityProvider, ScriptedOutcome, ScriptedProvider};
pub use rollback::{Decision, RollbackManager};
pub use trace::{
    JsonLinesTrace, MemoryTrace, NullTrace, TraceEvent, TraceRecord, TraceSink, Tracer,
};
pub use types::Val;

use crate::config::EngineConfig;
use crate::ir::{BlockId, GateTarget, Instr, IrFunction, IrProgram, Position, Terminator};
use frame::{IterState, PendingCall};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of one program run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgramOutcome {
    pub run_id: Uuid,
    /// SHA-256 of the source, when the program was compiled from text
    pub fingerprint: Option<String>,
    pub result: Result<Val, RuntimeFailure>,
    /// Region retries taken across all frames
    pub retries: u32,
    pub elapsed: Duration,
}

impl ProgramOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn value(&self) -> Option<&Val> {
        self.result.as_ref().ok()
    }
}

/// What the main loop does after a step
enum Flow {
    Next,
    Goto(BlockId),
    Return(Val),
}

/// Executes an [`IrProgram`] against a capability provider.
///
/// Cloning is cheap; clones share the program, provider and policy.
#[derive(Clone)]
pub struct Interpreter {
    program: Arc<IrProgram>,
    provider: Arc<dyn CapabilityProvider>,
    policy: Arc<dyn CallPolicy>,
    config: Arc<EngineConfig>,
    rollback: RollbackManager,
    sink: Arc<dyn TraceSink>,
    tracer: Tracer,
    /// Parent of every cancellation token handed to the provider
    cancel: CancellationToken,
    frame_ids: Arc<AtomicU64>,
    retries: Arc<AtomicU32>,
    fingerprint: Option<String>,
}

impl Interpreter {
    pub fn new(program: Arc<IrProgram>, provider: Arc<dyn CapabilityProvider>) -> Self {
        let config = EngineConfig::default();
        let sink: Arc<dyn TraceSink> = Arc::new(NullTrace);
        Self {
            program,
            provider,
            policy: Arc::new(NoPolicy),
            rollback: RollbackManager::new(&config.rollback),
            tracer: Tracer::new(sink.clone(), &config.trace),
            sink,
            config: Arc::new(config),
            cancel: CancellationToken::new(),
            frame_ids: Arc::new(AtomicU64::new(1)),
            retries: Arc::new(AtomicU32::new(0)),
            fingerprint: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.rollback = RollbackManager::new(&config.rollback);
        self.tracer = Tracer::new(self.sink.clone(), &config.trace);
        self.config = Arc::new(config);
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn CallPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_trace(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.tracer = Tracer::new(sink.clone(), &self.config.trace);
        self.sink = sink;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn program(&self) -> &IrProgram {
        &self.program
    }

    /// Run the entry function with positional arguments
    pub async fn run(&self, args: Vec<Val>) -> ProgramOutcome {
        let run = Interpreter {
            cancel: CancellationToken::new(),
            retries: Arc::new(AtomicU32::new(0)),
            ..self.clone()
        };
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        info!(%run_id, entry = %self.program.entry, "Run started");

        let result = run.call_function(&self.program.entry, args, 0).await;

        let retries = run.retries.load(Ordering::Relaxed);
        let result = result.map_err(|failure| failure.with_run_retries(retries));
        let elapsed = started.elapsed();
        match &result {
            Ok(value) => info!(%run_id, retries, ?elapsed, result = %value, "Run completed"),
            Err(failure) => warn!(%run_id, retries, ?elapsed, error = %failure, "Run failed"),
        }

        ProgramOutcome {
            run_id,
            fingerprint: self.fingerprint.clone(),
            result,
            retries,
            elapsed,
        }
    }

    /// Run the entry function, matching inputs to parameters by name.
    /// Missing parameters are `NULL`.
    pub async fn run_named(&self, mut inputs: BTreeMap<String, Val>) -> ProgramOutcome {
        let args = match self.program.function(&self.program.entry) {
            Some(function) => function
                .params
                .iter()
                .map(|p| inputs.remove(p).unwrap_or(Val::Null))
                .collect(),
            None => Vec::new(),
        };
        if !inputs.is_empty() {
            warn!(
                ignored = ?inputs.keys().collect::<Vec<_>>(),
                "Inputs without a matching entry parameter were ignored"
            );
        }
        self.run(args).await
    }

    /* ===================== Frames ===================== */

    fn next_frame_id(&self) -> u64 {
        self.frame_ids.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, build: impl FnOnce() -> TraceRecord) {
        if self.tracer.is_enabled() {
            self.tracer.emit(build());
        }
    }

    pub(crate) fn call_function<'a>(
        &'a self,
        name: &'a str,
        args: Vec<Val>,
        depth: usize,
    ) -> BoxFuture<'a, Result<Val, RuntimeFailure>> {
        Box::pin(async move {
            let limit = self.config.executor.max_call_depth;
            if depth >= limit {
                return Err(RuntimeFailure::new(
                    FailureKind::CallDepthExceeded,
                    format!("call depth limit of {} reached calling '{}'", limit, name),
                ));
            }
            let function = self.program.function(name).ok_or_else(|| {
                RuntimeFailure::internal(format!("function '{}' is not in the program", name))
            })?;
            if args.len() != function.params.len() {
                return Err(RuntimeFailure::evaluation(format!(
                    "'{}' expects {} argument(s), got {}",
                    name,
                    function.params.len(),
                    args.len()
                )));
            }

            let env: Bindings = function.params.iter().cloned().zip(args).collect();
            let mut frame = Frame::new(self.next_frame_id(), name, env);
            self.emit(|| {
                TraceRecord::new(name, TraceEvent::FunctionEnter)
                    .input(bindings_json(&frame.env))
            });
            frame.transition(FrameState::Running)?;
            debug!(frame = frame.id, function = name, depth, "Frame entered");

            let started = Instant::now();
            let result = self.execute(&mut frame, function, depth).await;
            match &result {
                Ok(value) => {
                    frame.transition(FrameState::Completed)?;
                    self.emit(|| {
                        TraceRecord::new(name, TraceEvent::FunctionExit { ok: true })
                            .output(value.to_json())
                            .duration(started.elapsed())
                    });
                }
                Err(failure) => {
                    frame.transition(FrameState::Failed).ok();
                    frame.cancel_pending();
                    self.emit(|| {
                        TraceRecord::new(name, TraceEvent::FunctionExit { ok: false })
                            .output(serde_json::Value::String(failure.to_string()))
                            .duration(started.elapsed())
                    });
                }
            }
            debug!(frame = frame.id, function = name, state = %frame.state(), "Frame left");
            result
        })
    }

    async fn execute(
        &self,
        frame: &mut Frame,
        function: &IrFunction,
        depth: usize,
    ) -> Result<Val, RuntimeFailure> {
        let mut pos = Position::block_start(function.entry);
        loop {
            let block = function.block(pos.block).ok_or_else(|| {
                RuntimeFailure::internal(format!(
                    "'{}' has no block bb{}",
                    function.name, pos.block
                ))
            })?;

            let (step, span) = match block.instrs.get(pos.index) {
                Some(instr) => (self.exec_instr(frame, instr, depth).await, instr.span()),
                None => {
                    let span = match &block.term {
                        Terminator::Return { span, .. } => Some(*span),
                        Terminator::Fork(fork) => Some(fork.span),
                        _ => None,
                    };
                    (self.exec_term(frame, &block.term, depth).await, span)
                }
            };

            match step {
                Ok(Flow::Next) => pos.index += 1,
                Ok(Flow::Goto(block)) => pos = Position::block_start(block),
                Ok(Flow::Return(value)) => return Ok(value),
                Err(failure) => {
                    let failure = failure.located(&function.name, pos, span);
                    pos = self.handle_failure(frame, failure)?;
                }
            }
        }
    }

    fn handle_failure(
        &self,
        frame: &mut Frame,
        failure: RuntimeFailure,
    ) -> Result<Position, RuntimeFailure> {
        let region = frame.checkpoint().map(|cp| cp.region).unwrap_or_default();
        match self.rollback.on_failure(frame, failure) {
            Decision::Retry(position) => {
                self.retries.fetch_add(1, Ordering::Relaxed);
                frame.transition(FrameState::Running)?;
                let attempt = frame.checkpoint().map(|cp| cp.retries).unwrap_or_default();
                let snapshot = self.tracer.snapshot_bindings();
                self.emit(|| {
                    let record = TraceRecord::new(&frame.function, TraceEvent::Rollback { region, attempt })
                        .node(region);
                    match snapshot {
                        true => record.input(bindings_json(&frame.env)),
                        false => record,
                    }
                });
                Ok(position)
            }
            Decision::Recover(position) => {
                frame.transition(FrameState::Running)?;
                self.emit(|| {
                    TraceRecord::new(&frame.function, TraceEvent::Recover { region }).node(region)
                });
                Ok(position)
            }
            Decision::Propagate(failure) => Err(failure),
        }
    }

    /* ===================== Instructions ===================== */

    async fn exec_instr(
        &self,
        frame: &mut Frame,
        instr: &Instr,
        depth: usize,
    ) -> Result<Flow, RuntimeFailure> {
        match instr {
            Instr::Assign {
                target,
                value,
                options,
                ..
            } => {
                let value = self.eval_statement(frame, value, options.timeout, depth).await?;
                frame.bind(target, value);
            }

            Instr::Eval { expr, options, .. } => {
                let value = self.eval_statement(frame, expr, options.timeout, depth).await?;
                frame.last_value = Some(value);
            }

            Instr::Dispatch {
                node,
                target,
                call,
                timeout,
                span,
            } => {
                let args = self.eval_args(frame, &call.args, depth).await?;
                let token = self.cancel.child_token();
                let (tracer, buffer) = self.tracer.buffered();
                let child = Interpreter {
                    tracer,
                    cancel: token.clone(),
                    ..self.clone()
                };
                let caller = frame.function.clone();
                let owned = call.clone();
                let limit = *timeout;
                let handle = tokio::spawn(async move {
                    child.invoke(&caller, &owned, args, limit, depth).await
                });

                if let Some(name) = target {
                    if let Some(previous) = frame.take_pending(name) {
                        previous.cancel();
                    }
                }
                self.emit(|| {
                    TraceRecord::new(
                        &frame.function,
                        TraceEvent::Dispatch {
                            target: call.display_name(),
                        },
                    )
                    .node(*node)
                });
                debug!(frame = frame.id, call = %call.display_name(), "AWAIT dispatched");
                let seq = frame.next_dispatch();
                frame.pending.push(PendingCall {
                    seq,
                    node: *node,
                    target: target.clone(),
                    call: call.display_name(),
                    span: *span,
                    handle,
                    token,
                    trace: buffer,
                });
            }

            Instr::Checkpoint {
                region,
                retry,
                resume,
                recover,
                ..
            } => {
                let budget = self.rollback.open(
                    frame,
                    *region,
                    *retry,
                    Position::block_start(*resume),
                    recover.map(Position::block_start),
                );
                let snapshot = self.tracer.snapshot_bindings();
                self.emit(|| {
                    let record = TraceRecord::new(
                        &frame.function,
                        TraceEvent::Checkpoint {
                            region: *region,
                            budget,
                        },
                    )
                    .node(*region);
                    match snapshot {
                        true => record.input(bindings_json(&frame.env)),
                        false => record,
                    }
                });
            }

            Instr::Commit { region } => {
                if !self.rollback.commit(frame, *region) {
                    return Err(RuntimeFailure::internal(format!(
                        "commit of region {} without a matching checkpoint",
                        region
                    )));
                }
                self.emit(|| {
                    TraceRecord::new(&frame.function, TraceEvent::Commit { region: *region })
                        .node(*region)
                });
            }

            Instr::Gate {
                node,
                cond,
                on_fail,
                ..
            } => {
                if self.eval(frame, cond, depth).await?.is_truthy() {
                    return Ok(Flow::Next);
                }
                let abort_loop = matches!(on_fail, GateTarget::AbortLoop { .. });
                self.emit(|| {
                    TraceRecord::new(&frame.function, TraceEvent::GateFailed { abort_loop })
                        .node(*node)
                });
                match on_fail {
                    GateTarget::Rollback => {
                        return Err(RuntimeFailure::new(
                            FailureKind::ValidationGateFailure,
                            "ASSERT condition is false",
                        ))
                    }
                    GateTarget::AbortLoop { exit, unwind } => {
                        debug!(frame = frame.id, node, "Gate aborted loop");
                        self.rollback.unwind(frame, unwind);
                        return Ok(Flow::Goto(*exit));
                    }
                }
            }

            Instr::Sync {
                fork,
                target,
                call,
                ..
            } => {
                self.sync(frame, *fork, target.as_deref(), call, depth)
                    .await?
            }

            Instr::IterInit { slot, iterable, .. } => {
                let items = match self.eval(frame, iterable, depth).await? {
                    Val::List(items) => items,
                    other => {
                        return Err(RuntimeFailure::evaluation(format!(
                            "FOR expects a list, got {}",
                            other.type_name()
                        )))
                    }
                };
                frame.iterators.insert(*slot, IterState { items, next: 0 });
            }
        }
        Ok(Flow::Next)
    }

    async fn exec_term(
        &self,
        frame: &mut Frame,
        term: &Terminator,
        depth: usize,
    ) -> Result<Flow, RuntimeFailure> {
        match term {
            Terminator::Jump { target } => Ok(Flow::Goto(*target)),

            Terminator::Branch {
                node,
                arms,
                otherwise,
            } => {
                for (index, arm) in arms.iter().enumerate() {
                    if self.eval(frame, &arm.cond, depth).await?.is_truthy() {
                        self.emit(|| {
                            TraceRecord::new(
                                &frame.function,
                                TraceEvent::Branch {
                                    arm: Some(index),
                                    probability: arm.probability,
                                },
                            )
                            .node(*node)
                        });
                        return Ok(Flow::Goto(arm.target));
                    }
                }
                self.emit(|| {
                    TraceRecord::new(
                        &frame.function,
                        TraceEvent::Branch {
                            arm: None,
                            probability: None,
                        },
                    )
                    .node(*node)
                });
                Ok(Flow::Goto(*otherwise))
            }

            Terminator::IterNext {
                slot,
                var,
                body,
                exit,
            } => {
                let state = frame.iterators.get_mut(slot).ok_or_else(|| {
                    RuntimeFailure::internal(format!("iterator slot {} is not initialised", slot))
                })?;
                match state.items.get(state.next).cloned() {
                    Some(item) => {
                        let index = state.next;
                        state.next += 1;
                        frame.bind(var, item);
                        self.emit(|| {
                            TraceRecord::new(
                                &frame.function,
                                TraceEvent::Iteration {
                                    var: var.clone(),
                                    index,
                                },
                            )
                            .node(*slot)
                        });
                        Ok(Flow::Goto(*body))
                    }
                    None => {
                        frame.iterators.remove(slot);
                        Ok(Flow::Goto(*exit))
                    }
                }
            }

            Terminator::Fork(fork) => {
                self.fork(frame, fork, depth).await?;
                Ok(Flow::Goto(fork.join))
            }

            Terminator::Return {
                value, implicit, ..
            } => {
                let value = match value {
                    Some(expr) => self.eval(frame, expr, depth).await?,
                    None if *implicit => frame.last_value.clone().unwrap_or(Val::Null),
                    None => Val::Null,
                };
                self.join_pending(frame).await?;
                Ok(Flow::Return(value))
            }
        }
    }

    /* ===================== AWAIT ===================== */

    /// Join one dispatched call and flush its trace records
    pub(crate) async fn join_call(
        &self,
        function: &str,
        call: PendingCall,
    ) -> Result<Val, RuntimeFailure> {
        let node = call.node;
        let name = call.call.clone();
        let buffer = call.trace.clone();
        let result = call.join().await;
        self.tracer.flush(&buffer);
        self.emit(|| {
            let record = TraceRecord::new(function, TraceEvent::AwaitJoin { target: name }).node(node);
            match &result {
                Ok(value) => record.output(value.to_json()),
                Err(failure) => record.output(serde_json::Value::String(failure.message.clone())),
            }
        });
        result
    }

    /// Join every outstanding AWAIT before the frame returns
    async fn join_pending(&self, frame: &mut Frame) -> Result<(), RuntimeFailure> {
        let function = frame.function.clone();
        while !frame.pending.is_empty() {
            let call = frame.pending.remove(0);
            let (seq, target) = (call.seq, call.target.clone());
            let value = self.join_call(&function, call).await?;
            if let Some(name) = target {
                frame.settle(seq, &name, value);
            }
        }
        Ok(())
    }
}

fn bindings_json(env: &Bindings) -> serde_json::Value {
    serde_json::Value::Object(env.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}
