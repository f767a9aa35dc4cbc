//! AST to IR lowering

use std::collections::BTreeMap;

use tracing::debug;

use super::*;
use crate::binder::BoundProgram;
use crate::parser::ast::{FunctionDef, GateAction, Parallel, Stmt};

/// Lower a bound program into verified IR
pub fn lower(bound: &BoundProgram) -> Result<IrProgram, LowerError> {
    let mut functions = BTreeMap::new();
    for function in &bound.program.functions {
        let ir = FnBuilder::new(function).build(function)?;
        functions.insert(function.name.clone(), ir);
    }

    let program = IrProgram {
        functions,
        entry: bound.entry.clone(),
        domains: bound.domains.names(),
    };
    program.verify()?;

    debug!(
        functions = program.functions.len(),
        blocks = program
            .functions
            .values()
            .map(|f| f.blocks.len())
            .sum::<usize>(),
        "Program lowered"
    );
    Ok(program)
}

/* ===================== Builder ===================== */

struct PendingBlock {
    label: String,
    instrs: Vec<Instr>,
    term: Option<Terminator>,
}

struct LoopCtx {
    exit: BlockId,
    /// Height of the open-region stack when the loop was entered
    regions_at_entry: usize,
}

struct FnBuilder {
    name: String,
    blocks: Vec<PendingBlock>,
    current: BlockId,
    loops: Vec<LoopCtx>,
    /// Transactional regions open at the current point, innermost last
    regions: Vec<NodeId>,
}

impl FnBuilder {
    fn new(function: &FunctionDef) -> Self {
        Self {
            name: function.name.clone(),
            blocks: vec![PendingBlock {
                label: "entry".to_string(),
                instrs: Vec::new(),
                term: None,
            }],
            current: 0,
            loops: Vec::new(),
            regions: Vec::new(),
        }
    }

    fn build(mut self, function: &FunctionDef) -> Result<IrFunction, LowerError> {
        self.lower_block(&function.body)?;
        self.seal(Terminator::Return {
            value: None,
            implicit: true,
            span: function.span,
        });

        let mut blocks = Vec::with_capacity(self.blocks.len());
        for (id, pending) in self.blocks.into_iter().enumerate() {
            let term = pending.term.ok_or_else(|| {
                LowerError::Internal(format!(
                    "block bb{} ({}) of '{}' has no terminator",
                    id, pending.label, self.name
                ))
            })?;
            blocks.push(Block {
                id,
                label: pending.label,
                instrs: pending.instrs,
                term,
            });
        }

        Ok(IrFunction {
            name: function.name.clone(),
            params: function.params.iter().map(|p| p.name.clone()).collect(),
            blocks,
            entry: 0,
            span: function.span,
        })
    }

    fn new_block(&mut self, label: impl Into<String>) -> BlockId {
        self.blocks.push(PendingBlock {
            label: label.into(),
            instrs: Vec::new(),
            term: None,
        });
        self.blocks.len() - 1
    }

    fn emit(&mut self, instr: Instr) {
        self.blocks[self.current].instrs.push(instr);
    }

    /// Terminate the current block. A block that is already terminated is
    /// left alone; its trailing code was unreachable.
    fn seal(&mut self, term: Terminator) {
        let block = &mut self.blocks[self.current];
        if block.term.is_none() {
            block.term = Some(term);
        }
    }

    fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    /* ---------- statements ---------- */

    fn lower_block(&mut self, stmts: &[Stmt]) -> Result<(), LowerError> {
        for stmt in stmts {
            self.lower_stmt(stmt)?;
        }
        Ok(())
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<(), LowerError> {
        match stmt {
            Stmt::If {
                id,
                arms,
                else_body,
                ..
            } => {
                let join = self.new_block("if.join");
                let mut ir_arms = Vec::with_capacity(arms.len());
                let mut arm_blocks = Vec::with_capacity(arms.len());
                for (i, arm) in arms.iter().enumerate() {
                    let target = self.new_block(format!("if.arm{}", i));
                    arm_blocks.push(target);
                    ir_arms.push(BranchArm {
                        cond: arm.cond.clone(),
                        probability: arm.probability,
                        target,
                    });
                }
                let otherwise = match else_body {
                    Some(_) => self.new_block("if.else"),
                    None => join,
                };
                self.seal(Terminator::Branch {
                    node: *id,
                    arms: ir_arms,
                    otherwise,
                });

                for (arm, block) in arms.iter().zip(arm_blocks) {
                    self.switch_to(block);
                    self.lower_block(&arm.body)?;
                    self.seal(Terminator::Jump { target: join });
                }
                if let Some(body) = else_body {
                    self.switch_to(otherwise);
                    self.lower_block(body)?;
                    self.seal(Terminator::Jump { target: join });
                }
                self.switch_to(join);
            }

            Stmt::While { id, cond, body, .. } => {
                let head = self.new_block("while.head");
                let body_block = self.new_block("while.body");
                let exit = self.new_block("while.exit");

                self.seal(Terminator::Jump { target: head });
                self.switch_to(head);
                self.seal(Terminator::Branch {
                    node: *id,
                    arms: vec![BranchArm {
                        cond: cond.clone(),
                        probability: None,
                        target: body_block,
                    }],
                    otherwise: exit,
                });

                self.switch_to(body_block);
                self.lower_loop_body(body, exit)?;
                self.seal(Terminator::Jump { target: head });
                self.switch_to(exit);
            }

            Stmt::For {
                id,
                var,
                iterable,
                body,
                span,
                ..
            } => {
                let head = self.new_block("for.head");
                let body_block = self.new_block("for.body");
                let exit = self.new_block("for.exit");

                self.emit(Instr::IterInit {
                    slot: *id,
                    iterable: iterable.clone(),
                    span: *span,
                });
                self.seal(Terminator::Jump { target: head });
                self.switch_to(head);
                self.seal(Terminator::IterNext {
                    slot: *id,
                    var: var.clone(),
                    body: body_block,
                    exit,
                });

                self.switch_to(body_block);
                self.lower_loop_body(body, exit)?;
                self.seal(Terminator::Jump { target: head });
                self.switch_to(exit);
            }

            Stmt::Parallel(parallel) => self.lower_parallel(parallel),

            Stmt::Assign {
                id,
                target,
                value,
                options,
                span,
                ..
            } => {
                let instr = Instr::Assign {
                    node: *id,
                    target: target.clone(),
                    value: value.clone(),
                    options: *options,
                    span: *span,
                };
                self.emit_call_statement(*id, instr, options.retry, *span)?;
            }

            Stmt::Expr {
                id,
                expr,
                options,
                span,
            } => {
                let instr = Instr::Eval {
                    node: *id,
                    expr: expr.clone(),
                    options: *options,
                    span: *span,
                };
                self.emit_call_statement(*id, instr, options.retry, *span)?;
            }

            Stmt::Await {
                id,
                target,
                call,
                timeout,
                span,
            } => self.emit(Instr::Dispatch {
                node: *id,
                target: target.clone(),
                call: call.clone(),
                timeout: *timeout,
                span: *span,
            }),

            Stmt::Return { value, span, .. } => {
                self.seal(Terminator::Return {
                    value: value.clone(),
                    implicit: false,
                    span: *span,
                });
                let dead = self.new_block("unreachable");
                self.switch_to(dead);
            }

            Stmt::Validate {
                id,
                retry,
                body,
                recover,
                span,
            } => {
                self.lower_region(*id, *retry, recover.as_deref(), *span, |b| {
                    b.lower_block(body)
                })?;
            }

            Stmt::Assert {
                id,
                cond,
                on_fail,
                span,
            } => {
                let on_fail = match on_fail {
                    GateAction::Rollback => GateTarget::Rollback,
                    GateAction::AbortLoop => {
                        let ctx = self.loops.last().ok_or_else(|| {
                            LowerError::Internal(format!(
                                "abort-loop gate (node {}) outside a loop in '{}'",
                                id, self.name
                            ))
                        })?;
                        GateTarget::AbortLoop {
                            exit: ctx.exit,
                            unwind: self.regions[ctx.regions_at_entry..]
                                .iter()
                                .rev()
                                .copied()
                                .collect(),
                        }
                    }
                };
                self.emit(Instr::Gate {
                    node: *id,
                    cond: cond.clone(),
                    on_fail,
                    span: *span,
                });
            }
        }
        Ok(())
    }

    fn lower_loop_body(&mut self, body: &[Stmt], exit: BlockId) -> Result<(), LowerError> {
        self.loops.push(LoopCtx {
            exit,
            regions_at_entry: self.regions.len(),
        });
        let result = self.lower_block(body);
        self.loops.pop();
        result
    }

    fn lower_parallel(&mut self, parallel: &Parallel) {
        let join = self.new_block("parallel.join");
        self.seal(Terminator::Fork(ForkNode {
            node: parallel.id,
            branches: parallel
                .branches
                .iter()
                .map(|b| ForkBranch {
                    node: b.id,
                    name: b.name.clone(),
                    call: b.call.clone(),
                    timeout: b.timeout,
                })
                .collect(),
            quantifier: parallel.sync.quantifier,
            deadline: parallel.timeout,
            join,
            span: parallel.span,
        }));
        self.switch_to(join);
        self.emit(Instr::Sync {
            fork: parallel.id,
            target: parallel.target.clone(),
            call: parallel.sync.call.clone(),
            span: parallel.sync.span,
        });
    }

    /// A call statement with `@retry` becomes a single-statement region
    fn emit_call_statement(
        &mut self,
        id: NodeId,
        instr: Instr,
        retry: Option<u32>,
        span: Span,
    ) -> Result<(), LowerError> {
        match retry {
            None => {
                self.emit(instr);
                Ok(())
            }
            Some(retry) => self.lower_region(id, Some(retry), None, span, move |b| {
                b.emit(instr);
                Ok(())
            }),
        }
    }

    /// `Checkpoint` -> body -> `Commit`, with an optional recovery block
    fn lower_region(
        &mut self,
        region: NodeId,
        retry: Option<u32>,
        recover: Option<&[Stmt]>,
        span: Span,
        body: impl FnOnce(&mut Self) -> Result<(), LowerError>,
    ) -> Result<(), LowerError> {
        let body_block = self.new_block("validate.body");
        let recover_block = recover.map(|_| self.new_block("validate.recover"));
        let after = self.new_block("validate.after");

        self.emit(Instr::Checkpoint {
            region,
            retry,
            resume: body_block,
            recover: recover_block,
            span,
        });
        self.seal(Terminator::Jump { target: body_block });

        self.switch_to(body_block);
        self.regions.push(region);
        let result = body(self);
        self.regions.pop();
        result?;
        self.emit(Instr::Commit { region });
        self.seal(Terminator::Jump { target: after });

        if let (Some(block), Some(stmts)) = (recover_block, recover) {
            self.switch_to(block);
            self.lower_block(stmts)?;
            self.seal(Terminator::Jump { target: after });
        }

        self.switch_to(after);
        Ok(())
    }
}
