//! Intermediate representation
//!
//! Each function is lowered to a vector of basic blocks. A block is a run of
//! straight-line [`Instr`]s closed by exactly one [`Terminator`]; all control
//! flow (branches, loops, fork/join, return) lives in terminators so the
//! interpreter can address any resume point as a [`Position`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

mod lower;

#[cfg(test)]
mod tests;

pub use lower::lower;

use crate::parser::ast::{Call, CallOptions, CallTarget, Expr, NodeId, Quantifier, Span};

pub type BlockId = usize;

/* ===================== Positions ===================== */

/// An instruction address inside one function
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub block: BlockId,
    /// Instruction index; `instrs.len()` addresses the terminator
    pub index: usize,
}

impl Position {
    pub fn block_start(block: BlockId) -> Self {
        Self { block, index: 0 }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}:{}", self.block, self.index)
    }
}

/* ===================== Program ===================== */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrProgram {
    pub functions: BTreeMap<String, IrFunction>,
    pub entry: String,
    /// Active domain packs, in activation order
    pub domains: Vec<String>,
}

impl IrProgram {
    pub fn function(&self, name: &str) -> Option<&IrFunction> {
        self.functions.get(name)
    }

    /// Check block references and call targets of every function
    pub fn verify(&self) -> Result<(), LowerError> {
        if !self.functions.contains_key(&self.entry) {
            return Err(LowerError::UnknownFunction {
                name: self.entry.clone(),
            });
        }
        for function in self.functions.values() {
            function.verify(self)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrFunction {
    pub name: String,
    pub params: Vec<String>,
    pub blocks: Vec<Block>,
    pub entry: BlockId,
    pub span: Span,
}

impl IrFunction {
    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    fn verify(&self, program: &IrProgram) -> Result<(), LowerError> {
        let check_block = |target: BlockId, from: BlockId| {
            if target < self.blocks.len() {
                Ok(())
            } else {
                Err(LowerError::DanglingBlock {
                    function: self.name.clone(),
                    block: target,
                    referenced_from: from,
                })
            }
        };

        check_block(self.entry, self.entry)?;

        for (index, block) in self.blocks.iter().enumerate() {
            if block.id != index {
                return Err(LowerError::Internal(format!(
                    "block {} of '{}' is stored at index {}",
                    block.id, self.name, index
                )));
            }

            let mut calls: Vec<&Call> = Vec::new();

            for instr in &block.instrs {
                match instr {
                    Instr::Assign { value: expr, .. }
                    | Instr::Eval { expr, .. }
                    | Instr::Gate { cond: expr, .. }
                    | Instr::IterInit { iterable: expr, .. } => {
                        expr.walk_calls(&mut |c| calls.push(c))
                    }
                    Instr::Dispatch { call, .. } | Instr::Sync { call, .. } => {
                        push_call_tree(call, &mut calls)
                    }
                    Instr::Checkpoint {
                        resume, recover, ..
                    } => {
                        check_block(*resume, block.id)?;
                        if let Some(recover) = recover {
                            check_block(*recover, block.id)?;
                        }
                    }
                    Instr::Commit { .. } => {}
                }
                if let Instr::Gate {
                    on_fail: GateTarget::AbortLoop { exit, .. },
                    ..
                } = instr
                {
                    check_block(*exit, block.id)?;
                }
            }

            for target in block.term.successors() {
                check_block(target, block.id)?;
            }
            match &block.term {
                Terminator::Branch { arms, .. } => {
                    for arm in arms {
                        arm.cond.walk_calls(&mut |c| calls.push(c));
                    }
                }
                Terminator::Fork(fork) => {
                    for branch in &fork.branches {
                        push_call_tree(&branch.call, &mut calls);
                    }
                }
                Terminator::Return {
                    value: Some(value), ..
                } => value.walk_calls(&mut |c| calls.push(c)),
                _ => {}
            }

            for call in calls {
                match &call.target {
                    None => {
                        return Err(LowerError::UnresolvedCall {
                            function: self.name.clone(),
                            call: call.display_name(),
                            node: call.id,
                        })
                    }
                    Some(CallTarget::User { name }) if !program.functions.contains_key(name) => {
                        return Err(LowerError::UnknownFunction { name: name.clone() })
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(())
    }
}

fn push_call_tree<'a>(call: &'a Call, calls: &mut Vec<&'a Call>) {
    calls.push(call);
    for arg in &call.args {
        arg.walk_calls(&mut |c| calls.push(c));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    /// Human-readable role, e.g. `while.head`
    pub label: String,
    pub instrs: Vec<Instr>,
    pub term: Terminator,
}

/* ===================== Instructions ===================== */

/// What a failed validation gate does
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum GateTarget {
    /// Hand the failure to the rollback manager
    Rollback,
    /// Jump to the innermost loop exit, closing the listed regions first
    AbortLoop { exit: BlockId, unwind: Vec<NodeId> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instr {
    Assign {
        node: NodeId,
        target: String,
        value: Expr,
        #[serde(default)]
        options: CallOptions,
        span: Span,
    },
    /// Expression statement; its value becomes the frame's last value
    Eval {
        node: NodeId,
        expr: Expr,
        #[serde(default)]
        options: CallOptions,
        span: Span,
    },
    /// `AWAIT`: start a call without waiting for it
    Dispatch {
        node: NodeId,
        target: Option<String>,
        call: Call,
        timeout: Option<Duration>,
        span: Span,
    },
    /// Open a transactional region; the body starts at `resume`
    Checkpoint {
        region: NodeId,
        retry: Option<u32>,
        resume: BlockId,
        recover: Option<BlockId>,
        span: Span,
    },
    /// Close the region opened by the matching checkpoint
    Commit { region: NodeId },
    /// `ASSERT`
    Gate {
        node: NodeId,
        cond: Expr,
        on_fail: GateTarget,
        span: Span,
    },
    /// First instruction of a fork's join block
    Sync {
        fork: NodeId,
        target: Option<String>,
        call: Call,
        span: Span,
    },
    /// Evaluate a `FOR` iterable into iterator slot `slot`
    IterInit {
        slot: NodeId,
        iterable: Expr,
        span: Span,
    },
}

impl Instr {
    pub fn span(&self) -> Option<Span> {
        match self {
            Instr::Assign { span, .. }
            | Instr::Eval { span, .. }
            | Instr::Dispatch { span, .. }
            | Instr::Checkpoint { span, .. }
            | Instr::Gate { span, .. }
            | Instr::Sync { span, .. }
            | Instr::IterInit { span, .. } => Some(*span),
            Instr::Commit { .. } => None,
        }
    }
}

/* ===================== Terminators ===================== */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchArm {
    pub cond: Expr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,
    pub target: BlockId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkBranch {
    pub node: NodeId,
    pub name: Option<String>,
    pub call: Call,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkNode {
    pub node: NodeId,
    pub branches: Vec<ForkBranch>,
    pub quantifier: Quantifier,
    /// Measured from dispatch
    pub deadline: Option<Duration>,
    pub join: BlockId,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum Terminator {
    Jump {
        target: BlockId,
    },
    /// First truthy arm wins; `otherwise` is the else / loop-exit edge
    Branch {
        node: NodeId,
        arms: Vec<BranchArm>,
        otherwise: BlockId,
    },
    /// Advance iterator `slot`: bind `var` and enter `body`, or leave to `exit`
    IterNext {
        slot: NodeId,
        var: String,
        body: BlockId,
        exit: BlockId,
    },
    Fork(ForkNode),
    Return {
        value: Option<Expr>,
        /// Falling off the end of the body rather than an explicit `RETURN`
        implicit: bool,
        span: Span,
    },
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Jump { target } => vec![*target],
            Terminator::Branch {
                arms, otherwise, ..
            } => arms
                .iter()
                .map(|a| a.target)
                .chain(std::iter::once(*otherwise))
                .collect(),
            Terminator::IterNext { body, exit, .. } => vec![*body, *exit],
            Terminator::Fork(fork) => vec![fork.join],
            Terminator::Return { .. } => vec![],
        }
    }
}

/* ===================== Errors ===================== */

/// Lowering only fails on broken internal invariants
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LowerError {
    #[error("call '{call}' (node {node}) in '{function}' has no resolved target")]
    UnresolvedCall {
        function: String,
        call: String,
        node: NodeId,
    },
    #[error("block bb{block} referenced from bb{referenced_from} does not exist in '{function}'")]
    DanglingBlock {
        function: String,
        block: BlockId,
        referenced_from: BlockId,
    },
    #[error("function '{name}' is not defined in the IR program")]
    UnknownFunction { name: String },
    #[error("internal lowering error: {0}")]
    Internal(String),
}
