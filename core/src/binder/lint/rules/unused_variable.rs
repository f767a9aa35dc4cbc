//! Rule: Unused Variable
//!
//! Reports a warning when a variable is assigned but never read.
//!
//! ```pnl
//! DEF main() {
//!     x = classify(1)   // warning: 'x' is assigned but never used
//!     RETURN 2
//! }
//! ```
//!
//! # Notes
//!
//! - Variables starting with `_` are exempt
//! - Parameters are exempt; callers decide what to pass
//! - Parallel branch names count as used when the `SYNC` call reads them

use std::collections::{BTreeMap, HashSet};

use crate::parser::ast::{Expr, Program, Span, Stmt};

use super::super::{ValidationError, ValidationRule};

/// Rule that checks for unused variables.
pub struct UnusedVariableRule;

impl ValidationRule for UnusedVariableRule {
    fn id(&self) -> &'static str {
        "unused-variable"
    }

    fn description(&self) -> &'static str {
        "Variables should be read after they are assigned"
    }

    fn validate(&self, program: &Program) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for function in &program.functions {
            // Phase 1: Collect first assignment sites
            let mut declarations: BTreeMap<String, Span> = BTreeMap::new();
            collect_declarations(&function.body, &mut declarations);

            // Phase 2: Collect all reads
            let mut usages: HashSet<String> = HashSet::new();
            collect_usages(&function.body, &mut usages);

            // Phase 3: Report
            for (name, span) in declarations {
                if name.starts_with('_') || usages.contains(&name) {
                    continue;
                }
                errors.push(ValidationError::warning(
                    span,
                    format!("Variable '{}' is assigned but never used", name),
                    self.id(),
                ));
            }
        }

        errors
    }
}

// ============================================================================
// Declaration Collection
// ============================================================================

fn declare(declarations: &mut BTreeMap<String, Span>, name: &str, span: Span) {
    declarations.entry(name.to_string()).or_insert(span);
}

fn collect_declarations(stmts: &[Stmt], declarations: &mut BTreeMap<String, Span>) {
    for stmt in stmts {
        match stmt {
            Stmt::Assign {
                target,
                target_span,
                ..
            } => declare(declarations, target, *target_span),

            Stmt::Await {
                target: Some(target),
                span,
                ..
            } => declare(declarations, target, *span),

            Stmt::For {
                var,
                var_span,
                body,
                ..
            } => {
                declare(declarations, var, *var_span);
                collect_declarations(body, declarations);
            }

            Stmt::Parallel(parallel) => {
                for branch in &parallel.branches {
                    if let Some(name) = &branch.name {
                        declare(declarations, name, branch.span);
                    }
                }
                if let Some(target) = &parallel.target {
                    declare(declarations, target, parallel.span);
                }
            }

            Stmt::If {
                arms, else_body, ..
            } => {
                for arm in arms {
                    collect_declarations(&arm.body, declarations);
                }
                if let Some(body) = else_body {
                    collect_declarations(body, declarations);
                }
            }

            Stmt::While { body, .. } => collect_declarations(body, declarations),

            Stmt::Validate { body, recover, .. } => {
                collect_declarations(body, declarations);
                if let Some(recover) = recover {
                    collect_declarations(recover, declarations);
                }
            }

            Stmt::Await { .. } | Stmt::Expr { .. } | Stmt::Return { .. } | Stmt::Assert { .. } => {}
        }
    }
}

// ============================================================================
// Usage Collection
// ============================================================================

fn collect_usages(stmts: &[Stmt], usages: &mut HashSet<String>) {
    for stmt in stmts {
        match stmt {
            Stmt::Assign { value, .. } => collect_expr_usages(value, usages),
            Stmt::Expr { expr, .. } => collect_expr_usages(expr, usages),
            Stmt::Assert { cond, .. } => collect_expr_usages(cond, usages),

            Stmt::Await { call, .. } => {
                for arg in &call.args {
                    collect_expr_usages(arg, usages);
                }
            }

            Stmt::Return { value, .. } => {
                if let Some(expr) = value {
                    collect_expr_usages(expr, usages);
                }
            }

            Stmt::If {
                arms, else_body, ..
            } => {
                for arm in arms {
                    collect_expr_usages(&arm.cond, usages);
                    collect_usages(&arm.body, usages);
                }
                if let Some(body) = else_body {
                    collect_usages(body, usages);
                }
            }

            Stmt::While { cond, body, .. } => {
                collect_expr_usages(cond, usages);
                collect_usages(body, usages);
            }

            Stmt::For { iterable, body, .. } => {
                collect_expr_usages(iterable, usages);
                collect_usages(body, usages);
            }

            Stmt::Parallel(parallel) => {
                for branch in &parallel.branches {
                    for arg in &branch.call.args {
                        collect_expr_usages(arg, usages);
                    }
                }
                if parallel.sync.call.args.is_empty() {
                    // An argument-less SYNC receives every branch value
                    for branch in &parallel.branches {
                        if let Some(name) = &branch.name {
                            usages.insert(name.clone());
                        }
                    }
                }
                for arg in &parallel.sync.call.args {
                    collect_expr_usages(arg, usages);
                }
            }

            Stmt::Validate { body, recover, .. } => {
                collect_usages(body, usages);
                if let Some(recover) = recover {
                    collect_usages(recover, usages);
                }
            }
        }
    }
}

fn collect_expr_usages(expr: &Expr, usages: &mut HashSet<String>) {
    expr.walk_idents(&mut |name, _| {
        usages.insert(name.to_string());
    });
}
