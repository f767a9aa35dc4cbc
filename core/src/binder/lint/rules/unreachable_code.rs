//! Rule: Unreachable Code
//!
//! Reports statements that follow a `RETURN` in the same block.
//!
//! ```pnl
//! DEF main() {
//!     RETURN 1
//!     notify()          // warning: unreachable
//! }
//! ```

use crate::parser::ast::{Program, Stmt};

use super::super::{ValidationError, ValidationRule};

/// Rule that checks for statements after `RETURN`.
pub struct UnreachableCodeRule;

impl ValidationRule for UnreachableCodeRule {
    fn id(&self) -> &'static str {
        "unreachable-code"
    }

    fn description(&self) -> &'static str {
        "Statements after RETURN never execute"
    }

    fn validate(&self, program: &Program) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        for function in &program.functions {
            check_block(&function.body, self.id(), &mut errors);
        }
        errors
    }
}

fn check_block(stmts: &[Stmt], rule_id: &'static str, errors: &mut Vec<ValidationError>) {
    let mut returned = false;

    for stmt in stmts {
        if returned {
            // Only the first dead statement is reported per block
            errors.push(ValidationError::warning(
                stmt.span(),
                "Unreachable code after RETURN",
                rule_id,
            ));
            break;
        }

        match stmt {
            Stmt::Return { .. } => returned = true,
            Stmt::If {
                arms, else_body, ..
            } => {
                for arm in arms {
                    check_block(&arm.body, rule_id, errors);
                }
                if let Some(body) = else_body {
                    check_block(body, rule_id, errors);
                }
            }
            Stmt::While { body, .. } | Stmt::For { body, .. } => {
                check_block(body, rule_id, errors)
            }
            Stmt::Validate { body, recover, .. } => {
                check_block(body, rule_id, errors);
                if let Some(recover) = recover {
                    check_block(recover, rule_id, errors);
                }
            }
            _ => {}
        }
    }
}
