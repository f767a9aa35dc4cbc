//! Lint rules for bound PNL programs
//!
//! An extensible rule-based pass that runs after binding and reports
//! questionable but valid code. Binding errors stop compilation; lint
//! findings never do.
//!
//! # Adding a New Rule
//!
//! 1. Create a new file in `lint/rules/`
//! 2. Implement `ValidationRule` for your struct
//! 3. Add it to the `Validator::new()` constructor

pub mod rules;

use crate::parser::ast::{Program, Span};

// ============================================================================
// Validation Error Types
// ============================================================================

/// A finding produced by a lint rule.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    /// The source location of the issue
    pub span: Span,
    /// Human-readable message
    pub message: String,
    /// Severity level
    pub severity: Severity,
    /// Which rule produced this finding
    pub rule_id: &'static str,
}

/// Severity levels for lint findings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Must be fixed - code is incorrect
    Error,
    /// Should probably be fixed - potential bug
    Warning,
    /// Suggestion for improvement
    Hint,
}

impl ValidationError {
    /// Create a new error
    pub fn error(span: Span, message: impl Into<String>, rule_id: &'static str) -> Self {
        Self {
            span,
            message: message.into(),
            severity: Severity::Error,
            rule_id,
        }
    }

    /// Create a new warning
    pub fn warning(span: Span, message: impl Into<String>, rule_id: &'static str) -> Self {
        Self {
            span,
            message: message.into(),
            severity: Severity::Warning,
            rule_id,
        }
    }

    /// Check if this is an error (not a warning or hint)
    pub fn is_error(&self) -> bool {
        matches!(self.severity, Severity::Error)
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let severity = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Hint => "hint",
        };
        write!(
            f,
            "{} at line {}, col {}: {} [{}]",
            severity, self.span.line, self.span.col, self.message, self.rule_id
        )
    }
}

impl std::error::Error for ValidationError {}

// ============================================================================
// ValidationRule Trait
// ============================================================================

/// Trait that all lint rules implement.
///
/// Each rule checks one aspect of the program, independently of the others.
pub trait ValidationRule: Send + Sync {
    /// Unique identifier for this rule (e.g., "unused-variable")
    fn id(&self) -> &'static str;

    /// Human-readable description of what this rule checks
    fn description(&self) -> &'static str;

    /// Run the rule and return any findings. Empty means no issues.
    fn validate(&self, program: &Program) -> Vec<ValidationError>;
}

// ============================================================================
// Validator - Runs All Rules
// ============================================================================

/// Runs every registered lint rule.
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Validator {
    /// Create a new validator with all built-in rules.
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(rules::UnreachableCodeRule),
                Box::new(rules::UnusedVariableRule),
            ],
        }
    }

    /// Run all rules and collect findings, ordered by source position.
    pub fn validate(&self, program: &Program) -> Vec<ValidationError> {
        let mut findings: Vec<ValidationError> = self
            .rules
            .iter()
            .flat_map(|rule| rule.validate(program))
            .collect();
        findings.sort_by_key(|f| (f.span.start, f.rule_id));
        findings
    }

    /// Registered rules as (id, description)
    pub fn rules(&self) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
        self.rules.iter().map(|r| (r.id(), r.description()))
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Lint a program with every built-in rule.
pub fn lint_program(program: &Program) -> Vec<ValidationError> {
    Validator::new().validate(program)
}
