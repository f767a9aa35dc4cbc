//! Runtime failure types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::ir::Position;
use crate::parser::ast::Span;

/* ===================== Failure Kinds ===================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A provider call failed, timed out or was rejected, or a join failed
    CallFailure,
    /// An `ASSERT` gate evaluated to false
    ValidationGateFailure,
    /// A region failed more often than its retry budget allows
    RetryBudgetExhausted,
    InternalInvariant,
    /// Type errors, unbound variables, division by zero
    EvaluationError,
    CallDepthExceeded,
}

impl FailureKind {
    /// Only call and gate failures are handed to the rollback manager
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FailureKind::CallFailure | FailureKind::ValidationGateFailure
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::CallFailure => "call_failure",
            FailureKind::ValidationGateFailure => "validation_gate_failure",
            FailureKind::RetryBudgetExhausted => "retry_budget_exhausted",
            FailureKind::InternalInvariant => "internal_invariant",
            FailureKind::EvaluationError => "evaluation_error",
            FailureKind::CallDepthExceeded => "call_depth_exceeded",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/* ===================== Runtime Failure ===================== */

/// A failure raised while executing a program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub struct RuntimeFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Function whose frame raised the failure; empty until located
    pub function: String,
    pub position: Option<Position>,
    pub span: Option<Span>,
    /// Retries consumed: by the region that gave up, else by the whole run
    pub retries: u32,
}

impl RuntimeFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            function: String::new(),
            position: None,
            span: None,
            retries: 0,
        }
    }

    pub fn call(message: impl Into<String>) -> Self {
        Self::new(FailureKind::CallFailure, message)
    }

    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::EvaluationError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InternalInvariant, message)
    }

    /// Record the run's retries on a failure no region gave up on
    pub fn with_run_retries(mut self, retries: u32) -> Self {
        if self.retries == 0 {
            self.retries = retries;
        }
        self
    }

    /// Fill in the location the first time the failure crosses a frame
    /// boundary. A failure that already has a location keeps it.
    pub fn located(mut self, function: &str, position: Position, span: Option<Span>) -> Self {
        if self.function.is_empty() {
            self.function = function.to_string();
            self.position = Some(position);
        }
        if self.span.is_none() {
            self.span = span;
        }
        self
    }
}

impl fmt::Display for RuntimeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if !self.function.is_empty() {
            write!(f, " in '{}'", self.function)?;
        }
        match (self.span, self.position) {
            (Some(span), _) => write!(f, " at line {}, col {}", span.line, span.col)?,
            (None, Some(position)) => write!(f, " at {}", position)?,
            (None, None) => {}
        }
        write!(f, ": {}", self.message)?;
        if self.retries > 0 {
            write!(f, " (after {} retries)", self.retries)?;
        }
        Ok(())
    }
}

/* ===================== Provider Errors ===================== */

/// Error returned by a capability provider
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    #[error("call failed: {0}")]
    Failed(String),
    #[error("call timed out after {0:?}")]
    TimedOut(Duration),
    #[error("call cancelled")]
    Cancelled,
    #[error("no capability registered for '{0}'")]
    Unsupported(String),
    #[error("call rejected by policy: {0}")]
    Rejected(String),
}

impl From<CallError> for RuntimeFailure {
    fn from(err: CallError) -> Self {
        RuntimeFailure::call(err.to_string())
    }
}
