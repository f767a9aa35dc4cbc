//! Compile-time error aggregation

use thiserror::Error;

use crate::binder::BindError;
use crate::ir::LowerError;
use crate::parser::ast::Span;
use crate::parser::lexer::LexError;
use crate::parser::ParseError;

/// Any failure between source text and a verified IR program
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Lower(#[from] LowerError),
}

impl CompileError {
    /// Source location of the failure, when the stage knows it
    pub fn span(&self) -> Option<Span> {
        match self {
            CompileError::Lex(e) => Some(e.span),
            CompileError::Parse(e) => Some(e.span),
            CompileError::Bind(e) => e.span(),
            CompileError::Lower(_) => None,
        }
    }

    /// Short name of the stage that failed
    pub fn stage(&self) -> &'static str {
        match self {
            CompileError::Lex(_) => "lex",
            CompileError::Parse(_) => "parse",
            CompileError::Bind(_) => "bind",
            CompileError::Lower(_) => "lower",
        }
    }
}
