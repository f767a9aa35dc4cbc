//! Recursive-descent parser for PNL
//!
//! Consumes the token stream produced by [`lexer::tokenize`] and builds the
//! [`ast::Program`]. Annotation values are type-checked here so later stages
//! only ever see well-formed probabilities, durations and retry counts.

use std::time::Duration;

use thiserror::Error;

pub mod ast;
pub mod lexer;

#[cfg(test)]
mod tests;

use ast::*;
use lexer::{Delimiter, Keyword, Operator, Token, TokenKind};

use crate::error::CompileError;

/* ===================== Error Types ===================== */

#[derive(Debug, Clone, PartialEq, Error)]
#[error("parse error at {span}: expected {expected}, found {found}")]
pub struct ParseError {
    pub expected: String,
    pub found: String,
    pub span: Span,
}

impl ParseError {
    fn new(expected: impl Into<String>, found: impl Into<String>, span: Span) -> Self {
        Self {
            expected: expected.into(),
            found: found.into(),
            span,
        }
    }
}

pub type ParseResult<T> = Result<T, ParseError>;

/* ===================== Public API ===================== */

/// Parse a token stream into a program
pub fn parse(tokens: &[Token]) -> ParseResult<Program> {
    Parser::new(tokens).parse_program()
}

/// Tokenize and parse source text in one step
pub fn parse_program(source: &str) -> Result<Program, CompileError> {
    let tokens = lexer::tokenize(source)?;
    Ok(parse(&tokens)?)
}

/* ===================== Annotations ===================== */

/// Which annotations a syntactic position accepts
#[derive(Debug, Clone, Copy)]
enum AnnotationSite {
    Arm,
    Parallel,
    Branch,
    Await,
    CallStatement,
    Validate,
    Assert,
}

impl AnnotationSite {
    fn allowed(&self) -> &'static [&'static str] {
        match self {
            AnnotationSite::Arm => &["p"],
            AnnotationSite::Parallel | AnnotationSite::Branch | AnnotationSite::Await => {
                &["timeout"]
            }
            AnnotationSite::CallStatement => &["timeout", "retry"],
            AnnotationSite::Validate => &["retry"],
            AnnotationSite::Assert => &["on_fail"],
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            AnnotationSite::Arm => "IF/ELIF arm",
            AnnotationSite::Parallel => "PARALLEL",
            AnnotationSite::Branch => "parallel branch",
            AnnotationSite::Await => "AWAIT",
            AnnotationSite::CallStatement => "call statement",
            AnnotationSite::Validate => "VALIDATE",
            AnnotationSite::Assert => "ASSERT",
        }
    }
}

#[derive(Debug, Default)]
struct Annotations {
    probability: Option<f64>,
    timeout: Option<Duration>,
    retry: Option<u32>,
    on_fail: Option<GateAction>,
}

const KNOWN_ANNOTATIONS: &[&str] = &["p", "timeout", "retry", "on_fail"];

/// Parse `250ms`, `30s`, `2m` or a bare number of seconds
pub fn parse_duration(text: &str) -> Option<Duration> {
    let (number, scale) = if let Some(n) = text.strip_suffix("ms") {
        (n, 0.001)
    } else if let Some(n) = text.strip_suffix('s') {
        (n, 1.0)
    } else if let Some(n) = text.strip_suffix('m') {
        (n, 60.0)
    } else {
        (text, 1.0)
    };
    let value: f64 = number.parse().ok()?;
    if value < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(value * scale).ok()
}

/* ===================== Parser ===================== */

struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
    eof: Token,
    prev_span: Span,
    next_id: NodeId,
}

impl<'t> Parser<'t> {
    fn new(tokens: &'t [Token]) -> Self {
        let eof_span = tokens.last().map(|t| t.span).unwrap_or_default();
        Self {
            tokens,
            pos: 0,
            eof: Token {
                kind: TokenKind::Eof,
                span: eof_span,
            },
            prev_span: Span::default(),
            next_id: 1,
        }
    }

    /* ---------- cursor ---------- */

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&self.eof)
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_nth(&self, n: usize) -> &TokenKind {
        self.tokens
            .get(self.pos + n)
            .map(|t| &t.kind)
            .unwrap_or(&self.eof.kind)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        self.prev_span = token.span;
        token
    }

    fn check_keyword(&self, kw: Keyword) -> bool {
        matches!(self.peek_kind(), TokenKind::Keyword(k) if *k == kw)
    }

    fn check_delim(&self, d: Delimiter) -> bool {
        matches!(self.peek_kind(), TokenKind::Delimiter(x) if *x == d)
    }

    fn check_op(&self, op: Operator) -> bool {
        matches!(self.peek_kind(), TokenKind::Operator(x) if *x == op)
    }

    fn eat_keyword(&mut self, kw: Keyword) -> bool {
        if self.check_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_delim(&mut self, d: Delimiter) -> bool {
        if self.check_delim(d) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_op(&mut self, op: Operator) -> bool {
        if self.check_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error_here(&self, expected: impl Into<String>) -> ParseError {
        let token = self.peek();
        ParseError::new(expected, token.kind.to_string(), token.span)
    }

    fn expect_keyword(&mut self, kw: Keyword) -> ParseResult<Span> {
        if self.check_keyword(kw) {
            Ok(self.advance().span)
        } else {
            Err(self.error_here(format!("'{}'", kw.as_str())))
        }
    }

    fn expect_delim(&mut self, d: Delimiter) -> ParseResult<Span> {
        if self.check_delim(d) {
            Ok(self.advance().span)
        } else {
            Err(self.error_here(format!("'{}'", d.as_str())))
        }
    }

    fn expect_ident(&mut self, what: &str) -> ParseResult<(String, Span)> {
        match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                let span = self.advance().span;
                Ok((name, span))
            }
            _ => Err(self.error_here(what.to_string())),
        }
    }

    fn fresh_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn span_from(&self, start: Span) -> Span {
        start.merge(&self.prev_span)
    }

    /* ---------- program ---------- */

    fn parse_program(&mut self) -> ParseResult<Program> {
        let mut directives = Vec::new();
        let mut functions = Vec::new();

        loop {
            match self.peek_kind().clone() {
                TokenKind::Eof => break,
                TokenKind::Directive { key, value } => {
                    let span = self.advance().span;
                    directives.push(Directive { key, value, span });
                }
                TokenKind::Keyword(Keyword::Def) => functions.push(self.parse_function()?),
                _ => return Err(self.error_here("'DEF' or a directive at top level")),
            }
        }

        Ok(Program {
            directives,
            functions,
        })
    }

    fn parse_function(&mut self) -> ParseResult<FunctionDef> {
        let start = self.expect_keyword(Keyword::Def)?;
        let id = self.fresh_id();
        let (name, _) = self.expect_ident("function name")?;

        self.expect_delim(Delimiter::LParen)?;
        let mut params = Vec::new();
        if !self.check_delim(Delimiter::RParen) {
            loop {
                let (param, span) = self.expect_ident("parameter name")?;
                params.push(Param { name: param, span });
                if !self.eat_delim(Delimiter::Comma) {
                    break;
                }
            }
        }
        self.expect_delim(Delimiter::RParen)?;
        self.eat_delim(Delimiter::Colon);

        let body = self.parse_body()?;

        Ok(FunctionDef {
            id,
            name,
            params,
            body,
            span: self.span_from(start),
        })
    }

    /// `{ stmts }`, `-> stmt` or a single statement
    fn parse_body(&mut self) -> ParseResult<Vec<Stmt>> {
        if self.check_delim(Delimiter::LBrace) {
            return self.parse_block();
        }
        self.eat_op(Operator::Arrow);
        Ok(vec![self.parse_statement()?])
    }

    fn parse_block(&mut self) -> ParseResult<Vec<Stmt>> {
        self.expect_delim(Delimiter::LBrace)?;
        let mut stmts = Vec::new();
        while !self.check_delim(Delimiter::RBrace) {
            if matches!(self.peek_kind(), TokenKind::Eof) {
                return Err(self.error_here("'}'"));
            }
            stmts.push(self.parse_statement()?);
        }
        self.expect_delim(Delimiter::RBrace)?;
        Ok(stmts)
    }

    /* ---------- statements ---------- */

    fn parse_statement(&mut self) -> ParseResult<Stmt> {
        let stmt = match self.peek_kind().clone() {
            TokenKind::Keyword(Keyword::If) => self.parse_if()?,
            TokenKind::Keyword(Keyword::While) => self.parse_while()?,
            TokenKind::Keyword(Keyword::For) => self.parse_for()?,
            TokenKind::Keyword(Keyword::Parallel) => Stmt::Parallel(self.parse_parallel(None)?),
            TokenKind::Keyword(Keyword::Validate) => self.parse_validate()?,
            TokenKind::Keyword(Keyword::Assert) => self.parse_assert()?,
            TokenKind::Keyword(Keyword::Return) => self.parse_return()?,
            TokenKind::Keyword(Keyword::Await) => {
                let start = self.peek().span;
                self.parse_await(None, start)?
            }
            TokenKind::Ident(name)
                if matches!(self.peek_nth(1), TokenKind::Operator(Operator::Assign)) =>
            {
                self.parse_assignment(name)?
            }
            TokenKind::Directive { .. } => {
                return Err(self.error_here("a statement (directives belong at top level)"))
            }
            _ => self.parse_expr_statement()?,
        };
        self.eat_delim(Delimiter::Semicolon);
        Ok(stmt)
    }

    fn parse_if(&mut self) -> ParseResult<Stmt> {
        let start = self.expect_keyword(Keyword::If)?;
        let id = self.fresh_id();
        let mut arms = vec![self.parse_arm(start)?];

        while self.check_keyword(Keyword::Elif) {
            let arm_start = self.advance().span;
            arms.push(self.parse_arm(arm_start)?);
        }

        let else_body = if self.eat_keyword(Keyword::Else) {
            Some(self.parse_body()?)
        } else {
            None
        };

        Ok(Stmt::If {
            id,
            arms,
            else_body,
            span: self.span_from(start),
        })
    }

    fn parse_arm(&mut self, start: Span) -> ParseResult<CondArm> {
        let cond = self.parse_expr()?;
        let annotations = self.parse_annotations(AnnotationSite::Arm)?;
        let body = self.parse_body()?;
        Ok(CondArm {
            cond,
            probability: annotations.probability,
            body,
            span: self.span_from(start),
        })
    }

    fn parse_while(&mut self) -> ParseResult<Stmt> {
        let start = self.expect_keyword(Keyword::While)?;
        let id = self.fresh_id();
        let cond = self.parse_expr()?;
        let body = self.parse_body()?;
        Ok(Stmt::While {
            id,
            cond,
            body,
            span: self.span_from(start),
        })
    }

    fn parse_for(&mut self) -> ParseResult<Stmt> {
        let start = self.expect_keyword(Keyword::For)?;
        let id = self.fresh_id();
        let (var, var_span) = self.expect_ident("loop variable")?;
        self.expect_keyword(Keyword::In)?;
        let iterable = self.parse_expr()?;
        let body = self.parse_body()?;
        Ok(Stmt::For {
            id,
            var,
            var_span,
            iterable,
            body,
            span: self.span_from(start),
        })
    }

    fn parse_parallel(&mut self, target: Option<(String, Span)>) -> ParseResult<Parallel> {
        let keyword_span = self.expect_keyword(Keyword::Parallel)?;
        let start = target.as_ref().map(|(_, s)| *s).unwrap_or(keyword_span);
        let id = self.fresh_id();
        let annotations = self.parse_annotations(AnnotationSite::Parallel)?;

        self.expect_delim(Delimiter::LBrace)?;
        let mut branches = Vec::new();
        while self.check_op(Operator::Arrow) {
            branches.push(self.parse_branch()?);
        }
        if branches.is_empty() {
            return Err(self.error_here("'->' starting a parallel branch"));
        }
        self.expect_delim(Delimiter::RBrace)?;

        let sync_start = self.expect_keyword(Keyword::Sync)?;
        let quantifier = if self.eat_keyword(Keyword::All) {
            Quantifier::All
        } else if self.eat_keyword(Keyword::Any) {
            Quantifier::Any
        } else if self.eat_keyword(Keyword::None) {
            Quantifier::None
        } else {
            Quantifier::All
        };
        let call = self.parse_call()?;
        let sync = SyncClause {
            quantifier,
            call,
            span: self.span_from(sync_start),
        };

        Ok(Parallel {
            id,
            target: target.map(|(name, _)| name),
            branches,
            timeout: annotations.timeout,
            sync,
            span: self.span_from(start),
        })
    }

    fn parse_branch(&mut self) -> ParseResult<ParallelBranch> {
        let start = self.advance().span; // '->'
        let id = self.fresh_id();

        let named = matches!(self.peek_nth(1), TokenKind::Operator(Operator::Assign));
        let name = match self.peek_kind().clone() {
            TokenKind::Ident(name) if named => {
                self.advance();
                self.advance();
                Some(name)
            }
            _ => None,
        };

        let call = self.parse_call()?;
        let annotations = self.parse_annotations(AnnotationSite::Branch)?;
        self.eat_delim(Delimiter::Semicolon);

        Ok(ParallelBranch {
            id,
            name,
            call,
            timeout: annotations.timeout,
            span: self.span_from(start),
        })
    }

    fn parse_validate(&mut self) -> ParseResult<Stmt> {
        let start = self.expect_keyword(Keyword::Validate)?;
        let id = self.fresh_id();
        let annotations = self.parse_annotations(AnnotationSite::Validate)?;
        let body = self.parse_block()?;
        let recover = if self.eat_keyword(Keyword::Recover) {
            Some(self.parse_block()?)
        } else {
            None
        };
        Ok(Stmt::Validate {
            id,
            retry: annotations.retry,
            body,
            recover,
            span: self.span_from(start),
        })
    }

    fn parse_assert(&mut self) -> ParseResult<Stmt> {
        let start = self.expect_keyword(Keyword::Assert)?;
        let id = self.fresh_id();
        let cond = self.parse_expr()?;
        let annotations = self.parse_annotations(AnnotationSite::Assert)?;
        Ok(Stmt::Assert {
            id,
            cond,
            on_fail: annotations.on_fail.unwrap_or_default(),
            span: self.span_from(start),
        })
    }

    fn parse_return(&mut self) -> ParseResult<Stmt> {
        let start = self.expect_keyword(Keyword::Return)?;
        let id = self.fresh_id();
        let value = if self.starts_expression() {
            Some(self.parse_expr()?)
        } else {
            None
        };
        Ok(Stmt::Return {
            id,
            value,
            span: self.span_from(start),
        })
    }

    fn parse_await(&mut self, target: Option<String>, start: Span) -> ParseResult<Stmt> {
        self.expect_keyword(Keyword::Await)?;
        let id = self.fresh_id();
        let call = self.parse_call()?;
        let annotations = self.parse_annotations(AnnotationSite::Await)?;
        Ok(Stmt::Await {
            id,
            target,
            call,
            timeout: annotations.timeout,
            span: self.span_from(start),
        })
    }

    fn parse_assignment(&mut self, target: String) -> ParseResult<Stmt> {
        let target_span = self.advance().span;
        self.advance(); // '='

        if self.check_keyword(Keyword::Await) {
            return self.parse_await(Some(target), target_span);
        }
        if self.check_keyword(Keyword::Parallel) {
            return Ok(Stmt::Parallel(
                self.parse_parallel(Some((target, target_span)))?,
            ));
        }

        let id = self.fresh_id();
        let value = self.parse_expr()?;
        let options = self.parse_call_options(&value)?;
        Ok(Stmt::Assign {
            id,
            target,
            target_span,
            value,
            options,
            span: self.span_from(target_span),
        })
    }

    fn parse_expr_statement(&mut self) -> ParseResult<Stmt> {
        if !self.starts_expression() {
            return Err(self.error_here("a statement"));
        }
        let start = self.peek().span;
        let id = self.fresh_id();
        let expr = self.parse_expr()?;
        let options = self.parse_call_options(&expr)?;
        Ok(Stmt::Expr {
            id,
            expr,
            options,
            span: self.span_from(start),
        })
    }

    /// `@timeout`/`@retry` are only meaningful when the statement is a call
    fn parse_call_options(&mut self, value: &Expr) -> ParseResult<CallOptions> {
        if !matches!(self.peek_kind(), TokenKind::Annotation { .. }) {
            return Ok(CallOptions::default());
        }
        if !matches!(value, Expr::Call(_)) {
            return Err(self.error_here("no annotation on a non-call expression"));
        }
        let annotations = self.parse_annotations(AnnotationSite::CallStatement)?;
        Ok(CallOptions {
            timeout: annotations.timeout,
            retry: annotations.retry,
        })
    }

    fn parse_annotations(&mut self, site: AnnotationSite) -> ParseResult<Annotations> {
        let mut out = Annotations::default();

        while let TokenKind::Annotation { name, value } = self.peek_kind().clone() {
            let token = self.peek().clone();
            let found = token.kind.to_string();

            if !KNOWN_ANNOTATIONS.contains(&name.as_str()) {
                return Err(ParseError::new(
                    format!("one of @{}", KNOWN_ANNOTATIONS.join(", @")),
                    found,
                    token.span,
                ));
            }
            if !site.allowed().contains(&name.as_str()) {
                return Err(ParseError::new(
                    format!(
                        "annotation allowed on {} (@{})",
                        site.describe(),
                        site.allowed().join(", @")
                    ),
                    found,
                    token.span,
                ));
            }

            let duplicate = match name.as_str() {
                "p" => {
                    let p = value
                        .parse::<f64>()
                        .ok()
                        .filter(|p| (0.0..=1.0).contains(p))
                        .ok_or_else(|| {
                            ParseError::new("probability between 0 and 1", &found, token.span)
                        })?;
                    out.probability.replace(p).is_some()
                }
                "timeout" => {
                    let d = parse_duration(&value).ok_or_else(|| {
                        ParseError::new(
                            "non-negative duration (250ms, 30s, 2m)",
                            &found,
                            token.span,
                        )
                    })?;
                    out.timeout.replace(d).is_some()
                }
                "retry" => {
                    let n = value.parse::<u32>().map_err(|_| {
                        ParseError::new("non-negative integer retry count", &found, token.span)
                    })?;
                    out.retry.replace(n).is_some()
                }
                _ => {
                    let action = match value.as_str() {
                        "rollback" => GateAction::Rollback,
                        "abort-loop" => GateAction::AbortLoop,
                        _ => {
                            return Err(ParseError::new(
                                "'rollback' or 'abort-loop'",
                                &found,
                                token.span,
                            ))
                        }
                    };
                    out.on_fail.replace(action).is_some()
                }
            };

            if duplicate {
                return Err(ParseError::new(
                    format!("at most one @{}", name),
                    found,
                    token.span,
                ));
            }
            self.advance();
        }

        Ok(out)
    }

    /* ---------- expressions ---------- */

    fn starts_expression(&self) -> bool {
        match self.peek_kind() {
            TokenKind::Ident(_) => !matches!(self.peek_nth(1), TokenKind::Operator(Operator::Assign)),
            TokenKind::Number(_) | TokenKind::Str(_) => true,
            TokenKind::Keyword(kw) => matches!(
                kw,
                Keyword::True | Keyword::False | Keyword::Null | Keyword::Not
            ),
            TokenKind::Operator(op) => matches!(op, Operator::Minus | Operator::Bang),
            TokenKind::Delimiter(d) => matches!(d, Delimiter::LParen | Delimiter::LBracket),
            _ => false,
        }
    }

    fn parse_expr(&mut self) -> ParseResult<Expr> {
        self.parse_binary(0)
    }

    fn peek_binary_op(&self) -> Option<BinaryOp> {
        let op = match self.peek_kind() {
            TokenKind::Keyword(Keyword::Or) => BinaryOp::Or,
            TokenKind::Keyword(Keyword::And) => BinaryOp::And,
            TokenKind::Operator(op) => match op {
                Operator::EqEq => BinaryOp::Eq,
                Operator::NotEq => BinaryOp::Ne,
                Operator::Lt => BinaryOp::Lt,
                Operator::LtEq => BinaryOp::Le,
                Operator::Gt => BinaryOp::Gt,
                Operator::GtEq => BinaryOp::Ge,
                Operator::Plus => BinaryOp::Add,
                Operator::Minus => BinaryOp::Sub,
                Operator::Star => BinaryOp::Mul,
                Operator::Slash => BinaryOp::Div,
                Operator::Percent => BinaryOp::Rem,
                _ => return None,
            },
            _ => return None,
        };
        Some(op)
    }

    /// Precedence climbing; all binary operators are left-associative
    fn parse_binary(&mut self, min_prec: u8) -> ParseResult<Expr> {
        let mut left = self.parse_unary()?;

        while let Some(op) = self.peek_binary_op() {
            let prec = precedence(op);
            if prec < min_prec {
                break;
            }
            self.advance();
            let right = self.parse_binary(prec + 1)?;
            let span = left.span().merge(&right.span());
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
                span,
            };
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        let op = match self.peek_kind() {
            TokenKind::Keyword(Keyword::Not) | TokenKind::Operator(Operator::Bang) => {
                Some(UnaryOp::Not)
            }
            TokenKind::Operator(Operator::Minus) => Some(UnaryOp::Neg),
            _ => None,
        };

        match op {
            Some(op) => {
                let start = self.advance().span;
                let operand = self.parse_unary()?;
                let span = start.merge(&operand.span());
                Ok(Expr::Unary {
                    op,
                    operand: Box::new(operand),
                    span,
                })
            }
            None => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Literal {
                    value: Literal::Num(n),
                    span: token.span,
                })
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::Literal {
                    value: Literal::Str(s),
                    span: token.span,
                })
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                Ok(Expr::Literal {
                    value: Literal::Bool(true),
                    span: token.span,
                })
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                Ok(Expr::Literal {
                    value: Literal::Bool(false),
                    span: token.span,
                })
            }
            TokenKind::Keyword(Keyword::Null) => {
                self.advance();
                Ok(Expr::Literal {
                    value: Literal::Null,
                    span: token.span,
                })
            }
            TokenKind::Ident(name) => {
                let is_call = match self.peek_nth(1) {
                    TokenKind::Delimiter(Delimiter::LParen) => true,
                    TokenKind::Delimiter(Delimiter::Dot) => true,
                    _ => false,
                };
                if is_call {
                    return Ok(Expr::Call(self.parse_call()?));
                }
                self.advance();
                Ok(Expr::Ident {
                    name,
                    span: token.span,
                })
            }
            TokenKind::Delimiter(Delimiter::LParen) => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect_delim(Delimiter::RParen)?;
                Ok(inner)
            }
            TokenKind::Delimiter(Delimiter::LBracket) => {
                self.advance();
                let mut items = Vec::new();
                if !self.check_delim(Delimiter::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        if !self.eat_delim(Delimiter::Comma) {
                            break;
                        }
                    }
                }
                self.expect_delim(Delimiter::RBracket)?;
                Ok(Expr::List {
                    items,
                    span: self.span_from(token.span),
                })
            }
            _ => Err(self.error_here("an expression")),
        }
    }

    /// `[pack.]name(args)`
    fn parse_call(&mut self) -> ParseResult<Call> {
        let (first, start) = self.expect_ident("function name")?;
        let id = self.fresh_id();

        let (qualifier, name) = if self.eat_delim(Delimiter::Dot) {
            let (name, _) = self.expect_ident("function name after '.'")?;
            (Some(first), name)
        } else {
            (None, first)
        };

        self.expect_delim(Delimiter::LParen)?;
        let mut args = Vec::new();
        if !self.check_delim(Delimiter::RParen) {
            loop {
                args.push(self.parse_expr()?);
                if !self.eat_delim(Delimiter::Comma) {
                    break;
                }
            }
        }
        self.expect_delim(Delimiter::RParen)?;

        Ok(Call {
            id,
            qualifier,
            name,
            args,
            target: None,
            span: self.span_from(start),
        })
    }
}

fn precedence(op: BinaryOp) -> u8 {
    match op {
        BinaryOp::Or => 1,
        BinaryOp::And => 2,
        BinaryOp::Eq | BinaryOp::Ne => 3,
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 4,
        BinaryOp::Add | BinaryOp::Sub => 5,
        BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 6,
    }
}
