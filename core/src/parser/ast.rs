//! Abstract Syntax Tree node types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/* ===================== Spans and Ids ===================== */

/// Source location span for error reporting and tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Span {
    /// Start byte offset
    pub start: usize,
    /// End byte offset
    pub end: usize,
    /// Start line (1-indexed)
    pub line: usize,
    /// Start column (1-indexed)
    pub col: usize,
}

impl Span {
    pub fn new(start: usize, end: usize, line: usize, col: usize) -> Self {
        Self {
            start,
            end,
            line,
            col,
        }
    }

    /// Create a span that covers both self and other
    pub fn merge(&self, other: &Span) -> Span {
        let (line, col) = if self.start <= other.start {
            (self.line, self.col)
        } else {
            (other.line, other.col)
        };
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
            line,
            col,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// Unique id of a statement or call node within one program
pub type NodeId = u32;

/* ===================== Program ===================== */

/// A parsed PNL source file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub directives: Vec<Directive>,
    pub functions: Vec<FunctionDef>,
}

impl Program {
    /// All values of a directive key, in source order
    pub fn directive_values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.directives
            .iter()
            .filter(move |d| d.key == key)
            .map(|d| d.value.as_str())
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.iter().find(|f| f.name == name)
    }
}

/// `#KEY=value`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    pub key: String,
    pub value: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub span: Span,
}

/// `DEF name(params): body`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub id: NodeId,
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

/* ===================== Annotations ===================== */

/// What a failed validation gate does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GateAction {
    /// Restore the nearest checkpoint and retry or recover
    #[default]
    Rollback,
    /// Leave the innermost enclosing loop
    AbortLoop,
}

/// Join policy of a parallel block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Quantifier {
    #[default]
    All,
    Any,
    None,
}

impl fmt::Display for Quantifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantifier::All => write!(f, "ALL"),
            Quantifier::Any => write!(f, "ANY"),
            Quantifier::None => write!(f, "NONE"),
        }
    }
}

/// Annotations accepted on call statements
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct CallOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
}

/* ===================== Statements ===================== */

/// One `IF`/`ELIF` arm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CondArm {
    pub cond: Expr,
    /// `@p=` annotation, advisory only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

/// One `-> name = call()` line inside `PARALLEL`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelBranch {
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub call: Call,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    pub span: Span,
}

/// `SYNC [ALL|ANY|NONE] join(args)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncClause {
    pub quantifier: Quantifier,
    pub call: Call,
    pub span: Span,
}

/// `[target =] PARALLEL @timeout=.. { branches } SYNC ..`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parallel {
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub branches: Vec<ParallelBranch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    pub sync: SyncClause,
    pub span: Span,
}

/// Statement AST node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum Stmt {
    If {
        id: NodeId,
        arms: Vec<CondArm>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        else_body: Option<Vec<Stmt>>,
        span: Span,
    },
    While {
        id: NodeId,
        cond: Expr,
        body: Vec<Stmt>,
        span: Span,
    },
    For {
        id: NodeId,
        var: String,
        var_span: Span,
        iterable: Expr,
        body: Vec<Stmt>,
        span: Span,
    },
    Parallel(Parallel),
    Assign {
        id: NodeId,
        target: String,
        target_span: Span,
        value: Expr,
        #[serde(default)]
        options: CallOptions,
        span: Span,
    },
    /// `target = AWAIT call()`: dispatch without blocking
    Await {
        id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        call: Call,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<Duration>,
        span: Span,
    },
    Expr {
        id: NodeId,
        expr: Expr,
        #[serde(default)]
        options: CallOptions,
        span: Span,
    },
    Return {
        id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Expr>,
        span: Span,
    },
    /// Transactional block guarded by a rollback checkpoint
    Validate {
        id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry: Option<u32>,
        body: Vec<Stmt>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recover: Option<Vec<Stmt>>,
        span: Span,
    },
    /// Validation gate
    Assert {
        id: NodeId,
        cond: Expr,
        #[serde(default)]
        on_fail: GateAction,
        span: Span,
    },
}

impl Stmt {
    pub fn id(&self) -> NodeId {
        match self {
            Stmt::If { id, .. }
            | Stmt::While { id, .. }
            | Stmt::For { id, .. }
            | Stmt::Assign { id, .. }
            | Stmt::Await { id, .. }
            | Stmt::Expr { id, .. }
            | Stmt::Return { id, .. }
            | Stmt::Validate { id, .. }
            | Stmt::Assert { id, .. } => *id,
            Stmt::Parallel(p) => p.id,
        }
    }

    /// Get the span of this statement
    pub fn span(&self) -> Span {
        match self {
            Stmt::If { span, .. }
            | Stmt::While { span, .. }
            | Stmt::For { span, .. }
            | Stmt::Assign { span, .. }
            | Stmt::Await { span, .. }
            | Stmt::Expr { span, .. }
            | Stmt::Return { span, .. }
            | Stmt::Validate { span, .. }
            | Stmt::Assert { span, .. } => *span,
            Stmt::Parallel(p) => p.span,
        }
    }
}

/* ===================== Expressions ===================== */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Literal {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// Where a call goes, filled in by the binder
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum CallTarget {
    /// A `DEF` in this program
    User { name: String },
    /// An in-process builtin
    Builtin { name: String },
    /// An export of a domain pack, dispatched to the capability provider
    Domain { pack: String, function: String },
}

impl fmt::Display for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallTarget::User { name } => write!(f, "{}", name),
            CallTarget::Builtin { name } => write!(f, "builtin {}", name),
            CallTarget::Domain { pack, function } => write!(f, "{}.{}", pack, function),
        }
    }
}

/// `[qualifier.]name(args)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualifier: Option<String>,
    pub name: String,
    pub args: Vec<Expr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<CallTarget>,
    pub span: Span,
}

impl Call {
    /// Name as written in source, including the pack qualifier
    pub fn display_name(&self) -> String {
        match &self.qualifier {
            Some(q) => format!("{}.{}", q, self.name),
            None => self.name.clone(),
        }
    }
}

/// Expression AST node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum Expr {
    Literal {
        value: Literal,
        span: Span,
    },
    Ident {
        name: String,
        span: Span,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        span: Span,
    },
    List {
        items: Vec<Expr>,
        span: Span,
    },
    Call(Call),
}

impl Expr {
    /// Get the span of this expression
    pub fn span(&self) -> Span {
        match self {
            Expr::Literal { span, .. }
            | Expr::Ident { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Unary { span, .. }
            | Expr::List { span, .. } => *span,
            Expr::Call(call) => call.span,
        }
    }

    /// Visit every call nested in this expression, outermost first
    pub fn walk_calls<'a>(&'a self, f: &mut dyn FnMut(&'a Call)) {
        match self {
            Expr::Literal { .. } | Expr::Ident { .. } => {}
            Expr::Binary { left, right, .. } => {
                left.walk_calls(f);
                right.walk_calls(f);
            }
            Expr::Unary { operand, .. } => operand.walk_calls(f),
            Expr::List { items, .. } => {
                for item in items {
                    item.walk_calls(f);
                }
            }
            Expr::Call(call) => {
                f(call);
                for arg in &call.args {
                    arg.walk_calls(f);
                }
            }
        }
    }

    /// Visit every identifier read by this expression
    pub fn walk_idents<'a>(&'a self, f: &mut dyn FnMut(&'a str, Span)) {
        match self {
            Expr::Literal { .. } => {}
            Expr::Ident { name, span } => f(name, *span),
            Expr::Binary { left, right, .. } => {
                left.walk_idents(f);
                right.walk_idents(f);
            }
            Expr::Unary { operand, .. } => operand.walk_idents(f),
            Expr::List { items, .. } => {
                for item in items {
                    item.walk_idents(f);
                }
            }
            Expr::Call(call) => {
                for arg in &call.args {
                    arg.walk_idents(f);
                }
            }
        }
    }
}
