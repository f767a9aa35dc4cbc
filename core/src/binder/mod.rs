//! Domain-aware symbol binding
//!
//! Resolves every call in a parsed program to a [`CallTarget`] and checks
//! that variables are assigned before they are read. Resolution order for an
//! unqualified call is builtin, then user function, then domain export; a
//! `pack.fn(...)` qualifier always goes straight to the named pack.
//!
//! Binding never mutates its input: the returned [`BoundProgram`] owns a copy
//! of the program with call targets filled in.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

pub mod domain;
pub mod lint;
pub mod symbols;


pub use domain::{ActiveDomains, DomainPack, DomainRegistry, FunctionBinding, FunctionRegistry};
pub use symbols::{Scope, ScopeId, Symbol, SymbolKind, SymbolTable, GLOBAL_SCOPE};

use crate::executor::stdlib::Builtin;
use crate::parser::ast::*;

/* ===================== Error Types ===================== */

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BindError {
    #[error("bind error at {span}: undefined symbol '{name}'")]
    UndefinedSymbol { name: String, span: Span },

    #[error("bind error at {span}: '{name}' is exported by several active domains ({}); qualify the call", .packs.join(", "))]
    AmbiguousBinding {
        name: String,
        packs: Vec<String>,
        span: Span,
    },

    #[error("bind error at {span}: '{name}' is also exported by active domain '{pack}'")]
    DomainConflict {
        name: String,
        pack: String,
        span: Span,
    },

    #[error("bind error: unknown domain '{name}'")]
    UnknownDomain { name: String, span: Option<Span> },

    #[error("bind error at {span}: '{name}' is defined more than once")]
    DuplicateDefinition { name: String, span: Span },

    #[error("bind error at {span}: '{name}' expects {expected} argument(s), got {found}")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
        span: Span,
    },

    #[error("bind error at {span}: @on_fail=abort-loop used outside of a loop")]
    AbortOutsideLoop { span: Span },

    #[error("bind error: entry function '{name}' is not defined")]
    UnknownEntry { name: String },
}

impl BindError {
    pub fn span(&self) -> Option<Span> {
        match self {
            BindError::UndefinedSymbol { span, .. }
            | BindError::AmbiguousBinding { span, .. }
            | BindError::DomainConflict { span, .. }
            | BindError::DuplicateDefinition { span, .. }
            | BindError::ArityMismatch { span, .. }
            | BindError::AbortOutsideLoop { span } => Some(*span),
            BindError::UnknownDomain { span, .. } => *span,
            BindError::UnknownEntry { .. } => None,
        }
    }
}

pub type BindResult<T> = Result<T, BindError>;

/* ===================== Bound Program ===================== */

/// A program whose calls all carry a resolved target
#[derive(Debug, Clone)]
pub struct BoundProgram {
    pub program: Program,
    pub symbols: SymbolTable,
    pub domains: ActiveDomains,
    /// Function the interpreter starts in
    pub entry: String,
}

/* ===================== Public API ===================== */

/// Bind a program against an already resolved domain set
pub fn bind(program: &Program, domains: &ActiveDomains) -> BindResult<BoundProgram> {
    bind_with_entry(program, domains, None)
}

/// Bind with an explicit entry function. Without one the entry is the last
/// `#ENTRY=` directive, else `main`, else the first `DEF`.
pub fn bind_with_entry(
    program: &Program,
    domains: &ActiveDomains,
    entry: Option<&str>,
) -> BindResult<BoundProgram> {
    let mut binder = Binder::new(domains);
    binder.declare_globals(program)?;

    let entry = select_entry(program, entry)?;

    let mut bound = program.clone();
    for function in bound.functions.iter_mut() {
        binder.bind_function(function)?;
    }

    debug!(
        functions = bound.functions.len(),
        domains = ?domains.names(),
        entry = %entry,
        "Program bound"
    );

    Ok(BoundProgram {
        program: bound,
        symbols: binder.symbols,
        domains: domains.clone(),
        entry,
    })
}

fn select_entry(program: &Program, requested: Option<&str>) -> BindResult<String> {
    let name = requested
        .map(str::to_string)
        .or_else(|| program.directive_values("ENTRY").last().map(str::to_string));

    match name {
        Some(name) => match program.function(&name) {
            Some(_) => Ok(name),
            None => Err(BindError::UnknownEntry { name }),
        },
        None => program
            .function("main")
            .or_else(|| program.functions.first())
            .map(|f| f.name.clone())
            .ok_or_else(|| BindError::UnknownEntry {
                name: "main".to_string(),
            }),
    }
}

/* ===================== Binder ===================== */

struct Binder<'d> {
    domains: &'d ActiveDomains,
    symbols: SymbolTable,
    /// User function name -> parameter count
    functions: BTreeMap<String, usize>,
}

/// Per-function walk state
struct FnCtx {
    scope: ScopeId,
    loop_depth: usize,
}

impl<'d> Binder<'d> {
    fn new(domains: &'d ActiveDomains) -> Self {
        Self {
            domains,
            symbols: SymbolTable::new(),
            functions: BTreeMap::new(),
        }
    }

    /// Populate the global scope: builtins, user functions, pack exports
    fn declare_globals(&mut self, program: &Program) -> BindResult<()> {
        for builtin in Builtin::ALL {
            self.symbols.define(
                GLOBAL_SCOPE,
                builtin.name(),
                SymbolKind::Builtin {
                    arity: builtin.arity(),
                },
                None,
                None,
            );
        }

        for function in &program.functions {
            if let Some(pack) = self.domains.exporters(&function.name).first() {
                return Err(BindError::DomainConflict {
                    name: function.name.clone(),
                    pack: pack.name().to_string(),
                    span: function.span,
                });
            }
            let defined = self.symbols.define(
                GLOBAL_SCOPE,
                &function.name,
                SymbolKind::Function {
                    arity: function.params.len(),
                },
                None,
                Some(function.span),
            );
            if !defined {
                return Err(BindError::DuplicateDefinition {
                    name: function.name.clone(),
                    span: function.span,
                });
            }
            self.functions
                .insert(function.name.clone(), function.params.len());
        }

        for pack in self.domains.iter() {
            for export in pack.exports() {
                let arity = pack.lookup(export).and_then(|b| b.arity);
                self.symbols.define(
                    GLOBAL_SCOPE,
                    &format!("{}.{}", pack.name(), export),
                    SymbolKind::DomainBinding { arity },
                    Some(pack.name().to_string()),
                    None,
                );
                if self.domains.exporters(export).len() == 1 {
                    self.symbols.define(
                        GLOBAL_SCOPE,
                        export,
                        SymbolKind::DomainBinding { arity },
                        Some(pack.name().to_string()),
                        None,
                    );
                }
            }
        }

        Ok(())
    }

    fn bind_function(&mut self, function: &mut FunctionDef) -> BindResult<()> {
        let scope = self.symbols.add_scope(GLOBAL_SCOPE, function.name.clone());
        for param in &function.params {
            let defined = self.symbols.define(
                scope,
                &param.name,
                SymbolKind::Variable,
                None,
                Some(param.span),
            );
            if !defined {
                return Err(BindError::DuplicateDefinition {
                    name: param.name.clone(),
                    span: param.span,
                });
            }
        }

        let mut ctx = FnCtx {
            scope,
            loop_depth: 0,
        };
        self.bind_block(&mut function.body, &mut ctx)
    }

    fn bind_block(&mut self, stmts: &mut [Stmt], ctx: &mut FnCtx) -> BindResult<()> {
        for stmt in stmts.iter_mut() {
            self.bind_stmt(stmt, ctx)?;
        }
        Ok(())
    }

    fn bind_stmt(&mut self, stmt: &mut Stmt, ctx: &mut FnCtx) -> BindResult<()> {
        match stmt {
            Stmt::If {
                arms, else_body, ..
            } => {
                for arm in arms.iter_mut() {
                    self.resolve_expr(&mut arm.cond, ctx.scope)?;
                    self.bind_block(&mut arm.body, ctx)?;
                }
                if let Some(body) = else_body {
                    self.bind_block(body, ctx)?;
                }
            }

            Stmt::While { cond, body, .. } => {
                self.resolve_expr(cond, ctx.scope)?;
                ctx.loop_depth += 1;
                let result = self.bind_block(body, ctx);
                ctx.loop_depth -= 1;
                result?;
            }

            Stmt::For {
                var,
                var_span,
                iterable,
                body,
                ..
            } => {
                self.resolve_expr(iterable, ctx.scope)?;
                self.define_variable(ctx.scope, var, *var_span);
                ctx.loop_depth += 1;
                let result = self.bind_block(body, ctx);
                ctx.loop_depth -= 1;
                result?;
            }

            Stmt::Parallel(parallel) => self.bind_parallel(parallel, ctx)?,

            Stmt::Assign {
                target,
                target_span,
                value,
                ..
            } => {
                self.resolve_expr(value, ctx.scope)?;
                self.define_variable(ctx.scope, target, *target_span);
            }

            Stmt::Await {
                target, call, span, ..
            } => {
                self.resolve_call(call, ctx.scope)?;
                if let Some(target) = target {
                    self.define_variable(ctx.scope, target, *span);
                }
            }

            Stmt::Expr { expr, .. } => self.resolve_expr(expr, ctx.scope)?,

            Stmt::Return { value, .. } => {
                if let Some(value) = value {
                    self.resolve_expr(value, ctx.scope)?;
                }
            }

            Stmt::Validate { body, recover, .. } => {
                self.bind_block(body, ctx)?;
                if let Some(recover) = recover {
                    self.bind_block(recover, ctx)?;
                }
            }

            Stmt::Assert {
                cond,
                on_fail,
                span,
                ..
            } => {
                self.resolve_expr(cond, ctx.scope)?;
                if *on_fail == GateAction::AbortLoop && ctx.loop_depth == 0 {
                    return Err(BindError::AbortOutsideLoop { span: *span });
                }
            }
        }
        Ok(())
    }

    fn bind_parallel(&mut self, parallel: &mut Parallel, ctx: &mut FnCtx) -> BindResult<()> {
        // Branches only see the bindings that exist before the fork
        for branch in parallel.branches.iter_mut() {
            self.resolve_call(&mut branch.call, ctx.scope)?;
        }

        let sync_scope = self
            .symbols
            .add_scope(ctx.scope, format!("sync#{}", parallel.id));
        for branch in &parallel.branches {
            if let Some(name) = &branch.name {
                let defined = self.symbols.define(
                    sync_scope,
                    name,
                    SymbolKind::Variable,
                    None,
                    Some(branch.span),
                );
                if !defined {
                    return Err(BindError::DuplicateDefinition {
                        name: name.clone(),
                        span: branch.span,
                    });
                }
            }
        }
        self.resolve_call(&mut parallel.sync.call, sync_scope)?;

        if let Some(target) = &parallel.target {
            self.define_variable(ctx.scope, target, parallel.span);
        }
        Ok(())
    }

    fn define_variable(&mut self, scope: ScopeId, name: &str, span: Span) {
        // Reassignment keeps the first definition site
        self.symbols
            .define(scope, name, SymbolKind::Variable, None, Some(span));
    }

    /* ---------- expressions ---------- */

    fn resolve_expr(&mut self, expr: &mut Expr, scope: ScopeId) -> BindResult<()> {
        match expr {
            Expr::Literal { .. } => Ok(()),
            Expr::Ident { name, span } => {
                if self.symbols.lookup_variable(scope, name).is_some() {
                    Ok(())
                } else {
                    Err(BindError::UndefinedSymbol {
                        name: name.clone(),
                        span: *span,
                    })
                }
            }
            Expr::Binary { left, right, .. } => {
                self.resolve_expr(left, scope)?;
                self.resolve_expr(right, scope)
            }
            Expr::Unary { operand, .. } => self.resolve_expr(operand, scope),
            Expr::List { items, .. } => {
                for item in items.iter_mut() {
                    self.resolve_expr(item, scope)?;
                }
                Ok(())
            }
            Expr::Call(call) => self.resolve_call(call, scope),
        }
    }

    fn resolve_call(&mut self, call: &mut Call, scope: ScopeId) -> BindResult<()> {
        for arg in call.args.iter_mut() {
            self.resolve_expr(arg, scope)?;
        }
        call.target = Some(self.resolve_target(call)?);
        Ok(())
    }

    fn resolve_target(&self, call: &Call) -> BindResult<CallTarget> {
        let found = call.args.len();

        if let Some(qualifier) = &call.qualifier {
            let pack = self
                .domains
                .get(qualifier)
                .ok_or_else(|| BindError::UnknownDomain {
                    name: qualifier.clone(),
                    span: Some(call.span),
                })?;
            let binding = pack
                .lookup(&call.name)
                .ok_or_else(|| BindError::UndefinedSymbol {
                    name: call.display_name(),
                    span: call.span,
                })?;
            check_arity(&call.display_name(), binding.arity, found, call.span)?;
            return Ok(CallTarget::Domain {
                pack: pack.name().to_string(),
                function: call.name.clone(),
            });
        }

        let exporters = self.domains.exporters(&call.name);

        if let Some(builtin) = Builtin::from_name(&call.name) {
            if let Some(pack) = exporters.first() {
                return Err(BindError::DomainConflict {
                    name: call.name.clone(),
                    pack: pack.name().to_string(),
                    span: call.span,
                });
            }
            check_arity(&call.name, Some(builtin.arity()), found, call.span)?;
            return Ok(CallTarget::Builtin {
                name: call.name.clone(),
            });
        }

        if let Some(arity) = self.functions.get(&call.name) {
            check_arity(&call.name, Some(*arity), found, call.span)?;
            return Ok(CallTarget::User {
                name: call.name.clone(),
            });
        }

        match exporters.as_slice() {
            [] => Err(BindError::UndefinedSymbol {
                name: call.name.clone(),
                span: call.span,
            }),
            [pack] => {
                let arity = pack.lookup(&call.name).and_then(|b| b.arity);
                check_arity(&call.name, arity, found, call.span)?;
                Ok(CallTarget::Domain {
                    pack: pack.name().to_string(),
                    function: call.name.clone(),
                })
            }
            packs => Err(BindError::AmbiguousBinding {
                name: call.name.clone(),
                packs: packs.iter().map(|p| p.name().to_string()).collect(),
                span: call.span,
            }),
        }
    }
}

fn check_arity(name: &str, expected: Option<usize>, found: usize, span: Span) -> BindResult<()> {
    match expected {
        Some(expected) if expected != found => Err(BindError::ArityMismatch {
            name: name.to_string(),
            expected,
            found,
            span,
        }),
        _ => Ok(()),
    }
}
