//! Symbol table: an arena of lexical scopes
//!
//! Scope 0 is the global scope holding user functions, builtins and domain
//! bindings. Each function body gets one child scope; a parallel block's
//! `SYNC` call gets a further child holding the branch result names. Scopes
//! point at their parent by id, never by reference.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::parser::ast::Span;

pub type ScopeId = usize;

pub const GLOBAL_SCOPE: ScopeId = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "t")]
pub enum SymbolKind {
    Function { arity: usize },
    Variable,
    DomainBinding { arity: Option<usize> },
    Builtin { arity: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub scope: ScopeId,
    /// Exporting pack, for domain bindings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pack: Option<String>,
    /// Definition site; absent for builtins and pack exports
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<Span>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Scope {
    pub id: ScopeId,
    pub parent: Option<ScopeId>,
    /// Function (or `SYNC` node) that owns this scope
    pub owner: Option<String>,
    pub symbols: BTreeMap<String, Symbol>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope {
                id: GLOBAL_SCOPE,
                parent: None,
                owner: None,
                symbols: BTreeMap::new(),
            }],
        }
    }

    pub fn add_scope(&mut self, parent: ScopeId, owner: impl Into<String>) -> ScopeId {
        let id = self.scopes.len();
        self.scopes.push(Scope {
            id,
            parent: Some(parent),
            owner: Some(owner.into()),
            symbols: BTreeMap::new(),
        });
        id
    }

    /// Define a symbol in `scope`. Returns false (and keeps the existing
    /// symbol) when the name is already defined in that scope.
    pub fn define(
        &mut self,
        scope: ScopeId,
        name: &str,
        kind: SymbolKind,
        pack: Option<String>,
        span: Option<Span>,
    ) -> bool {
        let Some(target) = self.scopes.get_mut(scope) else {
            return false;
        };
        if target.symbols.contains_key(name) {
            return false;
        }
        target.symbols.insert(
            name.to_string(),
            Symbol {
                name: name.to_string(),
                kind,
                scope,
                pack,
                span,
            },
        );
        true
    }

    /// Look a name up in `scope` only
    pub fn get(&self, scope: ScopeId, name: &str) -> Option<&Symbol> {
        self.scopes.get(scope)?.symbols.get(name)
    }

    /// Look a name up along the parent chain starting at `scope`
    pub fn lookup(&self, scope: ScopeId, name: &str) -> Option<&Symbol> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let scope = self.scopes.get(id)?;
            if let Some(symbol) = scope.symbols.get(name) {
                return Some(symbol);
            }
            current = scope.parent;
        }
        None
    }

    /// Variable lookup: only `Variable` symbols count
    pub fn lookup_variable(&self, scope: ScopeId, name: &str) -> Option<&Symbol> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let scope = self.scopes.get(id)?;
            if let Some(symbol) = scope.symbols.get(name) {
                if symbol.kind == SymbolKind::Variable {
                    return Some(symbol);
                }
            }
            current = scope.parent;
        }
        None
    }

    pub fn scope(&self, id: ScopeId) -> Option<&Scope> {
        self.scopes.get(id)
    }

    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }

    /// Child scope of the global scope owned by `function`
    pub fn function_scope(&self, function: &str) -> Option<ScopeId> {
        self.scopes
            .iter()
            .find(|s| s.parent == Some(GLOBAL_SCOPE) && s.owner.as_deref() == Some(function))
            .map(|s| s.id)
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}
