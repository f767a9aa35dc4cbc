//! Domain packs
//!
//! A domain pack is a named bundle of function bindings that the binder can
//! resolve calls against. Packs are registered once, selected per program by
//! `#DOMAIN=` directives (or a configuration override), and are immutable
//! after binding.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::BindError;
use crate::parser::ast::{Program, Span};

/* ===================== Bindings ===================== */

/// One function exported by a pack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionBinding {
    pub name: String,
    /// Fixed argument count, when the pack declares one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arity: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FunctionBinding {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arity: None,
            description: None,
        }
    }

    pub fn with_arity(mut self, arity: usize) -> Self {
        self.arity = Some(arity);
        self
    }
}

/// Lookup capability the binder needs from a pack
pub trait FunctionRegistry: Send + Sync {
    /// Pack name as used in `#DOMAIN=` and `pack.fn(...)`
    fn name(&self) -> &str;

    fn lookup(&self, function: &str) -> Option<&FunctionBinding>;

    /// Exported function names in a stable order
    fn exports(&self) -> Vec<&str>;
}

/// A pack defined by data, typically loaded from TOML
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainPack {
    pub name: String,
    #[serde(default)]
    pub functions: Vec<FunctionBinding>,
}

impl DomainPack {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
        }
    }

    pub fn with_function(mut self, binding: FunctionBinding) -> Self {
        self.functions.push(binding);
        self
    }
}

impl FunctionRegistry for DomainPack {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookup(&self, function: &str) -> Option<&FunctionBinding> {
        self.functions.iter().find(|f| f.name == function)
    }

    fn exports(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.iter().map(|f| f.name.as_str()).collect();
        names.sort_unstable();
        names
    }
}

/* ===================== Registry ===================== */

#[derive(Debug, Error)]
pub enum DomainLoadError {
    #[error("failed to read domain packs from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid domain pack file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("domain pack '{0}' is defined more than once")]
    DuplicatePack(String),
}

/// `[[packs]]` array in a packs file
#[derive(Debug, Deserialize)]
struct PackFile {
    #[serde(default)]
    packs: Vec<DomainPack>,
}

/// Every pack the host knows about
#[derive(Clone, Default)]
pub struct DomainRegistry {
    packs: BTreeMap<String, Arc<dyn FunctionRegistry>>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pack, replacing any previous pack with the same name
    pub fn register(&mut self, pack: impl FunctionRegistry + 'static) {
        self.packs.insert(pack.name().to_string(), Arc::new(pack));
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn FunctionRegistry>> {
        self.packs.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.packs.keys().map(String::as_str)
    }

    /// Parse packs from TOML:
    ///
    /// ```toml
    /// [[packs]]
    /// name = "medical"
    /// functions = [{ name = "triage", arity = 1 }]
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self, DomainLoadError> {
        let file: PackFile = toml::from_str(source)?;
        let mut registry = Self::new();
        for pack in file.packs {
            if registry.packs.contains_key(&pack.name) {
                return Err(DomainLoadError::DuplicatePack(pack.name));
            }
            registry.register(pack);
        }
        Ok(registry)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, DomainLoadError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| DomainLoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }
}

impl fmt::Debug for DomainRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.packs.keys()).finish()
    }
}

/* ===================== Active Set ===================== */

/// The packs a single program binds against, in activation order
#[derive(Clone, Default)]
pub struct ActiveDomains {
    packs: Vec<Arc<dyn FunctionRegistry>>,
}

impl ActiveDomains {
    pub fn none() -> Self {
        Self::default()
    }

    /// Select packs from the override list when given, else from the
    /// program's `#DOMAIN=` directives. Values may be comma separated;
    /// repeated names are activated once.
    pub fn resolve(
        program: &Program,
        registry: &DomainRegistry,
        override_names: Option<&[String]>,
    ) -> Result<Self, BindError> {
        let mut requested: Vec<(String, Option<Span>)> = Vec::new();

        match override_names {
            Some(names) => {
                for name in names {
                    requested.push((name.clone(), None));
                }
            }
            None => {
                for directive in program.directives.iter().filter(|d| d.key == "DOMAIN") {
                    for name in directive.value.split(',') {
                        requested.push((name.to_string(), Some(directive.span)));
                    }
                }
            }
        }

        let mut active = Self::none();
        for (name, span) in requested {
            let name = name.trim();
            if name.is_empty() || active.get(name).is_some() {
                continue;
            }
            let pack = registry.lookup(name).ok_or_else(|| BindError::UnknownDomain {
                name: name.to_string(),
                span,
            })?;
            active.packs.push(pack);
        }

        Ok(active)
    }

    pub fn from_packs(packs: impl IntoIterator<Item = Arc<dyn FunctionRegistry>>) -> Self {
        Self {
            packs: packs.into_iter().collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn FunctionRegistry>> {
        self.packs.iter().find(|p| p.name() == name)
    }

    /// Packs exporting `function`, in activation order
    pub fn exporters(&self, function: &str) -> Vec<&Arc<dyn FunctionRegistry>> {
        self.packs
            .iter()
            .filter(|p| p.lookup(function).is_some())
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.packs.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn FunctionRegistry>> {
        self.packs.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.packs.is_empty()
    }
}

impl fmt::Debug for ActiveDomains {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
