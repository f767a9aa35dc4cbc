//! Pluggable policies around provider calls

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::provider::{lock, CallRequest};
use super::types::Val;

/// Whether a call may reach the provider
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Proceed,
    Reject(String),
}

/// Hooks the interpreter consults around every domain call. The defaults do
/// nothing, so a policy only overrides what it needs.
pub trait CallPolicy: Send + Sync {
    fn admit(&self, _request: &CallRequest) -> Admission {
        Admission::Proceed
    }

    /// A stored result that replaces the provider call
    fn lookup(&self, _request: &CallRequest) -> Option<Val> {
        None
    }

    /// Called with every successful provider result
    fn store(&self, _request: &CallRequest, _result: &Val) {}
}

/// Pass every call through unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPolicy;

impl CallPolicy for NoPolicy {}

/// Memoises successful results by pack, function and arguments
#[derive(Debug, Default)]
pub struct ResultCache {
    entries: Mutex<HashMap<String, Val>>,
    hits: AtomicU64,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key(request: &CallRequest) -> String {
        let args: Vec<serde_json::Value> = request.args.iter().map(Val::to_json).collect();
        format!(
            "{}({})",
            request.qualified_name(),
            serde_json::Value::Array(args)
        )
    }
}

impl CallPolicy for ResultCache {
    fn lookup(&self, request: &CallRequest) -> Option<Val> {
        let hit = lock(&self.entries).get(&Self::key(request)).cloned();
        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    fn store(&self, request: &CallRequest, result: &Val) {
        lock(&self.entries).insert(Self::key(request), result.clone());
    }
}

/// Rejects calls once a fixed number has been admitted
#[derive(Debug)]
pub struct CallBudget {
    limit: u64,
    used: AtomicU64,
}

impl CallBudget {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: AtomicU64::new(0),
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }
}

impl CallPolicy for CallBudget {
    fn admit(&self, request: &CallRequest) -> Admission {
        let used = self.used.fetch_add(1, Ordering::Relaxed);
        if used < self.limit {
            Admission::Proceed
        } else {
            self.used.fetch_sub(1, Ordering::Relaxed);
            Admission::Reject(format!(
                "call budget of {} exhausted before '{}'",
                self.limit,
                request.qualified_name()
            ))
        }
    }
}
