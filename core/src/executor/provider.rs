//! Capability providers
//!
//! The interpreter hands every domain call to a [`CapabilityProvider`]. It
//! never assumes anything about the implementation beyond this contract: a
//! request goes in together with a cancellation token, and a value or a
//! [`CallError`] comes out.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::errors::CallError;
use super::types::Val;

pub type CallFuture<'a> = Pin<Box<dyn Future<Output = Result<Val, CallError>> + Send + 'a>>;

/// One domain call as seen by a provider
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub function: String,
    pub pack: String,
    pub args: Vec<Val>,
    /// Time the interpreter grants the call; it enforces this itself as well
    pub deadline: Option<Duration>,
}

impl CallRequest {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.pack, self.function)
    }
}

pub trait CapabilityProvider: Send + Sync {
    /// Run one call. Implementations should stop work once `cancel` fires.
    fn invoke(&self, request: CallRequest, cancel: CancellationToken) -> CallFuture<'_>;
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/* ===================== Scripted Provider ===================== */

/// A canned result for one call
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedOutcome {
    pub result: Result<Val, String>,
    pub delay: Duration,
}

impl ScriptedOutcome {
    pub fn ok(value: impl Into<Val>) -> Self {
        Self {
            result: Ok(value.into()),
            delay: Duration::ZERO,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            result: Err(message.into()),
            delay: Duration::ZERO,
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A call observed by a [`ScriptedProvider`]
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub function: String,
    pub pack: String,
    pub args: Vec<Val>,
    pub deadline: Option<Duration>,
    pub token: CancellationToken,
}

impl RecordedCall {
    pub fn was_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug, Error)]
pub enum ScriptLoadError {
    #[error("failed to read response script {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid response script: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("outcome {index} of '{function}' must set exactly one of `value` or `error`")]
    Ambiguous { function: String, index: usize },
}

#[derive(Debug, Deserialize)]
struct ScriptFile {
    #[serde(default)]
    functions: BTreeMap<String, Vec<OutcomeSpec>>,
}

#[derive(Debug, Deserialize)]
struct OutcomeSpec {
    value: Option<toml::Value>,
    error: Option<String>,
    #[serde(default)]
    delay_ms: u64,
}

/// Deterministic provider driven by per-function outcome queues.
///
/// Outcomes are consumed in order; the last one repeats once the queue is
/// down to a single entry. Scripts keyed `pack.function` take precedence
/// over a bare `function` key.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    scripts: Mutex<BTreeMap<String, VecDeque<ScriptedOutcome>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an outcome to the queue of `function`
    pub fn push(&self, function: impl Into<String>, outcome: ScriptedOutcome) -> &Self {
        lock(&self.scripts)
            .entry(function.into())
            .or_default()
            .push_back(outcome);
        self
    }

    pub fn with(self, function: impl Into<String>, outcome: ScriptedOutcome) -> Self {
        self.push(function, outcome);
        self
    }

    /// Load outcome queues from TOML:
    ///
    /// ```toml
    /// [[functions.fetch_labs]]
    /// value = { hb = 13.5 }
    /// delay_ms = 5000
    ///
    /// [[functions."medical.triage"]]
    /// error = "service unavailable"
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self, ScriptLoadError> {
        let file: ScriptFile = toml::from_str(source)?;
        let provider = ScriptedProvider::new();
        for (function, outcomes) in file.functions {
            for (index, spec) in outcomes.into_iter().enumerate() {
                let result = match (spec.value, spec.error) {
                    (Some(value), None) => Ok(Val::from(value)),
                    (None, Some(error)) => Err(error),
                    _ => {
                        return Err(ScriptLoadError::Ambiguous {
                            function: function.clone(),
                            index,
                        })
                    }
                };
                provider.push(
                    function.clone(),
                    ScriptedOutcome {
                        result,
                        delay: Duration::from_millis(spec.delay_ms),
                    },
                );
            }
        }
        Ok(provider)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScriptLoadError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ScriptLoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Every call received so far, in arrival order
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn calls_to(&self, function: &str) -> Vec<RecordedCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.function == function)
            .cloned()
            .collect()
    }

    fn next_outcome(&self, request: &CallRequest) -> Option<ScriptedOutcome> {
        let mut scripts = lock(&self.scripts);
        let key = request.qualified_name();
        let queue = match scripts.contains_key(&key) {
            true => scripts.get_mut(&key),
            false => scripts.get_mut(&request.function),
        }?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl CapabilityProvider for ScriptedProvider {
    fn invoke(&self, request: CallRequest, cancel: CancellationToken) -> CallFuture<'_> {
        let outcome = self.next_outcome(&request);
        lock(&self.calls).push(RecordedCall {
            function: request.function.clone(),
            pack: request.pack.clone(),
            args: request.args.clone(),
            deadline: request.deadline,
            token: cancel.clone(),
        });

        Box::pin(async move {
            let Some(outcome) = outcome else {
                return Err(CallError::Unsupported(request.qualified_name()));
            };
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(function = %request.function, "Scripted call cancelled");
                    Err(CallError::Cancelled)
                }
                _ = tokio::time::sleep(outcome.delay) => outcome.result.map_err(CallError::Failed),
            }
        })
    }
}
