//! Execution trace
//!
//! The trace is an append-only record of what a run did, separate from
//! `tracing` logs. Records emitted inside parallel branches and AWAIT tasks
//! are buffered and flushed by the controlling task, so sequence numbers
//! follow declaration order rather than completion order.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::provider::lock;
use crate::config::TraceConfig;
use crate::parser::ast::{NodeId, Quantifier};

/* ===================== Records ===================== */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEvent {
    FunctionEnter,
    FunctionExit {
        ok: bool,
    },
    /// `arm` is `None` when the else edge (or loop exit) was taken
    Branch {
        arm: Option<usize>,
        probability: Option<f64>,
    },
    Iteration {
        var: String,
        index: usize,
    },
    Call {
        target: String,
        cached: bool,
    },
    CallFailed {
        target: String,
        error: String,
    },
    Dispatch {
        target: String,
    },
    AwaitJoin {
        target: String,
    },
    Fork {
        quantifier: Quantifier,
        branches: usize,
    },
    BranchDone {
        index: usize,
        name: Option<String>,
        status: String,
    },
    Join {
        quantifier: Quantifier,
        ok: bool,
    },
    Sync {
        target: String,
    },
    Checkpoint {
        region: NodeId,
        budget: u32,
    },
    Commit {
        region: NodeId,
    },
    Rollback {
        region: NodeId,
        attempt: u32,
    },
    Recover {
        region: NodeId,
    },
    GateFailed {
        abort_loop: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Assigned when the record reaches the sink
    pub seq: u64,
    pub node: Option<NodeId>,
    pub function: String,
    pub event: TraceEvent,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl TraceRecord {
    pub fn new(function: &str, event: TraceEvent) -> Self {
        Self {
            seq: 0,
            node: None,
            function: function.to_string(),
            event,
            timestamp: Utc::now(),
            input: None,
            output: None,
            duration_ms: None,
        }
    }

    pub fn node(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    pub fn input(mut self, input: serde_json::Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }
}

/* ===================== Sinks ===================== */

pub trait TraceSink: Send + Sync {
    fn record(&self, record: TraceRecord);
}

/// Discards every record
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTrace;

impl TraceSink for NullTrace {
    fn record(&self, _record: TraceRecord) {}
}

/// Keeps records in memory
#[derive(Debug, Default)]
pub struct MemoryTrace {
    records: Mutex<Vec<TraceRecord>>,
}

impl MemoryTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TraceRecord> {
        lock(&self.records).clone()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        lock(&self.records).iter().map(|r| r.event.clone()).collect()
    }
}

impl TraceSink for MemoryTrace {
    fn record(&self, record: TraceRecord) {
        lock(&self.records).push(record);
    }
}

/// Writes one JSON object per line
pub struct JsonLinesTrace {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesTrace {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl TraceSink for JsonLinesTrace {
    fn record(&self, record: TraceRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!(seq = record.seq, error = %e, "Failed to serialize trace record");
                return;
            }
        };
        let mut writer = lock(&self.writer);
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            warn!(seq = record.seq, error = %e, "Failed to write trace record");
        }
    }
}

/* ===================== Tracer ===================== */

#[derive(Clone)]
enum Target {
    Sink(Arc<dyn TraceSink>),
    Buffer(TraceBuffer),
    Off,
}

/// Records collected off the controlling task
pub type TraceBuffer = Arc<Mutex<Vec<TraceRecord>>>;

/// Front end the interpreter emits through
#[derive(Clone)]
pub struct Tracer {
    target: Target,
    seq: Arc<AtomicU64>,
    snapshot_bindings: bool,
}

impl Tracer {
    pub fn new(sink: Arc<dyn TraceSink>, config: &TraceConfig) -> Self {
        let target = match config.enabled {
            true => Target::Sink(sink),
            false => Target::Off,
        };
        Self {
            target,
            seq: Arc::new(AtomicU64::new(0)),
            snapshot_bindings: config.snapshot_bindings,
        }
    }

    pub fn disabled() -> Self {
        Self {
            target: Target::Off,
            seq: Arc::new(AtomicU64::new(0)),
            snapshot_bindings: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.target, Target::Off)
    }

    pub fn snapshot_bindings(&self) -> bool {
        self.snapshot_bindings && self.is_enabled()
    }

    /// A tracer writing into a fresh buffer, for work off the controlling task
    pub fn buffered(&self) -> (Tracer, TraceBuffer) {
        let buffer: TraceBuffer = Arc::new(Mutex::new(Vec::new()));
        let target = match self.target {
            Target::Off => Target::Off,
            _ => Target::Buffer(buffer.clone()),
        };
        let tracer = Tracer {
            target,
            seq: self.seq.clone(),
            snapshot_bindings: self.snapshot_bindings,
        };
        (tracer, buffer)
    }

    pub fn emit(&self, mut record: TraceRecord) {
        match &self.target {
            Target::Sink(sink) => {
                record.seq = self.seq.fetch_add(1, Ordering::Relaxed);
                sink.record(record);
            }
            Target::Buffer(buffer) => lock(buffer).push(record),
            Target::Off => {}
        }
    }

    /// Re-emit buffered records in the order they were recorded
    pub fn flush(&self, buffer: &TraceBuffer) {
        let records = std::mem::take(&mut *lock(buffer));
        for record in records {
            self.emit(record);
        }
    }
}
