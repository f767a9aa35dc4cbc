//! Execution frames

use std::collections::BTreeMap;
use std::fmt;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::errors::{CallError, RuntimeFailure};
use super::trace::TraceBuffer;
use super::types::Val;
use crate::ir::Position;
use crate::parser::ast::{NodeId, Span};

pub type Bindings = BTreeMap<String, Val>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Created,
    Running,
    Completed,
    Failed,
    RolledBack,
}

impl FrameState {
    fn can_become(self, next: FrameState) -> bool {
        use FrameState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, RolledBack)
                | (RolledBack, Running)
                | (RolledBack, Failed)
        )
    }
}

impl fmt::Display for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FrameState::Created => "created",
            FrameState::Running => "running",
            FrameState::Completed => "completed",
            FrameState::Failed => "failed",
            FrameState::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// Progress of one `FOR` loop
#[derive(Debug, Clone, PartialEq)]
pub struct IterState {
    pub items: Vec<Val>,
    pub next: usize,
}

/// An AWAIT call that has been dispatched but not joined
#[derive(Debug)]
pub struct PendingCall {
    /// Dispatch sequence number within the frame
    pub seq: u64,
    pub node: NodeId,
    pub target: Option<String>,
    pub call: String,
    pub span: Span,
    pub handle: JoinHandle<Result<Val, RuntimeFailure>>,
    pub token: CancellationToken,
    /// Trace records of the dispatched call, flushed on join
    pub trace: TraceBuffer,
}

impl PendingCall {
    pub fn cancel(self) {
        self.token.cancel();
        self.handle.abort();
    }

    /// Wait for the call. A panicked or aborted task counts as a call failure.
    pub async fn join(self) -> Result<Val, RuntimeFailure> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(CallError::Cancelled.into()),
            Err(e) => Err(RuntimeFailure::internal(format!(
                "AWAIT task for '{}' panicked: {}",
                self.call, e
            ))),
        }
    }
}

/// Snapshot taken when a transactional region is entered
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub region: NodeId,
    pub frame: u64,
    /// AWAITs with a lower sequence number were dispatched before the region
    pub dispatch_mark: u64,
    pub bindings: Bindings,
    pub iterators: BTreeMap<NodeId, IterState>,
    pub last_value: Option<Val>,
    pub resume: Position,
    pub recover: Option<Position>,
    pub budget: u32,
    pub retries: u32,
}

/// One active function call
#[derive(Debug)]
pub struct Frame {
    pub id: u64,
    pub function: String,
    state: FrameState,
    pub env: Bindings,
    pub iterators: BTreeMap<NodeId, IterState>,
    /// Dispatched AWAIT calls in dispatch order
    pub pending: Vec<PendingCall>,
    /// Branch results per fork node, consumed by the matching `Sync`
    pub fork_results: BTreeMap<NodeId, Vec<(Option<String>, Val)>>,
    pub checkpoints: Vec<Checkpoint>,
    /// Value of the last expression statement
    pub last_value: Option<Val>,
    dispatched: u64,
}

impl Frame {
    pub fn new(id: u64, function: impl Into<String>, env: Bindings) -> Self {
        Self {
            id,
            function: function.into(),
            state: FrameState::Created,
            env,
            iterators: BTreeMap::new(),
            pending: Vec::new(),
            fork_results: BTreeMap::new(),
            checkpoints: Vec::new(),
            last_value: None,
            dispatched: 0,
        }
    }

    /// Sequence number for the next AWAIT dispatch
    pub fn next_dispatch(&mut self) -> u64 {
        let seq = self.dispatched;
        self.dispatched += 1;
        seq
    }

    pub fn dispatch_mark(&self) -> u64 {
        self.dispatched
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn transition(&mut self, next: FrameState) -> Result<(), RuntimeFailure> {
        if !self.state.can_become(next) {
            return Err(RuntimeFailure::internal(format!(
                "frame {} of '{}' cannot move from {} to {}",
                self.id, self.function, self.state, next
            )));
        }
        debug!(frame = self.id, function = %self.function, from = %self.state, to = %next, "Frame state");
        self.state = next;
        Ok(())
    }

    /// Bind a variable, cancelling an outstanding AWAIT on the same name
    pub fn bind(&mut self, name: &str, value: Val) {
        if let Some(index) = self.pending_index(name) {
            self.pending.remove(index).cancel();
        }
        self.env.insert(name.to_string(), value);
    }

    pub fn pending_index(&self, name: &str) -> Option<usize> {
        self.pending
            .iter()
            .position(|p| p.target.as_deref() == Some(name))
    }

    pub fn take_pending(&mut self, name: &str) -> Option<PendingCall> {
        self.pending_index(name).map(|i| self.pending.remove(i))
    }

    pub fn cancel_pending(&mut self) {
        for call in self.pending.drain(..) {
            call.cancel();
        }
    }

    /// Cancel the AWAITs dispatched at or after `mark`; earlier ones keep running
    pub fn cancel_pending_since(&mut self, mark: u64) {
        let (cancelled, kept): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|call| call.seq >= mark);
        self.pending = kept;
        for call in cancelled {
            call.cancel();
        }
    }

    /// Bind the value of a joined AWAIT. Checkpoints opened after its
    /// dispatch see the value too, so a rollback keeps it.
    pub fn settle(&mut self, seq: u64, name: &str, value: Val) {
        for cp in self.checkpoints.iter_mut().filter(|cp| seq < cp.dispatch_mark) {
            cp.bindings.insert(name.to_string(), value.clone());
        }
        self.env.insert(name.to_string(), value);
    }

    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        let mut frame = Frame::new(1, "main", Bindings::new());
        assert_eq!(frame.state(), FrameState::Created);
        assert!(frame.transition(FrameState::Completed).is_err());

        frame.transition(FrameState::Running).unwrap();
        frame.transition(FrameState::RolledBack).unwrap();
        frame.transition(FrameState::Running).unwrap();
        frame.transition(FrameState::Completed).unwrap();
        assert!(frame.transition(FrameState::Running).is_err());
    }

    /// Push a pending call that only finishes when cancelled
    fn dispatch(frame: &mut Frame, target: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            task_token.cancelled().await;
            Ok(Val::Null)
        });
        let seq = frame.next_dispatch();
        frame.pending.push(PendingCall {
            seq,
            node: 3,
            target: Some(target.to_string()),
            call: "fetch".to_string(),
            span: Span::default(),
            handle,
            token: token.clone(),
            trace: TraceBuffer::default(),
        });
        token
    }

    fn checkpoint(frame: &Frame) -> Checkpoint {
        Checkpoint {
            region: 1,
            frame: frame.id,
            dispatch_mark: frame.dispatch_mark(),
            bindings: frame.env.clone(),
            iterators: BTreeMap::new(),
            last_value: None,
            resume: Position::block_start(0),
            recover: None,
            budget: 1,
            retries: 0,
        }
    }

    #[tokio::test]
    async fn test_rebinding_cancels_pending_call() {
        let mut frame = Frame::new(1, "main", Bindings::new());
        let token = dispatch(&mut frame, "x");

        frame.bind("x", Val::Num(5.0));
        assert!(token.is_cancelled());
        assert!(frame.pending.is_empty());
        assert_eq!(frame.env.get("x"), Some(&Val::Num(5.0)));
    }

    #[tokio::test]
    async fn test_cancel_pending_since_keeps_earlier_dispatches() {
        let mut frame = Frame::new(1, "main", Bindings::new());
        let before = dispatch(&mut frame, "x");
        let mark = frame.dispatch_mark();
        let after = dispatch(&mut frame, "y");

        frame.cancel_pending_since(mark);

        assert!(!before.is_cancelled());
        assert!(after.is_cancelled());
        assert_eq!(frame.pending.len(), 1);
        assert_eq!(frame.pending[0].target.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_settle_updates_later_checkpoints_only() {
        let mut frame = Frame::new(1, "main", Bindings::new());
        dispatch(&mut frame, "x");
        let outer = checkpoint(&frame);
        frame.checkpoints.push(outer);
        dispatch(&mut frame, "y");
        let inner = checkpoint(&frame);
        frame.checkpoints.push(inner);

        let x = frame.take_pending("x").unwrap();
        frame.settle(x.seq, "x", Val::from("labs"));
        let y = frame.take_pending("y").unwrap();
        frame.settle(y.seq, "y", Val::Num(2.0));

        assert_eq!(frame.env.get("x"), Some(&Val::from("labs")));
        assert_eq!(frame.env.get("y"), Some(&Val::Num(2.0)));
        assert_eq!(frame.checkpoints[0].bindings.get("x"), Some(&Val::from("labs")));
        assert_eq!(frame.checkpoints[0].bindings.get("y"), None);
        assert_eq!(frame.checkpoints[1].bindings.get("x"), Some(&Val::from("labs")));
        assert_eq!(frame.checkpoints[1].bindings.get("y"), Some(&Val::Num(2.0)));
    }
}
