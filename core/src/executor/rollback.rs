//! Validation and rollback manager
//!
//! Every `VALIDATE` region (and every call statement with `@retry`) pushes a
//! [`Checkpoint`] onto its frame. When a recoverable failure reaches the
//! frame, the innermost checkpoint decides what happens next: retry the
//! region from a restored snapshot, run its recovery block, or give up.

use tracing::{debug, warn};

use super::errors::{FailureKind, RuntimeFailure};
use super::frame::{Checkpoint, Frame, FrameState};
use crate::config::RollbackConfig;
use crate::ir::Position;
use crate::parser::ast::NodeId;

/// What the interpreter does after a failure
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Resume at the region's body with restored bindings
    Retry(Position),
    /// Run the region's recovery block with restored bindings
    Recover(Position),
    /// Hand the failure to the caller frame
    Propagate(RuntimeFailure),
}

#[derive(Debug, Clone)]
pub struct RollbackManager {
    default_budget: u32,
    max_budget: u32,
}

impl Default for RollbackManager {
    fn default() -> Self {
        Self::new(&RollbackConfig::default())
    }
}

impl RollbackManager {
    pub fn new(config: &RollbackConfig) -> Self {
        Self {
            default_budget: config.default_retry_budget,
            max_budget: config.max_retry_budget,
        }
    }

    pub fn budget_for(&self, retry: Option<u32>) -> u32 {
        retry.unwrap_or(self.default_budget).min(self.max_budget)
    }

    /// Snapshot the frame on entry to a region
    pub fn open(
        &self,
        frame: &mut Frame,
        region: NodeId,
        retry: Option<u32>,
        resume: Position,
        recover: Option<Position>,
    ) -> u32 {
        let budget = self.budget_for(retry);
        let dispatch_mark = frame.dispatch_mark();
        frame.checkpoints.push(Checkpoint {
            region,
            frame: frame.id,
            dispatch_mark,
            bindings: frame.env.clone(),
            iterators: frame.iterators.clone(),
            last_value: frame.last_value.clone(),
            resume,
            recover,
            budget,
            retries: 0,
        });
        debug!(frame = frame.id, region, budget, "Checkpoint opened");
        budget
    }

    /// Close a region that completed. Returns false when the innermost
    /// checkpoint belongs to a different region.
    pub fn commit(&self, frame: &mut Frame, region: NodeId) -> bool {
        match frame.checkpoints.last() {
            Some(cp) if cp.region == region => {
                frame.checkpoints.pop();
                debug!(frame = frame.id, region, "Checkpoint committed");
                true
            }
            _ => false,
        }
    }

    /// Drop the checkpoints of regions left through an abort-loop gate
    pub fn unwind(&self, frame: &mut Frame, regions: &[NodeId]) {
        for region in regions {
            if !self.commit(frame, *region) {
                warn!(frame = frame.id, region, "Abort-loop unwound a region that was not open");
            }
        }
    }

    pub fn on_failure(&self, frame: &mut Frame, failure: RuntimeFailure) -> Decision {
        if !failure.kind.is_recoverable() || frame.checkpoints.is_empty() {
            return Decision::Propagate(failure);
        }

        // AWAITs dispatched before the region stay outstanding
        let mark = frame.checkpoint().map(|cp| cp.dispatch_mark).unwrap_or_default();
        frame.cancel_pending_since(mark);
        frame.fork_results.clear();
        if frame.transition(FrameState::RolledBack).is_err() {
            return Decision::Propagate(failure);
        }

        let Some(cp) = frame.checkpoints.last_mut() else {
            return Decision::Propagate(failure);
        };
        frame.env = cp.bindings.clone();
        frame.iterators = cp.iterators.clone();
        frame.last_value = cp.last_value.clone();

        if cp.retries < cp.budget {
            cp.retries += 1;
            debug!(
                frame = frame.id,
                region = cp.region,
                attempt = cp.retries,
                budget = cp.budget,
                error = %failure,
                "Retrying region"
            );
            return Decision::Retry(cp.resume);
        }

        let region = cp.region;
        let retries = cp.retries;
        let recover = cp.recover;
        frame.checkpoints.pop();

        match recover {
            Some(position) => {
                warn!(frame = frame.id, region, retries, error = %failure, "Recovering region");
                Decision::Recover(position)
            }
            None => {
                warn!(frame = frame.id, region, retries, error = %failure, "Retry budget exhausted");
                Decision::Propagate(RuntimeFailure {
                    kind: FailureKind::RetryBudgetExhausted,
                    message: format!("region {} gave up: {}", region, failure.message),
                    retries,
                    ..failure
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::frame::{Bindings, IterState};
    use crate::executor::types::Val;
    use maplit::btreemap;

    fn running_frame(env: Bindings) -> Frame {
        let mut frame = Frame::new(7, "main", env);
        frame.transition(FrameState::Running).unwrap();
        frame
    }

    fn resume_running(frame: &mut Frame) {
        frame.transition(FrameState::Running).unwrap();
    }

    #[test]
    fn test_budget_defaults_and_cap() {
        let manager = RollbackManager::new(&RollbackConfig {
            default_retry_budget: 3,
            max_retry_budget: 5,
        });
        assert_eq!(manager.budget_for(None), 3);
        assert_eq!(manager.budget_for(Some(1)), 1);
        assert_eq!(manager.budget_for(Some(50)), 5);
    }

    #[test]
    fn test_retry_restores_bindings_exactly() {
        let manager = RollbackManager::default();
        let mut frame = running_frame(btreemap! {
            "a".to_string() => Val::Num(1.0),
            "tags".to_string() => Val::List(vec![Val::from("x")]),
        });
        frame.iterators.insert(
            9,
            IterState {
                items: vec![Val::Num(0.0), Val::Num(1.0)],
                next: 1,
            },
        );
        let before_env = frame.env.clone();
        let before_iters = frame.iterators.clone();

        manager.open(&mut frame, 4, Some(2), Position::block_start(3), None);
        frame.env.insert("a".to_string(), Val::Num(99.0));
        frame.env.insert("b".to_string(), Val::Bool(true));
        frame.iterators.get_mut(&9).unwrap().next = 2;

        let decision = manager.on_failure(&mut frame, RuntimeFailure::call("boom"));
        assert_eq!(decision, Decision::Retry(Position::block_start(3)));
        assert_eq!(frame.env, before_env);
        assert_eq!(frame.iterators, before_iters);
        assert_eq!(frame.state(), FrameState::RolledBack);
        assert_eq!(frame.checkpoint().unwrap().retries, 1);
    }

    #[test]
    fn test_exhausted_budget_recovers_when_possible() {
        let manager = RollbackManager::default();
        let mut frame = running_frame(Bindings::new());
        manager.open(
            &mut frame,
            4,
            Some(1),
            Position::block_start(2),
            Some(Position::block_start(5)),
        );

        let first = manager.on_failure(&mut frame, RuntimeFailure::call("a"));
        assert!(matches!(first, Decision::Retry(_)));
        resume_running(&mut frame);

        let second = manager.on_failure(
            &mut frame,
            RuntimeFailure::new(FailureKind::ValidationGateFailure, "b"),
        );
        assert_eq!(second, Decision::Recover(Position::block_start(5)));
        assert!(frame.checkpoints.is_empty());
    }

    #[test]
    fn test_exhausted_budget_without_recovery_is_fatal() {
        let manager = RollbackManager::default();
        let mut frame = running_frame(Bindings::new());
        manager.open(&mut frame, 4, Some(0), Position::block_start(2), None);

        match manager.on_failure(&mut frame, RuntimeFailure::call("down")) {
            Decision::Propagate(failure) => {
                assert_eq!(failure.kind, FailureKind::RetryBudgetExhausted);
                assert!(!failure.kind.is_recoverable());
                assert!(failure.message.contains("down"));
            }
            other => panic!("Expected Propagate, got {:?}", other),
        }
    }

    #[test]
    fn test_without_checkpoint_failure_propagates_unchanged() {
        let manager = RollbackManager::default();
        let mut frame = running_frame(Bindings::new());
        let failure = RuntimeFailure::call("down");
        assert_eq!(
            manager.on_failure(&mut frame, failure.clone()),
            Decision::Propagate(failure)
        );
        assert_eq!(frame.state(), FrameState::Running);
    }

    #[test]
    fn test_unrecoverable_failure_skips_checkpoint() {
        let manager = RollbackManager::default();
        let mut frame = running_frame(Bindings::new());
        manager.open(&mut frame, 4, None, Position::block_start(2), None);
        let failure = RuntimeFailure::evaluation("1 / 0");
        assert_eq!(
            manager.on_failure(&mut frame, failure.clone()),
            Decision::Propagate(failure)
        );
        assert_eq!(frame.checkpoints.len(), 1);
    }

    #[test]
    fn test_commit_and_unwind() {
        let manager = RollbackManager::default();
        let mut frame = running_frame(Bindings::new());
        manager.open(&mut frame, 1, None, Position::block_start(1), None);
        manager.open(&mut frame, 2, None, Position::block_start(2), None);
        manager.open(&mut frame, 3, None, Position::block_start(3), None);

        assert!(!manager.commit(&mut frame, 1));
        assert!(manager.commit(&mut frame, 3));
        manager.unwind(&mut frame, &[2]);
        assert_eq!(frame.checkpoints.len(), 1);
        assert_eq!(frame.checkpoint().unwrap().region, 1);
    }
}
