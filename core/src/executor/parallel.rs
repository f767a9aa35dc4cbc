//! Fork and join of parallel blocks

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::errors::RuntimeFailure;
use super::frame::{Bindings, Frame};
use super::trace::{TraceEvent, TraceRecord};
use super::types::Val;
use super::Interpreter;
use crate::ir::{ForkBranch, ForkNode};
use crate::parser::ast::{Call, NodeId, Quantifier};

/// How one branch ended
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BranchStatus {
    Succeeded(Val),
    Failed(RuntimeFailure),
    TimedOut,
    Cancelled,
}

impl BranchStatus {
    fn label(&self) -> &'static str {
        match self {
            BranchStatus::Succeeded(_) => "succeeded",
            BranchStatus::Failed(_) => "failed",
            BranchStatus::TimedOut => "timed_out",
            BranchStatus::Cancelled => "cancelled",
        }
    }

    fn value(&self) -> Val {
        match self {
            BranchStatus::Succeeded(value) => value.clone(),
            _ => Val::Unavailable,
        }
    }

    /// Whether this result settles the join early
    fn decides(&self, quantifier: Quantifier) -> bool {
        match (quantifier, self) {
            (Quantifier::All, BranchStatus::Failed(_)) => true,
            (Quantifier::Any | Quantifier::None, BranchStatus::Succeeded(_)) => true,
            _ => false,
        }
    }
}

impl From<Result<Val, RuntimeFailure>> for BranchStatus {
    fn from(result: Result<Val, RuntimeFailure>) -> Self {
        match result {
            Ok(value) => BranchStatus::Succeeded(value),
            Err(failure) => BranchStatus::Failed(failure),
        }
    }
}

impl Interpreter {
    /// Run every branch of `fork` and apply its quantifier. On success the
    /// branch values are parked in the frame for the join block's `Sync`.
    pub(crate) async fn fork(
        &self,
        frame: &mut Frame,
        fork: &ForkNode,
        depth: usize,
    ) -> Result<(), RuntimeFailure> {
        // Branch arguments read the snapshot, so AWAITs they name are joined first
        let mut names: Vec<String> = Vec::new();
        for branch in &fork.branches {
            for arg in &branch.call.args {
                arg.walk_idents(&mut |name, _| names.push(name.to_string()));
            }
        }
        for name in names {
            if let Some(pending) = frame.take_pending(&name) {
                let function = frame.function.clone();
                let seq = pending.seq;
                let value = self.join_call(&function, pending).await?;
                frame.settle(seq, &name, value);
            }
        }

        let snapshot: Arc<Bindings> = Arc::new(frame.env.clone());
        let started = Instant::now();
        let deadline = fork.deadline.map(|limit| started + limit);
        self.emit(|| {
            TraceRecord::new(
                &frame.function,
                TraceEvent::Fork {
                    quantifier: fork.quantifier,
                    branches: fork.branches.len(),
                },
            )
            .node(fork.node)
        });
        debug!(
            frame = frame.id,
            node = fork.node,
            branches = fork.branches.len(),
            quantifier = %fork.quantifier,
            deadline = ?fork.deadline,
            "Fork dispatched"
        );

        let mut set = JoinSet::new();
        let mut tokens = Vec::with_capacity(fork.branches.len());
        let mut buffers = Vec::with_capacity(fork.branches.len());
        for (index, branch) in fork.branches.iter().enumerate() {
            let token = self.cancel.child_token();
            let (tracer, buffer) = self.tracer.buffered();
            let child = Interpreter {
                tracer,
                cancel: token.clone(),
                ..self.clone()
            };
            let snapshot = snapshot.clone();
            let branch = branch.clone();
            let caller = frame.function.clone();
            let branch_token = token.clone();
            set.spawn(async move {
                let limit = branch.timeout;
                let run = child.run_branch(&caller, &snapshot, &branch, depth);
                let status = match limit {
                    Some(limit) => match tokio::time::timeout(limit, run).await {
                        Ok(result) => BranchStatus::from(result),
                        Err(_) => {
                            branch_token.cancel();
                            BranchStatus::TimedOut
                        }
                    },
                    None => BranchStatus::from(run.await),
                };
                (index, status)
            });
            tokens.push(token);
            buffers.push(buffer);
        }

        let mut statuses: Vec<Option<BranchStatus>> = vec![None; fork.branches.len()];
        let mut deadline_hit = false;
        let mut panicked = None;
        loop {
            let joined = match deadline {
                Some(at) => tokio::select! {
                    joined = set.join_next() => joined,
                    _ = tokio::time::sleep_until(at) => {
                        deadline_hit = true;
                        break;
                    }
                },
                None => set.join_next().await,
            };
            let Some(joined) = joined else { break };
            let (index, status) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(node = fork.node, error = %e, "Parallel branch task panicked");
                    panicked = Some(e.to_string());
                    break;
                }
            };
            let decides = status.decides(fork.quantifier);
            statuses[index] = Some(status);
            if decides {
                break;
            }
        }

        for (token, status) in tokens.iter().zip(&statuses) {
            if status.is_none() {
                token.cancel();
            }
        }
        set.shutdown().await;

        if let Some(message) = panicked {
            return Err(RuntimeFailure::internal(format!(
                "parallel branch panicked: {}",
                message
            )));
        }

        let statuses: Vec<BranchStatus> = statuses
            .into_iter()
            .map(|status| match (status, deadline_hit) {
                (Some(status), _) => status,
                (None, true) => BranchStatus::TimedOut,
                (None, false) => BranchStatus::Cancelled,
            })
            .collect();

        for ((index, branch), buffer) in fork.branches.iter().enumerate().zip(&buffers) {
            self.tracer.flush(buffer);
            let status = &statuses[index];
            self.emit(|| {
                let record = TraceRecord::new(
                    &frame.function,
                    TraceEvent::BranchDone {
                        index,
                        name: branch.name.clone(),
                        status: status.label().to_string(),
                    },
                )
                .node(branch.node);
                match status {
                    BranchStatus::Succeeded(value) => record.output(value.to_json()),
                    BranchStatus::Failed(failure) => {
                        record.output(serde_json::Value::String(failure.message.clone()))
                    }
                    _ => record,
                }
            });
        }

        let result = join_verdict(fork.quantifier, &fork.branches, &statuses);
        let elapsed = started.elapsed();
        self.emit(|| {
            TraceRecord::new(
                &frame.function,
                TraceEvent::Join {
                    quantifier: fork.quantifier,
                    ok: result.is_ok(),
                },
            )
            .node(fork.node)
            .duration(elapsed)
        });
        debug!(
            frame = frame.id,
            node = fork.node,
            ok = result.is_ok(),
            ?elapsed,
            statuses = ?statuses.iter().map(BranchStatus::label).collect::<Vec<_>>(),
            "Fork joined"
        );

        result?;
        let values = fork
            .branches
            .iter()
            .zip(&statuses)
            .map(|(branch, status)| (branch.name.clone(), status.value()))
            .collect();
        frame.fork_results.insert(fork.node, values);
        Ok(())
    }

    async fn run_branch(
        &self,
        caller: &str,
        snapshot: &Bindings,
        branch: &ForkBranch,
        depth: usize,
    ) -> Result<Val, RuntimeFailure> {
        let mut scratch = Frame::new(self.next_frame_id(), caller, snapshot.clone());
        let args = self.eval_args(&mut scratch, &branch.call.args, depth).await?;
        self.invoke(caller, &branch.call, args, None, depth).await
    }

    /// Evaluate the join call against the frame plus branch bindings and
    /// write its result into the outer frame
    pub(crate) async fn sync(
        &self,
        frame: &mut Frame,
        fork: NodeId,
        target: Option<&str>,
        call: &Call,
        depth: usize,
    ) -> Result<(), RuntimeFailure> {
        let results = frame.fork_results.remove(&fork).ok_or_else(|| {
            RuntimeFailure::internal(format!("SYNC of fork {} has no branch results", fork))
        })?;

        let args = if call.args.is_empty() {
            results.iter().map(|(_, value)| value.clone()).collect()
        } else {
            let mut shadowed = Vec::new();
            for (name, value) in &results {
                if let Some(name) = name {
                    let previous = frame.env.insert(name.clone(), value.clone());
                    shadowed.push((name.clone(), previous));
                }
            }
            let args = self.eval_args(frame, &call.args, depth).await;
            for (name, previous) in shadowed.into_iter().rev() {
                match previous {
                    Some(value) => frame.env.insert(name, value),
                    None => frame.env.remove(&name),
                };
            }
            args?
        };

        let value = self.invoke(&frame.function, call, args, None, depth).await?;
        self.emit(|| {
            TraceRecord::new(
                &frame.function,
                TraceEvent::Sync {
                    target: call.display_name(),
                },
            )
            .node(fork)
            .output(value.to_json())
        });
        if let Some(target) = target {
            frame.bind(target, value);
        }
        Ok(())
    }
}

fn join_verdict(
    quantifier: Quantifier,
    branches: &[ForkBranch],
    statuses: &[BranchStatus],
) -> Result<(), RuntimeFailure> {
    let succeeded = statuses
        .iter()
        .filter(|s| matches!(s, BranchStatus::Succeeded(_)))
        .count();

    match quantifier {
        Quantifier::All => {
            let failed = statuses.iter().zip(branches).find_map(|(status, branch)| match status {
                BranchStatus::Failed(failure) => Some((failure, branch)),
                _ => None,
            });
            match failed {
                Some((failure, branch)) => Err(RuntimeFailure {
                    message: format!(
                        "branch '{}' of PARALLEL ALL failed: {}",
                        branch_label(branch),
                        failure.message
                    ),
                    ..failure.clone()
                }),
                None => Ok(()),
            }
        }
        Quantifier::Any if succeeded > 0 => Ok(()),
        Quantifier::Any => Err(RuntimeFailure::call(format!(
            "no branch of PARALLEL ANY succeeded ({} branches)",
            branches.len()
        ))),
        Quantifier::None if succeeded == 0 => Ok(()),
        Quantifier::None => {
            let winner = statuses
                .iter()
                .zip(branches)
                .find(|(status, _)| matches!(status, BranchStatus::Succeeded(_)))
                .map(|(_, branch)| branch_label(branch))
                .unwrap_or_default();
            Err(RuntimeFailure::call(format!(
                "branch '{}' of PARALLEL NONE succeeded",
                winner
            )))
        }
    }
}

fn branch_label(branch: &ForkBranch) -> String {
    match &branch.name {
        Some(name) => name.clone(),
        None => branch.call.display_name(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ast::Span;

    fn branch(name: &str) -> ForkBranch {
        ForkBranch {
            node: 1,
            name: Some(name.to_string()),
            call: Call {
                id: 2,
                qualifier: None,
                name: "f".to_string(),
                args: vec![],
                target: None,
                span: Span::default(),
            },
            timeout: None,
        }
    }

    #[test]
    fn test_all_fails_on_first_failed_branch_only() {
        let branches = vec![branch("a"), branch("b")];
        let ok = join_verdict(
            Quantifier::All,
            &branches,
            &[BranchStatus::Succeeded(Val::Null), BranchStatus::TimedOut],
        );
        assert!(ok.is_ok());

        let err = join_verdict(
            Quantifier::All,
            &branches,
            &[
                BranchStatus::Failed(RuntimeFailure::call("down")),
                BranchStatus::Cancelled,
            ],
        )
        .unwrap_err();
        assert!(err.message.contains("branch 'a'"));
        assert!(err.kind.is_recoverable());
    }

    #[test]
    fn test_any_and_none() {
        let branches = vec![branch("a"), branch("b")];
        let one_success = [BranchStatus::TimedOut, BranchStatus::Succeeded(Val::Null)];
        let no_success = [
            BranchStatus::Failed(RuntimeFailure::call("x")),
            BranchStatus::TimedOut,
        ];

        assert!(join_verdict(Quantifier::Any, &branches, &one_success).is_ok());
        assert!(join_verdict(Quantifier::Any, &branches, &no_success).is_err());
        assert!(join_verdict(Quantifier::None, &branches, &no_success).is_ok());
        let err = join_verdict(Quantifier::None, &branches, &one_success).unwrap_err();
        assert!(err.message.contains("'b'"));
    }

    #[test]
    fn test_early_decisions() {
        let success = BranchStatus::Succeeded(Val::Null);
        let failure = BranchStatus::Failed(RuntimeFailure::call("x"));
        assert!(failure.decides(Quantifier::All));
        assert!(!success.decides(Quantifier::All));
        assert!(success.decides(Quantifier::Any));
        assert!(success.decides(Quantifier::None));
        assert!(!BranchStatus::TimedOut.decides(Quantifier::None));
        assert_eq!(failure.value(), Val::Unavailable);
    }
}
