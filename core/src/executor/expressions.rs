//! Expression evaluation and call dispatch

use std::cmp::Ordering;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::errors::{CallError, RuntimeFailure};
use super::frame::Frame;
use super::policy::Admission;
use super::provider::CallRequest;
use super::stdlib::{call_builtin, Builtin};
use super::trace::{TraceEvent, TraceRecord};
use super::types::Val;
use super::{BoxFuture, Interpreter};
use crate::parser::ast::{BinaryOp, Call, CallTarget, Expr, Literal, NodeId, UnaryOp};

impl Interpreter {
    pub(crate) fn eval<'a>(
        &'a self,
        frame: &'a mut Frame,
        expr: &'a Expr,
        depth: usize,
    ) -> BoxFuture<'a, Result<Val, RuntimeFailure>> {
        Box::pin(async move {
            match expr {
                Expr::Literal { value, .. } => Ok(literal(value)),
                Expr::Ident { name, .. } => self.read_var(frame, name).await,
                Expr::List { items, .. } => Ok(Val::List(self.eval_args(frame, items, depth).await?)),
                Expr::Unary { op, operand, .. } => {
                    let value = self.eval(frame, operand, depth).await?;
                    unary(*op, value)
                }
                Expr::Binary {
                    op: BinaryOp::And,
                    left,
                    right,
                    ..
                } => {
                    if !self.eval(frame, left, depth).await?.is_truthy() {
                        return Ok(Val::Bool(false));
                    }
                    Ok(Val::Bool(self.eval(frame, right, depth).await?.is_truthy()))
                }
                Expr::Binary {
                    op: BinaryOp::Or,
                    left,
                    right,
                    ..
                } => {
                    if self.eval(frame, left, depth).await?.is_truthy() {
                        return Ok(Val::Bool(true));
                    }
                    Ok(Val::Bool(self.eval(frame, right, depth).await?.is_truthy()))
                }
                Expr::Binary {
                    op, left, right, ..
                } => {
                    let left = self.eval(frame, left, depth).await?;
                    let right = self.eval(frame, right, depth).await?;
                    binary(*op, left, right)
                }
                Expr::Call(call) => self.eval_call(frame, call, None, depth).await,
            }
        })
    }

    /// Evaluate the value of an assignment or expression statement. A
    /// statement-level `@timeout` applies to the outermost call only.
    pub(crate) async fn eval_statement(
        &self,
        frame: &mut Frame,
        expr: &Expr,
        timeout: Option<Duration>,
        depth: usize,
    ) -> Result<Val, RuntimeFailure> {
        match (expr, timeout) {
            (Expr::Call(call), Some(_)) => self.eval_call(frame, call, timeout, depth).await,
            _ => self.eval(frame, expr, depth).await,
        }
    }

    pub(crate) async fn eval_args(
        &self,
        frame: &mut Frame,
        exprs: &[Expr],
        depth: usize,
    ) -> Result<Vec<Val>, RuntimeFailure> {
        let mut values = Vec::with_capacity(exprs.len());
        for expr in exprs {
            values.push(self.eval(frame, expr, depth).await?);
        }
        Ok(values)
    }

    async fn eval_call(
        &self,
        frame: &mut Frame,
        call: &Call,
        timeout: Option<Duration>,
        depth: usize,
    ) -> Result<Val, RuntimeFailure> {
        let args = self.eval_args(frame, &call.args, depth).await?;
        self.invoke(&frame.function, call, args, timeout, depth).await
    }

    /// Reading a variable with an outstanding AWAIT blocks on its handle
    async fn read_var(&self, frame: &mut Frame, name: &str) -> Result<Val, RuntimeFailure> {
        if let Some(pending) = frame.take_pending(name) {
            let function = frame.function.clone();
            let seq = pending.seq;
            let value = self.join_call(&function, pending).await?;
            frame.settle(seq, name, value.clone());
            return Ok(value);
        }
        frame.env.get(name).cloned().ok_or_else(|| {
            RuntimeFailure::evaluation(format!("variable '{}' is not bound", name))
        })
    }

    /// Run a call with already evaluated arguments.
    ///
    /// Domain calls get `timeout`, else the configured default. A user
    /// function is only bounded by an explicit `timeout`.
    pub(crate) async fn invoke(
        &self,
        caller: &str,
        call: &Call,
        args: Vec<Val>,
        timeout: Option<Duration>,
        depth: usize,
    ) -> Result<Val, RuntimeFailure> {
        let target = call.target.as_ref().ok_or_else(|| {
            RuntimeFailure::internal(format!(
                "call '{}' has no resolved target",
                call.display_name()
            ))
        })?;

        match target {
            CallTarget::Builtin { name } => {
                let builtin = Builtin::from_name(name).ok_or_else(|| {
                    RuntimeFailure::internal(format!("unknown builtin '{}'", name))
                })?;
                call_builtin(builtin, &args).map_err(RuntimeFailure::evaluation)
            }
            CallTarget::User { name } => {
                let run = self.call_function(name, args, depth + 1);
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, run)
                        .await
                        .map_err(|_| RuntimeFailure::from(CallError::TimedOut(limit)))?,
                    None => run.await,
                }
            }
            CallTarget::Domain { pack, function } => {
                self.call_provider(caller, call.id, pack, function, args, timeout)
                    .await
            }
        }
    }

    async fn call_provider(
        &self,
        caller: &str,
        node: NodeId,
        pack: &str,
        function: &str,
        args: Vec<Val>,
        timeout: Option<Duration>,
    ) -> Result<Val, RuntimeFailure> {
        let deadline = timeout.or_else(|| self.config.executor.call_timeout());
        let request = CallRequest {
            function: function.to_string(),
            pack: pack.to_string(),
            args,
            deadline,
        };
        let target = request.qualified_name();

        if let Admission::Reject(reason) = self.policy.admit(&request) {
            let err = CallError::Rejected(reason);
            self.emit(|| {
                TraceRecord::new(
                    caller,
                    TraceEvent::CallFailed {
                        target: target.clone(),
                        error: err.to_string(),
                    },
                )
                .node(node)
            });
            return Err(err.into());
        }
        if let Some(value) = self.policy.lookup(&request) {
            self.emit(|| {
                TraceRecord::new(
                    caller,
                    TraceEvent::Call {
                        target: target.clone(),
                        cached: true,
                    },
                )
                .node(node)
                .output(value.to_json())
            });
            return Ok(value);
        }

        let token = self.cancel.child_token();
        let started = Instant::now();
        let pending = self.provider.invoke(request.clone(), token.clone());
        let result = match deadline {
            Some(limit) => match tokio::time::timeout(limit, pending).await {
                Ok(result) => result,
                Err(_) => {
                    token.cancel();
                    Err(CallError::TimedOut(limit))
                }
            },
            None => pending.await,
        };
        let elapsed = started.elapsed();
        let input = || serde_json::Value::Array(request.args.iter().map(Val::to_json).collect());

        match result {
            Ok(value) => {
                debug!(call = %target, ?elapsed, "Call succeeded");
                self.policy.store(&request, &value);
                self.emit(|| {
                    TraceRecord::new(
                        caller,
                        TraceEvent::Call {
                            target: target.clone(),
                            cached: false,
                        },
                    )
                    .node(node)
                    .input(input())
                    .output(value.to_json())
                    .duration(elapsed)
                });
                Ok(value)
            }
            Err(err) => {
                debug!(call = %target, ?elapsed, error = %err, "Call failed");
                self.emit(|| {
                    TraceRecord::new(
                        caller,
                        TraceEvent::CallFailed {
                            target: target.clone(),
                            error: err.to_string(),
                        },
                    )
                    .node(node)
                    .input(input())
                    .duration(elapsed)
                });
                Err(err.into())
            }
        }
    }
}

/* ===================== Operators ===================== */

fn literal(value: &Literal) -> Val {
    match value {
        Literal::Null => Val::Null,
        Literal::Bool(b) => Val::Bool(*b),
        Literal::Num(n) => Val::Num(*n),
        Literal::Str(s) => Val::Str(s.clone()),
    }
}

fn unary(op: UnaryOp, value: Val) -> Result<Val, RuntimeFailure> {
    match (op, value) {
        (UnaryOp::Neg, Val::Num(n)) => Ok(Val::Num(-n)),
        (UnaryOp::Neg, other) => Err(RuntimeFailure::evaluation(format!(
            "cannot negate {}",
            other.type_name()
        ))),
        (UnaryOp::Not, value) => Ok(Val::Bool(!value.is_truthy())),
    }
}

fn binary(op: BinaryOp, left: Val, right: Val) -> Result<Val, RuntimeFailure> {
    use BinaryOp::*;

    let mismatch = |left: &Val, right: &Val| {
        RuntimeFailure::evaluation(format!(
            "cannot apply '{}' to {} and {}",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))
    };

    match (op, &left, &right) {
        (Eq, _, _) => Ok(Val::Bool(left == right)),
        (Ne, _, _) => Ok(Val::Bool(left != right)),

        (Add, Val::Num(a), Val::Num(b)) => Ok(Val::Num(a + b)),
        (Add, Val::Str(a), _) => Ok(Val::Str(format!("{}{}", a, right))),
        (Add, _, Val::Str(b)) => Ok(Val::Str(format!("{}{}", left, b))),
        (Add, Val::List(a), Val::List(b)) => {
            Ok(Val::List(a.iter().chain(b.iter()).cloned().collect()))
        }
        (Sub, Val::Num(a), Val::Num(b)) => Ok(Val::Num(a - b)),
        (Mul, Val::Num(a), Val::Num(b)) => Ok(Val::Num(a * b)),
        (Div | Rem, Val::Num(_), Val::Num(b)) if *b == 0.0 => {
            Err(RuntimeFailure::evaluation("division by zero"))
        }
        (Div, Val::Num(a), Val::Num(b)) => Ok(Val::Num(a / b)),
        (Rem, Val::Num(a), Val::Num(b)) => Ok(Val::Num(a % b)),

        (Lt | Le | Gt | Ge, _, _) => {
            let ordering = match (&left, &right) {
                (Val::Num(a), Val::Num(b)) => a.partial_cmp(b),
                (Val::Str(a), Val::Str(b)) => Some(a.cmp(b)),
                _ => return Err(mismatch(&left, &right)),
            };
            let Some(ordering) = ordering else {
                return Ok(Val::Bool(false));
            };
            let holds = match op {
                Lt => ordering == Ordering::Less,
                Le => ordering != Ordering::Greater,
                Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(Val::Bool(holds))
        }

        _ => Err(mismatch(&left, &right)),
    }
}
