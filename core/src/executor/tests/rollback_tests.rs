//! Tests for VALIDATE regions, retries and recovery

use super::helpers::*;
use crate::config::{EngineConfig, RollbackConfig};
use crate::executor::{FailureKind, ScriptedOutcome, ScriptedProvider, TraceEvent, Val};

fn failing_then(failures: usize, value: impl Into<Val>) -> ScriptedProvider {
    let provider = ScriptedProvider::new();
    for _ in 0..failures {
        provider.push("score", ScriptedOutcome::err("model unavailable"));
    }
    provider.push("score", ScriptedOutcome::ok(value));
    provider
}

fn always_failing() -> ScriptedProvider {
    ScriptedProvider::new().with("score", ScriptedOutcome::err("model unavailable"))
}

/* ===================== Retries ===================== */

#[tokio::test]
async fn test_region_retries_until_success() {
    let harness = Harness::new(
        r#"
#DOMAIN=medical
DEF main() {
    VALIDATE @retry=2 {
        r = score()
    }
    RETURN r
}
"#,
        failing_then(2, 0.9),
    );

    let outcome = harness.run(vec![]).await;

    assert_eq!(value_of(&outcome), num(0.9));
    assert_eq!(outcome.retries, 2);
    assert_eq!(harness.provider.calls_to("score").len(), 3);

    let attempts: Vec<u32> = harness
        .trace
        .events()
        .into_iter()
        .filter_map(|e| match e {
            TraceEvent::Rollback { attempt, .. } => Some(attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2]);
}

#[tokio::test]
async fn test_rollback_restores_bindings_exactly() {
    let harness = Harness::new(
        r#"
#DOMAIN=medical
DEF main() {
    x = 1
    VALIDATE @retry=1 {
        x = x + 1
        r = score()
    }
    RETURN [x, r]
}
"#,
        failing_then(1, "ok"),
    );

    let outcome = harness.run(vec![]).await;

    // The first attempt's increment is undone before the retry
    assert_eq!(value_of(&outcome), list(vec![num(2.0), Val::from("ok")]));
    assert_eq!(outcome.retries, 1);
}

#[tokio::test]
async fn test_exhausted_region_without_recover_is_fatal() {
    let harness = Harness::new(
        "#DOMAIN=medical\nDEF main() { VALIDATE @retry=2 { r = score() } }",
        always_failing(),
    );

    let outcome = harness.run(vec![]).await;

    let failure = outcome.result.unwrap_err();
    assert_eq!(failure.kind, FailureKind::RetryBudgetExhausted);
    assert_eq!(failure.retries, 2);
    assert!(failure.message.contains("gave up"));
    assert!(failure.message.contains("model unavailable"));
    assert_eq!(outcome.retries, 2);
    assert_eq!(harness.provider.calls_to("score").len(), 3);
}

#[tokio::test]
async fn test_recover_block_runs_after_exhaustion() {
    let harness = Harness::new(
        r#"
#DOMAIN=medical
DEF main() {
    VALIDATE @retry=1 {
        r = score()
    } RECOVER {
        r = "fallback"
    }
    RETURN r
}
"#,
        always_failing(),
    );

    let outcome = harness.run(vec![]).await;

    assert_eq!(value_of(&outcome), Val::from("fallback"));
    assert_eq!(outcome.retries, 1);
    assert!(harness
        .trace
        .events()
        .iter()
        .any(|e| matches!(e, TraceEvent::Recover { .. })));
}

#[tokio::test]
async fn test_failed_gate_rolls_back_and_retries() {
    let provider = ScriptedProvider::new()
        .with("score", ScriptedOutcome::ok(0.2))
        .with("score", ScriptedOutcome::ok(0.4))
        .with("score", ScriptedOutcome::ok(0.9));
    let harness = Harness::new(
        r#"
#DOMAIN=medical
DEF main() {
    VALIDATE @retry=3 {
        r = score()
        ASSERT r > 0.5 @on_fail=rollback
    }
    RETURN r
}
"#,
        provider,
    );

    let outcome = harness.run(vec![]).await;

    assert_eq!(value_of(&outcome), num(0.9));
    assert_eq!(outcome.retries, 2);
    let gate_failures = harness
        .trace
        .events()
        .into_iter()
        .filter(|e| *e == TraceEvent::GateFailed { abort_loop: false })
        .count();
    assert_eq!(gate_failures, 2);
}

#[tokio::test]
async fn test_gate_outside_region_fails_the_run() {
    let harness = Harness::new("DEF main(x) { ASSERT x > 1 }", ScriptedProvider::new());
    let failure = harness.run(vec![num(0.0)]).await.result.unwrap_err();
    assert_eq!(failure.kind, FailureKind::ValidationGateFailure);
}

#[tokio::test]
async fn test_retry_annotation_on_call_statement() {
    let harness = Harness::new(
        "#DOMAIN=medical\nDEF main() { r = score() @retry=1\n RETURN r }",
        failing_then(1, "second try"),
    );

    let outcome = harness.run(vec![]).await;

    assert_eq!(value_of(&outcome), Val::from("second try"));
    assert_eq!(outcome.retries, 1);
}

/* ===================== Propagation ===================== */

#[tokio::test]
async fn test_callee_failure_is_retried_by_caller_region() {
    let harness = Harness::new(
        r#"
#DOMAIN=medical
DEF fetch() -> RETURN score()
DEF main() {
    VALIDATE @retry=1 {
        r = fetch()
    }
    RETURN r
}
"#,
        failing_then(1, "ok"),
    );

    let outcome = harness.run(vec![]).await;

    assert_eq!(value_of(&outcome), Val::from("ok"));
    assert_eq!(outcome.retries, 1);
}

#[tokio::test]
async fn test_nested_exhaustion_is_not_retried_by_outer_region() {
    let provider = always_failing().with("notify", ScriptedOutcome::ok(true));
    let harness = Harness::new(
        r#"
#DOMAIN=medical
DEF main() {
    VALIDATE @retry=2 {
        notify()
        VALIDATE @retry=1 {
            r = score()
        }
    }
}
"#,
        provider,
    );

    let outcome = harness.run(vec![]).await;

    let failure = outcome.result.unwrap_err();
    assert_eq!(failure.kind, FailureKind::RetryBudgetExhausted);
    assert_eq!(harness.provider.calls_to("notify").len(), 1);
    assert_eq!(harness.provider.calls_to("score").len(), 2);
    assert_eq!(outcome.retries, 1);
}

#[tokio::test]
async fn test_evaluation_errors_are_not_retried() {
    let harness = Harness::new(
        "DEF main(d) { VALIDATE @retry=3 { y = 1 / d } }",
        ScriptedProvider::new(),
    );

    let outcome = harness.run(vec![num(0.0)]).await;

    let failure = outcome.result.unwrap_err();
    assert_eq!(failure.kind, FailureKind::EvaluationError);
    assert_eq!(outcome.retries, 0);
}

#[tokio::test]
async fn test_fatal_failure_reports_retries_taken() {
    let harness = Harness::new(
        r#"
#DOMAIN=medical
DEF main(d) {
    VALIDATE @retry=2 {
        r = score()
    }
    RETURN r / d
}
"#,
        failing_then(1, 1.0),
    );

    let outcome = harness.run(vec![num(0.0)]).await;

    let failure = outcome.result.unwrap_err();
    assert_eq!(failure.kind, FailureKind::EvaluationError);
    assert_eq!(failure.retries, 1);
    assert!(failure.to_string().contains("after 1 retries"));
}

/* ===================== Budgets ===================== */

#[tokio::test]
async fn test_configured_default_and_max_budget() {
    let config = EngineConfig {
        rollback: RollbackConfig {
            default_retry_budget: 1,
            max_retry_budget: 2,
        },
        ..EngineConfig::default()
    };

    let harness = Harness::with_config(
        "#DOMAIN=medical\nDEF main() { VALIDATE { r = score() } }",
        always_failing(),
        config.clone(),
    );
    let failure = harness.run(vec![]).await.result.unwrap_err();
    assert_eq!(failure.retries, 1);

    // Explicit budgets are capped by the maximum
    let harness = Harness::with_config(
        "#DOMAIN=medical\nDEF main() { VALIDATE @retry=50 { r = score() } }",
        always_failing(),
        config,
    );
    let failure = harness.run(vec![]).await.result.unwrap_err();
    assert_eq!(failure.retries, 2);
    assert_eq!(harness.provider.calls_to("score").len(), 3);
}

#[tokio::test]
async fn test_loop_inside_region_restarts_from_checkpoint() {
    let provider = ScriptedProvider::new()
        .with("score", ScriptedOutcome::ok(1.0))
        .with("score", ScriptedOutcome::err("flaky"))
        .with("score", ScriptedOutcome::ok(2.0));
    let harness = Harness::new(
        r#"
#DOMAIN=medical
DEF main() {
    total = 0
    VALIDATE @retry=1 {
        FOR i IN range(2) {
            total = total + score()
        }
    }
    RETURN total
}
"#,
        provider,
    );

    let outcome = harness.run(vec![]).await;

    // Attempt one adds 1 then fails; attempt two starts from zero
    assert_eq!(value_of(&outcome), num(4.0));
    assert_eq!(harness.provider.calls_to("score").len(), 4);
}
