//! Tests for AWAIT dispatch and joins

use std::time::Duration;

use super::helpers::*;
use crate::executor::{FailureKind, ScriptedOutcome, ScriptedProvider, TraceEvent, Val};

fn within(actual: Duration, secs: u64) -> bool {
    let expected = Duration::from_secs(secs);
    actual >= expected && actual < expected + Duration::from_millis(50)
}

#[tokio::test(start_paused = true)]
async fn test_awaits_run_concurrently() {
    let provider = ScriptedProvider::new()
        .with("fetch_labs", ok_after("labs", 5))
        .with("fetch_imaging", ok_after("imaging", 5));
    let harness = Harness::new(
        r#"
#DOMAIN=medical
DEF main() {
    a = AWAIT fetch_labs()
    b = AWAIT fetch_imaging()
    RETURN [a, b]
}
"#,
        provider,
    );

    let outcome = harness.run(vec![]).await;

    assert_eq!(
        value_of(&outcome),
        list(vec![Val::from("labs"), Val::from("imaging")])
    );
    assert!(within(outcome.elapsed, 5), "took {:?}", outcome.elapsed);

    let events = harness.trace.events();
    let dispatched = events
        .iter()
        .filter(|e| matches!(e, TraceEvent::Dispatch { .. }))
        .count();
    let joined = events
        .iter()
        .filter(|e| matches!(e, TraceEvent::AwaitJoin { .. }))
        .count();
    assert_eq!((dispatched, joined), (2, 2));
}

#[tokio::test(start_paused = true)]
async fn test_unread_await_is_joined_before_return() {
    let provider = ScriptedProvider::new().with("notify", ok_after(true, 3));
    let harness = Harness::new(
        "#DOMAIN=medical\nDEF main() { AWAIT notify()\n RETURN 1 }",
        provider,
    );

    let outcome = harness.run(vec![]).await;

    assert_eq!(value_of(&outcome), num(1.0));
    assert!(within(outcome.elapsed, 3), "took {:?}", outcome.elapsed);
    assert!(!harness.provider.calls_to("notify")[0].was_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_await_failure_surfaces_on_read() {
    let provider = ScriptedProvider::new().with("fetch_labs", err_after("lab offline", 1));
    let harness = Harness::new(
        "#DOMAIN=medical\nDEF main() { x = AWAIT fetch_labs()\n y = 2\n RETURN x }",
        provider,
    );

    let failure = harness.run(vec![]).await.result.unwrap_err();
    assert_eq!(failure.kind, FailureKind::CallFailure);
    assert!(failure.message.contains("lab offline"));
    assert_eq!(failure.function, "main");
}

#[tokio::test(start_paused = true)]
async fn test_await_failure_is_recoverable() {
    let provider = ScriptedProvider::new()
        .with("fetch_labs", err_after("lab offline", 1))
        .with("fetch_labs", ok_after("labs", 1));
    let harness = Harness::new(
        r#"
#DOMAIN=medical
DEF main() {
    VALIDATE @retry=1 {
        x = AWAIT fetch_labs()
        y = x
    }
    RETURN y
}
"#,
        provider,
    );

    let outcome = harness.run(vec![]).await;
    assert_eq!(value_of(&outcome), Val::from("labs"));
    assert_eq!(outcome.retries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_await_timeout() {
    let provider = ScriptedProvider::new().with("fetch_labs", ok_after("labs", 10));
    let harness = Harness::new(
        "#DOMAIN=medical\nDEF main() { x = AWAIT fetch_labs() @timeout=2s\n RETURN x }",
        provider,
    );

    let outcome = harness.run(vec![]).await;

    let failure = outcome.result.unwrap_err();
    assert_eq!(failure.kind, FailureKind::CallFailure);
    assert!(failure.message.contains("timed out"));
    assert!(within(outcome.elapsed, 2), "took {:?}", outcome.elapsed);
    assert!(harness.provider.calls_to("fetch_labs")[0].was_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_rollback_cancels_pending_await() {
    let provider = ScriptedProvider::new()
        .with("fetch_imaging", ok_after("imaging", 10))
        .with("score", err_after("model unavailable", 1))
        .with("score", ok_after(0.7, 1));
    let harness = Harness::new(
        r#"
#DOMAIN=medical
DEF main() {
    VALIDATE @retry=1 {
        img = AWAIT fetch_imaging()
        r = score()
    }
    RETURN [r, img]
}
"#,
        provider,
    );

    let outcome = harness.run(vec![]).await;

    assert_eq!(
        value_of(&outcome),
        list(vec![num(0.7), Val::from("imaging")])
    );
    let calls = harness.provider.calls_to("fetch_imaging");
    assert_eq!(calls.len(), 2);
    assert!(calls[0].was_cancelled());
    assert!(!calls[1].was_cancelled());
    // The retry dispatches again at 1s, the join waits for that call
    assert!(within(outcome.elapsed, 11), "took {:?}", outcome.elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_rebinding_cancels_outstanding_await() {
    let provider = ScriptedProvider::new().with("fetch_labs", ok_after("labs", 10));
    let harness = Harness::new(
        "#DOMAIN=medical\nDEF main() { x = AWAIT fetch_labs()\n x = 5\n RETURN x }",
        provider,
    );

    let outcome = harness.run(vec![]).await;

    assert_eq!(value_of(&outcome), num(5.0));
    assert!(outcome.elapsed < Duration::from_secs(1));
    // The task may be aborted before it ever reaches the provider
    assert!(harness
        .provider
        .calls_to("fetch_labs")
        .iter()
        .all(|c| c.was_cancelled()));
}

#[tokio::test(start_paused = true)]
async fn test_branch_arguments_join_awaits_first() {
    let provider = ScriptedProvider::new()
        .with("fetch_labs", ok_after("labs", 4))
        .with("score", ok_after(0.5, 1))
        .with("summarize", ScriptedOutcome::ok("summary"));
    let harness = Harness::new(
        r#"
#DOMAIN=medical
DEF main() {
    l = AWAIT fetch_labs()
    r = PARALLEL { -> s = score(l) } SYNC ALL summarize(s)
    RETURN r
}
"#,
        provider,
    );

    let outcome = harness.run(vec![]).await;

    assert_eq!(value_of(&outcome), Val::from("summary"));
    assert_eq!(
        harness.provider.calls_to("score")[0].args,
        vec![Val::from("labs")]
    );
    assert!(within(outcome.elapsed, 5), "took {:?}", outcome.elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_rollback_keeps_await_dispatched_before_region() {
    let provider = ScriptedProvider::new()
        .with("fetch_labs", ok_after("labs", 3))
        .with("score", err_after("model unavailable", 1))
        .with("score", ok_after(1.0, 1));
    let harness = Harness::new(
        r#"
#DOMAIN=medical
DEF main() {
    x = AWAIT fetch_labs()
    VALIDATE @retry=2 {
        r = score()
    }
    RETURN [x, r]
}
"#,
        provider,
    );

    let outcome = harness.run(vec![]).await;

    assert_eq!(value_of(&outcome), list(vec![Val::from("labs"), num(1.0)]));
    assert_eq!(outcome.retries, 1);
    let calls = harness.provider.calls_to("fetch_labs");
    assert_eq!(calls.len(), 1);
    assert!(!calls[0].was_cancelled());
    assert!(within(outcome.elapsed, 3), "took {:?}", outcome.elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_rollback_keeps_value_joined_inside_region() {
    let provider = ScriptedProvider::new()
        .with("fetch_labs", ok_after("labs", 1))
        .with("score", err_after("model unavailable", 2))
        .with("score", ScriptedOutcome::ok(1.0));
    let harness = Harness::new(
        r#"
#DOMAIN=medical
DEF main() {
    x = AWAIT fetch_labs()
    VALIDATE @retry=2 {
        y = x
        r = score()
    }
    RETURN [y, r]
}
"#,
        provider,
    );

    let outcome = harness.run(vec![]).await;

    assert_eq!(value_of(&outcome), list(vec![Val::from("labs"), num(1.0)]));
    assert_eq!(outcome.retries, 1);
    assert_eq!(harness.provider.calls_to("fetch_labs").len(), 1);
    assert!(within(outcome.elapsed, 3), "took {:?}", outcome.elapsed);
}
