//! Parser tests

use std::time::Duration;

use super::*;

// ============================================================================
// Helper Functions
// ============================================================================

fn parse_ok(source: &str) -> Program {
    let tokens = lexer::tokenize(source).expect("Lex should succeed");
    parse(&tokens).expect("Parse should succeed")
}

fn parse_err(source: &str) -> ParseError {
    let tokens = lexer::tokenize(source).expect("Lex should succeed");
    parse(&tokens).expect_err("Parse should fail")
}

fn body_of(source: &str) -> Vec<Stmt> {
    let program = parse_ok(source);
    program.functions[0].body.clone()
}

// ============================================================================
// Program Structure
// ============================================================================

#[test]
fn test_directives_and_functions() {
    let program = parse_ok(
        r#"
#DOMAIN=medical
#DOMAIN=billing,legal
DEF main(a, b) {
    RETURN a
}
DEF helper() -> RETURN 1
"#,
    );

    assert_eq!(program.directives.len(), 2);
    assert_eq!(
        program.directive_values("DOMAIN").collect::<Vec<_>>(),
        vec!["medical", "billing,legal"]
    );
    assert_eq!(program.functions.len(), 2);
    assert_eq!(program.functions[0].name, "main");
    assert_eq!(program.functions[0].params.len(), 2);
    assert_eq!(program.functions[1].body.len(), 1);
}

#[test]
fn test_colon_and_single_statement_body() {
    let program = parse_ok("DEF f(x): RETURN x + 1");
    assert!(matches!(
        program.functions[0].body[0],
        Stmt::Return { value: Some(_), .. }
    ));
}

#[test]
fn test_statement_outside_def_is_rejected() {
    let err = parse_err("x = 1");
    assert!(err.expected.contains("DEF"));
    assert_eq!(err.span.line, 1);
}

#[test]
fn test_node_ids_are_unique() {
    let program = parse_ok(
        r#"
DEF main() {
    a = f(g(1))
    IF a { b = h() } ELSE { c = k() }
}
"#,
    );
    let mut ids = Vec::new();
    fn collect(stmts: &[Stmt], ids: &mut Vec<NodeId>) {
        for stmt in stmts {
            ids.push(stmt.id());
            match stmt {
                Stmt::Assign { value, .. } => value.walk_calls(&mut |c| ids.push(c.id)),
                Stmt::If {
                    arms, else_body, ..
                } => {
                    for arm in arms {
                        collect(&arm.body, ids);
                    }
                    if let Some(body) = else_body {
                        collect(body, ids);
                    }
                }
                _ => {}
            }
        }
    }
    collect(&program.functions[0].body, &mut ids);
    let mut deduped = ids.clone();
    deduped.sort();
    deduped.dedup();
    assert_eq!(ids.len(), deduped.len());
}

// ============================================================================
// Statements
// ============================================================================

#[test]
fn test_if_elif_else_with_probabilities() {
    let body = body_of(
        r#"
DEF triage(age) {
    IF age > 65 @p=0.8 -> alert("senior")
    ELIF age > 18 @p=0.15 { standard() }
    ELSE -> pediatric()
}
"#,
    );

    match &body[0] {
        Stmt::If {
            arms, else_body, ..
        } => {
            assert_eq!(arms.len(), 2);
            assert_eq!(arms[0].probability, Some(0.8));
            assert_eq!(arms[1].probability, Some(0.15));
            assert!(else_body.is_some());
        }
        other => panic!("Expected If, got {:?}", other),
    }
}

#[test]
fn test_while_and_for() {
    let body = body_of(
        r#"
DEF main() {
    i = 0
    WHILE i < 3 { i = i + 1 }
    FOR x IN range(3) { log(x) }
}
"#,
    );
    assert!(matches!(body[1], Stmt::While { .. }));
    match &body[2] {
        Stmt::For { var, iterable, .. } => {
            assert_eq!(var, "x");
            assert!(matches!(iterable, Expr::Call(c) if c.name == "range"));
        }
        other => panic!("Expected For, got {:?}", other),
    }
}

#[test]
fn test_parallel_block() {
    let body = body_of(
        r#"
DEF main() {
    summary = PARALLEL @timeout=30s {
        -> a = fetch_labs() @timeout=5s
        -> b = fetch_imaging()
        -> notify()
    } SYNC ANY merge(a, b)
}
"#,
    );

    match &body[0] {
        Stmt::Parallel(p) => {
            assert_eq!(p.target.as_deref(), Some("summary"));
            assert_eq!(p.timeout, Some(Duration::from_secs(30)));
            assert_eq!(p.branches.len(), 3);
            assert_eq!(p.branches[0].name.as_deref(), Some("a"));
            assert_eq!(p.branches[0].timeout, Some(Duration::from_secs(5)));
            assert_eq!(p.branches[2].name, None);
            assert_eq!(p.sync.quantifier, Quantifier::Any);
            assert_eq!(p.sync.call.name, "merge");
            assert_eq!(p.sync.call.args.len(), 2);
        }
        other => panic!("Expected Parallel, got {:?}", other),
    }
}

#[test]
fn test_parallel_defaults_to_all() {
    let body = body_of("DEF main() { PARALLEL { -> a() } SYNC join() }");
    match &body[0] {
        Stmt::Parallel(p) => assert_eq!(p.sync.quantifier, Quantifier::All),
        other => panic!("Expected Parallel, got {:?}", other),
    }
}

#[test]
fn test_parallel_requires_sync() {
    let err = parse_err("DEF main() { PARALLEL { -> a() } }");
    assert_eq!(err.expected, "'SYNC'");
}

#[test]
fn test_parallel_requires_a_branch() {
    let err = parse_err("DEF main() { PARALLEL { } SYNC join() }");
    assert!(err.expected.contains("parallel branch"));
}

#[test]
fn test_await_forms() {
    let body = body_of(
        r#"
DEF main() {
    x = AWAIT lookup(1) @timeout=250ms
    AWAIT ping()
}
"#,
    );
    match &body[0] {
        Stmt::Await {
            target, timeout, ..
        } => {
            assert_eq!(target.as_deref(), Some("x"));
            assert_eq!(*timeout, Some(Duration::from_millis(250)));
        }
        other => panic!("Expected Await, got {:?}", other),
    }
    assert!(matches!(body[1], Stmt::Await { target: None, .. }));
}

#[test]
fn test_validate_recover_and_assert() {
    let body = body_of(
        r#"
DEF main() {
    VALIDATE @retry=2 {
        r = score()
        ASSERT r > 0.5 @on_fail=rollback
    } RECOVER {
        r = 0
    }
}
"#,
    );
    match &body[0] {
        Stmt::Validate {
            retry,
            body,
            recover,
            ..
        } => {
            assert_eq!(*retry, Some(2));
            assert!(matches!(
                body[1],
                Stmt::Assert {
                    on_fail: GateAction::Rollback,
                    ..
                }
            ));
            assert_eq!(recover.as_ref().map(|r| r.len()), Some(1));
        }
        other => panic!("Expected Validate, got {:?}", other),
    }
}

#[test]
fn test_call_statement_options() {
    let body = body_of("DEF main() { r = classify(1) @retry=2 @timeout=2m; notify() }");
    match &body[0] {
        Stmt::Assign { options, .. } => {
            assert_eq!(options.retry, Some(2));
            assert_eq!(options.timeout, Some(Duration::from_secs(120)));
        }
        other => panic!("Expected Assign, got {:?}", other),
    }
    assert!(matches!(body[1], Stmt::Expr { .. }));
}

#[test]
fn test_qualified_call() {
    let body = body_of("DEF main() { medical.triage(1) }");
    match &body[0] {
        Stmt::Expr {
            expr: Expr::Call(call),
            ..
        } => {
            assert_eq!(call.qualifier.as_deref(), Some("medical"));
            assert_eq!(call.name, "triage");
            assert_eq!(call.display_name(), "medical.triage");
        }
        other => panic!("Expected call statement, got {:?}", other),
    }
}

#[test]
fn test_return_without_value() {
    let body = body_of("DEF main() { RETURN }");
    assert!(matches!(body[0], Stmt::Return { value: None, .. }));
}

// ============================================================================
// Expressions
// ============================================================================

#[test]
fn test_operator_precedence() {
    let body = body_of("DEF main() { x = 1 + 2 * 3 > 6 AND NOT y OR z }");
    let value = match &body[0] {
        Stmt::Assign { value, .. } => value,
        other => panic!("Expected Assign, got {:?}", other),
    };

    // ((1 + (2 * 3)) > 6 AND (NOT y)) OR z
    match value {
        Expr::Binary {
            op: BinaryOp::Or,
            left,
            ..
        } => match left.as_ref() {
            Expr::Binary {
                op: BinaryOp::And,
                left,
                right,
                ..
            } => {
                assert!(matches!(left.as_ref(), Expr::Binary { op: BinaryOp::Gt, .. }));
                assert!(matches!(right.as_ref(), Expr::Unary { op: UnaryOp::Not, .. }));
            }
            other => panic!("Expected AND, got {:?}", other),
        },
        other => panic!("Expected OR, got {:?}", other),
    }
}

#[test]
fn test_subtraction_is_left_associative() {
    let body = body_of("DEF main() { x = 10 - 4 - 3 }");
    match &body[0] {
        Stmt::Assign {
            value: Expr::Binary { left, right, .. },
            ..
        } => {
            assert!(matches!(left.as_ref(), Expr::Binary { op: BinaryOp::Sub, .. }));
            assert!(matches!(
                right.as_ref(),
                Expr::Literal {
                    value: Literal::Num(n),
                    ..
                } if *n == 3.0
            ));
        }
        other => panic!("Expected Assign, got {:?}", other),
    }
}

#[test]
fn test_list_and_literals() {
    let body = body_of(r#"DEF main() { x = [1, "two", TRUE, NULL, -3] }"#);
    match &body[0] {
        Stmt::Assign {
            value: Expr::List { items, .. },
            ..
        } => assert_eq!(items.len(), 5),
        other => panic!("Expected list, got {:?}", other),
    }
}

// ============================================================================
// Annotation Errors
// ============================================================================

#[test]
fn test_probability_out_of_range() {
    let err = parse_err("DEF main() { IF x @p=1.5 -> f() }");
    assert!(err.expected.contains("probability"));
    assert!(err.found.contains("@p=1.5"));
}

#[test]
fn test_unknown_annotation() {
    let err = parse_err("DEF main() { f() @priority=3 }");
    assert!(err.expected.contains("one of"));
}

#[test]
fn test_misplaced_annotation() {
    let err = parse_err("DEF main() { WHILE x @p=0.5 { f() } }");
    assert_eq!(err.span.line, 1);

    let err = parse_err("DEF main() { VALIDATE @timeout=1s { f() } }");
    assert!(err.expected.contains("VALIDATE"));
}

#[test]
fn test_annotation_on_non_call_expression() {
    let err = parse_err("DEF main() { x = 1 + 2 @retry=3 }");
    assert!(err.expected.contains("non-call"));
}

#[test]
fn test_invalid_values() {
    assert!(parse_err("DEF main() { f() @timeout=soon }")
        .expected
        .contains("duration"));
    assert!(parse_err("DEF main() { f() @timeout=1e300s }")
        .expected
        .contains("duration"));
    assert!(parse_err("DEF main() { f() @retry=1.5 }")
        .expected
        .contains("retry"));
    assert!(parse_err("DEF main() { ASSERT x @on_fail=explode }")
        .expected
        .contains("abort-loop"));
}

#[test]
fn test_duplicate_annotation() {
    let err = parse_err("DEF main() { f() @retry=1 @retry=2 }");
    assert!(err.expected.contains("at most one"));
}

#[test]
fn test_parse_duration_units() {
    assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
    assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
    assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
    assert_eq!(parse_duration("5"), Some(Duration::from_secs(5)));
    assert_eq!(parse_duration("-1s"), None);
    assert_eq!(parse_duration("fast"), None);
    assert_eq!(parse_duration("1e300s"), None);
    assert_eq!(parse_duration("infs"), None);
    assert_eq!(parse_duration("NaN"), None);
}

#[test]
fn test_error_reports_position() {
    let err = parse_err("DEF main() {\n  x = (1 + \n}");
    assert_eq!(err.span.line, 3);
    assert_eq!(err.expected, "an expression");
}

#[test]
fn test_parse_program_surfaces_lex_errors() {
    let err = parse_program("DEF main() { x = $ }").unwrap_err();
    assert!(matches!(err, CompileError::Lex(_)));
}
