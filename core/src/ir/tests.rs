//! IR lowering tests

use super::*;
use crate::binder::{bind, ActiveDomains, DomainPack, DomainRegistry, FunctionBinding};
use crate::parser::parse_program;

fn lower_source(source: &str) -> IrProgram {
    let mut registry = DomainRegistry::new();
    registry.register(
        DomainPack::new("medical")
            .with_function(FunctionBinding::new("triage"))
            .with_function(FunctionBinding::new("score"))
            .with_function(FunctionBinding::new("merge")),
    );
    let program = parse_program(source).expect("Parse should succeed");
    let domains = ActiveDomains::resolve(&program, &registry, None).expect("Domains");
    let bound = bind(&program, &domains).expect("Bind should succeed");
    lower(&bound).expect("Lower should succeed")
}

fn main_fn(ir: &IrProgram) -> &IrFunction {
    ir.function("main").expect("main")
}

fn blocks_labelled<'a>(f: &'a IrFunction, label: &str) -> Vec<&'a Block> {
    f.blocks.iter().filter(|b| b.label == label).collect()
}

#[test]
fn test_straight_line_function() {
    let ir = lower_source("DEF main(x) { y = x + 1\n y }");
    let main = main_fn(&ir);
    assert_eq!(main.params, vec!["x"]);
    assert_eq!(main.blocks.len(), 1);
    assert!(matches!(main.blocks[0].instrs[0], Instr::Assign { .. }));
    assert!(matches!(main.blocks[0].instrs[1], Instr::Eval { .. }));
    assert!(matches!(
        main.blocks[0].term,
        Terminator::Return {
            implicit: true,
            value: None,
            ..
        }
    ));
    ir.verify().unwrap();
}

#[test]
fn test_if_chain_is_one_branch_with_probabilities() {
    let ir = lower_source(
        r#"
#DOMAIN=medical
DEF main(age) {
    IF age > 65 @p=0.8 -> triage("senior")
    ELIF age > 18 @p=0.15 -> triage("adult")
    ELSE -> triage("child")
}
"#,
    );
    let main = main_fn(&ir);
    match &main.blocks[0].term {
        Terminator::Branch {
            arms, otherwise, ..
        } => {
            assert_eq!(arms.len(), 2);
            assert_eq!(arms[0].probability, Some(0.8));
            assert_eq!(arms[1].probability, Some(0.15));
            assert_eq!(main.blocks[*otherwise].label, "if.else");
        }
        other => panic!("Expected Branch, got {:?}", other),
    }
}

#[test]
fn test_while_has_head_body_exit() {
    let ir = lower_source("DEF main() { i = 0\n WHILE i < 3 { i = i + 1 } }");
    let main = main_fn(&ir);
    let head = blocks_labelled(main, "while.head")[0];
    let body = blocks_labelled(main, "while.body")[0];
    let exit = blocks_labelled(main, "while.exit")[0];

    match &head.term {
        Terminator::Branch {
            arms, otherwise, ..
        } => {
            assert_eq!(arms[0].target, body.id);
            assert_eq!(*otherwise, exit.id);
        }
        other => panic!("Expected Branch, got {:?}", other),
    }
    assert_eq!(body.term, Terminator::Jump { target: head.id });
}

#[test]
fn test_for_uses_iterator_slot() {
    let ir = lower_source("DEF main() { FOR x IN range(3) { x } }");
    let main = main_fn(&ir);
    assert!(matches!(main.blocks[0].instrs[0], Instr::IterInit { .. }));
    let head = blocks_labelled(main, "for.head")[0];
    assert!(matches!(&head.term, Terminator::IterNext { var, .. } if var == "x"));
}

#[test]
fn test_parallel_lowers_to_fork_and_sync() {
    let ir = lower_source(
        r#"
#DOMAIN=medical
DEF main() {
    r = PARALLEL @timeout=30s { -> a = triage(1) @timeout=5s -> b = score(2) } SYNC ANY merge(a, b)
    RETURN r
}
"#,
    );
    let main = main_fn(&ir);
    let fork = match &main.blocks[0].term {
        Terminator::Fork(fork) => fork,
        other => panic!("Expected Fork, got {:?}", other),
    };
    assert_eq!(fork.branches.len(), 2);
    assert_eq!(fork.quantifier, Quantifier::Any);
    assert_eq!(fork.deadline, Some(Duration::from_secs(30)));
    assert_eq!(fork.branches[0].timeout, Some(Duration::from_secs(5)));

    let join = &main.blocks[fork.join];
    assert!(matches!(
        &join.instrs[0],
        Instr::Sync { target: Some(t), fork: f, .. } if t == "r" && *f == fork.node
    ));
}

#[test]
fn test_validate_region() {
    let ir = lower_source(
        r#"
#DOMAIN=medical
DEF main() {
    VALIDATE @retry=2 {
        s = score()
        ASSERT s > 0.5
    } RECOVER {
        s = 0
    }
    RETURN s
}
"#,
    );
    let main = main_fn(&ir);
    match &main.blocks[0].instrs[0] {
        Instr::Checkpoint {
            retry,
            resume,
            recover,
            ..
        } => {
            assert_eq!(*retry, Some(2));
            assert_eq!(main.blocks[*resume].label, "validate.body");
            assert_eq!(main.blocks[recover.unwrap()].label, "validate.recover");
        }
        other => panic!("Expected Checkpoint, got {:?}", other),
    }
    let body = blocks_labelled(main, "validate.body")[0];
    assert!(matches!(
        body.instrs.last(),
        Some(Instr::Commit { .. })
    ));
    assert!(matches!(
        body.instrs[1],
        Instr::Gate {
            on_fail: GateTarget::Rollback,
            ..
        }
    ));
}

#[test]
fn test_retry_call_statement_becomes_region() {
    let ir = lower_source("#DOMAIN=medical\nDEF main() { s = score() @retry=3 }");
    let main = main_fn(&ir);
    assert!(matches!(
        main.blocks[0].instrs[0],
        Instr::Checkpoint {
            retry: Some(3),
            recover: None,
            ..
        }
    ));
    let body = blocks_labelled(main, "validate.body")[0];
    assert!(matches!(body.instrs[0], Instr::Assign { .. }));
    assert!(matches!(body.instrs[1], Instr::Commit { .. }));
}

#[test]
fn test_abort_loop_targets_innermost_exit_and_unwinds_regions() {
    let ir = lower_source(
        r#"
#DOMAIN=medical
DEF main() {
    FOR i IN range(3) {
        WHILE TRUE {
            VALIDATE { ASSERT score() @on_fail=abort-loop }
        }
    }
}
"#,
    );
    let main = main_fn(&ir);
    let while_exit = blocks_labelled(main, "while.exit")[0].id;
    let gate = main
        .blocks
        .iter()
        .flat_map(|b| b.instrs.iter())
        .find_map(|i| match i {
            Instr::Gate { on_fail, .. } => Some(on_fail.clone()),
            _ => None,
        })
        .unwrap();
    match gate {
        GateTarget::AbortLoop { exit, unwind } => {
            assert_eq!(exit, while_exit);
            assert_eq!(unwind.len(), 1);
        }
        other => panic!("Expected AbortLoop, got {:?}", other),
    }
}

#[test]
fn test_await_lowers_to_dispatch() {
    let ir = lower_source("#DOMAIN=medical\nDEF main() { t = AWAIT triage(1)\n RETURN t }");
    let main = main_fn(&ir);
    assert!(matches!(
        &main.blocks[0].instrs[0],
        Instr::Dispatch { target: Some(t), .. } if t == "t"
    ));
}

#[test]
fn test_code_after_return_lands_in_unreachable_block() {
    let ir = lower_source("DEF main() { RETURN 1\n x = 2 }");
    let main = main_fn(&ir);
    assert!(matches!(
        main.blocks[0].term,
        Terminator::Return {
            implicit: false,
            ..
        }
    ));
    assert_eq!(main.blocks[1].label, "unreachable");
    ir.verify().unwrap();
}

#[test]
fn test_verify_rejects_unresolved_call() {
    let mut ir = lower_source("DEF main() { range(1) }");
    let main = ir.functions.get_mut("main").unwrap();
    if let Instr::Eval {
        expr: Expr::Call(call),
        ..
    } = &mut main.blocks[0].instrs[0]
    {
        call.target = None;
    }
    assert!(matches!(
        ir.verify(),
        Err(LowerError::UnresolvedCall { ref call, .. }) if call == "range"
    ));
}

#[test]
fn test_verify_rejects_dangling_block() {
    let mut ir = lower_source("DEF main() { RETURN }");
    ir.functions.get_mut("main").unwrap().blocks[0].term = Terminator::Jump { target: 99 };
    assert!(matches!(
        ir.verify(),
        Err(LowerError::DanglingBlock { block: 99, .. })
    ));
}

#[test]
fn test_ir_serializes_to_json() {
    let ir = lower_source("DEF main() { x = [1, 2]\n RETURN x }");
    let json = serde_json::to_string(&ir).unwrap();
    let back: IrProgram = serde_json::from_str(&json).unwrap();
    assert_eq!(ir, back);
}
