//! End-to-end scenarios: every program runs with the JIT off and on,
//! asserting identical results; trace-shape assertions query the
//! trace cache.

use velo_compile::compile_program;
use velo_syntax::parse;
use velo_vm::jit::ir::IrOp;
use velo_vm::{Backend, Config, Thread, VmError, VmResult};
use velo_core::value::{Value, INTEGER_NA};

fn run_with(src: &str, config: Config) -> (VmResult<Value>, Thread) {
    let mut thread = Thread::with_config(config);
    let exprs = parse(src).expect("parse");
    let proto = compile_program(&exprs, &mut thread.interner).expect("compile");
    let global = thread.global;
    let result = thread.eval(proto, global);
    (result, thread)
}

fn no_jit() -> Config {
    Config {
        jit_enabled: false,
        ..Config::default()
    }
}

fn jit() -> Config {
    Config {
        jit_enabled: true,
        hot_loop: 10,
        ..Config::default()
    }
}

/// Run both ways and assert bit-identical results.
fn assert_same(src: &str) -> (Value, Thread) {
    let (off, _) = run_with(src, no_jit());
    let (on, thread) = run_with(src, jit());
    let off = off.expect("interpreter run failed");
    let on = on.expect("jit run failed");
    assert_eq!(off, on, "interpreter and JIT disagree for:\n{}", src);
    (on, thread)
}

// === Scenario 1: simple loop sum ===

#[test]
fn loop_sum_is_bit_identical_and_compiles_one_loop_trace() {
    let src = "(begin (<- s 0) (for i (: 1 10000) (<- s (+ s i))) s)";
    let (value, thread) = assert_same(src);
    assert_eq!(value, Value::integer(50_005_000));

    assert!(thread.jit.trace_count() >= 1, "no trace was compiled");
    let trace = &thread.jit.traces[0];
    let code = &trace.code;
    let loop_start = code.loop_start.expect("loop trace has a loop marker");

    let live_nodes = code.live.iter().filter(|&&l| l).count();
    assert!(
        live_nodes < 30,
        "expected a compact trace, got {} live nodes",
        live_nodes
    );

    // exactly one counter-bound guard in the loop body
    let body_guards = code
        .nodes
        .iter()
        .enumerate()
        .filter(|(i, node)| *i > loop_start && code.live[*i] && node.op == IrOp::Gtrue)
        .count();
    assert_eq!(body_guards, 1, "expected a single gtrue guard in the body");
}

// === Scenario 2: vector add with recycling ===

#[test]
fn recycling_interleaves_the_shorter_operand() {
    let src = "(begin (<- x (: 1 1000)) (<- y (c 10 20)) (+ x y))";
    let (value, _) = assert_same(src);
    let ints = value.cast_integer().unwrap();
    assert_eq!(ints.len(), 1000);
    assert_eq!(ints[0], 11);
    assert_eq!(ints[1], 22);
    assert_eq!(ints[2], 13);
    assert_eq!(ints[3], 24);
    assert_eq!(ints[990], 1001);
    assert_eq!(ints[991], 1012);
}

#[test]
fn recycling_loop_traces_with_constant_short_length() {
    // the add runs inside a hot loop so the recycling is traced
    let src = "(begin (<- x (: 1 1000)) (<- y (c 10 20)) (<- z 0) \
               (for k (: 1 40) (<- z (+ x y))) (index z 5))";
    let (value, thread) = assert_same(src);
    assert_eq!(value, Value::integer(15)); // 5 + 10

    assert!(thread.jit.trace_count() >= 1);
    let code = &thread.jit.traces[0].code;
    // len(y) = 2 was specialized: a live load with a constant trace
    // length of 2 witnesses it
    let witnessed = code.nodes.iter().enumerate().any(|(i, node)| {
        code.live[i]
            && node.op == IrOp::Load
            && node.out.len == 2
            && code.nodes[node.out.len_ref].op == IrOp::Constant
    });
    assert!(witnessed, "no constant-length load of y in the trace");
    // and the recycling emitted a shape guard (le/gt conjunction)
    let has_shape_guard = code
        .nodes
        .iter()
        .enumerate()
        .any(|(i, node)| code.live[i] && node.op == IrOp::And);
    assert!(has_shape_guard, "no recycling shape guard in the trace");
}

// === Scenario 3: object method dispatch ===

#[test]
fn s3_dispatch_through_usemethod() {
    let src = r#"(begin
        (<- x 1)
        (attr<- x "class" "foo")
        (<- print.foo (function (x) "F"))
        (<- print (function (x) (usemethod "print" x)))
        (print x))"#;
    let (value, thread) = assert_same(src);
    let f = thread.interner.get("F").expect("F interned");
    assert_eq!(value, Value::character(f));
}

// === Scenario 4: guard failure continuation ===

#[test]
fn modified_element_still_sums_correctly() {
    let src = "(begin
        (<- x (: 1 100)) (<- y x) (index<- y 50 0) (<- s 0)
        (for i (seq (length y) 1) (<- s (+ s (index y i))))
        s)";
    let (value, _) = assert_same(src);
    assert_eq!(value, Value::integer(5000));
}

// === Scenario 5: lexical capture and superassignment ===

#[test]
fn closures_share_the_captured_environment() {
    let src = "(begin
        (<- f (function () (begin (<- n 0) (function () (begin (<<- n (+ n 1)) n)))))
        (<- g (f))
        (g) (g) (g))";
    let (value, _) = assert_same(src);
    assert_eq!(value, Value::integer(3));
}

// === Scenario 6: promise force-on-read ===

#[test]
fn unused_argument_is_never_forced() {
    let src = r#"(begin (<- f (function (x) 42)) (f (stop "no")))"#;
    let (result, _) = run_with(src, no_jit());
    assert_eq!(result.unwrap(), Value::integer(42));
}

#[test]
fn used_argument_forces_and_raises() {
    let src = r#"(begin (<- f (function (x) (begin (<- y 1) x))) (f (stop "no")))"#;
    let (result, _) = run_with(src, no_jit());
    match result {
        Err(VmError::User(message)) => assert_eq!(message, "no"),
        other => panic!("expected the promise to raise, got {:?}", other.err()),
    }
}

// === Optimizer invariants ===

#[test]
fn optimized_traces_are_a_cse_fixed_point() {
    let src = "(begin (<- s 0) (for i (: 1 2000) (<- s (+ s i))) s)";
    let (_, thread) = run_with(src, jit());
    assert!(thread.jit.trace_count() >= 1);
    for trace in &thread.jit.traces {
        velo_vm::jit::opt::check(&trace.code).expect("optimizer invariants");
    }
}

#[test]
fn every_guard_has_a_populated_exit() {
    let src = "(begin (<- s 0) (for i (: 1 2000) (<- s (+ s i))) s)";
    let (_, thread) = run_with(src, jit());
    let code = &thread.jit.traces[0].code;
    for (pos, node) in code.nodes.iter().enumerate() {
        if code.live[pos] && node.op.is_guard() {
            let exit = code.exits.get(&pos).expect("guard without exit record");
            assert!(!exit.stores.is_empty(), "exit with no live stores");
        }
    }
}

#[test]
fn widening_cast_registers_never_alias() {
    // logical comparison result cast to double inside a vector loop
    let src = "(begin (<- x (: 1 1000)) (<- z 0)
        (for k (: 1 40) (<- z (+ (< x 500) x)))
        (index z 1))";
    let (value, thread) = assert_same(src);
    assert_eq!(value, Value::integer(2)); // TRUE + 1
    for trace in &thread.jit.traces {
        let code = &trace.code;
        for (i, node) in code.nodes.iter().enumerate() {
            if !code.live[i] {
                continue;
            }
            if node.op.is_widening_cast(code.nodes[node.a].ty) {
                let (src_reg, dst_reg) = (code.reg[node.a], code.reg[i]);
                if src_reg != velo_vm::jit::ir::NO_REG && dst_reg != velo_vm::jit::ir::NO_REG {
                    assert_ne!(src_reg, dst_reg, "widening cast aliases registers");
                }
            }
        }
    }
}

// === Boundary behaviors ===

#[test]
fn zero_length_arithmetic() {
    let (value, _) = assert_same("(+ (c) 1)");
    assert_eq!(value.len(), 0);
}

#[test]
fn na_propagates_through_folds() {
    let (value, _) = assert_same("(sum (c 1 NA-int 3))");
    assert_eq!(value, Value::integer(INTEGER_NA));
}

#[test]
fn length_one_mixing_recycles() {
    let (value, _) = assert_same("(* (: 1 5) 2)");
    assert_eq!(value, Value::integers(vec![2, 4, 6, 8, 10]));
}

// === Deparse / parse round trip ===

#[test]
fn computed_values_round_trip_through_deparse() {
    let sources = [
        "(c 1 2 3)",
        "(/ 1 0)",
        "(c 1.5 NA-real)",
        "(list 1 \"two\" TRUE)",
        "(== (: 1 3) 2)",
    ];
    for src in sources {
        let (value, mut thread) = run_with(src, no_jit());
        let value = value.unwrap();
        let text = value.deparse(&thread.interner);
        let exprs = parse(&text).expect("deparse output parses");
        let back = velo_compile::parse_literal(&exprs[0], &mut thread.interner)
            .expect("deparse output is a literal");
        assert_eq!(back, value, "round trip failed for {}", text);
    }
}

// === Machine-code backend equivalence ===

#[test]
#[cfg(target_arch = "x86_64")]
fn machine_backend_matches_tile_interpreter() {
    let src = "(begin (<- s 0) (for i (: 1 10000) (<- s (+ s i))) s)";
    let machine = Config {
        jit_enabled: true,
        hot_loop: 10,
        backend: Backend::Machine,
        ..Config::default()
    };
    let (tile_result, _) = run_with(src, jit());
    let (machine_result, thread) = run_with(src, machine);
    assert_eq!(tile_result.unwrap(), machine_result.unwrap());
    assert!(
        thread.jit.traces.iter().any(|t| t.mcode.is_some()),
        "no trace was lowered to machine code"
    );
}

// === Error taxonomy ===

#[test]
fn missing_binding_raises_not_found() {
    let (result, _) = run_with("(+ nonexistent 1)", no_jit());
    assert!(matches!(result, Err(VmError::NotFound(name)) if name == "nonexistent"));
}

#[test]
fn na_condition_raises() {
    let (result, _) = run_with("(if NA 1 2)", no_jit());
    assert!(matches!(result, Err(VmError::NaCondition)));
}

#[test]
fn subset2_out_of_bounds_is_strict() {
    let (result, _) = run_with("(index2 (c 1 2) 5)", no_jit());
    assert!(matches!(result, Err(VmError::OutOfBounds)));
    // plain subset is lenient: out of bounds yields NA
    let (value, _) = run_with("(index (c 1 2) 5)", no_jit());
    assert_eq!(value.unwrap(), Value::integer(INTEGER_NA));
}

#[test]
fn calling_a_non_function_is_a_type_error() {
    let (result, _) = run_with("(begin (<- x 1) (x 2))", no_jit());
    assert!(matches!(result, Err(VmError::Type(_))));
}

// === Defaults, dots, and missing ===

#[test]
fn default_arguments_evaluate_in_the_callee() {
    let src = "(begin (<- f (function (x (y (+ x 1))) (+ x y))) (f 10))";
    let (value, _) = assert_same(src);
    assert_eq!(value, Value::integer(21));
}

#[test]
fn missing_detects_absent_and_default_arguments() {
    let src = "(begin (<- f (function (x (y 2)) (missing y))) (f 1))";
    let (value, _) = assert_same(src);
    assert_eq!(value, Value::logical(true));
    let src = "(begin (<- f (function (x (y 2)) (missing y))) (f 1 5))";
    let (value, _) = assert_same(src);
    assert_eq!(value, Value::logical(false));
}

#[test]
fn dots_collect_and_expand() {
    let src = r#"(begin
        (<- f (function (...) (list ...)))
        (length (f 1 2 3)))"#;
    let (value, _) = assert_same(src);
    assert_eq!(value, Value::integer(3));
}

#[test]
fn named_arguments_match_formals() {
    let src = "(begin (<- f (function (a b) (- a b))) (f (= b 1) (= a 10)))";
    let (value, _) = assert_same(src);
    assert_eq!(value, Value::integer(9));
}

// === Control flow ===

#[test]
fn while_loop_runs() {
    let src = "(begin (<- n 0) (while (< n 10) (<- n (+ n 1))) n)";
    let (value, _) = assert_same(src);
    assert_eq!(value, Value::integer(10));
}

#[test]
fn switch_selects_by_name_with_default() {
    let src = r#"(switch "b" ("a" 1) ("b" 2) (else 3))"#;
    let (value, _) = assert_same(src);
    assert_eq!(value, Value::integer(2));
    let src = r#"(switch "z" ("a" 1) ("b" 2) (else 3))"#;
    let (value, _) = assert_same(src);
    assert_eq!(value, Value::integer(3));
}

#[test]
fn ifelse_is_vectorized() {
    let src = "(ifelse (> (: 1 5) 2) 1 0)";
    let (value, _) = assert_same(src);
    assert_eq!(value, Value::integers(vec![0, 0, 1, 1, 1]));
}

#[test]
fn empty_for_loop_body_never_runs() {
    let src = "(begin (<- s 0) (for i (c) (<- s (+ s 1))) s)";
    let (value, _) = assert_same(src);
    assert_eq!(value, Value::integer(0));
}

// === Environment operations ===

#[test]
fn rm_unbinds_names() {
    let src = "(begin (<- x 1) (rm x) (missing x))";
    let (value, _) = assert_same(src);
    assert_eq!(value, Value::logical(true));
}

#[test]
fn hot_exit_compiles_a_side_trace() {
    // the condition flips halfway through, making the taken branch's
    // guard fail repeatedly
    let src = "(begin (<- s 0)
        (for i (: 1 4000)
          (if (< i 2000) (<- s (+ s 1)) (<- s (+ s 2))))
        s)";
    let (value, thread) = assert_same(src);
    // 1999 increments of one, then 2001 increments of two
    assert_eq!(value, Value::integer(1999 + 2 * 2001));
    // at least a root trace; hot exits may have attached side traces
    assert!(thread.jit.trace_count() >= 1);
}
