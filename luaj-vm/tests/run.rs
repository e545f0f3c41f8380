//! End-to-end scenarios: compile a chunk and run it under a protected
//! call, asserting in-language with `assert`.

use luaj_vm::prelude::*;
use test_case::test_case;

fn load_ok(st: &mut State, src: &str) {
    let status = st.load(src.as_bytes(), "test");
    if !status.is_ok() {
        let msg = st.pop().map(|v| st.display_value(v)).unwrap_or_default();
        panic!("load failed ({status:?}): {msg}");
    }
}

fn run(src: &str) -> Status {
    let mut st = State::new();
    load_ok(&mut st, src);
    let status = st.pcall(0, 0, 0);
    if !status.is_ok() {
        let msg = st.pop().map(|v| st.display_value(v)).unwrap_or_default();
        panic!("run failed ({status:?}): {msg}");
    }
    status
}

/// Runs a chunk expected to return one value and hands it back.
fn eval(src: &str) -> Value {
    let mut st = State::new();
    load_ok(&mut st, src);
    let status = st.pcall(0, 1, 0);
    assert!(status.is_ok(), "run failed: {status:?}");
    st.get(0).expect("missing result")
}

#[test_case("local a=3; local b=4; local c = a==3 and b==4; assert(c == true)" ; "and_of_comparisons_is_true")]
#[test_case("local a=3; local b=4; assert((a and b) == 4)" ; "and_yields_right_operand")]
#[test_case("local r = 2^3^2; assert(r == 512)" ; "exponent_is_right_associative")]
#[test_case(
    "local function f(a,b) return a+1, b+2, a+3 end\n\
     local x,y,z,w = f(1,2)\n\
     assert(x==2 and y==4 and z==4 and w==nil)" ;
    "multi_return_adjusts_and_pads_nil"
)]
#[test_case("local i=0; while i < 10 do i = i + 1 end; assert(i == 10)" ; "while_loop_counts_to_ten")]
#[test_case("local s = 'a' .. 'b' .. 'c'; assert(s == 'abc')" ; "concat_chain_builds_abc")]
fn language_scenarios(src: &str) {
    assert_eq!(run(src), Status::Ok);
}

#[test]
fn chunk_returns_a_value() {
    assert_eq!(eval("return 1 + 2").as_num(), Some(3.0));
    assert!(eval("return nil").is_nil());
    assert!(eval("return 1 == 1.0").is_true());
}

#[test]
fn or_yields_first_truthy_operand() {
    assert_eq!(eval("local a = false local b = 7 return a or b").as_num(), Some(7.0));
    assert_eq!(eval("local a = 5 local b = 7 return a or b").as_num(), Some(5.0));
    assert!(eval("return nil or false").is_false());
}

#[test]
fn not_produces_booleans() {
    assert!(eval("return not nil").is_true());
    assert!(eval("return not 0").is_false());
    assert!(eval("return not ''").is_false());
    assert!(eval("local a = 1 return not (a == 1)").is_false());
    assert!(eval("local a = 1 return not not a").is_true());
}

#[test]
fn if_elseif_else_chains() {
    let src = "local a = 2\n\
               local r = 0\n\
               if a == 1 then r = 10 elseif a == 2 then r = 20 else r = 30 end\n\
               return r";
    assert_eq!(eval(src).as_num(), Some(20.0));
}

#[test]
fn repeat_runs_body_at_least_once() {
    assert_eq!(eval("local i = 0 repeat i = i + 1 until true return i").as_num(), Some(1.0));
    assert_eq!(
        eval("local i = 0 repeat i = i + 1 until i >= 3 return i").as_num(),
        Some(3.0)
    );
}

#[test]
fn break_leaves_innermost_loop() {
    let src = "local n = 0\n\
               local i = 0\n\
               while i < 10 do\n\
                 i = i + 1\n\
                 local j = 0\n\
                 while true do\n\
                   j = j + 1\n\
                   if j == 2 then break end\n\
                 end\n\
                 n = n + j\n\
               end\n\
               return n";
    assert_eq!(eval(src).as_num(), Some(20.0));
}

#[test]
fn multiple_assignment_evaluates_rhs_first() {
    assert_eq!(
        eval("local a, b = 1, 2 a, b = b, a return a * 10 + b").as_num(),
        Some(21.0)
    );
}

#[test]
fn surplus_rhs_values_are_dropped() {
    assert_eq!(eval("local a = 1, 2, 3 return a").as_num(), Some(1.0));
    assert_eq!(eval("local a, b = 9 return a * 10 + (b == nil and 1 or 0)").as_num(), Some(91.0));
}

#[test]
fn nested_calls_stack_frames() {
    // inner functions see only their own locals, so helpers arrive as
    // arguments
    let src = "local function add1(x) return x + 1 end\n\
               local function apply_twice(f, x) return f(f(x)) end\n\
               return apply_twice(add1, 0) + add1(add1(0))";
    assert_eq!(eval(src).as_num(), Some(4.0));
}

#[test]
fn missing_arguments_become_nil() {
    assert!(eval("local function f(a, b) return b end return f(1) == nil").is_true());
    assert_eq!(eval("local function f(a, b) return a end return f(1, 2, 3)").as_num(), Some(1.0));
}

#[test]
fn division_follows_ieee() {
    assert!(eval("return 1 / 0 > 0").is_true());
    assert!(eval("return -1 / 0 < 0").is_true());
    // NaN compares false against everything, including itself
    assert!(eval("local z = 0 / 0 return z == z").is_false());
    assert!(eval("local z = 0 / 0 return z < z").is_false());
    assert!(eval("local z = 0 / 0 return z ~= z").is_true());
}

#[test]
fn floored_modulo_signs() {
    assert_eq!(eval("return 5 % 3").as_num(), Some(2.0));
    assert_eq!(eval("local a = -5 return a % 3").as_num(), Some(1.0));
    assert_eq!(eval("local a = 5 return a % -3").as_num(), Some(-1.0));
}

#[test]
fn string_equality_is_by_contents() {
    assert!(eval("local a = 'x' .. 'y' return a == 'xy'").is_true());
    assert!(eval("local a = 'x' return a ~= 'y'").is_true());
    assert!(eval("return 'a' == 1").is_false());
}

#[test]
fn type_builtin_names_types() {
    assert_eq!(run("assert(type(1) == 'number')"), Status::Ok);
    assert_eq!(run("assert(type('s') == 'string')"), Status::Ok);
    assert_eq!(run("assert(type(nil) == 'nil')"), Status::Ok);
    assert_eq!(run("assert(type(true) == 'boolean')"), Status::Ok);
    assert_eq!(run("assert(type(print) == 'function')"), Status::Ok);
}

#[test]
fn assert_returns_its_arguments() {
    assert_eq!(eval("return assert(41) + 1").as_num(), Some(42.0));
}

#[test]
fn stack_top_is_restored_around_calls() {
    let mut st = State::new();
    load_ok(&mut st, "local x = 1 return x");
    let before = st.top();
    assert_eq!(st.pcall(0, 0, 0), Status::Ok);
    // the chunk and its arguments are consumed, nothing else remains
    assert_eq!(st.top(), before - 1);
}

#[test]
fn comparison_operators_cover_both_orders() {
    assert!(eval("local a = 2 return 1 < a").is_true());
    assert!(eval("local a = 2 return 3 <= a").is_false());
    assert!(eval("local a = 2 return 3 > a").is_true());
    assert!(eval("local a = 2 return a >= 2").is_true());
}

#[test]
fn self_recursion_requires_upvalues() {
    // the name is defined before the body parses, but a nested function
    // cannot reach enclosing locals yet, so self-recursion is rejected
    let src = "local function f(n) if n == 0 then return 0 end return f(n - 1) + 1 end\n\
               return f(200)";
    let mut st = State::new();
    let status = st.load(src.as_bytes(), "test");
    assert_eq!(status, Status::SyntaxErr);
    let msg = st.pop().map(|v| st.display_value(v)).unwrap_or_default();
    assert!(msg.contains("undefined variable 'f'"), "{msg}");
}

#[test]
fn deep_call_nesting_grows_the_register_stack() {
    // recursion through a self-passed parameter: 2000 live frames push
    // the register stack well past its initial 4096 slots
    let src = "local function rec(self, n)\n\
                 if n == 0 then return 0 end\n\
                 return self(self, n - 1) + 1\n\
               end\n\
               return rec(rec, 2000)";
    assert_eq!(eval(src).as_num(), Some(2000.0));
}

#[test]
fn iterative_workload_runs_long_loops() {
    let src = "local acc = 0\n\
               local i = 0\n\
               while i < 10000 do\n\
                 acc = acc + i % 7\n\
                 i = i + 1\n\
               end\n\
               return acc";
    let v = eval(src);
    // sum of i % 7 over 0..10000
    let expected: f64 = (0..10000).map(|i| (i % 7) as f64).sum();
    assert_eq!(v.as_num(), Some(expected));
}
