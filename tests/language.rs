//! End-to-end compilation and evaluation through the public API

use blockexpr::{
    compile, compile_ex, Column, CompileErrorKind, CompiledExpr, Dtype, Input, ReductionKind, RuntimeConfig,
    UserFunction, Value, Variable, VariableEx,
};
use pretty_assertions::assert_eq;

fn eval(expr: &CompiledExpr, inputs: &[Input<'_>], count: usize) -> Vec<Value> {
    let len = if expr.reduction().is_some() { 1 } else { count.max(1) };
    let mut out = Column::zeros(expr.output_dtype(), len).unwrap();
    {
        let mut view = out.as_output().unwrap();
        expr.evaluate_with(inputs, &mut view, count, &RuntimeConfig::default().with_jit(false))
            .unwrap();
    }
    out.values()
}

#[test]
fn test_output_dtype_follows_promotion() {
    let cases = [
        (Dtype::Int8, Dtype::UInt8, Dtype::Int16),
        (Dtype::Int64, Dtype::UInt64, Dtype::Float64),
        (Dtype::Float32, Dtype::Float64, Dtype::Float64),
        (Dtype::Bool, Dtype::Int32, Dtype::Int32),
    ];
    for (a, b, expected) in cases {
        let expr = compile("a + b", &[Variable::new("a", a), Variable::new("b", b)], Dtype::Auto).unwrap();
        assert_eq!(expr.output_dtype(), expected, "{a} + {b}");
    }
}

#[test]
fn test_int64_arcsinh_to_float64() {
    let x: Vec<i64> = (1..=20).collect();
    let expr = compile("arcsinh(x)", &[Variable::new("x", Dtype::Int64)], Dtype::Float64).unwrap();
    let out = eval(&expr, &[Input::from(&x)], x.len());
    for (v, xi) in out.iter().zip(&x) {
        assert!((v.as_f64() - (*xi as f64).asinh()).abs() < 1e-6, "asinh({xi})");
    }
}

#[test]
fn test_scratch_bounded_by_chunk() {
    let n = 1_000_000usize;
    let chunk = 10_000usize;
    let x: Vec<i32> = (0..n as i32).collect();
    let expr = compile("x * 0.5 + 1", &[Variable::new("x", Dtype::Int32)], Dtype::Float32).unwrap();
    let mut out = vec![0f32; chunk];
    let config = RuntimeConfig::default();
    for start in (0..n).step_by(chunk) {
        let view = Input::from(&x[start..start + chunk]);
        let stats = expr
            .evaluate_with(&[view], &mut blockexpr::Output::from(&mut out), chunk, &config)
            .unwrap();
        assert!(stats.scratch_items <= chunk);
    }
    assert_eq!(out[chunk - 1], (n - 1) as f32 * 0.5 + 1.0);
}

#[test]
fn test_reduction_identities() {
    let empty: Vec<i32> = Vec::new();
    let vars = [Variable::new("x", Dtype::Int32)];
    let cases = [
        ("sum(x)", Value::Int64(0)),
        ("prod(x)", Value::Int64(1)),
        ("min(x)", Value::Int32(i32::MAX)),
        ("max(x)", Value::Int32(i32::MIN)),
    ];
    for (source, expected) in cases {
        let expr = compile(source, &vars, Dtype::Auto).unwrap();
        assert_eq!(eval(&expr, &[Input::from(&empty)], 0), vec![expected], "{source}");
    }

    let flags: Vec<bool> = Vec::new();
    let vars = [Variable::new("b", Dtype::Bool)];
    let any = compile("any(b)", &vars, Dtype::Auto).unwrap();
    assert_eq!(any.reduction(), Some(ReductionKind::Any));
    assert_eq!(eval(&any, &[Input::from(&flags)], 0), vec![Value::Bool(false)]);
    let all = compile("all(b)", &vars, Dtype::Auto).unwrap();
    assert_eq!(eval(&all, &[Input::from(&flags)], 0), vec![Value::Bool(true)]);
}

#[test]
fn test_nested_reductions_rejected() {
    let vars = [Variable::new("x", Dtype::Float64)];
    for source in ["sum(sum(x))", "sum(x + sum(x))"] {
        let err = compile(source, &vars, Dtype::Auto).unwrap_err();
        assert_eq!(err.kind(), CompileErrorKind::Type, "{source}");
        assert!(err.pos().is_some());
    }
}

#[test]
fn test_reduction_broadcast() {
    let x = vec![1.0f64, 2.0, 6.0];
    let expr = compile("x - mean(x)", &[Variable::new("x", Dtype::Float64)], Dtype::Auto).unwrap();
    assert_eq!(expr.reduction(), None);
    assert_eq!(
        eval(&expr, &[Input::from(&x)], 3),
        vec![Value::Float64(-2.0), Value::Float64(-1.0), Value::Float64(3.0)]
    );
}

#[test]
fn test_statement_sequence() {
    let x = vec![1i64, 2, 3];
    let expr = compile("t = x * 2; t + 1", &[Variable::new("x", Dtype::Int64)], Dtype::Auto).unwrap();
    assert_eq!(
        eval(&expr, &[Input::from(&x)], 3),
        vec![Value::Int64(3), Value::Int64(5), Value::Int64(7)]
    );
}

#[test]
fn test_string_predicates() {
    let names = Column::from_strs(&["apple", "banana", "apricot"], 32);
    let x = vec![1i32, 1, -1];
    let vars = [VariableEx::string("s", 32), VariableEx::array("x", Dtype::Int32)];
    let expr = compile_ex("startswith(s, 'ap') and x > 0", &vars, Dtype::Auto).unwrap();
    assert_eq!(expr.output_dtype(), Dtype::Bool);
    assert_eq!(
        eval(&expr, &[names.as_input(), Input::from(&x)], 3),
        vec![Value::Bool(true), Value::Bool(false), Value::Bool(false)]
    );
}

#[test]
fn test_user_function() {
    fn twice(args: &[Value]) -> Value {
        Value::Float64(args[0].as_f64() * 2.0)
    }
    let offset = UserFunction::closure("offset", &[Dtype::Float64], Dtype::Float64, 100.0f64, |base, args| {
        Value::Float64(args[0].as_f64() + base)
    });
    let vars = [
        VariableEx::array("x", Dtype::Float32),
        VariableEx::function(UserFunction::function("twice", &[Dtype::Float64], Dtype::Float64, twice)),
        VariableEx::function(offset),
    ];
    let expr = compile_ex("offset(twice(x))", &vars, Dtype::Auto).unwrap();
    let x = vec![0.5f32, 4.0];
    assert_eq!(
        eval(&expr, &[Input::from(&x)], 2),
        vec![Value::Float64(101.0), Value::Float64(108.0)]
    );
}

#[test]
fn test_syntax_errors_carry_positions() {
    let err = compile("x +", &[Variable::new("x", Dtype::Int32)], Dtype::Auto).unwrap_err();
    assert_eq!(err.kind(), CompileErrorKind::Syntax);
    assert!(err.pos().is_some());

    let err = compile("y + 1", &[Variable::new("x", Dtype::Int32)], Dtype::Auto).unwrap_err();
    assert!(err.pos().is_some());
}

#[test]
fn test_invalid_declarations() {
    let err = compile(
        "x + 1",
        &[Variable::new("x", Dtype::Int32), Variable::new("x", Dtype::Int64)],
        Dtype::Auto,
    )
    .unwrap_err();
    assert_eq!(err.kind(), CompileErrorKind::InvalidArgument);

    let err = compile("x + 1", &[Variable::new("x", Dtype::Auto)], Dtype::Auto).unwrap_err();
    assert_eq!(err.kind(), CompileErrorKind::InvalidArgument);
}
