//! Interpreter and JIT kernels must agree on every output and every error

use std::sync::Arc;

use blockexpr::{
    Column, CompiledExpr, Compiler, Dtype, EvalError, EvalResult, InProcessHost, Input, JitHost, RuntimeConfig,
    UserFunction, Value, VariableEx,
};
use pretty_assertions::assert_eq;

fn compile_jit(source: &str, vars: &[VariableEx]) -> CompiledExpr {
    let host: Arc<dyn JitHost> = Arc::new(InProcessHost::new());
    let expr = Compiler::new().jit(true).jit_host(host).compile(source, vars).unwrap();
    assert!(expr.has_jit_kernel(), "kernel was not instantiated");
    expr
}

/// Evaluate with the JIT on and off, returning both outcomes and the engines used
fn both(expr: &CompiledExpr, inputs: &[Input<'_>], count: usize, config: RuntimeConfig) -> [(EvalResult<Vec<Value>>, &'static str); 2] {
    [true, false].map(|jit| {
        let mut out = Column::zeros(expr.output_dtype(), count.max(1)).unwrap();
        let result = {
            let mut view = out.as_output().unwrap();
            expr.evaluate_with(inputs, &mut view, count, &config.with_jit(jit))
        };
        match result {
            Ok(stats) => (Ok(out.values()), stats.engine),
            Err(e) => (Err(e), if jit { "jit" } else { "interpreter" }),
        }
    })
}

fn agree(expr: &CompiledExpr, inputs: &[Input<'_>], count: usize, config: RuntimeConfig) -> EvalResult<Vec<Value>> {
    let [(jit, jit_engine), (interp, interp_engine)] = both(expr, inputs, count, config);
    assert_eq!(jit_engine, "jit");
    assert_eq!(interp_engine, "interpreter");
    assert_eq!(jit, interp);
    jit
}

#[test]
fn test_return_inside_loop() {
    let source = "\
def kernel(x):
    for i in range(4):
        if i == x:
            return 10.0 + x
    return -1.0
";
    let expr = compile_jit(source, &[VariableEx::array("x", Dtype::Float64)]);
    let x = vec![0.0f64, 1.0, 3.0, 5.0];
    let out = agree(&expr, &[Input::from(&x)], 4, RuntimeConfig::default()).unwrap();
    assert_eq!(
        out,
        vec![Value::Float64(10.0), Value::Float64(11.0), Value::Float64(13.0), Value::Float64(-1.0)]
    );
}

#[test]
fn test_iteration_cap() {
    let source = "def k(x):\n    n = 0\n    while n < x:\n        n += 1\n    return n\n";
    let expr = compile_jit(source, &[VariableEx::array("x", Dtype::Int32)]);
    let x = vec![5i32, 50];

    let config = RuntimeConfig::default().with_max_while_iterations(50);
    let out = agree(&expr, &[Input::from(&x)], 2, config).unwrap();
    assert_eq!(out.iter().map(Value::as_i64).collect::<Vec<_>>(), vec![5, 50]);

    let config = RuntimeConfig::default().with_max_while_iterations(49);
    let err = agree(&expr, &[Input::from(&x)], 2, config).unwrap_err();
    assert_eq!(err, EvalError::IterationLimit { limit: 49 });
}

#[test]
fn test_traps_only_on_taken_paths() {
    let source = "\
def k(x):
    if x > 0:
        y = x * 2
        if y > 10:
            return y
    else:
        return 0
    return y
";
    let expr = compile_jit(source, &[VariableEx::array("x", Dtype::Int64)]);

    let x = vec![1i64, 6, -4];
    let out = agree(&expr, &[Input::from(&x)], 3, RuntimeConfig::default()).unwrap();
    assert_eq!(out, vec![Value::Int64(2), Value::Int64(12), Value::Int64(0)]);

    let missing = "def k(x):\n    if x > 0:\n        return x\n";
    let expr = compile_jit(missing, &[VariableEx::array("x", Dtype::Int64)]);
    let x = vec![1i64, 2, 3];
    assert!(agree(&expr, &[Input::from(&x)], 3, RuntimeConfig::default()).is_ok());
    let x = vec![1i64, 0, 3];
    let err = agree(&expr, &[Input::from(&x)], 3, RuntimeConfig::default()).unwrap_err();
    assert_eq!(err, EvalError::MissingReturn);
}

#[test]
fn test_zero_step() {
    let source = "def k(x, s):\n    t = 0\n    for i in range(0, x, s):\n        t += i\n    return t\n";
    let vars = [VariableEx::array("x", Dtype::Int64), VariableEx::array("s", Dtype::Int64)];
    let expr = compile_jit(source, &vars);
    let x = vec![6i64, 6];
    let s = vec![2i64, 3];
    let out = agree(&expr, &[Input::from(&x), Input::from(&s)], 2, RuntimeConfig::default()).unwrap();
    assert_eq!(out, vec![Value::Int64(6), Value::Int64(3)]);

    let s = vec![2i64, 0];
    let err = agree(&expr, &[Input::from(&x), Input::from(&s)], 2, RuntimeConfig::default()).unwrap_err();
    assert_eq!(err, EvalError::ZeroStep);
}

#[test]
fn test_reductions_and_user_functions() {
    fn clamp(args: &[Value]) -> Value {
        Value::Float64(args[0].as_f64().clamp(0.0, 1.0))
    }
    let source = "\
def k(x):
    n = 0
    for i in range(4):
        if any(x > i):
            n += 1
    return clamp(x - mean(x)) + n
";
    let vars = [
        VariableEx::array("x", Dtype::Int64),
        VariableEx::function(UserFunction::function("clamp", &[Dtype::Float64], Dtype::Float64, clamp)),
    ];
    let expr = compile_jit(source, &vars);
    let x = vec![0i64, 2];
    let out = agree(&expr, &[Input::from(&x)], 2, RuntimeConfig::default()).unwrap();
    assert_eq!(out, vec![Value::Float64(2.0), Value::Float64(3.0)]);
}

#[test]
fn test_float_contraction_matches() {
    let source = "# me:fp=contract\ndef k(a, b, c):\n    return a * b + c\n";
    let vars = [
        VariableEx::array("a", Dtype::Float64),
        VariableEx::array("b", Dtype::Float64),
        VariableEx::array("c", Dtype::Float64),
    ];
    let expr = compile_jit(source, &vars);
    let a = vec![0.1f64, 1e16];
    let b = vec![10.0f64, 1.0 + f64::EPSILON];
    let c = vec![-1.0f64, -1e16];
    let out = agree(&expr, &[Input::from(&a), Input::from(&b), Input::from(&c)], 2, RuntimeConfig::default()).unwrap();
    let expected: Vec<Value> = (0..2).map(|i| Value::Float64(a[i].mul_add(b[i], c[i]))).collect();
    assert_eq!(out, expected);
}

#[test]
fn test_hoisted_and_loop_reductions() {
    let source = "\
def k(x):
    i = 0
    while any(x > i):
        i += 1
    return x + sum(x) + max(x) * i
";
    let expr = compile_jit(source, &[VariableEx::array("x", Dtype::Int64)]);
    let module = expr.kernel_module().unwrap();
    assert_eq!(module.reductions.len(), 3);
    assert!(!module.reductions[0].hoisted);
    assert!(module.reductions[1].hoisted);

    let x = vec![1i64, 4, 2];
    let out = agree(&expr, &[Input::from(&x)], 3, RuntimeConfig::default()).unwrap();
    // sum 7, max 4, loop stops at i = 4
    assert_eq!(out.iter().map(Value::as_i64).collect::<Vec<_>>(), vec![24, 27, 25]);
}
