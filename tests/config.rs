//! Process-wide configuration and the registered JIT host.
//!
//! Everything here mutates global state, so it lives in one test.

use std::sync::Arc;

use blockexpr::config;
use blockexpr::{compile, simd, Dtype, InProcessHost, Input, Output, Precision, Variable};
use pretty_assertions::assert_eq;

#[test]
fn test_global_configuration() {
    let kernel = "def k(x):\n    n = 0\n    while n < x:\n        n += 1\n    return n\n";
    let vars = [Variable::new("x", Dtype::Int64)];
    let x = vec![3i64, 8];

    // No host registered: kernels fall back to the interpreter
    config::unregister_jit_host();
    let expr = compile(kernel, &vars, Dtype::Auto).unwrap();
    assert!(!expr.has_jit_kernel());

    let host = Arc::new(InProcessHost::new());
    assert!(config::register_jit_host(host.clone()).is_none());
    let expr = compile(kernel, &vars, Dtype::Auto).unwrap();
    assert!(expr.has_jit_kernel());
    assert_eq!(host.live_kernels(), 1);

    let mut out = vec![0i64; 2];
    let stats = expr.evaluate(&[Input::from(&x)], &mut Output::from(&mut out), 2).unwrap();
    assert_eq!(stats.engine, "jit");
    assert_eq!(out, vec![3, 8]);

    // The cap is read at the start of every call
    let before = config::snapshot().version;
    let version = config::set_max_while_iterations(5);
    assert!(version > before);
    let err = expr.evaluate(&[Input::from(&x)], &mut Output::from(&mut out), 2).unwrap_err();
    assert!(err.is_runtime_trap());
    config::set_max_while_iterations(config::DEFAULT_MAX_WHILE_ITERATIONS);

    config::set_jit_enabled(false);
    let stats = expr.evaluate(&[Input::from(&x)], &mut Output::from(&mut out), 2).unwrap();
    assert_eq!(stats.engine, "interpreter");
    config::set_jit_enabled(true);

    config::set_precision(Precision::Ulp35);
    config::set_vectorized(true);
    assert_eq!(simd::backend_name(), "simd-u35");
    config::set_precision(Precision::Ulp10);
    assert_eq!(simd::backend_name(), "simd-u10");

    drop(expr);
    assert_eq!(host.live_kernels(), 0);
    assert!(config::unregister_jit_host().is_some());
}
