//! Block-wise evaluation of chunked ND arrays

use std::sync::Arc;

use blockexpr::{
    compile, compile_nd, ChunkGeometry, Compiler, Dtype, EvalError, InProcessHost, Input, Output, RuntimeConfig,
    Variable, VariableEx,
};
use pretty_assertions::assert_eq;

#[test]
fn test_edge_block_is_zero_padded() {
    let geometry = ChunkGeometry::new(&[5], &[4], &[2]).unwrap();
    let expr = compile_nd("x", &[Variable::new("x", Dtype::Int32)], Dtype::Auto, geometry).unwrap();
    assert_eq!(expr.valid_item_count(1, 0).unwrap(), 1);

    let x = vec![3i32, 999];
    let mut out = vec![-7i32; 2];
    expr.evaluate_nd_with(&[Input::from(&x)], &mut Output::from(&mut out), 2, 1, 0, &RuntimeConfig::default())
        .unwrap();
    assert_eq!(out, vec![3, 0]);
}

#[test]
fn test_kernel_parameters_bind_by_name() {
    let source = "def f(y, x):\n    return x + 2 * y\n";
    let vars = [Variable::new("x", Dtype::Int64), Variable::new("y", Dtype::Int64)];
    let expr = compile(source, &vars, Dtype::Auto).unwrap();
    let x = vec![1i64, 2, 3, 4];
    let y = vec![10i64, 20, 30, 40];
    let mut out = vec![0i64; 4];
    expr.evaluate_with(
        &[Input::from(&x), Input::from(&y)],
        &mut Output::from(&mut out),
        4,
        &RuntimeConfig::default(),
    )
    .unwrap();
    assert_eq!(out, vec![21, 42, 63, 84]);
}

#[test]
fn test_index_variables_are_absolute() {
    // Chunk (1, 0) of a 4x6 array in 2x3 chunks, block 1 of 2x2 blocks: rows 2..4, col 2 only
    let geometry = ChunkGeometry::new(&[4, 6], &[2, 3], &[2, 2]).unwrap();
    let expr = compile_nd(
        "x + _i0 * 100 + _i1 * 10 + _ndim",
        &[Variable::new("x", Dtype::Int64)],
        Dtype::Auto,
        geometry,
    )
    .unwrap();
    assert_eq!(expr.valid_item_count(2, 1).unwrap(), 2);

    let x = vec![0i64; 4];
    let mut out = vec![-1i64; 6];
    expr.evaluate_nd_with(&[Input::from(&x)], &mut Output::from(&mut out), 6, 2, 1, &RuntimeConfig::default())
        .unwrap();
    assert_eq!(out, vec![222, 0, 322, 0, 0, 0]);
}

#[test]
fn test_block_kernel_parity() {
    let source = "\
def k(x):
    acc = 0
    for i in range(_i0 + 1):
        acc += x
    return acc
";
    let geometry = ChunkGeometry::new(&[7], &[4], &[4]).unwrap();
    let vars = [VariableEx::array("x", Dtype::Int32)];
    let expr = Compiler::new()
        .jit(true)
        .jit_host(Arc::new(InProcessHost::new()))
        .geometry(geometry)
        .compile(source, &vars)
        .unwrap();
    assert!(expr.has_jit_kernel());

    let x = vec![1i32, 2, 3, 4];
    let mut results = Vec::new();
    for jit in [true, false] {
        let mut out = vec![0i32; 4];
        let stats = expr
            .evaluate_nd_with(
                &[Input::from(&x)],
                &mut Output::from(&mut out),
                4,
                1,
                0,
                &RuntimeConfig::default().with_jit(jit),
            )
            .unwrap();
        assert_eq!(stats.engine, if jit { "jit" } else { "interpreter" });
        results.push(out);
    }
    // Coordinates 4, 5, 6 are valid; the fourth item is padding
    assert_eq!(results[0], vec![5, 12, 21, 0]);
    assert_eq!(results[0], results[1]);
}

#[test]
fn test_root_reduction_over_valid_items() {
    let geometry = ChunkGeometry::new(&[3, 3], &[3, 3], &[2, 2]).unwrap();
    let expr = compile_nd("max(x)", &[Variable::new("x", Dtype::Float32)], Dtype::Auto, geometry).unwrap();
    // Block 3 covers only (2, 2)
    let x = vec![1.5f32, 50.0, 60.0, 70.0];
    let mut out = vec![0f32; 4];
    expr.evaluate_nd_with(&[Input::from(&x)], &mut Output::from(&mut out), 4, 0, 3, &RuntimeConfig::default())
        .unwrap();
    assert_eq!(out[0], 1.5);
}

#[test]
fn test_invalid_block_calls() {
    let geometry = ChunkGeometry::new(&[5], &[4], &[2]).unwrap();
    let expr = compile_nd("x * 2", &[Variable::new("x", Dtype::Int32)], Dtype::Auto, geometry).unwrap();
    let x = vec![1i32, 2];
    let mut out = vec![0i32; 2];
    let config = RuntimeConfig::default();

    let err = expr.evaluate_nd_with(&[Input::from(&x)], &mut Output::from(&mut out), 2, 0, 2, &config);
    assert_eq!(err.unwrap_err(), EvalError::BlockOutOfRange { index: 2, count: 2 });

    let short = vec![1i32];
    let err = expr.evaluate_nd_with(&[Input::from(&short)], &mut Output::from(&mut out), 2, 0, 0, &config);
    assert_eq!(err.unwrap_err(), EvalError::buffer_too_small("input `x`", 2, 1));

    let flat = compile("x * 2", &[Variable::new("x", Dtype::Int32)], Dtype::Auto).unwrap();
    let err = flat.evaluate_nd_with(&[Input::from(&x)], &mut Output::from(&mut out), 2, 0, 0, &config);
    assert_eq!(err.unwrap_err(), EvalError::NotNd);
}

#[test]
fn test_padded_edge_block_parity_with_reduction() {
    let source = "\
def k(x):
    return x * 10 + _i0 * 3 + _i1 + sum(x)
";
    // Chunk 1 starts at column 2 and the array ends at column 3, so column 3 is padding
    let geometry = ChunkGeometry::new(&[5, 3], &[4, 2], &[2, 2]).unwrap();
    let vars = [VariableEx::array("x", Dtype::Int64)];
    let expr = Compiler::new()
        .jit(true)
        .jit_host(Arc::new(InProcessHost::new()))
        .geometry(geometry)
        .compile(source, &vars)
        .unwrap();
    assert!(expr.has_jit_kernel());
    assert_eq!(expr.valid_item_count(1, 0).unwrap(), 2);

    let x = vec![1i64, 100, 2, 100];
    let mut results = Vec::new();
    for jit in [true, false] {
        let mut out = vec![-1i64; 6];
        let stats = expr
            .evaluate_nd_with(
                &[Input::from(&x)],
                &mut Output::from(&mut out),
                6,
                1,
                0,
                &RuntimeConfig::default().with_jit(jit),
            )
            .unwrap();
        assert_eq!(stats.engine, if jit { "jit" } else { "interpreter" });
        results.push(out);
    }
    assert_eq!(results[0], vec![15, 0, 28, 0, 0, 0]);
    assert_eq!(results[0], results[1]);
}
