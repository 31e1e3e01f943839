//! Block Expression Compiler
//!
//! This library compiles vectorized array expressions and small Python-style
//! element kernels into typed programs, then evaluates them over flat buffers or
//! over padded blocks of chunked ND arrays.
//!
//! # Example
//!
//! ```rust
//! use blockexpr::{compile, Dtype, Input, Output, Variable};
//!
//! let vars = [Variable::new("x", Dtype::Float64), Variable::new("y", Dtype::Float64)];
//! let expr = compile("x * 2 + y", &vars, Dtype::Auto).unwrap();
//!
//! let x = vec![1.0, 2.0, 3.0];
//! let y = vec![0.5, 0.5, 0.5];
//! let mut out = vec![0.0; 3];
//! expr.evaluate(&[Input::from(&x), Input::from(&y)], &mut Output::from(&mut out), 3).unwrap();
//! assert_eq!(out, vec![2.5, 4.5, 6.5]);
//! ```

pub mod arena;
pub mod ast;
pub mod lexer;
pub mod parser;
pub mod dtype;
pub mod value;
pub mod ops;
pub mod builtins;
pub mod reduction;
pub mod vars;
pub mod buffer;
pub mod ir;
pub mod analyzer;
pub mod eval;
mod interp;
pub mod nd;
pub mod kernel;
pub mod codegen;
pub mod jit;
mod approx;
pub mod simd;
pub mod config;
pub mod error;
pub mod expr;

use std::sync::Arc;
use tracing::debug;

pub use analyzer::Analyzer;
pub use ast::{Ast, Dialect, FpMode, Form, Pragmas};
pub use buffer::{Column, Input, Output};
pub use codegen::CodeGenerator;
pub use config::RuntimeConfig;
pub use dtype::Dtype;
pub use error::{CompileError, CompileErrorKind, CompileResult, EvalError, EvalResult, Pos};
pub use eval::EvalStats;
pub use expr::CompiledExpr;
pub use jit::{InProcessHost, JitHost, JitKernel, KernelHandle};
pub use kernel::KernelModule;
pub use nd::ChunkGeometry;
pub use parser::Parser;
pub use reduction::ReductionKind;
pub use simd::Precision;
pub use value::Value;
pub use vars::{UserFunction, Variable, VariableEx};

/// Compile a source program over plain array variables
pub fn compile(source: &str, variables: &[Variable], output: Dtype) -> CompileResult<CompiledExpr> {
    let variables: Vec<VariableEx> = variables.iter().map(VariableEx::from).collect();
    Compiler::new().output(output).compile(source, &variables)
}

/// Compile with extended variables: string inputs and user functions
pub fn compile_ex(source: &str, variables: &[VariableEx], output: Dtype) -> CompileResult<CompiledExpr> {
    Compiler::new().output(output).compile(source, variables)
}

/// Compile for block-wise evaluation of a chunked ND array
pub fn compile_nd(
    source: &str,
    variables: &[Variable],
    output: Dtype,
    geometry: ChunkGeometry,
) -> CompileResult<CompiledExpr> {
    let variables: Vec<VariableEx> = variables.iter().map(VariableEx::from).collect();
    Compiler::new().output(output).geometry(geometry).compile(source, &variables)
}

/// Compilation options beyond the convenience functions
#[derive(Clone)]
pub struct Compiler {
    output: Dtype,
    geometry: Option<ChunkGeometry>,
    /// Overrides the process JIT flag
    jit: Option<bool>,
    /// Overrides the registered JIT host
    host: Option<Arc<dyn JitHost>>,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(mut self, dtype: Dtype) -> Self {
        self.output = dtype;
        self
    }

    pub fn geometry(mut self, geometry: ChunkGeometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn jit(mut self, enabled: bool) -> Self {
        self.jit = Some(enabled);
        self
    }

    pub fn jit_host(mut self, host: Arc<dyn JitHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn compile(&self, source: &str, variables: &[VariableEx]) -> CompileResult<CompiledExpr> {
        // Parse the source
        let mut parser = Parser::new(source);
        let ast = parser.parse_program()?;

        // Resolve names and dtypes
        let ndim = self.geometry.as_ref().map_or(1, ChunkGeometry::ndim);
        let analyzer = Analyzer::new(variables, self.output)?.with_ndim(ndim);
        let program = analyzer.analyze(&ast)?;
        debug!(
            name = %program.name,
            output = %program.output,
            locals = program.locals.len(),
            reductions = program.reductions.len(),
            "program analyzed"
        );

        let kernel = self.lower(&program);
        Ok(CompiledExpr::new(
            program,
            analyzer.variables().to_vec(),
            self.geometry.clone(),
            kernel,
        ))
    }

    /// Lower a DSL program and hand it to the JIT host
    fn lower(&self, program: &ir::Program) -> Option<JitKernel> {
        if !program.is_dsl() {
            return None;
        }
        if !self.jit.unwrap_or_else(|| config::snapshot().config.jit_enabled) {
            debug!("JIT disabled; using the interpreter");
            return None;
        }
        let Some(host) = self.host.clone().or_else(config::jit_host) else {
            debug!("no JIT host registered; using the interpreter");
            return None;
        };

        let module = CodeGenerator::new().generate(program);
        let kernel = JitKernel::instantiate(module, host);
        if kernel.is_none() {
            debug!(name = %program.name, "JIT host declined the kernel; using the interpreter");
        }
        kernel
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self {
            output: Dtype::Auto,
            geometry: None,
            jit: None,
            host: None,
        }
    }
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler")
            .field("output", &self.output)
            .field("geometry", &self.geometry)
            .field("jit", &self.jit)
            .field("host", &self.host.as_ref().map(|h| h.name().to_string()))
            .finish()
    }
}
