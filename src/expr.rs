//! Compiled expressions and their evaluation entry points

use tracing::trace;

use crate::buffer::{Input, Output};
use crate::config::{self, RuntimeConfig};
use crate::dtype::Dtype;
use crate::error::{EvalError, EvalResult};
use crate::eval::{self, EvalStats, Frame};
use crate::interp::Interpreter;
use crate::ir::Program;
use crate::jit::JitKernel;
use crate::kernel::{KernelModule, Vm};
use crate::nd::ChunkGeometry;
use crate::reduction::ReductionKind;
use crate::vars::VariableEx;

/// A typed program ready to evaluate, optionally backed by a JIT kernel.
///
/// Evaluation takes `&self` and allocates only call-local scratch, so one
/// expression can be shared between threads.
#[derive(Debug)]
pub struct CompiledExpr {
    program: Program,
    variables: Vec<VariableEx>,
    geometry: Option<ChunkGeometry>,
    kernel: Option<JitKernel>,
}

impl CompiledExpr {
    pub(crate) fn new(
        program: Program,
        variables: Vec<VariableEx>,
        geometry: Option<ChunkGeometry>,
        kernel: Option<JitKernel>,
    ) -> Self {
        Self {
            program,
            variables,
            geometry,
            kernel,
        }
    }

    pub fn output_dtype(&self) -> Dtype {
        self.program.output
    }

    /// Variables as resolved at compile time (`Auto` arrays take their inferred dtype)
    pub fn variables(&self) -> &[VariableEx] {
        &self.variables
    }

    /// Kind of the reduction when the whole expression is one
    pub fn reduction(&self) -> Option<ReductionKind> {
        self.program.root_reduction_kind()
    }

    pub fn geometry(&self) -> Option<&ChunkGeometry> {
        self.geometry.as_ref()
    }

    pub fn has_jit_kernel(&self) -> bool {
        self.kernel.is_some()
    }

    pub fn kernel_module(&self) -> Option<&KernelModule> {
        self.kernel.as_ref().map(JitKernel::module)
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Evaluate `count` elements with the current process configuration
    pub fn evaluate(&self, inputs: &[Input<'_>], output: &mut Output<'_>, count: usize) -> EvalResult<EvalStats> {
        self.evaluate_with(inputs, output, count, &config::snapshot().config)
    }

    /// Evaluate `count` elements with an explicit configuration
    pub fn evaluate_with(
        &self,
        inputs: &[Input<'_>],
        output: &mut Output<'_>,
        count: usize,
        config: &RuntimeConfig,
    ) -> EvalResult<EvalStats> {
        self.check_inputs(inputs, count)?;
        self.check_output(output, if self.reduction().is_some() { 1 } else { count })?;

        if config.vectorized {
            if let Some(stats) = eval::run_column(&self.program, inputs, output, count, &config.math_backend()) {
                return Ok(stats);
            }
        }
        let frame = Frame::flat(inputs, count);
        self.run(&frame, output, config)
    }

    /// Evaluate one block of an ND array with the current process configuration
    pub fn evaluate_nd(
        &self,
        inputs: &[Input<'_>],
        output: &mut Output<'_>,
        padded_count: usize,
        chunk: u64,
        block: u64,
    ) -> EvalResult<EvalStats> {
        self.evaluate_nd_with(inputs, output, padded_count, chunk, block, &config::snapshot().config)
    }

    /// Evaluate one block of an ND array.
    ///
    /// Inputs hold one padded block each, row-major over the blockshape. The first
    /// `product(blockshape)` output slots receive results (padding zeroed) and
    /// any further slots up to `padded_count` are zeroed. A root reduction writes
    /// `output[0]` only.
    pub fn evaluate_nd_with(
        &self,
        inputs: &[Input<'_>],
        output: &mut Output<'_>,
        padded_count: usize,
        chunk: u64,
        block: u64,
        config: &RuntimeConfig,
    ) -> EvalResult<EvalStats> {
        let geometry = self.geometry.as_ref().ok_or(EvalError::NotNd)?;
        let region = geometry.locate(chunk, block)?;
        let items = region.items();
        if padded_count < items {
            return Err(EvalError::buffer_too_small("padded count", items, padded_count));
        }
        self.check_inputs(inputs, items)?;
        let root = self.reduction().is_some();
        self.check_output(output, if root { 1 } else { padded_count })?;

        let frame = Frame::block(inputs, region);
        let stats = self.run(&frame, output, config)?;
        if !root && padded_count > items {
            output.zero(items..padded_count);
        }
        Ok(stats)
    }

    /// Real (non-padding) elements of a block
    pub fn valid_item_count(&self, chunk: u64, block: u64) -> EvalResult<usize> {
        self.geometry.as_ref().ok_or(EvalError::NotNd)?.valid_item_count(chunk, block)
    }

    fn run(&self, frame: &Frame<'_>, output: &mut Output<'_>, config: &RuntimeConfig) -> EvalResult<EvalStats> {
        let stats = match (&self.kernel, config.jit_enabled) {
            (Some(kernel), true) => eval::run(&Vm::new(kernel.module()), &self.program, frame, output, config)?,
            _ => eval::run(&Interpreter, &self.program, frame, output, config)?,
        };
        trace!(engine = stats.engine, items = stats.items, scratch = stats.scratch_items, "evaluation finished");
        Ok(stats)
    }

    fn check_inputs(&self, inputs: &[Input<'_>], count: usize) -> EvalResult<()> {
        let slots = &self.program.inputs;
        if inputs.len() != slots.len() {
            return Err(EvalError::InputCount {
                expected: slots.len(),
                got: inputs.len(),
            });
        }
        for (slot, input) in slots.iter().zip(inputs) {
            if input.dtype() != slot.dtype {
                return Err(EvalError::InputDtype {
                    name: slot.name.clone(),
                    expected: slot.dtype,
                    got: input.dtype(),
                });
            }
            if slot.dtype == Dtype::String && input.itemsize() != slot.itemsize {
                return Err(EvalError::InputItemsize {
                    name: slot.name.clone(),
                    expected: slot.itemsize,
                    got: input.itemsize(),
                });
            }
            if input.len() < count {
                return Err(EvalError::buffer_too_small(format!("input `{}`", slot.name), count, input.len()));
            }
        }
        Ok(())
    }

    fn check_output(&self, output: &Output<'_>, needed: usize) -> EvalResult<()> {
        if output.dtype() != self.program.output {
            return Err(EvalError::OutputDtype {
                expected: self.program.output,
                got: output.dtype(),
            });
        }
        if output.len() < needed {
            return Err(EvalError::buffer_too_small("output", needed, output.len()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analyzer;
    use crate::parser::Parser;
    use pretty_assertions::assert_eq;

    fn expr(source: &str, vars: &[VariableEx], geometry: Option<ChunkGeometry>) -> CompiledExpr {
        let ast = Parser::new(source).parse_program().unwrap();
        let ndim = geometry.as_ref().map_or(1, ChunkGeometry::ndim);
        let analyzer = Analyzer::new(vars, Dtype::Auto).unwrap().with_ndim(ndim);
        let program = analyzer.analyze(&ast).unwrap();
        CompiledExpr::new(program, analyzer.variables().to_vec(), geometry, None)
    }

    #[test]
    fn test_argument_checks() {
        let e = expr("a + b", &[VariableEx::array("a", Dtype::Int32), VariableEx::array("b", Dtype::Int32)], None);
        let a = vec![1i32, 2];
        let b = vec![3i64, 4];
        let mut out = vec![0i32; 2];
        let config = RuntimeConfig::default();

        let err = e.evaluate_with(&[Input::from(&a)], &mut Output::from(&mut out), 2, &config);
        assert_eq!(err.unwrap_err(), EvalError::InputCount { expected: 2, got: 1 });

        let err = e.evaluate_with(&[Input::from(&a), Input::from(&b)], &mut Output::from(&mut out), 2, &config);
        assert_eq!(
            err.unwrap_err(),
            EvalError::InputDtype { name: "b".to_string(), expected: Dtype::Int32, got: Dtype::Int64 }
        );

        let a2 = vec![3i32, 4];
        let err = e.evaluate_with(&[Input::from(&a), Input::from(&a2)], &mut Output::from(&mut out), 3, &config);
        assert_eq!(err.unwrap_err(), EvalError::buffer_too_small("input `a`", 3, 2));

        let mut wrong = vec![0f64; 2];
        let err = e.evaluate_with(&[Input::from(&a), Input::from(&a2)], &mut Output::from(&mut wrong), 2, &config);
        assert_eq!(err.unwrap_err(), EvalError::OutputDtype { expected: Dtype::Int32, got: Dtype::Float64 });

        e.evaluate_with(&[Input::from(&a), Input::from(&a2)], &mut Output::from(&mut out), 2, &config)
            .unwrap();
        assert_eq!(out, vec![4, 6]);
    }

    #[test]
    fn test_shareable_between_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CompiledExpr>();
    }

    #[test]
    fn test_flat_only_expression_rejects_nd_calls() {
        let e = expr("x + 1", &[VariableEx::array("x", Dtype::Int64)], None);
        assert_eq!(e.valid_item_count(0, 0).unwrap_err(), EvalError::NotNd);
    }

    #[test]
    fn test_nd_padding_and_extra_slots() {
        let geometry = ChunkGeometry::new(&[5], &[4], &[2]).unwrap();
        let e = expr("x + 1", &[VariableEx::array("x", Dtype::Float64)], Some(geometry));
        let x = vec![2.0f64, 99.0];
        let mut out = vec![-1.0f64; 4];
        let stats = e
            .evaluate_nd_with(&[Input::from(&x)], &mut Output::from(&mut out), 4, 1, 0, &RuntimeConfig::default())
            .unwrap();
        assert_eq!(out, vec![3.0, 0.0, 0.0, 0.0]);
        assert_eq!(stats.items, 2);
        assert_eq!(e.valid_item_count(1, 0).unwrap(), 1);

        let err = e.evaluate_nd_with(&[Input::from(&x)], &mut Output::from(&mut out), 1, 1, 0, &RuntimeConfig::default());
        assert_eq!(err.unwrap_err(), EvalError::buffer_too_small("padded count", 2, 1));

        let err = e.evaluate_nd_with(&[Input::from(&x)], &mut Output::from(&mut out), 4, 2, 0, &RuntimeConfig::default());
        assert_eq!(err.unwrap_err(), EvalError::ChunkOutOfRange { index: 2, count: 2 });
    }

    #[test]
    fn test_nd_root_reduction_skips_padding() {
        let geometry = ChunkGeometry::new(&[5], &[4], &[2]).unwrap();
        let e = expr("sum(x)", &[VariableEx::array("x", Dtype::Int32)], Some(geometry));
        assert_eq!(e.reduction(), Some(ReductionKind::Sum));
        let x = vec![7i32, 1000];
        let mut out = vec![0i64; 1];
        e.evaluate_nd_with(&[Input::from(&x)], &mut Output::from(&mut out), 2, 1, 0, &RuntimeConfig::default())
            .unwrap();
        assert_eq!(out, vec![7]);
    }

    #[test]
    fn test_column_fast_path() {
        let e = expr("sin(x)", &[VariableEx::array("x", Dtype::Float64)], None);
        let x = vec![0.0f64, 0.5];
        let mut out = vec![0.0f64; 2];
        let config = RuntimeConfig::default().with_vectorized(true);
        let stats = e.evaluate_with(&[Input::from(&x)], &mut Output::from(&mut out), 2, &config).unwrap();
        assert_eq!(stats.engine, "column");
        assert!((out[1] - 0.5f64.sin()).abs() < 1e-15);

        let config = config.with_vectorized(false);
        let stats = e.evaluate_with(&[Input::from(&x)], &mut Output::from(&mut out), 2, &config).unwrap();
        assert_eq!(stats.engine, "interpreter");
    }
}
