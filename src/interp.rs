//! Tree-walking interpreter over the typed IR

use crate::error::{EvalError, EvalResult};
use crate::eval::{Ctx, Engine, Locals};
use crate::ir::{Body, NodeId, Op, Stmt};
use crate::ops;
use crate::reduction::Accumulator;
use crate::value::Value;

/// Control flow out of a statement
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

/// Reference engine: evaluates the IR directly, one item at a time
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Interpreter;

impl Interpreter {
    fn eval(&self, ctx: &Ctx<'_>, id: NodeId, item: usize, locals: &Locals) -> EvalResult<Value> {
        let node = ctx.program.node(id);
        let value = match &node.op {
            Op::Const(v) => *v,
            Op::Input(slot) => ctx.frame.input(*slot, item),
            Op::Index(var) => Value::Int64(ctx.frame.index(*var, item)),
            Op::Local(slot) => match locals.get(*slot).copied().flatten() {
                Some(v) => v,
                None => {
                    return Err(EvalError::Unassigned {
                        name: ctx.program.locals[*slot].name.clone(),
                    })
                }
            },
            Op::Cast(a) => self.eval(ctx, *a, item, locals)?.cast(node.dtype),
            Op::Unary(op, a) => ops::unary(*op, self.eval(ctx, *a, item, locals)?),
            Op::Binary(op, a, b) => {
                let x = self.eval(ctx, *a, item, locals)?;
                let y = self.eval(ctx, *b, item, locals)?;
                ops::binary(*op, x, y)
            }
            Op::FusedMulAdd(a, b, c) => {
                let x = self.eval(ctx, *a, item, locals)?;
                let y = self.eval(ctx, *b, item, locals)?;
                let z = self.eval(ctx, *c, item, locals)?;
                ops::fused_mul_add(x, y, z)
            }
            Op::Compare(op, a, b) => {
                let x = self.eval(ctx, *a, item, locals)?;
                let y = self.eval(ctx, *b, item, locals)?;
                Value::Bool(ops::compare(*op, x, y))
            }
            Op::Logical(op, a, b) => {
                let x = self.eval(ctx, *a, item, locals)?;
                let y = self.eval(ctx, *b, item, locals)?;
                ops::logical(*op, x, y)
            }
            Op::Select(c, a, b) => {
                let cond = self.eval(ctx, *c, item, locals)?;
                let x = self.eval(ctx, *a, item, locals)?;
                let y = self.eval(ctx, *b, item, locals)?;
                if cond.is_truthy() {
                    x
                } else {
                    y
                }
            }
            Op::Call(builtin, args) => {
                let values = self.eval_args(ctx, args, item, locals)?;
                builtin.apply(&values, &ctx.backend)
            }
            Op::UserCall(index, args) => {
                let values = self.eval_args(ctx, args, item, locals)?;
                ctx.program.functions[*index].call(&values)
            }
            Op::Str(op, a, b) => {
                Value::Bool(op.apply(ctx.frame.string(a, item), ctx.frame.string(b, item)))
            }
            Op::Reduce(index) => match ctx.hoisted(*index) {
                Some(v) => v,
                None => self.reduce(ctx, *index, locals)?,
            },
        };
        Ok(value)
    }

    fn eval_args(
        &self,
        ctx: &Ctx<'_>,
        args: &[NodeId],
        item: usize,
        locals: &Locals,
    ) -> EvalResult<Vec<Value>> {
        args.iter().map(|a| self.eval(ctx, *a, item, locals)).collect()
    }

    fn exec_block(
        &self,
        ctx: &Ctx<'_>,
        stmts: &[Stmt],
        item: usize,
        locals: &mut Locals,
    ) -> EvalResult<Flow> {
        for stmt in stmts {
            match self.exec(ctx, stmt, item, locals)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&self, ctx: &Ctx<'_>, stmt: &Stmt, item: usize, locals: &mut Locals) -> EvalResult<Flow> {
        match stmt {
            Stmt::Assign { local, value } => {
                let v = self.eval(ctx, *value, item, locals)?;
                locals[*local] = Some(v);
            }
            Stmt::If { branches, orelse } => {
                for (cond, body) in branches {
                    if self.eval(ctx, *cond, item, locals)?.is_truthy() {
                        return self.exec_block(ctx, body, item, locals);
                    }
                }
                return self.exec_block(ctx, orelse, item, locals);
            }
            Stmt::For { local, range, body } => {
                let start = self.eval(ctx, range.start, item, locals)?.as_i64();
                let stop = self.eval(ctx, range.stop, item, locals)?.as_i64();
                let step = self.eval(ctx, range.step, item, locals)?.as_i64();
                if step == 0 {
                    return Err(EvalError::ZeroStep);
                }
                let dtype = ctx.program.locals[*local].dtype;
                let mut i = start;
                while (step > 0 && i < stop) || (step < 0 && i > stop) {
                    locals[*local] = Some(Value::Int64(i).cast(dtype));
                    match self.exec_block(ctx, body, item, locals)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    match i.checked_add(step) {
                        Some(next) => i = next,
                        None => break,
                    }
                }
            }
            Stmt::While { cond, body } => {
                let mut iterations = 0u64;
                while self.eval(ctx, *cond, item, locals)?.is_truthy() {
                    iterations += 1;
                    if iterations > ctx.max_iterations {
                        return Err(EvalError::IterationLimit { limit: ctx.max_iterations });
                    }
                    match self.exec_block(ctx, body, item, locals)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            Stmt::Break => return Ok(Flow::Break),
            Stmt::Continue => return Ok(Flow::Continue),
            Stmt::Return(value) => return Ok(Flow::Return(self.eval(ctx, *value, item, locals)?)),
        }
        Ok(Flow::Normal)
    }
}

impl Engine for Interpreter {
    fn name(&self) -> &'static str {
        "interpreter"
    }

    fn reduce(&self, ctx: &Ctx<'_>, index: usize, locals: &Locals) -> EvalResult<Value> {
        let reduction = &ctx.program.reductions[index];
        let mut acc = Accumulator::new(reduction.kind, reduction.dtype);
        for item in 0..ctx.frame.items() {
            if ctx.frame.contains(item) {
                acc.push(self.eval(ctx, reduction.arg, item, locals)?);
            }
        }
        Ok(acc.finish())
    }

    fn element(&self, ctx: &Ctx<'_>, item: usize) -> EvalResult<Value> {
        match &ctx.program.body {
            Body::Expr(root) => self.eval(ctx, *root, item, &Locals::new()),
            Body::Block(stmts) => {
                let mut locals: Locals = vec![None; ctx.program.locals.len()];
                match self.exec_block(ctx, stmts, item, &mut locals)? {
                    Flow::Return(v) => Ok(v),
                    _ => Err(EvalError::MissingReturn),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analyzer;
    use crate::buffer::{Column, Input};
    use crate::config::RuntimeConfig;
    use crate::dtype::Dtype;
    use crate::eval::{self, Frame};
    use crate::parser::Parser;
    use crate::vars::VariableEx;
    use pretty_assertions::assert_eq;

    fn run(source: &str, vars: &[VariableEx], inputs: &[Input<'_>], count: usize) -> EvalResult<Column> {
        run_with(source, vars, inputs, count, &RuntimeConfig::default())
    }

    fn run_with(
        source: &str,
        vars: &[VariableEx],
        inputs: &[Input<'_>],
        count: usize,
        config: &RuntimeConfig,
    ) -> EvalResult<Column> {
        let ast = Parser::new(source).parse_program().unwrap();
        let program = Analyzer::new(vars, Dtype::Auto).unwrap().analyze(&ast).unwrap();
        let frame = Frame::flat(inputs, count);
        let mut out = Column::zeros(program.output, count.max(1)).unwrap();
        {
            let mut view = out.as_output().unwrap();
            eval::run(&Interpreter, &program, &frame, &mut view, config)?;
        }
        Ok(out)
    }

    #[test]
    fn test_range_forms() {
        let x = vec![0i64; 4];
        let vars = [VariableEx::array("x", Dtype::Int64)];
        let cases = [
            ("range(2, 6)", 14),
            ("range(1, 8, 3)", 12),
            ("range(5, -2, -2)", 8),
        ];
        for (range, expected) in cases {
            let source = format!("def k(x):\n    s = x\n    for i in {range}:\n        s += i\n    return s\n");
            let out = run(&source, &vars, &[Input::from(&x)], 4).unwrap();
            assert_eq!(out, Column::Int64(vec![expected; 4]), "{range}");
        }

        let source = "def k(x):\n    s = x\n    for i in range(0, 5, 0):\n        s += i\n    return s\n";
        assert_eq!(run(source, &vars, &[Input::from(&x)], 4).unwrap_err(), EvalError::ZeroStep);
    }

    #[test]
    fn test_return_inside_loop() {
        let source = "\
def kernel(x):
    acc = 10.0
    for i in range(4):
        if i == x:
            return acc + i
        acc += 0.5
    return -1.0
";
        let x = vec![0.0f64, 1.0, 3.0, 5.0];
        let vars = [VariableEx::array("x", Dtype::Float64)];
        let out = run(source, &vars, &[Input::from(&x)], 4).unwrap();
        assert_eq!(out, Column::Float64(vec![10.0, 11.5, 14.5, -1.0]));
    }

    #[test]
    fn test_missing_return_only_when_taken() {
        let source = "def k(x):\n    if x > 0:\n        return x\n";
        let vars = [VariableEx::array("x", Dtype::Int32)];
        let ok = vec![1i32, 2, 3];
        assert_eq!(
            run(source, &vars, &[Input::from(&ok)], 3).unwrap(),
            Column::Int32(vec![1, 2, 3])
        );
        let bad = vec![1i32, -2, 3];
        assert_eq!(
            run(source, &vars, &[Input::from(&bad)], 3).unwrap_err(),
            EvalError::MissingReturn
        );
    }

    #[test]
    fn test_branch_local_assignment() {
        let source = "def k(x):\n    if x > 0:\n        y = x * 2\n    return y\n";
        let vars = [VariableEx::array("x", Dtype::Int64)];
        let ok = vec![1i64, 5];
        assert_eq!(run(source, &vars, &[Input::from(&ok)], 2).unwrap(), Column::Int64(vec![2, 10]));
        let bad = vec![1i64, 0];
        assert_eq!(
            run(source, &vars, &[Input::from(&bad)], 2).unwrap_err(),
            EvalError::Unassigned { name: "y".to_string() }
        );
    }

    #[test]
    fn test_while_cap() {
        let source = "def k(x):\n    n = 0\n    while n < x:\n        n += 1\n    return n\n";
        let vars = [VariableEx::array("x", Dtype::Int64)];
        let x = vec![3i64, 10];
        let config = RuntimeConfig::default().with_max_while_iterations(10);
        assert_eq!(
            run_with(source, &vars, &[Input::from(&x)], 2, &config).unwrap(),
            Column::Int64(vec![3, 10])
        );
        let config = RuntimeConfig::default().with_max_while_iterations(9);
        assert_eq!(
            run_with(source, &vars, &[Input::from(&x)], 2, &config).unwrap_err(),
            EvalError::IterationLimit { limit: 9 }
        );
    }

    #[test]
    fn test_reductions_broadcast() {
        let vars = [VariableEx::array("x", Dtype::Int32)];
        let x = vec![1i32, 2, 3];
        let out = run("x + sum(x)", &vars, &[Input::from(&x)], 3).unwrap();
        assert_eq!(out, Column::Int64(vec![7, 8, 9]));

        let out = run("max(x)", &vars, &[Input::from(&x)], 3).unwrap();
        assert_eq!(out.get(0), Value::Int32(3));

        let empty: Vec<i32> = Vec::new();
        let out = run("min(x)", &vars, &[Input::from(&empty)], 0).unwrap();
        assert_eq!(out, Column::Int32(vec![i32::MAX]));
    }

    #[test]
    fn test_reduction_reading_loop_local() {
        // The reduction sees the loop counter of the element being evaluated
        let source = "\
def k(x):
    n = 0
    for i in range(4):
        if any(x > i):
            n += 1
    return n
";
        let vars = [VariableEx::array("x", Dtype::Int64)];
        let x = vec![0i64, 2];
        let out = run(source, &vars, &[Input::from(&x)], 2).unwrap();
        assert_eq!(out, Column::Int64(vec![2, 2]));
    }

    #[test]
    fn test_index_variables() {
        let vars = [VariableEx::array("x", Dtype::Int64)];
        let x = vec![5i64, 5, 5];
        let out = run("x * _i0 + _n0", &vars, &[Input::from(&x)], 3).unwrap();
        assert_eq!(out, Column::Int64(vec![3, 8, 13]));
    }
}
