//! Type checker and lowering from the syntax tree to the annotated IR
//!
//! Resolves names, assigns every node a dtype, makes casts explicit and checks
//! the scope, reduction and return rules. Local dtypes are found by re-running
//! the lowering until no assignment widens a local any further.

use std::collections::HashMap;
use std::f64::consts::{E, PI};

use num_complex::Complex;
use tracing::debug;

use crate::arena::Arena;
use crate::ast::{Ast, Block, Expr, ExprId, Form, FpMode, Stmt, StmtId};
use crate::builtins::{self, Builtin};
use crate::dtype::{min_int_dtype, min_signed_dtype, promote, Dtype, Kind};
use crate::error::{CompileError, CompileResult, Pos};
use crate::ir::{self, Body, IndexVar, InputSlot, Node, NodeId, Op, Program, Reduction, StrOp, StrOperand};
use crate::ops::{self, BinaryOp, CompareOp, UnaryOp};
use crate::reduction::ReductionKind;
use crate::value::Value;
use crate::vars::{self, UserFunction, VarKind, VariableEx};

/// Upper bound on lowering passes while local dtypes settle
const MAX_INFERENCE_PASSES: usize = 32;

/// Kind of a value derived only from literals
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Weak {
    Int,
    Float,
    Complex,
}

impl Weak {
    fn materialize(self) -> Dtype {
        match self {
            Weak::Int => Dtype::Int64,
            Weak::Float => Dtype::Float64,
            Weak::Complex => Dtype::Complex128,
        }
    }

    fn of(dtype: Dtype) -> Weak {
        match dtype.kind() {
            Kind::Float => Weak::Float,
            Kind::Complex => Weak::Complex,
            _ => Weak::Int,
        }
    }
}

/// Dtype of a strong operand combined with a weak one
fn adopt(strong: Dtype, weak: Weak, literal: Option<i64>) -> Dtype {
    match weak {
        Weak::Int => match strong.kind() {
            Kind::Bool => Dtype::Int64,
            Kind::Signed => match literal {
                Some(v) if !strong.holds_int(v) => {
                    promote(strong, min_signed_dtype(v)).unwrap_or(Dtype::Int64)
                }
                _ => strong,
            },
            Kind::Unsigned => match literal {
                Some(v) if !strong.holds_int(v) => {
                    promote(strong, min_int_dtype(v)).unwrap_or(Dtype::Int64)
                }
                _ => strong,
            },
            _ => strong,
        },
        Weak::Float => match strong.kind() {
            Kind::Float | Kind::Complex => strong,
            _ => Dtype::Float64,
        },
        Weak::Complex => match strong {
            Dtype::Float32 | Dtype::Complex64 => Dtype::Complex64,
            _ => Dtype::Complex128,
        },
    }
}

/// A lowered expression and what the checker knows about it
#[derive(Debug, Clone, Copy)]
struct Typed {
    id: NodeId,
    dtype: Dtype,
    weak: Option<Weak>,
    /// Folded value of a weak integer
    literal: Option<i64>,
    /// Reads a local
    locals: bool,
    /// Contains a reduction, directly or through a local
    reduces: bool,
}

#[derive(Debug, Clone)]
enum Binding {
    Input(usize),
    Function(usize),
}

#[derive(Debug, Clone, PartialEq)]
struct LocalState {
    name: String,
    strong: Option<Dtype>,
    weak: Option<Weak>,
    tainted: bool,
}

impl LocalState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            strong: None,
            weak: None,
            tainted: false,
        }
    }

    fn dtype(&self) -> Dtype {
        match (self.strong, self.weak) {
            (Some(strong), Some(weak)) => adopt(strong, weak, None),
            (Some(strong), None) => strong,
            (None, Some(weak)) => weak.materialize(),
            (None, None) => Dtype::Int64,
        }
    }

    /// Weak kind seen by readers: only locals never assigned a strong value stay weak
    fn read_weak(&self) -> Option<Weak> {
        match self.strong {
            Some(_) => None,
            None => Some(self.weak.unwrap_or(Weak::Int)),
        }
    }
}

/// Type checker for one set of declarations
pub struct Analyzer {
    variables: Vec<VariableEx>,
    bindings: HashMap<String, Binding>,
    inputs: Vec<InputSlot>,
    functions: Vec<UserFunction>,
    output: Dtype,
    ndim: usize,
}

impl Analyzer {
    /// Validate declarations and resolve `Auto` variable dtypes against `output`
    pub fn new(variables: &[VariableEx], output: Dtype) -> CompileResult<Self> {
        vars::validate(variables)?;
        if output == Dtype::String {
            return Err(CompileError::type_error(
                Pos::default(),
                "string outputs are not supported",
            ));
        }

        let mut resolved = variables.to_vec();
        for var in resolved.iter_mut() {
            if matches!(var.kind, VarKind::Array) && var.dtype == Dtype::Auto {
                if output == Dtype::Auto {
                    return Err(CompileError::invalid_arg(format!(
                        "variable `{}` and the output are both auto; declare one of them",
                        var.name
                    )));
                }
                var.dtype = output;
            }
        }

        let mut bindings = HashMap::new();
        let mut inputs = Vec::new();
        let mut functions = Vec::new();
        for var in &resolved {
            match &var.kind {
                VarKind::Function(func) => {
                    bindings.insert(var.name.clone(), Binding::Function(functions.len()));
                    functions.push(func.clone());
                }
                VarKind::Array | VarKind::String { .. } => {
                    let itemsize = match var.kind {
                        VarKind::String { itemsize } => itemsize,
                        _ => var.dtype.itemsize(),
                    };
                    bindings.insert(var.name.clone(), Binding::Input(inputs.len()));
                    inputs.push(InputSlot {
                        name: var.name.clone(),
                        dtype: var.dtype,
                        itemsize,
                    });
                }
            }
        }

        Ok(Self {
            variables: resolved,
            bindings,
            inputs,
            functions,
            output,
            ndim: 1,
        })
    }

    /// Rank seen by `_i{d}` / `_n{d}`
    pub fn with_ndim(mut self, ndim: usize) -> Self {
        self.ndim = ndim.max(1);
        self
    }

    /// Declarations with `Auto` dtypes resolved
    pub fn variables(&self) -> &[VariableEx] {
        &self.variables
    }

    /// Check a parsed program and lower it to the annotated IR
    pub fn analyze(&self, ast: &Ast) -> CompileResult<Program> {
        self.check_params(ast)?;
        let (names, slots) = self.collect_locals(ast)?;

        let mut states: Vec<LocalState> = names.iter().map(|n| LocalState::new(n)).collect();
        for pass_no in 0..MAX_INFERENCE_PASSES {
            let mut pass = Pass::new(self, ast, &slots, states.clone());
            let lowered = pass.lower();
            let stable = pass.locals == states;
            match lowered {
                Ok((body, output)) if stable => {
                    debug!(passes = pass_no + 1, locals = names.len(), %output, "analysis converged");
                    return Ok(pass.into_program(body, output));
                }
                Err(err) if stable => return Err(err),
                _ => states = pass.locals,
            }
        }
        Err(CompileError::type_error(
            Pos::default(),
            "local dtypes did not settle",
        ))
    }

    fn check_params(&self, ast: &Ast) -> CompileResult<()> {
        let Form::Kernel { name, params, .. } = &ast.form else {
            return Ok(());
        };
        for param in params {
            match self.bindings.get(&param.name) {
                Some(Binding::Input(_)) => {}
                Some(Binding::Function(_)) => {
                    return Err(CompileError::type_error(
                        param.pos,
                        format!("parameter `{}` names a user function", param.name),
                    ))
                }
                None => {
                    return Err(CompileError::type_error(
                        param.pos,
                        format!("parameter `{}` is not a declared variable", param.name),
                    ))
                }
            }
        }
        for input in &self.inputs {
            if !params.iter().any(|p| p.name == input.name) {
                return Err(CompileError::invalid_arg(format!(
                    "variable `{}` is not a parameter of kernel `{}`",
                    input.name, name
                )));
            }
        }
        Ok(())
    }

    /// Every assigned name becomes a local slot, in order of first assignment
    fn collect_locals(&self, ast: &Ast) -> CompileResult<(Vec<String>, HashMap<String, usize>)> {
        let mut names = Vec::new();
        let mut slots = HashMap::new();
        let block = match &ast.form {
            Form::Expression(_) => return Ok((names, slots)),
            Form::Statements(block) => block,
            Form::Kernel { body, .. } => body,
        };

        let mut stack: Vec<StmtId> = block.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            let node = ast.stmt(id);
            let target = match &node.stmt {
                Stmt::Assign { target, .. } => Some(target),
                Stmt::For { var, .. } => Some(var),
                _ => None,
            };
            if let Some(target) = target {
                if self.bindings.contains_key(target) {
                    return Err(CompileError::type_error(
                        node.pos,
                        format!("cannot assign to declared variable `{}`", target),
                    ));
                }
                if target != "result" && vars::is_reserved(target) {
                    return Err(CompileError::type_error(
                        node.pos,
                        format!("`{}` is reserved and cannot be assigned", target),
                    ));
                }
                if !slots.contains_key(target) {
                    slots.insert(target.clone(), names.len());
                    names.push(target.clone());
                }
            }
            let children: Vec<&Block> = match &node.stmt {
                Stmt::If { branches, orelse } => {
                    branches.iter().map(|(_, b)| b).chain(orelse.iter()).collect()
                }
                Stmt::For { body, .. } | Stmt::While { body, .. } => vec![body],
                _ => Vec::new(),
            };
            for block in children.into_iter().rev() {
                stack.extend(block.iter().rev().copied());
            }
        }
        Ok((names, slots))
    }
}

/// One lowering pass over the program
struct Pass<'a> {
    analyzer: &'a Analyzer,
    ast: &'a Ast,
    slots: &'a HashMap<String, usize>,
    locals: Vec<LocalState>,
    nodes: Arena<Node>,
    reductions: Vec<Reduction>,
    returns: Vec<(Typed, Pos)>,
    root_reduction: Option<usize>,
    in_reduction: bool,
    fp: FpMode,
}

impl<'a> Pass<'a> {
    fn new(
        analyzer: &'a Analyzer,
        ast: &'a Ast,
        slots: &'a HashMap<String, usize>,
        locals: Vec<LocalState>,
    ) -> Self {
        Self {
            analyzer,
            ast,
            slots,
            locals,
            nodes: Arena::new(),
            reductions: Vec::new(),
            returns: Vec::new(),
            root_reduction: None,
            in_reduction: false,
            fp: ast.pragmas.fp,
        }
    }

    /// Lower the whole program, returning the body and the output dtype
    fn lower(&mut self) -> CompileResult<(Body, Dtype)> {
        let ast = self.ast;
        match &ast.form {
            Form::Expression(root) => {
                let t = self.expr(*root)?;
                if let Op::Reduce(index) = self.nodes[t.id].op {
                    self.root_reduction = Some(index);
                }
                let output = self.resolve_output(t.dtype);
                let root = self.cast(t, output);
                Ok((Body::Expr(root.id), output))
            }
            Form::Statements(block) => {
                let mut stmts = Vec::new();
                let (last, init) = match block.split_last() {
                    Some(split) => split,
                    None => return Err(CompileError::syntax(Pos::default(), "empty program")),
                };
                for id in init {
                    stmts.extend(self.stmt(*id)?);
                }
                let last_node = ast.stmt(*last);
                match &last_node.stmt {
                    Stmt::Expr(e) => {
                        let t = self.expr(*e)?;
                        self.returns.push((t, last_node.pos));
                        stmts.push(ir::Stmt::Return(t.id));
                    }
                    _ => {
                        stmts.extend(self.stmt(*last)?);
                        let Some(&slot) = self.slots.get("result") else {
                            return Err(CompileError::syntax(
                                last_node.pos,
                                "statements must end with an expression or assign `result`",
                            ));
                        };
                        let t = self.local(slot);
                        self.returns.push((t, last_node.pos));
                        stmts.push(ir::Stmt::Return(t.id));
                    }
                }
                let output = self.returns_output()?;
                self.cast_returns(&mut stmts, output);
                Ok((Body::Block(stmts), output))
            }
            Form::Kernel { body, .. } => {
                let mut stmts = self.block(body)?;
                let output = self.returns_output()?;
                self.cast_returns(&mut stmts, output);
                Ok((Body::Block(stmts), output))
            }
        }
    }

    fn into_program(self, body: Body, output: Dtype) -> Program {
        let name = match &self.ast.form {
            Form::Kernel { name, .. } => name.clone(),
            _ => "expr".to_string(),
        };
        let locals = self
            .locals
            .iter()
            .map(|state| ir::Local {
                name: state.name.clone(),
                dtype: state.dtype(),
            })
            .collect();
        Program {
            name,
            nodes: self.nodes,
            body,
            locals,
            reductions: self.reductions,
            inputs: self.analyzer.inputs.clone(),
            functions: self.analyzer.functions.clone(),
            output,
            root_reduction: self.root_reduction,
            pragmas: self.ast.pragmas.clone(),
        }
    }

    fn resolve_output(&self, result: Dtype) -> Dtype {
        match self.analyzer.output {
            Dtype::Auto => result,
            explicit => explicit,
        }
    }

    /// Output dtype from the collected returns
    fn returns_output(&mut self) -> CompileResult<Dtype> {
        let mut result: Option<Typed> = None;
        for (t, pos) in &self.returns {
            result = Some(match result {
                None => *t,
                Some(acc) => {
                    if acc.dtype.is_bool() != t.dtype.is_bool() {
                        return Err(CompileError::type_error(
                            *pos,
                            format!(
                                "return value of dtype {} does not match earlier returns of dtype {}",
                                t.dtype, acc.dtype
                            ),
                        ));
                    }
                    let (dtype, weak) = self.promote_pair(&acc, t, *pos)?;
                    Typed { dtype, weak, literal: None, ..acc }
                }
            });
        }
        match (result, self.analyzer.output) {
            (_, Dtype::Auto) if self.returns.is_empty() => Err(CompileError::invalid_arg(
                "cannot infer the output dtype of a kernel without return statements",
            )),
            (Some(t), Dtype::Auto) => Ok(t.dtype),
            (_, explicit) => Ok(explicit),
        }
    }

    fn cast_returns(&mut self, stmts: &mut [ir::Stmt], output: Dtype) {
        for stmt in stmts.iter_mut() {
            match stmt {
                ir::Stmt::Return(id) => *id = self.cast_node(*id, output),
                ir::Stmt::If { branches, orelse } => {
                    for (_, body) in branches.iter_mut() {
                        self.cast_returns(body, output);
                    }
                    self.cast_returns(orelse, output);
                }
                ir::Stmt::For { body, .. } | ir::Stmt::While { body, .. } => {
                    self.cast_returns(body, output)
                }
                _ => {}
            }
        }
    }

    fn block(&mut self, block: &Block) -> CompileResult<Vec<ir::Stmt>> {
        let mut out = Vec::with_capacity(block.len());
        for id in block {
            out.extend(self.stmt(*id)?);
        }
        Ok(out)
    }

    fn stmt(&mut self, id: StmtId) -> CompileResult<Option<ir::Stmt>> {
        let ast = self.ast;
        let node = ast.stmt(id);
        let pos = node.pos;
        match &node.stmt {
            Stmt::Assign { target, value } => {
                let t = self.expr(*value)?;
                let slot = self.slot(target, pos)?;
                self.record(slot, &t, pos)?;
                let dtype = self.locals[slot].dtype();
                let value = self.cast(t, dtype);
                Ok(Some(ir::Stmt::Assign { local: slot, value: value.id }))
            }
            Stmt::Expr(e) => {
                self.expr(*e)?;
                Ok(None)
            }
            Stmt::Print(args) => {
                for arg in args {
                    if self.string_operand(*arg).is_none() {
                        self.expr(*arg)?;
                    }
                }
                Ok(None)
            }
            Stmt::If { branches, orelse } => {
                let mut lowered = Vec::with_capacity(branches.len());
                for (cond, body) in branches {
                    let cond = self.condition(*cond)?;
                    lowered.push((cond, self.block(body)?));
                }
                let orelse = match orelse {
                    Some(body) => self.block(body)?,
                    None => Vec::new(),
                };
                Ok(Some(ir::Stmt::If { branches: lowered, orelse }))
            }
            Stmt::For { var, args, body } => {
                let mut bounds = Vec::with_capacity(args.len());
                for arg in args {
                    let t = self.expr(*arg)?;
                    if !t.dtype.is_integral() {
                        return Err(CompileError::type_error(
                            ast.expr(*arg).pos,
                            format!("range() arguments must be integers, got {}", t.dtype),
                        ));
                    }
                    bounds.push(self.cast(t, Dtype::Int64).id);
                }
                let zero = self.constant(Value::Int64(0));
                let one = self.constant(Value::Int64(1));
                let range = match bounds.as_slice() {
                    [stop] => ir::Range { start: zero, stop: *stop, step: one },
                    [start, stop] => ir::Range { start: *start, stop: *stop, step: one },
                    [start, stop, step, ..] => ir::Range { start: *start, stop: *stop, step: *step },
                    [] => {
                        return Err(CompileError::syntax(pos, "range() needs at least one argument"))
                    }
                };

                let slot = self.slot(var, pos)?;
                let counter = Typed {
                    id: zero,
                    dtype: Dtype::Int64,
                    weak: None,
                    literal: None,
                    locals: false,
                    reduces: false,
                };
                self.record(slot, &counter, pos)?;
                let body = self.block(body)?;
                Ok(Some(ir::Stmt::For { local: slot, range, body }))
            }
            Stmt::While { cond, body } => {
                let cond = self.condition(*cond)?;
                let body = self.block(body)?;
                Ok(Some(ir::Stmt::While { cond, body }))
            }
            Stmt::Break => Ok(Some(ir::Stmt::Break)),
            Stmt::Continue => Ok(Some(ir::Stmt::Continue)),
            Stmt::Return(e) => {
                let t = self.expr(*e)?;
                self.returns.push((t, pos));
                Ok(Some(ir::Stmt::Return(t.id)))
            }
        }
    }

    fn slot(&self, name: &str, pos: Pos) -> CompileResult<usize> {
        self.slots
            .get(name)
            .copied()
            .ok_or_else(|| CompileError::undefined(pos, name))
    }

    /// Widen a local with an assigned value
    fn record(&mut self, slot: usize, t: &Typed, pos: Pos) -> CompileResult<()> {
        let state = &mut self.locals[slot];
        state.tainted |= t.reduces;
        match t.weak {
            Some(weak) => state.weak = state.weak.max(Some(weak)),
            None => {
                let joined = match state.strong {
                    None => Some(t.dtype),
                    Some(current) => promote(current, t.dtype),
                };
                match joined {
                    Some(dtype) => state.strong = Some(dtype),
                    None => {
                        return Err(CompileError::type_error(
                            pos,
                            format!("cannot assign a {} value to local `{}`", t.dtype, state.name),
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    fn condition(&mut self, id: ExprId) -> CompileResult<NodeId> {
        let t = self.expr(id)?;
        Ok(self.cast(t, Dtype::Bool).id)
    }

    fn push(&mut self, op: Op, dtype: Dtype) -> NodeId {
        let folded = match &op {
            Op::Cast(a) => self.const_of(*a).map(|v| v.cast(dtype)),
            Op::Unary(u, a) => self.const_of(*a).map(|v| ops::unary(*u, v)),
            Op::Binary(b, x, y) => match (self.const_of(*x), self.const_of(*y)) {
                (Some(x), Some(y)) => Some(ops::binary(*b, x, y)),
                _ => None,
            },
            Op::Compare(c, x, y) => match (self.const_of(*x), self.const_of(*y)) {
                (Some(x), Some(y)) => Some(Value::Bool(ops::compare(*c, x, y))),
                _ => None,
            },
            Op::Logical(l, x, y) => match (self.const_of(*x), self.const_of(*y)) {
                (Some(x), Some(y)) => Some(ops::logical(*l, x, y)),
                _ => None,
            },
            _ => None,
        };
        let op = match folded {
            Some(value) => Op::Const(value.cast(dtype)),
            None => op,
        };
        self.nodes.append(Node { op, dtype })
    }

    fn const_of(&self, id: NodeId) -> Option<Value> {
        match self.nodes[id].op {
            Op::Const(v) => Some(v),
            _ => None,
        }
    }

    fn constant(&mut self, value: Value) -> NodeId {
        self.push(Op::Const(value), value.dtype())
    }

    fn typed(&self, id: NodeId, weak: Option<Weak>) -> Typed {
        let dtype = self.nodes[id].dtype;
        let literal = match (weak, self.const_of(id)) {
            (Some(Weak::Int), Some(v)) => Some(v.as_i64()),
            _ => None,
        };
        Typed {
            id,
            dtype,
            weak,
            literal,
            locals: false,
            reduces: false,
        }
    }

    fn cast_node(&mut self, id: NodeId, to: Dtype) -> NodeId {
        if self.nodes[id].dtype == to {
            id
        } else {
            self.push(Op::Cast(id), to)
        }
    }

    fn cast(&mut self, t: Typed, to: Dtype) -> Typed {
        let id = self.cast_node(t.id, to);
        Typed { id, dtype: to, ..t }
    }

    /// Promoted dtype of two operands and whether the result stays weak
    fn promote_pair(&self, a: &Typed, b: &Typed, pos: Pos) -> CompileResult<(Dtype, Option<Weak>)> {
        let promoted = match (a.weak, b.weak) {
            (None, None) => promote(a.dtype, b.dtype),
            (Some(w), None) => Some(adopt(b.dtype, w, a.literal)),
            (None, Some(w)) => Some(adopt(a.dtype, w, b.literal)),
            (Some(x), Some(y)) => return Ok((x.max(y).materialize(), Some(x.max(y)))),
        };
        promoted.map(|d| (d, None)).ok_or_else(|| {
            CompileError::type_error(
                pos,
                format!("cannot combine {} and {} operands", a.dtype, b.dtype),
            )
        })
    }

    /// Read of a local slot
    fn local(&mut self, slot: usize) -> Typed {
        let state = &self.locals[slot];
        let (dtype, weak, tainted) = (state.dtype(), state.read_weak(), state.tainted);
        let id = self.push(Op::Local(slot), dtype);
        Typed {
            id,
            dtype,
            weak,
            literal: None,
            locals: true,
            reduces: tainted,
        }
    }

    fn expr(&mut self, id: ExprId) -> CompileResult<Typed> {
        let ast = self.ast;
        let node = ast.expr(id);
        let pos = node.pos;
        match &node.expr {
            Expr::Int(v) => {
                let id = self.constant(Value::Int64(*v));
                Ok(self.typed(id, Some(Weak::Int)))
            }
            Expr::Float(v) => {
                let id = self.constant(Value::Float64(*v));
                Ok(self.typed(id, Some(Weak::Float)))
            }
            Expr::Imag(v) => {
                let id = self.constant(Value::Complex128(Complex::new(0.0, *v)));
                Ok(self.typed(id, Some(Weak::Complex)))
            }
            Expr::Bool(v) => {
                let id = self.constant(Value::Bool(*v));
                Ok(self.typed(id, None))
            }
            Expr::Str(_) => Err(CompileError::type_error(
                pos,
                "string literals are only allowed in string comparisons",
            )),
            Expr::Name(name) => self.name(name, pos),
            Expr::Unary { op, operand } => {
                let t = self.expr(*operand)?;
                let (operand_dtype, result) = op.signature(t.dtype).ok_or_else(|| {
                    CompileError::type_error(
                        pos,
                        format!("unary `{}` is not defined for {}", op.symbol(), t.dtype),
                    )
                })?;
                let arg = self.cast(t, operand_dtype);
                let id = self.push(Op::Unary(*op, arg.id), result);
                let weak = match op {
                    UnaryOp::Not => None,
                    _ => t.weak,
                };
                Ok(Typed { locals: t.locals, reduces: t.reduces, ..self.typed(id, weak) })
            }
            Expr::Binary { op, lhs, rhs } => {
                let a = self.expr(*lhs)?;
                let b = self.expr(*rhs)?;
                self.binary(*op, a, b, pos)
            }
            Expr::Compare { op, lhs, rhs } => self.compare(*op, *lhs, *rhs, pos),
            Expr::Logical { op, lhs, rhs } => {
                let a = self.expr(*lhs)?;
                let b = self.expr(*rhs)?;
                let a_bool = self.cast(a, Dtype::Bool);
                let b_bool = self.cast(b, Dtype::Bool);
                let id = self.push(Op::Logical(*op, a_bool.id, b_bool.id), Dtype::Bool);
                Ok(Typed {
                    locals: a.locals || b.locals,
                    reduces: a.reduces || b.reduces,
                    ..self.typed(id, None)
                })
            }
            Expr::Call { name, args } => self.call(name, args, pos),
        }
    }

    fn name(&mut self, name: &str, pos: Pos) -> CompileResult<Typed> {
        if let Some(&slot) = self.slots.get(name) {
            return Ok(self.local(slot));
        }
        let analyzer = self.analyzer;
        match analyzer.bindings.get(name) {
            Some(Binding::Input(slot)) => {
                let dtype = analyzer.inputs[*slot].dtype;
                if dtype == Dtype::String {
                    return Err(CompileError::type_error(
                        pos,
                        format!("string variable `{}` can only be used in string comparisons", name),
                    ));
                }
                let id = self.push(Op::Input(*slot), dtype);
                return Ok(self.typed(id, None));
            }
            Some(Binding::Function(_)) => {
                return Err(CompileError::type_error(
                    pos,
                    format!("`{}` is a function and must be called", name),
                ))
            }
            None => {}
        }

        let index = match name {
            "pi" | "e" => {
                let value = if name == "pi" { PI } else { E };
                let id = self.constant(Value::Float64(value));
                return Ok(self.typed(id, Some(Weak::Float)));
            }
            "_ndim" => Some(IndexVar::Ndim),
            _ => index_var(name),
        };
        match index {
            Some(IndexVar::Coord(d) | IndexVar::Extent(d)) if d >= self.analyzer.ndim => {
                Err(CompileError::undefined(pos, name))
            }
            Some(var) => {
                let id = self.push(Op::Index(var), Dtype::Int64);
                Ok(self.typed(id, None))
            }
            None => Err(CompileError::undefined(pos, name)),
        }
    }

    fn binary(&mut self, op: BinaryOp, a: Typed, b: Typed, pos: Pos) -> CompileResult<Typed> {
        let (promoted, weak) = self.promote_pair(&a, &b, pos)?;
        let (operand, result) = op.signature(promoted).ok_or_else(|| {
            let message = if op.is_bitwise() {
                format!("operator `{}` requires integer or bool operands, got {}", op.symbol(), promoted)
            } else {
                format!("operator `{}` is not defined for {}", op.symbol(), promoted)
            };
            CompileError::type_error(pos, message)
        })?;
        let x = self.cast(a, operand);
        let y = self.cast(b, operand);

        let fused = match op {
            BinaryOp::Add | BinaryOp::Sub
                if self.fp.allows_contraction() && result.is_float() =>
            {
                self.contract(op, x.id, y.id, result)
            }
            _ => None,
        };
        let id = match fused {
            Some(id) => id,
            None => self.push(Op::Binary(op, x.id, y.id), result),
        };
        let weak = weak.map(|_| Weak::of(result));
        Ok(Typed {
            locals: a.locals || b.locals,
            reduces: a.reduces || b.reduces,
            ..self.typed(id, weak)
        })
    }

    /// Fuse `x*y + z`, `x*y - z` and `z - x*y` into one multiply-add
    fn contract(&mut self, op: BinaryOp, lhs: NodeId, rhs: NodeId, dtype: Dtype) -> Option<NodeId> {
        if self.const_of(lhs).is_some() && self.const_of(rhs).is_some() {
            return None;
        }
        let product = |nodes: &Arena<Node>, id: NodeId| match nodes[id].op {
            Op::Binary(BinaryOp::Mul, x, y) if nodes[id].dtype == dtype => Some((x, y)),
            _ => None,
        };
        if let Some((x, y)) = product(&self.nodes, lhs) {
            let addend = match op {
                BinaryOp::Sub => self.push(Op::Unary(UnaryOp::Neg, rhs), dtype),
                _ => rhs,
            };
            debug!("contracting multiply-add");
            return Some(self.push(Op::FusedMulAdd(x, y, addend), dtype));
        }
        if let Some((x, y)) = product(&self.nodes, rhs) {
            let factor = match op {
                BinaryOp::Sub => self.push(Op::Unary(UnaryOp::Neg, x), dtype),
                _ => x,
            };
            debug!("contracting multiply-add");
            return Some(self.push(Op::FusedMulAdd(factor, y, lhs), dtype));
        }
        None
    }

    /// String operand: a literal or a string variable
    fn string_operand(&self, id: ExprId) -> Option<StrOperand> {
        match &self.ast.expr(id).expr {
            Expr::Str(s) => Some(StrOperand::Literal(s.chars().map(|c| c as u32).collect())),
            Expr::Name(name) if !self.slots.contains_key(name) => {
                match self.analyzer.bindings.get(name) {
                    Some(Binding::Input(slot))
                        if self.analyzer.inputs[*slot].dtype == Dtype::String =>
                    {
                        Some(StrOperand::Input(*slot))
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn is_stringy(&self, id: ExprId) -> bool {
        match &self.ast.expr(id).expr {
            Expr::Str(_) => true,
            _ => self.string_operand(id).is_some(),
        }
    }

    fn compare(&mut self, op: CompareOp, lhs: ExprId, rhs: ExprId, pos: Pos) -> CompileResult<Typed> {
        if self.is_stringy(lhs) || self.is_stringy(rhs) {
            let (Some(a), Some(b)) = (self.string_operand(lhs), self.string_operand(rhs)) else {
                return Err(CompileError::type_error(
                    pos,
                    "strings can only be compared with other strings",
                ));
            };
            let str_op = match op {
                CompareOp::Eq => StrOp::Eq,
                CompareOp::Ne => StrOp::Ne,
                _ => {
                    return Err(CompileError::type_error(
                        pos,
                        format!("operator `{}` is not defined for strings", op.symbol()),
                    ))
                }
            };
            let id = self.push(Op::Str(str_op, a, b), Dtype::Bool);
            return Ok(self.typed(id, None));
        }

        let a = self.expr(lhs)?;
        let b = self.expr(rhs)?;
        let (promoted, _) = self.promote_pair(&a, &b, pos)?;
        if promoted.is_complex() && !op.is_equality() {
            return Err(CompileError::type_error(
                pos,
                format!("operator `{}` is not defined for complex values", op.symbol()),
            ));
        }
        let x = self.cast(a, promoted);
        let y = self.cast(b, promoted);
        let id = self.push(Op::Compare(op, x.id, y.id), Dtype::Bool);
        Ok(Typed {
            locals: a.locals || b.locals,
            reduces: a.reduces || b.reduces,
            ..self.typed(id, None)
        })
    }

    fn call(&mut self, name: &str, args: &[ExprId], pos: Pos) -> CompileResult<Typed> {
        let expect_args = |n: usize| -> CompileResult<()> {
            if args.len() == n {
                Ok(())
            } else {
                Err(CompileError::type_error(
                    pos,
                    format!("`{}` takes {} argument(s), got {}", name, n, args.len()),
                ))
            }
        };

        if let Some(kind) = ReductionKind::from_name(name) {
            expect_args(1)?;
            return self.reduction(kind, args[0], pos);
        }

        match name {
            "where" => {
                expect_args(3)?;
                let cond = self.expr(args[0])?;
                let a = self.expr(args[1])?;
                let b = self.expr(args[2])?;
                let (promoted, weak) = self.promote_pair(&a, &b, pos)?;
                let c = self.cast(cond, Dtype::Bool);
                let x = self.cast(a, promoted);
                let y = self.cast(b, promoted);
                let id = self.push(Op::Select(c.id, x.id, y.id), promoted);
                return Ok(Typed {
                    locals: cond.locals || a.locals || b.locals,
                    reduces: cond.reduces || a.reduces || b.reduces,
                    ..self.typed(id, weak)
                });
            }
            "pow" => {
                expect_args(2)?;
                let a = self.expr(args[0])?;
                let b = self.expr(args[1])?;
                return self.binary(BinaryOp::Pow, a, b, pos);
            }
            "startswith" | "endswith" | "contains" => {
                expect_args(2)?;
                let (Some(a), Some(b)) = (self.string_operand(args[0]), self.string_operand(args[1]))
                else {
                    return Err(CompileError::type_error(
                        pos,
                        format!("`{}` takes two string operands", name),
                    ));
                };
                let op = match name {
                    "startswith" => StrOp::StartsWith,
                    "endswith" => StrOp::EndsWith,
                    _ => StrOp::Contains,
                };
                let id = self.push(Op::Str(op, a, b), Dtype::Bool);
                return Ok(self.typed(id, None));
            }
            _ => {}
        }

        if let Some(target) = builtins::cast_target(name) {
            expect_args(1)?;
            let t = self.expr(args[0])?;
            let cast = self.cast(t, target);
            return Ok(Typed { weak: None, literal: None, ..cast });
        }

        if let Some(builtin) = Builtin::lookup(name) {
            expect_args(builtin.arity())?;
            let mut typed = Vec::with_capacity(args.len());
            for arg in args {
                typed.push(self.expr(*arg)?);
            }
            let mut acc = typed[0];
            for t in &typed[1..] {
                let (dtype, weak) = self.promote_pair(&acc, t, pos)?;
                acc = Typed { dtype, weak, literal: None, ..acc };
            }
            let (operand, result) = builtin.signature(acc.dtype).ok_or_else(|| {
                CompileError::type_error(pos, format!("`{}` is not defined for {}", name, acc.dtype))
            })?;
            let ids: Vec<NodeId> = typed.iter().map(|t| self.cast(*t, operand).id).collect();
            let id = self.push(Op::Call(builtin, ids), result);
            let weak = acc.weak.map(|_| Weak::of(result));
            return Ok(Typed {
                locals: typed.iter().any(|t| t.locals),
                reduces: typed.iter().any(|t| t.reduces),
                ..self.typed(id, weak)
            });
        }

        let analyzer = self.analyzer;
        if let Some(Binding::Function(index)) = analyzer.bindings.get(name) {
            let func = &analyzer.functions[*index];
            let params = func.params().to_vec();
            let ret = func.ret();
            expect_args(params.len())?;
            let mut ids = Vec::with_capacity(args.len());
            let (mut locals, mut reduces) = (false, false);
            for (arg, param) in args.iter().zip(params) {
                let t = self.expr(*arg)?;
                locals |= t.locals;
                reduces |= t.reduces;
                ids.push(self.cast(t, param).id);
            }
            let id = self.push(Op::UserCall(*index, ids), ret);
            return Ok(Typed { locals, reduces, ..self.typed(id, None) });
        }

        Err(CompileError::undefined(pos, name))
    }

    fn reduction(&mut self, kind: ReductionKind, arg: ExprId, pos: Pos) -> CompileResult<Typed> {
        if self.in_reduction {
            return Err(CompileError::reduction(
                pos,
                format!("`{}` cannot be nested inside another reduction", kind),
            ));
        }
        self.in_reduction = true;
        let t = self.expr(arg);
        self.in_reduction = false;
        let t = t?;
        if t.reduces {
            return Err(CompileError::reduction(
                self.ast.expr(arg).pos,
                format!("argument of `{}` reads a local that holds a reduction", kind),
            ));
        }
        let dtype = kind.result_dtype(t.dtype).ok_or_else(|| {
            CompileError::type_error(pos, format!("`{}` is not defined for {}", kind, t.dtype))
        })?;
        let index = self.reductions.len();
        self.reductions.push(Reduction {
            kind,
            arg: t.id,
            dtype,
            hoisted: !t.locals,
        });
        let id = self.push(Op::Reduce(index), dtype);
        Ok(Typed { reduces: true, ..self.typed(id, None) })
    }
}

/// Parse `_i{d}` / `_n{d}`
fn index_var(name: &str) -> Option<IndexVar> {
    let (make, digits): (fn(usize) -> IndexVar, &str) = if let Some(d) = name.strip_prefix("_i") {
        (IndexVar::Coord, d)
    } else if let Some(d) = name.strip_prefix("_n") {
        (IndexVar::Extent, d)
    } else {
        return None;
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(make)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileErrorKind;
    use crate::parser::Parser;
    use pretty_assertions::assert_eq;

    fn analyze(source: &str, vars: &[VariableEx], output: Dtype) -> CompileResult<Program> {
        let ast = Parser::new(source).parse_program()?;
        Analyzer::new(vars, output)?.analyze(&ast)
    }

    fn root_dtype(source: &str, vars: &[VariableEx]) -> Dtype {
        analyze(source, vars, Dtype::Auto).unwrap().output
    }

    fn arrays(decls: &[(&str, Dtype)]) -> Vec<VariableEx> {
        decls.iter().map(|(n, d)| VariableEx::array(*n, *d)).collect()
    }

    #[test]
    fn test_weak_literals() {
        let i8s = arrays(&[("a", Dtype::Int8)]);
        assert_eq!(root_dtype("a + 1", &i8s), Dtype::Int8);
        assert_eq!(root_dtype("a + 300", &i8s), Dtype::Int16);
        assert_eq!(root_dtype("a + 70000", &i8s), Dtype::Int32);
        assert_eq!(root_dtype("a - 200", &i8s), Dtype::Int16);

        let u8s = arrays(&[("u", Dtype::UInt8)]);
        assert_eq!(root_dtype("u + 300", &u8s), Dtype::UInt16);
        assert_eq!(root_dtype("a * 1.5", &i8s), Dtype::Float64);
        assert_eq!(root_dtype("a / 2", &i8s), Dtype::Float64);
        assert_eq!(root_dtype("a + 2j", &i8s), Dtype::Complex128);

        let f32s = arrays(&[("x", Dtype::Float32)]);
        assert_eq!(root_dtype("x * 2.5 + 1", &f32s), Dtype::Float32);
        assert_eq!(root_dtype("x + 1j", &f32s), Dtype::Complex64);
        assert_eq!(root_dtype("x * pi", &f32s), Dtype::Float32);

        let flags = arrays(&[("b", Dtype::Bool)]);
        assert_eq!(root_dtype("b + b", &flags), Dtype::Int64);
        assert_eq!(root_dtype("b & b", &flags), Dtype::Bool);
        assert_eq!(root_dtype("1 + 2", &flags), Dtype::Int64);
    }

    #[test]
    fn test_strong_promotion() {
        let vars = arrays(&[("a", Dtype::Int64), ("b", Dtype::UInt64), ("c", Dtype::Float32)]);
        assert_eq!(root_dtype("a + b", &vars), Dtype::Float64);
        assert_eq!(root_dtype("a < c", &vars), Dtype::Bool);
        assert_eq!(root_dtype("arcsinh(a)", &vars), Dtype::Float64);
        assert_eq!(root_dtype("sqrt(c)", &vars), Dtype::Float32);
        assert_eq!(root_dtype("int(c) + a", &vars), Dtype::Int64);
    }

    #[test]
    fn test_type_errors() {
        let vars = arrays(&[("x", Dtype::Float64), ("n", Dtype::Int32)]);
        let err = analyze("x & n", &vars, Dtype::Auto).unwrap_err();
        assert_eq!(err.kind(), CompileErrorKind::Type);
        assert_eq!(err.pos(), Some(Pos::new(1, 3)));

        let err = analyze("x + y", &vars, Dtype::Auto).unwrap_err();
        assert!(matches!(err, CompileError::Undefined { ref name, .. } if name == "y"));

        let err = analyze("n << 1.5", &vars, Dtype::Auto).unwrap_err();
        assert_eq!(err.kind(), CompileErrorKind::Type);
        assert!(analyze("_i1", &vars, Dtype::Auto).is_err());
    }

    #[test]
    fn test_auto_resolution() {
        let auto = arrays(&[("x", Dtype::Auto)]);
        let program = analyze("x * 2", &auto, Dtype::Float32).unwrap();
        assert_eq!(program.inputs[0].dtype, Dtype::Float32);
        let err = analyze("x * 2", &auto, Dtype::Auto).unwrap_err();
        assert_eq!(err.kind(), CompileErrorKind::InvalidArgument);
    }

    #[test]
    fn test_reduction_nesting() {
        let vars = arrays(&[("x", Dtype::Float64)]);
        for source in ["sum(sum(x))", "sum(x + sum(x))"] {
            let err = analyze(source, &vars, Dtype::Auto).unwrap_err();
            assert!(matches!(err, CompileError::Reduction { .. }), "{source}");
        }
        let source = "def k(x):\n    s = sum(x)\n    return max(x * s)\n";
        let err = analyze(source, &vars, Dtype::Auto).unwrap_err();
        assert!(matches!(err, CompileError::Reduction { .. }));

        let program = analyze("sum(x)", &vars, Dtype::Auto).unwrap();
        assert_eq!(program.root_reduction_kind(), Some(ReductionKind::Sum));
        let program = analyze("x + sum(x)", &vars, Dtype::Auto).unwrap();
        assert_eq!(program.root_reduction, None);
        assert!(program.reductions[0].hoisted);
    }

    #[test]
    fn test_local_inference() {
        let vars = arrays(&[("x", Dtype::Int32)]);
        let source = "def k(x):\n    acc = 0\n    for i in range(3):\n        acc = acc + x\n    return acc\n";
        let program = analyze(source, &vars, Dtype::Auto).unwrap();
        let dtypes: Vec<_> = program.locals.iter().map(|l| (l.name.as_str(), l.dtype)).collect();
        assert_eq!(dtypes, vec![("acc", Dtype::Int32), ("i", Dtype::Int64)]);
        assert_eq!(program.output, Dtype::Int32);

        let source = "def k(x):\n    y = 1\n    if x > 0:\n        y = 0.5\n    return y\n";
        let program = analyze(source, &vars, Dtype::Auto).unwrap();
        assert_eq!(program.locals[0].dtype, Dtype::Float64);
    }

    #[test]
    fn test_scope_and_returns() {
        let vars = arrays(&[("x", Dtype::Float64)]);
        let err = analyze("def k(x):\n    return z\n", &vars, Dtype::Auto).unwrap_err();
        assert!(matches!(err, CompileError::Undefined { .. }));

        let err = analyze("def k(x):\n    if x > 0:\n        return x > 1\n    return x\n", &vars, Dtype::Auto)
            .unwrap_err();
        assert_eq!(err.kind(), CompileErrorKind::Type);
        assert_eq!(err.pos(), Some(Pos::new(4, 5)));

        let err = analyze("def k(x):\n    for i in range(1.5):\n        x2 = i\n    return x\n", &vars, Dtype::Auto)
            .unwrap_err();
        assert_eq!(err.kind(), CompileErrorKind::Type);

        let err = analyze("def k(y):\n    return y\n", &vars, Dtype::Auto).unwrap_err();
        assert_eq!(err.kind(), CompileErrorKind::Type);

        let two = arrays(&[("x", Dtype::Float64), ("y", Dtype::Float64)]);
        let err = analyze("def k(x):\n    return x\n", &two, Dtype::Auto).unwrap_err();
        assert_eq!(err.kind(), CompileErrorKind::InvalidArgument);

        let err = analyze("def k(x):\n    x = 1\n    return x\n", &vars, Dtype::Auto).unwrap_err();
        assert_eq!(err.kind(), CompileErrorKind::Type);
    }

    #[test]
    fn test_statement_sequences() {
        let vars = arrays(&[("a", Dtype::Int16), ("b", Dtype::Int16)]);
        let program = analyze("t = a + b; t * 2", &vars, Dtype::Auto).unwrap();
        assert_eq!(program.output, Dtype::Int16);
        let program = analyze("result = a * 0.5", &vars, Dtype::Auto).unwrap();
        assert_eq!(program.output, Dtype::Float64);
        let err = analyze("t = a + b", &vars, Dtype::Auto).unwrap_err();
        assert_eq!(err.kind(), CompileErrorKind::Syntax);
    }

    #[test]
    fn test_strings() {
        let vars = vec![VariableEx::string("s", 16), VariableEx::array("x", Dtype::Int32)];
        assert!(analyze("s == 'abc'", &vars, Dtype::Auto).is_ok());
        assert!(analyze("startswith(s, 'a') and x > 0", &vars, Dtype::Auto).is_ok());
        for bad in ["s == x", "s < 'a'", "s + 1", "contains(s, x)"] {
            let err = analyze(bad, &vars, Dtype::Auto).unwrap_err();
            assert_eq!(err.kind(), CompileErrorKind::Type, "{bad}");
        }
    }

    #[test]
    fn test_contraction() {
        let vars = arrays(&[("a", Dtype::Float64), ("b", Dtype::Float64), ("c", Dtype::Float64)]);
        let fused = analyze("# me:fp=contract\na * b + c", &vars, Dtype::Auto).unwrap();
        let Body::Expr(root) = fused.body else { panic!("expected expression") };
        assert!(matches!(fused.node(root).op, Op::FusedMulAdd(..)));

        let strict = analyze("a * b + c", &vars, Dtype::Auto).unwrap();
        let Body::Expr(root) = strict.body else { panic!("expected expression") };
        assert!(matches!(strict.node(root).op, Op::Binary(BinaryOp::Add, ..)));
    }

    #[test]
    fn test_constant_folding() {
        let program = analyze("int(2.7) * -3", &[], Dtype::Auto).unwrap();
        let Body::Expr(root) = program.body else { panic!("expected expression") };
        assert_eq!(program.node(root).op, Op::Const(Value::Int64(-6)));
    }
}
