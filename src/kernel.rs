//! Kernel modules: the lowered form handed to a JIT host
//!
//! A [`KernelModule`] is a linear stack-machine program with explicit jumps and
//! loop registers, plus one code segment per reduction argument. [`Vm`] executes
//! instantiated modules and must agree with the interpreter bit for bit,
//! including which error a failing item raises.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ast::{FpMode, LogicalOp};
use crate::builtins::Builtin;
use crate::dtype::Dtype;
use crate::error::{EvalError, EvalResult};
use crate::eval::{Ctx, Engine, Locals};
use crate::ir::{IndexVar, StrOp, StrOperand};
use crate::ops::{self, BinaryOp, CompareOp, UnaryOp};
use crate::reduction::{Accumulator, ReductionKind};
use crate::value::Value;

/// One stack-machine instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instr {
    Const(Value),
    LoadInput(usize),
    LoadIndex(IndexVar),
    LoadLocal(usize),
    StoreLocal(usize),
    Cast(Dtype),
    Unary(UnaryOp),
    Binary(BinaryOp),
    /// Pop `c`, `b`, `a`; push `a * b + c` with one rounding
    Fma,
    Compare(CompareOp),
    Logical(LogicalOp),
    /// Pop `b`, `a`, `cond`; push `a` if `cond` else `b`
    Select,
    Call { builtin: Builtin, argc: usize },
    CallUser { function: usize, argc: usize },
    Str(StrOp, StrOperand, StrOperand),
    /// Value of reduction `n` over the frame
    Reduce(usize),
    /// Pop; jump when falsy
    Jz(usize),
    Jmp(usize),
    /// Pop step, stop and start into a range register; zero step traps
    RangeInit(usize),
    /// Store the register's next value into `local`, or jump to `exit` when exhausted
    RangeNext { register: usize, local: usize, exit: usize },
    /// Clear a `while` iteration counter
    LoopReset(usize),
    /// Count one `while` iteration; traps past the configured cap
    LoopTick(usize),
    /// Pop the item's result
    Return,
    /// Reached the end of a kernel without returning
    MissingReturn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSlot {
    pub name: String,
    pub dtype: Dtype,
}

/// Code computing one reduction's argument for a single item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReductionCode {
    pub kind: ReductionKind,
    pub dtype: Dtype,
    pub hoisted: bool,
    pub code: Vec<Instr>,
}

/// A lowered program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelModule {
    pub name: String,
    pub inputs: Vec<KernelSlot>,
    pub locals: Vec<KernelSlot>,
    /// Names of user functions, by call index
    pub functions: Vec<String>,
    pub output: Dtype,
    pub fp: FpMode,
    /// Native compiler requested by `# me:compiler=`
    pub compiler: Option<String>,
    /// Loop registers used by `code`
    pub registers: usize,
    pub code: Vec<Instr>,
    pub reductions: Vec<ReductionCode>,
}

impl KernelModule {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Total instruction count across all segments
    pub fn instruction_count(&self) -> usize {
        self.code.len() + self.reductions.iter().map(|r| r.code.len()).sum::<usize>()
    }

    /// Check jump targets and slot references. Hosts call this before instantiating.
    pub fn verify(&self) -> Result<(), String> {
        let segments = std::iter::once(("main", &self.code))
            .chain(self.reductions.iter().map(|r| ("reduction", &r.code)));
        for (segment, code) in segments {
            for (pc, instr) in code.iter().enumerate() {
                let bad = match instr {
                    Instr::Jz(target) | Instr::Jmp(target) => *target > code.len(),
                    Instr::RangeNext { register, local, exit } => {
                        *register >= self.registers || *local >= self.locals.len() || *exit > code.len()
                    }
                    Instr::RangeInit(register) | Instr::LoopReset(register) | Instr::LoopTick(register) => {
                        *register >= self.registers
                    }
                    Instr::LoadInput(slot) => *slot >= self.inputs.len(),
                    Instr::LoadLocal(slot) | Instr::StoreLocal(slot) => *slot >= self.locals.len(),
                    Instr::Reduce(index) => *index >= self.reductions.len(),
                    Instr::CallUser { function, .. } => *function >= self.functions.len(),
                    _ => false,
                };
                if bad {
                    return Err(format!("{segment} instruction {pc} `{instr}` is out of range"));
                }
            }
            check_stack(segment, code)?;
        }
        Ok(())
    }
}

impl Instr {
    /// Values popped and pushed
    fn stack_effect(&self) -> (usize, usize) {
        match self {
            Instr::Const(_)
            | Instr::LoadInput(_)
            | Instr::LoadIndex(_)
            | Instr::LoadLocal(_)
            | Instr::Str(..)
            | Instr::Reduce(_) => (0, 1),
            Instr::StoreLocal(_) | Instr::Jz(_) | Instr::Return => (1, 0),
            Instr::Cast(_) | Instr::Unary(_) => (1, 1),
            Instr::Binary(_) | Instr::Compare(_) | Instr::Logical(_) => (2, 1),
            Instr::Fma | Instr::Select => (3, 1),
            Instr::Call { argc, .. } | Instr::CallUser { argc, .. } => (*argc, 1),
            Instr::RangeInit(_) => (3, 0),
            Instr::Jmp(_)
            | Instr::RangeNext { .. }
            | Instr::LoopReset(_)
            | Instr::LoopTick(_)
            | Instr::MissingReturn => (0, 0),
        }
    }
}

/// Every path must see the same stack depth at each instruction and never pop
/// an empty stack.
fn check_stack(segment: &str, code: &[Instr]) -> Result<(), String> {
    let mut depth: Vec<Option<usize>> = vec![None; code.len() + 1];
    let mut pending = vec![(0usize, 0usize)];
    while let Some((pc, at)) = pending.pop() {
        match depth.get(pc).copied().flatten() {
            Some(seen) if seen == at => continue,
            Some(seen) => {
                return Err(format!("{segment} instruction {pc} reached with stack depth {at} and {seen}"));
            }
            None => depth[pc] = Some(at),
        }
        let Some(instr) = code.get(pc) else { continue };
        let (pops, pushes) = instr.stack_effect();
        if at < pops {
            return Err(format!("{segment} instruction {pc} `{instr}` underflows the stack"));
        }
        let after = at - pops + pushes;
        match instr {
            Instr::Jmp(target) => pending.push((*target, after)),
            Instr::Jz(target) => pending.extend([(*target, after), (pc + 1, after)]),
            Instr::RangeNext { exit, .. } => pending.extend([(*exit, after), (pc + 1, after)]),
            Instr::Return | Instr::MissingReturn => {}
            _ => pending.push((pc + 1, after)),
        }
    }
    Ok(())
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Const(v) => write!(f, "const {} : {}", v, v.dtype()),
            Instr::LoadInput(slot) => write!(f, "load.input {slot}"),
            Instr::LoadIndex(var) => match var {
                IndexVar::Coord(d) => write!(f, "load.index _i{d}"),
                IndexVar::Extent(d) => write!(f, "load.index _n{d}"),
                IndexVar::Ndim => write!(f, "load.index _ndim"),
            },
            Instr::LoadLocal(slot) => write!(f, "load.local {slot}"),
            Instr::StoreLocal(slot) => write!(f, "store.local {slot}"),
            Instr::Cast(dtype) => write!(f, "cast {dtype}"),
            Instr::Unary(op) => write!(f, "unary {}", op.symbol()),
            Instr::Binary(op) => write!(f, "binary {}", op.symbol()),
            Instr::Fma => write!(f, "fma"),
            Instr::Compare(op) => write!(f, "compare {}", op.symbol()),
            Instr::Logical(LogicalOp::And) => write!(f, "and"),
            Instr::Logical(LogicalOp::Or) => write!(f, "or"),
            Instr::Select => write!(f, "select"),
            Instr::Call { builtin, argc } => write!(f, "call {builtin}/{argc}"),
            Instr::CallUser { function, argc } => write!(f, "call.user {function}/{argc}"),
            Instr::Str(op, _, _) => write!(f, "str {op:?}"),
            Instr::Reduce(index) => write!(f, "reduce {index}"),
            Instr::Jz(target) => write!(f, "jz {target}"),
            Instr::Jmp(target) => write!(f, "jmp {target}"),
            Instr::RangeInit(register) => write!(f, "range.init r{register}"),
            Instr::RangeNext { register, local, exit } => {
                write!(f, "range.next r{register} -> local {local} else {exit}")
            }
            Instr::LoopReset(register) => write!(f, "loop.reset r{register}"),
            Instr::LoopTick(register) => write!(f, "loop.tick r{register}"),
            Instr::Return => write!(f, "ret"),
            Instr::MissingReturn => write!(f, "trap.missing_return"),
        }
    }
}

impl fmt::Display for KernelModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Kernel Module `{}`", self.name)?;
        writeln!(f, "==================")?;
        let inputs: Vec<String> = self.inputs.iter().map(|s| format!("{}: {}", s.name, s.dtype)).collect();
        writeln!(f, "Inputs: {}", inputs.join(", "))?;
        let locals: Vec<String> = self.locals.iter().map(|s| format!("{}: {}", s.name, s.dtype)).collect();
        writeln!(f, "Locals: {}", locals.join(", "))?;
        writeln!(f, "Output: {}", self.output)?;
        writeln!(f, "FP mode: {}", self.fp)?;
        if let Some(compiler) = &self.compiler {
            writeln!(f, "Compiler: {}", compiler)?;
        }
        writeln!(f, "Registers: {}", self.registers)?;
        writeln!(f)?;
        writeln!(f, "main:")?;
        for (pc, instr) in self.code.iter().enumerate() {
            writeln!(f, "  {:4}  {}", pc, instr)?;
        }
        for (i, reduction) in self.reductions.iter().enumerate() {
            writeln!(
                f,
                "reduction {} ({} -> {}{}):",
                i,
                reduction.kind,
                reduction.dtype,
                if reduction.hoisted { ", hoisted" } else { "" }
            )?;
            for (pc, instr) in reduction.code.iter().enumerate() {
                writeln!(f, "  {:4}  {}", pc, instr)?;
            }
        }
        Ok(())
    }
}

/// Loop state: range cursor or `while` counter
#[derive(Debug, Clone, Copy, Default)]
struct Register {
    next: i64,
    stop: i64,
    step: i64,
    exhausted: bool,
    count: u64,
}

impl Register {
    fn has_next(&self) -> bool {
        !self.exhausted && ((self.step > 0 && self.next < self.stop) || (self.step < 0 && self.next > self.stop))
    }
}

/// Verified modules never underflow; see [`KernelModule::verify`]
fn pop(stack: &mut Vec<Value>) -> Value {
    stack.pop().unwrap_or(Value::Bool(false))
}

/// Executes an instantiated [`KernelModule`]
pub(crate) struct Vm<'m> {
    module: &'m KernelModule,
}

impl<'m> Vm<'m> {
    pub fn new(module: &'m KernelModule) -> Self {
        Self { module }
    }

    fn execute(
        &self,
        ctx: &Ctx<'_>,
        code: &[Instr],
        item: usize,
        locals: &mut Locals,
        registers: &mut [Register],
    ) -> EvalResult<Value> {
        let mut stack: Vec<Value> = Vec::with_capacity(16);
        let mut pc = 0;
        while let Some(instr) = code.get(pc) {
            pc += 1;
            match instr {
                Instr::Const(v) => stack.push(*v),
                Instr::LoadInput(slot) => stack.push(ctx.frame.input(*slot, item)),
                Instr::LoadIndex(var) => stack.push(Value::Int64(ctx.frame.index(*var, item))),
                Instr::LoadLocal(slot) => match locals.get(*slot).copied().flatten() {
                    Some(v) => stack.push(v),
                    None => {
                        return Err(EvalError::Unassigned {
                            name: self.module.locals[*slot].name.clone(),
                        })
                    }
                },
                Instr::StoreLocal(slot) => {
                    let v = pop(&mut stack);
                    locals[*slot] = Some(v);
                }
                Instr::Cast(dtype) => {
                    let v = pop(&mut stack);
                    stack.push(v.cast(*dtype));
                }
                Instr::Unary(op) => {
                    let v = pop(&mut stack);
                    stack.push(ops::unary(*op, v));
                }
                Instr::Binary(op) => {
                    let b = pop(&mut stack);
                    let a = pop(&mut stack);
                    stack.push(ops::binary(*op, a, b));
                }
                Instr::Fma => {
                    let c = pop(&mut stack);
                    let b = pop(&mut stack);
                    let a = pop(&mut stack);
                    stack.push(ops::fused_mul_add(a, b, c));
                }
                Instr::Compare(op) => {
                    let b = pop(&mut stack);
                    let a = pop(&mut stack);
                    stack.push(Value::Bool(ops::compare(*op, a, b)));
                }
                Instr::Logical(op) => {
                    let b = pop(&mut stack);
                    let a = pop(&mut stack);
                    stack.push(ops::logical(*op, a, b));
                }
                Instr::Select => {
                    let b = pop(&mut stack);
                    let a = pop(&mut stack);
                    let cond = pop(&mut stack);
                    stack.push(if cond.is_truthy() { a } else { b });
                }
                Instr::Call { builtin, argc } => {
                    let args = stack.split_off(stack.len().saturating_sub(*argc));
                    stack.push(builtin.apply(&args, &ctx.backend));
                }
                Instr::CallUser { function, argc } => {
                    let args = stack.split_off(stack.len().saturating_sub(*argc));
                    stack.push(ctx.program.functions[*function].call(&args));
                }
                Instr::Str(op, a, b) => {
                    stack.push(Value::Bool(op.apply(ctx.frame.string(a, item), ctx.frame.string(b, item))));
                }
                Instr::Reduce(index) => {
                    let value = match ctx.hoisted(*index) {
                        Some(v) => v,
                        None => self.reduce(ctx, *index, locals)?,
                    };
                    stack.push(value);
                }
                Instr::Jz(target) => {
                    if !pop(&mut stack).is_truthy() {
                        pc = *target;
                    }
                }
                Instr::Jmp(target) => pc = *target,
                Instr::RangeInit(register) => {
                    let step = pop(&mut stack).as_i64();
                    let stop = pop(&mut stack).as_i64();
                    let start = pop(&mut stack).as_i64();
                    if step == 0 {
                        return Err(EvalError::ZeroStep);
                    }
                    registers[*register] = Register {
                        next: start,
                        stop,
                        step,
                        ..Register::default()
                    };
                }
                Instr::RangeNext { register, local, exit } => {
                    let reg = &mut registers[*register];
                    if reg.has_next() {
                        locals[*local] = Some(Value::Int64(reg.next).cast(self.module.locals[*local].dtype));
                        match reg.next.checked_add(reg.step) {
                            Some(next) => reg.next = next,
                            None => reg.exhausted = true,
                        }
                    } else {
                        pc = *exit;
                    }
                }
                Instr::LoopReset(register) => registers[*register].count = 0,
                Instr::LoopTick(register) => {
                    let reg = &mut registers[*register];
                    reg.count += 1;
                    if reg.count > ctx.max_iterations {
                        return Err(EvalError::IterationLimit { limit: ctx.max_iterations });
                    }
                }
                Instr::Return => return Ok(pop(&mut stack)),
                Instr::MissingReturn => return Err(EvalError::MissingReturn),
            }
        }
        Err(EvalError::MissingReturn)
    }
}

impl Engine for Vm<'_> {
    fn name(&self) -> &'static str {
        "jit"
    }

    fn reduce(&self, ctx: &Ctx<'_>, index: usize, locals: &Locals) -> EvalResult<Value> {
        let reduction = &self.module.reductions[index];
        let mut acc = Accumulator::new(reduction.kind, reduction.dtype);
        let mut scratch = locals.clone();
        for item in 0..ctx.frame.items() {
            if ctx.frame.contains(item) {
                acc.push(self.execute(ctx, &reduction.code, item, &mut scratch, &mut [])?);
            }
        }
        Ok(acc.finish())
    }

    fn element(&self, ctx: &Ctx<'_>, item: usize) -> EvalResult<Value> {
        let mut locals: Locals = vec![None; self.module.locals.len()];
        let mut registers = vec![Register::default(); self.module.registers];
        self.execute(ctx, &self.module.code, item, &mut locals, &mut registers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn module(code: Vec<Instr>) -> KernelModule {
        KernelModule {
            name: "k".to_string(),
            inputs: vec![KernelSlot { name: "x".to_string(), dtype: Dtype::Float64 }],
            locals: vec![KernelSlot { name: "i".to_string(), dtype: Dtype::Int64 }],
            functions: Vec::new(),
            output: Dtype::Float64,
            fp: FpMode::Strict,
            compiler: None,
            registers: 1,
            code,
            reductions: Vec::new(),
        }
    }

    #[test]
    fn test_verify() {
        let ok = module(vec![Instr::LoadInput(0), Instr::Jz(3), Instr::Jmp(0), Instr::MissingReturn]);
        assert!(ok.verify().is_ok());

        let bad = module(vec![Instr::Jmp(9)]);
        assert_eq!(bad.verify().unwrap_err(), "main instruction 0 `jmp 9` is out of range");

        let bad = module(vec![Instr::LoadLocal(3)]);
        assert!(bad.verify().is_err());
    }

    #[test]
    fn test_verify_stack_depth() {
        let underflow = module(vec![Instr::LoadInput(0), Instr::Binary(BinaryOp::Add), Instr::Return]);
        assert_eq!(
            underflow.verify().unwrap_err(),
            "main instruction 1 `binary +` underflows the stack"
        );

        // The loop back edge arrives with one extra value each time round
        let unbalanced = module(vec![Instr::LoadInput(0), Instr::Jmp(0)]);
        assert_eq!(
            unbalanced.verify().unwrap_err(),
            "main instruction 0 reached with stack depth 1 and 0"
        );

        let mut segment = module(vec![Instr::Reduce(0), Instr::Return]);
        segment.reductions.push(ReductionCode {
            kind: ReductionKind::Sum,
            dtype: Dtype::Float64,
            hoisted: true,
            code: vec![Instr::Return],
        });
        assert_eq!(
            segment.verify().unwrap_err(),
            "reduction instruction 0 `ret` underflows the stack"
        );
    }

    #[test]
    fn test_json_and_display() {
        let m = module(vec![
            Instr::Const(Value::Float64(2.0)),
            Instr::LoadInput(0),
            Instr::Binary(BinaryOp::Mul),
            Instr::Return,
        ]);
        let json = m.to_json().unwrap();
        assert_eq!(KernelModule::from_json(&json).unwrap(), m);

        let text = m.to_string();
        assert!(text.contains("Kernel Module `k`"));
        assert!(text.contains("binary *"));
        assert_eq!(m.instruction_count(), 4);
    }
}
