//! Code generator for kernel modules
//!
//! Lowers a typed [`Program`] into a linear [`KernelModule`]. Structured control
//! flow becomes conditional jumps; `break` targets are unknown when emitted and
//! are backpatched once the loop exit is placed.

use crate::ir::{Body, NodeId, Op, Program, Stmt};
use crate::kernel::{Instr, KernelModule, KernelSlot, ReductionCode};

/// Placeholder target for a jump that is patched later
const UNPATCHED: usize = usize::MAX;

/// Jump sites of the innermost loops being emitted
struct LoopLabels {
    head: usize,
    breaks: Vec<usize>,
}

/// Code generator for kernel modules
pub struct CodeGenerator {
    code: Vec<Instr>,
    loops: Vec<LoopLabels>,
    registers: usize,
}

impl CodeGenerator {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            loops: Vec::new(),
            registers: 0,
        }
    }

    /// Generate a kernel module from a typed program
    pub fn generate(&mut self, program: &Program) -> KernelModule {
        self.code.clear();
        self.loops.clear();
        self.registers = 0;

        let mut reductions = Vec::with_capacity(program.reductions.len());
        for reduction in &program.reductions {
            self.emit_expr(program, reduction.arg);
            self.code.push(Instr::Return);
            reductions.push(ReductionCode {
                kind: reduction.kind,
                dtype: reduction.dtype,
                hoisted: reduction.hoisted,
                code: std::mem::take(&mut self.code),
            });
        }

        match &program.body {
            Body::Expr(root) => {
                self.emit_expr(program, *root);
                self.code.push(Instr::Return);
            }
            Body::Block(stmts) => {
                self.emit_block(program, stmts);
                self.code.push(Instr::MissingReturn);
            }
        }

        KernelModule {
            name: program.name.clone(),
            inputs: program
                .inputs
                .iter()
                .map(|i| KernelSlot { name: i.name.clone(), dtype: i.dtype })
                .collect(),
            locals: program
                .locals
                .iter()
                .map(|l| KernelSlot { name: l.name.clone(), dtype: l.dtype })
                .collect(),
            functions: program.functions.iter().map(|f| f.name().to_string()).collect(),
            output: program.output,
            fp: program.pragmas.fp,
            compiler: program.pragmas.compiler.clone(),
            registers: self.registers,
            code: std::mem::take(&mut self.code),
            reductions,
        }
    }

    fn emit(&mut self, instr: Instr) -> usize {
        self.code.push(instr);
        self.code.len() - 1
    }

    fn patch(&mut self, at: usize, target: usize) {
        match &mut self.code[at] {
            Instr::Jz(t) | Instr::Jmp(t) => *t = target,
            Instr::RangeNext { exit, .. } => *exit = target,
            _ => {}
        }
    }

    fn emit_expr(&mut self, program: &Program, id: NodeId) {
        let node = program.node(id);
        match &node.op {
            Op::Const(v) => {
                self.emit(Instr::Const(*v));
            }
            Op::Input(slot) => {
                self.emit(Instr::LoadInput(*slot));
            }
            Op::Index(var) => {
                self.emit(Instr::LoadIndex(*var));
            }
            Op::Local(slot) => {
                self.emit(Instr::LoadLocal(*slot));
            }
            Op::Cast(a) => {
                self.emit_expr(program, *a);
                self.emit(Instr::Cast(node.dtype));
            }
            Op::Unary(op, a) => {
                self.emit_expr(program, *a);
                self.emit(Instr::Unary(*op));
            }
            Op::Binary(op, a, b) => {
                self.emit_expr(program, *a);
                self.emit_expr(program, *b);
                self.emit(Instr::Binary(*op));
            }
            Op::FusedMulAdd(a, b, c) => {
                self.emit_expr(program, *a);
                self.emit_expr(program, *b);
                self.emit_expr(program, *c);
                self.emit(Instr::Fma);
            }
            Op::Compare(op, a, b) => {
                self.emit_expr(program, *a);
                self.emit_expr(program, *b);
                self.emit(Instr::Compare(*op));
            }
            Op::Logical(op, a, b) => {
                self.emit_expr(program, *a);
                self.emit_expr(program, *b);
                self.emit(Instr::Logical(*op));
            }
            Op::Select(c, a, b) => {
                self.emit_expr(program, *c);
                self.emit_expr(program, *a);
                self.emit_expr(program, *b);
                self.emit(Instr::Select);
            }
            Op::Call(builtin, args) => {
                for arg in args {
                    self.emit_expr(program, *arg);
                }
                self.emit(Instr::Call { builtin: *builtin, argc: args.len() });
            }
            Op::UserCall(function, args) => {
                for arg in args {
                    self.emit_expr(program, *arg);
                }
                self.emit(Instr::CallUser { function: *function, argc: args.len() });
            }
            Op::Str(op, a, b) => {
                self.emit(Instr::Str(*op, a.clone(), b.clone()));
            }
            Op::Reduce(index) => {
                self.emit(Instr::Reduce(*index));
            }
        }
    }

    fn emit_block(&mut self, program: &Program, stmts: &[Stmt]) {
        for stmt in stmts {
            self.emit_stmt(program, stmt);
        }
    }

    fn emit_stmt(&mut self, program: &Program, stmt: &Stmt) {
        match stmt {
            Stmt::Assign { local, value } => {
                self.emit_expr(program, *value);
                self.emit(Instr::StoreLocal(*local));
            }
            Stmt::If { branches, orelse } => {
                let mut ends = Vec::with_capacity(branches.len());
                for (cond, body) in branches {
                    self.emit_expr(program, *cond);
                    let skip = self.emit(Instr::Jz(UNPATCHED));
                    self.emit_block(program, body);
                    ends.push(self.emit(Instr::Jmp(UNPATCHED)));
                    let next = self.code.len();
                    self.patch(skip, next);
                }
                self.emit_block(program, orelse);
                let end = self.code.len();
                for at in ends {
                    self.patch(at, end);
                }
            }
            Stmt::For { local, range, body } => {
                self.emit_expr(program, range.start);
                self.emit_expr(program, range.stop);
                self.emit_expr(program, range.step);
                let register = self.registers;
                self.registers += 1;
                self.emit(Instr::RangeInit(register));
                let head = self.emit(Instr::RangeNext {
                    register,
                    local: *local,
                    exit: UNPATCHED,
                });
                self.emit_loop_body(program, head, body);
                self.emit(Instr::Jmp(head));
                let exit = self.code.len();
                self.patch(head, exit);
                self.close_loop(exit);
            }
            Stmt::While { cond, body } => {
                let register = self.registers;
                self.registers += 1;
                self.emit(Instr::LoopReset(register));
                let head = self.code.len();
                self.emit_expr(program, *cond);
                let test = self.emit(Instr::Jz(UNPATCHED));
                self.emit(Instr::LoopTick(register));
                self.emit_loop_body(program, head, body);
                self.emit(Instr::Jmp(head));
                let exit = self.code.len();
                self.patch(test, exit);
                self.close_loop(exit);
            }
            Stmt::Break => {
                let at = self.emit(Instr::Jmp(UNPATCHED));
                if let Some(labels) = self.loops.last_mut() {
                    labels.breaks.push(at);
                }
            }
            Stmt::Continue => {
                let head = self.loops.last().map_or(UNPATCHED, |l| l.head);
                self.emit(Instr::Jmp(head));
            }
            Stmt::Return(value) => {
                self.emit_expr(program, *value);
                self.emit(Instr::Return);
            }
        }
    }

    fn emit_loop_body(&mut self, program: &Program, head: usize, body: &[Stmt]) {
        self.loops.push(LoopLabels { head, breaks: Vec::new() });
        self.emit_block(program, body);
    }

    fn close_loop(&mut self, exit: usize) {
        if let Some(labels) = self.loops.pop() {
            for at in labels.breaks {
                self.patch(at, exit);
            }
        }
    }
}

impl Default for CodeGenerator {
    fn default() -> Self {
        Self::new()
    }
}
