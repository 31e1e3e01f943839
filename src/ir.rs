//! Annotated intermediate representation
//!
//! Every node carries its resolved dtype and implicit conversions are explicit
//! [`Op::Cast`] nodes, so the engines never make typing decisions.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::arena::{Arena, Handle};
use crate::ast::{LogicalOp, Pragmas};
use crate::builtins::Builtin;
use crate::dtype::Dtype;
use crate::ops::{BinaryOp, CompareOp, UnaryOp};
use crate::reduction::ReductionKind;
use crate::simd::Transcendental;
use crate::value::Value;
use crate::vars::UserFunction;

pub type NodeId = Handle<Node>;

/// Index variables: `_i{d}`, `_n{d}` and `_ndim`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexVar {
    Coord(usize),
    Extent(usize),
    Ndim,
}

/// One side of a string predicate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrOperand {
    Input(usize),
    /// UCS-4 code points
    Literal(Vec<u32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrOp {
    Eq,
    Ne,
    StartsWith,
    EndsWith,
    Contains,
}

impl StrOp {
    /// Apply to two code point sequences; trailing NULs are ignored
    pub fn apply(self, lhs: &[u32], rhs: &[u32]) -> bool {
        let lhs = trim_nul(lhs);
        let rhs = trim_nul(rhs);
        match self {
            StrOp::Eq => lhs == rhs,
            StrOp::Ne => lhs != rhs,
            StrOp::StartsWith => lhs.starts_with(rhs),
            StrOp::EndsWith => lhs.ends_with(rhs),
            StrOp::Contains => rhs.is_empty() || lhs.windows(rhs.len()).any(|w| w == rhs),
        }
    }
}

fn trim_nul(chars: &[u32]) -> &[u32] {
    let end = chars.iter().rposition(|&c| c != 0).map_or(0, |i| i + 1);
    &chars[..end]
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Const(Value),
    /// Element of the input bound to this slot
    Input(usize),
    Index(IndexVar),
    Local(usize),
    Cast(NodeId),
    Unary(UnaryOp, NodeId),
    Binary(BinaryOp, NodeId, NodeId),
    /// `a * b + c` with one rounding
    FusedMulAdd(NodeId, NodeId, NodeId),
    Compare(CompareOp, NodeId, NodeId),
    /// Operands are bool; both sides are always evaluated
    Logical(LogicalOp, NodeId, NodeId),
    /// `where(cond, a, b)`
    Select(NodeId, NodeId, NodeId),
    Call(Builtin, Vec<NodeId>),
    UserCall(usize, Vec<NodeId>),
    Str(StrOp, StrOperand, StrOperand),
    Reduce(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub op: Op,
    pub dtype: Dtype,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reduction {
    pub kind: ReductionKind,
    pub arg: NodeId,
    /// Result dtype
    pub dtype: Dtype,
    /// The argument reads no locals, so the value is computed once per call
    pub hoisted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Local {
    pub name: String,
    pub dtype: Dtype,
}

/// Declared input bound to a buffer slot
#[derive(Debug, Clone, PartialEq)]
pub struct InputSlot {
    pub name: String,
    pub dtype: Dtype,
    /// Bytes per element (string width for strings)
    pub itemsize: usize,
}

/// `range(start, stop, step)` bounds, all int64
#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    pub start: NodeId,
    pub stop: NodeId,
    pub step: NodeId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign { local: usize, value: NodeId },
    If {
        branches: Vec<(NodeId, Vec<Stmt>)>,
        orelse: Vec<Stmt>,
    },
    For { local: usize, range: Range, body: Vec<Stmt> },
    While { cond: NodeId, body: Vec<Stmt> },
    Break,
    Continue,
    Return(NodeId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Bare expression, already cast to the output dtype
    Expr(NodeId),
    /// Statements; every `Return` value is cast to the output dtype
    Block(Vec<Stmt>),
}

/// A fully typed program
#[derive(Debug, Clone)]
pub struct Program {
    pub name: String,
    pub nodes: Arena<Node>,
    pub body: Body,
    pub locals: Vec<Local>,
    pub reductions: Vec<Reduction>,
    pub inputs: Vec<InputSlot>,
    pub functions: Vec<UserFunction>,
    pub output: Dtype,
    /// Set when the whole expression is one reduction
    pub root_reduction: Option<usize>,
    pub pragmas: Pragmas,
}

impl Program {
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn is_dsl(&self) -> bool {
        matches!(self.body, Body::Block(_))
    }

    pub fn root_reduction_kind(&self) -> Option<ReductionKind> {
        self.root_reduction
            .and_then(|i| self.reductions.get(i))
            .map(|r| r.kind)
    }

    /// A bare `f(x)` over one float input with a matching output dtype
    pub fn column_call(&self) -> Option<(Transcendental, usize)> {
        let Body::Expr(root) = self.body else {
            return None;
        };
        let node = self.node(root);
        let Op::Call(Builtin::Math(f), args) = &node.op else {
            return None;
        };
        let [arg] = args.as_slice() else {
            return None;
        };
        match self.node(*arg).op {
            Op::Input(slot)
                if matches!(node.dtype, Dtype::Float32 | Dtype::Float64)
                    && self.inputs[slot].dtype == node.dtype =>
            {
                Some((*f, slot))
            }
            _ => None,
        }
    }

    /// Whether evaluating `id` reads any local
    pub fn reads_locals(&self, id: NodeId) -> bool {
        let node = self.node(id);
        match &node.op {
            Op::Local(_) => true,
            Op::Const(_) | Op::Input(_) | Op::Index(_) | Op::Str(..) | Op::Reduce(_) => false,
            Op::Cast(a) | Op::Unary(_, a) => self.reads_locals(*a),
            Op::Binary(_, a, b) | Op::Compare(_, a, b) | Op::Logical(_, a, b) => {
                self.reads_locals(*a) || self.reads_locals(*b)
            }
            Op::FusedMulAdd(a, b, c) | Op::Select(a, b, c) => {
                self.reads_locals(*a) || self.reads_locals(*b) || self.reads_locals(*c)
            }
            Op::Call(_, args) | Op::UserCall(_, args) => args.iter().any(|a| self.reads_locals(*a)),
        }
    }
}

impl Program {
    fn children(&self, id: NodeId) -> Vec<NodeId> {
        match &self.node(id).op {
            Op::Const(_) | Op::Input(_) | Op::Index(_) | Op::Local(_) | Op::Str(..) | Op::Reduce(_) => Vec::new(),
            Op::Cast(a) | Op::Unary(_, a) => vec![*a],
            Op::Binary(_, a, b) | Op::Compare(_, a, b) | Op::Logical(_, a, b) => vec![*a, *b],
            Op::FusedMulAdd(a, b, c) | Op::Select(a, b, c) => vec![*a, *b, *c],
            Op::Call(_, args) | Op::UserCall(_, args) => args.clone(),
        }
    }

    fn str_operand(&self, operand: &StrOperand) -> String {
        match operand {
            StrOperand::Input(slot) => self.inputs[*slot].name.clone(),
            StrOperand::Literal(chars) => {
                let text: String = chars.iter().filter_map(|&c| char::from_u32(c)).collect();
                format!("{text:?}")
            }
        }
    }

    fn write_node(&self, f: &mut fmt::Formatter<'_>, id: NodeId, depth: usize) -> fmt::Result {
        let node = self.node(id);
        write!(f, "{:indent$}", "", indent = depth * 2)?;
        match &node.op {
            Op::Const(v) => write!(f, "const {v}")?,
            Op::Input(slot) => write!(f, "input {}", self.inputs[*slot].name)?,
            Op::Index(IndexVar::Coord(d)) => write!(f, "index _i{d}")?,
            Op::Index(IndexVar::Extent(d)) => write!(f, "index _n{d}")?,
            Op::Index(IndexVar::Ndim) => write!(f, "index _ndim")?,
            Op::Local(local) => write!(f, "local {}", self.locals[*local].name)?,
            Op::Cast(_) => write!(f, "cast")?,
            Op::Unary(op, _) => write!(f, "unary {}", op.symbol())?,
            Op::Binary(op, _, _) => write!(f, "binary {op}")?,
            Op::FusedMulAdd(..) => write!(f, "fma")?,
            Op::Compare(op, _, _) => write!(f, "compare {op}")?,
            Op::Logical(LogicalOp::And, _, _) => write!(f, "and")?,
            Op::Logical(LogicalOp::Or, _, _) => write!(f, "or")?,
            Op::Select(..) => write!(f, "where")?,
            Op::Call(builtin, _) => write!(f, "call {builtin}")?,
            Op::UserCall(function, _) => write!(f, "call {}", self.functions[*function].name())?,
            Op::Str(op, lhs, rhs) => write!(f, "str {op:?} {} {}", self.str_operand(lhs), self.str_operand(rhs))?,
            Op::Reduce(index) => write!(f, "reduce {index}")?,
        }
        writeln!(f, " : {}", node.dtype)?;
        for child in self.children(id) {
            self.write_node(f, child, depth + 1)?;
        }
        Ok(())
    }

    fn write_stmts(&self, f: &mut fmt::Formatter<'_>, stmts: &[Stmt], depth: usize) -> fmt::Result {
        let pad = depth * 2;
        for stmt in stmts {
            match stmt {
                Stmt::Assign { local, value } => {
                    writeln!(f, "{:pad$}{} =", "", self.locals[*local].name)?;
                    self.write_node(f, *value, depth + 1)?;
                }
                Stmt::If { branches, orelse } => {
                    for (i, (cond, body)) in branches.iter().enumerate() {
                        writeln!(f, "{:pad$}{}", "", if i == 0 { "if" } else { "elif" })?;
                        self.write_node(f, *cond, depth + 1)?;
                        writeln!(f, "{:pad$}then:", "")?;
                        self.write_stmts(f, body, depth + 1)?;
                    }
                    if !orelse.is_empty() {
                        writeln!(f, "{:pad$}else:", "")?;
                        self.write_stmts(f, orelse, depth + 1)?;
                    }
                }
                Stmt::For { local, range, body } => {
                    writeln!(f, "{:pad$}for {} in range", "", self.locals[*local].name)?;
                    self.write_node(f, range.start, depth + 1)?;
                    self.write_node(f, range.stop, depth + 1)?;
                    self.write_node(f, range.step, depth + 1)?;
                    writeln!(f, "{:pad$}do:", "")?;
                    self.write_stmts(f, body, depth + 1)?;
                }
                Stmt::While { cond, body } => {
                    writeln!(f, "{:pad$}while", "")?;
                    self.write_node(f, *cond, depth + 1)?;
                    writeln!(f, "{:pad$}do:", "")?;
                    self.write_stmts(f, body, depth + 1)?;
                }
                Stmt::Break => writeln!(f, "{:pad$}break", "")?,
                Stmt::Continue => writeln!(f, "{:pad$}continue", "")?,
                Stmt::Return(value) => {
                    writeln!(f, "{:pad$}return", "")?;
                    self.write_node(f, *value, depth + 1)?;
                }
            }
        }
        Ok(())
    }
}

/// Typed tree dump, one node per line with its dtype
impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Program `{}`", self.name)?;
        writeln!(f, "============")?;
        let inputs: Vec<String> = self.inputs.iter().map(|s| format!("{}: {}", s.name, s.dtype)).collect();
        writeln!(f, "Inputs: {}", inputs.join(", "))?;
        if !self.locals.is_empty() {
            let locals: Vec<String> = self.locals.iter().map(|l| format!("{}: {}", l.name, l.dtype)).collect();
            writeln!(f, "Locals: {}", locals.join(", "))?;
        }
        writeln!(f, "Output: {}", self.output)?;
        writeln!(f, "FP mode: {}", self.pragmas.fp)?;
        writeln!(f)?;
        writeln!(f, "body:")?;
        match &self.body {
            Body::Expr(root) => self.write_node(f, *root, 1)?,
            Body::Block(stmts) => self.write_stmts(f, stmts, 1)?,
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
            self.write_node(f, reduction.arg, 1)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Analyzer;
    use crate::parser::Parser;
    use crate::vars::VariableEx;
    use pretty_assertions::assert_eq;

    fn chars(s: &str) -> Vec<u32> {
        s.chars().map(|c| c as u32).collect()
    }

    fn program(source: &str, vars: &[VariableEx]) -> Program {
        let ast = Parser::new(source).parse_program().unwrap();
        Analyzer::new(vars, Dtype::Auto).unwrap().analyze(&ast).unwrap()
    }

    #[test]
    fn test_display_expression_tree() {
        let vars: Vec<VariableEx> = ["a", "b", "c"].iter().map(|n| VariableEx::array(*n, Dtype::Float64)).collect();
        let printed = program("a * b + c", &vars).to_string();
        let expected = "\
Program `expr`
============
Inputs: a: float64, b: float64, c: float64
Output: float64
FP mode: strict

body:
  binary + : float64
    binary * : float64
      input a : float64
      input b : float64
    input c : float64
";
        assert_eq!(printed, expected);
    }

    #[test]
    fn test_display_kernel_statements() {
        let source = "def k(x):\n    i = 0\n    while any(x > i):\n        i += 1\n    return i\n";
        let printed = program(source, &[VariableEx::array("x", Dtype::Int64)]).to_string();
        assert!(printed.starts_with("Program `k`\n"), "{printed}");
        assert!(printed.contains("Locals: i: int64\n"), "{printed}");
        assert!(printed.contains("\n  i =\n"), "{printed}");
        assert!(printed.contains("\n  while\n    reduce 0 : bool\n  do:\n"), "{printed}");
        assert!(printed.contains("\n  return\n    local i : int64\n"), "{printed}");
        assert!(printed.contains("reduction 0 (any -> bool):\n  compare > : bool\n    input x : int64\n"), "{printed}");
    }

    #[test]
    fn test_string_predicates_ignore_padding() {
        let mut padded = chars("abc");
        padded.extend([0, 0]);
        assert!(StrOp::Eq.apply(&padded, &chars("abc")));
        assert!(StrOp::Ne.apply(&padded, &chars("abd")));
        assert!(StrOp::StartsWith.apply(&padded, &chars("ab")));
        assert!(StrOp::EndsWith.apply(&padded, &chars("bc")));
        assert!(StrOp::Contains.apply(&padded, &chars("b")));
        assert!(StrOp::Contains.apply(&padded, &[]));
        assert!(!StrOp::Contains.apply(&chars("ab"), &chars("abc")));
        assert_eq!(trim_nul(&[0, 0]), &[] as &[u32]);
    }
}
