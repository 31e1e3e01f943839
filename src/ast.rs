//! Syntax tree for expressions and kernels
//!
//! Nodes live in two arenas (expressions and statements) and refer to each other
//! through [`ExprId`] / [`StmtId`] handles.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::arena::{Arena, Handle};
use crate::error::Pos;
use crate::ops::{BinaryOp, CompareOp, UnaryOp};

pub type ExprId = Handle<ExprNode>;
pub type StmtId = Handle<StmtNode>;

/// A sequence of statements
pub type Block = Vec<StmtId>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOp {
    And,
    Or,
}

/// Expression types
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    /// Imaginary literal: `2j`
    Imag(f64),
    Bool(bool),
    Str(String),
    /// Variable, local, parameter or constant reference
    Name(String),
    Unary { op: UnaryOp, operand: ExprId },
    Binary { op: BinaryOp, lhs: ExprId, rhs: ExprId },
    Compare { op: CompareOp, lhs: ExprId, rhs: ExprId },
    /// `and` / `or`, evaluated without short-circuit
    Logical { op: LogicalOp, lhs: ExprId, rhs: ExprId },
    /// Builtin, reduction, cast or user function call
    Call { name: String, args: Vec<ExprId> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExprNode {
    pub expr: Expr,
    pub pos: Pos,
}

/// Statement types
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `name = expr` (augmented assignments are desugared)
    Assign { target: String, value: ExprId },
    /// Expression evaluated for its value (the result of a statement sequence)
    Expr(ExprId),
    /// `print(...)`: parsed and checked, never evaluated
    Print(Vec<ExprId>),
    If {
        branches: Vec<(ExprId, Block)>,
        orelse: Option<Block>,
    },
    /// `for var in range(args...)`
    For { var: String, args: Vec<ExprId>, body: Block },
    While { cond: ExprId, body: Block },
    Break,
    Continue,
    Return(ExprId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StmtNode {
    pub stmt: Stmt,
    pub pos: Pos,
}

/// Floating-point contraction mode from `# me:fp=`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FpMode {
    #[default]
    Strict,
    /// Fuse `a * b + c` on floats
    Contract,
    /// Same code generation as `Contract`
    Fast,
}

impl FpMode {
    pub fn allows_contraction(self) -> bool {
        !matches!(self, FpMode::Strict)
    }
}

/// Evaluation dialect from `# me:dialect=`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Vector,
    Element,
}

/// Compilation settings collected from `# me:` pragmas
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pragmas {
    pub fp: FpMode,
    pub dialect: Dialect,
    /// Preferred native compiler, forwarded to the JIT host
    pub compiler: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub pos: Pos,
}

/// Top-level shape of a source program
#[derive(Debug, Clone, PartialEq)]
pub enum Form {
    /// A single bare expression
    Expression(ExprId),
    /// Simple statements ending in an expression or a `result` assignment
    Statements(Block),
    /// `def name(params): body`
    Kernel {
        name: String,
        params: Vec<Param>,
        body: Block,
    },
}

/// A parsed program
#[derive(Debug, Clone)]
pub struct Ast {
    pub exprs: Arena<ExprNode>,
    pub stmts: Arena<StmtNode>,
    pub form: Form,
    pub pragmas: Pragmas,
}

impl Ast {
    pub fn expr(&self, id: ExprId) -> &ExprNode {
        &self.exprs[id]
    }

    pub fn stmt(&self, id: StmtId) -> &StmtNode {
        &self.stmts[id]
    }

    /// Whether the program uses DSL statements (anything beyond a bare expression)
    pub fn is_dsl(&self) -> bool {
        !matches!(self.form, Form::Expression(_))
    }

    /// Render an expression back to source-like text
    pub fn display_expr(&self, id: ExprId) -> String {
        let node = self.expr(id);
        match &node.expr {
            Expr::Int(v) => v.to_string(),
            Expr::Float(v) => format!("{:?}", v),
            Expr::Imag(v) => format!("{}j", v),
            Expr::Bool(v) => if *v { "True" } else { "False" }.to_string(),
            Expr::Str(s) => format!("{:?}", s),
            Expr::Name(name) => name.clone(),
            Expr::Unary { op, operand } => {
                let symbol = match op {
                    UnaryOp::Neg => "-",
                    UnaryOp::BitNot => "~",
                    UnaryOp::Not => "not ",
                };
                format!("{}{}", symbol, self.display_expr(*operand))
            }
            Expr::Binary { op, lhs, rhs } => {
                format!("({} {} {})", self.display_expr(*lhs), op, self.display_expr(*rhs))
            }
            Expr::Compare { op, lhs, rhs } => {
                format!("({} {} {})", self.display_expr(*lhs), op, self.display_expr(*rhs))
            }
            Expr::Logical { op, lhs, rhs } => {
                let word = match op {
                    LogicalOp::And => "and",
                    LogicalOp::Or => "or",
                };
                format!("({} {} {})", self.display_expr(*lhs), word, self.display_expr(*rhs))
            }
            Expr::Call { name, args } => {
                let args: Vec<String> = args.iter().map(|a| self.display_expr(*a)).collect();
                format!("{}({})", name, args.join(", "))
            }
        }
    }
}

impl fmt::Display for FpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FpMode::Strict => write!(f, "strict"),
            FpMode::Contract => write!(f, "contract"),
            FpMode::Fast => write!(f, "fast"),
        }
    }
}
