//! Operators and their per-dtype semantics
//!
//! Operands reaching these functions already share one dtype (the analyzer inserts
//! the casts). Integer arithmetic wraps, integer division and modulo by zero yield 0,
//! and `//` / `%` follow the sign of the divisor like Python.

use num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ast::LogicalOp;
use crate::dtype::{Dtype, Kind};
use crate::value::{Element, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    /// `~`: logical on bool, bitwise on integers
    BitNot,
    /// `not`: operand is already bool
    Not,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
        }
    }

    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor | BinaryOp::Shl | BinaryOp::Shr
        )
    }

    /// Operand and result dtype for operands promoted to `promoted`.
    /// `None` when the operator is undefined for that dtype.
    pub fn signature(self, promoted: Dtype) -> Option<(Dtype, Dtype)> {
        let kind = promoted.kind();
        match self {
            BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor => match kind {
                Kind::Bool | Kind::Signed | Kind::Unsigned => Some((promoted, promoted)),
                _ => None,
            },
            BinaryOp::Shl | BinaryOp::Shr => match kind {
                Kind::Signed | Kind::Unsigned => Some((promoted, promoted)),
                _ => None,
            },
            BinaryOp::Div => match kind {
                Kind::Bool | Kind::Signed | Kind::Unsigned => Some((Dtype::Float64, Dtype::Float64)),
                Kind::Float | Kind::Complex => Some((promoted, promoted)),
                _ => None,
            },
            BinaryOp::FloorDiv | BinaryOp::Mod => match kind {
                Kind::Bool => Some((Dtype::Int64, Dtype::Int64)),
                Kind::Signed | Kind::Unsigned | Kind::Float => Some((promoted, promoted)),
                _ => None,
            },
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Pow => match kind {
                Kind::Bool => Some((Dtype::Int64, Dtype::Int64)),
                Kind::Signed | Kind::Unsigned | Kind::Float | Kind::Complex => {
                    Some((promoted, promoted))
                }
                _ => None,
            },
        }
    }
}

impl CompareOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    pub fn is_equality(self) -> bool {
        matches!(self, CompareOp::Eq | CompareOp::Ne)
    }
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::BitNot => "~",
            UnaryOp::Not => "not",
        }
    }

    /// Operand and result dtype for an operand of dtype `operand`
    pub fn signature(self, operand: Dtype) -> Option<(Dtype, Dtype)> {
        match (self, operand.kind()) {
            (UnaryOp::Neg, Kind::Bool) => Some((Dtype::Int64, Dtype::Int64)),
            (UnaryOp::Neg, Kind::Signed | Kind::Unsigned | Kind::Float | Kind::Complex) => {
                Some((operand, operand))
            }
            (UnaryOp::BitNot, Kind::Bool | Kind::Signed | Kind::Unsigned) => {
                Some((operand, operand))
            }
            (UnaryOp::Not, _) if operand.is_numeric() => Some((Dtype::Bool, Dtype::Bool)),
            _ => None,
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

fn ipow(base: i64, exp: i64) -> i64 {
    if exp < 0 {
        return match base {
            1 => 1,
            -1 if exp % 2 == 0 => 1,
            -1 => -1,
            _ => 0,
        };
    }
    upow(base as u64, exp as u64) as i64
}

fn upow(mut base: u64, mut exp: u64) -> u64 {
    let mut acc: u64 = 1;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = acc.wrapping_mul(base);
        }
        base = base.wrapping_mul(base);
        exp >>= 1;
    }
    acc
}

fn signed_binary(op: BinaryOp, x: i64, y: i64, bits: u32) -> i64 {
    match op {
        BinaryOp::Add => x.wrapping_add(y),
        BinaryOp::Sub => x.wrapping_sub(y),
        BinaryOp::Mul => x.wrapping_mul(y),
        BinaryOp::FloorDiv => {
            if y == 0 {
                return 0;
            }
            let q = x.wrapping_div(y);
            if x.wrapping_rem(y) != 0 && ((x < 0) != (y < 0)) {
                q.wrapping_sub(1)
            } else {
                q
            }
        }
        BinaryOp::Mod => {
            if y == 0 {
                return 0;
            }
            let r = x.wrapping_rem(y);
            if r != 0 && ((r < 0) != (y < 0)) {
                r.wrapping_add(y)
            } else {
                r
            }
        }
        BinaryOp::Pow => ipow(x, y),
        BinaryOp::BitAnd => x & y,
        BinaryOp::BitOr => x | y,
        BinaryOp::BitXor => x ^ y,
        BinaryOp::Shl => {
            if y < 0 || y >= bits as i64 {
                0
            } else {
                x.wrapping_shl(y as u32)
            }
        }
        BinaryOp::Shr => {
            if y < 0 || y >= bits as i64 {
                if x < 0 {
                    -1
                } else {
                    0
                }
            } else {
                x >> y
            }
        }
        // true division never reaches the integer path
        BinaryOp::Div => {
            if y == 0 {
                0
            } else {
                x.wrapping_div(y)
            }
        }
    }
}

fn unsigned_binary(op: BinaryOp, x: u64, y: u64, bits: u32) -> u64 {
    match op {
        BinaryOp::Add => x.wrapping_add(y),
        BinaryOp::Sub => x.wrapping_sub(y),
        BinaryOp::Mul => x.wrapping_mul(y),
        BinaryOp::FloorDiv | BinaryOp::Div => x.checked_div(y).unwrap_or(0),
        BinaryOp::Mod => x.checked_rem(y).unwrap_or(0),
        BinaryOp::Pow => upow(x, y),
        BinaryOp::BitAnd => x & y,
        BinaryOp::BitOr => x | y,
        BinaryOp::BitXor => x ^ y,
        BinaryOp::Shl => {
            if y >= bits as u64 {
                0
            } else {
                x << y
            }
        }
        BinaryOp::Shr => {
            if y >= bits as u64 {
                0
            } else {
                x >> y
            }
        }
    }
}

macro_rules! float_binary {
    ($op:expr, $x:expr, $y:expr) => {{
        let (x, y) = ($x, $y);
        match $op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            BinaryOp::FloorDiv => (x / y).floor(),
            BinaryOp::Mod => {
                let r = x % y;
                if r != 0.0 && ((r < 0.0) != (y < 0.0)) {
                    r + y
                } else {
                    r
                }
            }
            BinaryOp::Pow => x.powf(y),
            // bitwise operators are rejected for floats at compile time
            _ => f64::NAN as _,
        }
    }};
}

macro_rules! complex_binary {
    ($op:expr, $x:expr, $y:expr, $t:ty) => {{
        let (x, y): (Complex<$t>, Complex<$t>) = ($x, $y);
        match $op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            BinaryOp::Pow => {
                if y.re == 0.0 && y.im == 0.0 {
                    Complex::new(1.0, 0.0)
                } else if x.re == 0.0 && x.im == 0.0 {
                    Complex::new(0.0, 0.0)
                } else {
                    x.powc(y)
                }
            }
            _ => Complex::new(<$t>::NAN, <$t>::NAN),
        }
    }};
}

/// Apply a binary operator. `b` is cast to the dtype of `a` if they differ.
pub fn binary(op: BinaryOp, a: Value, b: Value) -> Value {
    let dtype = a.dtype();
    let b = if b.dtype() == dtype { b } else { b.cast(dtype) };
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => match op {
            BinaryOp::BitAnd => Value::Bool(x & y),
            BinaryOp::BitOr => Value::Bool(x | y),
            BinaryOp::BitXor => Value::Bool(x ^ y),
            _ => binary(op, a.cast(Dtype::Int64), b.cast(Dtype::Int64)),
        },
        (Value::Float32(x), Value::Float32(y)) => Value::Float32(float_binary!(op, x, y)),
        (Value::Float64(x), Value::Float64(y)) => Value::Float64(float_binary!(op, x, y)),
        (Value::Complex64(x), Value::Complex64(y)) => {
            Value::Complex64(complex_binary!(op, x, y, f32))
        }
        (Value::Complex128(x), Value::Complex128(y)) => {
            Value::Complex128(complex_binary!(op, x, y, f64))
        }
        _ if dtype.is_signed() => {
            let r = signed_binary(op, a.as_i64(), b.as_i64(), dtype.bits());
            Value::Int64(r).cast(dtype)
        }
        _ => {
            let r = unsigned_binary(op, u64::from_value(a), u64::from_value(b), dtype.bits());
            Value::UInt64(r).cast(dtype)
        }
    }
}

/// Fused `a * b + c` with a single rounding on floats
pub fn fused_mul_add(a: Value, b: Value, c: Value) -> Value {
    match (a, b.cast(a.dtype()), c.cast(a.dtype())) {
        (Value::Float32(x), Value::Float32(y), Value::Float32(z)) => Value::Float32(x.mul_add(y, z)),
        (Value::Float64(x), Value::Float64(y), Value::Float64(z)) => Value::Float64(x.mul_add(y, z)),
        _ => binary(BinaryOp::Add, binary(BinaryOp::Mul, a, b), c),
    }
}

pub fn unary(op: UnaryOp, a: Value) -> Value {
    match (op, a) {
        (UnaryOp::Not, v) => Value::Bool(!v.is_truthy()),
        (UnaryOp::BitNot, Value::Bool(v)) => Value::Bool(!v),
        (UnaryOp::Neg, Value::Bool(_)) => unary(op, a.cast(Dtype::Int64)),
        (UnaryOp::Neg, Value::Float32(v)) => Value::Float32(-v),
        (UnaryOp::Neg, Value::Float64(v)) => Value::Float64(-v),
        (UnaryOp::Neg, Value::Complex64(v)) => Value::Complex64(-v),
        (UnaryOp::Neg, Value::Complex128(v)) => Value::Complex128(-v),
        (UnaryOp::Neg, v) if v.dtype().is_signed() => Value::Int64(v.as_i64().wrapping_neg()).cast(v.dtype()),
        (UnaryOp::Neg, v) => Value::UInt64(u64::from_value(v).wrapping_neg()).cast(v.dtype()),
        (UnaryOp::BitNot, v) if v.dtype().is_signed() => Value::Int64(!v.as_i64()).cast(v.dtype()),
        (UnaryOp::BitNot, v) if v.dtype().is_unsigned() => {
            Value::UInt64(!u64::from_value(v)).cast(v.dtype())
        }
        (UnaryOp::BitNot, v) => v,
    }
}

macro_rules! ordered {
    ($op:expr, $x:expr, $y:expr) => {
        match $op {
            CompareOp::Eq => $x == $y,
            CompareOp::Ne => $x != $y,
            CompareOp::Lt => $x < $y,
            CompareOp::Le => $x <= $y,
            CompareOp::Gt => $x > $y,
            CompareOp::Ge => $x >= $y,
        }
    };
}

/// Compare two values of the same dtype (`b` is cast to `a`'s dtype if needed).
/// Complex values only support equality; ordering comparisons on them are false.
/// `and` / `or` on truthiness; both operands are already evaluated
pub fn logical(op: LogicalOp, a: Value, b: Value) -> Value {
    Value::Bool(match op {
        LogicalOp::And => a.is_truthy() && b.is_truthy(),
        LogicalOp::Or => a.is_truthy() || b.is_truthy(),
    })
}

pub fn compare(op: CompareOp, a: Value, b: Value) -> bool {
    let b = if b.dtype() == a.dtype() { b } else { b.cast(a.dtype()) };
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => ordered!(op, x, y),
        (Value::Int8(x), Value::Int8(y)) => ordered!(op, x, y),
        (Value::Int16(x), Value::Int16(y)) => ordered!(op, x, y),
        (Value::Int32(x), Value::Int32(y)) => ordered!(op, x, y),
        (Value::Int64(x), Value::Int64(y)) => ordered!(op, x, y),
        (Value::UInt8(x), Value::UInt8(y)) => ordered!(op, x, y),
        (Value::UInt16(x), Value::UInt16(y)) => ordered!(op, x, y),
        (Value::UInt32(x), Value::UInt32(y)) => ordered!(op, x, y),
        (Value::UInt64(x), Value::UInt64(y)) => ordered!(op, x, y),
        (Value::Float32(x), Value::Float32(y)) => ordered!(op, x, y),
        (Value::Float64(x), Value::Float64(y)) => ordered!(op, x, y),
        (Value::Complex64(x), Value::Complex64(y)) => match op {
            CompareOp::Eq => x == y,
            CompareOp::Ne => x != y,
            _ => false,
        },
        (Value::Complex128(x), Value::Complex128(y)) => match op {
            CompareOp::Eq => x == y,
            CompareOp::Ne => x != y,
            _ => false,
        },
        _ => false,
    }
}
