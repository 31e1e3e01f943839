//! Reductions and their accumulators
//!
//! Both the interpreter and the kernel machine fold values through the same
//! [`Accumulator`], so their results agree bit for bit.

use num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::dtype::{Dtype, Kind};
use crate::ops::{self, BinaryOp, CompareOp};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReductionKind {
    Sum,
    Prod,
    Min,
    Max,
    Any,
    All,
    Mean,
}

impl ReductionKind {
    pub fn from_name(name: &str) -> Option<ReductionKind> {
        let kind = match name {
            "sum" => ReductionKind::Sum,
            "prod" => ReductionKind::Prod,
            "min" => ReductionKind::Min,
            "max" => ReductionKind::Max,
            "any" => ReductionKind::Any,
            "all" => ReductionKind::All,
            "mean" => ReductionKind::Mean,
            _ => return None,
        };
        Some(kind)
    }

    pub fn name(self) -> &'static str {
        match self {
            ReductionKind::Sum => "sum",
            ReductionKind::Prod => "prod",
            ReductionKind::Min => "min",
            ReductionKind::Max => "max",
            ReductionKind::Any => "any",
            ReductionKind::All => "all",
            ReductionKind::Mean => "mean",
        }
    }

    /// Result dtype for an argument of dtype `arg`, `None` if the reduction is undefined for it
    pub fn result_dtype(self, arg: Dtype) -> Option<Dtype> {
        if !arg.is_numeric() {
            return None;
        }
        let dtype = match (self, arg.kind()) {
            (ReductionKind::Sum | ReductionKind::Prod, Kind::Bool | Kind::Signed) => Dtype::Int64,
            (ReductionKind::Sum | ReductionKind::Prod, Kind::Unsigned) => Dtype::UInt64,
            (ReductionKind::Sum | ReductionKind::Prod, _) => arg,
            (ReductionKind::Min | ReductionKind::Max, Kind::Complex) => return None,
            (ReductionKind::Min | ReductionKind::Max, _) => arg,
            (ReductionKind::Any | ReductionKind::All, _) => Dtype::Bool,
            (ReductionKind::Mean, Kind::Complex) => Dtype::Complex128,
            (ReductionKind::Mean, _) => Dtype::Float64,
        };
        Some(dtype)
    }
}

impl fmt::Display for ReductionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Largest value of a real dtype (`+inf` for floats)
fn upper_bound(dtype: Dtype) -> Value {
    match dtype {
        Dtype::Bool => Value::Bool(true),
        Dtype::Int8 => Value::Int8(i8::MAX),
        Dtype::Int16 => Value::Int16(i16::MAX),
        Dtype::Int32 => Value::Int32(i32::MAX),
        Dtype::Int64 => Value::Int64(i64::MAX),
        Dtype::UInt8 => Value::UInt8(u8::MAX),
        Dtype::UInt16 => Value::UInt16(u16::MAX),
        Dtype::UInt32 => Value::UInt32(u32::MAX),
        Dtype::UInt64 => Value::UInt64(u64::MAX),
        Dtype::Float32 => Value::Float32(f32::INFINITY),
        _ => Value::Float64(f64::INFINITY).cast(dtype),
    }
}

/// Smallest value of a real dtype (`-inf` for floats)
fn lower_bound(dtype: Dtype) -> Value {
    match dtype {
        Dtype::Bool => Value::Bool(false),
        Dtype::Int8 => Value::Int8(i8::MIN),
        Dtype::Int16 => Value::Int16(i16::MIN),
        Dtype::Int32 => Value::Int32(i32::MIN),
        Dtype::Int64 => Value::Int64(i64::MIN),
        Dtype::UInt8 | Dtype::UInt16 | Dtype::UInt32 | Dtype::UInt64 => Value::zero(dtype),
        Dtype::Float32 => Value::Float32(f32::NEG_INFINITY),
        _ => Value::Float64(f64::NEG_INFINITY).cast(dtype),
    }
}

fn is_nan(value: &Value) -> bool {
    match value {
        Value::Float32(v) => v.is_nan(),
        Value::Float64(v) => v.is_nan(),
        _ => false,
    }
}

/// Running state of one reduction over one call
#[derive(Debug, Clone)]
pub struct Accumulator {
    kind: ReductionKind,
    dtype: Dtype,
    acc: Value,
    count: u64,
}

impl Accumulator {
    /// Start a reduction producing `dtype` (the kind's result dtype)
    pub fn new(kind: ReductionKind, dtype: Dtype) -> Self {
        let acc = match kind {
            ReductionKind::Sum | ReductionKind::Mean => Value::zero(dtype),
            ReductionKind::Prod => Value::Bool(true).cast(dtype),
            ReductionKind::Min => upper_bound(dtype),
            ReductionKind::Max => lower_bound(dtype),
            ReductionKind::Any => Value::Bool(false),
            ReductionKind::All => Value::Bool(true),
        };
        Self {
            kind,
            dtype,
            acc,
            count: 0,
        }
    }

    pub fn push(&mut self, value: Value) {
        self.count += 1;
        match self.kind {
            ReductionKind::Sum | ReductionKind::Mean => {
                self.acc = ops::binary(BinaryOp::Add, self.acc, value.cast(self.dtype));
            }
            ReductionKind::Prod => {
                self.acc = ops::binary(BinaryOp::Mul, self.acc, value.cast(self.dtype));
            }
            ReductionKind::Min | ReductionKind::Max => {
                if is_nan(&self.acc) {
                    return;
                }
                let value = value.cast(self.dtype);
                let op = if self.kind == ReductionKind::Min {
                    CompareOp::Lt
                } else {
                    CompareOp::Gt
                };
                if is_nan(&value) || ops::compare(op, value, self.acc) {
                    self.acc = value;
                }
            }
            ReductionKind::Any => {
                self.acc = Value::Bool(self.acc.is_truthy() || value.is_truthy());
            }
            ReductionKind::All => {
                self.acc = Value::Bool(self.acc.is_truthy() && value.is_truthy());
            }
        }
    }

    pub fn finish(self) -> Value {
        if self.kind != ReductionKind::Mean {
            return self.acc;
        }
        if self.count == 0 {
            return match self.dtype {
                Dtype::Complex128 => Value::Complex128(Complex::new(f64::NAN, f64::NAN)),
                _ => Value::Float64(f64::NAN),
            };
        }
        let count = Value::Float64(self.count as f64).cast(self.dtype);
        ops::binary(BinaryOp::Div, self.acc, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn reduce(kind: ReductionKind, values: &[Value]) -> Value {
        let arg = values.first().map(Value::dtype).unwrap_or(Dtype::Float64);
        let dtype = kind.result_dtype(arg).unwrap();
        let mut acc = Accumulator::new(kind, dtype);
        for v in values {
            acc.push(*v);
        }
        acc.finish()
    }

    #[test]
    fn test_result_dtypes() {
        assert_eq!(ReductionKind::Sum.result_dtype(Dtype::Int8), Some(Dtype::Int64));
        assert_eq!(ReductionKind::Sum.result_dtype(Dtype::Bool), Some(Dtype::Int64));
        assert_eq!(ReductionKind::Prod.result_dtype(Dtype::UInt16), Some(Dtype::UInt64));
        assert_eq!(ReductionKind::Sum.result_dtype(Dtype::Float32), Some(Dtype::Float32));
        assert_eq!(ReductionKind::Min.result_dtype(Dtype::UInt8), Some(Dtype::UInt8));
        assert_eq!(ReductionKind::Max.result_dtype(Dtype::Complex64), None);
        assert_eq!(ReductionKind::Any.result_dtype(Dtype::Float64), Some(Dtype::Bool));
        assert_eq!(ReductionKind::Mean.result_dtype(Dtype::Int32), Some(Dtype::Float64));
        assert_eq!(ReductionKind::Mean.result_dtype(Dtype::Complex64), Some(Dtype::Complex128));
        assert_eq!(ReductionKind::Sum.result_dtype(Dtype::String), None);
    }

    #[test]
    fn test_empty_identities() {
        let empty = |kind: ReductionKind, dtype: Dtype| {
            Accumulator::new(kind, kind.result_dtype(dtype).unwrap()).finish()
        };
        assert_eq!(empty(ReductionKind::Sum, Dtype::Int32), Value::Int64(0));
        assert_eq!(empty(ReductionKind::Prod, Dtype::Float64), Value::Float64(1.0));
        assert_eq!(empty(ReductionKind::Min, Dtype::Int16), Value::Int16(i16::MAX));
        assert_eq!(empty(ReductionKind::Min, Dtype::Float32), Value::Float32(f32::INFINITY));
        assert_eq!(empty(ReductionKind::Max, Dtype::UInt8), Value::UInt8(0));
        assert_eq!(empty(ReductionKind::Max, Dtype::Float64), Value::Float64(f64::NEG_INFINITY));
        assert_eq!(empty(ReductionKind::Any, Dtype::Int64), Value::Bool(false));
        assert_eq!(empty(ReductionKind::All, Dtype::Int64), Value::Bool(true));
        assert!(empty(ReductionKind::Mean, Dtype::Float64).as_f64().is_nan());
    }

    #[test]
    fn test_folding() {
        let ints = [Value::Int32(3), Value::Int32(-1), Value::Int32(7)];
        assert_eq!(reduce(ReductionKind::Sum, &ints), Value::Int64(9));
        assert_eq!(reduce(ReductionKind::Prod, &ints), Value::Int64(-21));
        assert_eq!(reduce(ReductionKind::Min, &ints), Value::Int32(-1));
        assert_eq!(reduce(ReductionKind::Max, &ints), Value::Int32(7));
        assert_eq!(reduce(ReductionKind::Mean, &ints), Value::Float64(3.0));

        let flags = [Value::Bool(false), Value::Bool(true)];
        assert_eq!(reduce(ReductionKind::Any, &flags), Value::Bool(true));
        assert_eq!(reduce(ReductionKind::All, &flags), Value::Bool(false));
        assert_eq!(reduce(ReductionKind::Sum, &flags), Value::Int64(1));
    }

    #[test]
    fn test_nan_propagates_through_min_max() {
        let values = [Value::Float64(1.0), Value::Float64(f64::NAN), Value::Float64(-5.0)];
        assert!(reduce(ReductionKind::Min, &values).as_f64().is_nan());
        assert!(reduce(ReductionKind::Max, &values).as_f64().is_nan());
    }
}
