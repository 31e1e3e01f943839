//! Scalar values carried through evaluation
//!
//! A [`Value`] is one element of one dtype. Casting follows C conversion rules:
//! integer narrowing wraps, float to integer truncates toward zero and saturates
//! (NaN becomes 0), and complex to real keeps the real part.

use num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::dtype::Dtype;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Complex64(Complex<f32>),
    Complex128(Complex<f64>),
}

/// Convert any real value with `as` semantics (bools go through `u8`)
macro_rules! real_as {
    ($value:expr, $t:ty) => {
        match $value {
            Value::Bool(v) => (v as u8) as $t,
            Value::Int8(v) => v as $t,
            Value::Int16(v) => v as $t,
            Value::Int32(v) => v as $t,
            Value::Int64(v) => v as $t,
            Value::UInt8(v) => v as $t,
            Value::UInt16(v) => v as $t,
            Value::UInt32(v) => v as $t,
            Value::UInt64(v) => v as $t,
            Value::Float32(v) => v as $t,
            Value::Float64(v) => v as $t,
            Value::Complex64(c) => c.re as $t,
            Value::Complex128(c) => c.re as $t,
        }
    };
}

/// Convert into a complex number with components of type `$t`
macro_rules! complex_as {
    ($value:expr, $t:ty) => {
        match $value {
            Value::Complex64(c) => Complex::new(c.re as $t, c.im as $t),
            Value::Complex128(c) => Complex::new(c.re as $t, c.im as $t),
            other => Complex::new(real_as!(other, $t), 0.0),
        }
    };
}

impl Value {
    pub fn dtype(&self) -> Dtype {
        match self {
            Value::Bool(_) => Dtype::Bool,
            Value::Int8(_) => Dtype::Int8,
            Value::Int16(_) => Dtype::Int16,
            Value::Int32(_) => Dtype::Int32,
            Value::Int64(_) => Dtype::Int64,
            Value::UInt8(_) => Dtype::UInt8,
            Value::UInt16(_) => Dtype::UInt16,
            Value::UInt32(_) => Dtype::UInt32,
            Value::UInt64(_) => Dtype::UInt64,
            Value::Float32(_) => Dtype::Float32,
            Value::Float64(_) => Dtype::Float64,
            Value::Complex64(_) => Dtype::Complex64,
            Value::Complex128(_) => Dtype::Complex128,
        }
    }

    /// Additive identity of a dtype. Strings and `Auto` fall back to `Bool(false)`.
    pub fn zero(dtype: Dtype) -> Value {
        Value::Bool(false).cast(dtype)
    }

    /// Cast to another dtype with C conversion semantics.
    /// Non-numeric targets leave the value unchanged.
    pub fn cast(self, to: Dtype) -> Value {
        match to {
            Dtype::Bool => Value::Bool(self.is_truthy()),
            Dtype::Int8 => Value::Int8(real_as!(self, i8)),
            Dtype::Int16 => Value::Int16(real_as!(self, i16)),
            Dtype::Int32 => Value::Int32(real_as!(self, i32)),
            Dtype::Int64 => Value::Int64(real_as!(self, i64)),
            Dtype::UInt8 => Value::UInt8(real_as!(self, u8)),
            Dtype::UInt16 => Value::UInt16(real_as!(self, u16)),
            Dtype::UInt32 => Value::UInt32(real_as!(self, u32)),
            Dtype::UInt64 => Value::UInt64(real_as!(self, u64)),
            Dtype::Float32 => Value::Float32(real_as!(self, f32)),
            Dtype::Float64 => Value::Float64(real_as!(self, f64)),
            Dtype::Complex64 => Value::Complex64(complex_as!(self, f32)),
            Dtype::Complex128 => Value::Complex128(complex_as!(self, f64)),
            Dtype::Auto | Dtype::String => self,
        }
    }

    /// Nonzero test used by conditions, `bool()` and logical operators
    pub fn is_truthy(&self) -> bool {
        match *self {
            Value::Bool(v) => v,
            Value::Int8(v) => v != 0,
            Value::Int16(v) => v != 0,
            Value::Int32(v) => v != 0,
            Value::Int64(v) => v != 0,
            Value::UInt8(v) => v != 0,
            Value::UInt16(v) => v != 0,
            Value::UInt32(v) => v != 0,
            Value::UInt64(v) => v != 0,
            Value::Float32(v) => v != 0.0,
            Value::Float64(v) => v != 0.0,
            Value::Complex64(c) => c.re != 0.0 || c.im != 0.0,
            Value::Complex128(c) => c.re != 0.0 || c.im != 0.0,
        }
    }

    pub fn as_i64(&self) -> i64 {
        real_as!(*self, i64)
    }

    pub fn as_f64(&self) -> f64 {
        real_as!(*self, f64)
    }

    pub fn as_complex(&self) -> Complex<f64> {
        complex_as!(*self, f64)
    }

    /// Bit-exact equality (NaN payloads compare equal to themselves)
    pub fn bit_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Float32(a), Value::Float32(b)) => a.to_bits() == b.to_bits(),
            (Value::Float64(a), Value::Float64(b)) => a.to_bits() == b.to_bits(),
            (Value::Complex64(a), Value::Complex64(b)) => {
                a.re.to_bits() == b.re.to_bits() && a.im.to_bits() == b.im.to_bits()
            }
            (Value::Complex128(a), Value::Complex128(b)) => {
                a.re.to_bits() == b.re.to_bits() && a.im.to_bits() == b.im.to_bits()
            }
            _ => self == other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int8(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::UInt8(v) => write!(f, "{}", v),
            Value::UInt16(v) => write!(f, "{}", v),
            Value::UInt32(v) => write!(f, "{}", v),
            Value::UInt64(v) => write!(f, "{}", v),
            Value::Float32(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::Complex64(c) => write!(f, "{}{:+}j", c.re, c.im),
            Value::Complex128(c) => write!(f, "{}{:+}j", c.re, c.im),
        }
    }
}

/// Rust scalar types that map one-to-one onto a numeric dtype
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: Dtype;

    fn into_value(self) -> Value;

    /// Convert with C semantics from any value
    fn from_value(value: Value) -> Self;
}

macro_rules! real_element {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl Element for $t {
                const DTYPE: Dtype = Dtype::$variant;

                fn into_value(self) -> Value {
                    Value::$variant(self)
                }

                fn from_value(value: Value) -> Self {
                    real_as!(value, $t)
                }
            }

            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

real_element! {
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    u8 => UInt8,
    u16 => UInt16,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float32,
    f64 => Float64,
}

impl Element for bool {
    const DTYPE: Dtype = Dtype::Bool;

    fn into_value(self) -> Value {
        Value::Bool(self)
    }

    fn from_value(value: Value) -> Self {
        value.is_truthy()
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl Element for Complex<f32> {
    const DTYPE: Dtype = Dtype::Complex64;

    fn into_value(self) -> Value {
        Value::Complex64(self)
    }

    fn from_value(value: Value) -> Self {
        complex_as!(value, f32)
    }
}

impl Element for Complex<f64> {
    const DTYPE: Dtype = Dtype::Complex128;

    fn into_value(self) -> Value {
        Value::Complex128(self)
    }

    fn from_value(value: Value) -> Self {
        complex_as!(value, f64)
    }
}
