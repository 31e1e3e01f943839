//! Builtin elementwise functions
//!
//! Name resolution, dtype signatures and per-dtype evaluation. Arguments reaching
//! [`Builtin::apply`] are already cast to the operand dtype chosen by
//! [`Builtin::signature`].

use num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::f64::consts::{LN_10, LN_2};
use std::fmt;

use crate::dtype::{Dtype, Kind};
use crate::simd::{MathBackend, Precision, Transcendental};
use crate::value::Value;

/// Apply `$body` to a float value, leaving other values unchanged
macro_rules! map_float {
    ($x:expr, $v:ident => $body:expr) => {
        match $x {
            Value::Float32($v) => Value::Float32($body),
            Value::Float64($v) => Value::Float64($body),
            other => other,
        }
    };
}

/// Apply `$body` to two floats of the same width
macro_rules! zip_float {
    ($x:expr, $y:expr, $a:ident, $b:ident => $body:expr) => {
        match ($x, $y) {
            (Value::Float32($a), Value::Float32($b)) => Value::Float32($body),
            (Value::Float64($a), Value::Float64($b)) => Value::Float64($body),
            (other, _) => other,
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Builtin {
    /// One-argument routine served by the math backend
    Math(Transcendental),
    Sqrt,
    Abs,
    Sign,
    Square,
    Ceil,
    Floor,
    Round,
    Rint,
    Trunc,
    Atan2,
    Hypot,
    Copysign,
    Fmod,
    Fmax,
    Fmin,
    Logaddexp,
    Fma,
    Real,
    Imag,
    Conj,
}

impl Builtin {
    /// Resolve a function name (including `arc*` aliases)
    pub fn lookup(name: &str) -> Option<Builtin> {
        use Transcendental as T;
        let builtin = match name {
            "sin" => Builtin::Math(T::Sin),
            "cos" => Builtin::Math(T::Cos),
            "tan" => Builtin::Math(T::Tan),
            "asin" | "arcsin" => Builtin::Math(T::Asin),
            "acos" | "arccos" => Builtin::Math(T::Acos),
            "atan" | "arctan" => Builtin::Math(T::Atan),
            "sinh" => Builtin::Math(T::Sinh),
            "cosh" => Builtin::Math(T::Cosh),
            "tanh" => Builtin::Math(T::Tanh),
            "asinh" | "arcsinh" => Builtin::Math(T::Asinh),
            "acosh" | "arccosh" => Builtin::Math(T::Acosh),
            "atanh" | "arctanh" => Builtin::Math(T::Atanh),
            "exp" => Builtin::Math(T::Exp),
            "exp2" => Builtin::Math(T::Exp2),
            "exp10" => Builtin::Math(T::Exp10),
            "expm1" => Builtin::Math(T::Expm1),
            "log" | "ln" => Builtin::Math(T::Ln),
            "log2" => Builtin::Math(T::Log2),
            "log10" => Builtin::Math(T::Log10),
            "log1p" => Builtin::Math(T::Log1p),
            "cbrt" => Builtin::Math(T::Cbrt),
            "sinpi" => Builtin::Math(T::Sinpi),
            "cospi" => Builtin::Math(T::Cospi),
            "sqrt" => Builtin::Sqrt,
            "abs" => Builtin::Abs,
            "sign" => Builtin::Sign,
            "square" => Builtin::Square,
            "ceil" => Builtin::Ceil,
            "floor" => Builtin::Floor,
            "round" => Builtin::Round,
            "rint" => Builtin::Rint,
            "trunc" => Builtin::Trunc,
            "atan2" | "arctan2" => Builtin::Atan2,
            "hypot" => Builtin::Hypot,
            "copysign" => Builtin::Copysign,
            "fmod" => Builtin::Fmod,
            "fmax" => Builtin::Fmax,
            "fmin" => Builtin::Fmin,
            "logaddexp" => Builtin::Logaddexp,
            "fma" => Builtin::Fma,
            "real" => Builtin::Real,
            "imag" => Builtin::Imag,
            "conj" => Builtin::Conj,
            _ => return None,
        };
        Some(builtin)
    }

    pub fn arity(self) -> usize {
        match self {
            Builtin::Atan2
            | Builtin::Hypot
            | Builtin::Copysign
            | Builtin::Fmod
            | Builtin::Fmax
            | Builtin::Fmin
            | Builtin::Logaddexp => 2,
            Builtin::Fma => 3,
            _ => 1,
        }
    }

    pub fn name(self) -> &'static str {
        use Transcendental as T;
        match self {
            Builtin::Math(f) => match f {
                T::Sin => "sin",
                T::Cos => "cos",
                T::Tan => "tan",
                T::Asin => "asin",
                T::Acos => "acos",
                T::Atan => "atan",
                T::Sinh => "sinh",
                T::Cosh => "cosh",
                T::Tanh => "tanh",
                T::Asinh => "asinh",
                T::Acosh => "acosh",
                T::Atanh => "atanh",
                T::Exp => "exp",
                T::Exp2 => "exp2",
                T::Exp10 => "exp10",
                T::Expm1 => "expm1",
                T::Ln => "log",
                T::Log2 => "log2",
                T::Log10 => "log10",
                T::Log1p => "log1p",
                T::Cbrt => "cbrt",
                T::Sinpi => "sinpi",
                T::Cospi => "cospi",
            },
            Builtin::Sqrt => "sqrt",
            Builtin::Abs => "abs",
            Builtin::Sign => "sign",
            Builtin::Square => "square",
            Builtin::Ceil => "ceil",
            Builtin::Floor => "floor",
            Builtin::Round => "round",
            Builtin::Rint => "rint",
            Builtin::Trunc => "trunc",
            Builtin::Atan2 => "atan2",
            Builtin::Hypot => "hypot",
            Builtin::Copysign => "copysign",
            Builtin::Fmod => "fmod",
            Builtin::Fmax => "fmax",
            Builtin::Fmin => "fmin",
            Builtin::Logaddexp => "logaddexp",
            Builtin::Fma => "fma",
            Builtin::Real => "real",
            Builtin::Imag => "imag",
            Builtin::Conj => "conj",
        }
    }

    /// Operand and result dtype for arguments promoted to `promoted`
    pub fn signature(self, promoted: Dtype) -> Option<(Dtype, Dtype)> {
        let kind = promoted.kind();
        if !promoted.is_numeric() {
            return None;
        }
        let float = promoted.float_result();
        match self {
            Builtin::Math(f) => match kind {
                Kind::Complex if supports_complex(f) => Some((promoted, promoted)),
                Kind::Complex => None,
                _ => Some((float, float)),
            },
            Builtin::Sqrt => Some((float, float)),
            Builtin::Abs => Some((promoted, promoted.real_part())),
            Builtin::Sign | Builtin::Square => match kind {
                Kind::Bool => Some((Dtype::Int64, Dtype::Int64)),
                Kind::Complex if self == Builtin::Sign => None,
                _ => Some((promoted, promoted)),
            },
            Builtin::Ceil | Builtin::Floor | Builtin::Round | Builtin::Rint | Builtin::Trunc => {
                match kind {
                    Kind::Complex => None,
                    _ => Some((promoted, promoted)),
                }
            }
            Builtin::Fmax | Builtin::Fmin => match kind {
                Kind::Complex => None,
                _ => Some((promoted, promoted)),
            },
            Builtin::Atan2
            | Builtin::Hypot
            | Builtin::Copysign
            | Builtin::Fmod
            | Builtin::Logaddexp
            | Builtin::Fma => match kind {
                Kind::Complex => None,
                _ => Some((float, float)),
            },
            Builtin::Real | Builtin::Imag => Some((promoted, promoted.real_part())),
            Builtin::Conj => Some((promoted, promoted)),
        }
    }

    /// Evaluate on arguments already cast to the operand dtype
    pub fn apply(self, args: &[Value], backend: &MathBackend) -> Value {
        let x = args.first().copied().unwrap_or(Value::Bool(false));
        let y = args.get(1).copied().unwrap_or(x);
        match self {
            Builtin::Math(f) => math(f, x, backend),
            Builtin::Sqrt => match x {
                Value::Complex64(z) => Value::Complex64(z.sqrt()),
                Value::Complex128(z) => Value::Complex128(z.sqrt()),
                other => map_float!(other, v => v.sqrt()),
            },
            Builtin::Abs => match x {
                Value::Int8(v) => Value::Int8(v.wrapping_abs()),
                Value::Int16(v) => Value::Int16(v.wrapping_abs()),
                Value::Int32(v) => Value::Int32(v.wrapping_abs()),
                Value::Int64(v) => Value::Int64(v.wrapping_abs()),
                Value::Complex64(z) => Value::Float32(z.norm()),
                Value::Complex128(z) => Value::Float64(z.norm()),
                other => map_float!(other, v => v.abs()),
            },
            Builtin::Sign => match x {
                Value::Int8(v) => Value::Int8(v.signum()),
                Value::Int16(v) => Value::Int16(v.signum()),
                Value::Int32(v) => Value::Int32(v.signum()),
                Value::Int64(v) => Value::Int64(v.signum()),
                Value::UInt8(v) => Value::UInt8(v.min(1)),
                Value::UInt16(v) => Value::UInt16(v.min(1)),
                Value::UInt32(v) => Value::UInt32(v.min(1)),
                Value::UInt64(v) => Value::UInt64(v.min(1)),
                other => map_float!(other, v => if v == 0.0 || v.is_nan() { v } else { v.signum() }),
            },
            Builtin::Square => crate::ops::binary(crate::ops::BinaryOp::Mul, x, x),
            Builtin::Ceil => map_float!(x, v => v.ceil()),
            Builtin::Floor => map_float!(x, v => v.floor()),
            Builtin::Round | Builtin::Rint => map_float!(x, v => v.round_ties_even()),
            Builtin::Trunc => map_float!(x, v => v.trunc()),
            Builtin::Atan2 => zip_float!(x, y, a, b => a.atan2(b)),
            Builtin::Hypot => zip_float!(x, y, a, b => a.hypot(b)),
            Builtin::Copysign => zip_float!(x, y, a, b => a.copysign(b)),
            Builtin::Fmod => zip_float!(x, y, a, b => a % b),
            Builtin::Logaddexp => zip_float!(x, y, a, b => logaddexp(a as f64, b as f64) as _),
            Builtin::Fmax => match (x, y) {
                (Value::Float32(_), _) | (Value::Float64(_), _) => zip_float!(x, y, a, b => a.max(b)),
                _ if crate::ops::compare(crate::ops::CompareOp::Ge, x, y) => x,
                _ => y,
            },
            Builtin::Fmin => match (x, y) {
                (Value::Float32(_), _) | (Value::Float64(_), _) => zip_float!(x, y, a, b => a.min(b)),
                _ if crate::ops::compare(crate::ops::CompareOp::Le, x, y) => x,
                _ => y,
            },
            Builtin::Fma => {
                let z = args.get(2).copied().unwrap_or(x);
                match (x, y, z) {
                    (Value::Float32(a), Value::Float32(b), Value::Float32(c)) => {
                        Value::Float32(a.mul_add(b, c))
                    }
                    (Value::Float64(a), Value::Float64(b), Value::Float64(c)) => {
                        Value::Float64(a.mul_add(b, c))
                    }
                    _ => crate::ops::fused_mul_add(x, y, z),
                }
            }
            Builtin::Real => match x {
                Value::Complex64(z) => Value::Float32(z.re),
                Value::Complex128(z) => Value::Float64(z.re),
                other => other,
            },
            Builtin::Imag => match x {
                Value::Complex64(z) => Value::Float32(z.im),
                Value::Complex128(z) => Value::Float64(z.im),
                other => Value::zero(other.dtype()),
            },
            Builtin::Conj => match x {
                Value::Complex64(z) => Value::Complex64(z.conj()),
                Value::Complex128(z) => Value::Complex128(z.conj()),
                other => other,
            },
        }
    }
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `log(exp(a) + exp(b))` without overflow
fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + LN_2;
    }
    let d = a - b;
    if d > 0.0 {
        a + (-d).exp().ln_1p()
    } else if d <= 0.0 {
        b + d.exp().ln_1p()
    } else {
        d
    }
}

/// Whether a transcendental routine is defined on complex arguments
pub fn supports_complex(f: Transcendental) -> bool {
    use Transcendental as T;
    matches!(
        f,
        T::Sin
            | T::Cos
            | T::Tan
            | T::Asin
            | T::Acos
            | T::Atan
            | T::Sinh
            | T::Cosh
            | T::Tanh
            | T::Asinh
            | T::Acosh
            | T::Atanh
            | T::Exp
            | T::Ln
            | T::Log10
    )
}

macro_rules! complex_math {
    ($f:expr, $z:expr, $ln10:expr, $nan:expr) => {{
        let z = $z;
        match $f {
            Transcendental::Sin => z.sin(),
            Transcendental::Cos => z.cos(),
            Transcendental::Tan => z.tan(),
            Transcendental::Asin => z.asin(),
            Transcendental::Acos => z.acos(),
            Transcendental::Atan => z.atan(),
            Transcendental::Sinh => z.sinh(),
            Transcendental::Cosh => z.cosh(),
            Transcendental::Tanh => z.tanh(),
            Transcendental::Asinh => z.asinh(),
            Transcendental::Acosh => z.acosh(),
            Transcendental::Atanh => z.atanh(),
            Transcendental::Exp => z.exp(),
            Transcendental::Ln => z.ln(),
            Transcendental::Log10 => z.ln() / $ln10,
            _ => Complex::new($nan, $nan),
        }
    }};
}

fn math(f: Transcendental, x: Value, backend: &MathBackend) -> Value {
    match x {
        Value::Float32(v) => Value::Float32(backend.eval_f32(f, v)),
        Value::Float64(v) => Value::Float64(backend.eval_f64(f, v)),
        Value::Complex64(z) => match backend.precision {
            Precision::Ulp10 => {
                let wide = complex_math!(f, Complex::new(z.re as f64, z.im as f64), LN_10, f64::NAN);
                Value::Complex64(Complex::new(wide.re as f32, wide.im as f32))
            }
            Precision::Ulp35 => Value::Complex64(complex_math!(f, z, std::f32::consts::LN_10, f32::NAN)),
        },
        Value::Complex128(z) => Value::Complex128(complex_math!(f, z, LN_10, f64::NAN)),
        other => Value::Float64(backend.eval_f64(f, other.as_f64())),
    }
}

/// Target dtype of a cast call: `int`, `float`, `bool`, `complex` or a dtype name
pub fn cast_target(name: &str) -> Option<Dtype> {
    match name {
        "int" => Some(Dtype::Int64),
        "float" => Some(Dtype::Float64),
        "bool" => Some(Dtype::Bool),
        "complex" => Some(Dtype::Complex128),
        _ => Dtype::from_name(name).filter(|d| d.is_numeric() && d.name() == name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn apply(name: &str, args: &[Value]) -> Value {
        Builtin::lookup(name).unwrap().apply(args, &MathBackend::default())
    }

    #[test]
    fn test_lookup_and_aliases() {
        assert_eq!(Builtin::lookup("arcsinh"), Some(Builtin::Math(Transcendental::Asinh)));
        assert_eq!(Builtin::lookup("ln"), Builtin::lookup("log"));
        assert_eq!(Builtin::lookup("arctan2"), Some(Builtin::Atan2));
        assert_eq!(Builtin::lookup("sum"), None);
        assert_eq!(Builtin::Fma.arity(), 3);
        assert_eq!(Builtin::Math(Transcendental::Ln).to_string(), "log");
    }

    #[test]
    fn test_signatures() {
        let asinh = Builtin::Math(Transcendental::Asinh);
        assert_eq!(asinh.signature(Dtype::Int64), Some((Dtype::Float64, Dtype::Float64)));
        assert_eq!(asinh.signature(Dtype::Float32), Some((Dtype::Float32, Dtype::Float32)));
        assert_eq!(
            Builtin::Math(Transcendental::Exp).signature(Dtype::Complex64),
            Some((Dtype::Complex64, Dtype::Complex64))
        );
        assert_eq!(Builtin::Math(Transcendental::Cbrt).signature(Dtype::Complex128), None);
        assert_eq!(Builtin::Abs.signature(Dtype::Complex128), Some((Dtype::Complex128, Dtype::Float64)));
        assert_eq!(Builtin::Floor.signature(Dtype::Int32), Some((Dtype::Int32, Dtype::Int32)));
        assert_eq!(Builtin::Hypot.signature(Dtype::UInt8), Some((Dtype::Float64, Dtype::Float64)));
        assert_eq!(Builtin::Sqrt.signature(Dtype::String), None);
    }

    #[test]
    fn test_apply() {
        assert_eq!(apply("abs", &[Value::Int16(-4)]), Value::Int16(4));
        assert_eq!(apply("sign", &[Value::Float64(-0.5)]), Value::Float64(-1.0));
        assert_eq!(apply("round", &[Value::Float64(2.5)]), Value::Float64(2.0));
        assert_eq!(apply("trunc", &[Value::Float32(-2.7)]), Value::Float32(-2.0));
        assert_eq!(apply("fmod", &[Value::Float64(-7.0), Value::Float64(3.0)]), Value::Float64(-1.0));
        assert_eq!(apply("fmax", &[Value::Float64(f64::NAN), Value::Float64(1.0)]), Value::Float64(1.0));
        assert_eq!(apply("fmin", &[Value::Int32(3), Value::Int32(-2)]), Value::Int32(-2));
        assert_eq!(apply("hypot", &[Value::Float64(3.0), Value::Float64(4.0)]), Value::Float64(5.0));
        assert_eq!(
            apply("fma", &[Value::Float64(2.0), Value::Float64(3.0), Value::Float64(1.0)]),
            Value::Float64(7.0)
        );
        assert_eq!(apply("imag", &[Value::Int32(5)]), Value::Int32(0));
        assert_eq!(
            apply("conj", &[Value::Complex128(Complex::new(1.0, 2.0))]),
            Value::Complex128(Complex::new(1.0, -2.0))
        );
        assert_eq!(apply("abs", &[Value::Complex128(Complex::new(3.0, 4.0))]), Value::Float64(5.0));
    }

    #[test]
    fn test_logaddexp() {
        let r = apply("logaddexp", &[Value::Float64(1000.0), Value::Float64(1000.0)]).as_f64();
        assert!((r - (1000.0 + std::f64::consts::LN_2)).abs() < 1e-9);
        let r = apply("logaddexp", &[Value::Float64(0.0), Value::Float64(-1.0)]).as_f64();
        assert!((r - (1.0f64 + (-1.0f64).exp()).ln()).abs() < 1e-12);
    }

    #[test]
    fn test_cast_targets() {
        assert_eq!(cast_target("int"), Some(Dtype::Int64));
        assert_eq!(cast_target("float32"), Some(Dtype::Float32));
        assert_eq!(cast_target("f32"), None);
        assert_eq!(cast_target("string"), None);
    }
}
