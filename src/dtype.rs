//! Dtype lattice and promotion rules
//!
//! The numeric part of the lattice follows NumPy's promotion table:
//! - bool is the identity element
//! - signed/unsigned mixes widen to the next signed width (`int64 + uint64 -> float64`)
//! - small integers (<= 16 bits) keep `float32`/`complex64`, wider ones force 64-bit floats

use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a variable, literal or intermediate value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    /// Infer from context (declarations and output requests only)
    Auto,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Complex64,
    Complex128,
    /// Fixed-width UCS-4 string
    String,
}

/// Coarse classification used by promotion and validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Auto,
    Bool,
    Signed,
    Unsigned,
    Float,
    Complex,
    String,
}

/// The numeric dtypes in table order
pub const NUMERIC: [Dtype; 13] = [
    Dtype::Bool,
    Dtype::Int8,
    Dtype::Int16,
    Dtype::Int32,
    Dtype::Int64,
    Dtype::UInt8,
    Dtype::UInt16,
    Dtype::UInt32,
    Dtype::UInt64,
    Dtype::Float32,
    Dtype::Float64,
    Dtype::Complex64,
    Dtype::Complex128,
];

impl Dtype {
    pub const fn kind(self) -> Kind {
        match self {
            Dtype::Auto => Kind::Auto,
            Dtype::Bool => Kind::Bool,
            Dtype::Int8 | Dtype::Int16 | Dtype::Int32 | Dtype::Int64 => Kind::Signed,
            Dtype::UInt8 | Dtype::UInt16 | Dtype::UInt32 | Dtype::UInt64 => Kind::Unsigned,
            Dtype::Float32 | Dtype::Float64 => Kind::Float,
            Dtype::Complex64 | Dtype::Complex128 => Kind::Complex,
            Dtype::String => Kind::String,
        }
    }

    /// Width in bits of the scalar (complex counts both parts)
    pub const fn bits(self) -> u32 {
        match self {
            Dtype::Auto | Dtype::String => 0,
            Dtype::Bool | Dtype::Int8 | Dtype::UInt8 => 8,
            Dtype::Int16 | Dtype::UInt16 => 16,
            Dtype::Int32 | Dtype::UInt32 | Dtype::Float32 => 32,
            Dtype::Int64 | Dtype::UInt64 | Dtype::Float64 | Dtype::Complex64 => 64,
            Dtype::Complex128 => 128,
        }
    }

    /// Size of one element in bytes (strings report 0, their width is per variable)
    pub const fn itemsize(self) -> usize {
        (self.bits() / 8) as usize
    }

    pub const fn is_bool(self) -> bool {
        matches!(self, Dtype::Bool)
    }

    pub const fn is_signed(self) -> bool {
        matches!(self.kind(), Kind::Signed)
    }

    pub const fn is_unsigned(self) -> bool {
        matches!(self.kind(), Kind::Unsigned)
    }

    pub const fn is_integer(self) -> bool {
        matches!(self.kind(), Kind::Signed | Kind::Unsigned)
    }

    pub const fn is_float(self) -> bool {
        matches!(self.kind(), Kind::Float)
    }

    pub const fn is_complex(self) -> bool {
        matches!(self.kind(), Kind::Complex)
    }

    /// Bool, integer, float or complex
    pub const fn is_numeric(self) -> bool {
        !matches!(self.kind(), Kind::Auto | Kind::String)
    }

    /// Integer or bool: values with an exact integral representation
    pub const fn is_integral(self) -> bool {
        matches!(self.kind(), Kind::Bool | Kind::Signed | Kind::Unsigned)
    }

    const fn table_index(self) -> usize {
        match self {
            Dtype::Bool => 0,
            Dtype::Int8 => 1,
            Dtype::Int16 => 2,
            Dtype::Int32 => 3,
            Dtype::Int64 => 4,
            Dtype::UInt8 => 5,
            Dtype::UInt16 => 6,
            Dtype::UInt32 => 7,
            Dtype::UInt64 => 8,
            Dtype::Float32 => 9,
            Dtype::Float64 => 10,
            Dtype::Complex64 => 11,
            Dtype::Complex128 => 12,
            Dtype::Auto | Dtype::String => usize::MAX,
        }
    }

    /// Signed integer of the given width
    const fn signed_of(bits: u32) -> Dtype {
        match bits {
            8 => Dtype::Int8,
            16 => Dtype::Int16,
            32 => Dtype::Int32,
            _ => Dtype::Int64,
        }
    }

    /// Real component dtype: complex64 -> float32, complex128 -> float64, others unchanged
    pub const fn real_part(self) -> Dtype {
        match self {
            Dtype::Complex64 => Dtype::Float32,
            Dtype::Complex128 => Dtype::Float64,
            other => other,
        }
    }

    /// Result dtype of floating-point math on this dtype
    pub const fn float_result(self) -> Dtype {
        match self {
            Dtype::Float32 | Dtype::Complex64 | Dtype::Complex128 => self,
            _ => Dtype::Float64,
        }
    }

    /// Complex dtype able to hold this dtype
    pub const fn complex_result(self) -> Dtype {
        match self {
            Dtype::Bool | Dtype::Int8 | Dtype::Int16 | Dtype::UInt8 | Dtype::UInt16 => {
                Dtype::Complex64
            }
            Dtype::Float32 | Dtype::Complex64 => Dtype::Complex64,
            _ => Dtype::Complex128,
        }
    }

    /// Whether an integer value is representable exactly
    pub fn holds_int(self, value: i64) -> bool {
        match self {
            Dtype::Bool => value == 0 || value == 1,
            Dtype::Int8 => i8::try_from(value).is_ok(),
            Dtype::Int16 => i16::try_from(value).is_ok(),
            Dtype::Int32 => i32::try_from(value).is_ok(),
            Dtype::Int64 => true,
            Dtype::UInt8 => u8::try_from(value).is_ok(),
            Dtype::UInt16 => u16::try_from(value).is_ok(),
            Dtype::UInt32 => u32::try_from(value).is_ok(),
            Dtype::UInt64 => value >= 0,
            Dtype::Float32 | Dtype::Float64 | Dtype::Complex64 | Dtype::Complex128 => true,
            Dtype::Auto | Dtype::String => false,
        }
    }

    /// Canonical lowercase name
    pub const fn name(self) -> &'static str {
        match self {
            Dtype::Auto => "auto",
            Dtype::Bool => "bool",
            Dtype::Int8 => "int8",
            Dtype::Int16 => "int16",
            Dtype::Int32 => "int32",
            Dtype::Int64 => "int64",
            Dtype::UInt8 => "uint8",
            Dtype::UInt16 => "uint16",
            Dtype::UInt32 => "uint32",
            Dtype::UInt64 => "uint64",
            Dtype::Float32 => "float32",
            Dtype::Float64 => "float64",
            Dtype::Complex64 => "complex64",
            Dtype::Complex128 => "complex128",
            Dtype::String => "string",
        }
    }

    /// Parse a dtype name (`float64`, `f64`, `uint8`, `u8`, ...)
    pub fn from_name(name: &str) -> Option<Dtype> {
        let dtype = match name {
            "auto" => Dtype::Auto,
            "bool" => Dtype::Bool,
            "int8" | "i8" => Dtype::Int8,
            "int16" | "i16" => Dtype::Int16,
            "int32" | "i32" => Dtype::Int32,
            "int64" | "i64" => Dtype::Int64,
            "uint8" | "u8" => Dtype::UInt8,
            "uint16" | "u16" => Dtype::UInt16,
            "uint32" | "u32" => Dtype::UInt32,
            "uint64" | "u64" => Dtype::UInt64,
            "float32" | "f32" => Dtype::Float32,
            "float64" | "f64" => Dtype::Float64,
            "complex64" | "c64" => Dtype::Complex64,
            "complex128" | "c128" => Dtype::Complex128,
            "string" | "str" => Dtype::String,
            _ => return None,
        };
        Some(dtype)
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const fn promote_rule(a: Dtype, b: Dtype) -> Dtype {
    let (ka, kb) = (a.kind(), b.kind());
    match (ka, kb) {
        (Kind::Bool, _) => b,
        (_, Kind::Bool) => a,
        (Kind::Signed, Kind::Signed) | (Kind::Unsigned, Kind::Unsigned)
        | (Kind::Float, Kind::Float) | (Kind::Complex, Kind::Complex) => {
            if a.bits() >= b.bits() {
                a
            } else {
                b
            }
        }
        (Kind::Signed, Kind::Unsigned) => mixed_sign(a, b),
        (Kind::Unsigned, Kind::Signed) => mixed_sign(b, a),
        (Kind::Signed | Kind::Unsigned, Kind::Float) => int_with_float(a, b),
        (Kind::Float, Kind::Signed | Kind::Unsigned) => int_with_float(b, a),
        (Kind::Signed | Kind::Unsigned, Kind::Complex) => int_with_complex(a, b),
        (Kind::Complex, Kind::Signed | Kind::Unsigned) => int_with_complex(b, a),
        (Kind::Float, Kind::Complex) => float_with_complex(a, b),
        (Kind::Complex, Kind::Float) => float_with_complex(b, a),
        _ => Dtype::Auto,
    }
}

const fn mixed_sign(signed: Dtype, unsigned: Dtype) -> Dtype {
    if signed.bits() > unsigned.bits() {
        signed
    } else if unsigned.bits() < 64 {
        Dtype::signed_of(unsigned.bits() * 2)
    } else {
        Dtype::Float64
    }
}

const fn int_with_float(int: Dtype, float: Dtype) -> Dtype {
    if int.bits() <= 16 {
        float
    } else {
        Dtype::Float64
    }
}

const fn int_with_complex(int: Dtype, complex: Dtype) -> Dtype {
    if int.bits() <= 16 {
        complex
    } else {
        Dtype::Complex128
    }
}

const fn float_with_complex(float: Dtype, complex: Dtype) -> Dtype {
    if matches!(float, Dtype::Float64) {
        Dtype::Complex128
    } else {
        complex
    }
}

const fn build_table() -> [[Dtype; 13]; 13] {
    let mut table = [[Dtype::Auto; 13]; 13];
    let mut i = 0;
    while i < 13 {
        let mut j = 0;
        while j < 13 {
            table[i][j] = promote_rule(NUMERIC[i], NUMERIC[j]);
            j += 1;
        }
        i += 1;
    }
    table
}

/// Promotion table indexed by the order of [`NUMERIC`]
pub static PROMOTION_TABLE: [[Dtype; 13]; 13] = build_table();

/// Promote two numeric dtypes. Returns `None` when either side is a string or `Auto`.
pub fn promote(a: Dtype, b: Dtype) -> Option<Dtype> {
    if !a.is_numeric() || !b.is_numeric() {
        return None;
    }
    Some(PROMOTION_TABLE[a.table_index()][b.table_index()])
}

/// Smallest dtype holding an integer literal, NumPy `min_scalar_type` style
pub fn min_int_dtype(value: i64) -> Dtype {
    if value >= 0 {
        if value <= u8::MAX as i64 {
            Dtype::UInt8
        } else if value <= u16::MAX as i64 {
            Dtype::UInt16
        } else if value <= u32::MAX as i64 {
            Dtype::UInt32
        } else {
            Dtype::Int64
        }
    } else if value >= i8::MIN as i64 {
        Dtype::Int8
    } else if value >= i16::MIN as i64 {
        Dtype::Int16
    } else if value >= i32::MIN as i64 {
        Dtype::Int32
    } else {
        Dtype::Int64
    }
}

/// Smallest signed dtype holding an integer literal
pub fn min_signed_dtype(value: i64) -> Dtype {
    if i8::try_from(value).is_ok() {
        Dtype::Int8
    } else if i16::try_from(value).is_ok() {
        Dtype::Int16
    } else if i32::try_from(value).is_ok() {
        Dtype::Int32
    } else {
        Dtype::Int64
    }
}
