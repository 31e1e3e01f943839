//! Transcendental math backend
//!
//! Two process-wide knobs select the backend (see [`crate::config`]):
//! - precision: `Ulp10` runs the long polynomials in float64 (float32 data
//!   included), `Ulp35` runs the short float64 polynomials and native float32 ones
//! - vectorization: columns are mapped through AVX2 lanes when the CPU has them
//!
//! exp, exp2, log, log2, log10, sin and cos use the polynomial kernels in
//! `approx`; the remaining functions use the platform routines. A lane computes
//! exactly what the scalar kernel computes, so the interpreter, the kernel
//! machine and the column path agree bit for bit under the same precision.

use serde::{Deserialize, Serialize};
use std::f32::consts::PI as PI32;
use std::f64::consts::PI;

use crate::approx::{self, single};

/// Error bound of the transcendental routines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// About 1.0 ULP
    #[default]
    Ulp10,
    /// About 3.5 ULP
    Ulp35,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transcendental {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Asinh,
    Acosh,
    Atanh,
    Exp,
    Exp2,
    Exp10,
    Expm1,
    Ln,
    Log2,
    Log10,
    Log1p,
    Cbrt,
    Sinpi,
    Cospi,
}

/// Active backend, built from a configuration snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MathBackend {
    pub precision: Precision,
    pub vectorized: bool,
}

impl Default for MathBackend {
    fn default() -> Self {
        Self {
            precision: Precision::Ulp10,
            vectorized: true,
        }
    }
}

fn sinpi64(x: f64) -> f64 {
    let r = x % 2.0;
    if r == r.trunc() {
        return 0.0f64.copysign(x);
    }
    (PI * r).sin()
}

fn cospi64(x: f64) -> f64 {
    let r = x.abs() % 2.0;
    if r == 0.5 || r == 1.5 {
        return 0.0;
    }
    (PI * r).cos()
}

fn sinpi32(x: f32) -> f32 {
    let r = x % 2.0;
    if r == r.trunc() {
        return 0.0f32.copysign(x);
    }
    (PI32 * r).sin()
}

fn cospi32(x: f32) -> f32 {
    let r = x.abs() % 2.0;
    if r == 0.5 || r == 1.5 {
        return 0.0;
    }
    (PI32 * r).cos()
}

macro_rules! platform {
    ($func:expr, $x:expr, $t:ty, $sinpi:ident, $cospi:ident) => {{
        let x: $t = $x;
        match $func {
            Transcendental::Sin => x.sin(),
            Transcendental::Cos => x.cos(),
            Transcendental::Tan => x.tan(),
            Transcendental::Asin => x.asin(),
            Transcendental::Acos => x.acos(),
            Transcendental::Atan => x.atan(),
            Transcendental::Sinh => x.sinh(),
            Transcendental::Cosh => x.cosh(),
            Transcendental::Tanh => x.tanh(),
            Transcendental::Asinh => x.asinh(),
            Transcendental::Acosh => x.acosh(),
            Transcendental::Atanh => x.atanh(),
            Transcendental::Exp => x.exp(),
            Transcendental::Exp2 => x.exp2(),
            Transcendental::Exp10 => (10.0 as $t).powf(x),
            Transcendental::Expm1 => x.exp_m1(),
            Transcendental::Ln => x.ln(),
            Transcendental::Log2 => x.log2(),
            Transcendental::Log10 => x.log10(),
            Transcendental::Log1p => x.ln_1p(),
            Transcendental::Cbrt => x.cbrt(),
            Transcendental::Sinpi => $sinpi(x),
            Transcendental::Cospi => $cospi(x),
        }
    }};
}

impl MathBackend {
    pub fn new(precision: Precision, vectorized: bool) -> Self {
        Self {
            precision,
            vectorized,
        }
    }

    /// Identifying name of the backend
    pub fn name(&self) -> &'static str {
        match (self.vectorized, self.precision) {
            (true, Precision::Ulp10) => "simd-u10",
            (true, Precision::Ulp35) => "simd-u35",
            (false, Precision::Ulp10) => "scalar-u10",
            (false, Precision::Ulp35) => "scalar-u35",
        }
    }

    fn fine(&self) -> bool {
        self.precision == Precision::Ulp10
    }

    pub fn eval_f64(&self, func: Transcendental, x: f64) -> f64 {
        let fine = self.fine();
        match func {
            Transcendental::Exp => approx::exp(x, fine),
            Transcendental::Exp2 => approx::exp2(x, fine),
            Transcendental::Ln => approx::ln(x, fine),
            Transcendental::Log2 => approx::log2(x, fine),
            Transcendental::Log10 => approx::log10(x, fine),
            Transcendental::Sin => approx::sin(x, fine),
            Transcendental::Cos => approx::cos(x, fine),
            _ => platform!(func, x, f64, sinpi64, cospi64),
        }
    }

    pub fn eval_f32(&self, func: Transcendental, x: f32) -> f32 {
        match self.precision {
            Precision::Ulp10 => self.eval_f64(func, x as f64) as f32,
            Precision::Ulp35 => match func {
                Transcendental::Exp => single::exp(x),
                Transcendental::Exp2 => single::exp2(x),
                Transcendental::Ln => single::ln(x),
                Transcendental::Log2 => single::log2(x),
                Transcendental::Log10 => single::log10(x),
                Transcendental::Sin => single::sin(x),
                Transcendental::Cos => single::cos(x),
                _ => platform!(func, x, f32, sinpi32, cospi32),
            },
        }
    }

    /// Map a float64 column. `dst` must be at least as long as `src`.
    pub fn map_f64(&self, func: Transcendental, src: &[f64], dst: &mut [f64]) {
        let dst = &mut dst[..src.len()];
        let done = if self.vectorized {
            lanes_f64(func, self.fine(), src, dst)
        } else {
            0
        };
        for (d, &x) in dst[..done].iter_mut().zip(&src[..done]) {
            if beyond_reduction(func, x) {
                *d = self.eval_f64(func, x);
            }
        }
        for (d, &x) in dst[done..].iter_mut().zip(&src[done..]) {
            *d = self.eval_f64(func, x);
        }
    }

    /// Map a float32 column. `dst` must be at least as long as `src`.
    pub fn map_f32(&self, func: Transcendental, src: &[f32], dst: &mut [f32]) {
        let dst = &mut dst[..src.len()];
        let done = match (self.vectorized, self.precision) {
            (false, _) => 0,
            (true, Precision::Ulp10) => lanes_f32_wide(func, src, dst),
            (true, Precision::Ulp35) => lanes_f32(func, src, dst),
        };
        for (d, &x) in dst[..done].iter_mut().zip(&src[..done]) {
            let beyond = match self.precision {
                Precision::Ulp10 => beyond_reduction(func, x as f64),
                Precision::Ulp35 => {
                    matches!(func, Transcendental::Sin | Transcendental::Cos) && !(x.abs() <= single::SINCOS_LIMIT)
                }
            };
            if beyond {
                *d = self.eval_f32(func, x);
            }
        }
        for (d, &x) in dst[done..].iter_mut().zip(&src[done..]) {
            *d = self.eval_f32(func, x);
        }
    }
}

/// Lanes whose sin/cos argument is past the reduction range are left to the scalar path
fn beyond_reduction(func: Transcendental, x: f64) -> bool {
    matches!(func, Transcendental::Sin | Transcendental::Cos) && !(x.abs() <= approx::SINCOS_LIMIT)
}

#[cfg(target_arch = "x86_64")]
fn lanes_f64(func: Transcendental, fine: bool, src: &[f64], dst: &mut [f64]) -> usize {
    if std::is_x86_feature_detected!("avx2") {
        // SAFETY: guarded by runtime feature detection.
        unsafe { avx2::map_f64(func, fine, src, dst) }
    } else {
        0
    }
}

#[cfg(target_arch = "x86_64")]
fn lanes_f32_wide(func: Transcendental, src: &[f32], dst: &mut [f32]) -> usize {
    if std::is_x86_feature_detected!("avx2") {
        // SAFETY: guarded by runtime feature detection.
        unsafe { avx2::map_f32_wide(func, src, dst) }
    } else {
        0
    }
}

#[cfg(target_arch = "x86_64")]
fn lanes_f32(func: Transcendental, src: &[f32], dst: &mut [f32]) -> usize {
    if std::is_x86_feature_detected!("avx2") {
        // SAFETY: guarded by runtime feature detection.
        unsafe { avx2::map_f32(func, src, dst) }
    } else {
        0
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn lanes_f64(_func: Transcendental, _fine: bool, _src: &[f64], _dst: &mut [f64]) -> usize {
    0
}

#[cfg(not(target_arch = "x86_64"))]
fn lanes_f32_wide(_func: Transcendental, _src: &[f32], _dst: &mut [f32]) -> usize {
    0
}

#[cfg(not(target_arch = "x86_64"))]
fn lanes_f32(_func: Transcendental, _src: &[f32], _dst: &mut [f32]) -> usize {
    0
}

#[cfg(target_arch = "x86_64")]
/// AVX2 versions of the `approx` kernels.
///
/// Each routine repeats the scalar kernel's operations in the same order. The
/// `map_*` entry points write the leading whole vectors of a column and return
/// how many elements they wrote; sin and cos lanes past the reduction range
/// hold placeholders for the caller to overwrite.
///
/// # Safety
///
/// Every function requires AVX2 and `dst.len() >= src.len()`.
mod avx2 {
    #![allow(unsafe_op_in_unsafe_fn)]

    use std::arch::x86_64::*;
    use std::f64::consts::{FRAC_2_PI, LN_2, LOG10_E, LOG2_E, SQRT_2};

    use super::Transcendental;
    use crate::approx::{self, single, COS_POLY, EXP_POLY, LOG_POLY, SIN_POLY};

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn splat(v: f64) -> __m256d {
        _mm256_set1_pd(v)
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn horner(x: __m256d, terms: &[f64]) -> __m256d {
        let mut acc = _mm256_setzero_pd();
        for &c in terms {
            acc = _mm256_add_pd(_mm256_mul_pd(acc, x), splat(c));
        }
        acc
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn clamp(x: __m256d, lo: f64, hi: f64) -> __m256d {
        _mm256_min_pd(_mm256_max_pd(x, splat(lo)), splat(hi))
    }

    /// Integer left in the mantissa by the shifter
    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn shifted_int(t: __m256d) -> __m256i {
        _mm256_sub_epi64(_mm256_castpd_si256(t), _mm256_set1_epi64x(approx::SHIFTER_BITS))
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn int_to_f64(n: __m256i) -> __m256d {
        let shifted = _mm256_add_epi64(n, _mm256_set1_epi64x(approx::SHIFTER_BITS));
        _mm256_sub_pd(_mm256_castsi256_pd(shifted), splat(approx::SHIFTER))
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn pow2(n: __m256i) -> __m256d {
        _mm256_castsi256_pd(_mm256_slli_epi64(_mm256_add_epi64(n, _mm256_set1_epi64x(1023)), 52))
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn ldexp(p: __m256d, n: __m256i) -> __m256d {
        // floor(n / 2) for n >= -2048; AVX2 has no 64-bit arithmetic shift
        let biased = _mm256_srli_epi64(_mm256_add_epi64(n, _mm256_set1_epi64x(2048)), 1);
        let half = _mm256_sub_epi64(biased, _mm256_set1_epi64x(1024));
        _mm256_mul_pd(_mm256_mul_pd(p, pow2(half)), pow2(_mm256_sub_epi64(n, half)))
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn keep_nan(x: __m256d, y: __m256d) -> __m256d {
        _mm256_blendv_pd(y, x, _mm256_cmp_pd(x, x, _CMP_UNORD_Q))
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn exp(x: __m256d, terms: &[f64]) -> __m256d {
        let xc = clamp(x, approx::EXP_MIN, approx::EXP_MAX);
        let t = _mm256_add_pd(_mm256_mul_pd(xc, splat(LOG2_E)), splat(approx::SHIFTER));
        let k = _mm256_sub_pd(t, splat(approx::SHIFTER));
        let r = _mm256_sub_pd(
            _mm256_sub_pd(xc, _mm256_mul_pd(k, splat(approx::LN2_HI))),
            _mm256_mul_pd(k, splat(approx::LN2_LO)),
        );
        keep_nan(x, ldexp(horner(r, terms), shifted_int(t)))
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn exp2(x: __m256d, terms: &[f64]) -> __m256d {
        let xc = clamp(x, approx::EXP2_MIN, approx::EXP2_MAX);
        let t = _mm256_add_pd(xc, splat(approx::SHIFTER));
        let k = _mm256_sub_pd(t, splat(approx::SHIFTER));
        let r = _mm256_mul_pd(_mm256_sub_pd(xc, k), splat(LN_2));
        keep_nan(x, ldexp(horner(r, terms), shifted_int(t)))
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn log_parts(x: __m256d, terms: &[f64]) -> (__m256d, __m256d) {
        let tiny = _mm256_cmp_pd(x, splat(f64::MIN_POSITIVE), _CMP_LT_OQ);
        let xs = _mm256_blendv_pd(x, _mm256_mul_pd(x, splat(approx::TWO54)), tiny);
        let bits = _mm256_castpd_si256(xs);
        let biased = _mm256_and_si256(_mm256_srli_epi64(bits, 52), _mm256_set1_epi64x(0x7ff));
        let e = _mm256_sub_epi64(
            _mm256_sub_epi64(biased, _mm256_set1_epi64x(1023)),
            _mm256_and_si256(_mm256_castpd_si256(tiny), _mm256_set1_epi64x(54)),
        );
        let m = _mm256_castsi256_pd(_mm256_or_si256(
            _mm256_and_si256(bits, _mm256_set1_epi64x(approx::MANTISSA_MASK as i64)),
            _mm256_set1_epi64x(approx::ONE_BITS as i64),
        ));
        let big = _mm256_cmp_pd(m, splat(SQRT_2), _CMP_GT_OQ);
        let m = _mm256_blendv_pd(m, _mm256_mul_pd(m, splat(0.5)), big);
        // true lanes are all ones, i.e. -1
        let e = _mm256_sub_epi64(e, _mm256_castpd_si256(big));
        let f = _mm256_sub_pd(m, splat(1.0));
        let s = _mm256_div_pd(f, _mm256_add_pd(splat(2.0), f));
        let z = _mm256_mul_pd(s, s);
        let t = _mm256_mul_pd(z, horner(z, terms));
        let lm = _mm256_sub_pd(f, _mm256_mul_pd(s, _mm256_sub_pd(f, t)));
        (int_to_f64(e), lm)
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn finish_log(x: __m256d, y: __m256d) -> __m256d {
        let y = _mm256_blendv_pd(y, x, _mm256_cmp_pd(x, splat(f64::INFINITY), _CMP_EQ_OQ));
        let invalid = _mm256_or_pd(_mm256_cmp_pd(x, splat(0.0), _CMP_LT_OQ), _mm256_cmp_pd(x, x, _CMP_UNORD_Q));
        let y = _mm256_blendv_pd(y, splat(f64::NAN), invalid);
        _mm256_blendv_pd(y, splat(f64::NEG_INFINITY), _mm256_cmp_pd(x, splat(0.0), _CMP_EQ_OQ))
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn ln(x: __m256d, terms: &[f64]) -> __m256d {
        let (e, lm) = log_parts(x, terms);
        let y = _mm256_add_pd(
            _mm256_mul_pd(e, splat(approx::LN2_HI)),
            _mm256_add_pd(lm, _mm256_mul_pd(e, splat(approx::LN2_LO))),
        );
        finish_log(x, y)
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn log2(x: __m256d, terms: &[f64]) -> __m256d {
        let (e, lm) = log_parts(x, terms);
        finish_log(x, _mm256_add_pd(e, _mm256_mul_pd(lm, splat(LOG2_E))))
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn log10(x: __m256d, terms: &[f64]) -> __m256d {
        let (e, lm) = log_parts(x, terms);
        let y = _mm256_add_pd(
            _mm256_mul_pd(e, splat(approx::LOG10_2_HI)),
            _mm256_add_pd(_mm256_mul_pd(e, splat(approx::LOG10_2_LO)), _mm256_mul_pd(lm, splat(LOG10_E))),
        );
        finish_log(x, y)
    }

    /// Zero the lanes past the reduction range
    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn in_range(x: __m256d) -> __m256d {
        let magnitude = _mm256_andnot_pd(splat(-0.0), x);
        _mm256_and_pd(x, _mm256_cmp_pd(magnitude, splat(approx::SINCOS_LIMIT), _CMP_LE_OQ))
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn sincos(x: __m256d, sin_terms: &[f64], cos_terms: &[f64]) -> (__m256d, __m256d, __m256i) {
        let t = _mm256_add_pd(_mm256_mul_pd(x, splat(FRAC_2_PI)), splat(approx::SHIFTER));
        let k = _mm256_sub_pd(t, splat(approx::SHIFTER));
        let q = _mm256_and_si256(shifted_int(t), _mm256_set1_epi64x(3));
        let r = _mm256_sub_pd(
            _mm256_sub_pd(
                _mm256_sub_pd(x, _mm256_mul_pd(k, splat(approx::PIO2_1))),
                _mm256_mul_pd(k, splat(approx::PIO2_2)),
            ),
            _mm256_mul_pd(k, splat(approx::PIO2_3)),
        );
        let z = _mm256_mul_pd(r, r);
        let s = _mm256_add_pd(r, _mm256_mul_pd(_mm256_mul_pd(r, z), horner(z, sin_terms)));
        let c = _mm256_add_pd(
            _mm256_sub_pd(splat(1.0), _mm256_mul_pd(splat(0.5), z)),
            _mm256_mul_pd(_mm256_mul_pd(z, z), horner(z, cos_terms)),
        );
        (s, c, q)
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn bit_set(q: __m256i, bit: i64) -> __m256d {
        let b = _mm256_set1_epi64x(bit);
        _mm256_castsi256_pd(_mm256_cmpeq_epi64(_mm256_and_si256(q, b), b))
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn sin(x: __m256d, sin_terms: &[f64], cos_terms: &[f64]) -> __m256d {
        let (s, c, q) = sincos(in_range(x), sin_terms, cos_terms);
        let y = _mm256_blendv_pd(s, c, bit_set(q, 1));
        _mm256_blendv_pd(y, _mm256_xor_pd(y, splat(-0.0)), bit_set(q, 2))
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn cos(x: __m256d, sin_terms: &[f64], cos_terms: &[f64]) -> __m256d {
        let (s, c, q) = sincos(in_range(x), sin_terms, cos_terms);
        let y = _mm256_blendv_pd(c, s, bit_set(q, 1));
        let next = _mm256_add_epi64(q, _mm256_set1_epi64x(1));
        _mm256_blendv_pd(y, _mm256_xor_pd(y, splat(-0.0)), bit_set(next, 2))
    }

    /// One float64 kernel over four lanes
    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn kernel(func: Transcendental, fine: bool, x: __m256d) -> __m256d {
        match func {
            Transcendental::Exp => exp(x, EXP_POLY.terms(fine)),
            Transcendental::Exp2 => exp2(x, EXP_POLY.terms(fine)),
            Transcendental::Ln => ln(x, LOG_POLY.terms(fine)),
            Transcendental::Log2 => log2(x, LOG_POLY.terms(fine)),
            Transcendental::Log10 => log10(x, LOG_POLY.terms(fine)),
            Transcendental::Sin => sin(x, SIN_POLY.terms(fine), COS_POLY.terms(fine)),
            _ => cos(x, SIN_POLY.terms(fine), COS_POLY.terms(fine)),
        }
    }

    fn has_kernel(func: Transcendental) -> bool {
        matches!(
            func,
            Transcendental::Exp
                | Transcendental::Exp2
                | Transcendental::Ln
                | Transcendental::Log2
                | Transcendental::Log10
                | Transcendental::Sin
                | Transcendental::Cos
        )
    }

    #[target_feature(enable = "avx2")]
    pub(super) unsafe fn map_f64(func: Transcendental, fine: bool, src: &[f64], dst: &mut [f64]) -> usize {
        if !has_kernel(func) {
            return 0;
        }
        let len = src.len() / 4 * 4;
        let mut i = 0;
        while i < len {
            let x = _mm256_loadu_pd(src.as_ptr().add(i));
            _mm256_storeu_pd(dst.as_mut_ptr().add(i), kernel(func, fine, x));
            i += 4;
        }
        len
    }

    /// Float32 data through the fine float64 kernels
    #[target_feature(enable = "avx2")]
    pub(super) unsafe fn map_f32_wide(func: Transcendental, src: &[f32], dst: &mut [f32]) -> usize {
        if !has_kernel(func) {
            return 0;
        }
        let len = src.len() / 4 * 4;
        let mut i = 0;
        while i < len {
            let x = _mm256_cvtps_pd(_mm_loadu_ps(src.as_ptr().add(i)));
            _mm_storeu_ps(dst.as_mut_ptr().add(i), _mm256_cvtpd_ps(kernel(func, true, x)));
            i += 4;
        }
        len
    }

    // Single precision, eight lanes

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn splat32(v: f32) -> __m256 {
        _mm256_set1_ps(v)
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn horner32(x: __m256, terms: &[f32]) -> __m256 {
        let mut acc = _mm256_setzero_ps();
        for &c in terms {
            acc = _mm256_add_ps(_mm256_mul_ps(acc, x), splat32(c));
        }
        acc
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn shifted_int32(t: __m256) -> __m256i {
        _mm256_sub_epi32(_mm256_castps_si256(t), _mm256_set1_epi32(single::SHIFTER_BITS))
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn pow2_32(n: __m256i) -> __m256 {
        _mm256_castsi256_ps(_mm256_slli_epi32(_mm256_add_epi32(n, _mm256_set1_epi32(127)), 23))
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn ldexp32(p: __m256, n: __m256i) -> __m256 {
        let half = _mm256_srai_epi32(n, 1);
        _mm256_mul_ps(_mm256_mul_ps(p, pow2_32(half)), pow2_32(_mm256_sub_epi32(n, half)))
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn keep_nan32(x: __m256, y: __m256) -> __m256 {
        _mm256_blendv_ps(y, x, _mm256_cmp_ps(x, x, _CMP_UNORD_Q))
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn exp32(x: __m256) -> __m256 {
        let xc = _mm256_min_ps(_mm256_max_ps(x, splat32(single::EXP_MIN)), splat32(single::EXP_MAX));
        let t = _mm256_add_ps(_mm256_mul_ps(xc, splat32(std::f32::consts::LOG2_E)), splat32(single::SHIFTER));
        let k = _mm256_sub_ps(t, splat32(single::SHIFTER));
        let r = _mm256_sub_ps(
            _mm256_sub_ps(xc, _mm256_mul_ps(k, splat32(single::LN2_HI))),
            _mm256_mul_ps(k, splat32(single::LN2_LO)),
        );
        keep_nan32(x, ldexp32(horner32(r, &single::EXP_POLY), shifted_int32(t)))
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn exp2_32(x: __m256) -> __m256 {
        let xc = _mm256_min_ps(_mm256_max_ps(x, splat32(single::EXP2_MIN)), splat32(single::EXP2_MAX));
        let t = _mm256_add_ps(xc, splat32(single::SHIFTER));
        let k = _mm256_sub_ps(t, splat32(single::SHIFTER));
        let r = _mm256_mul_ps(_mm256_sub_ps(xc, k), splat32(std::f32::consts::LN_2));
        keep_nan32(x, ldexp32(horner32(r, &single::EXP_POLY), shifted_int32(t)))
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn log_parts32(x: __m256) -> (__m256, __m256) {
        let tiny = _mm256_cmp_ps(x, splat32(f32::MIN_POSITIVE), _CMP_LT_OQ);
        let xs = _mm256_blendv_ps(x, _mm256_mul_ps(x, splat32(single::TWO25)), tiny);
        let bits = _mm256_castps_si256(xs);
        let biased = _mm256_and_si256(_mm256_srli_epi32(bits, 23), _mm256_set1_epi32(0xff));
        let e = _mm256_sub_epi32(
            _mm256_sub_epi32(biased, _mm256_set1_epi32(127)),
            _mm256_and_si256(_mm256_castps_si256(tiny), _mm256_set1_epi32(25)),
        );
        let m = _mm256_castsi256_ps(_mm256_or_si256(
            _mm256_and_si256(bits, _mm256_set1_epi32(single::MANTISSA_MASK as i32)),
            _mm256_set1_epi32(single::ONE_BITS as i32),
        ));
        let big = _mm256_cmp_ps(m, splat32(std::f32::consts::SQRT_2), _CMP_GT_OQ);
        let m = _mm256_blendv_ps(m, _mm256_mul_ps(m, splat32(0.5)), big);
        let e = _mm256_sub_epi32(e, _mm256_castps_si256(big));
        let f = _mm256_sub_ps(m, splat32(1.0));
        let s = _mm256_div_ps(f, _mm256_add_ps(splat32(2.0), f));
        let z = _mm256_mul_ps(s, s);
        let t = _mm256_mul_ps(z, horner32(z, &single::LOG_POLY));
        let lm = _mm256_sub_ps(f, _mm256_mul_ps(s, _mm256_sub_ps(f, t)));
        let shifted = _mm256_add_epi32(e, _mm256_set1_epi32(single::SHIFTER_BITS));
        (_mm256_sub_ps(_mm256_castsi256_ps(shifted), splat32(single::SHIFTER)), lm)
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn finish_log32(x: __m256, y: __m256) -> __m256 {
        let y = _mm256_blendv_ps(y, x, _mm256_cmp_ps(x, splat32(f32::INFINITY), _CMP_EQ_OQ));
        let invalid = _mm256_or_ps(_mm256_cmp_ps(x, splat32(0.0), _CMP_LT_OQ), _mm256_cmp_ps(x, x, _CMP_UNORD_Q));
        let y = _mm256_blendv_ps(y, splat32(f32::NAN), invalid);
        _mm256_blendv_ps(y, splat32(f32::NEG_INFINITY), _mm256_cmp_ps(x, splat32(0.0), _CMP_EQ_OQ))
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn sincos32(x: __m256) -> (__m256, __m256, __m256i) {
        let magnitude = _mm256_andnot_ps(splat32(-0.0), x);
        let x = _mm256_and_ps(x, _mm256_cmp_ps(magnitude, splat32(single::SINCOS_LIMIT), _CMP_LE_OQ));
        let t = _mm256_add_ps(_mm256_mul_ps(x, splat32(std::f32::consts::FRAC_2_PI)), splat32(single::SHIFTER));
        let k = _mm256_sub_ps(t, splat32(single::SHIFTER));
        let q = _mm256_and_si256(shifted_int32(t), _mm256_set1_epi32(3));
        let r = _mm256_sub_ps(
            _mm256_sub_ps(
                _mm256_sub_ps(x, _mm256_mul_ps(k, splat32(single::PIO2_1))),
                _mm256_mul_ps(k, splat32(single::PIO2_2)),
            ),
            _mm256_mul_ps(k, splat32(single::PIO2_3)),
        );
        let z = _mm256_mul_ps(r, r);
        let s = _mm256_add_ps(r, _mm256_mul_ps(_mm256_mul_ps(r, z), horner32(z, &single::SIN_POLY)));
        let c = _mm256_add_ps(
            _mm256_sub_ps(splat32(1.0), _mm256_mul_ps(splat32(0.5), z)),
            _mm256_mul_ps(_mm256_mul_ps(z, z), horner32(z, &single::COS_POLY)),
        );
        (s, c, q)
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn bit_set32(q: __m256i, bit: i32) -> __m256 {
        let b = _mm256_set1_epi32(bit);
        _mm256_castsi256_ps(_mm256_cmpeq_epi32(_mm256_and_si256(q, b), b))
    }

    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn kernel32(func: Transcendental, x: __m256) -> __m256 {
        match func {
            Transcendental::Exp => exp32(x),
            Transcendental::Exp2 => exp2_32(x),
            Transcendental::Ln | Transcendental::Log2 | Transcendental::Log10 => {
                let (e, lm) = log_parts32(x);
                let y = match func {
                    Transcendental::Ln => _mm256_add_ps(
                        _mm256_mul_ps(e, splat32(single::LN2_HI)),
                        _mm256_add_ps(lm, _mm256_mul_ps(e, splat32(single::LN2_LO))),
                    ),
                    Transcendental::Log2 => _mm256_add_ps(e, _mm256_mul_ps(lm, splat32(std::f32::consts::LOG2_E))),
                    _ => _mm256_add_ps(
                        _mm256_mul_ps(e, splat32(single::LOG10_2_HI)),
                        _mm256_add_ps(
                            _mm256_mul_ps(e, splat32(single::LOG10_2_LO)),
                            _mm256_mul_ps(lm, splat32(std::f32::consts::LOG10_E)),
                        ),
                    ),
                };
                finish_log32(x, y)
            }
            Transcendental::Sin => {
                let (s, c, q) = sincos32(x);
                let y = _mm256_blendv_ps(s, c, bit_set32(q, 1));
                _mm256_blendv_ps(y, _mm256_xor_ps(y, splat32(-0.0)), bit_set32(q, 2))
            }
            _ => {
                let (s, c, q) = sincos32(x);
                let y = _mm256_blendv_ps(c, s, bit_set32(q, 1));
                let next = _mm256_add_epi32(q, _mm256_set1_epi32(1));
                _mm256_blendv_ps(y, _mm256_xor_ps(y, splat32(-0.0)), bit_set32(next, 2))
            }
        }
    }

    /// Native float32 kernels
    #[target_feature(enable = "avx2")]
    pub(super) unsafe fn map_f32(func: Transcendental, src: &[f32], dst: &mut [f32]) -> usize {
        if !has_kernel(func) {
            return 0;
        }
        let len = src.len() / 8 * 8;
        let mut i = 0;
        while i < len {
            let x = _mm256_loadu_ps(src.as_ptr().add(i));
            _mm256_storeu_ps(dst.as_mut_ptr().add(i), kernel32(func, x));
            i += 8;
        }
        len
    }
}

/// Name of the backend the next evaluation will use
pub fn backend_name() -> &'static str {
    crate::config::snapshot().config.math_backend().name()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const KERNELS: [Transcendental; 8] = [
        Transcendental::Exp,
        Transcendental::Exp2,
        Transcendental::Ln,
        Transcendental::Log2,
        Transcendental::Log10,
        Transcendental::Sin,
        Transcendental::Cos,
        Transcendental::Tanh,
    ];

    fn samples() -> Vec<f64> {
        let mut xs: Vec<f64> = (0..41).map(|i| (i as f64 - 20.0) * 7.3).collect();
        xs.extend([
            0.0,
            -0.0,
            1.0,
            0.5,
            2.5e5,
            -3.0e5,
            700.5,
            -740.2,
            1.0e-310,
            f64::INFINITY,
            f64::NEG_INFINITY,
            f64::NAN,
        ]);
        xs
    }

    /// Bit patterns with every NaN folded together
    fn bits64(values: &[f64]) -> Vec<u64> {
        values.iter().map(|v| if v.is_nan() { u64::MAX } else { v.to_bits() }).collect()
    }

    fn bits32(values: &[f32]) -> Vec<u32> {
        values.iter().map(|v| if v.is_nan() { u32::MAX } else { v.to_bits() }).collect()
    }

    #[test]
    fn test_backend_names() {
        assert_eq!(MathBackend::new(Precision::Ulp10, true).name(), "simd-u10");
        assert_eq!(MathBackend::new(Precision::Ulp35, false).name(), "scalar-u35");
    }

    #[test]
    fn test_lanes_match_scalar() {
        let src = samples();
        for precision in [Precision::Ulp10, Precision::Ulp35] {
            for func in KERNELS {
                let mut vector = vec![0.0; src.len()];
                let mut scalar = vec![0.0; src.len()];
                MathBackend::new(precision, true).map_f64(func, &src, &mut vector);
                MathBackend::new(precision, false).map_f64(func, &src, &mut scalar);
                assert_eq!(bits64(&vector), bits64(&scalar), "{func:?} {precision:?}");
            }
        }
    }

    #[test]
    fn test_float32_lanes_match_scalar() {
        let src: Vec<f32> = samples().into_iter().map(|x| x as f32).chain([3.0e4, 1.0e-40]).collect();
        for precision in [Precision::Ulp10, Precision::Ulp35] {
            for func in KERNELS {
                let mut vector = vec![0.0; src.len()];
                let mut scalar = vec![0.0; src.len()];
                MathBackend::new(precision, true).map_f32(func, &src, &mut vector);
                MathBackend::new(precision, false).map_f32(func, &src, &mut scalar);
                assert_eq!(bits32(&vector), bits32(&scalar), "{func:?} {precision:?}");
            }
        }
    }

    #[test]
    fn test_precision_changes_float64_results() {
        let fine = MathBackend::new(Precision::Ulp10, false);
        let coarse = MathBackend::new(Precision::Ulp35, false);
        let xs: Vec<f64> = (1..400).map(|i| i as f64 * 0.0123).collect();
        let differing = xs
            .iter()
            .filter(|&&x| fine.eval_f64(Transcendental::Sin, x) != coarse.eval_f64(Transcendental::Sin, x))
            .count();
        assert!(differing > 0);
        for &x in &xs {
            let reference = x.sin();
            assert!((fine.eval_f64(Transcendental::Sin, x) - reference).abs() <= 2.0 * f64::EPSILON);
            assert!((coarse.eval_f64(Transcendental::Sin, x) - reference).abs() <= 4.0 * f64::EPSILON);
        }
    }

    #[test]
    fn test_float32_precision_modes_stay_close() {
        let fine = MathBackend::new(Precision::Ulp10, false);
        let coarse = MathBackend::new(Precision::Ulp35, false);
        for i in 0..50 {
            let x = i as f32 * 0.13;
            let reference = (x as f64).exp();
            let fine_err = ((fine.eval_f32(Transcendental::Exp, x) as f64 - reference) / reference).abs();
            let coarse_err = ((coarse.eval_f32(Transcendental::Exp, x) as f64 - reference) / reference).abs();
            assert!(fine_err < 1e-6);
            assert!(coarse_err < 1e-6);
        }
    }

    #[test]
    fn test_pi_scaled_functions_are_exact_at_integers() {
        let backend = MathBackend::default();
        assert_eq!(backend.eval_f64(Transcendental::Sinpi, 3.0), 0.0);
        assert_eq!(backend.eval_f64(Transcendental::Cospi, 0.5), 0.0);
        assert_eq!(backend.eval_f64(Transcendental::Cospi, 1.0), -1.0);
        assert_eq!(backend.eval_f32(Transcendental::Sinpi, 0.5), 1.0);
    }
}
