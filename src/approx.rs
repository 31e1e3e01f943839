//! Polynomial approximations behind the transcendental backend
//!
//! Every routine is straight-line arithmetic: a Cody-Waite range reduction, a
//! Horner polynomial and exponent reconstruction through the bit pattern. The
//! AVX2 lane kernels in [`crate::simd`] perform the same operations in the same
//! order with no fused multiply-adds, so a lane and a scalar call produce the
//! same bits.
//!
//! The float64 routines take `fine`: the coarse variant drops the leading
//! polynomial terms.

use std::f64::consts::{FRAC_2_PI, LN_2, LOG10_E, LOG2_E, SQRT_2};

/// 1.5 * 2^52. Adding then subtracting rounds to the nearest integer, which is
/// left in the low mantissa bits of the sum.
pub(crate) const SHIFTER: f64 = 6_755_399_441_055_744.0;
pub(crate) const SHIFTER_BITS: i64 = 0x4338_0000_0000_0000;

pub(crate) const LN2_HI: f64 = 6.931_471_803_691_238_164_90e-1;
pub(crate) const LN2_LO: f64 = 1.908_214_929_270_587_700_02e-10;
pub(crate) const LOG10_2_HI: f64 = 3.010_299_956_636_117_713_06e-1;
pub(crate) const LOG10_2_LO: f64 = 3.694_239_077_158_930_786_16e-13;

/// pi/2 in three parts; `k * PIO2_1` and `k * PIO2_2` are exact for `|k| < 2^20`
pub(crate) const PIO2_1: f64 = 1.570_796_326_734_125_614_17;
pub(crate) const PIO2_2: f64 = 6.077_100_506_303_965_976_60e-11;
pub(crate) const PIO2_3: f64 = 2.022_266_248_711_166_455_80e-21;

/// Beyond this magnitude sin and cos use the platform routine
pub(crate) const SINCOS_LIMIT: f64 = 1.0e5;

/// Clamp bounds keeping the exponent of `2^n` in [-1077, 1025]
pub(crate) const EXP_MIN: f64 = -746.0;
pub(crate) const EXP_MAX: f64 = 710.0;
pub(crate) const EXP2_MIN: f64 = -1076.0;
pub(crate) const EXP2_MAX: f64 = 1025.0;

pub(crate) const TWO54: f64 = 18_014_398_509_481_984.0;
pub(crate) const MANTISSA_MASK: u64 = 0x000f_ffff_ffff_ffff;
pub(crate) const ONE_BITS: u64 = 0x3ff0_0000_0000_0000;

/// Polynomial coefficients, highest degree first
pub(crate) struct Poly {
    terms: &'static [f64],
    coarse_skip: usize,
}

impl Poly {
    pub(crate) fn terms(&self, fine: bool) -> &'static [f64] {
        if fine {
            self.terms
        } else {
            &self.terms[self.coarse_skip..]
        }
    }
}

/// e^r = sum of r^k / k!, k = 13 down to 0
pub(crate) const EXP_POLY: Poly = Poly {
    terms: &[
        1.0 / 6_227_020_800.0,
        1.0 / 479_001_600.0,
        1.0 / 39_916_800.0,
        1.0 / 3_628_800.0,
        1.0 / 362_880.0,
        1.0 / 40_320.0,
        1.0 / 5_040.0,
        1.0 / 720.0,
        1.0 / 120.0,
        1.0 / 24.0,
        1.0 / 6.0,
        0.5,
        1.0,
        1.0,
    ],
    coarse_skip: 1,
};

/// sin r = r + r z S(z) with z = r^2; (-1)^k / (2k+1)!, k = 9 down to 1
pub(crate) const SIN_POLY: Poly = Poly {
    terms: &[
        -1.0 / 121_645_100_408_832_000.0,
        1.0 / 355_687_428_096_000.0,
        -1.0 / 1_307_674_368_000.0,
        1.0 / 6_227_020_800.0,
        -1.0 / 39_916_800.0,
        1.0 / 362_880.0,
        -1.0 / 5_040.0,
        1.0 / 120.0,
        -1.0 / 6.0,
    ],
    coarse_skip: 2,
};

/// cos r = 1 - z/2 + z^2 C(z); (-1)^k / (2k)!, k = 10 down to 2
pub(crate) const COS_POLY: Poly = Poly {
    terms: &[
        1.0 / 2_432_902_008_176_640_000.0,
        -1.0 / 6_402_373_705_728_000.0,
        1.0 / 20_922_789_888_000.0,
        -1.0 / 87_178_291_200.0,
        1.0 / 479_001_600.0,
        -1.0 / 3_628_800.0,
        1.0 / 40_320.0,
        -1.0 / 720.0,
        1.0 / 24.0,
    ],
    coarse_skip: 2,
};

/// ln m = f - s (f - z T(z)) with s = f / (2 + f); 2 / (2k+1), k = 11 down to 1
pub(crate) const LOG_POLY: Poly = Poly {
    terms: &[
        2.0 / 23.0,
        2.0 / 21.0,
        2.0 / 19.0,
        2.0 / 17.0,
        2.0 / 15.0,
        2.0 / 13.0,
        2.0 / 11.0,
        2.0 / 9.0,
        2.0 / 7.0,
        2.0 / 5.0,
        2.0 / 3.0,
    ],
    coarse_skip: 2,
};

#[inline]
pub(crate) fn horner(x: f64, terms: &[f64]) -> f64 {
    terms.iter().fold(0.0, |acc, &c| acc * x + c)
}

#[inline]
fn pow2(n: i64) -> f64 {
    f64::from_bits(((n + 1023) as u64) << 52)
}

/// `p * 2^n`, split in two factors so each stays a normal number
#[inline]
fn ldexp(p: f64, n: i64) -> f64 {
    let half = n >> 1;
    p * pow2(half) * pow2(n - half)
}

pub(crate) fn exp(x: f64, fine: bool) -> f64 {
    let xc = x.clamp(EXP_MIN, EXP_MAX);
    let t = xc * LOG2_E + SHIFTER;
    let k = t - SHIFTER;
    let n = t.to_bits() as i64 - SHIFTER_BITS;
    let r = (xc - k * LN2_HI) - k * LN2_LO;
    let y = ldexp(horner(r, EXP_POLY.terms(fine)), n);
    if x.is_nan() {
        x
    } else {
        y
    }
}

pub(crate) fn exp2(x: f64, fine: bool) -> f64 {
    let xc = x.clamp(EXP2_MIN, EXP2_MAX);
    let t = xc + SHIFTER;
    let k = t - SHIFTER;
    let n = t.to_bits() as i64 - SHIFTER_BITS;
    let r = (xc - k) * LN_2;
    let y = ldexp(horner(r, EXP_POLY.terms(fine)), n);
    if x.is_nan() {
        x
    } else {
        y
    }
}

/// Split `x` into `e` and `ln(m)` with `x = m * 2^e`, `m` in [sqrt(1/2), sqrt(2))
#[inline]
fn log_parts(x: f64, fine: bool) -> (f64, f64) {
    let tiny = x < f64::MIN_POSITIVE;
    let xs = if tiny { x * TWO54 } else { x };
    let bits = xs.to_bits();
    let e = ((bits >> 52) & 0x7ff) as i64 - 1023 - if tiny { 54 } else { 0 };
    let m = f64::from_bits((bits & MANTISSA_MASK) | ONE_BITS);
    let big = m > SQRT_2;
    let m = if big { m * 0.5 } else { m };
    let e = e + big as i64;
    let f = m - 1.0;
    let s = f / (2.0 + f);
    let z = s * s;
    let t = z * horner(z, LOG_POLY.terms(fine));
    (e as f64, f - s * (f - t))
}

#[inline]
fn finish_log(x: f64, y: f64) -> f64 {
    if x == 0.0 {
        f64::NEG_INFINITY
    } else if x < 0.0 || x.is_nan() {
        f64::NAN
    } else if x == f64::INFINITY {
        x
    } else {
        y
    }
}

pub(crate) fn ln(x: f64, fine: bool) -> f64 {
    let (e, lm) = log_parts(x, fine);
    finish_log(x, e * LN2_HI + (lm + e * LN2_LO))
}

pub(crate) fn log2(x: f64, fine: bool) -> f64 {
    let (e, lm) = log_parts(x, fine);
    finish_log(x, e + lm * LOG2_E)
}

pub(crate) fn log10(x: f64, fine: bool) -> f64 {
    let (e, lm) = log_parts(x, fine);
    finish_log(x, e * LOG10_2_HI + (e * LOG10_2_LO + lm * LOG10_E))
}

/// sin and cos of the reduced argument, plus the quadrant
#[inline]
fn sincos(x: f64, fine: bool) -> (f64, f64, i64) {
    let t = x * FRAC_2_PI + SHIFTER;
    let k = t - SHIFTER;
    let q = (t.to_bits() as i64 - SHIFTER_BITS) & 3;
    let r = ((x - k * PIO2_1) - k * PIO2_2) - k * PIO2_3;
    let z = r * r;
    let s = r + r * z * horner(z, SIN_POLY.terms(fine));
    let c = 1.0 - 0.5 * z + z * z * horner(z, COS_POLY.terms(fine));
    (s, c, q)
}

pub(crate) fn sin(x: f64, fine: bool) -> f64 {
    if !(x.abs() <= SINCOS_LIMIT) {
        return x.sin();
    }
    let (s, c, q) = sincos(x, fine);
    let y = if q & 1 == 1 { c } else { s };
    if q & 2 == 2 {
        -y
    } else {
        y
    }
}

pub(crate) fn cos(x: f64, fine: bool) -> f64 {
    if !(x.abs() <= SINCOS_LIMIT) {
        return x.cos();
    }
    let (s, c, q) = sincos(x, fine);
    let y = if q & 1 == 1 { s } else { c };
    if (q + 1) & 2 == 2 {
        -y
    } else {
        y
    }
}

/// Single precision routines used by the coarse float32 backend
pub(crate) mod single {
    use std::f32::consts::{FRAC_2_PI, LN_2, LOG10_E, LOG2_E, SQRT_2};

    /// 1.5 * 2^23
    pub(crate) const SHIFTER: f32 = 12_582_912.0;
    pub(crate) const SHIFTER_BITS: i32 = 0x4b40_0000;

    pub(crate) const LN2_HI: f32 = 0.693_359_375;
    pub(crate) const LN2_LO: f32 = -2.121_944_4e-4;
    pub(crate) const LOG10_2_HI: f32 = 0.300_781_25;
    pub(crate) const LOG10_2_LO: f32 = 2.487_456_6e-4;

    pub(crate) const PIO2_1: f32 = 1.570_312_5;
    pub(crate) const PIO2_2: f32 = 4.837_512_969_970_703_125e-4;
    pub(crate) const PIO2_3: f32 = 7.549_789_954_891_882e-8;
    pub(crate) const SINCOS_LIMIT: f32 = 8192.0;

    pub(crate) const EXP_MIN: f32 = -104.0;
    pub(crate) const EXP_MAX: f32 = 89.0;
    pub(crate) const EXP2_MIN: f32 = -151.0;
    pub(crate) const EXP2_MAX: f32 = 129.0;

    pub(crate) const TWO25: f32 = 33_554_432.0;
    pub(crate) const MANTISSA_MASK: u32 = 0x007f_ffff;
    pub(crate) const ONE_BITS: u32 = 0x3f80_0000;

    pub(crate) const EXP_POLY: [f32; 8] = [
        1.0 / 5_040.0,
        1.0 / 720.0,
        1.0 / 120.0,
        1.0 / 24.0,
        1.0 / 6.0,
        0.5,
        1.0,
        1.0,
    ];
    pub(crate) const SIN_POLY: [f32; 5] = [-1.0 / 39_916_800.0, 1.0 / 362_880.0, -1.0 / 5_040.0, 1.0 / 120.0, -1.0 / 6.0];
    pub(crate) const COS_POLY: [f32; 5] = [1.0 / 479_001_600.0, -1.0 / 3_628_800.0, 1.0 / 40_320.0, -1.0 / 720.0, 1.0 / 24.0];
    pub(crate) const LOG_POLY: [f32; 5] = [2.0 / 11.0, 2.0 / 9.0, 2.0 / 7.0, 2.0 / 5.0, 2.0 / 3.0];

    #[inline]
    pub(crate) fn horner(x: f32, terms: &[f32]) -> f32 {
        terms.iter().fold(0.0, |acc, &c| acc * x + c)
    }

    #[inline]
    fn pow2(n: i32) -> f32 {
        f32::from_bits(((n + 127) as u32) << 23)
    }

    #[inline]
    fn ldexp(p: f32, n: i32) -> f32 {
        let half = n >> 1;
        p * pow2(half) * pow2(n - half)
    }

    pub(crate) fn exp(x: f32) -> f32 {
        let xc = x.clamp(EXP_MIN, EXP_MAX);
        let t = xc * LOG2_E + SHIFTER;
        let k = t - SHIFTER;
        let n = t.to_bits() as i32 - SHIFTER_BITS;
        let r = (xc - k * LN2_HI) - k * LN2_LO;
        let y = ldexp(horner(r, &EXP_POLY), n);
        if x.is_nan() {
            x
        } else {
            y
        }
    }

    pub(crate) fn exp2(x: f32) -> f32 {
        let xc = x.clamp(EXP2_MIN, EXP2_MAX);
        let t = xc + SHIFTER;
        let k = t - SHIFTER;
        let n = t.to_bits() as i32 - SHIFTER_BITS;
        let r = (xc - k) * LN_2;
        let y = ldexp(horner(r, &EXP_POLY), n);
        if x.is_nan() {
            x
        } else {
            y
        }
    }

    #[inline]
    fn log_parts(x: f32) -> (f32, f32) {
        let tiny = x < f32::MIN_POSITIVE;
        let xs = if tiny { x * TWO25 } else { x };
        let bits = xs.to_bits();
        let e = ((bits >> 23) & 0xff) as i32 - 127 - if tiny { 25 } else { 0 };
        let m = f32::from_bits((bits & MANTISSA_MASK) | ONE_BITS);
        let big = m > SQRT_2;
        let m = if big { m * 0.5 } else { m };
        let e = e + big as i32;
        let f = m - 1.0;
        let s = f / (2.0 + f);
        let z = s * s;
        let t = z * horner(z, &LOG_POLY);
        (e as f32, f - s * (f - t))
    }

    #[inline]
    fn finish_log(x: f32, y: f32) -> f32 {
        if x == 0.0 {
            f32::NEG_INFINITY
        } else if x < 0.0 || x.is_nan() {
            f32::NAN
        } else if x == f32::INFINITY {
            x
        } else {
            y
        }
    }

    pub(crate) fn ln(x: f32) -> f32 {
        let (e, lm) = log_parts(x);
        finish_log(x, e * LN2_HI + (lm + e * LN2_LO))
    }

    pub(crate) fn log2(x: f32) -> f32 {
        let (e, lm) = log_parts(x);
        finish_log(x, e + lm * LOG2_E)
    }

    pub(crate) fn log10(x: f32) -> f32 {
        let (e, lm) = log_parts(x);
        finish_log(x, e * LOG10_2_HI + (e * LOG10_2_LO + lm * LOG10_E))
    }

    #[inline]
    fn sincos(x: f32) -> (f32, f32, i32) {
        let t = x * FRAC_2_PI + SHIFTER;
        let k = t - SHIFTER;
        let q = (t.to_bits() as i32 - SHIFTER_BITS) & 3;
        let r = ((x - k * PIO2_1) - k * PIO2_2) - k * PIO2_3;
        let z = r * r;
        let s = r + r * z * horner(z, &SIN_POLY);
        let c = 1.0 - 0.5 * z + z * z * horner(z, &COS_POLY);
        (s, c, q)
    }

    pub(crate) fn sin(x: f32) -> f32 {
        if !(x.abs() <= SINCOS_LIMIT) {
            return x.sin();
        }
        let (s, c, q) = sincos(x);
        let y = if q & 1 == 1 { c } else { s };
        if q & 2 == 2 {
            -y
        } else {
            y
        }
    }

    pub(crate) fn cos(x: f32) -> f32 {
        if !(x.abs() <= SINCOS_LIMIT) {
            return x.cos();
        }
        let (s, c, q) = sincos(x);
        let y = if q & 1 == 1 { s } else { c };
        if (q + 1) & 2 == 2 {
            -y
        } else {
            y
        }
    }
}
