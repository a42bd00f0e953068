//! 8-bit floating point codec.
//!
//! Two layouts share one encoder: E4M3 (bias 7) for weights and E5M2
//! (bias 15) for activations. The all-ones exponent is reserved: a zero
//! mantissa encodes ±Inf, any other mantissa encodes NaN. Values below the
//! smallest normal flush to signed zero; values past the largest finite
//! magnitude saturate to ±Inf.

use serde::{Deserialize, Serialize};

/// An encoded FP8 value.
pub type Fp8 = u8;

const SIGN_BIT: u8 = 0x80;
/// NaN payload (sign bit excluded).
const NAN_CODE: u8 = 0x7F;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Fp8Format {
    /// 4 exponent bits, 3 mantissa bits.
    #[default]
    E4M3,
    /// 5 exponent bits, 2 mantissa bits.
    E5M2,
}

impl Fp8Format {
    pub fn exponent_bits(&self) -> u32 {
        match self {
            Fp8Format::E4M3 => 4,
            Fp8Format::E5M2 => 5,
        }
    }

    pub fn mantissa_bits(&self) -> u32 {
        match self {
            Fp8Format::E4M3 => 3,
            Fp8Format::E5M2 => 2,
        }
    }

    pub fn bias(&self) -> i32 {
        match self {
            Fp8Format::E4M3 => 7,
            Fp8Format::E5M2 => 15,
        }
    }

    fn exponent_mask(&self) -> u8 {
        ((1u32 << self.exponent_bits()) - 1) as u8
    }

    fn mantissa_mask(&self) -> u8 {
        ((1u32 << self.mantissa_bits()) - 1) as u8
    }

    /// Largest finite magnitude.
    pub fn max_value(&self) -> f32 {
        let top = i32::from(self.exponent_mask()) - 1 - self.bias();
        let frac = 2.0 - 2f32.powi(-(self.mantissa_bits() as i32));
        frac * 2f32.powi(top)
    }

    /// Smallest positive normal magnitude.
    pub fn min_normal(&self) -> f32 {
        2f32.powi(1 - self.bias())
    }
}

impl std::fmt::Display for Fp8Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fp8Format::E4M3 => write!(f, "E4M3"),
            Fp8Format::E5M2 => write!(f, "E5M2"),
        }
    }
}

/// Split a positive finite `x` into `m * 2^e` with `m` in `[0.5, 1)`.
fn frexp(x: f32) -> (f32, i32) {
    if x == 0.0 || !x.is_finite() {
        return (x, 0);
    }
    let bits = x.to_bits();
    let exp = ((bits >> 23) & 0xFF) as i32;
    if exp == 0 {
        // Subnormal: normalise first.
        let (m, e) = frexp(x * 2f32.powi(25));
        return (m, e - 25);
    }
    let m = f32::from_bits((bits & 0x807F_FFFF) | (126 << 23));
    (m, exp - 126)
}

pub fn float_to_fp8(value: f32, format: Fp8Format) -> Fp8 {
    let sign = if value.is_sign_negative() { SIGN_BIT } else { 0 };
    let mbits = format.mantissa_bits();
    let exp_all_ones = format.exponent_mask();

    if value.is_nan() {
        return sign | NAN_CODE;
    }
    let infinity = sign | (exp_all_ones << mbits);
    if value.is_infinite() {
        return infinity;
    }
    let magnitude = value.abs();
    if magnitude == 0.0 {
        return sign;
    }

    let (m, e) = frexp(magnitude);
    // magnitude = (2m) * 2^(e-1) with 2m in [1, 2).
    let mut exponent = e - 1 + format.bias();
    let mut mantissa = ((2.0 * m - 1.0) * (1u32 << mbits) as f32).round() as u32;
    if mantissa == 1 << mbits {
        mantissa = 0;
        exponent += 1;
    }

    if exponent >= i32::from(exp_all_ones) {
        return infinity;
    }
    if exponent < 1 {
        return sign;
    }
    sign | ((exponent as u8) << mbits) | mantissa as u8
}

pub fn fp8_to_float(value: Fp8, format: Fp8Format) -> f32 {
    let mbits = format.mantissa_bits();
    let sign = if value & SIGN_BIT != 0 { -1.0 } else { 1.0 };
    let exponent = (value >> mbits) & format.exponent_mask();
    let mantissa = f32::from(value & format.mantissa_mask()) / (1u32 << mbits) as f32;

    if exponent == format.exponent_mask() {
        return if mantissa == 0.0 {
            sign * f32::INFINITY
        } else {
            f32::NAN
        };
    }
    if exponent == 0 {
        // Never produced by the encoder, decoded as subnormal for completeness.
        return sign * mantissa * 2f32.powi(1 - format.bias());
    }
    sign * (1.0 + mantissa) * 2f32.powi(i32::from(exponent) - format.bias())
}

pub fn fp8_is_nan(value: Fp8, format: Fp8Format) -> bool {
    let mbits = format.mantissa_bits();
    (value >> mbits) & format.exponent_mask() == format.exponent_mask()
        && value & format.mantissa_mask() != 0
}

pub fn fp8_is_inf(value: Fp8, format: Fp8Format) -> bool {
    let mbits = format.mantissa_bits();
    (value >> mbits) & format.exponent_mask() == format.exponent_mask()
        && value & format.mantissa_mask() == 0
}

pub fn fp8_abs(value: Fp8) -> Fp8 {
    value & !SIGN_BIT
}

pub fn fp8_add(a: Fp8, b: Fp8, format: Fp8Format) -> Fp8 {
    float_to_fp8(fp8_to_float(a, format) + fp8_to_float(b, format), format)
}

pub fn fp8_multiply(a: Fp8, b: Fp8, format: Fp8Format) -> Fp8 {
    float_to_fp8(fp8_to_float(a, format) * fp8_to_float(b, format), format)
}

/// Encode a slice.
pub fn encode_slice(input: &[f32], format: Fp8Format, out: &mut [u8]) {
    for (o, &x) in out.iter_mut().zip(input) {
        *o = float_to_fp8(x, format);
    }
}

/// Decode a slice.
pub fn decode_slice(input: &[u8], format: Fp8Format, out: &mut [f32]) {
    for (o, &b) in out.iter_mut().zip(input) {
        *o = fp8_to_float(b, format);
    }
}
