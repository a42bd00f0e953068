//! Quantization engine.
//!
//! Maps `f32` tensors to compact encodings and back:
//!
//! | type      | bits | layout                                             |
//! |-----------|------|----------------------------------------------------|
//! | `Int8`    | 8    | one code per byte                                  |
//! | `Int4`    | 4    | two codes per byte, first element in the high nibble |
//! | `Int2`    | 2    | four codes per byte, most significant bits first   |
//! | `Fp16`    | 16   | IEEE half, little-endian                           |
//! | `Fp8`     | 8    | E4M3 or E5M2, see [`fp8`]                          |
//! | `Dynamic` | 8    | 256-element blocks, each prefixed by its params    |
//!
//! Integer codes use the affine mapping `q = clamp(round(x / scale) + zp)`,
//! `x = (q - zp) * scale`. Symmetric codes are signed two's complement;
//! asymmetric codes are unsigned.

pub mod fp8;
pub mod mixed_precision;
pub mod qat;
pub mod state_file;

use bytes::{Buf, BufMut};
use half::f16;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;
use fp8::Fp8Format;

/// Elements per block for [`QuantType::Dynamic`].
pub const DYNAMIC_BLOCK: usize = 256;

#[derive(Error, Debug)]
pub enum QuantError {
    #[error("Cannot quantize an empty tensor")]
    EmptyInput,

    #[error("Tensor has no finite values to calibrate from")]
    NoFiniteValues,

    #[error("Unsupported quantization: {0}")]
    Unsupported(String),

    #[error("Clip ratio {0} outside [0, 1)")]
    InvalidClipRatio(f32),

    #[error("Size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Cannot split {len} elements into {channels} channels")]
    InvalidChannels { len: usize, channels: usize },

    #[error("Index {index} out of range ({len} entries)")]
    IndexOutOfRange { index: usize, len: usize },
}

impl QuantError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QuantError::Unsupported(_) => ErrorKind::Unsupported,
            QuantError::SizeMismatch { .. } => ErrorKind::CorruptData,
            QuantError::EmptyInput
            | QuantError::NoFiniteValues
            | QuantError::InvalidClipRatio(_)
            | QuantError::InvalidChannels { .. }
            | QuantError::IndexOutOfRange { .. } => ErrorKind::InvalidArgument,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantType {
    Int8,
    Int4,
    Int2,
    Fp16,
    Fp8,
    Dynamic,
}

impl QuantType {
    pub fn bits(&self) -> u32 {
        match self {
            QuantType::Int8 | QuantType::Fp8 | QuantType::Dynamic => 8,
            QuantType::Int4 => 4,
            QuantType::Int2 => 2,
            QuantType::Fp16 => 16,
        }
    }

    /// Integer type for a bit width (16 maps to FP16).
    pub fn from_bits(bits: u32) -> Result<Self, QuantError> {
        match bits {
            8 => Ok(QuantType::Int8),
            4 => Ok(QuantType::Int4),
            2 => Ok(QuantType::Int2),
            16 => Ok(QuantType::Fp16),
            other => Err(QuantError::Unsupported(format!("{other}-bit quantization"))),
        }
    }

    /// Uses scale and zero point.
    pub fn is_integer(&self) -> bool {
        matches!(self, QuantType::Int8 | QuantType::Int4 | QuantType::Int2)
    }

    /// Encoded size of `n` elements.
    pub fn quantized_size(&self, n: usize) -> usize {
        match self {
            QuantType::Int8 | QuantType::Fp8 => n,
            QuantType::Int4 => n.div_ceil(2),
            QuantType::Int2 => n.div_ceil(4),
            QuantType::Fp16 => n * 2,
            QuantType::Dynamic => n + n.div_ceil(DYNAMIC_BLOCK) * QuantParams::ENCODED_LEN,
        }
    }
}

impl std::fmt::Display for QuantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuantType::Int8 => write!(f, "INT8"),
            QuantType::Int4 => write!(f, "INT4"),
            QuantType::Int2 => write!(f, "INT2"),
            QuantType::Fp16 => write!(f, "FP16"),
            QuantType::Fp8 => write!(f, "FP8"),
            QuantType::Dynamic => write!(f, "DYNAMIC"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantConfig {
    pub quant_type: QuantType,

    /// Calibrate per channel (last dimension) instead of per tensor.
    pub per_channel: bool,

    /// Zero point fixed at 0, signed code range.
    pub symmetric: bool,

    /// Fraction of the observed range trimmed from each end, in `[0, 1)`.
    pub clip_ratio: f32,

    /// Layout used by [`QuantType::Fp8`].
    pub fp8_format: Fp8Format,
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            quant_type: QuantType::Int8,
            per_channel: false,
            symmetric: true,
            clip_ratio: 0.0,
            fp8_format: Fp8Format::E4M3,
        }
    }
}

impl QuantConfig {
    pub fn new(quant_type: QuantType, symmetric: bool) -> Self {
        Self {
            quant_type,
            symmetric,
            ..Self::default()
        }
    }
}

/// Calibrated mapping for one tensor, channel, or dynamic block.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
    pub min_value: f32,
    pub max_value: f32,
}

impl QuantParams {
    /// Size of the little-endian record.
    pub const ENCODED_LEN: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        let mut buf = &mut out[..];
        buf.put_f32_le(self.scale);
        buf.put_i32_le(self.zero_point);
        buf.put_f32_le(self.min_value);
        buf.put_f32_le(self.max_value);
        out
    }

    pub fn from_bytes(mut buf: &[u8]) -> Result<Self, QuantError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(QuantError::SizeMismatch {
                expected: Self::ENCODED_LEN,
                actual: buf.len(),
            });
        }
        Ok(Self {
            scale: buf.get_f32_le(),
            zero_point: buf.get_i32_le(),
            min_value: buf.get_f32_le(),
            max_value: buf.get_f32_le(),
        })
    }
}

/// Code range for `bits`-wide integers.
pub fn int_range(bits: u32, symmetric: bool) -> (i32, i32) {
    if symmetric {
        (-(1 << (bits - 1)), (1 << (bits - 1)) - 1)
    } else {
        (0, (1 << bits) - 1)
    }
}

/// Round to nearest, ties toward zero.
fn round_half_toward_zero(v: f32) -> f32 {
    let t = v.trunc();
    if (v - t).abs() == 0.5 {
        t
    } else {
        v.round()
    }
}

/// Min and max of the finite values, if any.
pub(crate) fn finite_range(data: &[f32]) -> Option<(f32, f32)> {
    data.iter()
        .copied()
        .filter(|x| x.is_finite())
        .fold(None, |acc, x| match acc {
            None => Some((x, x)),
            Some((lo, hi)) => Some((lo.min(x), hi.max(x))),
        })
}

/// Scale and zero point for `[min, max]` at `bits`.
pub fn affine_params(min: f32, max: f32, bits: u32, symmetric: bool) -> QuantParams {
    let (scale, zero_point) = if symmetric {
        let abs_max = min.abs().max(max.abs());
        let (_, qmax) = int_range(bits, true);
        (abs_max / qmax as f32, 0)
    } else {
        // Widen to include zero so 0.0 is exactly representable.
        let lo = min.min(0.0);
        let hi = max.max(0.0);
        let (qmin, qmax) = int_range(bits, false);
        let scale = (hi - lo) / qmax as f32;
        let zp = if scale > 0.0 {
            (-lo / scale).round() as i32
        } else {
            0
        };
        (scale, zp.clamp(qmin, qmax))
    };
    let scale = if scale > 0.0 && scale.is_finite() {
        scale
    } else {
        1.0
    };
    QuantParams {
        scale,
        zero_point,
        min_value: min,
        max_value: max,
    }
}

fn check_clip(ratio: f32) -> Result<(), QuantError> {
    if (0.0..1.0).contains(&ratio) {
        Ok(())
    } else {
        Err(QuantError::InvalidClipRatio(ratio))
    }
}

/// Observed range of `data`, trimmed by `clip_ratio` from both ends.
fn clipped_range(data: &[f32], clip_ratio: f32) -> Result<(f32, f32), QuantError> {
    let (mut min, mut max) = finite_range(data).ok_or(QuantError::NoFiniteValues)?;
    if clip_ratio > 0.0 {
        let range = max - min;
        min += range * clip_ratio;
        max -= range * clip_ratio;
        if min > max {
            let mid = (min + max) / 2.0;
            min = mid;
            max = mid;
        }
    }
    Ok((min, max))
}

/// Compute quantization parameters for `data`.
pub fn calibrate(data: &[f32], config: &QuantConfig) -> Result<QuantParams, QuantError> {
    if data.is_empty() {
        return Err(QuantError::EmptyInput);
    }
    check_clip(config.clip_ratio)?;
    let (min, max) = clipped_range(data, config.clip_ratio)?;
    Ok(match config.quant_type {
        QuantType::Fp16 | QuantType::Fp8 => QuantParams {
            scale: 1.0,
            zero_point: 0,
            min_value: min,
            max_value: max,
        },
        t => affine_params(min, max, t.bits(), config.symmetric),
    })
}

fn quantize_value(x: f32, p: &QuantParams, lo: i32, hi: i32) -> i32 {
    let q = round_half_toward_zero(x / p.scale) as i32;
    q.saturating_add(p.zero_point).clamp(lo, hi)
}

fn dequantize_value(q: i32, p: &QuantParams) -> f32 {
    (q - p.zero_point) as f32 * p.scale
}

/// Pack integer codes; element `i` uses `params[i % params.len()]`.
fn pack_affine(input: &[f32], params: &[QuantParams], bits: u32, symmetric: bool, out: &mut Vec<u8>) {
    let (lo, hi) = int_range(bits, symmetric);
    let per_byte = (8 / bits) as usize;
    let mask = (1u32 << bits) - 1;
    for (chunk_idx, chunk) in input.chunks(per_byte).enumerate() {
        let mut byte = 0u8;
        for (j, &x) in chunk.iter().enumerate() {
            let i = chunk_idx * per_byte + j;
            let q = quantize_value(x, &params[i % params.len()], lo, hi);
            let shift = 8 - bits * (j as u32 + 1);
            byte |= (((q as u32) & mask) << shift) as u8;
        }
        out.push(byte);
    }
}

fn unpack_affine(input: &[u8], n: usize, params: &[QuantParams], bits: u32, symmetric: bool, out: &mut Vec<f32>) {
    let per_byte = (8 / bits) as usize;
    let mask = (1u32 << bits) - 1;
    for i in 0..n {
        let byte = u32::from(input[i / per_byte]);
        let shift = 8 - bits * ((i % per_byte) as u32 + 1);
        let code = (byte >> shift) & mask;
        let q = if symmetric {
            ((code << (32 - bits)) as i32) >> (32 - bits)
        } else {
            code as i32
        };
        out.push(dequantize_value(q, &params[i % params.len()]));
    }
}

/// Quantize `input` with precomputed `params`.
///
/// `params` is ignored for [`QuantType::Dynamic`], which calibrates every
/// 256-element block itself and stores the result ahead of the block.
pub fn quantize(input: &[f32], params: &QuantParams, config: &QuantConfig) -> Result<Vec<u8>, QuantError> {
    if input.is_empty() {
        return Err(QuantError::EmptyInput);
    }
    let mut out = Vec::with_capacity(config.quant_type.quantized_size(input.len()));
    match config.quant_type {
        QuantType::Int8 | QuantType::Int4 | QuantType::Int2 => {
            pack_affine(
                input,
                std::slice::from_ref(params),
                config.quant_type.bits(),
                config.symmetric,
                &mut out,
            );
        }
        QuantType::Fp16 => {
            for &x in input {
                out.extend_from_slice(&f16::from_f32(x).to_le_bytes());
            }
        }
        QuantType::Fp8 => {
            out.resize(input.len(), 0);
            fp8::encode_slice(input, config.fp8_format, &mut out);
        }
        QuantType::Dynamic => {
            check_clip(config.clip_ratio)?;
            for block in input.chunks(DYNAMIC_BLOCK) {
                let (min, max) = clipped_range(block, config.clip_ratio)?;
                let block_params = affine_params(min, max, 8, config.symmetric);
                out.extend_from_slice(&block_params.to_bytes());
                pack_affine(
                    block,
                    std::slice::from_ref(&block_params),
                    8,
                    config.symmetric,
                    &mut out,
                );
            }
        }
    }
    Ok(out)
}

/// Decode `n` elements produced by [`quantize`].
pub fn dequantize(
    input: &[u8],
    n: usize,
    params: &QuantParams,
    config: &QuantConfig,
) -> Result<Vec<f32>, QuantError> {
    if n == 0 {
        return Err(QuantError::EmptyInput);
    }
    let expected = config.quant_type.quantized_size(n);
    if input.len() != expected {
        return Err(QuantError::SizeMismatch {
            expected,
            actual: input.len(),
        });
    }
    let mut out = Vec::with_capacity(n);
    match config.quant_type {
        QuantType::Int8 | QuantType::Int4 | QuantType::Int2 => {
            unpack_affine(
                input,
                n,
                std::slice::from_ref(params),
                config.quant_type.bits(),
                config.symmetric,
                &mut out,
            );
        }
        QuantType::Fp16 => {
            out.extend(
                input
                    .chunks_exact(2)
                    .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32()),
            );
        }
        QuantType::Fp8 => {
            out.resize(n, 0.0);
            fp8::decode_slice(input, config.fp8_format, &mut out);
        }
        QuantType::Dynamic => {
            let mut rest = input;
            let mut remaining = n;
            while remaining > 0 {
                let count = remaining.min(DYNAMIC_BLOCK);
                let block_params = QuantParams::from_bytes(rest)?;
                rest = &rest[QuantParams::ENCODED_LEN..];
                unpack_affine(
                    &rest[..count],
                    count,
                    std::slice::from_ref(&block_params),
                    8,
                    config.symmetric,
                    &mut out,
                );
                rest = &rest[count..];
                remaining -= count;
            }
        }
    }
    Ok(out)
}

/// Quantize then immediately dequantize `data` in place.
pub fn fake_quantize(data: &mut [f32], params: &QuantParams, config: &QuantConfig) -> Result<(), QuantError> {
    let encoded = quantize(data, params, config)?;
    let decoded = dequantize(&encoded, data.len(), params, config)?;
    data.copy_from_slice(&decoded);
    Ok(())
}

fn check_channels(len: usize, channels: usize) -> Result<(), QuantError> {
    if channels == 0 || len % channels != 0 {
        return Err(QuantError::InvalidChannels { len, channels });
    }
    Ok(())
}

fn require_integer(config: &QuantConfig) -> Result<(), QuantError> {
    if config.quant_type.is_integer() {
        Ok(())
    } else {
        Err(QuantError::Unsupported(format!(
            "per-channel {} quantization",
            config.quant_type
        )))
    }
}

/// Calibrate each channel of a row-major tensor whose last dimension is `channels`.
pub fn calibrate_per_channel(
    data: &[f32],
    channels: usize,
    config: &QuantConfig,
) -> Result<Vec<QuantParams>, QuantError> {
    if data.is_empty() {
        return Err(QuantError::EmptyInput);
    }
    require_integer(config)?;
    check_channels(data.len(), channels)?;
    (0..channels)
        .map(|c| {
            let column: Vec<f32> = data.iter().skip(c).step_by(channels).copied().collect();
            calibrate(&column, config)
        })
        .collect()
}

pub fn quantize_per_channel(
    data: &[f32],
    params: &[QuantParams],
    config: &QuantConfig,
) -> Result<Vec<u8>, QuantError> {
    if data.is_empty() {
        return Err(QuantError::EmptyInput);
    }
    require_integer(config)?;
    check_channels(data.len(), params.len())?;
    let mut out = Vec::with_capacity(config.quant_type.quantized_size(data.len()));
    pack_affine(data, params, config.quant_type.bits(), config.symmetric, &mut out);
    Ok(out)
}

pub fn dequantize_per_channel(
    input: &[u8],
    n: usize,
    params: &[QuantParams],
    config: &QuantConfig,
) -> Result<Vec<f32>, QuantError> {
    if n == 0 {
        return Err(QuantError::EmptyInput);
    }
    require_integer(config)?;
    check_channels(n, params.len())?;
    let expected = config.quant_type.quantized_size(n);
    if input.len() != expected {
        return Err(QuantError::SizeMismatch {
            expected,
            actual: input.len(),
        });
    }
    let mut out = Vec::with_capacity(n);
    unpack_affine(input, n, params, config.quant_type.bits(), config.symmetric, &mut out);
    Ok(out)
}

/// A quantized tensor that owns its encoded bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedTensor {
    shape: Vec<usize>,
    config: QuantConfig,
    /// One entry per tensor, or one per channel when `config.per_channel`.
    params: Vec<QuantParams>,
    data: Vec<u8>,
}

impl QuantizedTensor {
    pub fn quantize(values: &[f32], shape: &[usize], config: &QuantConfig) -> Result<Self, QuantError> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(QuantError::SizeMismatch {
                expected,
                actual: values.len(),
            });
        }
        let channelwise = config.per_channel && config.quant_type.is_integer();
        let (params, data) = match shape.last() {
            Some(&channels) if channelwise => {
                let params = calibrate_per_channel(values, channels, config)?;
                let data = quantize_per_channel(values, &params, config)?;
                (params, data)
            }
            _ => {
                let params = calibrate(values, config)?;
                let data = quantize(values, &params, config)?;
                (vec![params], data)
            }
        };
        Ok(Self {
            shape: shape.to_vec(),
            config: config.clone(),
            params,
            data,
        })
    }

    pub fn dequantize(&self) -> Result<Vec<f32>, QuantError> {
        let n = self.len();
        if self.params.len() > 1 {
            dequantize_per_channel(&self.data, n, &self.params, &self.config)
        } else {
            let params = self.params.first().copied().unwrap_or_default();
            dequantize(&self.data, n, &params, &self.config)
        }
    }

    /// Decode and re-encode with a different configuration.
    pub fn requantize(&self, config: &QuantConfig) -> Result<Self, QuantError> {
        let values = self.dequantize()?;
        Self::quantize(&values, &self.shape, config)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &QuantConfig {
        &self.config
    }

    pub fn params(&self) -> &[QuantParams] {
        &self.params
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Encoded size in bytes.
    pub fn nbytes(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bits() {
        assert_eq!(QuantType::from_bits(4).unwrap(), QuantType::Int4);
        let err = QuantType::from_bits(3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_quantized_size() {
        assert_eq!(QuantType::Int4.quantized_size(5), 3);
        assert_eq!(QuantType::Int2.quantized_size(5), 2);
        assert_eq!(QuantType::Fp16.quantized_size(5), 10);
        assert_eq!(QuantType::Dynamic.quantized_size(300), 300 + 2 * 16);
    }

    #[test]
    fn test_symmetric_int8_scenario() {
        let data = [-2.0f32, -1.0, 0.0, 1.0, 2.0];
        let cfg = QuantConfig::new(QuantType::Int8, true);
        let p = calibrate(&data, &cfg).unwrap();
        assert!((p.scale - 2.0 / 127.0).abs() < 1e-7);
        assert_eq!(p.zero_point, 0);

        let q = quantize(&[1.0], &p, &cfg).unwrap();
        assert_eq!(q[0] as i8, 63);
        let back = dequantize(&q, 1, &p, &cfg).unwrap();
        assert!((back[0] - 0.9921).abs() < 1e-4);
    }

    #[test]
    fn test_asymmetric_zero_point() {
        let data = [0.5f32, 1.0, 3.0];
        let cfg = QuantConfig::new(QuantType::Int8, false);
        let p = calibrate(&data, &cfg).unwrap();
        // Range widened to [0, 3].
        assert_eq!(p.zero_point, 0);
        assert!((p.scale - 3.0 / 255.0).abs() < 1e-7);

        let data = [-1.0f32, 3.0];
        let p = calibrate(&data, &cfg).unwrap();
        assert_eq!(p.zero_point, 64);
        let q = quantize(&[0.0], &p, &cfg).unwrap();
        assert_eq!(dequantize(&q, 1, &p, &cfg).unwrap()[0], 0.0);
    }

    #[test]
    fn test_int4_nibble_order() {
        let cfg = QuantConfig::new(QuantType::Int4, false);
        let p = QuantParams {
            scale: 1.0,
            zero_point: 0,
            min_value: 0.0,
            max_value: 15.0,
        };
        let q = quantize(&[1.0, 2.0, 15.0], &p, &cfg).unwrap();
        assert_eq!(q, vec![0x12, 0xF0]);
        assert_eq!(dequantize(&q, 3, &p, &cfg).unwrap(), vec![1.0, 2.0, 15.0]);
    }

    #[test]
    fn test_int2_signed_codes() {
        let cfg = QuantConfig::new(QuantType::Int2, true);
        let p = calibrate(&[-1.0, 1.0], &cfg).unwrap();
        assert_eq!(p.scale, 1.0);
        let values = [-2.0f32, -1.0, 0.0, 1.0, 5.0];
        let q = quantize(&values, &p, &cfg).unwrap();
        assert_eq!(q.len(), 2);
        let back = dequantize(&q, values.len(), &p, &cfg).unwrap();
        assert_eq!(back, vec![-2.0, -1.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_clip_ratio() {
        let data: Vec<f32> = (0..=10).map(|i| i as f32).collect();
        let cfg = QuantConfig {
            clip_ratio: 0.1,
            ..QuantConfig::new(QuantType::Int8, false)
        };
        let p = calibrate(&data, &cfg).unwrap();
        assert_eq!(p.min_value, 1.0);
        assert_eq!(p.max_value, 9.0);

        let bad = QuantConfig {
            clip_ratio: 1.0,
            ..QuantConfig::default()
        };
        assert!(matches!(
            calibrate(&data, &bad),
            Err(QuantError::InvalidClipRatio(_))
        ));
    }

    #[test]
    fn test_nan_ignored_in_calibration() {
        let cfg = QuantConfig::default();
        let p = calibrate(&[f32::NAN, -4.0, 2.0], &cfg).unwrap();
        assert_eq!(p.min_value, -4.0);
        assert_eq!(p.max_value, 2.0);
        assert!(matches!(
            calibrate(&[f32::NAN], &cfg),
            Err(QuantError::NoFiniteValues)
        ));
    }

    #[test]
    fn test_constant_tensor_scale_one() {
        let cfg = QuantConfig::default();
        let p = calibrate(&[0.0; 8], &cfg).unwrap();
        assert_eq!(p.scale, 1.0);
    }

    #[test]
    fn test_fp16_roundtrip() {
        let cfg = QuantConfig::new(QuantType::Fp16, true);
        let values = [1.0f32, -0.5, 65504.0, 0.333];
        let p = calibrate(&values, &cfg).unwrap();
        let q = quantize(&values, &p, &cfg).unwrap();
        assert_eq!(q.len(), 8);
        let back = dequantize(&q, 4, &p, &cfg).unwrap();
        assert_eq!(&back[..3], &values[..3]);
        assert!((back[3] - 0.333).abs() < 1e-3);
    }

    #[test]
    fn test_dynamic_blocks_carry_params() {
        let mut values: Vec<f32> = (0..DYNAMIC_BLOCK).map(|i| i as f32 / 100.0).collect();
        values.extend((0..44).map(|i| 1000.0 + i as f32));
        let cfg = QuantConfig::new(QuantType::Dynamic, true);
        let q = quantize(&values, &QuantParams::default(), &cfg).unwrap();
        assert_eq!(q.len(), QuantType::Dynamic.quantized_size(values.len()));

        let first = QuantParams::from_bytes(&q).unwrap();
        assert!((first.scale - 2.55 / 127.0).abs() < 1e-6);

        let back = dequantize(&q, values.len(), &QuantParams::default(), &cfg).unwrap();
        for (a, b) in values.iter().zip(&back) {
            let tol = if *a < 10.0 { 0.02 } else { 5.0 };
            assert!((a - b).abs() <= tol, "{a} vs {b}");
        }
    }

    #[test]
    fn test_dequantize_size_mismatch() {
        let cfg = QuantConfig::default();
        let err = dequantize(&[0u8; 3], 4, &QuantParams::default(), &cfg).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptData);
    }

    #[test]
    fn test_per_channel() {
        // Two channels with very different ranges.
        let data = [0.1f32, 100.0, -0.1, -50.0, 0.05, 25.0];
        let cfg = QuantConfig::new(QuantType::Int8, true);
        let params = calibrate_per_channel(&data, 2, &cfg).unwrap();
        assert_eq!(params.len(), 2);
        assert!(params[0].scale < params[1].scale);

        let q = quantize_per_channel(&data, &params, &cfg).unwrap();
        let back = dequantize_per_channel(&q, data.len(), &params, &cfg).unwrap();
        for (i, (a, b)) in data.iter().zip(&back).enumerate() {
            assert!((a - b).abs() <= params[i % 2].scale / 2.0 + 1e-6);
        }

        assert!(matches!(
            calibrate_per_channel(&data, 4, &cfg),
            Err(QuantError::InvalidChannels { .. })
        ));
    }

    #[test]
    fn test_quantized_tensor_requantize() {
        let values: Vec<f32> = (0..64).map(|i| (i as f32 - 32.0) / 8.0).collect();
        let t = QuantizedTensor::quantize(&values, &[8, 8], &QuantConfig::default()).unwrap();
        assert_eq!(t.nbytes(), 64);

        let t4 = t.requantize(&QuantConfig::new(QuantType::Int4, true)).unwrap();
        assert_eq!(t4.nbytes(), 32);
        assert_eq!(t4.shape(), &[8, 8]);
        let back = t4.dequantize().unwrap();
        let scale = t4.params()[0].scale;
        for (a, b) in values.iter().zip(&back) {
            assert!((a - b).abs() <= scale / 2.0 + t.params()[0].scale);
        }
    }

    #[test]
    fn test_quantized_tensor_shape_mismatch() {
        let err = QuantizedTensor::quantize(&[1.0; 5], &[2, 2], &QuantConfig::default()).unwrap_err();
        assert!(matches!(err, QuantError::SizeMismatch { expected: 4, actual: 5 }));
    }
}
