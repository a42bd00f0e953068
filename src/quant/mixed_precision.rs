//! Mixed-precision training support.
//!
//! Weights and gradients are kept as `f32` buffers but round-tripped
//! through their target precision, so the numeric effect of FP16, FP8, or
//! INT8 storage is visible to the training loop. An FP32 shadow copy of the
//! weights is kept for the optimizer step. Gradients are multiplied by a
//! dynamic loss scale to avoid underflow and divided back before the update.

use std::path::Path;

use bytes::BufMut;
use half::f16;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::fp8::{self, Fp8Format};
use super::state_file::{self, PayloadReader, SaveOptions, StateFileError, MIXED_PRECISION_MAGIC};
use super::{calibrate, fake_quantize, QuantConfig, QuantError, QuantParams, QuantType};

/// FP8 layout used for gradients and activations.
const ACTIVATION_FP8: Fp8Format = Fp8Format::E5M2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionType {
    Fp32,
    Fp16,
    Fp8,
    Int8,
    Dynamic,
}

impl PrecisionType {
    /// Whether `value` fits this precision without overflowing.
    pub fn check_value_range(&self, value: f32) -> bool {
        match self {
            PrecisionType::Fp16 => value.abs() <= 65504.0,
            PrecisionType::Fp8 => value.abs() <= 448.0,
            PrecisionType::Int8 => (-128.0..=127.0).contains(&value),
            PrecisionType::Fp32 | PrecisionType::Dynamic => value.is_finite(),
        }
    }
}

/// Round-trip `data` through `precision` in place.
pub fn convert_precision(data: &mut [f32], precision: PrecisionType) -> Result<(), QuantError> {
    if data.is_empty() {
        return Ok(());
    }
    match precision {
        PrecisionType::Fp32 => {}
        PrecisionType::Fp16 => {
            for x in data.iter_mut() {
                *x = f16::from_f32(*x).to_f32();
            }
        }
        PrecisionType::Fp8 => {
            for x in data.iter_mut() {
                *x = fp8::fp8_to_float(fp8::float_to_fp8(*x, ACTIVATION_FP8), ACTIVATION_FP8);
            }
        }
        PrecisionType::Int8 => {
            let config = QuantConfig::new(QuantType::Int8, true);
            let params = calibrate(data, &config)?;
            fake_quantize(data, &params, &config)?;
        }
        PrecisionType::Dynamic => {
            let config = QuantConfig::new(QuantType::Dynamic, true);
            fake_quantize(data, &QuantParams::default(), &config)?;
        }
    }
    Ok(())
}

/// True when any value in `data` overflows `precision`.
pub fn check_overflow(data: &[f32], precision: PrecisionType) -> bool {
    data.iter().any(|&v| !precision.check_value_range(v))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerPrecisionConfig {
    pub weight_precision: PrecisionType,
    pub grad_precision: PrecisionType,
    pub activation_precision: PrecisionType,
    pub momentum_precision: PrecisionType,
    pub loss_scale: f32,
}

impl Default for LayerPrecisionConfig {
    fn default() -> Self {
        Self {
            weight_precision: PrecisionType::Fp16,
            grad_precision: PrecisionType::Fp16,
            activation_precision: PrecisionType::Fp16,
            momentum_precision: PrecisionType::Fp32,
            loss_scale: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixedPrecisionConfig {
    pub layer_configs: Vec<LayerPrecisionConfig>,
    pub init_loss_scale: f32,
    /// Multiplier (or divisor) applied when the loss scale changes.
    pub loss_scale_factor: f32,
    /// Steps between loss-scale adjustments.
    pub loss_scale_window: u32,
    /// Overflow ratio above which the scale shrinks.
    pub overflow_threshold: f32,
    pub dynamic_loss_scale: bool,
}

impl Default for MixedPrecisionConfig {
    fn default() -> Self {
        Self {
            layer_configs: Vec::new(),
            init_loss_scale: 65536.0,
            loss_scale_factor: 2.0,
            loss_scale_window: 2000,
            overflow_threshold: 0.01,
            dynamic_loss_scale: true,
        }
    }
}

/// Result of [`MixedPrecisionState::backward`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackwardOutcome {
    /// Gradients were scaled and converted.
    Applied,
    /// A scaled gradient overflowed; the step should be skipped.
    Overflow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MixedPrecisionState {
    current_loss_scale: f32,
    overflow_count: u32,
    step_count: u32,
    /// FP32 shadow weights per layer.
    fp32_weights: Vec<Option<Vec<f32>>>,
    weight_sizes: Vec<u64>,
}

impl MixedPrecisionState {
    pub fn new(num_layers: usize, config: &MixedPrecisionConfig) -> Self {
        Self {
            current_loss_scale: config.init_loss_scale,
            overflow_count: 0,
            step_count: 0,
            fp32_weights: vec![None; num_layers],
            weight_sizes: vec![0; num_layers],
        }
    }

    pub fn num_layers(&self) -> usize {
        self.fp32_weights.len()
    }

    pub fn loss_scale(&self) -> f32 {
        self.current_loss_scale
    }

    pub fn overflow_count(&self) -> u32 {
        self.overflow_count
    }

    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    pub fn weight_backup(&self, layer: usize) -> Option<&[f32]> {
        self.fp32_weights.get(layer)?.as_deref()
    }

    fn check_layer(&self, layer: usize) -> Result<(), QuantError> {
        if layer >= self.fp32_weights.len() {
            return Err(QuantError::IndexOutOfRange {
                index: layer,
                len: self.fp32_weights.len(),
            });
        }
        Ok(())
    }

    /// Back up FP32 weights on first use, then convert them to the layer's
    /// weight precision.
    ///
    /// Once a layer has a backup, later calls must pass the same number of
    /// weights; resizing goes through [`Self::post_update`].
    pub fn forward(
        &mut self,
        layer: usize,
        weights: &mut [f32],
        config: &LayerPrecisionConfig,
    ) -> Result<(), QuantError> {
        self.check_layer(layer)?;
        match self.fp32_weights[layer].as_ref().map(Vec::len) {
            Some(expected) if expected != weights.len() => {
                return Err(QuantError::SizeMismatch {
                    expected,
                    actual: weights.len(),
                });
            }
            Some(_) => {}
            None if config.weight_precision != PrecisionType::Fp32 => {
                self.fp32_weights[layer] = Some(weights.to_vec());
            }
            None => {}
        }
        self.weight_sizes[layer] = weights.len() as u64;
        convert_precision(weights, config.weight_precision)
    }

    /// Scale gradients by the loss scale and convert them. On overflow the
    /// gradients are left scaled and unconverted.
    pub fn backward(
        &mut self,
        layer: usize,
        grads: &mut [f32],
        config: &LayerPrecisionConfig,
    ) -> Result<BackwardOutcome, QuantError> {
        self.check_layer(layer)?;
        for g in grads.iter_mut() {
            *g *= self.current_loss_scale;
        }
        if check_overflow(grads, config.grad_precision) {
            self.overflow_count += 1;
            debug!(layer, scale = self.current_loss_scale, "Gradient overflow");
            return Ok(BackwardOutcome::Overflow);
        }
        convert_precision(grads, config.grad_precision)?;
        Ok(BackwardOutcome::Applied)
    }

    /// Restore FP32 weights from the shadow copy and unscale gradients.
    pub fn pre_update(&mut self, layer: usize, weights: &mut [f32], grads: &mut [f32]) -> Result<(), QuantError> {
        self.check_layer(layer)?;
        if let Some(backup) = &self.fp32_weights[layer] {
            if backup.len() != weights.len() {
                return Err(QuantError::SizeMismatch {
                    expected: backup.len(),
                    actual: weights.len(),
                });
            }
            weights.copy_from_slice(backup);
        }
        for g in grads.iter_mut() {
            *g /= self.current_loss_scale;
        }
        Ok(())
    }

    /// Refresh the shadow copy from updated FP32 weights, then convert them back.
    pub fn post_update(
        &mut self,
        layer: usize,
        weights: &mut [f32],
        config: &LayerPrecisionConfig,
    ) -> Result<(), QuantError> {
        self.check_layer(layer)?;
        if let Some(backup) = &mut self.fp32_weights[layer] {
            backup.clear();
            backup.extend_from_slice(weights);
        }
        self.weight_sizes[layer] = weights.len() as u64;
        convert_precision(weights, config.weight_precision)
    }

    /// Count a step; at the end of each window shrink the scale if the
    /// overflow ratio exceeded the threshold, grow it if nothing overflowed.
    pub fn update_loss_scale(&mut self, config: &MixedPrecisionConfig) {
        self.step_count += 1;
        if !config.dynamic_loss_scale || self.step_count < config.loss_scale_window {
            return;
        }
        let ratio = self.overflow_count as f32 / self.step_count as f32;
        let previous = self.current_loss_scale;
        if ratio > config.overflow_threshold {
            self.current_loss_scale /= config.loss_scale_factor;
        } else if self.overflow_count == 0 {
            self.current_loss_scale *= config.loss_scale_factor;
        }
        if previous != self.current_loss_scale {
            debug!(from = previous, to = self.current_loss_scale, ratio, "Loss scale updated");
        }
        if !self.current_loss_scale.is_finite() || self.current_loss_scale == 0.0 {
            warn!(scale = self.current_loss_scale, "Loss scale degenerate, resetting");
            self.current_loss_scale = config.init_loss_scale;
        }
        self.overflow_count = 0;
        self.step_count = 0;
    }

    fn to_payload(&self) -> Vec<u8> {
        let floats: usize = self.fp32_weights.iter().flatten().map(Vec::len).sum();
        let mut buf = Vec::with_capacity(20 + self.num_layers() * 12 + floats * 4);
        buf.put_f32_le(self.current_loss_scale);
        buf.put_u32_le(self.overflow_count);
        buf.put_u32_le(self.step_count);
        buf.put_u64_le(self.num_layers() as u64);
        for (backup, &size) in self.fp32_weights.iter().zip(&self.weight_sizes) {
            // The flag-and-floats section below is sized by this field.
            let size = backup.as_ref().map_or(size, |w| w.len() as u64);
            buf.put_u64_le(size);
        }
        for backup in &self.fp32_weights {
            match backup {
                Some(w) => {
                    buf.put_u32_le(1);
                    for &x in w {
                        buf.put_f32_le(x);
                    }
                }
                _ => buf.put_u32_le(0),
            }
        }
        buf
    }

    fn from_payload(payload: &[u8]) -> Result<Self, StateFileError> {
        let mut r = PayloadReader::new(payload);
        let current_loss_scale = r.f32()?;
        let overflow_count = r.u32()?;
        let step_count = r.u32()?;
        let num_layers = r.u64()? as usize;
        // Each layer needs at least a size and a flag.
        if num_layers > payload.len() / 12 {
            return Err(StateFileError::Malformed(format!(
                "{num_layers} layers in a {}-byte payload",
                payload.len()
            )));
        }
        let weight_sizes = (0..num_layers)
            .map(|_| r.u64())
            .collect::<Result<Vec<_>, _>>()?;
        let mut fp32_weights = Vec::with_capacity(num_layers);
        for &size in &weight_sizes {
            let present = r.u32()?;
            if present != 0 {
                fp32_weights.push(Some(r.f32_vec(size as usize)?));
            } else {
                fp32_weights.push(None);
            }
        }
        r.finish()?;
        Ok(Self {
            current_loss_scale,
            overflow_count,
            step_count,
            fp32_weights,
            weight_sizes,
        })
    }

    pub fn save(&self, path: &Path, options: &SaveOptions) -> Result<(), StateFileError> {
        state_file::write(path, MIXED_PRECISION_MAGIC, &self.to_payload(), options)
    }

    pub fn load(path: &Path, options: &SaveOptions) -> Result<Self, StateFileError> {
        let payload = state_file::read(path, MIXED_PRECISION_MAGIC, options)?;
        Self::from_payload(&payload)
    }

    /// Load into an existing state, which must have the same layer count.
    pub fn restore(&mut self, path: &Path, options: &SaveOptions) -> Result<(), StateFileError> {
        let loaded = Self::load(path, options)?;
        if loaded.num_layers() != self.num_layers() {
            return Err(StateFileError::LayerMismatch {
                expected: self.num_layers(),
                found: loaded.num_layers(),
            });
        }
        *self = loaded;
        Ok(())
    }
}
