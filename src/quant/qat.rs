//! Quantization-aware training state.
//!
//! During the calibration window every forward pass folds the tensor's
//! min/max into an exponential moving average. Once the window closes the
//! averages are frozen into [`QuantParams`] and forward passes apply fake
//! quantization, so later math sees quantization error while staying in
//! `f32`. Gradients use the straight-through estimator clipped to the
//! frozen range.

use std::path::Path;

use bytes::BufMut;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::state_file::{self, PayloadReader, SaveOptions, StateFileError, QAT_MAGIC};
use super::{affine_params, fake_quantize, finite_range, QuantConfig, QuantError, QuantParams};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QatConfig {
    /// Encoding that fake quantization simulates.
    pub quant_config: QuantConfig,

    /// Weight of the previous running value: `running * s + new * (1 - s)`.
    pub smooth_factor: f32,

    /// Recompute params from the running stats every N steps after
    /// calibration (0 disables).
    pub update_step: u64,

    /// Steps before params are frozen.
    pub calibration_steps: u64,

    /// Apply fake quantization after calibration.
    pub fake_quant: bool,
}

impl Default for QatConfig {
    fn default() -> Self {
        Self {
            quant_config: QuantConfig::default(),
            smooth_factor: 0.99,
            update_step: 0,
            calibration_steps: 100,
            fake_quant: true,
        }
    }
}

/// Per-tensor observation state.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct TensorStats {
    running_min: f32,
    running_max: f32,
    observed: bool,
    params: Option<QuantParams>,
}

impl TensorStats {
    fn observe(&mut self, min: f32, max: f32, smooth: f32) {
        if self.observed {
            self.running_min = self.running_min * smooth + min * (1.0 - smooth);
            self.running_max = self.running_max * smooth + max * (1.0 - smooth);
        } else {
            self.running_min = min;
            self.running_max = max;
            self.observed = true;
        }
    }

    fn freeze(&mut self, config: &QuantConfig) {
        if self.observed {
            self.params = Some(params_for(self.running_min, self.running_max, config));
        }
    }
}

fn params_for(min: f32, max: f32, config: &QuantConfig) -> QuantParams {
    let bits = if config.quant_type.is_integer() {
        config.quant_type.bits()
    } else {
        8
    };
    affine_params(min, max, bits, config.symmetric)
}

#[derive(Debug, Clone, PartialEq)]
pub struct QatState {
    tensors: Vec<TensorStats>,
    current_step: u64,
    calibrating: bool,
}

impl QatState {
    pub fn new(num_tensors: usize) -> Result<Self, QuantError> {
        if num_tensors == 0 {
            return Err(QuantError::EmptyInput);
        }
        Ok(Self {
            tensors: vec![TensorStats::default(); num_tensors],
            current_step: 0,
            calibrating: true,
        })
    }

    pub fn num_tensors(&self) -> usize {
        self.tensors.len()
    }

    pub fn current_step(&self) -> u64 {
        self.current_step
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibrating
    }

    /// Frozen params for a tensor, if calibration has produced them.
    pub fn params(&self, idx: usize) -> Option<&QuantParams> {
        self.tensors.get(idx)?.params.as_ref()
    }

    /// Running (min, max) for a tensor, if it has been observed.
    pub fn running_range(&self, idx: usize) -> Option<(f32, f32)> {
        let t = self.tensors.get(idx)?;
        t.observed.then_some((t.running_min, t.running_max))
    }

    fn check_index(&self, idx: usize) -> Result<(), QuantError> {
        if idx >= self.tensors.len() {
            return Err(QuantError::IndexOutOfRange {
                index: idx,
                len: self.tensors.len(),
            });
        }
        Ok(())
    }

    /// Observe `data` and, after calibration, fake-quantize it in place.
    pub fn forward(&mut self, idx: usize, data: &mut [f32], config: &QatConfig) -> Result<(), QuantError> {
        self.check_index(idx)?;
        if data.is_empty() {
            return Err(QuantError::EmptyInput);
        }

        if self.calibrating || config.update_step > 0 {
            if let Some((min, max)) = finite_range(data) {
                self.tensors[idx].observe(min, max, config.smooth_factor);
            }
        }

        if self.calibrating && self.current_step >= config.calibration_steps {
            self.calibrating = false;
            for t in &mut self.tensors {
                t.freeze(&config.quant_config);
            }
            info!(step = self.current_step, "QAT calibration finished");
        }

        if !self.calibrating && config.fake_quant {
            let params = match self.tensors[idx].params {
                Some(p) => p,
                None => {
                    // Never observed during calibration: freeze from this batch.
                    let (min, max) = finite_range(data).ok_or(QuantError::NoFiniteValues)?;
                    let p = params_for(min, max, &config.quant_config);
                    self.tensors[idx].params = Some(p);
                    p
                }
            };
            fake_quantize(data, &params, &config.quant_config)?;
        }
        Ok(())
    }

    /// Straight-through estimator: pass `grad_in` where the forward input was
    /// inside the frozen range, zero elsewhere.
    pub fn backward(
        &self,
        idx: usize,
        grad_in: &[f32],
        original_input: &[f32],
        grad_out: &mut [f32],
        config: &QatConfig,
    ) -> Result<(), QuantError> {
        self.check_index(idx)?;
        if grad_in.len() != grad_out.len() || grad_in.len() != original_input.len() {
            return Err(QuantError::SizeMismatch {
                expected: grad_in.len(),
                actual: grad_out.len().min(original_input.len()),
            });
        }

        match self.tensors[idx].params {
            Some(p) if !self.calibrating && config.fake_quant => {
                for ((out, &g), &x) in grad_out.iter_mut().zip(grad_in).zip(original_input) {
                    *out = if x >= p.min_value && x <= p.max_value { g } else { 0.0 };
                }
            }
            _ => grad_out.copy_from_slice(grad_in),
        }
        Ok(())
    }

    /// Advance one step; refresh params every `update_step` steps once calibrated.
    pub fn update_params(&mut self, config: &QatConfig) {
        self.current_step += 1;
        if !self.calibrating
            && config.update_step > 0
            && self.current_step % config.update_step == 0
        {
            for t in &mut self.tensors {
                t.freeze(&config.quant_config);
            }
            debug!(step = self.current_step, "Refreshed QAT params");
        }
    }

    fn to_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20 + self.tensors.len() * 28);
        buf.put_u64_le(self.tensors.len() as u64);
        buf.put_u64_le(self.current_step);
        buf.put_u32_le(u32::from(self.calibrating));
        for t in &self.tensors {
            let flags = u32::from(t.observed) | (u32::from(t.params.is_some()) << 1);
            buf.put_u32_le(flags);
            buf.put_slice(&t.params.unwrap_or_default().to_bytes());
            buf.put_f32_le(t.running_min);
            buf.put_f32_le(t.running_max);
        }
        buf
    }

    fn from_payload(payload: &[u8]) -> Result<Self, StateFileError> {
        let mut r = PayloadReader::new(payload);
        let count = r.u64()? as usize;
        let current_step = r.u64()?;
        let calibrating = r.u32()? != 0;
        if count == 0 {
            return Err(StateFileError::Malformed("QAT state with no tensors".into()));
        }
        let mut tensors = Vec::new();
        for _ in 0..count {
            let flags = r.u32()?;
            let params = QuantParams::from_bytes(r.bytes(QuantParams::ENCODED_LEN)?)
                .map_err(|e| StateFileError::Malformed(e.to_string()))?;
            let running_min = r.f32()?;
            let running_max = r.f32()?;
            tensors.push(TensorStats {
                running_min,
                running_max,
                observed: flags & 1 != 0,
                params: (flags & 2 != 0).then_some(params),
            });
        }
        r.finish()?;
        Ok(Self {
            tensors,
            current_step,
            calibrating,
        })
    }

    pub fn save(&self, path: &Path, options: &SaveOptions) -> Result<(), StateFileError> {
        state_file::write(path, QAT_MAGIC, &self.to_payload(), options)
    }

    pub fn load(path: &Path, options: &SaveOptions) -> Result<Self, StateFileError> {
        let payload = state_file::read(path, QAT_MAGIC, options)?;
        Self::from_payload(&payload)
    }

    /// Load into an existing state, which must track the same number of tensors.
    pub fn restore(&mut self, path: &Path, options: &SaveOptions) -> Result<(), StateFileError> {
        let loaded = Self::load(path, options)?;
        if loaded.tensors.len() != self.tensors.len() {
            return Err(StateFileError::LayerMismatch {
                expected: self.tensors.len(),
                found: loaded.tensors.len(),
            });
        }
        *self = loaded;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(calibration_steps: u64) -> QatConfig {
        QatConfig {
            calibration_steps,
            smooth_factor: 0.5,
            ..QatConfig::default()
        }
    }

    #[test]
    fn test_first_observation_seeds_running_stats() {
        let cfg = config(10);
        let mut state = QatState::new(1).unwrap();
        state.forward(0, &mut [-1.0, 3.0], &cfg).unwrap();
        assert_eq!(state.running_range(0), Some((-1.0, 3.0)));
        state.forward(0, &mut [-3.0, 1.0], &cfg).unwrap();
        assert_eq!(state.running_range(0), Some((-2.0, 2.0)));
    }

    #[test]
    fn test_calibration_freezes_then_fake_quantizes() {
        let cfg = config(1);
        let mut state = QatState::new(2).unwrap();
        let mut data = [-1.0f32, 0.3, 1.0];
        state.forward(0, &mut data, &cfg).unwrap();
        assert!(state.is_calibrating());
        assert_eq!(data, [-1.0, 0.3, 1.0]);

        state.update_params(&cfg);
        state.forward(0, &mut data, &cfg).unwrap();
        assert!(!state.is_calibrating());
        let p = *state.params(0).unwrap();
        assert!((p.scale - 1.0 / 127.0).abs() < 1e-7);
        // 0.3 snaps to the INT8 grid.
        assert!((data[1] - 0.3).abs() <= p.scale / 2.0);
        assert_ne!(data[1], 0.3);
    }

    #[test]
    fn test_unobserved_tensor_calibrates_from_current_batch() {
        let cfg = config(0);
        let mut state = QatState::new(2).unwrap();
        let mut data = [2.0f32, -2.0];
        state.forward(1, &mut data, &cfg).unwrap();
        let p = state.params(1).unwrap();
        assert_eq!(p.max_value, 2.0);
    }

    #[test]
    fn test_backward_ste() {
        let cfg = config(0);
        let mut state = QatState::new(1).unwrap();
        state.forward(0, &mut [-1.0, 1.0], &cfg).unwrap();

        let grad_in = [1.0f32, 1.0, 1.0];
        let input = [0.5f32, 2.0, -1.5];
        let mut grad_out = [9.0f32; 3];
        state.backward(0, &grad_in, &input, &mut grad_out, &cfg).unwrap();
        assert_eq!(grad_out, [1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_backward_passthrough_while_calibrating() {
        let cfg = config(100);
        let state = QatState::new(1).unwrap();
        let mut grad_out = [0.0f32; 2];
        state
            .backward(0, &[3.0, 4.0], &[100.0, -100.0], &mut grad_out, &cfg)
            .unwrap();
        assert_eq!(grad_out, [3.0, 4.0]);
    }

    #[test]
    fn test_index_out_of_range() {
        let cfg = config(1);
        let mut state = QatState::new(1).unwrap();
        let err = state.forward(3, &mut [1.0], &cfg).unwrap_err();
        assert!(matches!(err, QuantError::IndexOutOfRange { index: 3, len: 1 }));
    }

    #[test]
    fn test_payload_roundtrip() {
        let cfg = config(0);
        let mut state = QatState::new(3).unwrap();
        state.forward(0, &mut [-4.0, 4.0], &cfg).unwrap();
        state.update_params(&cfg);
        let restored = QatState::from_payload(&state.to_payload()).unwrap();
        assert_eq!(restored, state);
    }
}
