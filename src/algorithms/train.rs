//! Calibration data and the optimizer settings used to tune TEQ scales.

use std::collections::HashMap;
use std::f64::consts::PI;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::WoqError;

/// Learning-rate schedule applied on top of the base rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedulerType {
    /// Linear warmup, then linear decay to zero
    #[default]
    Linear,
    /// Linear warmup, then half a cosine period down to zero
    Cosine,
    Constant,
    ConstantWithWarmup,
}

impl LrSchedulerType {
    /// Multiplier of the base rate after `step` optimizer updates
    pub fn factor(&self, step: usize, warmup: usize, total: usize) -> f64 {
        let warming = step < warmup;
        let warm = step as f64 / warmup.max(1) as f64;
        match self {
            LrSchedulerType::Constant => 1.0,
            LrSchedulerType::ConstantWithWarmup => {
                if warming {
                    warm
                } else {
                    1.0
                }
            }
            LrSchedulerType::Linear => {
                if warming {
                    warm
                } else {
                    let remaining = total.saturating_sub(step) as f64;
                    (remaining / total.saturating_sub(warmup).max(1) as f64).max(0.0)
                }
            }
            LrSchedulerType::Cosine => {
                if warming {
                    warm
                } else {
                    let progress = (step - warmup) as f64 / total.saturating_sub(warmup).max(1) as f64;
                    (0.5 * (1.0 + (PI * progress).cos())).max(0.0)
                }
            }
        }
    }
}

/// Optimizer and loop settings for [`train`](super::TrainableEquivalentTransformation::train)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Forward/backward passes to run; the loop stops here, not on convergence
    pub train_steps: usize,
    pub lr: f64,
    /// Share of `train_steps` spent warming up
    pub warmup_ratio: f64,
    pub gradient_accumulation_steps: usize,
    /// Log loss every this many passes
    pub logging_steps: usize,
    pub beta1: f64,
    pub beta2: f64,
    pub weight_decay: f64,
    pub lr_scheduler_type: LrSchedulerType,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            train_steps: 1000,
            lr: 1e-3,
            warmup_ratio: 0.05,
            gradient_accumulation_steps: 1,
            logging_steps: 10,
            beta1: 0.9,
            beta2: 0.9,
            weight_decay: 0.0,
            lr_scheduler_type: LrSchedulerType::Linear,
        }
    }
}

impl TrainConfig {
    pub fn with_steps(mut self, train_steps: usize) -> Self {
        self.train_steps = train_steps;
        self
    }

    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    pub fn accumulation(&self) -> usize {
        self.gradient_accumulation_steps.max(1)
    }

    /// Optimizer updates over the whole run
    pub fn total_updates(&self) -> usize {
        self.train_steps / self.accumulation()
    }

    /// Optimizer updates spent warming up
    pub fn warmup_updates(&self) -> usize {
        (self.train_steps as f64 * self.warmup_ratio) as usize / self.accumulation()
    }

    /// Learning rate in effect after `update` optimizer steps
    pub fn lr_at(&self, update: usize) -> f64 {
        self.lr
            * self
                .lr_scheduler_type
                .factor(update, self.warmup_updates(), self.total_updates())
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.train_steps == 0 {
            return Err(WoqError::TrainingError("train_steps must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.warmup_ratio) {
            return Err(WoqError::TrainingError(format!(
                "warmup_ratio {} is outside [0, 1]",
                self.warmup_ratio
            )));
        }
        if self.lr <= 0.0 || !self.lr.is_finite() {
            return Err(WoqError::TrainingError(format!("invalid learning rate {}", self.lr)));
        }
        Ok(())
    }
}

/// One element of a calibration stream
#[derive(Debug, Clone)]
pub enum CalibrationBatch {
    Tensor(Tensor),
    /// Named model inputs; the model consumes `input_ids`
    Keyed(HashMap<String, Tensor>),
}

impl CalibrationBatch {
    /// Tensor fed to the model
    pub fn input_ids(&self) -> crate::Result<&Tensor> {
        match self {
            CalibrationBatch::Tensor(t) => Ok(t),
            CalibrationBatch::Keyed(map) => map.get("input_ids").ok_or_else(|| {
                WoqError::TrainingError(format!(
                    "calibration batch has no 'input_ids' (keys: {:?})",
                    map.keys().collect::<Vec<_>>()
                ))
            }),
        }
    }
}

impl From<Tensor> for CalibrationBatch {
    fn from(t: Tensor) -> Self {
        CalibrationBatch::Tensor(t)
    }
}

/// Restartable sequence of calibration batches
pub trait CalibrationSource {
    /// Fresh pass over the data, from the beginning
    fn batches(&self) -> Box<dyn Iterator<Item = CalibrationBatch> + '_>;
}

impl CalibrationSource for [Tensor] {
    fn batches(&self) -> Box<dyn Iterator<Item = CalibrationBatch> + '_> {
        Box::new(self.iter().cloned().map(CalibrationBatch::Tensor))
    }
}

impl CalibrationSource for Vec<Tensor> {
    fn batches(&self) -> Box<dyn Iterator<Item = CalibrationBatch> + '_> {
        self.as_slice().batches()
    }
}

impl CalibrationSource for Vec<CalibrationBatch> {
    fn batches(&self) -> Box<dyn Iterator<Item = CalibrationBatch> + '_> {
        Box::new(self.iter().cloned())
    }
}
