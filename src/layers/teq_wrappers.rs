//! Wrappers installed while TEQ scales are being tuned or kept unfolded.

use std::collections::HashMap;

use candle_core::{Device, Tensor, TensorId, Var};

use super::Layer;
use super::linear::{DenseLayer, add_bias};
use crate::config::GroupAxis;
use crate::quantization::{QuantSpec, qdq_weight};

/// Lower bound applied to a scale before it divides anything
pub const ALPHA_FLOOR: f64 = 1e-5;

/// Trainable scales already moved during one device transfer, keyed by the
/// id of the variable they were copied from
pub type MovedScales = HashMap<TensorId, Var>;

/// A per-input-channel scale, either optimized or fixed at its initial value
#[derive(Debug, Clone)]
pub enum ScaleHandle {
    /// Shared with the optimizer; every wrapper of an absorption group
    /// holds a clone of the same variable.
    Trainable(Var),
    Frozen(Tensor),
}

impl ScaleHandle {
    pub fn tensor(&self) -> &Tensor {
        match self {
            ScaleHandle::Trainable(var) => var.as_tensor(),
            ScaleHandle::Frozen(tensor) => tensor,
        }
    }

    pub fn is_trainable(&self) -> bool {
        matches!(self, ScaleHandle::Trainable(_))
    }

    /// Copy to `device`. A trainable scale is moved once per transfer and
    /// every later holder of the same variable gets that copy.
    pub fn to_device(&self, device: &Device, moved: &mut MovedScales) -> crate::Result<Self> {
        match self {
            ScaleHandle::Trainable(var) => {
                let id = var.as_tensor().id();
                if let Some(copy) = moved.get(&id) {
                    return Ok(ScaleHandle::Trainable(copy.clone()));
                }
                let copy = Var::from_tensor(&var.as_tensor().to_device(device)?)?;
                moved.insert(id, copy.clone());
                Ok(ScaleHandle::Trainable(copy))
            }
            ScaleHandle::Frozen(t) => Ok(ScaleHandle::Frozen(t.to_device(device)?)),
        }
    }
}

/// Dense layer whose input is divided by `alpha` and whose weight is
/// multiplied by `alpha` and fake-quantized. Gradients reach `alpha`
/// through a straight-through estimator around the rounding.
#[derive(Debug, Clone)]
pub struct TeqLinearFakeQuant {
    inner: DenseLayer,
    alpha: ScaleHandle,
    spec: QuantSpec,
    axis: GroupAxis,
}

impl TeqLinearFakeQuant {
    pub fn new(inner: DenseLayer, alpha: ScaleHandle, spec: QuantSpec, axis: GroupAxis) -> Self {
        Self { inner, alpha, spec, axis }
    }

    pub fn inner(&self) -> &DenseLayer {
        &self.inner
    }

    pub fn alpha(&self) -> &ScaleHandle {
        &self.alpha
    }

    pub fn spec(&self) -> &QuantSpec {
        &self.spec
    }

    pub fn axis(&self) -> GroupAxis {
        self.axis
    }

    pub fn forward(&self, x: &Tensor) -> crate::Result<Tensor> {
        let alpha = self.alpha.tensor().maximum(ALPHA_FLOOR)?;
        let alpha = alpha.to_dtype(x.dtype())?;
        let x = x.broadcast_div(&alpha)?;

        let weight = self.inner.logical_weight()?;
        let weight = weight.broadcast_mul(&alpha.to_dtype(weight.dtype())?.unsqueeze(0)?)?;
        let frozen = weight.detach();
        let quantized = qdq_weight(&frozen, &self.spec, self.axis)?;
        // forward sees the quantized weight, backward sees the identity
        let weight = (&weight + (quantized - frozen)?)?;

        let y = x.broadcast_matmul(&weight.t()?)?;
        add_bias(y, self.inner.bias())
    }

    pub fn to_device(&self, device: &Device, moved: &mut MovedScales) -> crate::Result<Self> {
        Ok(Self {
            inner: self.inner.to_device(device)?,
            alpha: self.alpha.to_device(device, moved)?,
            spec: self.spec.clone(),
            axis: self.axis,
        })
    }
}

/// Multiplies its input by a fixed per-channel scale before the wrapped
/// layer, keeping an unfolded TEQ scale explicit in the graph.
#[derive(Debug, Clone)]
pub struct MulLinear {
    input_scale: Tensor,
    inner: Box<Layer>,
}

impl MulLinear {
    pub fn new(inner: Layer, input_scale: Tensor) -> Self {
        Self {
            input_scale,
            inner: Box::new(inner),
        }
    }

    pub fn input_scale(&self) -> &Tensor {
        &self.input_scale
    }

    pub fn inner(&self) -> &Layer {
        &self.inner
    }

    pub fn forward(&self, x: &Tensor) -> crate::Result<Tensor> {
        let scale = self.input_scale.to_dtype(x.dtype())?;
        self.inner.forward(&x.broadcast_mul(&scale)?)
    }

    pub fn to_device(&self, device: &Device, moved: &mut MovedScales) -> crate::Result<Self> {
        Ok(Self {
            input_scale: self.input_scale.to_device(device)?,
            inner: Box::new(self.inner.to_device_with(device, moved)?),
        })
    }
}
