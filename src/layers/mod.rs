//! Layer variants that make up a [`crate::LayerGraph`].
//!
//! The set is closed: dense transforms in either storage orientation,
//! normalizations, activations, the packed replacement installed by the
//! rewriter, and the two TEQ wrappers.

mod activation;
mod linear;
mod norm;
mod teq_wrappers;
mod weight_only;

pub use activation::Activation;
pub use linear::{DenseLayer, WeightLayout};
pub use norm::{NormKind, NormLayer};
pub use teq_wrappers::{ALPHA_FLOOR, MovedScales, MulLinear, ScaleHandle, TeqLinearFakeQuant};
pub use weight_only::WeightOnlyLinear;

use std::fmt;

use candle_core::{Device, Tensor};

/// Capability tag of a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Linear,
    Conv1d,
    Norm,
    Activation,
    WeightOnly,
    FakeQuant,
    MulLinear,
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LayerKind::Linear => "linear",
            LayerKind::Conv1d => "conv1d",
            LayerKind::Norm => "norm",
            LayerKind::Activation => "activation",
            LayerKind::WeightOnly => "weight_only_linear",
            LayerKind::FakeQuant => "teq_fake_quant",
            LayerKind::MulLinear => "mul_linear",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum Layer {
    Dense(DenseLayer),
    Norm(NormLayer),
    Activation(Activation),
    WeightOnly(WeightOnlyLinear),
    FakeQuant(TeqLinearFakeQuant),
    MulLinear(MulLinear),
}

impl Layer {
    pub fn kind(&self) -> LayerKind {
        match self {
            Layer::Dense(dense) => match dense.layout() {
                WeightLayout::OutIn => LayerKind::Linear,
                WeightLayout::InOut => LayerKind::Conv1d,
            },
            Layer::Norm(_) => LayerKind::Norm,
            Layer::Activation(_) => LayerKind::Activation,
            Layer::WeightOnly(_) => LayerKind::WeightOnly,
            Layer::FakeQuant(_) => LayerKind::FakeQuant,
            Layer::MulLinear(_) => LayerKind::MulLinear,
        }
    }

    /// Whether the rewriter can quantize this layer's weight
    pub fn is_quantizable(&self) -> bool {
        match self {
            Layer::Dense(_) => true,
            Layer::MulLinear(mul) => mul.inner().is_quantizable(),
            _ => false,
        }
    }

    /// Whether the layer carries affine parameters (always true for dense)
    pub fn has_affine(&self) -> bool {
        match self {
            Layer::Norm(norm) => norm.has_affine(),
            Layer::Activation(_) => false,
            _ => true,
        }
    }

    pub fn in_features(&self) -> Option<usize> {
        match self {
            Layer::Dense(dense) => Some(dense.in_features()),
            Layer::Norm(norm) => Some(norm.num_features),
            Layer::Activation(_) => None,
            Layer::WeightOnly(wo) => Some(wo.in_features()),
            Layer::FakeQuant(fq) => Some(fq.inner().in_features()),
            Layer::MulLinear(mul) => mul.inner().in_features(),
        }
    }

    pub fn out_features(&self) -> Option<usize> {
        match self {
            Layer::Dense(dense) => Some(dense.out_features()),
            Layer::Norm(norm) => Some(norm.num_features),
            Layer::Activation(_) => None,
            Layer::WeightOnly(wo) => Some(wo.out_features()),
            Layer::FakeQuant(fq) => Some(fq.inner().out_features()),
            Layer::MulLinear(mul) => mul.inner().out_features(),
        }
    }

    pub fn forward(&self, x: &Tensor) -> crate::Result<Tensor> {
        match self {
            Layer::Dense(dense) => dense.forward(x),
            Layer::Norm(norm) => norm.forward(x),
            Layer::Activation(act) => act.forward(x),
            Layer::WeightOnly(wo) => wo.forward(x),
            Layer::FakeQuant(fq) => fq.forward(x),
            Layer::MulLinear(mul) => mul.forward(x),
        }
    }

    pub fn to_device(&self, device: &Device) -> crate::Result<Layer> {
        self.to_device_with(device, &mut MovedScales::new())
    }

    /// Move to `device`, reusing scales in `moved` so that wrappers which
    /// shared a trainable scale before the move still share one after it
    pub fn to_device_with(&self, device: &Device, moved: &mut MovedScales) -> crate::Result<Layer> {
        Ok(match self {
            Layer::Dense(dense) => Layer::Dense(dense.to_device(device)?),
            Layer::Norm(norm) => Layer::Norm(norm.to_device(device)?),
            Layer::Activation(act) => Layer::Activation(*act),
            Layer::WeightOnly(wo) => Layer::WeightOnly(wo.to_device(device)?),
            Layer::FakeQuant(fq) => Layer::FakeQuant(fq.to_device(device, moved)?),
            Layer::MulLinear(mul) => Layer::MulLinear(mul.to_device(device, moved)?),
        })
    }
}

impl From<DenseLayer> for Layer {
    fn from(dense: DenseLayer) -> Self {
        Layer::Dense(dense)
    }
}

impl From<NormLayer> for Layer {
    fn from(norm: NormLayer) -> Self {
        Layer::Norm(norm)
    }
}

impl From<Activation> for Layer {
    fn from(act: Activation) -> Self {
        Layer::Activation(act)
    }
}
