//! Pointwise activations. They carry no weights and cannot anchor a scale.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    Gelu,
    Silu,
}

impl Activation {
    pub fn forward(&self, x: &Tensor) -> crate::Result<Tensor> {
        let y = match self {
            Activation::Relu => x.relu()?,
            Activation::Gelu => x.gelu()?,
            Activation::Silu => x.silu()?,
        };
        Ok(y)
    }
}
