//! Normalization layers over the trailing feature dimension.
//!
//! Forward passes are written with primitive tensor ops so gradients flow
//! through them during scale training.

use candle_core::{D, DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::WoqError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormKind {
    LayerNorm,
    /// Root-mean-square norm: weight only, no centering
    RmsNorm,
    /// Batch norm with frozen running statistics
    BatchNorm,
    GroupNorm { groups: usize },
}

/// A normalization layer, optionally with affine parameters
#[derive(Debug, Clone)]
pub struct NormLayer {
    pub kind: NormKind,
    pub num_features: usize,
    pub eps: f64,
    pub weight: Option<Tensor>,
    pub bias: Option<Tensor>,
    pub running_mean: Option<Tensor>,
    pub running_var: Option<Tensor>,
}

impl NormLayer {
    pub fn new(kind: NormKind, num_features: usize, eps: f64) -> crate::Result<Self> {
        if let NormKind::GroupNorm { groups } = kind {
            if groups == 0 || num_features % groups != 0 {
                return Err(WoqError::AssertionError(format!(
                    "{} features cannot be split into {} groups",
                    num_features, groups
                )));
            }
        }
        Ok(Self {
            kind,
            num_features,
            eps,
            weight: None,
            bias: None,
            running_mean: None,
            running_var: None,
        })
    }

    pub fn layer_norm(weight: Tensor, bias: Tensor, eps: f64) -> crate::Result<Self> {
        let features = weight.dims1()?;
        Self::new(NormKind::LayerNorm, features, eps)?.with_affine(weight, Some(bias))
    }

    pub fn rms_norm(weight: Tensor, eps: f64) -> crate::Result<Self> {
        let features = weight.dims1()?;
        Self::new(NormKind::RmsNorm, features, eps)?.with_affine(weight, None)
    }

    pub fn with_affine(mut self, weight: Tensor, bias: Option<Tensor>) -> crate::Result<Self> {
        check_features(&weight, self.num_features, "weight")?;
        if let Some(bias) = &bias {
            check_features(bias, self.num_features, "bias")?;
        }
        self.weight = Some(weight);
        self.bias = bias;
        Ok(self)
    }

    pub fn with_running_stats(mut self, mean: Tensor, var: Tensor) -> crate::Result<Self> {
        check_features(&mean, self.num_features, "running_mean")?;
        check_features(&var, self.num_features, "running_var")?;
        self.running_mean = Some(mean);
        self.running_var = Some(var);
        Ok(self)
    }

    pub fn has_affine(&self) -> bool {
        self.weight.is_some()
    }

    /// Fold a per-feature multiplier into the affine parameters.
    ///
    /// Layers without affine parameters gain a weight equal to `scale`
    /// (and a zero bias where the kind supports one).
    pub fn absorb_scale(&mut self, scale: &Tensor) -> crate::Result<()> {
        check_features(scale, self.num_features, "scale")?;
        let carries_bias = self.kind != NormKind::RmsNorm;

        match &self.weight {
            Some(weight) => {
                self.weight = Some(weight.mul(&scale.to_dtype(weight.dtype())?)?);
                if let Some(bias) = &self.bias {
                    self.bias = Some(bias.mul(&scale.to_dtype(bias.dtype())?)?);
                }
            }
            None => {
                self.weight = Some(scale.clone());
                if carries_bias {
                    self.bias = Some(scale.zeros_like()?);
                }
            }
        }
        Ok(())
    }

    pub fn forward(&self, x: &Tensor) -> crate::Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;

        let normalized = match self.kind {
            NormKind::LayerNorm => {
                let centered = x.broadcast_sub(&x.mean_keepdim(D::Minus1)?)?;
                let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
                centered.broadcast_div(&(variance + self.eps)?.sqrt()?)?
            }
            NormKind::RmsNorm => {
                let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
                x.broadcast_div(&(variance + self.eps)?.sqrt()?)?
            }
            NormKind::BatchNorm => {
                let centered = match &self.running_mean {
                    Some(mean) => x.broadcast_sub(&mean.to_dtype(DType::F32)?)?,
                    None => x,
                };
                match &self.running_var {
                    Some(var) => {
                        let std = (var.to_dtype(DType::F32)? + self.eps)?.sqrt()?;
                        centered.broadcast_div(&std)?
                    }
                    None => (centered / (1.0 + self.eps).sqrt())?,
                }
            }
            NormKind::GroupNorm { groups } => {
                let dims = x.dims().to_vec();
                let mut grouped = dims[..dims.len() - 1].to_vec();
                grouped.push(groups);
                grouped.push(self.num_features / groups);
                let xg = x.reshape(grouped)?;
                let centered = xg.broadcast_sub(&xg.mean_keepdim(D::Minus1)?)?;
                let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
                centered
                    .broadcast_div(&(variance + self.eps)?.sqrt()?)?
                    .reshape(dims)?
            }
        };

        let mut y = normalized;
        if let Some(weight) = &self.weight {
            y = y.broadcast_mul(&weight.to_dtype(DType::F32)?)?;
        }
        if let Some(bias) = &self.bias {
            y = y.broadcast_add(&bias.to_dtype(DType::F32)?)?;
        }
        Ok(y.to_dtype(dtype)?)
    }

    pub fn to_device(&self, device: &Device) -> crate::Result<Self> {
        let move_opt = |t: &Option<Tensor>| t.as_ref().map(|t| t.to_device(device)).transpose();
        Ok(Self {
            kind: self.kind,
            num_features: self.num_features,
            eps: self.eps,
            weight: move_opt(&self.weight)?,
            bias: move_opt(&self.bias)?,
            running_mean: move_opt(&self.running_mean)?,
            running_var: move_opt(&self.running_var)?,
        })
    }
}

fn check_features(t: &Tensor, features: usize, what: &str) -> crate::Result<()> {
    if t.dims() != [features] {
        return Err(WoqError::AssertionError(format!(
            "norm {} of shape {:?} does not match {} features",
            what,
            t.dims(),
            features
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> Tensor {
        Tensor::new(&[[1f32, 2.0, 3.0, 6.0], [-1.0, 0.5, 0.0, 2.5]], &Device::Cpu).unwrap()
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_layer_norm_statistics() {
        let norm = NormLayer::new(NormKind::LayerNorm, 4, 1e-6).unwrap();
        let y = norm.forward(&input()).unwrap();
        let mean = y.mean_keepdim(D::Minus1).unwrap().flatten_all().unwrap();
        for m in mean.to_vec1::<f32>().unwrap() {
            assert!(m.abs() < 1e-5);
        }
    }

    #[test]
    fn test_absorb_matches_output_scaling() {
        let scale = Tensor::new(&[0.5f32, 2.0, 1.5, 0.25], &Device::Cpu).unwrap();
        let kinds = [
            NormKind::LayerNorm,
            NormKind::RmsNorm,
            NormKind::BatchNorm,
            NormKind::GroupNorm { groups: 2 },
        ];
        for kind in kinds {
            for affine in [false, true] {
                let mut norm = NormLayer::new(kind, 4, 1e-5).unwrap();
                if affine {
                    let w = Tensor::new(&[1.0f32, -0.5, 2.0, 0.3], &Device::Cpu).unwrap();
                    let b = Tensor::new(&[0.1f32, 0.2, -0.3, 0.0], &Device::Cpu).unwrap();
                    let bias = (kind != NormKind::RmsNorm).then_some(b);
                    norm = norm.with_affine(w, bias).unwrap();
                }
                let expected = norm.forward(&input()).unwrap().broadcast_mul(&scale).unwrap();
                norm.absorb_scale(&scale).unwrap();
                assert!(norm.has_affine());
                let got = norm.forward(&input()).unwrap();
                assert!(max_diff(&expected, &got) < 1e-5, "{:?} affine={}", kind, affine);
            }
        }
    }

    #[test]
    fn test_rms_norm_never_gains_bias() {
        let mut norm = NormLayer::new(NormKind::RmsNorm, 4, 1e-6).unwrap();
        norm.absorb_scale(&Tensor::ones(4, DType::F32, &Device::Cpu).unwrap()).unwrap();
        assert!(norm.bias.is_none());
    }

    #[test]
    fn test_group_norm_shape_check() {
        assert!(NormLayer::new(NormKind::GroupNorm { groups: 3 }, 4, 1e-5).is_err());
    }
}
