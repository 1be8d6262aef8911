//! Dense linear transforms in either storage orientation.

use candle_core::{Device, Tensor};

use crate::WoqError;

/// Native storage orientation of a dense weight
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightLayout {
    /// `[out, in]`, the usual linear layout
    OutIn,
    /// `[in, out]`, the Conv1D layout used by GPT-2 style models
    InOut,
}

/// `y = x W^T + b` with a float weight
#[derive(Debug, Clone)]
pub struct DenseLayer {
    weight: Tensor,
    bias: Option<Tensor>,
    layout: WeightLayout,
}

impl DenseLayer {
    /// Linear layer from an `[out, in]` weight
    pub fn linear(weight: Tensor, bias: Option<Tensor>) -> crate::Result<Self> {
        Self::new(weight, bias, WeightLayout::OutIn)
    }

    /// Conv1D-style layer from an `[in, out]` weight
    pub fn conv1d(weight: Tensor, bias: Option<Tensor>) -> crate::Result<Self> {
        Self::new(weight, bias, WeightLayout::InOut)
    }

    pub fn new(weight: Tensor, bias: Option<Tensor>, layout: WeightLayout) -> crate::Result<Self> {
        let (rows, cols) = weight.dims2()?;
        let out_features = match layout {
            WeightLayout::OutIn => rows,
            WeightLayout::InOut => cols,
        };
        if let Some(bias) = &bias {
            if bias.dims() != [out_features] {
                return Err(WoqError::AssertionError(format!(
                    "bias of shape {:?} does not match {} output features",
                    bias.dims(),
                    out_features
                )));
            }
        }
        Ok(Self { weight, bias, layout })
    }

    pub fn layout(&self) -> WeightLayout {
        self.layout
    }

    /// Weight in its native storage orientation
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn in_features(&self) -> usize {
        let dims = self.weight.dims();
        match self.layout {
            WeightLayout::OutIn => dims[1],
            WeightLayout::InOut => dims[0],
        }
    }

    pub fn out_features(&self) -> usize {
        let dims = self.weight.dims();
        match self.layout {
            WeightLayout::OutIn => dims[0],
            WeightLayout::InOut => dims[1],
        }
    }

    /// Weight viewed as `[out, in]` regardless of storage
    pub fn logical_weight(&self) -> crate::Result<Tensor> {
        match self.layout {
            WeightLayout::OutIn => Ok(self.weight.clone()),
            WeightLayout::InOut => Ok(self.weight.t()?.contiguous()?),
        }
    }

    /// Replace the weight with an `[out, in]` tensor, stored natively
    pub fn set_logical_weight(&mut self, weight: Tensor) -> crate::Result<()> {
        let (out, inp) = weight.dims2()?;
        if out != self.out_features() || inp != self.in_features() {
            return Err(WoqError::AssertionError(format!(
                "weight of shape [{}, {}] does not fit a [{}, {}] layer",
                out,
                inp,
                self.out_features(),
                self.in_features()
            )));
        }
        self.weight = match self.layout {
            WeightLayout::OutIn => weight,
            WeightLayout::InOut => weight.t()?.contiguous()?,
        };
        Ok(())
    }

    /// Multiply every input channel `j` of the weight by `scale[j]`
    pub fn scale_input_channels(&mut self, scale: &Tensor) -> crate::Result<()> {
        let scale = scale.to_dtype(self.weight.dtype())?;
        self.weight = match self.layout {
            WeightLayout::OutIn => self.weight.broadcast_mul(&scale.unsqueeze(0)?)?,
            WeightLayout::InOut => self.weight.broadcast_mul(&scale.unsqueeze(1)?)?,
        };
        Ok(())
    }

    /// Multiply every output channel `i` (weight and bias) by `scale[i]`
    pub fn scale_output_channels(&mut self, scale: &Tensor) -> crate::Result<()> {
        let scale = scale.to_dtype(self.weight.dtype())?;
        if let Some(bias) = &self.bias {
            self.bias = Some(bias.mul(&scale.to_dtype(bias.dtype())?)?);
        }
        self.weight = match self.layout {
            WeightLayout::OutIn => self.weight.broadcast_mul(&scale.unsqueeze(1)?)?,
            WeightLayout::InOut => self.weight.broadcast_mul(&scale.unsqueeze(0)?)?,
        };
        Ok(())
    }

    pub fn forward(&self, x: &Tensor) -> crate::Result<Tensor> {
        let y = match self.layout {
            WeightLayout::OutIn => x.broadcast_matmul(&self.weight.t()?)?,
            WeightLayout::InOut => x.broadcast_matmul(&self.weight)?,
        };
        add_bias(y, self.bias.as_ref())
    }

    pub fn to_device(&self, device: &Device) -> crate::Result<Self> {
        Ok(Self {
            weight: self.weight.to_device(device)?,
            bias: self.bias.as_ref().map(|b| b.to_device(device)).transpose()?,
            layout: self.layout,
        })
    }
}

pub(crate) fn add_bias(y: Tensor, bias: Option<&Tensor>) -> crate::Result<Tensor> {
    match bias {
        Some(bias) => Ok(y.broadcast_add(bias)?),
        None => Ok(y),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn weight() -> Tensor {
        Tensor::arange(0f32, 6.0, &Device::Cpu)
            .unwrap()
            .reshape((2, 3))
            .unwrap()
    }

    #[test]
    fn test_orientations_agree() {
        let w = weight();
        let bias = Tensor::new(&[0.5f32, -1.0], &Device::Cpu).unwrap();
        let linear = DenseLayer::linear(w.clone(), Some(bias.clone())).unwrap();
        let conv = DenseLayer::conv1d(w.t().unwrap().contiguous().unwrap(), Some(bias)).unwrap();
        assert_eq!(linear.in_features(), 3);
        assert_eq!(conv.in_features(), 3);
        assert_eq!(conv.out_features(), 2);

        let x = Tensor::new(&[[[1f32, 2.0, 3.0]], [[-1.0, 0.0, 1.0]]], &Device::Cpu).unwrap();
        let a = linear.forward(&x).unwrap().to_vec3::<f32>().unwrap();
        let b = conv.forward(&x).unwrap().to_vec3::<f32>().unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0][0], vec![8.5, 25.0]);
    }

    #[test]
    fn test_channel_scaling() {
        let mut linear = DenseLayer::linear(weight(), None).unwrap();
        let mut conv = DenseLayer::conv1d(weight().t().unwrap().contiguous().unwrap(), None).unwrap();
        let s = Tensor::new(&[1f32, 2.0, 3.0], &Device::Cpu).unwrap();
        linear.scale_input_channels(&s).unwrap();
        conv.scale_input_channels(&s).unwrap();
        let expected = vec![vec![0f32, 2.0, 6.0], vec![3.0, 8.0, 15.0]];
        assert_eq!(linear.logical_weight().unwrap().to_vec2::<f32>().unwrap(), expected);
        assert_eq!(conv.logical_weight().unwrap().to_vec2::<f32>().unwrap(), expected);

        let s = Tensor::new(&[2f32, 0.5], &Device::Cpu).unwrap();
        conv.scale_output_channels(&s).unwrap();
        assert_eq!(
            conv.logical_weight().unwrap().to_vec2::<f32>().unwrap(),
            vec![vec![0f32, 4.0, 12.0], vec![1.5, 4.0, 7.5]]
        );
    }

    #[test]
    fn test_shape_checks() {
        let bad_bias = Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap();
        assert!(DenseLayer::linear(weight(), Some(bad_bias)).is_err());

        let mut linear = DenseLayer::linear(weight(), None).unwrap();
        assert!(linear.set_logical_weight(weight().t().unwrap()).is_err());
    }
}
