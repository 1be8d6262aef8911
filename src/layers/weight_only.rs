//! Linear layer backed by packed low-bit weights.

use candle_core::{DType, Device, Tensor};

use super::linear::{WeightLayout, add_bias};
use crate::config::DequantMode;
use crate::quantization::QuantizedTensor;

/// Drop-in replacement for a dense layer: same features and bias, but the
/// weight lives as packed codes plus per-group scales and is reconstructed
/// on read.
#[derive(Debug, Clone)]
pub struct WeightOnlyLinear {
    packed: QuantizedTensor,
    bias: Option<Tensor>,
    /// Orientation of the dense layer this one replaced
    source_layout: WeightLayout,
    mode: DequantMode,
    device: Device,
    dtype: DType,
    /// Dense weight kept around in ahead-of-time mode
    cache: Option<Tensor>,
}

impl WeightOnlyLinear {
    pub fn new(
        packed: QuantizedTensor,
        bias: Option<Tensor>,
        source_layout: WeightLayout,
        mode: DequantMode,
        device: &Device,
        dtype: DType,
    ) -> crate::Result<Self> {
        let mut layer = Self {
            packed,
            bias,
            source_layout,
            mode,
            device: device.clone(),
            dtype,
            cache: None,
        };
        layer.refresh_cache()?;
        Ok(layer)
    }

    fn refresh_cache(&mut self) -> crate::Result<()> {
        self.cache = match self.mode {
            DequantMode::AheadOfTime => Some(self.packed.to_tensor(&self.device, self.dtype)?),
            DequantMode::OnTheFly => None,
        };
        Ok(())
    }

    pub fn packed(&self) -> &QuantizedTensor {
        &self.packed
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn source_layout(&self) -> WeightLayout {
        self.source_layout
    }

    pub fn mode(&self) -> DequantMode {
        self.mode
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn in_features(&self) -> usize {
        self.packed.shape[1]
    }

    pub fn out_features(&self) -> usize {
        self.packed.shape[0]
    }

    /// Reconstructed `[out, in]` weight
    pub fn weight(&self) -> crate::Result<Tensor> {
        match &self.cache {
            Some(weight) => Ok(weight.clone()),
            None => self.packed.to_tensor(&self.device, self.dtype),
        }
    }

    pub fn forward(&self, x: &Tensor) -> crate::Result<Tensor> {
        let weight = self.weight()?;
        let y = x.broadcast_matmul(&weight.t()?)?;
        add_bias(y, self.bias.as_ref())
    }

    pub fn to_device(&self, device: &Device) -> crate::Result<Self> {
        Self::new(
            self.packed.clone(),
            self.bias.as_ref().map(|b| b.to_device(device)).transpose()?,
            self.source_layout,
            self.mode,
            device,
            self.dtype,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GroupAxis, Scheme};
    use crate::layers::DenseLayer;
    use crate::quantization::{QuantSpec, quantize};

    #[test]
    fn test_forward_matches_dequantized_dense() {
        let data: Vec<f32> = (0..8 * 16).map(|i| ((i % 13) as f32 - 6.0) / 10.0).collect();
        let params = quantize(&data, 8, 16, &QuantSpec::int(4, Scheme::Asym, 8)).unwrap();
        let packed = QuantizedTensor::pack(&params, GroupAxis::Input).unwrap();
        let bias = Tensor::ones(8, DType::F32, &Device::Cpu).unwrap();

        let dense_weight = Tensor::from_vec(params.dequantize(), (8, 16), &Device::Cpu).unwrap();
        let dense = DenseLayer::linear(dense_weight, Some(bias.clone())).unwrap();
        let x = Tensor::ones((2, 3, 16), DType::F32, &Device::Cpu).unwrap();
        let expected = dense.forward(&x).unwrap().to_vec3::<f32>().unwrap();

        for mode in [DequantMode::OnTheFly, DequantMode::AheadOfTime] {
            let layer = WeightOnlyLinear::new(
                packed.clone(),
                Some(bias.clone()),
                WeightLayout::OutIn,
                mode,
                &Device::Cpu,
                DType::F32,
            )
            .unwrap();
            assert_eq!(layer.in_features(), 16);
            assert_eq!(layer.out_features(), 8);
            assert_eq!(layer.forward(&x).unwrap().to_vec3::<f32>().unwrap(), expected);
        }
    }
}
