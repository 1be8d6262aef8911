//! Narrow floating-point cast (FP8 variants).
//!
//! FP8 weights carry no group scale: every element is rounded to the nearest
//! value representable in the target format and immediately widened back
//! (quantize-dequantize), emulating native low-precision storage.

use candle_core::{DType, Tensor};

use crate::config::QuantDtype;

/// Bit layout of an 8-bit float format
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fp8Format {
    /// Explicit mantissa bits
    pub mantissa_bits: i32,
    /// Exponent of the smallest normal value (subnormals share its step)
    pub min_exponent: i32,
    /// Largest finite magnitude
    pub max_value: f32,
}

impl Fp8Format {
    /// E4M3, bias 7, no infinities
    pub const E4M3FN: Self = Self { mantissa_bits: 3, min_exponent: -6, max_value: 448.0 };
    /// E4M3, bias 8, unsigned zero
    pub const E4M3FNUZ: Self = Self { mantissa_bits: 3, min_exponent: -7, max_value: 240.0 };
    /// E5M2, bias 15
    pub const E5M2: Self = Self { mantissa_bits: 2, min_exponent: -14, max_value: 57344.0 };
    /// E5M2, bias 16, unsigned zero
    pub const E5M2FNUZ: Self = Self { mantissa_bits: 2, min_exponent: -15, max_value: 57344.0 };

    pub fn for_dtype(dtype: QuantDtype) -> Option<Self> {
        match dtype {
            QuantDtype::Fp8E4m3fn => Some(Self::E4M3FN),
            QuantDtype::Fp8E4m3fnuz => Some(Self::E4M3FNUZ),
            QuantDtype::Fp8E5m2 => Some(Self::E5M2),
            QuantDtype::Fp8E5m2fnuz => Some(Self::E5M2FNUZ),
            _ => None,
        }
    }

    /// Round to the nearest representable value (ties to even),
    /// saturating at the largest finite magnitude.
    pub fn round(&self, value: f32) -> f32 {
        if value.is_nan() || value == 0.0 {
            return value;
        }

        let sign = value.signum();
        let magnitude = value.abs();
        if magnitude >= self.max_value {
            return sign * self.max_value;
        }

        // f32 subnormals report -127 and fall into the format's subnormal range
        let exponent = ((magnitude.to_bits() >> 23) & 0xff) as i32 - 127;
        let exponent = exponent.max(self.min_exponent);
        let step = 2f32.powi(exponent - self.mantissa_bits);
        let rounded = (magnitude / step).round_ties_even() * step;

        sign * rounded.min(self.max_value)
    }
}

/// Quantize-dequantize a slice in place
pub fn cast_slice(values: &mut [f32], format: Fp8Format) {
    for v in values.iter_mut() {
        *v = format.round(*v);
    }
}

/// Cast a tensor through an FP8 format and back, keeping shape and dtype.
pub fn cast_fp8(weight: &Tensor, dtype: QuantDtype) -> crate::Result<Tensor> {
    let format = Fp8Format::for_dtype(dtype).ok_or_else(|| {
        crate::WoqError::QuantizationError(format!("{} is not an FP8 dtype", dtype))
    })?;

    let shape: Vec<usize> = weight.dims().to_vec();
    let mut data: Vec<f32> = weight.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
    cast_slice(&mut data, format);

    let tensor = Tensor::from_vec(data, shape.as_slice(), weight.device())?;
    tensor.to_dtype(weight.dtype()).map_err(Into::into)
}
