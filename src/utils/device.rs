//! Device and data type utilities.

use candle_core::{Device as CandleDevice, DType as CandleDType};
use tracing::{debug, info, warn};

use crate::WoqError;

/// Re-export candle Device for convenience
pub type Device = CandleDevice;

/// Re-export candle DType for convenience
pub type DType = CandleDType;

/// Pick the device to quantize on: CUDA, then Metal, then CPU.
///
/// `device_id` is the accelerator ordinal and is ignored on CPU-only builds.
#[allow(unused_variables)]
pub fn get_device(device_id: Option<usize>) -> crate::Result<Device> {
    let ordinal = device_id.unwrap_or(0);

    #[cfg(feature = "cuda")]
    if let Some(device) = open_backend("CUDA", ordinal, CandleDevice::new_cuda) {
        return Ok(device);
    }

    #[cfg(feature = "metal")]
    if let Some(device) = open_backend("Metal", ordinal, CandleDevice::new_metal) {
        return Ok(device);
    }

    debug!("No accelerator selected, quantizing on CPU");
    Ok(CandleDevice::Cpu)
}

#[allow(dead_code)]
fn open_backend(
    backend: &str,
    ordinal: usize,
    open: fn(usize) -> candle_core::Result<Device>,
) -> Option<Device> {
    match open(ordinal) {
        Ok(device) => {
            info!("Quantizing on {} device {}", backend, ordinal);
            Some(device)
        }
        Err(e) => {
            warn!("{} device {} unavailable: {}", backend, ordinal, e);
            None
        }
    }
}

/// Parse a dtype name as written in saved layer records
pub fn parse_dtype(dtype_str: &str) -> crate::Result<CandleDType> {
    match dtype_str.to_lowercase().as_str() {
        "f32" | "float32" | "float" => Ok(CandleDType::F32),
        "f16" | "float16" | "half" => Ok(CandleDType::F16),
        "bf16" | "bfloat16" => Ok(CandleDType::BF16),
        "f64" | "float64" | "double" => Ok(CandleDType::F64),
        other => Err(WoqError::SerializationError(format!(
            "Unknown tensor dtype '{}'",
            other
        ))),
    }
}

/// Canonical name accepted by [`parse_dtype`]
pub fn dtype_name(dtype: CandleDType) -> &'static str {
    match dtype {
        CandleDType::F16 => "f16",
        CandleDType::BF16 => "bf16",
        CandleDType::F64 => "f64",
        _ => "f32",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_names_round_trip() {
        for dtype in [CandleDType::F32, CandleDType::F16, CandleDType::BF16, CandleDType::F64] {
            assert_eq!(parse_dtype(dtype_name(dtype)).unwrap(), dtype);
        }
        assert!(parse_dtype("int3").is_err());
    }

    #[test]
    fn test_cpu_fallback() {
        let device = get_device(None).unwrap();
        if !cfg!(any(feature = "cuda", feature = "metal")) {
            assert!(matches!(device, Device::Cpu));
        }
    }
}
