//! Double quantization of the per-group scale vector.
//!
//! The primary scales are flattened into a `1 x n` view, regrouped with the
//! secondary group size and run through the same solver. The reconstruction
//! replaces the primary scales before any weight code is computed. Only one
//! level of nesting exists: the secondary `QuantSpec` never carries its own
//! double-quant config.

use tracing::debug;

use super::QuantSpec;
use super::solver::{self, QuantParams};
use crate::WoqError;
use crate::config::{DoubleQuantConfig, QuantDtype};

/// Smallest magnitude a reconstructed scale may take
pub const SCALE_FLOOR: f32 = f32::EPSILON;

/// Quantized scale vector and the recipe that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct DoubleQuantParams {
    pub config: DoubleQuantConfig,
    /// Secondary parameters over the `1 x n` scale view
    pub nested: QuantParams,
}

impl DoubleQuantParams {
    /// Number of primary scales covered
    pub fn len(&self) -> usize {
        self.nested.cols
    }

    pub fn is_empty(&self) -> bool {
        self.nested.cols == 0
    }

    /// Dequantized scales, floored away from zero
    pub fn reconstruct(&self) -> Vec<f32> {
        let mut scales = self.nested.dequantize();
        floor_scales(&mut scales);
        scales
    }
}

/// A scale rounded to zero would erase its whole group, so zeros are
/// replaced with [`SCALE_FLOOR`].
pub fn floor_scales(scales: &mut [f32]) {
    for s in scales.iter_mut() {
        if *s == 0.0 {
            *s = SCALE_FLOOR;
        }
    }
}

/// Quantize `scales` with `cfg` and return their reconstruction.
pub fn quantize_scales(
    scales: &[f32],
    cfg: &DoubleQuantConfig,
) -> crate::Result<(Vec<f32>, DoubleQuantParams)> {
    if cfg.dtype != QuantDtype::Int {
        return Err(WoqError::AssertionError(format!(
            "double quantization only supports int scales, got {}",
            cfg.dtype
        )));
    }

    let spec = QuantSpec::for_scales(cfg);
    let nested = solver::quantize(scales, 1, scales.len(), &spec)?;
    let params = DoubleQuantParams {
        config: cfg.clone(),
        nested,
    };
    let reconstructed = params.reconstruct();

    let max_err = scales
        .iter()
        .zip(reconstructed.iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, f32::max);
    debug!(
        "Double quantized {} scales ({} bits, {:?}, group {}), max error {:.3e}",
        scales.len(),
        cfg.bits,
        cfg.scheme,
        cfg.group_size,
        max_err
    );

    Ok((reconstructed, params))
}
