//! Quantization parameter solver and packed weight storage.
//!
//! Three dtype families share one entry point:
//! - uniform integer grids (symmetric or asymmetric, 1-8 bits)
//! - fixed codebooks (NF4 and the FP4 variants, 4-bit indices)
//! - narrow float casts (FP8 variants, no grouping at all)
//!
//! Weights are handed to the solver as a row-major "grouped view": every row
//! is split into contiguous groups along its columns. Callers that need to
//! group along the other axis transpose before solving (see
//! [`QuantizedTensor::pack`]).

pub mod codebook;
pub mod double_quant;
pub mod fp8;
pub mod search;
pub mod solver;
mod tensor;
pub mod uniform;

pub use double_quant::DoubleQuantParams;
pub use fp8::{Fp8Format, cast_fp8};
pub use search::search_clip;
pub use solver::{ClipRatios, QuantParams, qdq_tensor, qdq_weight, quantize, quantize_clipped};
pub use tensor::{PackedMeta, QuantizedTensor, pack_bits, unpack_bits};

use crate::config::{DoubleQuantConfig, LayerConfig, QuantDtype, Scheme};

/// How a dtype maps weights onto representable values
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DtypeFamily {
    /// Evenly spaced integer grid with a per-group scale
    Uniform,
    /// Scaled lookup table
    Codebook(&'static [f32]),
    /// Element-wise cast through an 8-bit float format
    NarrowFloat(Fp8Format),
    /// Left in full precision
    Passthrough,
}

impl QuantDtype {
    pub fn family(&self) -> DtypeFamily {
        if let Some(table) = codebook::table(*self) {
            return DtypeFamily::Codebook(table);
        }
        if let Some(format) = Fp8Format::for_dtype(*self) {
            return DtypeFamily::NarrowFloat(format);
        }
        match self {
            QuantDtype::Fp32 => DtypeFamily::Passthrough,
            _ => DtypeFamily::Uniform,
        }
    }
}

/// Solver inputs for one weight tensor
#[derive(Debug, Clone, PartialEq)]
pub struct QuantSpec {
    pub dtype: QuantDtype,
    pub bits: u8,
    pub scheme: Scheme,
    /// Elements per group, `-1` for the whole row
    pub group_size: i32,
    pub quantile: f32,
    pub full_range: bool,
    pub double_quant: Option<DoubleQuantConfig>,
}

impl Default for QuantSpec {
    fn default() -> Self {
        Self::from(&LayerConfig::default())
    }
}

impl From<&LayerConfig> for QuantSpec {
    fn from(cfg: &LayerConfig) -> Self {
        Self {
            dtype: cfg.dtype,
            bits: cfg.bits,
            scheme: cfg.scheme,
            group_size: cfg.group_size,
            quantile: cfg.quantile,
            full_range: cfg.use_full_range,
            double_quant: cfg.double_quant.clone(),
        }
    }
}

impl QuantSpec {
    /// Integer parameters with the given width, scheme and group size
    pub fn int(bits: u8, scheme: Scheme, group_size: i32) -> Self {
        Self {
            dtype: QuantDtype::Int,
            bits,
            scheme,
            group_size,
            quantile: 1.0,
            full_range: false,
            double_quant: None,
        }
    }

    /// Secondary parameters used to quantize a scale vector
    pub fn for_scales(cfg: &DoubleQuantConfig) -> Self {
        Self::int(cfg.bits, cfg.scheme, cfg.group_size)
    }

    /// Width of one stored code
    pub fn storage_bits(&self) -> u8 {
        if self.dtype.is_codebook() {
            codebook::CODEBOOK_BITS
        } else {
            self.bits
        }
    }

    /// Zero points exist only for asymmetric integer grids
    pub fn has_zero_point(&self) -> bool {
        self.dtype == QuantDtype::Int && self.scheme == Scheme::Asym
    }

    /// Effective group length for rows of `cols` elements
    pub fn group_len(&self, cols: usize) -> usize {
        if self.group_size <= 0 {
            cols
        } else {
            (self.group_size as usize).min(cols)
        }
    }
}

/// Number of groups needed to cover `cols` elements; a trailing remainder
/// forms its own group.
pub fn groups_per_row(cols: usize, group_len: usize) -> usize {
    if group_len == 0 {
        return 0;
    }
    cols.div_ceil(group_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_families() {
        assert_eq!(QuantDtype::Int.family(), DtypeFamily::Uniform);
        assert!(matches!(QuantDtype::Nf4.family(), DtypeFamily::Codebook(t) if t.len() == 16));
        assert!(matches!(QuantDtype::Fp8E4m3fn.family(), DtypeFamily::NarrowFloat(_)));
        assert_eq!(QuantDtype::Fp32.family(), DtypeFamily::Passthrough);
    }

    #[test]
    fn test_group_len() {
        let spec = QuantSpec::int(4, Scheme::Sym, 32);
        assert_eq!(spec.group_len(100), 32);
        assert_eq!(spec.group_len(16), 16);
        assert_eq!(groups_per_row(100, 32), 4);

        let whole = QuantSpec::int(4, Scheme::Sym, -1);
        assert_eq!(whole.group_len(100), 100);
        assert_eq!(groups_per_row(100, 100), 1);
    }

    #[test]
    fn test_storage_bits() {
        let mut spec = QuantSpec::int(3, Scheme::Asym, 32);
        assert_eq!(spec.storage_bits(), 3);
        assert!(spec.has_zero_point());
        spec.dtype = QuantDtype::Nf4;
        spec.bits = 8;
        assert_eq!(spec.storage_bits(), 4);
        assert!(!spec.has_zero_point());
    }
}
