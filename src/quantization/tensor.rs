//! Packed quantized weight representation.
//!
//! Codes are stored in the layer's logical `[out, in]` orientation, bit-packed
//! LSB first. Symmetric integer codes are shifted by `2^(N-1)` so every stored
//! code is unsigned. Scales follow the grouping axis:
//! - [`GroupAxis::Input`]: `[out, groups]`
//! - [`GroupAxis::Output`]: `[groups, in]`

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use super::double_quant::floor_scales;
use super::solver::QuantParams;
use super::{DtypeFamily, codebook};
use crate::WoqError;
use crate::config::{GroupAxis, QuantDtype, Scheme};

/// A weight matrix holding packed codes instead of dense floats.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedTensor {
    /// Packed code bytes
    pub data: Vec<u8>,

    /// Effective per-group scales
    pub scales: Vec<f32>,

    /// Zero points for asymmetric integer grids, one byte per group
    pub zero_points: Option<Vec<u8>>,

    /// Logical `[out, in]` shape
    pub shape: [usize; 2],

    pub scale_shape: [usize; 2],

    /// Width of one stored code
    pub bits: u8,

    pub group_len: usize,
    pub group_axis: GroupAxis,
    pub quant_type: QuantDtype,
    pub scheme: Scheme,

    /// Packed form of the scale vector when double quantization ran. Its
    /// single row follows the grouped-view order of the scales.
    pub scale_quant: Option<Box<QuantizedTensor>>,
}

/// Everything except the raw buffers, as persisted next to the tensors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedMeta {
    pub quant_type: QuantDtype,
    pub scheme: Scheme,
    pub bits: u8,
    pub group_len: usize,
    pub group_axis: GroupAxis,
    pub shape: [usize; 2],
    pub scale_shape: [usize; 2],
    pub has_zero_points: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_quant: Option<Box<PackedMeta>>,
}

impl PackedMeta {
    /// Reject metadata that could not have come from [`QuantizedTensor::pack`]
    fn check_layout(&self) -> crate::Result<()> {
        if !(1..=8).contains(&self.bits) {
            return Err(WoqError::SerializationError(format!(
                "code width must be 1..=8 bits, got {}",
                self.bits
            )));
        }
        if self.group_len == 0 {
            return Err(WoqError::SerializationError("group length is zero".to_string()));
        }
        let [rows, cols] = self.shape;
        let expected = match self.group_axis {
            GroupAxis::Input => [rows, cols.div_ceil(self.group_len)],
            GroupAxis::Output => [rows.div_ceil(self.group_len), cols],
        };
        if self.scale_shape != expected {
            return Err(WoqError::SerializationError(format!(
                "scale shape {:?} does not fit {:?} grouped by {} along {:?}",
                self.scale_shape, self.shape, self.group_len, self.group_axis
            )));
        }
        Ok(())
    }
}

/// Pack unsigned codes `bits` wide, least significant bit first
pub fn pack_bits(codes: &[u8], bits: u8) -> Vec<u8> {
    if bits == 8 {
        return codes.to_vec();
    }
    let bits = bits as usize;
    let mut out = vec![0u8; (codes.len() * bits).div_ceil(8)];
    for (i, &code) in codes.iter().enumerate() {
        let base = i * bits;
        for b in 0..bits {
            if (code >> b) & 1 == 1 {
                let pos = base + b;
                out[pos / 8] |= 1 << (pos % 8);
            }
        }
    }
    out
}

/// Inverse of [`pack_bits`]
pub fn unpack_bits(data: &[u8], bits: u8, count: usize) -> Vec<u8> {
    if bits == 8 {
        return data[..count].to_vec();
    }
    let bits = bits as usize;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let base = i * bits;
        let mut code = 0u8;
        for b in 0..bits {
            let pos = base + b;
            if (data[pos / 8] >> (pos % 8)) & 1 == 1 {
                code |= 1 << b;
            }
        }
        out.push(code);
    }
    out
}

fn transpose<T: Copy>(values: &[T], rows: usize, cols: usize) -> Vec<T> {
    let mut out = Vec::with_capacity(values.len());
    for c in 0..cols {
        for r in 0..rows {
            out.push(values[r * cols + c]);
        }
    }
    out
}

fn storage_bits(dtype: QuantDtype, bits: u8) -> u8 {
    if dtype.is_codebook() { codebook::CODEBOOK_BITS } else { bits }
}

impl QuantizedTensor {
    /// Pack solver output. `params` is the grouped view: for
    /// [`GroupAxis::Output`] its rows are input channels and it is
    /// transposed back to `[out, in]` here.
    pub fn pack(params: &QuantParams, axis: GroupAxis) -> crate::Result<Self> {
        let bits = storage_bits(params.dtype, params.bits);
        let offset = Self::code_offset_for(params.dtype, params.scheme, bits);
        let limit = 1i32 << bits;

        let mut view_codes = Vec::with_capacity(params.codes.len());
        for &code in &params.codes {
            let stored = code + offset;
            if !(0..limit).contains(&stored) {
                return Err(WoqError::QuantizationError(format!(
                    "code {} does not fit in {} bits",
                    code, bits
                )));
            }
            view_codes.push(stored as u8);
        }
        let view_zps: Option<Vec<u8>> = params
            .zero_points
            .as_ref()
            .map(|zps| zps.iter().map(|&z| z.clamp(0, 255) as u8).collect());

        let per_row = params.groups_per_row();
        let (shape, scale_shape, codes, scales, zero_points) = match axis {
            GroupAxis::Input => (
                [params.rows, params.cols],
                [params.rows, per_row],
                view_codes,
                params.scales.clone(),
                view_zps,
            ),
            GroupAxis::Output => (
                [params.cols, params.rows],
                [per_row, params.rows],
                transpose(&view_codes, params.rows, params.cols),
                transpose(&params.scales, params.rows, per_row),
                view_zps.map(|zps| transpose(&zps, params.rows, per_row)),
            ),
        };

        let scale_quant = match &params.double_quant {
            Some(dq) => Some(Box::new(Self::pack(&dq.nested, GroupAxis::Input)?)),
            None => None,
        };

        Ok(Self {
            data: pack_bits(&codes, bits),
            scales,
            zero_points,
            shape,
            scale_shape,
            bits,
            group_len: params.group_len,
            group_axis: axis,
            quant_type: params.dtype,
            scheme: params.scheme,
            scale_quant,
        })
    }

    fn code_offset_for(dtype: QuantDtype, scheme: Scheme, bits: u8) -> i32 {
        if dtype == QuantDtype::Int && scheme == Scheme::Sym {
            1 << (bits - 1)
        } else {
            0
        }
    }

    /// Shift applied to signed codes before packing
    pub fn code_offset(&self) -> i32 {
        Self::code_offset_for(self.quant_type, self.scheme, self.bits)
    }

    /// Number of elements in the logical weight
    pub fn numel(&self) -> usize {
        self.shape[0] * self.shape[1]
    }

    pub fn unpack_codes(&self) -> Vec<u8> {
        unpack_bits(&self.data, self.bits, self.numel())
    }

    /// Scale slot of logical element `(o, i)`
    pub fn group_index(&self, o: usize, i: usize) -> usize {
        match self.group_axis {
            GroupAxis::Input => o * self.scale_shape[1] + i / self.group_len,
            GroupAxis::Output => (o / self.group_len) * self.scale_shape[1] + i,
        }
    }

    /// Reconstruct the dense `[out, in]` weight, row-major
    pub fn dequantize(&self) -> Vec<f32> {
        let codes = self.unpack_codes();
        let offset = self.code_offset();
        let table = match self.quant_type.family() {
            DtypeFamily::Codebook(table) => Some(table),
            _ => None,
        };

        let [rows, cols] = self.shape;
        let mut out = Vec::with_capacity(rows * cols);
        for o in 0..rows {
            for i in 0..cols {
                let code = codes[o * cols + i];
                let g = self.group_index(o, i);
                let scale = self.scales[g];
                let value = match table {
                    Some(table) => table[code as usize] * scale,
                    None => {
                        let zp = self.zero_points.as_ref().map_or(0, |z| z[g] as i32);
                        (code as i32 - offset - zp) as f32 * scale
                    }
                };
                out.push(value);
            }
        }
        out
    }

    /// Dense weight as a tensor on `device`
    pub fn to_tensor(&self, device: &Device, dtype: DType) -> crate::Result<Tensor> {
        let tensor = Tensor::from_vec(self.dequantize(), (self.shape[0], self.shape[1]), device)?;
        tensor.to_dtype(dtype).map_err(Into::into)
    }

    /// Get compressed size in bytes
    pub fn compressed_size(&self) -> usize {
        let scales = match &self.scale_quant {
            Some(nested) => nested.compressed_size(),
            None => self.scales.len() * 4,
        };
        self.data.len() + scales + self.zero_points.as_ref().map_or(0, |zp| zp.len())
    }

    /// Get original size in bytes (f32 weights)
    pub fn original_size(&self) -> usize {
        self.numel() * 4
    }

    /// Get compression ratio
    pub fn compression_ratio(&self) -> f32 {
        self.compressed_size() as f32 / self.original_size() as f32
    }

    pub fn meta(&self) -> PackedMeta {
        PackedMeta {
            quant_type: self.quant_type,
            scheme: self.scheme,
            bits: self.bits,
            group_len: self.group_len,
            group_axis: self.group_axis,
            shape: self.shape,
            scale_shape: self.scale_shape,
            has_zero_points: self.zero_points.is_some(),
            scale_quant: self.scale_quant.as_ref().map(|n| Box::new(n.meta())),
        }
    }

    /// Rebuild from persisted parts. With a nested scale tensor the
    /// effective scales are recomputed from it and `scales` may be `None`.
    pub fn from_parts(
        meta: &PackedMeta,
        data: Vec<u8>,
        scales: Option<Vec<f32>>,
        zero_points: Option<Vec<u8>>,
        scale_quant: Option<QuantizedTensor>,
    ) -> crate::Result<Self> {
        meta.check_layout()?;
        let numel = meta.shape[0] * meta.shape[1];
        let num_scales = meta.scale_shape[0] * meta.scale_shape[1];
        if data.len() != (numel * meta.bits as usize).div_ceil(8) {
            return Err(WoqError::SerializationError(format!(
                "expected {} packed bytes for {:?} at {} bits, got {}",
                (numel * meta.bits as usize).div_ceil(8),
                meta.shape,
                meta.bits,
                data.len()
            )));
        }
        if meta.has_zero_points != zero_points.is_some()
            || zero_points.as_ref().is_some_and(|z| z.len() != num_scales)
        {
            return Err(WoqError::SerializationError(
                "zero points do not match the recorded layout".to_string(),
            ));
        }

        let scales = match (&scale_quant, scales) {
            (Some(nested), _) => {
                let mut view = nested.dequantize();
                if view.len() != num_scales {
                    return Err(WoqError::SerializationError(format!(
                        "nested scale tensor holds {} scales, layout needs {}",
                        view.len(),
                        num_scales
                    )));
                }
                floor_scales(&mut view);
                match meta.group_axis {
                    GroupAxis::Input => view,
                    // grouped view is [in, groups]
                    GroupAxis::Output => transpose(&view, meta.scale_shape[1], meta.scale_shape[0]),
                }
            }
            (None, Some(scales)) => scales,
            (None, None) => {
                return Err(WoqError::SerializationError(
                    "packed tensor has neither scales nor a nested scale tensor".to_string(),
                ));
            }
        };
        if scales.len() != num_scales {
            return Err(WoqError::SerializationError(format!(
                "expected {} scales, got {}",
                num_scales,
                scales.len()
            )));
        }

        Ok(Self {
            data,
            scales,
            zero_points,
            shape: meta.shape,
            scale_shape: meta.scale_shape,
            bits: meta.bits,
            group_len: meta.group_len,
            group_axis: meta.group_axis,
            quant_type: meta.quant_type,
            scheme: meta.scheme,
            scale_quant: scale_quant.map(Box::new),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DoubleQuantConfig;
    use crate::quantization::{QuantSpec, quantize};

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| ((i * 29 % 83) as f32 - 41.0) / 30.0).collect()
    }

    #[test]
    fn test_pack_bits_layout() {
        assert_eq!(pack_bits(&[1, 2, 3], 2), vec![0b0011_1001]);
        assert_eq!(pack_bits(&[0xF, 0x1, 0x7], 4), vec![0x1F, 0x07]);
        assert_eq!(unpack_bits(&[0x1F, 0x07], 4, 3), vec![0xF, 0x1, 0x7]);
        for bits in 1..=8u8 {
            let codes: Vec<u8> = (0..37).map(|i| (i * 7 % (1 << bits)) as u8).collect();
            assert_eq!(unpack_bits(&pack_bits(&codes, bits), bits, codes.len()), codes);
        }
    }

    #[test]
    fn test_input_axis_matches_solver() {
        let data = ramp(6 * 20);
        let params = quantize(&data, 6, 20, &QuantSpec::int(4, Scheme::Sym, 8)).unwrap();
        let packed = QuantizedTensor::pack(&params, GroupAxis::Input).unwrap();
        assert_eq!(packed.shape, [6, 20]);
        assert_eq!(packed.scale_shape, [6, 3]);
        assert_eq!(packed.data.len(), 60);
        assert_eq!(packed.dequantize(), params.dequantize());
    }

    #[test]
    fn test_output_axis_restores_orientation() {
        // view is [in=5, out=12]; logical weight is [12, 5]
        let data = ramp(5 * 12);
        let params = quantize(&data, 5, 12, &QuantSpec::int(3, Scheme::Asym, 4)).unwrap();
        let packed = QuantizedTensor::pack(&params, GroupAxis::Output).unwrap();
        assert_eq!(packed.shape, [12, 5]);
        assert_eq!(packed.scale_shape, [3, 5]);

        let view = params.dequantize();
        let logical = packed.dequantize();
        for o in 0..12 {
            for i in 0..5 {
                assert_eq!(logical[o * 5 + i], view[i * 12 + o]);
            }
        }
    }

    #[test]
    fn test_compression_ratio_4bit() {
        let data = ramp(64 * 128);
        let params = quantize(&data, 64, 128, &QuantSpec::int(4, Scheme::Sym, 128)).unwrap();
        let packed = QuantizedTensor::pack(&params, GroupAxis::Input).unwrap();
        // 4 bits per weight plus one f32 scale per 128 weights
        let expected = (64 * 128 / 2 + 64 * 4) as f32 / (64 * 128 * 4) as f32;
        assert!((packed.compression_ratio() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_parts_round_trip_with_nested_scales() {
        let data = ramp(10 * 32);
        let spec = QuantSpec {
            double_quant: Some(DoubleQuantConfig {
                bits: 6,
                group_size: 4,
                ..Default::default()
            }),
            ..QuantSpec::int(4, Scheme::Asym, 8)
        };
        let params = quantize(&data, 10, 32, &spec).unwrap();
        let packed = QuantizedTensor::pack(&params, GroupAxis::Output).unwrap();
        let nested = packed.scale_quant.as_deref().cloned().unwrap();

        let rebuilt = QuantizedTensor::from_parts(
            &packed.meta(),
            packed.data.clone(),
            None,
            packed.zero_points.clone(),
            Some(nested),
        )
        .unwrap();
        assert_eq!(rebuilt.scales, packed.scales);
        assert_eq!(rebuilt.dequantize(), packed.dequantize());
    }

    #[test]
    fn test_parts_reject_truncated_data() {
        let params = quantize(&ramp(32), 2, 16, &QuantSpec::int(4, Scheme::Sym, 8)).unwrap();
        let packed = QuantizedTensor::pack(&params, GroupAxis::Input).unwrap();
        let result = QuantizedTensor::from_parts(
            &packed.meta(),
            packed.data[1..].to_vec(),
            Some(packed.scales.clone()),
            None,
            None,
        );
        assert!(matches!(result, Err(WoqError::SerializationError(_))));
    }

    #[test]
    fn test_parts_reject_corrupt_layout() {
        let params = quantize(&ramp(32), 2, 16, &QuantSpec::int(4, Scheme::Sym, 8)).unwrap();
        let packed = QuantizedTensor::pack(&params, GroupAxis::Input).unwrap();
        let rebuild = |meta: &PackedMeta| {
            QuantizedTensor::from_parts(meta, packed.data.clone(), Some(packed.scales.clone()), None, None)
        };

        let zero_groups = PackedMeta { group_len: 0, ..packed.meta() };
        assert!(matches!(rebuild(&zero_groups), Err(WoqError::SerializationError(_))));

        let wide_scales = PackedMeta { scale_shape: [1, 4], ..packed.meta() };
        assert!(matches!(rebuild(&wide_scales), Err(WoqError::SerializationError(_))));
    }

    #[test]
    fn test_parts_reject_short_nested_scales() {
        let spec = QuantSpec {
            double_quant: Some(DoubleQuantConfig {
                bits: 6,
                group_size: 4,
                ..Default::default()
            }),
            ..QuantSpec::int(4, Scheme::Asym, 8)
        };
        let params = quantize(&ramp(10 * 32), 10, 32, &spec).unwrap();
        let packed = QuantizedTensor::pack(&params, GroupAxis::Output).unwrap();
        let other = quantize(&ramp(7), 1, 7, &QuantSpec::int(8, Scheme::Sym, -1)).unwrap();
        let short = QuantizedTensor::pack(&other, GroupAxis::Input).unwrap();

        let result = QuantizedTensor::from_parts(
            &packed.meta(),
            packed.data.clone(),
            None,
            packed.zero_points.clone(),
            Some(short),
        );
        assert!(matches!(result, Err(WoqError::SerializationError(_))));
    }
}
