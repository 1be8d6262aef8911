//! Per-group parameter solver.
//!
//! Solving happens in two passes: first every group gets its scale (and
//! clipped minimum for asymmetric grids), then, once double quantization has
//! possibly replaced the scales with their lossy reconstruction, the zero
//! points and codes are derived from the final scales.

use candle_core::{DType, Tensor};
use tracing::trace;

use super::double_quant::{self, DoubleQuantParams};
use super::uniform::{self, IntRange};
use super::{DtypeFamily, QuantSpec, codebook, fp8, groups_per_row};
use crate::WoqError;
use crate::config::{GroupAxis, QuantDtype, Scheme};

/// Clip quantile used for each group
#[derive(Debug, Clone, PartialEq)]
pub enum ClipRatios {
    /// Same quantile for every group of the layer
    Uniform(f32),
    /// One quantile per group, row-major over the grouped view
    PerGroup(Vec<f32>),
}

impl ClipRatios {
    pub fn ratio(&self, group: usize) -> f32 {
        match self {
            ClipRatios::Uniform(q) => *q,
            ClipRatios::PerGroup(ratios) => ratios[group],
        }
    }
}

/// Codes and per-group parameters of one grouped weight view
#[derive(Debug, Clone, PartialEq)]
pub struct QuantParams {
    pub dtype: QuantDtype,
    pub bits: u8,
    pub scheme: Scheme,
    pub full_range: bool,

    /// Rows of the grouped view
    pub rows: usize,
    /// Columns of the grouped view; groups run along this axis
    pub cols: usize,
    pub group_len: usize,

    /// One code per element, row-major. Integer grids hold signed grid
    /// values, codebooks hold table indices.
    pub codes: Vec<i32>,
    /// One scale per group, `[rows, groups_per_row]`
    pub scales: Vec<f32>,
    /// Present only for asymmetric integer grids
    pub zero_points: Option<Vec<i32>>,
    /// Quantized form of `scales` when double quantization ran
    pub double_quant: Option<Box<DoubleQuantParams>>,
}

impl QuantParams {
    pub fn groups_per_row(&self) -> usize {
        groups_per_row(self.cols, self.group_len)
    }

    pub fn num_groups(&self) -> usize {
        self.rows * self.groups_per_row()
    }

    /// Group owning element `(row, col)` of the view
    pub fn group_index(&self, row: usize, col: usize) -> usize {
        row * self.groups_per_row() + col / self.group_len
    }

    /// Element range covered by group `(row, g)` in the flattened view
    pub fn group_span(&self, row: usize, g: usize) -> std::ops::Range<usize> {
        group_span(row, g, self.cols, self.group_len)
    }

    /// Inclusive code range of the grid
    pub fn code_range(&self) -> IntRange {
        match self.dtype.family() {
            DtypeFamily::Codebook(table) => IntRange {
                min: 0,
                max: table.len() as i32 - 1,
            },
            _ => IntRange::new(self.bits, self.scheme, self.full_range),
        }
    }

    /// Reconstruct the grouped view, row-major
    pub fn dequantize(&self) -> Vec<f32> {
        let table = match self.dtype.family() {
            DtypeFamily::Codebook(table) => Some(table),
            _ => None,
        };

        let mut out = Vec::with_capacity(self.codes.len());
        for row in 0..self.rows {
            for col in 0..self.cols {
                let code = self.codes[row * self.cols + col];
                let g = self.group_index(row, col);
                let scale = self.scales[g];
                let value = match table {
                    Some(table) => table[code as usize] * scale,
                    None => {
                        let zp = self.zero_points.as_ref().map_or(0, |zps| zps[g]);
                        uniform::dequantize_value(code, scale, zp)
                    }
                };
                out.push(value);
            }
        }
        out
    }
}

fn group_span(row: usize, g: usize, cols: usize, group_len: usize) -> std::ops::Range<usize> {
    let start = row * cols + g * group_len;
    let end = (start + group_len).min(row * cols + cols);
    start..end
}

fn check_int_spec(spec: &QuantSpec) -> crate::Result<()> {
    if !(1..=8).contains(&spec.bits) || (spec.scheme == Scheme::Sym && spec.bits < 2) {
        return Err(WoqError::AssertionError(format!(
            "unsupported {} integer width: {} bits",
            match spec.scheme {
                Scheme::Sym => "symmetric",
                Scheme::Asym => "asymmetric",
            },
            spec.bits
        )));
    }
    Ok(())
}

/// Quantize a `rows x cols` view with the quantile from `spec`.
pub fn quantize(data: &[f32], rows: usize, cols: usize, spec: &QuantSpec) -> crate::Result<QuantParams> {
    quantize_clipped(data, rows, cols, spec, &ClipRatios::Uniform(spec.quantile))
}

/// Quantize a `rows x cols` view with explicit clip quantiles.
pub fn quantize_clipped(
    data: &[f32],
    rows: usize,
    cols: usize,
    spec: &QuantSpec,
    clip: &ClipRatios,
) -> crate::Result<QuantParams> {
    if rows == 0 || cols == 0 || data.len() != rows * cols {
        return Err(WoqError::AssertionError(format!(
            "weight view of {} elements does not match {}x{}",
            data.len(),
            rows,
            cols
        )));
    }

    let table = match spec.dtype.family() {
        DtypeFamily::Uniform => {
            check_int_spec(spec)?;
            None
        }
        DtypeFamily::Codebook(table) => Some(table),
        DtypeFamily::NarrowFloat(_) | DtypeFamily::Passthrough => {
            return Err(WoqError::QuantizationError(format!(
                "{} has no grouped parameters",
                spec.dtype
            )));
        }
    };

    let group_len = spec.group_len(cols);
    let per_row = groups_per_row(cols, group_len);
    let num_groups = rows * per_row;
    if let ClipRatios::PerGroup(ratios) = clip {
        if ratios.len() != num_groups {
            return Err(WoqError::AssertionError(format!(
                "expected {} clip ratios, got {}",
                num_groups,
                ratios.len()
            )));
        }
    }

    let mut scales = Vec::with_capacity(num_groups);
    let mut clipped_mins = Vec::with_capacity(num_groups);
    for row in 0..rows {
        for g in 0..per_row {
            let group = &data[group_span(row, g, cols, group_len)];
            let quantile = clip.ratio(row * per_row + g);
            match table {
                Some(table) => {
                    scales.push(codebook::group_scale(group, table, quantile));
                    clipped_mins.push(0.0);
                }
                None => {
                    let params =
                        uniform::solve_group(group, spec.bits, spec.scheme, quantile, spec.full_range);
                    scales.push(params.scale);
                    clipped_mins.push(params.clipped_min);
                }
            }
        }
    }

    let double_quant = match &spec.double_quant {
        Some(cfg) => {
            let (reconstructed, params) = double_quant::quantize_scales(&scales, cfg)?;
            scales = reconstructed;
            Some(Box::new(params))
        }
        None => None,
    };

    let zero_points = spec.has_zero_point().then(|| {
        clipped_mins
            .iter()
            .zip(scales.iter())
            .map(|(&min, &scale)| uniform::zero_point(min, scale, spec.bits))
            .collect::<Vec<_>>()
    });

    // codebooks ignore `bits`; their range is the table itself
    let range = match table {
        Some(table) => IntRange { min: 0, max: table.len() as i32 - 1 },
        None => IntRange::new(spec.bits, spec.scheme, spec.full_range),
    };
    let mut codes = Vec::with_capacity(data.len());
    for row in 0..rows {
        for col in 0..cols {
            let g = row * per_row + col / group_len;
            let value = data[row * cols + col];
            let scale = scales[g];
            let code = match table {
                Some(table) => codebook::nearest_index(table, value / scale) as i32,
                None => {
                    let zp = zero_points.as_ref().map_or(0, |zps| zps[g]);
                    uniform::quantize_value(value, scale, zp, range)
                }
            };
            codes.push(code);
        }
    }

    trace!(
        "Solved {}x{} view: dtype={}, bits={}, groups={}",
        rows,
        cols,
        spec.dtype,
        spec.bits,
        num_groups
    );

    Ok(QuantParams {
        dtype: spec.dtype,
        bits: spec.bits,
        scheme: if table.is_some() { Scheme::Sym } else { spec.scheme },
        full_range: spec.full_range,
        rows,
        cols,
        group_len,
        codes,
        scales,
        zero_points,
        double_quant,
    })
}

/// Quantize-dequantize a 2-D tensor grouped along its last dimension,
/// keeping shape and dtype. FP8 dtypes are cast element-wise and `fp32`
/// passes through untouched.
pub fn qdq_tensor(weight: &Tensor, spec: &QuantSpec) -> crate::Result<Tensor> {
    match spec.dtype.family() {
        DtypeFamily::Passthrough => return Ok(weight.clone()),
        DtypeFamily::NarrowFloat(_) => return fp8::cast_fp8(weight, spec.dtype),
        _ => {}
    }

    let (rows, cols) = weight.dims2()?;
    let data: Vec<f32> = weight.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let params = quantize(&data, rows, cols, spec)?;
    let restored = Tensor::from_vec(params.dequantize(), (rows, cols), weight.device())?;
    restored.to_dtype(weight.dtype()).map_err(Into::into)
}

/// Quantize-dequantize a logical `[out, in]` weight with groups running
/// along `axis`.
pub fn qdq_weight(weight: &Tensor, spec: &QuantSpec, axis: GroupAxis) -> crate::Result<Tensor> {
    match axis {
        GroupAxis::Input => qdq_tensor(weight, spec),
        GroupAxis::Output => {
            let view = weight.t()?.contiguous()?;
            Ok(qdq_tensor(&view, spec)?.t()?.contiguous()?)
        }
    }
}
