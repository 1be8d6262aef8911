//! Uniform integer grids (symmetric and asymmetric).

use crate::config::Scheme;

/// Inclusive code range of an integer grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntRange {
    pub min: i32,
    pub max: i32,
}

impl IntRange {
    /// Code range for a width/scheme combination.
    ///
    /// Symmetric grids only use `-2^(N-1)` when `full_range` is set.
    pub fn new(bits: u8, scheme: Scheme, full_range: bool) -> Self {
        let bits = bits as i32;
        match scheme {
            Scheme::Sym => {
                let half = 1i32 << (bits - 1);
                let min = if full_range { -half } else { -(half - 1) };
                Self { min, max: half - 1 }
            }
            Scheme::Asym => Self {
                min: 0,
                max: (1i32 << bits) - 1,
            },
        }
    }
}

/// Scale and zero point for one group, plus the clipped group minimum that
/// produced the zero point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupParams {
    pub scale: f32,
    pub zero_point: i32,
    pub clipped_min: f32,
}

/// Solve scale/zero-point for one group.
pub fn solve_group(
    group: &[f32],
    bits: u8,
    scheme: Scheme,
    quantile: f32,
    full_range: bool,
) -> GroupParams {
    let (min_val, max_val) = group
        .iter()
        .fold((f32::MAX, f32::MIN), |(lo, hi), &x| (lo.min(x), hi.max(x)));
    let (min_val, max_val) = if group.is_empty() { (0.0, 0.0) } else { (min_val, max_val) };

    match scheme {
        Scheme::Sym => {
            let wmax = max_val.abs().max(min_val.abs()) * quantile;
            if wmax == 0.0 {
                return GroupParams { scale: 1.0, zero_point: 0, clipped_min: 0.0 };
            }
            let half = (1i32 << (bits - 1)) as f32;
            let scale = if full_range {
                // negative scale puts a dominant positive extreme on -2^(N-1)
                let scale = wmax / half;
                if max_val.abs() > min_val.abs() { -scale } else { scale }
            } else {
                wmax / (half - 1.0)
            };
            GroupParams { scale, zero_point: 0, clipped_min: 0.0 }
        }
        Scheme::Asym => {
            let wmin = min_val.min(0.0) * quantile;
            let wmax = max_val.max(0.0) * quantile;
            if wmin == 0.0 && wmax == 0.0 {
                return GroupParams { scale: 1.0, zero_point: 0, clipped_min: 0.0 };
            }
            let maxq = ((1i32 << bits) - 1) as f32;
            let scale = (wmax - wmin) / maxq;
            GroupParams {
                scale,
                zero_point: zero_point(wmin, scale, bits),
                clipped_min: wmin,
            }
        }
    }
}

/// Asymmetric zero point `round(-min / scale)` clamped into `[0, 2^N - 1]`
pub fn zero_point(clipped_min: f32, scale: f32, bits: u8) -> i32 {
    let maxq = (1i32 << bits) - 1;
    let zp = (-clipped_min / scale).round_ties_even();
    if zp.is_finite() { (zp as i32).clamp(0, maxq) } else { 0 }
}

/// Map one value onto the grid
pub fn quantize_value(value: f32, scale: f32, zero_point: i32, range: IntRange) -> i32 {
    let q = (value / scale).round_ties_even();
    let q = if q.is_finite() { q as i64 } else if q > 0.0 { i64::MAX / 2 } else { i64::MIN / 2 };
    (q + zero_point as i64).clamp(range.min as i64, range.max as i64) as i32
}

/// Reconstruct one value from its code
pub fn dequantize_value(code: i32, scale: f32, zero_point: i32) -> f32 {
    (code - zero_point) as f32 * scale
}
