//! MSE clip-range search.
//!
//! Walks a descending grid of clip quantiles and keeps, per layer or per
//! group, the one whose quantize-dequantize reconstruction is closest to the
//! original weight. A candidate only replaces the incumbent when it is
//! strictly better, so ties keep the larger (less aggressive) quantile.

use tracing::debug;

use super::QuantSpec;
use super::solver::{self, ClipRatios, QuantParams};
use crate::config::MseGranularity;

/// Number of grid points, `1.0` down to `0.805`
pub const CLIP_GRID_POINTS: usize = 40;

/// Candidate quantiles in descending order
pub fn clip_candidates() -> Vec<f32> {
    (0..CLIP_GRID_POINTS).map(|i| 1.0 - i as f32 / 200.0).collect()
}

/// Squared reconstruction error summed per group
fn group_errors(data: &[f32], params: &QuantParams) -> Vec<f64> {
    let restored = params.dequantize();
    let mut errors = vec![0.0f64; params.num_groups()];
    for (i, (w, r)) in data.iter().zip(restored.iter()).enumerate() {
        let g = params.group_index(i / params.cols, i % params.cols);
        let diff = (*w - *r) as f64;
        errors[g] += diff * diff;
    }
    errors
}

/// Mean squared error between `data` and its reconstruction under `clip`
pub fn mse(
    data: &[f32],
    rows: usize,
    cols: usize,
    spec: &QuantSpec,
    clip: &ClipRatios,
) -> crate::Result<f64> {
    let params = solver::quantize_clipped(data, rows, cols, spec, clip)?;
    let total: f64 = group_errors(data, &params).iter().sum();
    Ok(total / data.len() as f64)
}

/// Pick clip quantiles for a `rows x cols` view.
///
/// The search ignores double quantization so that groups stay independent
/// while candidates are compared.
pub fn search_clip(
    data: &[f32],
    rows: usize,
    cols: usize,
    spec: &QuantSpec,
    granularity: MseGranularity,
) -> crate::Result<ClipRatios> {
    let trial = QuantSpec {
        double_quant: None,
        ..spec.clone()
    };

    match granularity {
        MseGranularity::Layer => {
            let mut best_quantile = 1.0f32;
            let mut best_error = f64::INFINITY;
            let mut history = Vec::with_capacity(CLIP_GRID_POINTS);

            for quantile in clip_candidates() {
                let error = mse(data, rows, cols, &trial, &ClipRatios::Uniform(quantile))?;
                history.push((quantile, error));
                if error < best_error {
                    best_error = error;
                    best_quantile = quantile;
                }
            }

            debug!(
                "Clip search picked quantile {:.3} (mse {:.3e}) from {} candidates",
                best_quantile,
                best_error,
                history.len()
            );
            Ok(ClipRatios::Uniform(best_quantile))
        }
        MseGranularity::Group => {
            let mut best: Option<(Vec<f32>, Vec<f64>)> = None;

            for quantile in clip_candidates() {
                let params = solver::quantize_clipped(data, rows, cols, &trial, &ClipRatios::Uniform(quantile))?;
                let errors = group_errors(data, &params);
                match best.as_mut() {
                    None => best = Some((vec![quantile; errors.len()], errors)),
                    Some((ratios, best_errors)) => {
                        for (g, error) in errors.into_iter().enumerate() {
                            if error < best_errors[g] {
                                best_errors[g] = error;
                                ratios[g] = quantile;
                            }
                        }
                    }
                }
            }

            let ratios = best.map(|(ratios, _)| ratios).unwrap_or_default();
            let clipped = ratios.iter().filter(|&&q| q < 1.0).count();
            debug!(
                "Clip search tightened {}/{} groups",
                clipped,
                ratios.len()
            );
            Ok(ClipRatios::PerGroup(ratios))
        }
    }
}
