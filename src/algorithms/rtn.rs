//! Round-to-nearest layer rewriter.
//!
//! Walks a [`LayerGraph`], resolves each quantizable layer's recipe and
//! replaces the dense weight with either a packed [`WeightOnlyLinear`] or
//! its quantize-dequantize reconstruction. Layers that cannot or should not
//! be quantized are skipped and reported, never treated as errors. A layer
//! whose quantization fails is skipped too, unless the failure is a
//! contract violation, which aborts the whole pass.

use candle_core::{DType, Device, Tensor};
use tracing::{debug, info, warn};

use crate::WoqError;
use crate::config::{GroupAxis, LayerConfig, QuantConfig};
use crate::layers::{DenseLayer, Layer, LayerKind, MulLinear, WeightOnlyLinear};
use crate::model::LayerGraph;
use crate::quantization::{
    ClipRatios, DtypeFamily, QuantParams, QuantSpec, QuantizedTensor, cast_fp8, quantize_clipped,
    search_clip,
};
use crate::utils::{Footprint, get_device, tensor_bytes};

/// Why a layer was left untouched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The layer kind has no weight the rewriter can quantize
    Unsupported(LayerKind),
    /// No recipe resolved for this name
    NoConfig,
    /// Resolved recipe keeps full precision
    Passthrough,
    /// Quantizing this layer failed; the message is kept for the report
    Failed(String),
}

/// Decide whether a per-layer failure aborts the rewrite. Contract
/// violations do; anything else only costs that layer.
fn isolate_failure(name: &str, err: WoqError) -> crate::Result<SkipReason> {
    match err {
        WoqError::AssertionError(_) => Err(err),
        other => {
            warn!("Skipping '{}': quantization failed: {}", name, other);
            Ok(SkipReason::Failed(other.to_string()))
        }
    }
}

/// Result of one rewrite pass
#[derive(Debug, Default)]
pub struct RtnOutcome {
    /// Replacement for the root layer (empty name); the caller installs it
    pub root: Option<Layer>,
    /// Names of rewritten layers, in graph order
    pub quantized: Vec<String>,
    pub skipped: Vec<(String, SkipReason)>,
    pub footprint: Footprint,
}

/// Applies the per-layer recipes of a [`QuantConfig`] to a graph.
#[derive(Debug, Clone)]
pub struct RtnQuantizer {
    config: QuantConfig,
    device: Option<Device>,
}

impl RtnQuantizer {
    pub fn new(config: QuantConfig) -> Self {
        Self { config, device: None }
    }

    /// Move the graph here before rewriting
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Move the graph to the best available accelerator before rewriting
    pub fn on_best_device(self, device_id: Option<usize>) -> crate::Result<Self> {
        Ok(self.with_device(get_device(device_id)?))
    }

    pub fn config(&self) -> &QuantConfig {
        &self.config
    }

    /// Rewrite every eligible layer of `graph` in place.
    pub fn convert(&self, graph: &mut LayerGraph) -> crate::Result<RtnOutcome> {
        if let Some(device) = &self.device {
            graph.to_device(device)?;
        }
        let device = graph.device().clone();
        let mut outcome = RtnOutcome::default();

        info!(
            "Quantizing {} layers (export_compressed_model={})",
            graph.len(),
            self.config.export_compressed_model
        );

        for name in graph.names() {
            let layer = graph.layer(&name)?;
            if !layer.is_quantizable() {
                debug!("Skipping '{}': {} layers are not quantizable", name, layer.kind());
                outcome.skipped.push((name, SkipReason::Unsupported(layer.kind())));
                continue;
            }

            let cfg = match self.config.resolve(&name)? {
                Some(cfg) => cfg,
                None => {
                    info!("Skipping '{}': no quantization config", name);
                    outcome.skipped.push((name, SkipReason::NoConfig));
                    continue;
                }
            };
            if cfg.dtype.family() == DtypeFamily::Passthrough {
                debug!("Skipping '{}': dtype {} keeps full precision", name, cfg.dtype);
                outcome.skipped.push((name, SkipReason::Passthrough));
                continue;
            }

            let (replacement, dense, packed) = match self.quantize_layer(&name, layer, &cfg, &device) {
                Ok(done) => done,
                Err(err) => {
                    let reason = isolate_failure(&name, err)?;
                    outcome.skipped.push((name, reason));
                    continue;
                }
            };
            outcome.footprint.add(dense, packed);
            debug!(
                "Quantized '{}' with {}{} group {} (dim {})",
                name,
                cfg.dtype,
                if cfg.dtype.is_codebook() { String::new() } else { format!("/{}b", cfg.bits) },
                cfg.group_size,
                cfg.group_dim
            );

            if name.is_empty() {
                outcome.root = Some(replacement);
            } else {
                graph.replace(&name, replacement)?;
            }
            outcome.quantized.push(name);
        }

        info!(
            "Quantized {} layers, skipped {}; weights {}",
            outcome.quantized.len(),
            outcome.skipped.len(),
            outcome.footprint
        );
        Ok(outcome)
    }

    /// Quantize one layer with `cfg`, returning its replacement and the
    /// dense/packed weight bytes.
    pub fn quantize_layer(
        &self,
        name: &str,
        layer: &Layer,
        cfg: &LayerConfig,
        device: &Device,
    ) -> crate::Result<(Layer, u64, u64)> {
        match layer {
            Layer::Dense(dense) => self.quantize_dense(dense, cfg, device),
            Layer::MulLinear(mul) => {
                let (inner, dense, packed) = self.quantize_layer(name, mul.inner(), cfg, device)?;
                let scaled = MulLinear::new(inner, mul.input_scale().clone());
                Ok((Layer::MulLinear(scaled), dense, packed))
            }
            other => Err(WoqError::UnsupportedLayer {
                name: name.to_string(),
                kind: other.kind().to_string(),
            }),
        }
    }

    fn quantize_dense(
        &self,
        dense: &DenseLayer,
        cfg: &LayerConfig,
        device: &Device,
    ) -> crate::Result<(Layer, u64, u64)> {
        let dense_bytes = tensor_bytes(dense.weight());

        // narrow floats are an element-wise cast; orientation is irrelevant
        if let DtypeFamily::NarrowFloat(_) = cfg.dtype.family() {
            let mut layer = dense.clone();
            let cast = cast_fp8(&dense.logical_weight()?, cfg.dtype)?;
            layer.set_logical_weight(cast)?;
            return Ok((Layer::Dense(layer), dense_bytes, dense_bytes));
        }

        let axis = cfg.group_axis()?;
        let logical = dense.logical_weight()?;
        let params = solve(&logical, cfg, axis)?;

        if self.config.export_compressed_model {
            let packed = QuantizedTensor::pack(&params, axis)?;
            let packed_bytes = packed.compressed_size() as u64;
            let layer = WeightOnlyLinear::new(
                packed,
                dense.bias().cloned(),
                dense.layout(),
                self.config.dequant_mode,
                device,
                logical.dtype(),
            )?;
            Ok((Layer::WeightOnly(layer), dense_bytes, packed_bytes))
        } else {
            let restored = Tensor::from_vec(params.dequantize(), (params.rows, params.cols), logical.device())?;
            let restored = match axis {
                GroupAxis::Input => restored,
                GroupAxis::Output => restored.t()?.contiguous()?,
            };
            let mut layer = dense.clone();
            layer.set_logical_weight(restored.to_dtype(logical.dtype())?)?;
            Ok((Layer::Dense(layer), dense_bytes, dense_bytes))
        }
    }
}

/// Solve codes and parameters for a logical `[out, in]` weight grouped
/// along `axis`.
pub fn solve(logical: &Tensor, cfg: &LayerConfig, axis: GroupAxis) -> crate::Result<QuantParams> {
    let view = match axis {
        GroupAxis::Input => logical.clone(),
        GroupAxis::Output => logical.t()?.contiguous()?,
    };
    let (rows, cols) = view.dims2()?;
    let data: Vec<f32> = view.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let spec = QuantSpec::from(cfg);

    if data.iter().any(|v| !v.is_finite()) {
        warn!("Weight of shape [{}, {}] holds non-finite values", rows, cols);
    }

    let clip = if cfg.use_mse_search {
        search_clip(&data, rows, cols, &spec, cfg.mse_granularity)?
    } else {
        ClipRatios::Uniform(spec.quantile)
    };
    quantize_clipped(&data, rows, cols, &spec, &clip)
}
