//! Persistence of rewritten graphs.
//!
//! A saved model is a directory with two files:
//! - `qconfig.json`: the quantization config plus one structural record
//!   per layer (kind, orientation, packing metadata)
//! - `quantized_model.safetensors`: every tensor, keyed `<layer>.<field>`
//!
//! Loading memory-maps the safetensors file.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::WoqError;
use crate::config::{DequantMode, QuantConfig};
use crate::layers::{
    Activation, DenseLayer, Layer, MulLinear, NormKind, NormLayer, WeightLayout, WeightOnlyLinear,
};
use crate::model::LayerGraph;
use crate::quantization::{PackedMeta, QuantizedTensor};
use crate::utils::{dtype_name, parse_dtype};

pub const QCONFIG_FILE: &str = "qconfig.json";
pub const WEIGHTS_FILE: &str = "quantized_model.safetensors";

/// Structural description of one layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerRecord {
    Dense {
        layout: WeightLayout,
        dtype: String,
        has_bias: bool,
    },
    Norm {
        kind: NormKind,
        num_features: usize,
        eps: f64,
        has_weight: bool,
        has_bias: bool,
        has_running_stats: bool,
    },
    Activation {
        activation: Activation,
    },
    WeightOnly {
        packed: PackedMeta,
        source_layout: WeightLayout,
        mode: DequantMode,
        dtype: String,
        has_bias: bool,
    },
    MulLinear {
        inner: Box<LayerRecord>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NamedRecord {
    name: String,
    #[serde(flatten)]
    record: LayerRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SavedModel {
    config: QuantConfig,
    layers: Vec<NamedRecord>,
}

fn key(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", prefix, field)
    }
}

/// Insert under a key no other layer has claimed. Layer names that extend
/// another layer's prefix (`fc` holding `fc.linear.weight` next to a layer
/// named `fc.linear`) would otherwise overwrite each other.
fn put(tensors: &mut HashMap<String, Tensor>, key: String, tensor: Tensor) -> crate::Result<()> {
    if tensors.contains_key(&key) {
        return Err(WoqError::SerializationError(format!(
            "tensor '{}' is written by two layers; rename one of them",
            key
        )));
    }
    tensors.insert(key, tensor);
    Ok(())
}

fn bytes_tensor(bytes: &[u8]) -> crate::Result<Tensor> {
    Ok(Tensor::from_vec(bytes.to_vec(), bytes.len(), &Device::Cpu)?)
}

fn write_packed(
    prefix: &str,
    packed: &QuantizedTensor,
    tensors: &mut HashMap<String, Tensor>,
) -> crate::Result<()> {
    put(tensors, key(prefix, "qweight"), bytes_tensor(&packed.data)?)?;
    if let Some(zps) = &packed.zero_points {
        put(tensors, key(prefix, "qzeros"), bytes_tensor(zps)?)?;
    }
    match &packed.scale_quant {
        Some(nested) => write_packed(&key(prefix, "scales_quant"), nested, tensors)?,
        None => {
            let scales = Tensor::from_vec(
                packed.scales.clone(),
                (packed.scale_shape[0], packed.scale_shape[1]),
                &Device::Cpu,
            )?;
            put(tensors, key(prefix, "scales"), scales)?;
        }
    }
    Ok(())
}

fn write_layer(
    prefix: &str,
    layer: &Layer,
    tensors: &mut HashMap<String, Tensor>,
) -> crate::Result<LayerRecord> {
    let cpu = |t: &Tensor| t.to_device(&Device::Cpu);
    let record = match layer {
        Layer::Dense(dense) => {
            put(tensors, key(prefix, "weight"), cpu(dense.weight())?)?;
            if let Some(bias) = dense.bias() {
                put(tensors, key(prefix, "bias"), cpu(bias)?)?;
            }
            LayerRecord::Dense {
                layout: dense.layout(),
                dtype: dtype_name(dense.weight().dtype()).to_string(),
                has_bias: dense.bias().is_some(),
            }
        }
        Layer::Norm(norm) => {
            let optional = [
                ("weight", &norm.weight),
                ("bias", &norm.bias),
                ("running_mean", &norm.running_mean),
                ("running_var", &norm.running_var),
            ];
            for (field, tensor) in optional {
                if let Some(t) = tensor {
                    put(tensors, key(prefix, field), cpu(t)?)?;
                }
            }
            LayerRecord::Norm {
                kind: norm.kind,
                num_features: norm.num_features,
                eps: norm.eps,
                has_weight: norm.weight.is_some(),
                has_bias: norm.bias.is_some(),
                has_running_stats: norm.running_mean.is_some() && norm.running_var.is_some(),
            }
        }
        Layer::Activation(act) => LayerRecord::Activation { activation: *act },
        Layer::WeightOnly(wo) => {
            write_packed(prefix, wo.packed(), tensors)?;
            if let Some(bias) = wo.bias() {
                put(tensors, key(prefix, "bias"), cpu(bias)?)?;
            }
            LayerRecord::WeightOnly {
                packed: wo.packed().meta(),
                source_layout: wo.source_layout(),
                mode: wo.mode(),
                dtype: dtype_name(wo.dtype()).to_string(),
                has_bias: wo.bias().is_some(),
            }
        }
        Layer::MulLinear(mul) => {
            put(tensors, key(prefix, "input_scale"), cpu(mul.input_scale())?)?;
            let inner = write_layer(&key(prefix, "linear"), mul.inner(), tensors)?;
            LayerRecord::MulLinear {
                inner: Box::new(inner),
            }
        }
        Layer::FakeQuant(_) => {
            return Err(WoqError::InvalidState {
                expected: "graph without TEQ wrappers".to_string(),
                found: format!("fake-quant wrapper at '{}'", prefix),
            });
        }
    };
    Ok(record)
}

/// Save a rewritten graph and the config that produced it into `dir`.
pub fn save(graph: &LayerGraph, config: &QuantConfig, dir: impl AsRef<Path>) -> crate::Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    let mut tensors = HashMap::new();
    let mut layers = Vec::with_capacity(graph.len());
    for (name, layer) in graph.iter() {
        let record = write_layer(name, layer, &mut tensors)?;
        layers.push(NamedRecord {
            name: name.to_string(),
            record,
        });
    }

    let saved = SavedModel {
        config: config.clone(),
        layers,
    };
    std::fs::write(dir.join(QCONFIG_FILE), serde_json::to_string_pretty(&saved)?)?;
    candle_core::safetensors::save(&tensors, dir.join(WEIGHTS_FILE))?;

    info!(
        "Saved {} layers ({} tensors) to {:?}",
        graph.len(),
        tensors.len(),
        dir
    );
    Ok(())
}

/// Tensors of a memory-mapped safetensors file, materialized on demand
struct TensorSource<'a> {
    st: SafeTensors<'a>,
}

impl<'a> TensorSource<'a> {
    fn tensor(&self, name: &str) -> crate::Result<Tensor> {
        let view = self
            .st
            .tensor(name)
            .map_err(|_| WoqError::SerializationError(format!("missing tensor '{}'", name)))?;
        let shape: Vec<usize> = view.shape().to_vec();
        let dtype = convert_safetensor_dtype(view.dtype())?;
        Ok(Tensor::from_raw_buffer(view.data(), dtype, &shape, &Device::Cpu)?)
    }

    fn optional(&self, name: &str, present: bool) -> crate::Result<Option<Tensor>> {
        if present { self.tensor(name).map(Some) } else { Ok(None) }
    }

    fn bytes(&self, name: &str) -> crate::Result<Vec<u8>> {
        Ok(self.tensor(name)?.flatten_all()?.to_vec1::<u8>()?)
    }
}

fn read_packed(prefix: &str, meta: &PackedMeta, src: &TensorSource<'_>) -> crate::Result<QuantizedTensor> {
    let data = src.bytes(&key(prefix, "qweight"))?;
    let zero_points = if meta.has_zero_points {
        Some(src.bytes(&key(prefix, "qzeros"))?)
    } else {
        None
    };
    let (scales, nested) = match &meta.scale_quant {
        Some(nested_meta) => (
            None,
            Some(read_packed(&key(prefix, "scales_quant"), nested_meta, src)?),
        ),
        None => {
            let scales = src
                .tensor(&key(prefix, "scales"))?
                .to_dtype(DType::F32)?
                .flatten_all()?
                .to_vec1::<f32>()?;
            (Some(scales), None)
        }
    };
    QuantizedTensor::from_parts(meta, data, scales, zero_points, nested)
}

fn read_layer(
    prefix: &str,
    record: &LayerRecord,
    src: &TensorSource<'_>,
    device: &Device,
) -> crate::Result<Layer> {
    let on_device = |t: Tensor| t.to_device(device);
    let layer = match record {
        LayerRecord::Dense {
            layout,
            dtype,
            has_bias,
        } => {
            let dtype = parse_dtype(dtype)?;
            let weight = on_device(src.tensor(&key(prefix, "weight"))?.to_dtype(dtype)?)?;
            let bias = src
                .optional(&key(prefix, "bias"), *has_bias)?
                .map(on_device)
                .transpose()?;
            Layer::Dense(DenseLayer::new(weight, bias, *layout)?)
        }
        LayerRecord::Norm {
            kind,
            num_features,
            eps,
            has_weight,
            has_bias,
            has_running_stats,
        } => {
            let mut norm = NormLayer::new(*kind, *num_features, *eps)?;
            if let Some(weight) = src.optional(&key(prefix, "weight"), *has_weight)? {
                let bias = src
                    .optional(&key(prefix, "bias"), *has_bias)?
                    .map(on_device)
                    .transpose()?;
                norm = norm.with_affine(on_device(weight)?, bias)?;
            }
            if *has_running_stats {
                let mean = on_device(src.tensor(&key(prefix, "running_mean"))?)?;
                let var = on_device(src.tensor(&key(prefix, "running_var"))?)?;
                norm = norm.with_running_stats(mean, var)?;
            }
            Layer::Norm(norm)
        }
        LayerRecord::Activation { activation } => Layer::Activation(*activation),
        LayerRecord::WeightOnly {
            packed,
            source_layout,
            mode,
            dtype,
            has_bias,
        } => {
            let packed = read_packed(prefix, packed, src)?;
            let bias = src
                .optional(&key(prefix, "bias"), *has_bias)?
                .map(on_device)
                .transpose()?;
            Layer::WeightOnly(WeightOnlyLinear::new(
                packed,
                bias,
                *source_layout,
                *mode,
                device,
                parse_dtype(dtype)?,
            )?)
        }
        LayerRecord::MulLinear { inner } => {
            let scale = on_device(src.tensor(&key(prefix, "input_scale"))?)?;
            let inner = read_layer(&key(prefix, "linear"), inner, src, device)?;
            Layer::MulLinear(MulLinear::new(inner, scale))
        }
    };
    Ok(layer)
}

/// Load a graph saved with [`save`], placing it on `device`.
pub fn load(dir: impl AsRef<Path>, device: &Device) -> crate::Result<(LayerGraph, QuantConfig)> {
    let dir = dir.as_ref();
    let content = std::fs::read_to_string(dir.join(QCONFIG_FILE))?;
    let saved: SavedModel = serde_json::from_str(&content)?;

    let weights_path = dir.join(WEIGHTS_FILE);
    debug!("Loading weights file: {:?}", weights_path);

    // Memory-map the file
    let file = std::fs::File::open(&weights_path)?;
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    let src = TensorSource {
        st: SafeTensors::deserialize(&mmap)?,
    };

    let mut graph = LayerGraph::new(device);
    for entry in &saved.layers {
        let layer = read_layer(&entry.name, &entry.record, &src, device)?;
        graph.push(entry.name.clone(), layer)?;
    }

    info!("Loaded {} layers from {:?}", graph.len(), dir);
    Ok((graph, saved.config))
}

/// Convert safetensor dtype to candle dtype
fn convert_safetensor_dtype(dtype: safetensors::Dtype) -> crate::Result<DType> {
    match dtype {
        safetensors::Dtype::F16 => Ok(DType::F16),
        safetensors::Dtype::BF16 => Ok(DType::BF16),
        safetensors::Dtype::F32 => Ok(DType::F32),
        safetensors::Dtype::F64 => Ok(DType::F64),
        safetensors::Dtype::I64 => Ok(DType::I64),
        safetensors::Dtype::U8 => Ok(DType::U8),
        safetensors::Dtype::U32 => Ok(DType::U32),
        other => Err(WoqError::SerializationError(format!(
            "unsupported tensor dtype {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_conversion() {
        assert!(matches!(convert_safetensor_dtype(safetensors::Dtype::F16), Ok(DType::F16)));
        assert!(matches!(convert_safetensor_dtype(safetensors::Dtype::U8), Ok(DType::U8)));
        assert!(convert_safetensor_dtype(safetensors::Dtype::I16).is_err());
    }

    #[test]
    fn test_keys() {
        assert_eq!(key("", "weight"), "weight");
        assert_eq!(key("blocks.0.fc", "qweight"), "blocks.0.fc.qweight");
    }

    #[test]
    fn test_record_json_shape() {
        let record = LayerRecord::Activation {
            activation: Activation::Gelu,
        };
        let json = serde_json::to_string(&NamedRecord {
            name: "act".to_string(),
            record,
        })
        .unwrap();
        assert_eq!(json, r#"{"name":"act","type":"activation","activation":"gelu"}"#);
    }
}
