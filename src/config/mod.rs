//! Configuration module for quantization recipes.

mod quant_config;

pub use quant_config::{
    DequantMode, DoubleQuantConfig, GroupAxis, LayerConfig, LayerOverride, MseGranularity,
    QuantConfig, QuantDtype, Scheme,
};
