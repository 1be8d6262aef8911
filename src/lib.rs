//! # rs-woq
//!
//! Weight-only post-training quantization for the linear layers of large
//! neural networks. Weights are compressed to low-bit codes while activations
//! and compute stay in full precision; weights are reconstructed on read.
//!
//! ## Core Concept
//!
//! Two algorithms share one parameter solver:
//! - **RTN** (round-to-nearest): derive per-group scale/zero-point directly
//!   and rewrite every eligible layer into a packed [`WeightOnlyLinear`].
//! - **TEQ** (trainable equivalent transformation): learn a per-input-channel
//!   scale, fold it into the upstream anchor layer and the downstream weights,
//!   then hand the rescaled weights to the RTN rewriter.
//!
//! ## Example
//!
//! ```ignore
//! use rs_woq::{LayerGraph, QuantConfig, RtnQuantizer};
//!
//! fn main() -> rs_woq::Result<()> {
//!     let mut graph: LayerGraph = build_graph()?;
//!     let outcome = RtnQuantizer::new(QuantConfig::default()).convert(&mut graph)?;
//!     println!("quantized {} layers", outcome.quantized.len());
//!     Ok(())
//! }
//! ```

pub mod algorithms;
pub mod config;
pub mod layers;
pub mod model;
pub mod quantization;
pub mod utils;

// Re-exports for convenience
pub use algorithms::{
    AbsorptionGroup, CalibrationBatch, CalibrationSource, RtnOutcome, RtnQuantizer, TeqStage,
    TrainConfig, TrainableEquivalentTransformation,
};
pub use config::{DoubleQuantConfig, LayerConfig, LayerOverride, QuantConfig, QuantDtype, Scheme};
pub use layers::{DenseLayer, Layer, LayerKind, NormLayer, WeightLayout, WeightOnlyLinear};
pub use model::LayerGraph;
pub use quantization::{QuantParams, QuantSpec, QuantizedTensor};
pub use utils::{Device, DType};

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum WoqError {
    #[error("Assertion failed: {0}")]
    AssertionError(String),

    #[error("Layer not found: {0}")]
    LayerNotFound(String),

    #[error("Unsupported layer kind for '{name}': {kind}")]
    UnsupportedLayer { name: String, kind: String },

    #[error("Quantization error: {0}")]
    QuantizationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid state: expected {expected}, found {found}")]
    InvalidState { expected: String, found: String },

    #[error("Training error: {0}")]
    TrainingError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    CandleError(#[from] candle_core::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Safetensors error: {0}")]
    SafetensorsError(#[from] safetensors::SafeTensorError),
}

pub type Result<T> = std::result::Result<T, WoqError>;
