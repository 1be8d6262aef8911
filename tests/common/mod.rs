#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rs_woq::layers::Activation;
use rs_woq::{DenseLayer, LayerGraph, NormLayer};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn random_values(len: usize, scale: f32, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.random_range(-scale..scale)).collect()
}

pub fn random_tensor(rows: usize, cols: usize, seed: u64) -> Tensor {
    Tensor::from_vec(random_values(rows * cols, 1.0, seed), (rows, cols), &Device::Cpu).unwrap()
}

pub fn random_vector(len: usize, lo: f32, hi: f32, seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f32> = (0..len).map(|_| rng.random_range(lo..hi)).collect();
    Tensor::from_vec(data, len, &Device::Cpu).unwrap()
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_dtype(DType::F32)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

pub fn mse(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .sqr()
        .unwrap()
        .mean_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

pub fn layer_norm(features: usize, seed: u64) -> NormLayer {
    NormLayer::layer_norm(
        random_vector(features, 0.5, 1.5, seed),
        random_vector(features, -0.1, 0.1, seed + 1),
        1e-5,
    )
    .unwrap()
}

/// norm -> fc1 -> gelu -> fc2, hidden -> ffn -> hidden
pub fn mlp_block(norm: NormLayer, hidden: usize, ffn: usize, seed: u64) -> LayerGraph {
    let fc1 = DenseLayer::linear(
        random_tensor(ffn, hidden, seed),
        Some(random_vector(ffn, -0.1, 0.1, seed + 1)),
    )
    .unwrap();
    let fc2 = DenseLayer::linear(random_tensor(hidden, ffn, seed + 2), None).unwrap();
    LayerGraph::new(&Device::Cpu)
        .with_layer("norm", norm)
        .unwrap()
        .with_layer("fc1", fc1)
        .unwrap()
        .with_layer("act", Activation::Gelu)
        .unwrap()
        .with_layer("fc2", fc2)
        .unwrap()
}

pub fn inputs(batch: usize, features: usize, seed: u64) -> Tensor {
    Tensor::from_vec(random_values(batch * features, 2.0, seed), (batch, features), &Device::Cpu).unwrap()
}
