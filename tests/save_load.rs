mod common;

use candle_core::{DType, Device};
use common::{init_tracing, inputs, layer_norm, max_abs_diff, mlp_block};
use rs_woq::config::DequantMode;
use rs_woq::layers::{MulLinear, NormKind, NormLayer};
use rs_woq::model::{self, QCONFIG_FILE, WEIGHTS_FILE};
use rs_woq::{
    AbsorptionGroup, DenseLayer, Layer, LayerConfig, LayerGraph, LayerOverride, QuantConfig, RtnQuantizer,
    Scheme, TrainableEquivalentTransformation, WoqError,
};

fn assert_same_forward(a: &LayerGraph, b: &LayerGraph, features: usize) {
    let x = inputs(3, features, 99);
    assert_eq!(
        a.forward(&x).unwrap().to_vec2::<f32>().unwrap(),
        b.forward(&x).unwrap().to_vec2::<f32>().unwrap()
    );
}

#[test]
fn test_packed_graph_round_trip() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut graph = mlp_block(layer_norm(16, 1), 16, 40, 2);
    let config = QuantConfig::double_quant_preset("GGML_TYPE_Q4_K")
        .unwrap()
        .with_layer(
            "fc2",
            LayerOverride {
                group_dim: Some(0),
                use_double_quant: Some(false),
                ..LayerOverride::dtype("nf4")
            },
        )
        .with_dequant_mode(DequantMode::AheadOfTime);
    RtnQuantizer::new(config.clone()).convert(&mut graph).unwrap();

    model::save(&graph, &config, dir.path()).unwrap();
    assert!(dir.path().join(QCONFIG_FILE).exists());
    assert!(dir.path().join(WEIGHTS_FILE).exists());

    let (loaded, loaded_config) = model::load(dir.path(), &Device::Cpu).unwrap();
    assert_eq!(loaded_config, config);
    assert_eq!(loaded.names(), graph.names());

    let (Some(Layer::WeightOnly(fc1)), Some(Layer::WeightOnly(orig))) = (loaded.get("fc1"), graph.get("fc1")) else {
        panic!("fc1 should be packed");
    };
    assert_eq!(fc1.packed(), orig.packed());
    assert!(fc1.packed().scale_quant.is_some());
    assert_eq!(fc1.mode(), DequantMode::AheadOfTime);
    assert!(fc1.bias().is_some());

    let Some(Layer::WeightOnly(fc2)) = loaded.get("fc2") else {
        panic!("fc2 should be packed");
    };
    assert!(fc2.packed().scale_quant.is_none());
    assert_eq!(fc2.packed().scale_shape[1], 40);

    assert_same_forward(&graph, &loaded, 16);
}

#[test]
fn test_fake_quantized_graph_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let norm = NormLayer::new(NormKind::BatchNorm, 16, 1e-5)
        .unwrap()
        .with_running_stats(
            common::random_vector(16, -0.5, 0.5, 3),
            common::random_vector(16, 0.5, 1.5, 4),
        )
        .unwrap();
    let mut graph = mlp_block(norm, 16, 24, 5);
    let config = QuantConfig::new(LayerConfig::int(6, Scheme::Asym, 8)).with_export_compressed(false);
    RtnQuantizer::new(config.clone()).convert(&mut graph).unwrap();

    model::save(&graph, &config, dir.path()).unwrap();
    let (loaded, _) = model::load(dir.path(), &Device::Cpu).unwrap();
    assert!(matches!(loaded.get("fc1"), Some(Layer::Dense(_))));
    let Some(Layer::Norm(norm)) = loaded.get("norm") else {
        panic!("norm should load as a norm");
    };
    assert!(norm.running_mean.is_some() && norm.weight.is_none());
    assert_same_forward(&graph, &loaded, 16);
}

#[test]
fn test_conv1d_and_half_precision_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let weight = common::random_tensor(12, 20, 6).to_dtype(DType::F16).unwrap();
    let mut graph = LayerGraph::new(&Device::Cpu)
        .with_layer("c_fc", DenseLayer::conv1d(weight, None).unwrap())
        .unwrap()
        .with_layer(
            "c_proj",
            DenseLayer::conv1d(common::random_tensor(20, 12, 7).to_dtype(DType::F16).unwrap(), None).unwrap(),
        )
        .unwrap();
    let config = QuantConfig::explicit().with_layer("c_proj", LayerOverride::dtype("int8"));
    RtnQuantizer::new(config.clone()).convert(&mut graph).unwrap();

    model::save(&graph, &config, dir.path()).unwrap();
    let (loaded, _) = model::load(dir.path(), &Device::Cpu).unwrap();
    let Some(Layer::Dense(c_fc)) = loaded.get("c_fc") else {
        panic!("c_fc was not quantized");
    };
    assert_eq!(c_fc.weight().dtype(), DType::F16);
    assert_eq!(c_fc.in_features(), 12);

    let x = inputs(2, 12, 8).to_dtype(DType::F16).unwrap();
    let a = graph.forward(&x).unwrap().to_dtype(DType::F32).unwrap();
    let b = loaded.forward(&x).unwrap().to_dtype(DType::F32).unwrap();
    assert_eq!(a.to_vec2::<f32>().unwrap(), b.to_vec2::<f32>().unwrap());
}

#[test]
fn test_non_folded_teq_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut graph = mlp_block(layer_norm(16, 9), 16, 32, 10);
    let config = QuantConfig::new(LayerConfig::int(4, Scheme::Sym, 16));
    let mut teq = TrainableEquivalentTransformation::new(config.clone(), vec![AbsorptionGroup::new("norm", ["fc1"])])
        .with_folding(false);
    teq.add_tuning_scale(&mut graph, true).unwrap();
    teq.transform(&mut graph).unwrap();
    teq.quantize(&mut graph).unwrap();

    model::save(&graph, &config, dir.path()).unwrap();
    let (loaded, _) = model::load(dir.path(), &Device::Cpu).unwrap();
    let Some(Layer::MulLinear(fc1)) = loaded.get("fc1") else {
        panic!("fc1 should keep its input scale");
    };
    assert!(matches!(fc1.inner(), Layer::WeightOnly(_)));
    assert_same_forward(&graph, &loaded, 16);
}

#[test]
fn test_wrapped_graph_cannot_be_saved() {
    let dir = tempfile::tempdir().unwrap();
    let mut graph = mlp_block(layer_norm(16, 11), 16, 32, 12);
    let config = QuantConfig::default();
    let mut teq = TrainableEquivalentTransformation::new(config.clone(), vec![AbsorptionGroup::new("norm", ["fc1"])]);
    teq.add_tuning_scale(&mut graph, false).unwrap();

    let err = model::save(&graph, &config, dir.path()).unwrap_err();
    assert!(matches!(err, WoqError::InvalidState { .. }));
}

#[test]
fn test_colliding_tensor_names_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let scaled = MulLinear::new(
        Layer::Dense(DenseLayer::linear(common::random_tensor(8, 8, 14), None).unwrap()),
        common::random_vector(8, 0.5, 1.5, 15),
    );
    let graph = LayerGraph::new(&Device::Cpu)
        .with_layer("fc", Layer::MulLinear(scaled))
        .unwrap()
        .with_layer("fc.linear", DenseLayer::linear(common::random_tensor(8, 8, 16), None).unwrap())
        .unwrap();

    let err = model::save(&graph, &QuantConfig::default(), dir.path()).unwrap_err();
    assert!(matches!(err, WoqError::SerializationError(_)));
}

#[test]
fn test_missing_directory() {
    let dir = tempfile::tempdir().unwrap();
    let err = model::load(dir.path().join("absent"), &Device::Cpu).unwrap_err();
    assert!(matches!(err, WoqError::IoError(_)));
}

#[test]
fn test_reloaded_packed_layer_matches_original_weights() {
    let dir = tempfile::tempdir().unwrap();
    let weight = common::random_tensor(8, 24, 13);
    let mut graph = LayerGraph::new(&Device::Cpu)
        .with_layer("proj", DenseLayer::linear(weight.clone(), None).unwrap())
        .unwrap();
    let config = QuantConfig::double_quant_preset("BNB_NF4").unwrap();
    RtnQuantizer::new(config.clone()).convert(&mut graph).unwrap();
    model::save(&graph, &config, dir.path()).unwrap();

    let (loaded, _) = model::load(dir.path(), &Device::Cpu).unwrap();
    let Some(Layer::WeightOnly(proj)) = loaded.get("proj") else {
        panic!("proj should be packed");
    };
    assert!(max_abs_diff(&proj.weight().unwrap(), &weight) < 0.25);
}
