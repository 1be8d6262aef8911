//! Trainable equivalent transformation.
//!
//! A per-input-channel scale is learned for every absorption group, then
//! folded: the anchor's output is multiplied by `1/scale` and every member's
//! input channels by `scale`, which leaves the full-precision function
//! unchanged while reshaping the weights the rewriter quantizes.
//!
//! Stages run in order: [`add_tuning_scale`], optionally [`train`],
//! [`transform`], then [`quantize`].
//!
//! [`add_tuning_scale`]: TrainableEquivalentTransformation::add_tuning_scale
//! [`train`]: TrainableEquivalentTransformation::train
//! [`transform`]: TrainableEquivalentTransformation::transform
//! [`quantize`]: TrainableEquivalentTransformation::quantize

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::rtn::{RtnOutcome, RtnQuantizer};
use super::train::{CalibrationSource, TrainConfig};
use crate::WoqError;
use crate::config::QuantConfig;
use crate::layers::{ALPHA_FLOOR, DenseLayer, Layer, MulLinear, ScaleHandle, TeqLinearFakeQuant};
use crate::model::LayerGraph;
use crate::quantization::QuantSpec;

/// Layers whose inputs all come from `anchor`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbsorptionGroup {
    pub anchor: String,
    pub members: Vec<String>,
}

impl AbsorptionGroup {
    pub fn new(anchor: impl Into<String>, members: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            anchor: anchor.into(),
            members: members.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeqStage {
    Created,
    ScalesAdded,
    Trained,
    Transformed,
    Quantized,
}

impl fmt::Display for TeqStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TeqStage::Created => "created",
            TeqStage::ScalesAdded => "scales_added",
            TeqStage::Trained => "trained",
            TeqStage::Transformed => "transformed",
            TeqStage::Quantized => "quantized",
        };
        f.write_str(name)
    }
}

/// Loss history of a training run
#[derive(Debug, Clone, Default)]
pub struct TrainReport {
    /// Forward/backward passes run
    pub steps: usize,
    /// Optimizer updates applied
    pub updates: usize,
    /// Unscaled loss of every pass
    pub losses: Vec<f32>,
}

impl TrainReport {
    pub fn final_loss(&self) -> Option<f32> {
        self.losses.last().copied()
    }
}

#[derive(Debug)]
pub struct TrainableEquivalentTransformation {
    config: QuantConfig,
    groups: Vec<AbsorptionGroup>,
    folding: bool,
    stage: TeqStage,
    /// One scale per absorption group, keyed by anchor name
    trained_alphas: BTreeMap<String, Var>,
}

impl TrainableEquivalentTransformation {
    pub fn new(config: QuantConfig, groups: Vec<AbsorptionGroup>) -> Self {
        Self {
            config,
            groups,
            folding: true,
            stage: TeqStage::Created,
            trained_alphas: BTreeMap::new(),
        }
    }

    /// Keep the inverse scale as an explicit [`MulLinear`] in front of each
    /// member instead of folding it into the anchor
    pub fn with_folding(mut self, folding: bool) -> Self {
        self.folding = folding;
        self
    }

    pub fn stage(&self) -> TeqStage {
        self.stage
    }

    pub fn groups(&self) -> &[AbsorptionGroup] {
        &self.groups
    }

    pub fn config(&self) -> &QuantConfig {
        &self.config
    }

    /// Current scale of every group, keyed by anchor
    pub fn scales(&self) -> BTreeMap<String, Tensor> {
        self.trained_alphas
            .iter()
            .map(|(anchor, var)| (anchor.clone(), var.as_tensor().detach()))
            .collect()
    }

    /// Move the graph and every scale to `device`
    pub fn to_device(&mut self, graph: &mut LayerGraph, device: &Device) -> crate::Result<()> {
        graph.to_device(device)?;
        self.relink_scales(graph)
    }

    /// Point every group's scale at the variable its wrappers hold in
    /// `graph`. Moving a graph gives the wrappers fresh variables, and the
    /// optimizer and fold must act on those.
    fn relink_scales(&mut self, graph: &LayerGraph) -> crate::Result<()> {
        for group in &self.groups {
            let Some(current) = self.trained_alphas.get(&group.anchor) else {
                continue;
            };

            let mut held: Option<Var> = None;
            for member in &group.members {
                let Some(Layer::FakeQuant(wrapper)) = graph.get(member) else {
                    continue;
                };
                let ScaleHandle::Trainable(var) = wrapper.alpha() else {
                    continue;
                };
                match &held {
                    Some(first) if first.as_tensor().id() != var.as_tensor().id() => {
                        return Err(WoqError::InvalidState {
                            expected: format!("one shared scale for the members of '{}'", group.anchor),
                            found: format!("'{}' holds its own copy", member),
                        });
                    }
                    Some(_) => {}
                    None => held = Some(var.clone()),
                }
            }

            let linked = match held {
                Some(var) => var,
                None if !current.device().same_device(graph.device()) => {
                    Var::from_tensor(&current.as_tensor().to_device(graph.device())?)?
                }
                None => continue,
            };
            if linked.as_tensor().id() != current.as_tensor().id() {
                debug!("Relinked scale of '{}' to the copy held by the graph", group.anchor);
                self.trained_alphas.insert(group.anchor.clone(), linked);
            }
        }
        Ok(())
    }

    fn expect_stage(&self, allowed: &[TeqStage], op: &str) -> crate::Result<()> {
        if allowed.contains(&self.stage) {
            return Ok(());
        }
        let expected = allowed.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(" or ");
        Err(WoqError::InvalidState {
            expected: format!("{} before {}", expected, op),
            found: self.stage.to_string(),
        })
    }

    /// Create one trainable scale per absorption group and wrap the layers
    /// that will see it.
    ///
    /// Scales start at one, or with `sqrt_w_init` at `1/sqrt(max|w|)` per
    /// input channel over all member weights. Dense layers outside every
    /// group get a frozen unit scale so that every quantized layer is
    /// fake-quantized during training.
    pub fn add_tuning_scale(&mut self, graph: &mut LayerGraph, sqrt_w_init: bool) -> crate::Result<()> {
        self.expect_stage(&[TeqStage::Created], "add_tuning_scale")?;

        for group in &self.groups {
            graph.layer(&group.anchor)?;
            for member in &group.members {
                graph.layer(member)?;
            }
        }

        let mut wrapped = HashSet::new();
        for group in &self.groups {
            let Some(members) = group_members(graph, group)? else {
                continue;
            };

            let alpha = if sqrt_w_init {
                sqrt_init(&members, graph.device())?
            } else {
                Tensor::ones(members[0].in_features(), DType::F32, graph.device())?
            };
            let alpha = Var::from_tensor(&alpha)?;

            for (name, dense) in group.members.iter().zip(members) {
                let Some(cfg) = self.config.resolve(name)? else {
                    info!("'{}' has no quantization config, leaving it unwrapped", name);
                    continue;
                };
                let wrapper = TeqLinearFakeQuant::new(
                    dense,
                    ScaleHandle::Trainable(alpha.clone()),
                    QuantSpec::from(&cfg),
                    cfg.group_axis()?,
                );
                graph.replace(name, Layer::FakeQuant(wrapper))?;
                wrapped.insert(name.clone());
            }

            debug!(
                "Scale for '{}' covers {} input channels of {:?}",
                group.anchor,
                alpha.dims()[0],
                group.members
            );
            self.trained_alphas.insert(group.anchor.clone(), alpha);
        }

        for name in graph.names() {
            if wrapped.contains(&name) {
                continue;
            }
            let Some(Layer::Dense(dense)) = graph.get(&name) else {
                continue;
            };
            let Some(cfg) = self.config.resolve(&name)? else {
                debug!("'{}' has no quantization config, leaving it unwrapped", name);
                continue;
            };
            let unit = Tensor::ones(dense.in_features(), DType::F32, graph.device())?;
            let wrapper = TeqLinearFakeQuant::new(
                dense.clone(),
                ScaleHandle::Frozen(unit),
                QuantSpec::from(&cfg),
                cfg.group_axis()?,
            );
            graph.replace(&name, Layer::FakeQuant(wrapper))?;
        }

        info!("Added {} tuning scales", self.trained_alphas.len());
        self.stage = TeqStage::ScalesAdded;
        Ok(())
    }

    /// Optimize the scales against `loss_fn` for `cfg.train_steps` passes
    /// over `data`, restarting the stream as often as needed.
    pub fn train<S, F>(
        &mut self,
        graph: &LayerGraph,
        data: &S,
        cfg: &TrainConfig,
        mut loss_fn: F,
    ) -> crate::Result<TrainReport>
    where
        S: CalibrationSource + ?Sized,
        F: FnMut(&LayerGraph, &Tensor) -> crate::Result<Tensor>,
    {
        self.expect_stage(&[TeqStage::ScalesAdded, TeqStage::Trained], "train")?;
        cfg.validate()?;
        self.relink_scales(graph)?;

        let vars: Vec<Var> = self.trained_alphas.values().cloned().collect();
        let mut report = TrainReport::default();
        if vars.is_empty() {
            warn!("No trainable scales, skipping training");
            self.stage = TeqStage::Trained;
            return Ok(report);
        }

        let params = ParamsAdamW {
            lr: cfg.lr_at(0),
            beta1: cfg.beta1,
            beta2: cfg.beta2,
            eps: 1e-8,
            weight_decay: cfg.weight_decay,
        };
        let mut optimizer = AdamW::new(vars.clone(), params)?;
        let accumulation = cfg.accumulation();
        let logging_steps = cfg.logging_steps.max(1);

        info!(
            "Training {} scales for {} steps (lr {}, accumulation {}, {} warmup updates)",
            vars.len(),
            cfg.train_steps,
            cfg.lr,
            accumulation,
            cfg.warmup_updates()
        );

        let mut pending: Option<GradStore> = None;
        'outer: loop {
            let mut seen = false;
            for batch in data.batches() {
                seen = true;
                let input = batch.input_ids()?;

                let loss = loss_fn(graph, input)?;
                let loss = if loss.rank() == 0 { loss } else { loss.mean_all()? };
                let value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
                if !value.is_finite() {
                    return Err(WoqError::TrainingError(format!(
                        "loss became {} at step {}",
                        value, report.steps
                    )));
                }

                let grads = (loss / accumulation as f64)?.backward()?;
                pending = Some(match pending.take() {
                    None => grads,
                    Some(acc) => accumulate(acc, &grads, &vars)?,
                });
                report.steps += 1;
                report.losses.push(value);

                if report.steps % logging_steps == 0 {
                    info!("steps: {}, loss: {:.6}", report.steps, value);
                }

                if report.steps % accumulation == 0 {
                    if let Some(grads) = pending.take() {
                        optimizer.step(&grads)?;
                    }
                    report.updates += 1;
                    optimizer.set_learning_rate(cfg.lr_at(report.updates));
                }

                if report.steps >= cfg.train_steps {
                    break 'outer;
                }
            }
            if !seen {
                return Err(WoqError::TrainingError("calibration stream is empty".to_string()));
            }
        }

        info!(
            "Finished training after {} steps, {} updates, final loss {:.6}",
            report.steps,
            report.updates,
            report.final_loss().unwrap_or(f32::NAN)
        );
        self.stage = TeqStage::Trained;
        Ok(report)
    }

    /// Fold every scale into its group and strip all wrappers.
    pub fn transform(&mut self, graph: &mut LayerGraph) -> crate::Result<()> {
        self.expect_stage(&[TeqStage::ScalesAdded, TeqStage::Trained], "transform")?;
        self.relink_scales(graph)?;

        for group in &self.groups {
            let Some(alpha) = self.trained_alphas.get(&group.anchor) else {
                continue;
            };
            let scale = alpha.as_tensor().detach().maximum(ALPHA_FLOOR)?;
            let input_scale = scale.recip()?;

            if self.folding {
                absorb_into_anchor(graph, &group.anchor, &input_scale)?;
            }
            for member in &group.members {
                let mut dense = unwrap_dense(graph, member)?;
                dense.scale_input_channels(&scale)?;
                let layer = if self.folding {
                    Layer::Dense(dense)
                } else {
                    Layer::MulLinear(MulLinear::new(Layer::Dense(dense), input_scale.clone()))
                };
                graph.replace(member, layer)?;
            }
            debug!("Folded scale of '{}' into {:?}", group.anchor, group.members);
        }

        let mut stripped = 0;
        for name in graph.names() {
            if let Some(Layer::FakeQuant(wrapper)) = graph.get(&name) {
                let inner = wrapper.inner().clone();
                graph.replace(&name, Layer::Dense(inner))?;
                stripped += 1;
            }
        }

        info!(
            "Transformed {} groups (folding={}), removed {} remaining wrappers",
            self.trained_alphas.len(),
            self.folding,
            stripped
        );
        self.stage = TeqStage::Transformed;
        Ok(())
    }

    /// Run the round-to-nearest rewriter over the transformed graph.
    pub fn quantize(&mut self, graph: &mut LayerGraph) -> crate::Result<RtnOutcome> {
        self.expect_stage(&[TeqStage::Transformed], "quantize")?;
        let outcome = RtnQuantizer::new(self.config.clone()).convert(graph)?;
        self.stage = TeqStage::Quantized;
        Ok(outcome)
    }

    /// Store the current scales as safetensors keyed by anchor
    pub fn save_scales(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        let tensors: HashMap<String, Tensor> = self.scales().into_iter().collect();
        candle_core::safetensors::save(&tensors, path.as_ref())?;
        info!("Saved {} scales to {}", tensors.len(), path.as_ref().display());
        Ok(())
    }

    /// Overwrite the scales of known anchors with values from `path`
    pub fn load_scales(&mut self, path: impl AsRef<Path>) -> crate::Result<()> {
        self.expect_stage(&[TeqStage::ScalesAdded, TeqStage::Trained], "load_scales")?;
        let loaded = candle_core::safetensors::load(path.as_ref(), &Device::Cpu)?;

        for (anchor, var) in &self.trained_alphas {
            let Some(tensor) = loaded.get(anchor) else {
                warn!("No stored scale for '{}', keeping the current one", anchor);
                continue;
            };
            if tensor.dims() != var.dims() {
                return Err(WoqError::AssertionError(format!(
                    "stored scale for '{}' has shape {:?}, expected {:?}",
                    anchor,
                    tensor.dims(),
                    var.dims()
                )));
            }
            var.set(&tensor.to_dtype(var.dtype())?.to_device(var.device())?)?;
        }
        for name in loaded.keys().filter(|k| !self.trained_alphas.contains_key(*k)) {
            warn!("Ignoring stored scale for unknown anchor '{}'", name);
        }
        Ok(())
    }
}

/// Dense members of a group, `None` when the group cannot carry a scale
fn group_members(graph: &LayerGraph, group: &AbsorptionGroup) -> crate::Result<Option<Vec<DenseLayer>>> {
    let anchor = graph.layer(&group.anchor)?;
    let anchor_width = match anchor {
        Layer::Norm(norm) => norm.num_features,
        Layer::Dense(dense) => dense.out_features(),
        other => {
            warn!(
                "Anchor '{}' is a {} layer and cannot absorb a scale, skipping its group",
                group.anchor,
                other.kind()
            );
            return Ok(None);
        }
    };

    let mut members = Vec::with_capacity(group.members.len());
    for name in &group.members {
        match graph.layer(name)? {
            Layer::Dense(dense) => members.push(dense.clone()),
            other => {
                warn!(
                    "Member '{}' of '{}' is a {} layer, skipping the group",
                    name,
                    group.anchor,
                    other.kind()
                );
                return Ok(None);
            }
        }
    }
    if members.is_empty() {
        warn!("Group '{}' has no members", group.anchor);
        return Ok(None);
    }

    if let Some(bad) = members.iter().position(|m| m.in_features() != anchor_width) {
        return Err(WoqError::AssertionError(format!(
            "'{}' takes {} inputs but anchor '{}' produces {}",
            group.members[bad],
            members[bad].in_features(),
            group.anchor,
            anchor_width
        )));
    }
    Ok(Some(members))
}

/// `1/sqrt(max|w|)` per input channel; channels that are all zero get 1.
fn sqrt_init(members: &[DenseLayer], device: &Device) -> crate::Result<Tensor> {
    let mut weights = Vec::with_capacity(members.len());
    for member in members {
        weights.push(member.logical_weight()?.to_dtype(DType::F32)?);
    }
    let max: Vec<f32> = Tensor::cat(&weights, 0)?.abs()?.max(0)?.sqrt()?.to_vec1()?;
    let alpha: Vec<f32> = max
        .into_iter()
        .map(|m| if m == 0.0 { 1.0 } else { 1.0 / m })
        .collect();
    let len = alpha.len();
    Ok(Tensor::from_vec(alpha, len, device)?)
}

fn accumulate(mut acc: GradStore, grads: &GradStore, vars: &[Var]) -> crate::Result<GradStore> {
    for var in vars {
        let Some(grad) = grads.get(var.as_tensor()) else {
            continue;
        };
        let sum = match acc.get(var.as_tensor()) {
            Some(prev) => (prev + grad)?,
            None => grad.clone(),
        };
        acc.insert(var.as_tensor(), sum);
    }
    Ok(acc)
}

/// The dense layer behind `name`, without any tuning wrapper
fn unwrap_dense(graph: &LayerGraph, name: &str) -> crate::Result<DenseLayer> {
    match graph.layer(name)? {
        Layer::Dense(dense) => Ok(dense.clone()),
        Layer::FakeQuant(wrapper) => Ok(wrapper.inner().clone()),
        other => Err(WoqError::UnsupportedLayer {
            name: name.to_string(),
            kind: other.kind().to_string(),
        }),
    }
}

fn absorb_into_anchor(graph: &mut LayerGraph, anchor: &str, input_scale: &Tensor) -> crate::Result<()> {
    let absorbed = match graph.layer(anchor)? {
        Layer::Norm(norm) => {
            let mut norm = norm.clone();
            norm.absorb_scale(input_scale)?;
            Layer::Norm(norm)
        }
        Layer::Dense(_) | Layer::FakeQuant(_) => {
            let mut dense = unwrap_dense(graph, anchor)?;
            dense.scale_output_channels(input_scale)?;
            Layer::Dense(dense)
        }
        other => {
            return Err(WoqError::UnsupportedLayer {
                name: anchor.to_string(),
                kind: other.kind().to_string(),
            });
        }
    };
    graph.replace(anchor, absorbed)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LayerConfig, Scheme};
    use crate::layers::{Activation, NormLayer};

    fn block() -> LayerGraph {
        let device = Device::Cpu;
        let w1: Vec<f32> = (0..6 * 4).map(|i| (i as f32 - 11.0) / 8.0).collect();
        let fc1 = DenseLayer::linear(Tensor::from_vec(w1, (6, 4), &device).unwrap(), None).unwrap();
        let w2: Vec<f32> = (0..3 * 6).map(|i| ((i * 5 % 7) as f32 - 3.0) / 4.0).collect();
        let fc2 = DenseLayer::linear(Tensor::from_vec(w2, (3, 6), &device).unwrap(), None).unwrap();
        LayerGraph::new(&device)
            .with_layer(
                "ln",
                NormLayer::layer_norm(
                    Tensor::ones(4, DType::F32, &device).unwrap(),
                    Tensor::zeros(4, DType::F32, &device).unwrap(),
                    1e-5,
                )
                .unwrap(),
            )
            .unwrap()
            .with_layer("fc1", fc1)
            .unwrap()
            .with_layer("act", Activation::Relu)
            .unwrap()
            .with_layer("fc2", fc2)
            .unwrap()
    }

    fn teq() -> TrainableEquivalentTransformation {
        TrainableEquivalentTransformation::new(
            QuantConfig::new(LayerConfig::int(4, Scheme::Sym, 2)),
            vec![AbsorptionGroup::new("ln", ["fc1"])],
        )
    }

    #[test]
    fn test_add_tuning_scale_wraps_every_dense_layer() {
        let mut g = block();
        let mut t = teq();
        t.add_tuning_scale(&mut g, false).unwrap();
        assert_eq!(t.stage(), TeqStage::ScalesAdded);

        let Some(Layer::FakeQuant(fc1)) = g.get("fc1") else {
            panic!("fc1 should be wrapped");
        };
        assert!(fc1.alpha().is_trainable());
        let Some(Layer::FakeQuant(fc2)) = g.get("fc2") else {
            panic!("fc2 should be wrapped");
        };
        assert!(!fc2.alpha().is_trainable());
        assert_eq!(t.scales()["ln"].to_vec1::<f32>().unwrap(), vec![1.0; 4]);
    }

    #[test]
    fn test_sqrt_init() {
        let mut g = block();
        let mut t = teq();
        t.add_tuning_scale(&mut g, true).unwrap();
        let scale = t.scales()["ln"].to_vec1::<f32>().unwrap();
        // column 0 of fc1 holds -11/8 .. 9/8; its largest magnitude is 11/8
        assert!((scale[0] - 1.0 / (11.0f32 / 8.0).sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_zero_column_gets_unit_scale() {
        let device = Device::Cpu;
        let w = Tensor::from_vec(vec![0.0f32, 2.0, 0.0, -4.0], (2, 2), &device).unwrap();
        let member = DenseLayer::linear(w, None).unwrap();
        let alpha = sqrt_init(&[member], &device).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(alpha[0], 1.0);
        assert!((alpha[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_stage_misuse() {
        let mut g = block();
        let mut t = teq();
        assert!(matches!(t.transform(&mut g), Err(WoqError::InvalidState { .. })));
        assert!(matches!(t.quantize(&mut g), Err(WoqError::InvalidState { .. })));
        t.add_tuning_scale(&mut g, false).unwrap();
        assert!(matches!(
            t.add_tuning_scale(&mut g, false),
            Err(WoqError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_missing_layer() {
        let mut g = block();
        let mut t = TrainableEquivalentTransformation::new(
            QuantConfig::default(),
            vec![AbsorptionGroup::new("ln", ["missing"])],
        );
        assert!(matches!(
            t.add_tuning_scale(&mut g, false),
            Err(WoqError::LayerNotFound(_))
        ));
        assert!(matches!(g.get("fc1"), Some(Layer::Dense(_))));
    }

    #[test]
    fn test_activation_anchor_is_skipped() {
        let mut g = block();
        let mut t = TrainableEquivalentTransformation::new(
            QuantConfig::default(),
            vec![AbsorptionGroup::new("act", ["fc2"])],
        );
        t.add_tuning_scale(&mut g, false).unwrap();
        assert!(t.scales().is_empty());
        t.transform(&mut g).unwrap();
        assert!(matches!(g.get("fc2"), Some(Layer::Dense(_))));
    }

    fn two_member_block() -> LayerGraph {
        let device = Device::Cpu;
        let w: Vec<f32> = (0..4 * 4).map(|i| (i as f32 - 7.0) / 4.0).collect();
        let w = Tensor::from_vec(w, (4, 4), &device).unwrap();
        LayerGraph::new(&device)
            .with_layer("ln", NormLayer::new(crate::layers::NormKind::RmsNorm, 4, 1e-6).unwrap())
            .unwrap()
            .with_layer("q", DenseLayer::linear(w.clone(), None).unwrap())
            .unwrap()
            .with_layer("k", DenseLayer::linear(w, None).unwrap())
            .unwrap()
    }

    fn shared_teq() -> TrainableEquivalentTransformation {
        TrainableEquivalentTransformation::new(
            QuantConfig::new(LayerConfig::int(8, Scheme::Sym, -1)),
            vec![AbsorptionGroup::new("ln", ["q", "k"])],
        )
    }

    fn trainable_id(graph: &LayerGraph, name: &str) -> candle_core::TensorId {
        let Some(Layer::FakeQuant(wrapper)) = graph.get(name) else {
            panic!("{} should be wrapped", name);
        };
        let ScaleHandle::Trainable(var) = wrapper.alpha() else {
            panic!("{} should hold a trainable scale", name);
        };
        var.as_tensor().id()
    }

    /// Swap the scale of `name` for `var`, as a move to another device does
    fn rebind(graph: &mut LayerGraph, name: &str, var: &Var) {
        let Some(Layer::FakeQuant(wrapper)) = graph.get(name) else {
            panic!("{} should be wrapped", name);
        };
        let rebound = TeqLinearFakeQuant::new(
            wrapper.inner().clone(),
            ScaleHandle::Trainable(var.clone()),
            wrapper.spec().clone(),
            wrapper.axis(),
        );
        graph.replace(name, Layer::FakeQuant(rebound)).unwrap();
    }

    #[test]
    fn test_move_keeps_group_scale_shared() {
        let mut g = two_member_block();
        let mut t = shared_teq();
        t.add_tuning_scale(&mut g, false).unwrap();
        t.to_device(&mut g, &Device::Cpu).unwrap();

        let q = trainable_id(&g, "q");
        assert_eq!(q, trainable_id(&g, "k"));
        assert_eq!(q, t.trained_alphas["ln"].as_tensor().id());
    }

    #[test]
    fn test_transform_folds_the_scale_the_graph_holds() {
        let mut g = two_member_block();
        let mut t = shared_teq();
        t.add_tuning_scale(&mut g, false).unwrap();
        let original = unwrap_dense(&g, "q").unwrap().logical_weight().unwrap();

        let copy = Var::from_tensor(&Tensor::full(2f32, 4, &Device::Cpu).unwrap()).unwrap();
        rebind(&mut g, "q", &copy);
        rebind(&mut g, "k", &copy);
        t.transform(&mut g).unwrap();

        assert_eq!(t.scales()["ln"].to_vec1::<f32>().unwrap(), vec![2.0; 4]);
        let Some(Layer::Dense(q)) = g.get("q") else {
            panic!("q should be unwrapped");
        };
        let expected = (original * 2.0).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(q.logical_weight().unwrap().to_vec2::<f32>().unwrap(), expected);
    }

    #[test]
    fn test_split_group_scale_is_rejected() {
        let mut g = two_member_block();
        let mut t = shared_teq();
        t.add_tuning_scale(&mut g, false).unwrap();
        let stray = Var::ones(4, DType::F32, &Device::Cpu).unwrap();
        rebind(&mut g, "k", &stray);

        let err = t.transform(&mut g).unwrap_err();
        assert!(matches!(err, WoqError::InvalidState { .. }));
        assert!(matches!(g.get("q"), Some(Layer::FakeQuant(_))));
    }

    #[test]
    fn test_width_mismatch() {
        let mut g = block();
        let mut t = TrainableEquivalentTransformation::new(
            QuantConfig::default(),
            vec![AbsorptionGroup::new("ln", ["fc2"])],
        );
        assert!(matches!(
            t.add_tuning_scale(&mut g, false),
            Err(WoqError::AssertionError(_))
        ));
    }
}
