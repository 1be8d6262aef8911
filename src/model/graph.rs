//! Ordered, uniquely named layer graph.

use candle_core::{Device, Tensor};
use tracing::debug;

use crate::WoqError;
use crate::layers::{Layer, MovedScales};

/// One graph entry
#[derive(Debug, Clone)]
pub struct NamedLayer {
    pub name: String,
    pub layer: Layer,
}

/// Sequential model: each layer feeds the next. Layers are addressed by
/// their qualified name; the empty name denotes the model root.
#[derive(Debug, Clone)]
pub struct LayerGraph {
    layers: Vec<NamedLayer>,
    device: Device,
}

impl LayerGraph {
    pub fn new(device: &Device) -> Self {
        Self {
            layers: Vec::new(),
            device: device.clone(),
        }
    }

    /// Append a layer; names must be unique
    pub fn push(&mut self, name: impl Into<String>, layer: impl Into<Layer>) -> crate::Result<()> {
        let name = name.into();
        if self.contains(&name) {
            return Err(WoqError::AssertionError(format!(
                "layer '{}' is already in the graph",
                name
            )));
        }
        self.layers.push(NamedLayer {
            name,
            layer: layer.into(),
        });
        Ok(())
    }

    /// Builder form of [`push`](Self::push)
    pub fn with_layer(mut self, name: impl Into<String>, layer: impl Into<Layer>) -> crate::Result<Self> {
        self.push(name, layer)?;
        Ok(self)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.layers.iter().any(|l| l.name == name)
    }

    /// Layer names in evaluation order
    pub fn names(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Layer)> {
        self.layers.iter().map(|l| (l.name.as_str(), &l.layer))
    }

    pub fn get(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name == name).map(|l| &l.layer)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Layer> {
        self.layers
            .iter_mut()
            .find(|l| l.name == name)
            .map(|l| &mut l.layer)
    }

    /// Like [`get`](Self::get) but missing layers are an error
    pub fn layer(&self, name: &str) -> crate::Result<&Layer> {
        self.get(name)
            .ok_or_else(|| WoqError::LayerNotFound(name.to_string()))
    }

    /// Swap in a new layer under `name`, returning the old one. This is the
    /// only place where layer ownership changes hands.
    pub fn replace(&mut self, name: &str, layer: Layer) -> crate::Result<Layer> {
        let slot = self
            .get_mut(name)
            .ok_or_else(|| WoqError::LayerNotFound(name.to_string()))?;
        debug!("Replacing layer '{}' ({} -> {})", name, slot.kind(), layer.kind());
        Ok(std::mem::replace(slot, layer))
    }

    /// Run every layer in order
    pub fn forward(&self, x: &Tensor) -> crate::Result<Tensor> {
        let mut hidden = x.clone();
        for entry in &self.layers {
            hidden = entry.layer.forward(&hidden)?;
        }
        Ok(hidden)
    }

    /// Run a single layer
    pub fn forward_layer(&self, name: &str, x: &Tensor) -> crate::Result<Tensor> {
        self.layer(name)?.forward(x)
    }

    /// Move every layer to `device`. Wrappers sharing a trainable scale
    /// share the moved copy.
    pub fn to_device(&mut self, device: &Device) -> crate::Result<()> {
        if self.device.same_device(device) {
            return Ok(());
        }
        let mut moved = MovedScales::new();
        for entry in &mut self.layers {
            entry.layer = entry.layer.to_device_with(device, &mut moved)?;
        }
        self.device = device.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Activation, DenseLayer};
    use candle_core::DType;

    fn graph() -> LayerGraph {
        let w = Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap();
        LayerGraph::new(&Device::Cpu)
            .with_layer("fc1", DenseLayer::linear(w.clone(), None).unwrap())
            .unwrap()
            .with_layer("act", Activation::Relu)
            .unwrap()
            .with_layer("fc2", DenseLayer::linear(w, None).unwrap())
            .unwrap()
    }

    #[test]
    fn test_sequential_forward() {
        let graph = graph();
        let x = Tensor::new(&[[1f32, -3.0]], &Device::Cpu).unwrap();
        // fc1 -> [-2, -2], relu -> 0
        assert_eq!(graph.forward(&x).unwrap().to_vec2::<f32>().unwrap(), vec![vec![0.0, 0.0]]);
        assert_eq!(
            graph.forward_layer("fc1", &x).unwrap().to_vec2::<f32>().unwrap(),
            vec![vec![-2.0, -2.0]]
        );
    }

    #[test]
    fn test_names_and_replace() {
        let mut graph = graph();
        assert_eq!(graph.names(), vec!["fc1", "act", "fc2"]);
        assert!(graph.push("act", Activation::Gelu).is_err());

        let old = graph.replace("act", Layer::Activation(Activation::Silu)).unwrap();
        assert!(matches!(old, Layer::Activation(Activation::Relu)));
        assert!(matches!(graph.replace("missing", old), Err(WoqError::LayerNotFound(_))));
    }
}
