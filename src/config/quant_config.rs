//! Quantization recipes: per-layer configs and the model-wide mapping.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::WoqError;

/// Weight storage dtype requested for a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantDtype {
    /// Uniform integer grid (`bits` wide)
    #[default]
    Int,
    /// 4-bit NormalFloat codebook
    Nf4,
    /// bitsandbytes FP4 codebook (`fp4` is an alias)
    #[serde(alias = "fp4")]
    Fp4E2m1Bnb,
    /// Plain E2M1 FP4 codebook
    Fp4E2m1,
    Fp8E5m2,
    Fp8E5m2fnuz,
    Fp8E4m3fn,
    Fp8E4m3fnuz,
    /// Leave the layer in full precision
    Fp32,
}

impl QuantDtype {
    /// Parse a dtype name, returning the bit width embedded in `intN` names.
    pub fn parse_with_bits(name: &str) -> crate::Result<(Self, Option<u8>)> {
        let name = name.trim().to_lowercase();
        if let Some(width) = name.strip_prefix("int") {
            if width.is_empty() {
                return Ok((QuantDtype::Int, None));
            }
            let bits = width.parse::<u8>().map_err(|_| {
                WoqError::ConfigError(format!("Invalid integer dtype '{}'", name))
            })?;
            return Ok((QuantDtype::Int, Some(bits)));
        }

        let dtype = match name.as_str() {
            "nf4" => QuantDtype::Nf4,
            "fp4" | "fp4_e2m1_bnb" => QuantDtype::Fp4E2m1Bnb,
            "fp4_e2m1" => QuantDtype::Fp4E2m1,
            "fp8_e5m2" => QuantDtype::Fp8E5m2,
            "fp8_e5m2fnuz" => QuantDtype::Fp8E5m2fnuz,
            "fp8_e4m3fn" => QuantDtype::Fp8E4m3fn,
            "fp8_e4m3fnuz" => QuantDtype::Fp8E4m3fnuz,
            "fp32" => QuantDtype::Fp32,
            other => {
                return Err(WoqError::ConfigError(format!("Unknown dtype '{}'", other)));
            }
        };
        Ok((dtype, None))
    }

    /// Canonical name used in configs and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            QuantDtype::Int => "int",
            QuantDtype::Nf4 => "nf4",
            QuantDtype::Fp4E2m1Bnb => "fp4_e2m1_bnb",
            QuantDtype::Fp4E2m1 => "fp4_e2m1",
            QuantDtype::Fp8E5m2 => "fp8_e5m2",
            QuantDtype::Fp8E5m2fnuz => "fp8_e5m2fnuz",
            QuantDtype::Fp8E4m3fn => "fp8_e4m3fn",
            QuantDtype::Fp8E4m3fnuz => "fp8_e4m3fnuz",
            QuantDtype::Fp32 => "fp32",
        }
    }

    pub fn is_codebook(&self) -> bool {
        matches!(self, QuantDtype::Nf4 | QuantDtype::Fp4E2m1Bnb | QuantDtype::Fp4E2m1)
    }
}

impl FromStr for QuantDtype {
    type Err = WoqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with_bits(s).map(|(dtype, _)| dtype)
    }
}

impl std::fmt::Display for QuantDtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Symmetric (zero-point fixed at 0) or asymmetric quantization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Sym,
    Asym,
}

/// Axis of the logical `[out, in]` weight that groups run along
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupAxis {
    /// `group_dim = 0`: groups split the output channels
    Output,
    /// `group_dim = 1`: groups split the input channels
    Input,
}

impl GroupAxis {
    pub fn from_dim(group_dim: u8) -> crate::Result<Self> {
        match group_dim {
            0 => Ok(GroupAxis::Output),
            1 => Ok(GroupAxis::Input),
            other => Err(WoqError::AssertionError(format!(
                "group_dim must be 0 or 1, got {}",
                other
            ))),
        }
    }

    pub fn dim(&self) -> u8 {
        match self {
            GroupAxis::Output => 0,
            GroupAxis::Input => 1,
        }
    }
}

/// Granularity at which the MSE clip search picks a quantile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MseGranularity {
    /// One quantile for the whole layer
    #[default]
    Layer,
    /// One quantile per weight group
    Group,
}

/// How a packed layer reconstructs its dense weight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DequantMode {
    /// Dequantize on every forward call
    #[default]
    OnTheFly,
    /// Dequantize once when the layer is built and keep the dense copy
    AheadOfTime,
}

/// Secondary quantization applied to the scale tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoubleQuantConfig {
    #[serde(default)]
    pub dtype: QuantDtype,

    #[serde(default = "default_double_quant_bits")]
    pub bits: u8,

    #[serde(default)]
    pub scheme: Scheme,

    #[serde(default = "default_double_quant_group_size")]
    pub group_size: i32,
}

fn default_double_quant_bits() -> u8 {
    8
}

fn default_double_quant_group_size() -> i32 {
    256
}

impl Default for DoubleQuantConfig {
    fn default() -> Self {
        Self {
            dtype: QuantDtype::Int,
            bits: default_double_quant_bits(),
            scheme: Scheme::Sym,
            group_size: default_double_quant_group_size(),
        }
    }
}

/// Per-layer quantization recipe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    #[serde(default)]
    pub dtype: QuantDtype,

    #[serde(default = "default_bits")]
    pub bits: u8,

    /// Elements per group, `-1` for the whole row
    #[serde(default = "default_group_size")]
    pub group_size: i32,

    /// 0 splits output channels, 1 splits input channels
    #[serde(default = "default_group_dim")]
    pub group_dim: u8,

    #[serde(default)]
    pub scheme: Scheme,

    /// Clip factor applied to the group range
    #[serde(default = "default_quantile")]
    pub quantile: f32,

    #[serde(default)]
    pub use_full_range: bool,

    #[serde(default)]
    pub use_mse_search: bool,

    #[serde(default)]
    pub mse_granularity: MseGranularity,

    #[serde(default)]
    pub double_quant: Option<DoubleQuantConfig>,
}

fn default_bits() -> u8 {
    4
}

fn default_group_size() -> i32 {
    32
}

fn default_group_dim() -> u8 {
    1
}

fn default_quantile() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            dtype: QuantDtype::Int,
            bits: default_bits(),
            group_size: default_group_size(),
            group_dim: default_group_dim(),
            scheme: Scheme::Sym,
            quantile: default_quantile(),
            use_full_range: false,
            use_mse_search: false,
            mse_granularity: MseGranularity::Layer,
            double_quant: None,
        }
    }
}

impl LayerConfig {
    /// Integer config with the given width, scheme and group size
    pub fn int(bits: u8, scheme: Scheme, group_size: i32) -> Self {
        Self {
            bits,
            scheme,
            group_size,
            ..Default::default()
        }
    }

    /// Config for a non-integer dtype
    pub fn with_dtype(dtype: QuantDtype) -> Self {
        Self {
            dtype,
            ..Default::default()
        }
    }

    pub fn group_axis(&self) -> crate::Result<GroupAxis> {
        GroupAxis::from_dim(self.group_dim)
    }

    /// Reject recipes the solver cannot honor.
    pub fn validate(&self) -> crate::Result<()> {
        if self.dtype == QuantDtype::Int {
            check_int_width(self.bits, self.scheme, "bits")?;
        }
        check_group_size(self.group_size, "group_size")?;
        self.group_axis()?;
        if !(self.quantile > 0.0 && self.quantile <= 1.0) {
            return Err(WoqError::AssertionError(format!(
                "quantile must lie in (0, 1], got {}",
                self.quantile
            )));
        }
        if let Some(dq) = &self.double_quant {
            if dq.dtype != QuantDtype::Int {
                return Err(WoqError::AssertionError(format!(
                    "double quantization only supports int scales, got {}",
                    dq.dtype
                )));
            }
            check_int_width(dq.bits, dq.scheme, "double_quant.bits")?;
            check_group_size(dq.group_size, "double_quant.group_size")?;
        }
        Ok(())
    }
}

fn check_int_width(bits: u8, scheme: Scheme, field: &str) -> crate::Result<()> {
    if !(1..=8).contains(&bits) {
        return Err(WoqError::AssertionError(format!(
            "{} must lie in 1..=8, got {}",
            field, bits
        )));
    }
    if scheme == Scheme::Sym && bits < 2 {
        return Err(WoqError::AssertionError(format!(
            "symmetric integer quantization needs at least 2 bits ({})",
            field
        )));
    }
    Ok(())
}

fn check_group_size(group_size: i32, field: &str) -> crate::Result<()> {
    if group_size == 0 || group_size < -1 {
        return Err(WoqError::AssertionError(format!(
            "{} must be -1 or positive, got {}",
            field, group_size
        )));
    }
    Ok(())
}

/// Partial per-layer recipe; absent keys fall back to the global config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerOverride {
    /// Dtype name; `intN` also sets `bits`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bits: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_size: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_dim: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<Scheme>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantile: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_full_range: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_mse_search: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mse_granularity: Option<MseGranularity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_double_quant: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub double_quant: Option<DoubleQuantConfig>,
}

impl LayerOverride {
    /// Override only the dtype (accepts `intN` names)
    pub fn dtype(name: impl Into<String>) -> Self {
        Self {
            dtype: Some(name.into()),
            ..Default::default()
        }
    }

    /// Merge this override on top of `base`.
    pub fn apply(&self, base: &LayerConfig) -> crate::Result<LayerConfig> {
        let mut cfg = base.clone();

        if let Some(name) = &self.dtype {
            let (dtype, bits) = QuantDtype::parse_with_bits(name)?;
            cfg.dtype = dtype;
            if let Some(bits) = bits {
                cfg.bits = bits;
            }
        }
        if let Some(bits) = self.bits {
            cfg.bits = bits;
        }
        if let Some(group_size) = self.group_size {
            cfg.group_size = group_size;
        }
        if let Some(group_dim) = self.group_dim {
            cfg.group_dim = group_dim;
        }
        if let Some(scheme) = self.scheme {
            cfg.scheme = scheme;
        }
        if let Some(quantile) = self.quantile {
            cfg.quantile = quantile;
        }
        if let Some(full_range) = self.use_full_range {
            cfg.use_full_range = full_range;
        }
        if let Some(mse) = self.use_mse_search {
            cfg.use_mse_search = mse;
        }
        if let Some(granularity) = self.mse_granularity {
            cfg.mse_granularity = granularity;
        }
        match (self.use_double_quant, &self.double_quant) {
            (Some(false), _) => cfg.double_quant = None,
            (_, Some(dq)) => cfg.double_quant = Some(dq.clone()),
            (Some(true), None) => {
                if cfg.double_quant.is_none() {
                    cfg.double_quant = Some(DoubleQuantConfig::default());
                }
            }
            (None, None) => {}
        }

        Ok(cfg)
    }
}

/// Model-wide quantization mapping, immutable while a rewrite runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantConfig {
    /// Recipe for layers without an explicit entry; `None` leaves them alone
    #[serde(default)]
    pub global: Option<LayerConfig>,

    /// Per-layer overrides keyed by qualified layer name
    #[serde(default)]
    pub layers: BTreeMap<String, LayerOverride>,

    /// Install packed layers (`true`) or rewrite dense weights in place
    #[serde(default = "default_true")]
    pub export_compressed_model: bool,

    #[serde(default)]
    pub dequant_mode: DequantMode,
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            global: Some(LayerConfig::default()),
            layers: BTreeMap::new(),
            export_compressed_model: true,
            dequant_mode: DequantMode::OnTheFly,
        }
    }
}

impl QuantConfig {
    /// Apply `global` to every eligible layer
    pub fn new(global: LayerConfig) -> Self {
        Self {
            global: Some(global),
            ..Default::default()
        }
    }

    /// Only layers listed explicitly are quantized
    pub fn explicit() -> Self {
        Self {
            global: None,
            ..Default::default()
        }
    }

    pub fn with_layer(mut self, name: impl Into<String>, layer: LayerOverride) -> Self {
        self.layers.insert(name.into(), layer);
        self
    }

    pub fn with_export_compressed(mut self, export: bool) -> Self {
        self.export_compressed_model = export;
        self
    }

    pub fn with_dequant_mode(mut self, mode: DequantMode) -> Self {
        self.dequant_mode = mode;
        self
    }

    /// Whether the mapping knows anything about `name`
    pub fn covers(&self, name: &str) -> bool {
        self.layers.contains_key(name) || self.global.is_some()
    }

    /// Resolve the recipe for a layer, `None` when the mapping has no entry.
    pub fn resolve(&self, name: &str) -> crate::Result<Option<LayerConfig>> {
        let resolved = match (self.layers.get(name), &self.global) {
            (Some(layer), global) => {
                let base = global.clone().unwrap_or_default();
                Some(layer.apply(&base)?)
            }
            (None, Some(global)) => Some(global.clone()),
            (None, None) => None,
        };

        if let Some(cfg) = &resolved {
            cfg.validate()?;
        }
        Ok(resolved)
    }

    /// Named double-quantization presets
    pub fn double_quant_preset(name: &str) -> crate::Result<Self> {
        let layer = match name.to_uppercase().as_str() {
            "BNB_NF4" => LayerConfig {
                dtype: QuantDtype::Nf4,
                bits: 4,
                scheme: Scheme::Sym,
                group_size: 32,
                double_quant: Some(DoubleQuantConfig {
                    dtype: QuantDtype::Int,
                    bits: 8,
                    scheme: Scheme::Asym,
                    group_size: 256,
                }),
                ..Default::default()
            },
            "GGML_TYPE_Q4_K" => LayerConfig {
                dtype: QuantDtype::Int,
                bits: 4,
                scheme: Scheme::Asym,
                group_size: 32,
                double_quant: Some(DoubleQuantConfig {
                    dtype: QuantDtype::Int,
                    bits: 6,
                    scheme: Scheme::Sym,
                    group_size: 8,
                }),
                ..Default::default()
            },
            other => {
                return Err(WoqError::ConfigError(format!(
                    "Unknown double quant preset '{}'",
                    other
                )));
            }
        };
        Ok(Self::new(layer))
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: QuantConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Write configuration as pretty JSON
    pub fn to_file(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
