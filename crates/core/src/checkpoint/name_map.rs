//! Weight-key translation between the checkpoint conventions.
//!
//! The mapping is a static table: every canonical weight role lists its key
//! template in each convention, how it is split across tensor-parallel files
//! of a reference checkpoint, and whether a convention stores it fused with
//! sibling roles. [`to_canonical`] and [`from_canonical`] only consult this
//! table.
//!
//! Templates use `{i}` for the layer index.

use std::fmt;

use candle_core::Tensor;

use super::convention::Convention;
use super::error::FormatError;
use crate::config::ModelConfig;

/// What a weight is, independent of any naming convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WeightRole {
    Embedding,
    AttentionNorm,
    Query,
    Key,
    Value,
    AttentionOut,
    MlpNorm,
    Gate,
    Down,
    Up,
    FinalNorm,
    Output,
}

/// Whether a weight exists once per model or once per layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Layer,
}

/// How a reference checkpoint spreads a weight over tensor-parallel files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpAxis {
    /// Every file holds the full tensor; the first copy wins.
    Replicated,
    /// Slices concatenate along this dimension in file order.
    Concat(usize),
}

/// Group of roles that the native convention stores as one tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FusionGroup {
    /// Query, key and value stacked along the output axis, in that order.
    Qkv,
}

impl FusionGroup {
    pub fn members(self) -> &'static [WeightRole] {
        match self {
            Self::Qkv => &[WeightRole::Query, WeightRole::Key, WeightRole::Value],
        }
    }

    fn native_template(self) -> &'static str {
        match self {
            Self::Qkv => "blocks.{i}.attention.wqkv.module.module.weight",
        }
    }
}

/// One row of the mapping table.
#[derive(Debug, Clone, Copy)]
pub struct WeightSpec {
    pub role: WeightRole,
    pub scope: Scope,
    pub community: &'static str,
    pub reference: &'static str,
    /// `None` when the native convention stores the role inside a fused tensor.
    pub native: Option<&'static str>,
    pub fusion: Option<FusionGroup>,
    pub tp_axis: TpAxis,
    /// Reference stores rotary pairs of this projection interleaved.
    pub rotary_interleaved: bool,
}

impl WeightSpec {
    pub fn template(&self, convention: Convention) -> Option<&'static str> {
        match convention {
            Convention::Community => Some(self.community),
            Convention::Reference => Some(self.reference),
            Convention::Native => self.native,
        }
    }
}

const fn layer(
    role: WeightRole,
    community: &'static str,
    reference: &'static str,
    native: Option<&'static str>,
    tp_axis: TpAxis,
) -> WeightSpec {
    WeightSpec {
        role,
        scope: Scope::Layer,
        community,
        reference,
        native,
        fusion: None,
        tp_axis,
        rotary_interleaved: false,
    }
}

const fn qkv(
    role: WeightRole,
    community: &'static str,
    reference: &'static str,
    rotary_interleaved: bool,
) -> WeightSpec {
    WeightSpec {
        role,
        scope: Scope::Layer,
        community,
        reference,
        native: None,
        fusion: Some(FusionGroup::Qkv),
        tp_axis: TpAxis::Concat(0),
        rotary_interleaved,
    }
}

const fn global(
    role: WeightRole,
    community: &'static str,
    reference: &'static str,
    native: &'static str,
    tp_axis: TpAxis,
) -> WeightSpec {
    WeightSpec {
        role,
        scope: Scope::Global,
        community,
        reference,
        native: Some(native),
        fusion: None,
        tp_axis,
        rotary_interleaved: false,
    }
}

pub static WEIGHT_SPECS: &[WeightSpec] = &[
    global(
        WeightRole::Embedding,
        "model.embed_tokens.weight",
        "tok_embeddings.weight",
        "token_embedding.module.weight",
        TpAxis::Concat(1),
    ),
    layer(
        WeightRole::AttentionNorm,
        "model.layers.{i}.input_layernorm.weight",
        "layers.{i}.attention_norm.weight",
        Some("blocks.{i}.attention.norm.weight"),
        TpAxis::Replicated,
    ),
    qkv(
        WeightRole::Query,
        "model.layers.{i}.self_attn.q_proj.weight",
        "layers.{i}.attention.wq.weight",
        true,
    ),
    qkv(
        WeightRole::Key,
        "model.layers.{i}.self_attn.k_proj.weight",
        "layers.{i}.attention.wk.weight",
        true,
    ),
    qkv(
        WeightRole::Value,
        "model.layers.{i}.self_attn.v_proj.weight",
        "layers.{i}.attention.wv.weight",
        false,
    ),
    layer(
        WeightRole::AttentionOut,
        "model.layers.{i}.self_attn.o_proj.weight",
        "layers.{i}.attention.wo.weight",
        Some("blocks.{i}.attention.wo.module.module.weight"),
        TpAxis::Concat(1),
    ),
    layer(
        WeightRole::MlpNorm,
        "model.layers.{i}.post_attention_layernorm.weight",
        "layers.{i}.ffn_norm.weight",
        Some("blocks.{i}.mlp.norm.weight"),
        TpAxis::Replicated,
    ),
    layer(
        WeightRole::Gate,
        "model.layers.{i}.mlp.gate_proj.weight",
        "layers.{i}.feed_forward.w1.weight",
        Some("blocks.{i}.mlp.w1.module.module.weight"),
        TpAxis::Concat(0),
    ),
    layer(
        WeightRole::Down,
        "model.layers.{i}.mlp.down_proj.weight",
        "layers.{i}.feed_forward.w2.weight",
        Some("blocks.{i}.mlp.w2.module.module.weight"),
        TpAxis::Concat(1),
    ),
    layer(
        WeightRole::Up,
        "model.layers.{i}.mlp.up_proj.weight",
        "layers.{i}.feed_forward.w3.weight",
        Some("blocks.{i}.mlp.w3.module.module.weight"),
        TpAxis::Concat(0),
    ),
    global(
        WeightRole::FinalNorm,
        "model.norm.weight",
        "norm.weight",
        "norm.weight",
        TpAxis::Replicated,
    ),
    global(
        WeightRole::Output,
        "lm_head.weight",
        "output.weight",
        "language_model_head.module.module.weight",
        TpAxis::Concat(0),
    ),
];

/// Community checkpoints carry the rotary inverse frequencies per layer.
/// They are derived from the config, so they are dropped on read and
/// regenerated on write.
const COMMUNITY_INV_FREQ: &str = "model.layers.{i}.self_attn.rotary_emb.inv_freq";

/// Convention-independent identity of one weight. `layer` is a global index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CanonicalKey {
    pub role: WeightRole,
    pub layer: Option<usize>,
}

impl CanonicalKey {
    pub fn global(role: WeightRole) -> Self {
        Self { role, layer: None }
    }

    pub fn layer(role: WeightRole, layer: usize) -> Self {
        Self {
            role,
            layer: Some(layer),
        }
    }

    pub fn spec(&self) -> &'static WeightSpec {
        spec(self.role)
    }

    /// Same role, layer index shifted through `f`.
    pub fn map_layer(self, f: impl FnOnce(usize) -> usize) -> Self {
        Self {
            role: self.role,
            layer: self.layer.map(f),
        }
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.layer {
            Some(layer) => write!(f, "{:?}@{layer}", self.role),
            None => write!(f, "{:?}", self.role),
        }
    }
}

/// Result of resolving one convention-specific key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalName {
    Single(CanonicalKey),
    Fused { group: FusionGroup, layer: usize },
    /// Recognized but recomputable from the config; not carried.
    Derived { layer: usize },
}

pub fn spec(role: WeightRole) -> &'static WeightSpec {
    WEIGHT_SPECS
        .iter()
        .find(|s| s.role == role)
        .unwrap_or_else(|| unreachable!("every role has a table row"))
}

/// Roles present once per model.
pub fn global_roles() -> impl Iterator<Item = WeightRole> {
    WEIGHT_SPECS
        .iter()
        .filter(|s| s.scope == Scope::Global)
        .map(|s| s.role)
}

/// Roles present once per layer.
pub fn layer_roles() -> impl Iterator<Item = WeightRole> {
    WEIGHT_SPECS
        .iter()
        .filter(|s| s.scope == Scope::Layer)
        .map(|s| s.role)
}

/// Every canonical key a complete model with `num_layers` layers carries.
pub fn all_keys(num_layers: usize) -> Vec<CanonicalKey> {
    let mut keys: Vec<CanonicalKey> = global_roles().map(CanonicalKey::global).collect();
    for layer in 0..num_layers {
        keys.extend(layer_roles().map(|role| CanonicalKey::layer(role, layer)));
    }
    keys.sort();
    keys
}

fn match_template(template: &str, key: &str) -> Option<Option<usize>> {
    match template.split_once("{i}") {
        None => (template == key).then_some(None),
        Some((prefix, suffix)) => {
            let index = key.strip_prefix(prefix)?.strip_suffix(suffix)?;
            if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            index.parse().ok().map(Some)
        }
    }
}

fn render(template: &str, layer: Option<usize>) -> String {
    match layer {
        Some(i) => template.replace("{i}", &i.to_string()),
        None => template.to_string(),
    }
}

/// Resolve a key of `convention` to its canonical name.
pub fn to_canonical(key: &str, convention: Convention) -> Result<CanonicalName, FormatError> {
    for spec in WEIGHT_SPECS {
        let Some(template) = spec.template(convention) else {
            continue;
        };
        if let Some(layer) = match_template(template, key) {
            return Ok(CanonicalName::Single(CanonicalKey {
                role: spec.role,
                layer,
            }));
        }
    }

    if convention == Convention::Native {
        let group = FusionGroup::Qkv;
        if let Some(Some(layer)) = match_template(group.native_template(), key) {
            return Ok(CanonicalName::Fused { group, layer });
        }
    }

    if convention == Convention::Community {
        if let Some(Some(layer)) = match_template(COMMUNITY_INV_FREQ, key) {
            return Ok(CanonicalName::Derived { layer });
        }
    }

    Err(FormatError::UnrecognizedKey {
        key: key.to_string(),
        convention,
    })
}

/// Key of `name` in `convention`, or `None` when that convention does not
/// store the name as its own tensor (a fused member in native, a fused group
/// elsewhere, a derived tensor outside community).
pub fn from_canonical(name: &CanonicalName, convention: Convention) -> Option<String> {
    match name {
        CanonicalName::Single(key) => key
            .spec()
            .template(convention)
            .map(|template| render(template, key.layer)),
        CanonicalName::Fused { group, layer } => (convention == Convention::Native)
            .then(|| render(group.native_template(), Some(*layer))),
        CanonicalName::Derived { layer } => (convention == Convention::Community)
            .then(|| render(COMMUNITY_INV_FREQ, Some(*layer))),
    }
}

/// Key that physically holds `key` in `convention`: the fused tensor's key
/// when the role is stored fused.
pub fn storage_key(key: &CanonicalKey, convention: Convention) -> String {
    let spec = key.spec();
    match (spec.template(convention), spec.fusion, key.layer) {
        (Some(template), _, layer) => render(template, layer),
        (None, Some(group), Some(layer)) => render(group.native_template(), Some(layer)),
        _ => unreachable!("roles without a template are fused per layer"),
    }
}

/// Expected tensor shape of `role` for a model shaped like `config`.
pub fn expected_shape(role: WeightRole, config: &ModelConfig) -> Vec<usize> {
    let h = config.hidden_size;
    match role {
        WeightRole::Embedding | WeightRole::Output => vec![config.vocab_size, h],
        WeightRole::AttentionNorm | WeightRole::MlpNorm | WeightRole::FinalNorm => vec![h],
        WeightRole::Query | WeightRole::Key | WeightRole::Value | WeightRole::AttentionOut => {
            vec![h, h]
        }
        WeightRole::Gate | WeightRole::Up => vec![config.intermediate_size, h],
        WeightRole::Down => vec![h, config.intermediate_size],
    }
}

/// Split a fused tensor into its member tensors along the output axis.
pub fn split_fused(
    group: FusionGroup,
    key: &str,
    fused: &Tensor,
) -> Result<Vec<Tensor>, super::CheckpointError> {
    let parts = group.members().len();
    let dims = fused.dims();
    if dims.is_empty() || dims[0] % parts != 0 {
        let mut expected = dims.to_vec();
        if let Some(rows) = expected.first_mut() {
            *rows = (*rows / parts + 1) * parts;
        }
        return Err(FormatError::ShapeMismatch {
            key: key.to_string(),
            expected,
            actual: dims.to_vec(),
        }
        .into());
    }
    let rows = dims[0] / parts;
    (0..parts)
        .map(|p| Ok(fused.narrow(0, p * rows, rows)?.contiguous()?))
        .collect()
}

/// Concatenate member tensors into the fused layout.
pub fn fuse(members: &[Tensor]) -> candle_core::Result<Tensor> {
    Tensor::cat(members, 0)
}

/// Convert a half-split projection into the reference interleaved layout:
/// `(heads, 2, hd/2, in)` -> `(heads, hd/2, 2, in)`.
pub fn interleave_rotary(weight: &Tensor, num_heads: usize) -> candle_core::Result<Tensor> {
    permute_pairs(weight, num_heads, true)
}

/// Inverse of [`interleave_rotary`].
pub fn deinterleave_rotary(weight: &Tensor, num_heads: usize) -> candle_core::Result<Tensor> {
    permute_pairs(weight, num_heads, false)
}

fn permute_pairs(weight: &Tensor, num_heads: usize, to_interleaved: bool) -> candle_core::Result<Tensor> {
    let (out_dim, in_dim) = weight.dims2()?;
    let half = out_dim / num_heads / 2;
    let grouped = if to_interleaved {
        weight.reshape((num_heads, 2, half, in_dim))?
    } else {
        weight.reshape((num_heads, half, 2, in_dim))?
    };
    grouped
        .transpose(1, 2)?
        .contiguous()?
        .reshape((out_dim, in_dim))
}

/// Rotary inverse frequencies stored by community checkpoints, shape `(hd/2,)`.
pub fn rotary_inv_freq(config: &ModelConfig, device: &candle_core::Device) -> candle_core::Result<Tensor> {
    crate::layers::rotary::inv_freq(config.head_dim(), config.rope_theta, device)
}
