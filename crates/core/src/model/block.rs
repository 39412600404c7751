use candle_core::{Module, Tensor};
use candle_nn::{Dropout, VarBuilder};

use super::attention::BlockAttention;
use crate::config::ModelConfig;
use crate::kv_cache::{AttentionCacheManager, CacheError};
use crate::layers::{RmsNorm, RotaryEmbedding, SwiGluMlp};

/// One decoder block: `x + attn(norm(x))`, then `x + mlp(norm(x))`.
/// The MLP branch drops out after its projection; attention drops out inside.
pub(crate) struct TransformerBlock {
    pub(crate) attention: BlockAttention,
    pub(crate) mlp_norm: RmsNorm,
    pub(crate) mlp: SwiGluMlp,
    dropout: Dropout,
}

impl TransformerBlock {
    pub(crate) fn new(cfg: &ModelConfig, dropout: f32, vb: VarBuilder) -> candle_core::Result<Self> {
        let vb_mlp = vb.pp("mlp");
        Ok(Self {
            attention: BlockAttention::new(cfg, dropout, vb.pp("attention"))?,
            mlp_norm: RmsNorm::load(cfg.hidden_size, cfg.rms_norm_eps, vb_mlp.pp("norm"))?,
            mlp: SwiGluMlp::new(cfg.hidden_size, cfg.intermediate_size, vb_mlp)?,
            dropout: Dropout::new(dropout),
        })
    }

    pub(crate) fn forward(
        &self,
        xs: &Tensor,
        micro_batch: usize,
        use_cache: bool,
        cache: &mut AttentionCacheManager,
        rotary: &RotaryEmbedding,
        train: bool,
    ) -> Result<Tensor, CacheError> {
        let attn = self
            .attention
            .forward(xs, micro_batch, use_cache, cache, rotary, train)?;
        let xs = (xs + attn)?;

        let ff = self.mlp_norm.forward(&xs)?.apply(&self.mlp)?;
        Ok((&xs + self.dropout.forward(&ff, train)?)?)
    }
}
