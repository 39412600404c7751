use candle_core::{Module, Tensor};
use candle_nn::{linear_no_bias, Dropout, Linear, VarBuilder};

use crate::config::ModelConfig;
use crate::kv_cache::{AttentionCacheManager, CacheError};
use crate::layers::{causal_attention, wrapped, RmsNorm, RotaryEmbedding};

/// Pre-normed self-attention sublayer with fused q/k/v projection.
pub(crate) struct BlockAttention {
    norm: RmsNorm,
    wqkv: Linear,
    wo: Linear,
    dropout: Dropout,
    num_heads: usize,
    head_dim: usize,
}

impl BlockAttention {
    pub(crate) fn new(cfg: &ModelConfig, dropout: f32, vb: VarBuilder) -> candle_core::Result<Self> {
        let h = cfg.hidden_size;
        Ok(Self {
            norm: RmsNorm::load(h, cfg.rms_norm_eps, vb.pp("norm"))?,
            wqkv: linear_no_bias(h, 3 * h, wrapped(&vb, "wqkv"))?,
            wo: linear_no_bias(h, h, wrapped(&vb, "wo"))?,
            dropout: Dropout::new(dropout),
            num_heads: cfg.num_attention_heads,
            head_dim: cfg.head_dim(),
        })
    }

    /// `xs` is `[batch, seq, hidden]`; returns the sublayer output without
    /// the residual. Dropout hits the attention output ahead of `wo`.
    pub(crate) fn forward(
        &self,
        xs: &Tensor,
        micro_batch: usize,
        use_cache: bool,
        cache: &mut AttentionCacheManager,
        rotary: &RotaryEmbedding,
        train: bool,
    ) -> Result<Tensor, CacheError> {
        let (b_sz, seq_len, hidden) = xs.dims3()?;
        let qkv = self.norm.forward(xs)?.apply(&self.wqkv)?;
        let split = |i: usize| -> candle_core::Result<Tensor> {
            qkv.narrow(2, i * hidden, hidden)?
                .reshape((b_sz, seq_len, self.num_heads, self.head_dim))
        };
        let (q, k, v) = (split(0)?, split(1)?, split(2)?);

        let step = cache.advance(micro_batch, &q, &k, &v, use_cache, rotary)?;
        let attn = causal_attention(&step.query, &step.key, &step.value)?;
        let attn = self.dropout.forward(&step.trim(&attn)?, train)?;
        Ok(attn.apply(&self.wo)?)
    }

    pub(crate) fn norm_weight(&self) -> &Tensor {
        self.norm.weight()
    }

    pub(crate) fn wqkv_weight(&self) -> &Tensor {
        self.wqkv.weight()
    }

    pub(crate) fn wo_weight(&self) -> &Tensor {
        self.wo.weight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use candle_core::{DType, Device};

    use crate::testing::tiny_config;

    #[test]
    fn dropout_applies_before_output_projection() {
        let device = Device::Cpu;
        let cfg = tiny_config(1);
        let h = cfg.hidden_size;
        let tensors = HashMap::from([
            ("norm.weight".to_string(), Tensor::ones(h, DType::F32, &device).unwrap()),
            (
                "wqkv.module.module.weight".to_string(),
                Tensor::randn(0f32, 0.5, (3 * h, h), &device).unwrap(),
            ),
            // All-ones rows sum the attention output, so any mask applied
            // before the projection still leaves each row's entries equal.
            (
                "wo.module.module.weight".to_string(),
                Tensor::ones((h, h), DType::F32, &device).unwrap(),
            ),
        ]);
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        let attention = BlockAttention::new(&cfg, 0.5, vb).unwrap();
        let rotary = RotaryEmbedding::from_config(&cfg, DType::F32, &device).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (2, 5, h), &device).unwrap();

        let mut cache = AttentionCacheManager::new(1);
        let out = attention
            .forward(&xs, 0, false, &mut cache, &rotary, true)
            .unwrap();
        for row in out.flatten_to(1).unwrap().to_vec2::<f32>().unwrap() {
            assert!(row.iter().all(|v| (v - row[0]).abs() < 1e-4), "{row:?}");
        }
    }
}
