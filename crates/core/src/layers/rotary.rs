use candle_core::{DType, Device, Result, Tensor};

use crate::config::ModelConfig;

/// Inverse rotation frequencies `theta^(-2i/d)` for `i < d/2`, shape `(d/2,)`.
pub fn inv_freq(head_dim: usize, rope_theta: f64, device: &Device) -> Result<Tensor> {
    let freqs: Vec<f32> = (0..head_dim / 2)
        .map(|i| 1.0 / (rope_theta as f32).powf((2 * i) as f32 / head_dim as f32))
        .collect();
    Tensor::new(freqs.as_slice(), device)
}

/// Rotary position embedding in the half-split ("rotate half") layout.
///
/// Holds cos/sin tables for positions `0..max_positions`; a cached decode
/// step reads the rows starting at its cache offset.
pub struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
    max_positions: usize,
}

impl RotaryEmbedding {
    pub fn new(
        head_dim: usize,
        max_positions: usize,
        rope_theta: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let positions = Tensor::arange(0u32, max_positions as u32, device)?
            .to_dtype(DType::F32)?
            .unsqueeze(1)?;
        let angles = positions.broadcast_mul(&inv_freq(head_dim, rope_theta, device)?.unsqueeze(0)?)?;
        Ok(Self {
            sin: angles.sin()?.to_dtype(dtype)?,
            cos: angles.cos()?.to_dtype(dtype)?,
            max_positions,
        })
    }

    pub fn from_config(cfg: &ModelConfig, dtype: DType, device: &Device) -> Result<Self> {
        Self::new(
            cfg.head_dim(),
            cfg.max_position_embeddings,
            cfg.rope_theta,
            dtype,
            device,
        )
    }

    /// Number of positions the tables cover.
    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    /// Rotate `q` and `k`, laid out `[batch, seq, heads, head_dim]`, as
    /// positions `offset..offset + seq`.
    pub fn apply(&self, q: &Tensor, k: &Tensor, offset: usize) -> Result<(Tensor, Tensor)> {
        let (_b, seq_len, _h, _d) = q.dims4()?;
        let cos = self.cos.narrow(0, offset, seq_len)?;
        let sin = self.sin.narrow(0, offset, seq_len)?;
        let rotate = |x: &Tensor| -> Result<Tensor> {
            // rope works on [b, h, t, d]
            let x = x.transpose(1, 2)?.contiguous()?;
            candle_nn::rotary_emb::rope(&x, &cos, &sin)?
                .transpose(1, 2)?
                .contiguous()
        };
        Ok((rotate(q)?, rotate(k)?))
    }
}
