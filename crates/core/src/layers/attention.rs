use candle_core::{DType, Device, Result, Tensor};

/// Additive `[1, 1, seq, seq]` mask: `-inf` where a key lies after its query.
pub fn causal_mask(seq_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let pos = Tensor::arange(0u32, seq_len as u32, device)?;
    let future = pos.unsqueeze(0)?.broadcast_gt(&pos.unsqueeze(1)?)?;
    let blocked = Tensor::full(f32::NEG_INFINITY, (seq_len, seq_len), device)?.to_dtype(dtype)?;
    let open = Tensor::zeros((seq_len, seq_len), dtype, device)?;
    future
        .where_cond(&blocked, &open)?
        .reshape((1, 1, seq_len, seq_len))
}

/// Eager causal scaled dot-product attention.
///
/// `q`, `k`, `v` are `[batch, seq, heads, head_dim]` with a common sequence
/// length; returns `[batch, seq, heads * head_dim]`.
pub fn causal_attention(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
    let (b_sz, seq_len, num_heads, head_dim) = q.dims4()?;

    let q = q.transpose(1, 2)?.contiguous()?;
    let k = k.transpose(1, 2)?.contiguous()?;
    let v = v.transpose(1, 2)?.contiguous()?;

    let scale = 1.0 / (head_dim as f64).sqrt();
    let attn_weights = (q.matmul(&k.transpose(2, 3)?)? * scale)?;
    let attn_weights = if seq_len > 1 {
        let mask = causal_mask(seq_len, attn_weights.dtype(), attn_weights.device())?;
        attn_weights.broadcast_add(&mask)?
    } else {
        attn_weights
    };
    let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
    let attn_output = attn_weights.matmul(&v)?;

    attn_output
        .transpose(1, 2)?
        .reshape((b_sz, seq_len, num_heads * head_dim))
}
