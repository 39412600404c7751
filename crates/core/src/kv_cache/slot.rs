use candle_core::Tensor;

use super::error::CacheError;

/// Key/value history of one micro-batch in one block.
///
/// Tensors are laid out `[batch, seq, heads, head_dim]` and always share
/// their sequence length.
#[derive(Debug, Clone, Default)]
pub struct CacheSlot {
    kv: Option<(Tensor, Tensor)>,
}

impl CacheSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.kv.is_none()
    }

    /// Positions stored so far.
    pub fn seq_len(&self) -> usize {
        self.kv.as_ref().map_or(0, |(k, _)| k.dims()[1])
    }

    pub fn key(&self) -> Option<&Tensor> {
        self.kv.as_ref().map(|(k, _)| k)
    }

    pub fn value(&self) -> Option<&Tensor> {
        self.kv.as_ref().map(|(_, v)| v)
    }

    /// Append new positions and return the full history.
    pub fn append(&mut self, key: &Tensor, value: &Tensor) -> Result<(Tensor, Tensor), CacheError> {
        let (k, v) = match &self.kv {
            None => (key.clone(), value.clone()),
            Some((cached_k, cached_v)) => {
                let (b, _, h, d) = cached_k.dims4()?;
                let (nb, _, nh, nd) = key.dims4()?;
                if (b, h, d) != (nb, nh, nd) {
                    return Err(CacheError::ShapeMismatch {
                        what: "cached key",
                        expected: vec![b, key.dims()[1], h, d],
                        actual: key.dims().to_vec(),
                    });
                }
                (
                    Tensor::cat(&[cached_k, key], 1)?,
                    Tensor::cat(&[cached_v, value], 1)?,
                )
            }
        };
        self.kv = Some((k.clone(), v.clone()));
        Ok((k, v))
    }

    pub fn clear(&mut self) {
        self.kv = None;
    }
}
