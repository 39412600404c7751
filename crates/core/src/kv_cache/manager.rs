use candle_core::Tensor;
use tracing::trace;

use super::error::CacheError;
use super::slot::CacheSlot;
use crate::layers::RotaryEmbedding;

/// Output of one cache step: rotated projections padded to a common
/// sequence length.
#[derive(Debug, Clone)]
pub struct CacheAdvance {
    /// `[batch, start_pos + seq_len, heads, head_dim]`; the first
    /// `start_pos` rows are zero padding.
    pub query: Tensor,
    pub key: Tensor,
    pub value: Tensor,
    /// Position of the first new token.
    pub start_pos: usize,
    /// Number of new tokens.
    pub seq_len: usize,
}

impl CacheAdvance {
    /// Keep only the rows of the new tokens (dim 1).
    pub fn trim(&self, attn_out: &Tensor) -> candle_core::Result<Tensor> {
        attn_out.narrow(1, self.start_pos, self.seq_len)
    }
}

/// Per-block cache: one slot per in-flight micro-batch, used round robin.
#[derive(Debug, Clone)]
pub struct AttentionCacheManager {
    slots: Vec<CacheSlot>,
    cursor: usize,
}

impl AttentionCacheManager {
    pub fn new(micro_batch_num: usize) -> Self {
        assert!(micro_batch_num > 0, "micro_batch_num must be > 0");
        Self {
            slots: vec![CacheSlot::new(); micro_batch_num],
            cursor: 0,
        }
    }

    pub fn micro_batch_num(&self) -> usize {
        self.slots.len()
    }

    /// Micro-batch the next call must present.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn slot(&self, micro_batch: usize) -> Option<&CacheSlot> {
        self.slots.get(micro_batch)
    }

    /// Apply rotary encoding to one pass of `micro_batch` and extend its
    /// cache when `use_cache` is set.
    ///
    /// Inputs are `[batch, seq, heads, head_dim]`. On error nothing changes.
    pub fn advance(
        &mut self,
        micro_batch: usize,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        use_cache: bool,
        rotary: &RotaryEmbedding,
    ) -> Result<CacheAdvance, CacheError> {
        if micro_batch != self.cursor {
            return Err(CacheError::MicroBatchOutOfOrder {
                expected: self.cursor,
                actual: micro_batch,
            });
        }
        let (batch, seq_len, heads, head_dim) = query.dims4()?;
        for (what, t) in [("key", key), ("value", value)] {
            if t.dims() != query.dims() {
                return Err(CacheError::ShapeMismatch {
                    what,
                    expected: query.dims().to_vec(),
                    actual: t.dims().to_vec(),
                });
            }
        }

        let slot = &mut self.slots[micro_batch];
        let start_pos = if use_cache { slot.seq_len() } else { 0 };
        let needed = start_pos + seq_len;
        if needed > rotary.max_positions() {
            return Err(CacheError::RotaryRangeExceeded {
                needed,
                max: rotary.max_positions(),
            });
        }

        let (q, k) = rotary.apply(query, key, start_pos)?;
        let step = if use_cache {
            let (full_k, full_v) = slot.append(&k, value)?;
            let q = if start_pos > 0 {
                let pad = Tensor::zeros((batch, start_pos, heads, head_dim), q.dtype(), q.device())?;
                Tensor::cat(&[&pad, &q], 1)?
            } else {
                q
            };
            CacheAdvance {
                query: q,
                key: full_k,
                value: full_v,
                start_pos,
                seq_len,
            }
        } else {
            CacheAdvance {
                query: q,
                key: k,
                value: value.clone(),
                start_pos: 0,
                seq_len,
            }
        };

        trace!(micro_batch, start_pos, seq_len, use_cache, "cache step");
        self.cursor = (self.cursor + 1) % self.slots.len();
        Ok(step)
    }

    /// Drop every slot and rewind the cursor.
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(CacheSlot::clear);
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn rope() -> RotaryEmbedding {
        RotaryEmbedding::new(4, 64, 10000.0, DType::F32, &Device::Cpu).unwrap()
    }

    fn proj(seq: usize) -> Tensor {
        Tensor::randn(0f32, 1.0, (1, seq, 2, 4), &Device::Cpu).unwrap()
    }

    #[test]
    fn offsets_accumulate_per_slot() {
        let rope = rope();
        let mut mgr = AttentionCacheManager::new(1);
        let mut total = 0;
        for n in [5, 1, 1, 3] {
            let x = proj(n);
            let step = mgr.advance(0, &x, &x, &x, true, &rope).unwrap();
            assert_eq!(step.start_pos, total);
            assert_eq!(step.seq_len, n);
            total += n;
            assert_eq!(step.key.dims(), &[1, total, 2, 4]);
            assert_eq!(step.query.dims(), &[1, total, 2, 4]);
            assert_eq!(mgr.slot(0).unwrap().seq_len(), total);
        }
    }

    #[test]
    fn slots_are_independent() {
        let rope = rope();
        let mut mgr = AttentionCacheManager::new(2);
        let x = proj(3);
        mgr.advance(0, &x, &x, &x, true, &rope).unwrap();
        let step = mgr.advance(1, &x, &x, &x, true, &rope).unwrap();
        assert_eq!(step.start_pos, 0);
        let step = mgr.advance(0, &proj(1), &proj(1), &proj(1), true, &rope).unwrap();
        assert_eq!(step.start_pos, 3);
    }

    #[test]
    fn cursor_rotates_for_every_call() {
        let rope = rope();
        let m = 3;
        let mut mgr = AttentionCacheManager::new(m);
        let x = proj(1);
        for call in 0..(m * 4 + 2) {
            assert_eq!(mgr.cursor(), call % m);
            mgr.advance(call % m, &x, &x, &x, call % 2 == 0, &rope)
                .unwrap();
        }
        assert_eq!(mgr.cursor(), 2);
    }

    #[test]
    fn out_of_order_is_rejected_without_side_effects() {
        let rope = rope();
        let mut mgr = AttentionCacheManager::new(2);
        let x = proj(2);
        let err = mgr.advance(1, &x, &x, &x, true, &rope).unwrap_err();
        assert!(matches!(
            err,
            CacheError::MicroBatchOutOfOrder {
                expected: 0,
                actual: 1
            }
        ));
        assert_eq!(mgr.cursor(), 0);
        assert!(mgr.slot(1).unwrap().is_empty());
    }

    #[test]
    fn uncached_pass_leaves_slot_alone() {
        let rope = rope();
        let mut mgr = AttentionCacheManager::new(1);
        let x = proj(2);
        mgr.advance(0, &x, &x, &x, true, &rope).unwrap();
        let step = mgr.advance(0, &x, &x, &x, false, &rope).unwrap();
        assert_eq!(step.start_pos, 0);
        assert_eq!(step.key.dims(), &[1, 2, 2, 4]);
        assert_eq!(mgr.slot(0).unwrap().seq_len(), 2);
    }

    #[test]
    fn query_padding_is_zero_and_trimmed() {
        let rope = rope();
        let mut mgr = AttentionCacheManager::new(1);
        mgr.advance(0, &proj(3), &proj(3), &proj(3), true, &rope).unwrap();
        let x = proj(2);
        let step = mgr.advance(0, &x, &x, &x, true, &rope).unwrap();

        let pad: Vec<f32> = step
            .query
            .narrow(1, 0, 3)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(pad.iter().all(|v| *v == 0.0));
        assert_eq!(step.trim(&step.query).unwrap().dims(), &[1, 2, 2, 4]);
    }

    #[test]
    fn rotary_range_is_enforced() {
        let rope = RotaryEmbedding::new(4, 4, 10000.0, DType::F32, &Device::Cpu).unwrap();
        let mut mgr = AttentionCacheManager::new(1);
        mgr.advance(0, &proj(3), &proj(3), &proj(3), true, &rope).unwrap();
        let err = mgr
            .advance(0, &proj(2), &proj(2), &proj(2), true, &rope)
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::RotaryRangeExceeded { needed: 5, max: 4 }
        ));
        assert_eq!(mgr.slot(0).unwrap().seq_len(), 3);
        assert_eq!(mgr.cursor(), 0);
    }

    #[test]
    fn mismatched_value_shape() {
        let rope = rope();
        let mut mgr = AttentionCacheManager::new(1);
        let err = mgr
            .advance(0, &proj(2), &proj(2), &proj(3), true, &rope)
            .unwrap_err();
        assert!(matches!(err, CacheError::ShapeMismatch { what: "value", .. }));
    }

    #[test]
    fn reset_clears_everything() {
        let rope = rope();
        let mut mgr = AttentionCacheManager::new(2);
        let x = proj(1);
        mgr.advance(0, &x, &x, &x, true, &rope).unwrap();
        mgr.reset();
        assert_eq!(mgr.cursor(), 0);
        assert!(mgr.slot(0).unwrap().is_empty());
    }
}
