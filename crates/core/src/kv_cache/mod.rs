//! Incremental attention caches for pipeline stages.
//!
//! Each transformer block owns an [`AttentionCacheManager`]: a ring of
//! [`CacheSlot`]s, one per micro-batch in flight, extended along the sequence
//! axis on every cached pass. The managers of a stage live in a
//! [`CacheContext`] owned by the caller (one per generation session) and
//! passed into the forward pass.

mod error;
mod manager;
mod slot;

pub use error::CacheError;
pub use manager::{AttentionCacheManager, CacheAdvance};
pub use slot::CacheSlot;

/// Caches of every block of one pipeline stage.
#[derive(Debug, Clone)]
pub struct CacheContext {
    managers: Vec<AttentionCacheManager>,
    micro_batch_num: usize,
}

impl CacheContext {
    pub fn new(num_blocks: usize, micro_batch_num: usize) -> Self {
        Self {
            managers: (0..num_blocks)
                .map(|_| AttentionCacheManager::new(micro_batch_num))
                .collect(),
            micro_batch_num,
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.managers.len()
    }

    pub fn micro_batch_num(&self) -> usize {
        self.micro_batch_num
    }

    /// Manager of stage-local block `block`.
    pub fn block_mut(&mut self, block: usize) -> Result<&mut AttentionCacheManager, CacheError> {
        let num_blocks = self.managers.len();
        self.managers
            .get_mut(block)
            .ok_or(CacheError::UnknownBlock { block, num_blocks })
    }

    pub fn block(&self, block: usize) -> Option<&AttentionCacheManager> {
        self.managers.get(block)
    }

    /// Forget every cached position; the next pass starts at micro-batch 0.
    pub fn reset(&mut self) {
        self.managers.iter_mut().for_each(AttentionCacheManager::reset);
    }
}
