//! Small model fixtures shared by unit and integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use candle_core::{Device, Result, Tensor};

use crate::checkpoint::{name_map, CanonicalWeights};
use crate::config::ModelConfig;
use crate::storage::{self, Storage, StorageError};

/// LLaMA-shaped config small enough to round-trip in milliseconds
/// (hidden 8, 2 heads, vocab 16).
pub fn tiny_config(num_layers: usize) -> ModelConfig {
    ModelConfig {
        vocab_size: 16,
        hidden_size: 8,
        num_hidden_layers: num_layers,
        num_attention_heads: 2,
        intermediate_size: 12,
        max_position_embeddings: 64,
        ..ModelConfig::llama_7b()
    }
}

/// Every canonical weight of `config`, filled with N(0, 0.5) samples.
pub fn random_weights(config: &ModelConfig, device: &Device) -> Result<CanonicalWeights> {
    name_map::all_keys(config.num_hidden_layers)
        .into_iter()
        .map(|key| {
            let shape = name_map::expected_shape(key.role, config);
            Ok((key, Tensor::randn(0f32, 0.5, shape, device)?))
        })
        .collect()
}

/// Storage wrapper whose `n`-th write (1-based) fails with
/// [`StorageError::Remote`]. Every other call passes through to `inner`.
pub struct FailingStorage<S> {
    inner: S,
    fail_on: usize,
    writes: AtomicUsize,
}

impl<S: Storage> FailingStorage<S> {
    pub fn new(inner: S, fail_on: usize) -> Self {
        Self {
            inner,
            fail_on,
            writes: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Writes attempted so far, including the failed one.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl<S: Storage> Storage for FailingStorage<S> {
    fn list(&self, prefix: &str) -> storage::Result<Vec<String>> {
        self.inner.list(prefix)
    }

    fn read(&self, key: &str) -> storage::Result<Vec<u8>> {
        self.inner.read(key)
    }

    fn write(&self, key: &str, data: &[u8]) -> storage::Result<()> {
        let attempt = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == self.fail_on {
            return Err(StorageError::Remote(format!("injected failure writing {key}")));
        }
        self.inner.write(key, data)
    }

    fn exists(&self, key: &str) -> storage::Result<bool> {
        self.inner.exists(key)
    }

    fn delete_prefix(&self, prefix: &str) -> storage::Result<()> {
        self.inner.delete_prefix(prefix)
    }

    fn describe(&self, key: &str) -> String {
        self.inner.describe(key)
    }
}
