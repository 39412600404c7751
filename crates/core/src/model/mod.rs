//! One pipeline stage of a LLaMA-family decoder, built from a native stage
//! shard.
//!
//! The first stage embeds token ids, the last stage applies the final norm
//! and output projection; every stage runs its slice of decoder blocks. Cache
//! state lives in a [`CacheContext`] the caller owns and passes in.

mod attention;
mod block;

use std::collections::{BTreeSet, HashMap};

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, VarBuilder};
use tracing::{debug, info};

use crate::checkpoint::{name_map, CanonicalKey, Convention, Result, WeightRole, WeightSet};
use crate::config::{ModelConfig, PipelineConfig};
use crate::distributed::{merge_microbatches, split_microbatches, PipelineStageConfig};
use crate::kv_cache::{CacheContext, CacheError};
use crate::layers::{wrapped, RmsNorm, RotaryEmbedding};

use self::block::TransformerBlock;

pub struct Transformer {
    config: ModelConfig,
    stage: PipelineStageConfig,
    micro_batch_num: usize,
    embedding: Option<Embedding>,
    blocks: Vec<TransformerBlock>,
    norm: Option<RmsNorm>,
    head: Option<Linear>,
    rotary: RotaryEmbedding,
    training: bool,
    dtype: DType,
}

impl Transformer {
    /// Build `stage` from its shard (native keys, stage-local block
    /// indices). Weights are cast to the pipeline's precision.
    pub fn new(
        config: &ModelConfig,
        stage: PipelineStageConfig,
        shard: &WeightSet,
        pipeline: &PipelineConfig,
        device: &Device,
    ) -> Result<Self> {
        for key in local_storage_keys(&stage) {
            shard.require(&key, Convention::Native)?;
        }

        let dtype = pipeline.precision.dtype();
        let tensors: HashMap<String, Tensor> = shard
            .iter()
            .map(|(k, t)| (k.to_string(), t.clone()))
            .collect();
        let vb = VarBuilder::from_tensors(tensors, dtype, device);
        let h = config.hidden_size;

        let embedding = if stage.is_first() {
            Some(embedding(
                config.vocab_size,
                h,
                vb.pp("token_embedding").pp("module"),
            )?)
        } else {
            None
        };
        let blocks = (0..stage.num_layers())
            .map(|i| TransformerBlock::new(config, pipeline.dropout, vb.pp("blocks").pp(i)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let (norm, head) = if stage.is_last() {
            (
                Some(RmsNorm::load(h, config.rms_norm_eps, vb.pp("norm"))?),
                Some(linear_no_bias(
                    h,
                    config.vocab_size,
                    wrapped(&vb, "language_model_head"),
                )?),
            )
        } else {
            (None, None)
        };

        info!(
            stage = stage.stage_id,
            start = stage.layers.start,
            end = stage.layers.end,
            dtype = ?dtype,
            "built pipeline stage"
        );
        Ok(Self {
            config: config.clone(),
            stage,
            micro_batch_num: pipeline.micro_batch_num,
            embedding,
            blocks,
            norm,
            head,
            rotary: RotaryEmbedding::from_config(config, dtype, device)?,
            training: false,
            dtype,
        })
    }

    pub fn stage(&self) -> &PipelineStageConfig {
        &self.stage
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Fresh caches sized for this stage.
    pub fn new_cache(&self) -> CacheContext {
        CacheContext::new(self.blocks.len(), self.micro_batch_num)
    }

    /// Dropout is active only while training.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Run one micro-batch through the stage.
    ///
    /// The first stage takes token ids `[batch, seq]`; later stages take
    /// hidden states `[batch, seq, hidden]`. The last stage returns logits
    /// `[batch, seq, vocab]`, the others hidden states.
    pub fn forward(
        &self,
        input: &Tensor,
        micro_batch: usize,
        use_cache: bool,
        cache: &mut CacheContext,
    ) -> std::result::Result<Tensor, CacheError> {
        // A context shaped for another stage would fail midway, after the
        // earlier blocks already advanced.
        if cache.num_blocks() != self.blocks.len() || cache.micro_batch_num() != self.micro_batch_num
        {
            return Err(CacheError::ShapeMismatch {
                what: "cache context",
                expected: vec![self.blocks.len(), self.micro_batch_num],
                actual: vec![cache.num_blocks(), cache.micro_batch_num()],
            });
        }
        let mut xs = match &self.embedding {
            Some(embedding) => embedding.forward(input)?,
            None => input.to_dtype(self.dtype)?,
        };
        for (i, block) in self.blocks.iter().enumerate() {
            xs = block.forward(
                &xs,
                micro_batch,
                use_cache,
                cache.block_mut(i)?,
                &self.rotary,
                self.training,
            )?;
        }
        if let (Some(norm), Some(head)) = (&self.norm, &self.head) {
            xs = norm.forward(&xs)?.apply(head)?;
        }
        Ok(xs)
    }

    /// Split `input` along the batch axis into one chunk per micro-batch,
    /// run them in slot order and stitch the outputs back together.
    pub fn forward_microbatches(
        &self,
        input: &Tensor,
        use_cache: bool,
        cache: &mut CacheContext,
    ) -> std::result::Result<Tensor, CacheError> {
        let chunks = split_microbatches(input, cache.micro_batch_num())?;
        if chunks.len() != cache.micro_batch_num() {
            return Err(CacheError::ShapeMismatch {
                what: "micro-batches",
                expected: vec![cache.micro_batch_num()],
                actual: vec![chunks.len()],
            });
        }
        let outputs = chunks
            .iter()
            .enumerate()
            .map(|(mb, chunk)| self.forward(chunk, mb, use_cache, cache))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        debug!(micro_batches = outputs.len(), "merged stage outputs");
        Ok(merge_microbatches(&outputs)?)
    }

    /// Current parameters keyed the way the stage shard stores them.
    pub fn state_dict(&self) -> WeightSet {
        let key = |role: WeightRole, layer: Option<usize>| {
            name_map::storage_key(&CanonicalKey { role, layer }, Convention::Native)
        };
        let mut out = WeightSet::new();
        if let Some(embedding) = &self.embedding {
            out.insert(key(WeightRole::Embedding, None), embedding.embeddings().clone());
        }
        for (i, block) in self.blocks.iter().enumerate() {
            let l = Some(i);
            let [w1, w2, w3] = block.mlp.weights();
            out.insert(key(WeightRole::AttentionNorm, l), block.attention.norm_weight().clone());
            out.insert(key(WeightRole::Query, l), block.attention.wqkv_weight().clone());
            out.insert(key(WeightRole::AttentionOut, l), block.attention.wo_weight().clone());
            out.insert(key(WeightRole::MlpNorm, l), block.mlp_norm.weight().clone());
            out.insert(key(WeightRole::Gate, l), w1.clone());
            out.insert(key(WeightRole::Down, l), w2.clone());
            out.insert(key(WeightRole::Up, l), w3.clone());
        }
        if let (Some(norm), Some(head)) = (&self.norm, &self.head) {
            out.insert(key(WeightRole::FinalNorm, None), norm.weight().clone());
            out.insert(key(WeightRole::Output, None), head.weight().clone());
        }
        out
    }
}

/// Native keys a shard of `stage` must hold, with local block indices.
fn local_storage_keys(stage: &PipelineStageConfig) -> BTreeSet<String> {
    crate::checkpoint::shard::stage_keys(stage)
        .into_iter()
        .map(|key| {
            let local = key.map_layer(|l| l - stage.layers.start);
            name_map::storage_key(&local, Convention::Native)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::shard::{split_into_stages, stage_shard};
    use crate::checkpoint::{tensors_equal, CheckpointError, FormatError};
    use crate::testing::{random_weights, tiny_config};

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    fn single_stage(config: &ModelConfig, micro_batch_num: usize) -> Transformer {
        let device = Device::Cpu;
        let weights = random_weights(config, &device).unwrap();
        let stage = PipelineStageConfig::new(0, 1, config.num_hidden_layers).unwrap();
        let shard = stage_shard(&weights, &stage, config).unwrap();
        Transformer::new(
            config,
            stage,
            &shard,
            &PipelineConfig::new(1, micro_batch_num),
            &device,
        )
        .unwrap()
    }

    fn tokens(ids: &[u32], batch: usize) -> Tensor {
        let row = Tensor::new(ids, &Device::Cpu).unwrap().unsqueeze(0).unwrap();
        Tensor::cat(&vec![row; batch], 0).unwrap()
    }

    #[test]
    fn incremental_decoding_matches_full_pass() {
        let config = tiny_config(2);
        let model = single_stage(&config, 1);
        let ids = [3u32, 7, 1, 12, 5];

        let mut cache = model.new_cache();
        let full = model
            .forward(&tokens(&ids, 1), 0, false, &mut cache)
            .unwrap();
        assert_eq!(full.dims(), &[1, 5, 16]);

        let mut cache = model.new_cache();
        let prefix = model
            .forward(&tokens(&ids[..3], 1), 0, true, &mut cache)
            .unwrap();
        let mut steps = vec![prefix];
        for id in &ids[3..] {
            steps.push(model.forward(&tokens(&[*id], 1), 0, true, &mut cache).unwrap());
        }
        let incremental = Tensor::cat(&steps, 1).unwrap();

        assert_eq!(incremental.dims(), full.dims());
        assert!(max_abs_diff(&incremental, &full) < 1e-4);
    }

    #[test]
    fn two_stages_equal_one() {
        let device = Device::Cpu;
        let config = tiny_config(4);
        let weights = random_weights(&config, &device).unwrap();
        let input = tokens(&[1, 2, 3, 4], 2);
        let pipeline = PipelineConfig::new(2, 1);

        let whole_stage = PipelineStageConfig::new(0, 1, 4).unwrap();
        let whole_shard = stage_shard(&weights, &whole_stage, &config).unwrap();
        let whole = Transformer::new(&config, whole_stage, &whole_shard, &pipeline, &device).unwrap();
        let expected = whole
            .forward(&input, 0, false, &mut whole.new_cache())
            .unwrap();

        let stages = PipelineStageConfig::all(4, 2).unwrap();
        let shards = split_into_stages(&weights, &stages, &config).unwrap();
        let first = Transformer::new(&config, stages[0].clone(), &shards[0], &pipeline, &device).unwrap();
        let last = Transformer::new(&config, stages[1].clone(), &shards[1], &pipeline, &device).unwrap();

        let hidden = first
            .forward(&input, 0, false, &mut first.new_cache())
            .unwrap();
        assert_eq!(hidden.dims(), &[2, 4, 8]);
        let logits = last
            .forward(&hidden, 0, false, &mut last.new_cache())
            .unwrap();

        assert!(max_abs_diff(&logits, &expected) < 1e-5);
    }

    #[test]
    fn state_dict_reproduces_the_shard() {
        let device = Device::Cpu;
        let config = tiny_config(4);
        let weights = random_weights(&config, &device).unwrap();
        let stages = PipelineStageConfig::all(4, 2).unwrap();
        let shards = split_into_stages(&weights, &stages, &config).unwrap();

        for (stage, shard) in stages.into_iter().zip(&shards) {
            let model =
                Transformer::new(&config, stage, shard, &PipelineConfig::new(2, 1), &device).unwrap();
            let state = model.state_dict();
            assert_eq!(state.len(), shard.len());
            for (key, tensor) in shard.iter() {
                assert!(tensors_equal(state.get(key).unwrap(), tensor).unwrap(), "{key}");
            }
        }
    }

    #[test]
    fn missing_weight_is_reported_by_native_key() {
        let device = Device::Cpu;
        let config = tiny_config(2);
        let weights = random_weights(&config, &device).unwrap();
        let stage = PipelineStageConfig::new(0, 1, 2).unwrap();
        let mut shard = stage_shard(&weights, &stage, &config).unwrap();
        shard.remove("blocks.1.attention.wqkv.module.module.weight");

        let err = Transformer::new(&config, stage, &shard, &PipelineConfig::default(), &device)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            CheckpointError::Format(FormatError::MissingKey { ref key, .. })
                if key == "blocks.1.attention.wqkv.module.module.weight"
        ));
    }

    #[test]
    fn micro_batches_use_their_own_slots() {
        let config = tiny_config(2);
        let model = single_stage(&config, 2);
        let batch = Tensor::cat(&[tokens(&[1, 2], 1), tokens(&[9, 4], 1)], 0).unwrap();

        let mut cache = model.new_cache();
        let split = model.forward_microbatches(&batch, true, &mut cache).unwrap();
        assert_eq!(split.dims(), &[2, 2, 16]);
        for block in 0..2 {
            let manager = cache.block(block).unwrap();
            assert_eq!(manager.cursor(), 0);
            assert_eq!(manager.slot(0).unwrap().seq_len(), 2);
            assert_eq!(manager.slot(1).unwrap().seq_len(), 2);
        }

        let whole = model
            .forward(&batch, 0, false, &mut model.new_cache())
            .unwrap();
        assert!(max_abs_diff(&split, &whole) < 1e-5);
    }

    #[test]
    fn mismatched_cache_context_is_rejected_untouched() {
        let config = tiny_config(3);
        let model = single_stage(&config, 2);
        let ids = tokens(&[3, 1, 4], 1);

        for (blocks, micro_batches) in [(2, 2), (3, 1)] {
            let mut cache = CacheContext::new(blocks, micro_batches);
            let err = model.forward(&ids, 0, true, &mut cache).unwrap_err();
            assert!(matches!(
                err,
                CacheError::ShapeMismatch {
                    what: "cache context",
                    ..
                }
            ));
            for block in 0..blocks {
                let manager = cache.block(block).unwrap();
                assert_eq!(manager.cursor(), 0);
                assert!(manager.slot(0).unwrap().is_empty());
            }
        }
    }

    #[test]
    fn uneven_micro_batch_split_is_rejected() {
        let config = tiny_config(2);
        let model = single_stage(&config, 3);
        let mut cache = model.new_cache();
        let err = model
            .forward_microbatches(&tokens(&[1, 2], 2), false, &mut cache)
            .unwrap_err();
        assert!(matches!(err, CacheError::ShapeMismatch { what: "micro-batches", .. }));
    }

    #[test]
    fn dropout_is_inert_outside_training() {
        let device = Device::Cpu;
        let config = tiny_config(2);
        let weights = random_weights(&config, &device).unwrap();
        let stage = PipelineStageConfig::new(0, 1, 2).unwrap();
        let shard = stage_shard(&weights, &stage, &config).unwrap();
        let pipeline = PipelineConfig {
            dropout: 0.5,
            ..PipelineConfig::default()
        };
        let mut model = Transformer::new(&config, stage, &shard, &pipeline, &device).unwrap();
        let input = tokens(&[1, 2, 3], 1);

        let a = model.forward(&input, 0, false, &mut model.new_cache()).unwrap();
        let b = model.forward(&input, 0, false, &mut model.new_cache()).unwrap();
        assert!(max_abs_diff(&a, &b) == 0.0);

        model.set_training(true);
        assert!(model.is_training());
        let c = model.forward(&input, 0, false, &mut model.new_cache()).unwrap();
        assert!(max_abs_diff(&a, &c) > 0.0);
    }
}
