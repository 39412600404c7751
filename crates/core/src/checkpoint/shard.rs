//! Stage shards: the native-convention slice of a model one pipeline stage
//! owns, with block indices local to the stage.

use candle_core::Device;
use tracing::debug;

use super::adapter::{decode, encode};
use super::convention::Convention;
use super::error::{FormatError, Result};
use super::name_map::{self, CanonicalKey, WeightRole};
use super::staging::StagingArea;
use super::weight_set::{CanonicalWeights, WeightSet};
use crate::config::ModelConfig;
use crate::distributed::PipelineStageConfig;
use crate::storage::Storage;

/// Canonical keys (global layer indices) a stage owns.
pub fn stage_keys(stage: &PipelineStageConfig) -> Vec<CanonicalKey> {
    let mut keys = Vec::new();
    if stage.is_first() {
        keys.push(CanonicalKey::global(WeightRole::Embedding));
    }
    for layer in stage.layers.as_range() {
        keys.extend(name_map::layer_roles().map(|role| CanonicalKey::layer(role, layer)));
    }
    if stage.is_last() {
        keys.push(CanonicalKey::global(WeightRole::FinalNorm));
        keys.push(CanonicalKey::global(WeightRole::Output));
    }
    keys
}

fn to_local(stage: &PipelineStageConfig, key: CanonicalKey) -> CanonicalKey {
    key.map_layer(|l| l - stage.layers.start)
}

/// Cut the shard of `stage` out of a whole model.
pub fn stage_shard(
    weights: &CanonicalWeights,
    stage: &PipelineStageConfig,
    config: &ModelConfig,
) -> Result<WeightSet> {
    let mut local = CanonicalWeights::new();
    for key in stage_keys(stage) {
        let tensor = weights.get(&key).ok_or_else(|| FormatError::MissingKey {
            key: name_map::storage_key(&key, Convention::Native),
            convention: Convention::Native,
        })?;
        local.insert(to_local(stage, key), tensor.clone());
    }
    encode(&local, Convention::Native, config)
}

/// Shards of every stage, in stage order.
pub fn split_into_stages(
    weights: &CanonicalWeights,
    stages: &[PipelineStageConfig],
    config: &ModelConfig,
) -> Result<Vec<WeightSet>> {
    stages
        .iter()
        .map(|stage| stage_shard(weights, stage, config))
        .collect()
}

/// Validate a shard and lift it back to global layer indices.
pub fn decode_shard(
    shard: WeightSet,
    stage: &PipelineStageConfig,
    config: &ModelConfig,
) -> Result<CanonicalWeights> {
    let expected: Vec<CanonicalKey> = stage_keys(stage)
        .into_iter()
        .map(|k| to_local(stage, k))
        .collect();
    let local = decode(shard, Convention::Native, config, &expected)?;
    Ok(local
        .into_iter()
        .map(|(key, t)| (key.map_layer(|l| l + stage.layers.start), t))
        .collect())
}

/// Merge shards given in ascending stage order into a whole model.
pub fn merge_shards(
    shards: impl IntoIterator<Item = (PipelineStageConfig, WeightSet)>,
    config: &ModelConfig,
) -> Result<CanonicalWeights> {
    let mut merged = CanonicalWeights::new();
    for (stage, shard) in shards {
        for (key, tensor) in decode_shard(shard, &stage, config)? {
            if merged.insert(key, tensor).is_some() {
                return Err(FormatError::DuplicateKey {
                    key: name_map::storage_key(&key, Convention::Native),
                }
                .into());
            }
        }
    }
    Ok(merged)
}

/// Persist the shard of `stage` into the staging area.
pub fn write_shard(
    staging: &dyn Storage,
    area: &StagingArea,
    stage: usize,
    shard: &WeightSet,
) -> Result<()> {
    let key = area.shard_key(stage);
    staging.write(&key, &shard.to_safetensors()?)?;
    debug!(stage, tensors = shard.len(), file = %key, "wrote stage shard");
    Ok(())
}

/// Load the shard of `stage` from the staging area.
pub fn read_shard(
    staging: &dyn Storage,
    area: &StagingArea,
    stage: usize,
    device: &Device,
) -> Result<WeightSet> {
    let key = area.shard_key(stage);
    let shard = WeightSet::from_safetensors(&staging.read(&key)?, device)?;
    debug!(stage, tensors = shard.len(), file = %key, "read stage shard");
    Ok(shard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointError;
    use crate::testing::{random_weights, tiny_config};

    #[test]
    fn shard_contents_follow_stage_position() {
        let config = tiny_config(32);
        let weights = random_weights(&config, &Device::Cpu).unwrap();
        let stages = PipelineStageConfig::all(32, 8).unwrap();
        let shards = split_into_stages(&weights, &stages, &config).unwrap();

        assert!(shards[0].contains("token_embedding.module.weight"));
        assert!(!shards[0].contains("norm.weight"));
        assert!(shards[7].contains("norm.weight"));
        assert!(shards[7].contains("language_model_head.module.module.weight"));
        assert!(!shards[7].contains("token_embedding.module.weight"));

        // Four blocks of seven tensors: two norms, fused qkv, wo, w1, w2, w3.
        assert_eq!(shards[3].len(), 4 * 7);
        assert!(shards[3].contains("blocks.3.mlp.w2.module.module.weight"));
        assert!(!shards[3].contains("blocks.4.mlp.w2.module.module.weight"));
    }

    #[test]
    fn local_indices_map_back_to_global() {
        let config = tiny_config(5);
        let weights = random_weights(&config, &Device::Cpu).unwrap();
        let stages = PipelineStageConfig::all(5, 2).unwrap();
        let shard = stage_shard(&weights, &stages[1], &config).unwrap();

        // Stage 1 owns global layers 3 and 4 as local blocks 0 and 1.
        let local = shard.get("blocks.1.mlp.norm.weight").unwrap();
        let global = weights.get_role(WeightRole::MlpNorm, Some(4)).unwrap();
        assert!(crate::checkpoint::tensors_equal(local, global).unwrap());
    }

    #[test]
    fn split_then_merge_restores_model() {
        let config = tiny_config(7);
        let weights = random_weights(&config, &Device::Cpu).unwrap();
        let stages = PipelineStageConfig::all(7, 3).unwrap();
        let shards = split_into_stages(&weights, &stages, &config).unwrap();
        let merged = merge_shards(stages.into_iter().zip(shards), &config).unwrap();
        assert!(merged.same_as(&weights).unwrap());
    }

    #[test]
    fn shard_missing_block_is_rejected() {
        let config = tiny_config(4);
        let weights = random_weights(&config, &Device::Cpu).unwrap();
        let stages = PipelineStageConfig::all(4, 2).unwrap();
        let mut shard = stage_shard(&weights, &stages[0], &config).unwrap();
        shard.remove("blocks.1.attention.wqkv.module.module.weight");

        let err = decode_shard(shard, &stages[0], &config).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::Format(FormatError::MissingKey { .. })
        ));
    }

    #[test]
    fn merging_same_stage_twice_is_duplicate() {
        let config = tiny_config(2);
        let weights = random_weights(&config, &Device::Cpu).unwrap();
        let stage = PipelineStageConfig::new(0, 1, 2).unwrap();
        let shard = stage_shard(&weights, &stage, &config).unwrap();
        let err = merge_shards(
            [(stage.clone(), shard.clone()), (stage, shard)],
            &config,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::Format(FormatError::DuplicateKey { .. })
        ));
    }
}
