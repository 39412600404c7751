//! Command implementations behind the `pipeshard` subcommands.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use candle_core::{DType, Device};
use tracing::info;

use pipeshard_core::checkpoint::{CanonicalKey, CheckpointAdapter, Convention, ReshardCoordinator};
use pipeshard_core::config::{ModelConfig, Precision};
use pipeshard_core::distributed::{PipelineStageConfig, StageRole, ThreadCommunicator};
use pipeshard_core::storage::{
    InMemoryObjectStore, LocalStorage, ObjectStorage, Storage, StorageProtocol,
};

/// Collective timeout for in-process resharding participants.
const PARTICIPANT_TIMEOUT: Duration = Duration::from_secs(600);

/// Pick the model shape: an explicit `config.json`, then a preset name, then
/// the `config.json` shipped next to the source checkpoint.
pub fn resolve_model_config(
    config_path: Option<&Path>,
    preset: Option<&str>,
    source: Option<&Path>,
) -> anyhow::Result<ModelConfig> {
    let read = |path: &Path| -> anyhow::Result<ModelConfig> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading model config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing model config {}", path.display()))
    };

    let config = if let Some(path) = config_path {
        read(path)?
    } else if let Some(name) = preset {
        ModelConfig::preset(name).ok_or_else(|| anyhow!("unknown model preset '{name}'"))?
    } else {
        match source.map(|dir| dir.join("config.json")) {
            Some(candidate) if candidate.is_file() => read(&candidate)?,
            _ => bail!("no model shape given: pass --model or --model-config"),
        }
    };
    config.validate()?;
    Ok(config)
}

/// Destination storage for `protocol`. The object-store backend keeps objects
/// in memory, which makes it a dry run.
pub fn open_storage(protocol: StorageProtocol, root: &Path) -> Box<dyn Storage> {
    match protocol {
        StorageProtocol::File => Box::new(LocalStorage::new(root)),
        StorageProtocol::ObjectStore => Box::new(ObjectStorage::new(
            InMemoryObjectStore::new(),
            root.to_string_lossy(),
        )),
    }
}

pub struct ConvertArgs<'a> {
    pub source: &'a Path,
    pub from: Convention,
    pub dest: &'a dyn Storage,
    pub to: Convention,
    pub model: ModelConfig,
    pub precision: Option<Precision>,
}

/// Read a whole checkpoint and write it back in another convention.
/// Returns the keys written.
pub fn convert(args: ConvertArgs<'_>) -> anyhow::Result<Vec<String>> {
    let mut adapter = CheckpointAdapter::new(args.model, Device::Cpu);
    if let Some(precision) = args.precision {
        adapter = adapter.with_precision(precision);
    }
    let source = LocalStorage::new(args.source);
    let weights = adapter.read(&source, "", args.from)?;
    let written = adapter.write(&weights, args.dest, "", args.to)?;
    info!(
        from = %args.from,
        to = %args.to,
        tensors = weights.len(),
        files = written.len(),
        "converted checkpoint"
    );
    Ok(written)
}

pub struct ReshardArgs<'a> {
    pub source: &'a Path,
    pub from: Convention,
    pub dest: &'a dyn Storage,
    pub to: Convention,
    pub model: ModelConfig,
    pub num_stages: usize,
    pub staging_dir: PathBuf,
}

/// Run one in-process participant per stage: load the checkpoint into stage
/// shards through a staging area, then save them back merged. Returns the
/// tensor count of each stage's shard.
pub fn reshard(args: ReshardArgs<'_>) -> anyhow::Result<Vec<usize>> {
    PipelineStageConfig::all(args.model.num_hidden_layers, args.num_stages)?;

    let adapter = CheckpointAdapter::new(args.model, Device::Cpu);
    let source = LocalStorage::new(args.source);
    let staging = LocalStorage::new(&args.staging_dir);
    let comms = ThreadCommunicator::group(args.num_stages, PARTICIPANT_TIMEOUT);
    let (source, staging, dest) = (&source, &staging, args.dest);
    let (from, to, num_stages) = (args.from, args.to, args.num_stages);

    std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .iter()
            .enumerate()
            .map(|(rank, comm)| {
                let adapter = adapter.clone();
                s.spawn(move || -> pipeshard_core::checkpoint::Result<usize> {
                    let mut participant = ReshardCoordinator::new(
                        StageRole::pipeline(rank, num_stages),
                        comm,
                        adapter,
                        staging,
                        "",
                    );
                    let shard = participant.load(source, "", from)?;
                    participant.save(&shard, dest, "", to)?;
                    Ok(shard.len())
                })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle
                    .join()
                    .map_err(|_| anyhow!("participant {rank} panicked"))?
                    .with_context(|| format!("participant {rank}"))
            })
            .collect()
    })
}

/// Stage plan for `total_layers` over `num_stages`, one line per stage.
pub fn partition(total_layers: usize, num_stages: usize) -> anyhow::Result<Vec<String>> {
    let stages = PipelineStageConfig::all(total_layers, num_stages)?;
    Ok(stages
        .iter()
        .map(|stage| {
            let mut extras = Vec::new();
            if stage.is_first() {
                extras.push("embedding");
            }
            if stage.is_last() {
                extras.push("final norm + output");
            }
            let extras = if extras.is_empty() {
                String::new()
            } else {
                format!(" [{}]", extras.join(", "))
            };
            format!(
                "stage {}: layers {}..{} ({} layers){}",
                stage.stage_id,
                stage.layers.start,
                stage.layers.end,
                stage.num_layers(),
                extras
            )
        })
        .collect())
}

/// One canonical tensor of an inspected checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorSummary {
    pub key: CanonicalKey,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

/// Canonical keys, shapes and dtypes of the checkpoint under `source`.
pub fn inspect(
    source: &Path,
    convention: Convention,
    model: ModelConfig,
) -> anyhow::Result<Vec<TensorSummary>> {
    let adapter = CheckpointAdapter::new(model, Device::Cpu);
    let weights = adapter.read(&LocalStorage::new(source), "", convention)?;
    Ok(weights
        .iter()
        .map(|(key, tensor)| TensorSummary {
            key: *key,
            shape: tensor.dims().to_vec(),
            dtype: tensor.dtype(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeshard_core::testing::{random_weights, tiny_config};

    fn write_source(dir: &Path, model: &ModelConfig, convention: Convention) {
        let weights = random_weights(model, &Device::Cpu).unwrap();
        CheckpointAdapter::new(model.clone(), Device::Cpu)
            .write(&weights, &LocalStorage::new(dir), "", convention)
            .unwrap();
    }

    #[test]
    fn partition_marks_first_and_last_stage() {
        let lines = partition(32, 8).unwrap();
        assert_eq!(lines.len(), 8);
        assert_eq!(lines[0], "stage 0: layers 0..4 (4 layers) [embedding]");
        assert_eq!(lines[3], "stage 3: layers 12..16 (4 layers)");
        assert_eq!(lines[7], "stage 7: layers 28..32 (4 layers) [final norm + output]");
        assert!(partition(2, 3).is_err());
    }

    #[test]
    fn convert_then_inspect() {
        let model = tiny_config(2);
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write_source(src.path(), &model, Convention::Reference);

        let dest = LocalStorage::new(dst.path());
        let written = convert(ConvertArgs {
            source: src.path(),
            from: Convention::Reference,
            dest: &dest,
            to: Convention::Community,
            model: model.clone(),
            precision: Some(Precision::Fp16),
        })
        .unwrap();
        assert!(written.iter().any(|k| k == "model.safetensors.index.json"));

        let summary = inspect(dst.path(), Convention::Community, model).unwrap();
        assert_eq!(summary.len(), 3 + 2 * 9);
        assert!(summary.iter().all(|t| t.dtype == DType::F16));
    }

    #[test]
    fn dry_run_writes_nothing_to_disk() {
        let model = tiny_config(2);
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write_source(src.path(), &model, Convention::Native);

        let dest = open_storage(StorageProtocol::ObjectStore, dst.path());
        let written = convert(ConvertArgs {
            source: src.path(),
            from: Convention::Native,
            dest: dest.as_ref(),
            to: Convention::Reference,
            model,
            precision: None,
        })
        .unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(std::fs::read_dir(dst.path()).unwrap().count(), 0);
    }

    #[test]
    fn reshard_through_two_stages() {
        let model = tiny_config(4);
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        write_source(src.path(), &model, Convention::Community);

        let dest = LocalStorage::new(dst.path());
        let sizes = reshard(ReshardArgs {
            source: src.path(),
            from: Convention::Community,
            dest: &dest,
            to: Convention::Native,
            model: model.clone(),
            num_stages: 2,
            staging_dir: staging.path().to_path_buf(),
        })
        .unwrap();

        // Two blocks of seven tensors each, plus the embedding or the
        // final norm and output projection.
        assert_eq!(sizes, vec![15, 16]);
        assert_eq!(inspect(dst.path(), Convention::Native, model).unwrap().len(), 3 + 4 * 9);
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[test]
    fn model_shape_falls_back_to_source_config_json() {
        let dir = tempfile::tempdir().unwrap();
        let model = tiny_config(3);
        std::fs::write(
            dir.path().join("config.json"),
            serde_json::to_string(&model).unwrap(),
        )
        .unwrap();

        assert_eq!(
            resolve_model_config(None, None, Some(dir.path())).unwrap(),
            model
        );
        assert_eq!(
            resolve_model_config(None, Some("13b"), Some(dir.path())).unwrap(),
            ModelConfig::llama_13b()
        );
        assert!(resolve_model_config(None, None, None).is_err());
        assert!(resolve_model_config(None, Some("70b"), None).is_err());
    }

    #[test]
    fn zero_layer_model_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, serde_json::to_string(&tiny_config(0)).unwrap()).unwrap();

        let err = resolve_model_config(Some(&path), None, None).unwrap_err();
        assert!(err.to_string().contains("num_hidden_layers"), "{err}");
    }
}
