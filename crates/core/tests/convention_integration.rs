//! Whole-checkpoint conversions between the three naming conventions.

use candle_core::{DType, Device};
use pipeshard_core::checkpoint::hf_index::{HfIndex, INDEX_FILE};
use pipeshard_core::checkpoint::{
    tensors_equal, CheckpointAdapter, CheckpointError, Convention, FormatError, WeightSet,
    NATIVE_FILE,
};
use pipeshard_core::config::Precision;
use pipeshard_core::storage::{LocalStorage, Storage};
use pipeshard_core::testing::{random_weights, tiny_config};

fn raw_file(storage: &dyn Storage, key: &str) -> WeightSet {
    WeightSet::from_safetensors(&storage.read(key).unwrap(), &Device::Cpu).unwrap()
}

#[test]
fn native_through_reference_reproduces_fused_tensors() {
    let config = tiny_config(3);
    let weights = random_weights(&config, &Device::Cpu).unwrap();
    let adapter = CheckpointAdapter::new(config, Device::Cpu);
    let dir = tempfile::tempdir().unwrap();
    let storage = LocalStorage::new(dir.path());

    adapter.write(&weights, &storage, "a", Convention::Native).unwrap();
    let first = raw_file(&storage, &format!("a/{NATIVE_FILE}"));

    let loaded = adapter.read(&storage, "a", Convention::Native).unwrap();
    adapter.write(&loaded, &storage, "b", Convention::Reference).unwrap();
    let reference = adapter.read(&storage, "b", Convention::Reference).unwrap();
    adapter.write(&reference, &storage, "c", Convention::Native).unwrap();
    let second = raw_file(&storage, &format!("c/{NATIVE_FILE}"));

    assert_eq!(first.len(), second.len());
    for (key, tensor) in first.iter() {
        assert!(tensors_equal(tensor, second.get(key).unwrap()).unwrap(), "{key}");
    }
    let wqkv = first.get("blocks.2.attention.wqkv.module.module.weight").unwrap();
    assert_eq!(wqkv.dims(), &[24, 8]);
}

#[test]
fn community_checkpoint_on_disk_has_index_and_rotary_buffers() {
    let config = tiny_config(2);
    let weights = random_weights(&config, &Device::Cpu).unwrap();
    let adapter = CheckpointAdapter::new(config, Device::Cpu);
    let dir = tempfile::tempdir().unwrap();
    let storage = LocalStorage::new(dir.path());

    adapter
        .write(&weights, &storage, "", Convention::Community)
        .unwrap();

    let index = HfIndex::parse(&storage.read(INDEX_FILE).unwrap()).unwrap();
    assert_eq!(
        index.files(),
        vec![
            "model-00001-of-00002.safetensors".to_string(),
            "model-00002-of-00002.safetensors".to_string()
        ]
    );
    assert_eq!(
        index.weight_map["model.embed_tokens.weight"],
        "model-00001-of-00002.safetensors"
    );
    assert_eq!(index.weight_map["lm_head.weight"], "model-00002-of-00002.safetensors");

    let second = raw_file(&storage, "model-00002-of-00002.safetensors");
    let inv_freq = second
        .get("model.layers.1.self_attn.rotary_emb.inv_freq")
        .unwrap();
    let values: Vec<f32> = inv_freq.to_vec1().unwrap();
    // head_dim 4: 1 / 10000^(0/4), 1 / 10000^(2/4)
    assert!((values[0] - 1.0).abs() < 1e-6);
    assert!((values[1] - 0.01).abs() < 1e-6);

    let back = adapter.read(&storage, "", Convention::Community).unwrap();
    assert!(back.same_as(&weights).unwrap());
}

#[test]
fn missing_layer_weight_names_the_source_key() {
    let config = tiny_config(2);
    let weights = random_weights(&config, &Device::Cpu).unwrap();
    let adapter = CheckpointAdapter::new(config, Device::Cpu);
    let dir = tempfile::tempdir().unwrap();
    let storage = LocalStorage::new(dir.path());
    adapter
        .write(&weights, &storage, "ckpt", Convention::Reference)
        .unwrap();

    let key = "ckpt/consolidated.00.safetensors";
    let mut raw = raw_file(&storage, key);
    raw.remove("layers.1.feed_forward.w3.weight").unwrap();
    storage.write(key, &raw.to_safetensors().unwrap()).unwrap();

    let err = adapter
        .read(&storage, "ckpt", Convention::Reference)
        .unwrap_err();
    match err {
        CheckpointError::Format(FormatError::MissingKey { key, convention }) => {
            assert_eq!(key, "layers.1.feed_forward.w3.weight");
            assert_eq!(convention, Convention::Reference);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn half_precision_load_casts_every_tensor() {
    let config = tiny_config(2);
    let weights = random_weights(&config, &Device::Cpu).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let storage = LocalStorage::new(dir.path());
    CheckpointAdapter::new(config.clone(), Device::Cpu)
        .write(&weights, &storage, "", Convention::Native)
        .unwrap();

    let adapter = CheckpointAdapter::new(config, Device::Cpu).with_precision(Precision::Bf16);
    let loaded = adapter.read(&storage, "", Convention::Native).unwrap();
    assert!(loaded.iter().all(|(_, t)| t.dtype() == DType::BF16));

    let embedding = loaded
        .get_role(pipeshard_core::checkpoint::WeightRole::Embedding, None)
        .unwrap()
        .to_dtype(DType::F32)
        .unwrap();
    let original = weights
        .get_role(pipeshard_core::checkpoint::WeightRole::Embedding, None)
        .unwrap();
    let diff: f32 = (embedding - original)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar()
        .unwrap();
    assert!(diff < 0.05);
}
