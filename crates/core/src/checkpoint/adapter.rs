//! Reading and writing whole-model checkpoints in any convention.

use std::collections::btree_map::{BTreeMap, Entry};

use candle_core::{DType, Device, Tensor};
use tracing::{debug, info, warn};

use super::convention::Convention;
use super::error::{FormatError, Result};
use super::hf_index::{HfIndex, INDEX_FILE};
use super::name_map::{
    self, CanonicalKey, CanonicalName, FusionGroup, TpAxis, WeightRole,
};
use super::weight_set::{CanonicalWeights, WeightSet};
use crate::config::{ModelConfig, Precision};
use crate::loader;
use crate::storage::{self, Storage};

/// Single-file layout of a native checkpoint.
pub const NATIVE_FILE: &str = "model.safetensors";
/// Single-file layout of a reference checkpoint.
pub const REFERENCE_FILE: &str = "consolidated.00.safetensors";

/// Converts checkpoints between storage and canonical form.
#[derive(Debug, Clone)]
pub struct CheckpointAdapter {
    config: ModelConfig,
    device: Device,
    dtype: Option<DType>,
}

impl CheckpointAdapter {
    pub fn new(config: ModelConfig, device: Device) -> Self {
        Self {
            config,
            device,
            dtype: None,
        }
    }

    /// Cast weights to `precision` when reading.
    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.dtype = Some(precision.dtype());
        self
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> Option<DType> {
        self.dtype
    }

    /// Read the checkpoint stored under `prefix` in `convention`.
    pub fn read(
        &self,
        storage: &dyn Storage,
        prefix: &str,
        convention: Convention,
    ) -> Result<CanonicalWeights> {
        self.config.validate()?;
        let files = loader::discover_sources(storage, prefix, convention)?;
        info!(
            location = %storage.describe(prefix),
            %convention,
            files = files.len(),
            "reading checkpoint"
        );

        let raw = self.read_raw(storage, &files, convention)?;
        let expected = name_map::all_keys(self.config.num_hidden_layers);
        let weights = decode(raw, convention, &self.config, &expected)?;

        match self.dtype {
            Some(dtype) => weights.to_dtype(dtype),
            None => Ok(weights),
        }
    }

    /// Load every file, dropping derived tensors. Reference checkpoints
    /// split over tensor-parallel files are merged in file order.
    fn read_raw(
        &self,
        storage: &dyn Storage,
        files: &[String],
        convention: Convention,
    ) -> Result<WeightSet> {
        let mut parts: BTreeMap<String, (TpAxis, Vec<Tensor>)> = BTreeMap::new();

        for file in files {
            let tensors = loader::read_tensor_file(storage, file, &self.device)?;
            debug!(file = %file, tensors = tensors.len(), "loaded checkpoint file");

            for (key, tensor) in tensors {
                let tp_axis = match name_map::to_canonical(&key, convention)? {
                    CanonicalName::Derived { .. } => continue,
                    CanonicalName::Single(k) => k.spec().tp_axis,
                    CanonicalName::Fused { .. } => TpAxis::Concat(0),
                };
                match parts.entry(key) {
                    Entry::Vacant(slot) => {
                        slot.insert((tp_axis, vec![tensor]));
                    }
                    Entry::Occupied(mut slot) => {
                        if convention != Convention::Reference {
                            return Err(FormatError::DuplicateKey {
                                key: slot.key().clone(),
                            }
                            .into());
                        }
                        slot.get_mut().1.push(tensor);
                    }
                }
            }
        }

        parts
            .into_iter()
            .map(|(key, (axis, mut tensors))| {
                let tensor = match axis {
                    _ if tensors.len() == 1 => tensors.remove(0),
                    TpAxis::Replicated => tensors.remove(0),
                    TpAxis::Concat(dim) => Tensor::cat(&tensors, dim)?,
                };
                Ok((key, tensor))
            })
            .collect()
    }

    /// Write `weights` under `prefix` in `convention`. Returns the written keys.
    ///
    /// On failure every file this call already wrote is deleted again, so the
    /// destination never holds a partial checkpoint.
    pub fn write(
        &self,
        weights: &CanonicalWeights,
        storage: &dyn Storage,
        prefix: &str,
        convention: Convention,
    ) -> Result<Vec<String>> {
        self.config.validate()?;
        let expected = name_map::all_keys(self.config.num_hidden_layers);
        for key in &expected {
            if weights.get(key).is_none() {
                return Err(FormatError::MissingKey {
                    key: name_map::storage_key(key, convention),
                    convention,
                }
                .into());
            }
        }

        let encoded = encode(weights, convention, &self.config)?;
        let files = match convention {
            Convention::Native => vec![(NATIVE_FILE.to_string(), encoded)],
            Convention::Reference => vec![(REFERENCE_FILE.to_string(), encoded)],
            Convention::Community => self.community_files(encoded)?,
        };

        let mut written = Vec::with_capacity(files.len() + 1);
        match write_files(&files, storage, prefix, convention, &mut written) {
            Ok(total_bytes) => {
                info!(
                    location = %storage.describe(prefix),
                    %convention,
                    files = written.len(),
                    total_bytes,
                    "wrote checkpoint"
                );
                Ok(written)
            }
            Err(e) => {
                for key in &written {
                    if let Err(cleanup) = storage.delete_prefix(key) {
                        warn!(
                            file = %key,
                            error = %cleanup,
                            "could not remove partial checkpoint file"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// One file per layer; the first also holds the embedding, the last the
    /// final norm and output projection. Each layer carries its rotary
    /// inverse frequencies.
    fn community_files(&self, encoded: WeightSet) -> Result<Vec<(String, WeightSet)>> {
        let num_layers = self.config.num_hidden_layers;
        let mut files: Vec<WeightSet> = (0..num_layers).map(|_| WeightSet::new()).collect();
        let inv_freq = name_map::rotary_inv_freq(&self.config, &self.device)?;

        for (key, tensor) in encoded {
            let file = match name_map::to_canonical(&key, Convention::Community)? {
                CanonicalName::Single(CanonicalKey {
                    layer: Some(layer), ..
                }) => layer,
                CanonicalName::Single(CanonicalKey {
                    role: WeightRole::Embedding,
                    ..
                }) => 0,
                _ => num_layers.saturating_sub(1),
            };
            files[file].insert(key, tensor);
        }
        for (layer, set) in files.iter_mut().enumerate() {
            let derived = CanonicalName::Derived { layer };
            if let Some(key) = name_map::from_canonical(&derived, Convention::Community) {
                set.insert(key, inv_freq.clone());
            }
        }

        Ok(files
            .into_iter()
            .enumerate()
            .map(|(layer, set)| {
                (
                    format!("model-{:05}-of-{:05}.safetensors", layer + 1, num_layers),
                    set,
                )
            })
            .collect())
    }
}

/// Write each file and, for the community layout, the index after them.
/// Pushes every key as soon as it is written; returns the total tensor bytes.
fn write_files(
    files: &[(String, WeightSet)],
    storage: &dyn Storage,
    prefix: &str,
    convention: Convention,
    written: &mut Vec<String>,
) -> Result<u64> {
    let mut index = HfIndex::default();
    for (name, set) in files {
        let key = storage::join_key(prefix, name);
        storage.write(&key, &set.to_safetensors()?)?;
        written.push(key.clone());
        debug!(file = %key, tensors = set.len(), "wrote checkpoint file");
        index.metadata.total_size += set.total_bytes() as u64;
        index
            .weight_map
            .extend(set.keys().map(|k| (k.to_string(), name.clone())));
    }

    if convention == Convention::Community {
        let key = storage::join_key(prefix, INDEX_FILE);
        storage.write(&key, &index.to_json()?)?;
        written.push(key);
    }
    Ok(index.metadata.total_size)
}

/// Canonicalize a convention-specific weight set.
///
/// Exactly the `expected` keys must be present (fused tensors count for all
/// their members); anything left over is unrecognized. Shapes are checked
/// against `config`.
pub fn decode(
    mut raw: WeightSet,
    convention: Convention,
    config: &ModelConfig,
    expected: &[CanonicalKey],
) -> Result<CanonicalWeights> {
    let mut out = CanonicalWeights::new();

    for key in expected {
        if out.get(key).is_some() {
            continue;
        }
        let spec = key.spec();
        let stored = name_map::storage_key(key, convention);

        match (spec.template(convention), spec.fusion, key.layer) {
            (None, Some(group), Some(layer)) => {
                let fused = take(&mut raw, &stored, convention)?;
                check_shape(&stored, &fused, fused_shape(group, config))?;
                let members = name_map::split_fused(group, &stored, &fused)?;
                for (role, tensor) in group.members().iter().zip(members) {
                    out.insert(CanonicalKey::layer(*role, layer), tensor);
                }
            }
            _ => {
                let tensor = take(&mut raw, &stored, convention)?;
                check_shape(&stored, &tensor, name_map::expected_shape(key.role, config))?;
                let tensor = if convention == Convention::Reference && spec.rotary_interleaved {
                    name_map::deinterleave_rotary(&tensor, config.num_attention_heads)?
                } else {
                    tensor
                };
                out.insert(*key, tensor);
            }
        }
    }

    for key in raw.keys() {
        if !matches!(
            name_map::to_canonical(key, convention),
            Ok(CanonicalName::Derived { .. })
        ) {
            return Err(FormatError::UnrecognizedKey {
                key: key.to_string(),
                convention,
            }
            .into());
        }
    }
    Ok(out)
}

/// Lay canonical weights out in `convention`. Layer indices are used as given.
pub fn encode(
    weights: &CanonicalWeights,
    convention: Convention,
    config: &ModelConfig,
) -> Result<WeightSet> {
    let mut out = WeightSet::new();
    let mut fused: BTreeMap<(FusionGroup, usize), Vec<(WeightRole, Tensor)>> = BTreeMap::new();

    for (key, tensor) in weights.iter() {
        let spec = key.spec();
        match (spec.template(convention), spec.fusion, key.layer) {
            (None, Some(group), Some(layer)) => {
                fused
                    .entry((group, layer))
                    .or_default()
                    .push((key.role, tensor.clone()));
            }
            _ => {
                let tensor = if convention == Convention::Reference && spec.rotary_interleaved {
                    name_map::interleave_rotary(tensor, config.num_attention_heads)?
                } else {
                    tensor.clone()
                };
                out.insert(name_map::storage_key(key, convention), tensor);
            }
        }
    }

    for ((group, layer), members) in fused {
        let name = CanonicalName::Fused { group, layer };
        let fused_key = name_map::from_canonical(&name, convention)
            .unwrap_or_else(|| unreachable!("fused members only exist without a template"));
        let ordered = group
            .members()
            .iter()
            .map(|role| {
                members
                    .iter()
                    .find(|(r, _)| r == role)
                    .map(|(_, t)| t.clone())
                    .ok_or_else(|| FormatError::MissingKey {
                        key: fused_key.clone(),
                        convention,
                    })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        out.insert(fused_key, name_map::fuse(&ordered)?);
    }
    Ok(out)
}

fn take(raw: &mut WeightSet, key: &str, convention: Convention) -> Result<Tensor> {
    raw.remove(key).ok_or_else(|| {
        FormatError::MissingKey {
            key: key.to_string(),
            convention,
        }
        .into()
    })
}

fn fused_shape(group: FusionGroup, config: &ModelConfig) -> Vec<usize> {
    let mut shape = name_map::expected_shape(group.members()[0], config);
    shape[0] *= group.members().len();
    shape
}

fn check_shape(key: &str, tensor: &Tensor, expected: Vec<usize>) -> Result<()> {
    if tensor.dims() != expected.as_slice() {
        return Err(FormatError::ShapeMismatch {
            key: key.to_string(),
            expected,
            actual: tensor.dims().to_vec(),
        }
        .into());
    }
    Ok(())
}
