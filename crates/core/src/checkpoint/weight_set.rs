use std::collections::btree_map::{self, BTreeMap};

use candle_core::{DType, Device, Tensor};

use super::convention::Convention;
use super::error::{FormatError, Result};
use super::name_map::{CanonicalKey, WeightRole};

/// Named tensors in one convention: a whole model or one stage shard.
#[derive(Debug, Clone, Default)]
pub struct WeightSet {
    tensors: BTreeMap<String, Tensor>,
}

impl WeightSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    /// Insert a tensor, returning the previous one under the same key.
    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(key.into(), tensor)
    }

    pub fn remove(&mut self, key: &str) -> Option<Tensor> {
        self.tensors.remove(key)
    }

    /// Tensor under `key`, or `MissingKey` naming it in `convention`.
    pub fn require(&self, key: &str, convention: Convention) -> Result<&Tensor> {
        self.tensors.get(key).ok_or_else(|| {
            FormatError::MissingKey {
                key: key.to_string(),
                convention,
            }
            .into()
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Total byte size of all tensors.
    pub fn total_bytes(&self) -> usize {
        self.tensors
            .values()
            .map(|t| t.elem_count() * t.dtype().size_in_bytes())
            .sum()
    }

    /// Serialize to the safetensors format.
    pub fn to_safetensors(&self) -> Result<Vec<u8>> {
        let contiguous = self
            .tensors
            .iter()
            .map(|(k, t)| Ok((k.as_str(), t.contiguous()?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(safetensors::serialize(contiguous, &None)?)
    }

    /// Parse a safetensors buffer.
    pub fn from_safetensors(data: &[u8], device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load_buffer(data, device)?;
        Ok(Self {
            tensors: tensors.into_iter().collect(),
        })
    }

    /// Cast every floating-point tensor to `dtype`.
    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        let tensors = self
            .tensors
            .iter()
            .map(|(k, t)| Ok((k.clone(), cast(t, dtype)?)))
            .collect::<Result<_>>()?;
        Ok(Self { tensors })
    }
}

impl IntoIterator for WeightSet {
    type Item = (String, Tensor);
    type IntoIter = btree_map::IntoIter<String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.into_iter()
    }
}

impl FromIterator<(String, Tensor)> for WeightSet {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

fn cast(tensor: &Tensor, dtype: DType) -> candle_core::Result<Tensor> {
    if tensor.dtype().is_float() && tensor.dtype() != dtype {
        tensor.to_dtype(dtype)
    } else {
        Ok(tensor.clone())
    }
}

/// A whole model in canonical form: global layer indices, q/k/v separate,
/// half-split rotary layout.
#[derive(Debug, Clone, Default)]
pub struct CanonicalWeights {
    tensors: BTreeMap<CanonicalKey, Tensor>,
}

impl CanonicalWeights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, key: &CanonicalKey) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    pub fn get_role(&self, role: WeightRole, layer: Option<usize>) -> Option<&Tensor> {
        self.tensors.get(&CanonicalKey { role, layer })
    }

    pub fn insert(&mut self, key: CanonicalKey, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(key, tensor)
    }

    pub fn remove(&mut self, key: &CanonicalKey) -> Option<Tensor> {
        self.tensors.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &CanonicalKey> {
        self.tensors.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CanonicalKey, &Tensor)> {
        self.tensors.iter()
    }

    /// Number of layers, one past the highest layer index present.
    pub fn num_layers(&self) -> usize {
        self.tensors
            .keys()
            .filter_map(|k| k.layer)
            .max()
            .map_or(0, |l| l + 1)
    }

    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        let tensors = self
            .tensors
            .iter()
            .map(|(k, t)| Ok((*k, cast(t, dtype)?)))
            .collect::<Result<_>>()?;
        Ok(Self { tensors })
    }

    /// Bitwise equality of keys, shapes, dtypes and values.
    pub fn same_as(&self, other: &Self) -> Result<bool> {
        if self.tensors.len() != other.tensors.len() {
            return Ok(false);
        }
        for (key, a) in &self.tensors {
            let Some(b) = other.tensors.get(key) else {
                return Ok(false);
            };
            if !tensors_equal(a, b)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl IntoIterator for CanonicalWeights {
    type Item = (CanonicalKey, Tensor);
    type IntoIter = btree_map::IntoIter<CanonicalKey, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.into_iter()
    }
}

impl FromIterator<(CanonicalKey, Tensor)> for CanonicalWeights {
    fn from_iter<I: IntoIterator<Item = (CanonicalKey, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

/// Exact equality: same shape, same dtype, identical values.
pub fn tensors_equal(a: &Tensor, b: &Tensor) -> candle_core::Result<bool> {
    if a.dims() != b.dims() || a.dtype() != b.dtype() {
        return Ok(false);
    }
    if a.elem_count() == 0 {
        return Ok(true);
    }
    let eq = a.eq(b)?.to_dtype(DType::U32)?.sum_all()?.to_scalar::<u32>()?;
    Ok(eq as usize == a.elem_count())
}
