use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::FormatError;

pub const INDEX_FILE: &str = "model.safetensors.index.json";

/// Sidecar of a sharded community checkpoint: which file holds each weight.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HfIndex {
    #[serde(default)]
    pub metadata: IndexMetadata,
    pub weight_map: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Sum of tensor byte sizes over every file.
    #[serde(default)]
    pub total_size: u64,
}

impl HfIndex {
    pub fn parse(data: &[u8]) -> Result<Self, FormatError> {
        serde_json::from_slice(data).map_err(|e| FormatError::InvalidIndex(e.to_string()))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, FormatError> {
        serde_json::to_vec_pretty(self).map_err(|e| FormatError::InvalidIndex(e.to_string()))
    }

    /// Distinct file names in the weight map.
    pub fn files(&self) -> Vec<String> {
        let mut files: Vec<String> = self.weight_map.values().cloned().collect();
        files.sort();
        files.dedup();
        files
    }
}
