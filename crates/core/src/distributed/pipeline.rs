//! Pipeline layout: which layers each stage owns.
//!
//! ```text
//! Stage 0             Stage 1             Stage 2
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ embedding   │     │             │     │             │
//! │ Layers 0-10 │ --> │ Layers 11-21│ --> │ Layers 22-31│
//! │             │     │             │     │ norm, head  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! The partition is a pure function of `(total_layers, num_stages)`, so the
//! load side and the save side agree on it without coordination.

use std::fmt;
use std::ops::Range;

use candle_core::Tensor;

use crate::checkpoint::FormatError;

/// Half-open interval `[start, end)` of global layer indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerRange {
    pub start: usize,
    pub end: usize,
}

impl LayerRange {
    pub fn new(start: usize, end: usize) -> Self {
        assert!(start <= end, "layer range start must be <= end");
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, layer: usize) -> bool {
        (self.start..self.end).contains(&layer)
    }

    pub fn as_range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Map a global layer index to its stage-local block index.
    pub fn to_local(&self, layer: usize) -> Option<usize> {
        self.contains(layer).then(|| layer - self.start)
    }

    /// Map a stage-local block index back to the global layer index.
    pub fn to_global(&self, local: usize) -> Option<usize> {
        (local < self.len()).then(|| self.start + local)
    }
}

impl fmt::Display for LayerRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Uniform partition of `total_layers` over `num_stages`, remainder layers
/// going to the earliest stages.
pub fn partition_layers(
    total_layers: usize,
    num_stages: usize,
) -> Result<Vec<LayerRange>, FormatError> {
    if num_stages == 0 || total_layers < num_stages {
        return Err(FormatError::InvalidPartition {
            total_layers,
            num_stages,
        });
    }
    let base_layers = total_layers / num_stages;
    let extra = total_layers % num_stages;

    let mut ranges = Vec::with_capacity(num_stages);
    let mut start = 0;
    for stage_id in 0..num_stages {
        let len = if stage_id < extra {
            base_layers + 1
        } else {
            base_layers
        };
        ranges.push(LayerRange::new(start, start + len));
        start += len;
    }
    debug_assert_eq!(start, total_layers);
    Ok(ranges)
}

/// Pipeline stage configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStageConfig {
    /// Index of this stage (0..num_stages)
    pub stage_id: usize,
    /// Total number of pipeline stages
    pub num_stages: usize,
    /// Global layers owned by this stage
    pub layers: LayerRange,
    /// Total layers in the model
    pub total_layers: usize,
}

impl PipelineStageConfig {
    pub fn new(
        stage_id: usize,
        num_stages: usize,
        total_layers: usize,
    ) -> Result<Self, FormatError> {
        let ranges = partition_layers(total_layers, num_stages)?;
        let layers = *ranges.get(stage_id).ok_or(FormatError::InvalidStage {
            stage: stage_id,
            num_stages,
        })?;
        Ok(Self {
            stage_id,
            num_stages,
            layers,
            total_layers,
        })
    }

    /// All stages of a pipeline, in stage order.
    pub fn all(total_layers: usize, num_stages: usize) -> Result<Vec<Self>, FormatError> {
        Ok(partition_layers(total_layers, num_stages)?
            .into_iter()
            .enumerate()
            .map(|(stage_id, layers)| Self {
                stage_id,
                num_stages,
                layers,
                total_layers,
            })
            .collect())
    }

    /// Whether this stage holds the token embedding.
    pub fn is_first(&self) -> bool {
        self.layers.start == 0
    }

    /// Whether this stage holds the final norm and output projection.
    pub fn is_last(&self) -> bool {
        self.layers.end == self.total_layers
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

/// Split a batch into `num_microbatches` slices along dim 0.
pub fn split_microbatches(
    batch: &Tensor,
    num_microbatches: usize,
) -> candle_core::Result<Vec<Tensor>> {
    let batch_size = batch.dim(0)?;
    let microbatch_size = batch_size.div_ceil(num_microbatches);

    let mut microbatches = Vec::with_capacity(num_microbatches);
    let mut offset = 0;

    for _ in 0..num_microbatches {
        let size = microbatch_size.min(batch_size - offset);
        if size == 0 {
            break;
        }
        microbatches.push(batch.narrow(0, offset, size)?);
        offset += size;
    }

    Ok(microbatches)
}

/// Merge microbatches back into a single batch.
pub fn merge_microbatches(microbatches: &[Tensor]) -> candle_core::Result<Tensor> {
    if microbatches.is_empty() {
        return Err(candle_core::Error::Msg(
            "No microbatches to merge".to_string(),
        ));
    }
    Tensor::cat(microbatches, 0)
}
