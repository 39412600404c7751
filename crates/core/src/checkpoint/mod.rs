//! Checkpoint conversion and pipeline resharding.
//!
//! A checkpoint is read from storage in one of three [`Convention`]s into
//! [`CanonicalWeights`], partitioned into per-stage native shards, and
//! distributed to pipeline participants by the [`ReshardCoordinator`].
//! Saving runs the same path backwards.

mod adapter;
mod convention;
mod coordinator;
mod error;
pub mod hf_index;
pub mod name_map;
pub mod shard;
mod staging;
mod weight_set;

pub use adapter::{decode, encode, CheckpointAdapter, NATIVE_FILE, REFERENCE_FILE};
pub use convention::Convention;
pub use coordinator::{ReshardCoordinator, ReshardState};
pub use error::{CheckpointError, FormatError, Result};
pub use name_map::{CanonicalKey, CanonicalName, FusionGroup, WeightRole};
pub use staging::StagingArea;
pub use weight_set::{tensors_equal, CanonicalWeights, WeightSet};
