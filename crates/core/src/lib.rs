//! Pipeline-parallel LLaMA checkpoints and micro-batch attention caching.
//!
//! - [`checkpoint`] converts whole-model weights between naming conventions
//!   and reshards them into per-stage shards through a staging area.
//! - [`kv_cache`] keeps per-block, per-micro-batch key/value caches with
//!   contiguous rotary offsets.
//! - [`model`] runs one pipeline stage from its shard.

pub mod checkpoint;
pub mod config;
pub mod distributed;
pub mod kv_cache;
pub mod layers;
pub mod loader;
pub mod model;
pub mod storage;
pub mod testing;

pub use checkpoint::{CheckpointAdapter, CheckpointError, Convention, ReshardCoordinator};
pub use config::{ModelConfig, PipelineConfig, Precision};
pub use distributed::{PipelineStageConfig, StageRole};
pub use kv_cache::CacheContext;
pub use model::Transformer;
