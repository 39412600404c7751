//! Distributed abstractions for pipeline-parallel checkpointing.
//!
//! This module provides:
//! - [`ProcessGroup`] / [`StageRole`] - who a participant is and what it does
//! - [`Communicator`] - the broadcast and barrier collectives
//! - [`partition_layers`] / [`PipelineStageConfig`] - layer-to-stage layout
//!
//! # Usage
//!
//! ```ignore
//! use pipeshard_core::distributed::{MockCommunicator, ProcessGroup};
//!
//! // Single-process setup (world_size = 1)
//! let comm = MockCommunicator::single();
//! assert_eq!(comm.process_group().world_size(), 1);
//! ```

mod communicator;
mod error;
mod pipeline;
mod process_group;

pub use communicator::{broadcast_string, Communicator, MockCommunicator, ThreadCommunicator};
pub use error::DistributedError;
pub use pipeline::{
    merge_microbatches, partition_layers, split_microbatches, LayerRange, PipelineStageConfig,
};
pub use process_group::{LocalProcessGroup, ProcessGroup, StageRole};
