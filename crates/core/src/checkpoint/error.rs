use thiserror::Error;

use super::convention::Convention;
use crate::distributed::DistributedError;
use crate::storage::StorageError;

/// The checkpoint content or the requested layout is invalid.
#[derive(Error, Debug, PartialEq)]
pub enum FormatError {
    #[error("missing {convention} weight: {key}")]
    MissingKey { key: String, convention: Convention },

    #[error("shape mismatch for {key}: expected {expected:?}, found {actual:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("weight {key} appears more than once in the source checkpoint")]
    DuplicateKey { key: String },

    #[error("unrecognized {convention} weight: {key}")]
    UnrecognizedKey { key: String, convention: Convention },

    #[error("unknown {kind}: {token}")]
    UnknownToken { kind: &'static str, token: String },

    #[error("cannot partition {total_layers} layers over {num_stages} stages")]
    InvalidPartition {
        total_layers: usize,
        num_stages: usize,
    },

    #[error("stage {stage} out of range for {num_stages} stages")]
    InvalidStage { stage: usize, num_stages: usize },

    #[error("invalid staging identifier: {0}")]
    InvalidStagingId(String),

    #[error("staging area already exists: {0}")]
    StagingExists(String),

    #[error("no checkpoint files found at {0}")]
    NoSourceFiles(String),

    #[error("invalid checkpoint index: {0}")]
    InvalidIndex(String),

    #[error("invalid model config: {0}")]
    InvalidModelConfig(String),
}

/// Top-level error of checkpoint conversion and resharding.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint format error: {0}")]
    Format(#[from] FormatError),

    #[error("collective error: {0}")]
    Collective(#[from] DistributedError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),
}

pub type Result<T> = std::result::Result<T, CheckpointError>;
