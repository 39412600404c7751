use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("micro-batch out of order: expected {expected}, got {actual}")]
    MicroBatchOutOfOrder { expected: usize, actual: usize },

    #[error("{what} shape mismatch: expected {expected:?}, found {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("rotary range exceeded: need {needed} positions, table has {max}")]
    RotaryRangeExceeded { needed: usize, max: usize },

    #[error("block {block} has no cache (context holds {num_blocks})")]
    UnknownBlock { block: usize, num_blocks: usize },

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
