//! Error types for collective operations.

use thiserror::Error;

/// Errors that can occur while participants synchronize.
///
/// Every variant is fatal for the operation in progress: a participant that
/// misses a collective leaves the whole group without a consistent view.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Rank is out of valid range for the process group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// A participant did not reach the collective in time.
    #[error("{op} timed out after {timeout_ms}ms")]
    Timeout { op: &'static str, timeout_ms: u64 },

    /// Participants disagree on which collective is running.
    #[error("collective desync: expected {expected}, got {actual}")]
    Desync { expected: String, actual: String },

    /// The source rank did not provide a payload to broadcast.
    #[error("broadcast from rank {src_rank} carried no payload")]
    EmptyBroadcast { src_rank: usize },

    /// The participant's coordinator flag disagrees with its rank.
    #[error(
        "rank {rank} has is_coordinator={is_coordinator} but the coordinator is rank {coordinator_rank}"
    )]
    CoordinatorMismatch {
        rank: usize,
        coordinator_rank: usize,
        is_coordinator: bool,
    },

    /// Another participant failed and poisoned the shared state.
    #[error("peer participant failed: {0}")]
    PeerFailed(String),
}

pub type Result<T> = std::result::Result<T, DistributedError>;
