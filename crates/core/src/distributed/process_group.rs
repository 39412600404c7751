//! Process group abstractions for pipeline-parallel checkpointing.
//!
//! A process group represents the set of participants that take part in a
//! checkpoint load or save. Each participant serves exactly one pipeline stage;
//! with data parallelism several participants serve the same stage.

/// Trait for process group queries.
pub trait ProcessGroup: Send + Sync {
    /// Global rank of this process (0..world_size).
    fn rank(&self) -> usize;

    /// Total number of processes in the group.
    fn world_size(&self) -> usize;

    /// Whether this is the coordinator (rank 0).
    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Whether this is a single-process group.
    fn is_single(&self) -> bool {
        self.world_size() == 1
    }
}

/// Local process group with a fixed rank and world size.
#[derive(Debug, Clone)]
pub struct LocalProcessGroup {
    rank: usize,
    world_size: usize,
}

impl LocalProcessGroup {
    /// Single-process group (rank 0 of 1).
    pub fn new() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// Create a local process group with specific rank/size.
    pub fn with_rank(rank: usize, world_size: usize) -> Self {
        assert!(rank < world_size, "rank must be < world_size");
        Self { rank, world_size }
    }
}

impl Default for LocalProcessGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }
}

/// What one participant does during a checkpoint operation.
///
/// The coordinator flag is explicit rather than derived from a global rank so
/// that callers decide which process owns remote I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageRole {
    /// Pipeline stage this participant serves.
    pub stage_index: usize,
    /// Total number of pipeline stages.
    pub num_stages: usize,
    /// Whether this participant performs bulk I/O and staging cleanup.
    pub is_coordinator: bool,
    /// Whether this participant writes its stage shard on save. With data
    /// parallelism exactly one replica per stage should write.
    pub writes_shard: bool,
}

impl StageRole {
    /// Role for a participant in a pure pipeline layout (one rank per stage).
    ///
    /// Rank 0 coordinates and every rank writes its shard.
    pub fn pipeline(stage_index: usize, num_stages: usize) -> Self {
        assert!(num_stages > 0, "num_stages must be > 0");
        assert!(stage_index < num_stages, "stage_index must be < num_stages");
        Self {
            stage_index,
            num_stages,
            is_coordinator: stage_index == 0,
            writes_shard: true,
        }
    }

    /// Role derived from a process group laid out stage-major:
    /// `rank = dp_index * num_stages + stage_index`. `coordinator_rank`
    /// performs the bulk I/O.
    pub fn from_group(
        group: &dyn ProcessGroup,
        num_stages: usize,
        coordinator_rank: usize,
    ) -> Self {
        assert!(num_stages > 0, "num_stages must be > 0");
        assert!(
            group.world_size() % num_stages == 0,
            "world_size must be a multiple of num_stages"
        );
        let rank = group.rank();
        Self {
            stage_index: rank % num_stages,
            num_stages,
            is_coordinator: rank == coordinator_rank,
            writes_shard: rank < num_stages,
        }
    }

    pub fn is_first_stage(&self) -> bool {
        self.stage_index == 0
    }

    pub fn is_last_stage(&self) -> bool {
        self.stage_index + 1 == self.num_stages
    }
}
