//! Load and save of a pipeline-partitioned model through a staging area.
//!
//! Only the coordinator touches the checkpoint itself. Bulk data moves
//! through per-stage shard files; the collectives carry nothing but the
//! staging identifier and barriers.
//!
//! ```text
//! load:  coordinator: read -> partition -> write N shards
//!        all:         broadcast(staging id) -> read own shard -> barrier
//!        coordinator: remove staging
//!
//! save:  coordinator: create staging;  all: broadcast(staging id)
//!        writers:     write own shard -> barrier
//!        coordinator: merge shards -> write checkpoint -> remove staging
//!        all:         barrier
//! ```

use std::fmt;

use tracing::{info, warn};

use super::adapter::CheckpointAdapter;
use super::convention::Convention;
use super::error::{FormatError, Result};
use super::shard::{decode_shard, merge_shards, read_shard, split_into_stages, write_shard};
use super::staging::StagingArea;
use super::weight_set::WeightSet;
use crate::distributed::{
    broadcast_string, Communicator, DistributedError, PipelineStageConfig, StageRole,
};
use crate::storage::Storage;

/// Progress of one load or save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReshardState {
    Idle,
    StagingCreated,
    ShardsWritten,
    ShardsDistributed,
    Done,
    Failed,
}

impl fmt::Display for ReshardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Runs checkpoint load/save for one participant.
///
/// Every participant of the group constructs its own coordinator with its
/// own [`StageRole`] and calls the same operation; the operations block on
/// the group's collectives.
pub struct ReshardCoordinator<'a> {
    role: StageRole,
    comm: &'a dyn Communicator,
    adapter: CheckpointAdapter,
    staging: &'a dyn Storage,
    staging_base: String,
    coordinator_rank: usize,
    state: ReshardState,
}

impl<'a> ReshardCoordinator<'a> {
    /// `staging` must be reachable by every participant; areas are created
    /// under `staging_base` in it.
    pub fn new(
        role: StageRole,
        comm: &'a dyn Communicator,
        adapter: CheckpointAdapter,
        staging: &'a dyn Storage,
        staging_base: impl Into<String>,
    ) -> Self {
        Self {
            role,
            comm,
            adapter,
            staging,
            staging_base: staging_base.into(),
            coordinator_rank: 0,
            state: ReshardState::Idle,
        }
    }

    /// Rank the coordinator runs on; defaults to 0.
    pub fn with_coordinator_rank(mut self, rank: usize) -> Self {
        self.coordinator_rank = rank;
        self
    }

    pub fn state(&self) -> ReshardState {
        self.state
    }

    pub fn role(&self) -> &StageRole {
        &self.role
    }

    /// This participant's stage layout.
    /// The role's coordinator flag must agree with the rank the group
    /// broadcasts from; checked before any collective runs.
    fn check_role(&self) -> Result<()> {
        let rank = self.comm.process_group().rank();
        if self.role.is_coordinator != (rank == self.coordinator_rank) {
            return Err(DistributedError::CoordinatorMismatch {
                rank,
                coordinator_rank: self.coordinator_rank,
                is_coordinator: self.role.is_coordinator,
            }
            .into());
        }
        Ok(())
    }

    pub fn stage(&self) -> Result<PipelineStageConfig> {
        Ok(PipelineStageConfig::new(
            self.role.stage_index,
            self.role.num_stages,
            self.adapter.config().num_hidden_layers,
        )?)
    }

    /// Load the checkpoint under `prefix` and return this participant's
    /// stage shard (native keys, stage-local block indices).
    pub fn load(
        &mut self,
        source: &dyn Storage,
        prefix: &str,
        convention: Convention,
    ) -> Result<WeightSet> {
        self.state = ReshardState::Idle;
        let mut created = None;
        let result = self.run_load(source, prefix, convention, &mut created);
        self.finish(result, created)
    }

    fn run_load(
        &mut self,
        source: &dyn Storage,
        prefix: &str,
        convention: Convention,
        created: &mut Option<StagingArea>,
    ) -> Result<WeightSet> {
        self.check_role()?;
        let config = self.adapter.config().clone();
        let stages = PipelineStageConfig::all(config.num_hidden_layers, self.role.num_stages)?;
        let stage = stages
            .get(self.role.stage_index)
            .cloned()
            .ok_or(FormatError::InvalidStage {
                stage: self.role.stage_index,
                num_stages: self.role.num_stages,
            })?;

        let staging_id = if self.role.is_coordinator {
            let weights = self.adapter.read(source, prefix, convention)?;
            let area = StagingArea::create(self.staging, &self.staging_base)?;
            let id = area.id().to_string();
            *created = Some(area.clone());
            self.state = ReshardState::StagingCreated;

            let shards = split_into_stages(&weights, &stages, &config)?;
            for (stage, shard) in stages.iter().zip(&shards) {
                write_shard(self.staging, &area, stage.stage_id, shard)?;
                info!(
                    stage = stage.stage_id,
                    start = stage.layers.start,
                    end = stage.layers.end,
                    "staged shard"
                );
            }
            self.state = ReshardState::ShardsWritten;
            Some(id)
        } else {
            None
        };

        let id = broadcast_string(self.comm, staging_id.as_deref(), self.coordinator_rank)?;
        let area = StagingArea::from_identifier(&id)?;

        let shard = read_shard(self.staging, &area, self.role.stage_index, self.adapter.device())?;
        decode_shard(shard.clone(), &stage, &config)?;
        self.state = ReshardState::ShardsDistributed;

        self.comm.barrier()?;
        if self.role.is_coordinator {
            area.remove(self.staging)?;
            *created = None;
        }
        info!(
            stage = stage.stage_id,
            layers = %stage.layers,
            tensors = shard.len(),
            "loaded stage shard"
        );
        Ok(shard)
    }

    /// Save the model whose stage shard this participant holds to `prefix`
    /// in `convention`.
    pub fn save(
        &mut self,
        shard: &WeightSet,
        dest: &dyn Storage,
        prefix: &str,
        convention: Convention,
    ) -> Result<()> {
        self.state = ReshardState::Idle;
        let mut created = None;
        let result = self.run_save(shard, dest, prefix, convention, &mut created);
        self.finish(result, created)
    }

    fn run_save(
        &mut self,
        shard: &WeightSet,
        dest: &dyn Storage,
        prefix: &str,
        convention: Convention,
        created: &mut Option<StagingArea>,
    ) -> Result<()> {
        self.check_role()?;
        let config = self.adapter.config().clone();
        let stages = PipelineStageConfig::all(config.num_hidden_layers, self.role.num_stages)?;

        let staging_id = if self.role.is_coordinator {
            let area = StagingArea::create(self.staging, &self.staging_base)?;
            let id = area.id().to_string();
            *created = Some(area);
            self.state = ReshardState::StagingCreated;
            Some(id)
        } else {
            None
        };

        let id = broadcast_string(self.comm, staging_id.as_deref(), self.coordinator_rank)?;
        let area = StagingArea::from_identifier(&id)?;

        if self.role.writes_shard {
            let stage = stages
                .get(self.role.stage_index)
                .ok_or(FormatError::InvalidStage {
                    stage: self.role.stage_index,
                    num_stages: self.role.num_stages,
                })?;
            decode_shard(shard.clone(), stage, &config)?;
            write_shard(self.staging, &area, stage.stage_id, shard)?;
        }
        self.comm.barrier()?;
        self.state = ReshardState::ShardsWritten;

        if self.role.is_coordinator {
            let device = self.adapter.device().clone();
            let shards = stages
                .iter()
                .map(|stage| {
                    let shard = read_shard(self.staging, &area, stage.stage_id, &device)?;
                    Ok((stage.clone(), shard))
                })
                .collect::<Result<Vec<_>>>()?;
            let merged = merge_shards(shards, &config)?;
            self.state = ReshardState::ShardsDistributed;

            self.adapter.write(&merged, dest, prefix, convention)?;
            area.remove(self.staging)?;
            *created = None;
            info!(
                location = %dest.describe(prefix),
                %convention,
                stages = stages.len(),
                "saved checkpoint"
            );
        }

        self.comm.barrier()?;
        Ok(())
    }

    fn finish<T>(&mut self, result: Result<T>, created: Option<StagingArea>) -> Result<T> {
        match result {
            Ok(value) => {
                self.state = ReshardState::Done;
                Ok(value)
            }
            Err(e) => {
                warn!(
                    stage = self.role.stage_index,
                    state = %self.state,
                    error = %e,
                    "checkpoint operation failed"
                );
                self.state = ReshardState::Failed;
                // Stale areas are never resumed.
                if let Some(area) = created {
                    if let Err(cleanup) = area.remove(self.staging) {
                        warn!(
                            staging = area.id(),
                            error = %cleanup,
                            "could not remove staging area"
                        );
                    }
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointError;
    use crate::distributed::{LocalProcessGroup, MockCommunicator};
    use crate::storage::LocalStorage;
    use crate::testing::{random_weights, tiny_config};
    use candle_core::Device;

    #[test]
    fn single_participant_load_then_save() {
        let config = tiny_config(2);
        let weights = random_weights(&config, &Device::Cpu).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let adapter = CheckpointAdapter::new(config, Device::Cpu);
        adapter
            .write(&weights, &storage, "src", Convention::Community)
            .unwrap();

        let comm = MockCommunicator::single();
        let mut coordinator = ReshardCoordinator::new(
            StageRole::pipeline(0, 1),
            &comm,
            adapter.clone(),
            &storage,
            "staging",
        );
        assert_eq!(coordinator.state(), ReshardState::Idle);

        let shard = coordinator
            .load(&storage, "src", Convention::Community)
            .unwrap();
        assert_eq!(coordinator.state(), ReshardState::Done);
        assert!(shard.contains("blocks.1.attention.wqkv.module.module.weight"));
        // Staging is gone after the load.
        let leftover = std::fs::read_dir(dir.path().join("staging")).unwrap().count();
        assert_eq!(leftover, 0);

        coordinator
            .save(&shard, &storage, "out", Convention::Reference)
            .unwrap();
        assert_eq!(coordinator.state(), ReshardState::Done);
        let back = adapter.read(&storage, "out", Convention::Reference).unwrap();
        assert!(back.same_as(&weights).unwrap());
    }

    #[test]
    fn failed_load_marks_state_and_cleans_staging() {
        let config = tiny_config(2);
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        storage.write("src/readme.txt", b"no weights here").unwrap();

        let comm = MockCommunicator::single();
        let mut coordinator = ReshardCoordinator::new(
            StageRole::pipeline(0, 1),
            &comm,
            CheckpointAdapter::new(config, Device::Cpu),
            &storage,
            "staging",
        );
        let err = coordinator
            .load(&storage, "src", Convention::Native)
            .unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::Format(FormatError::NoSourceFiles(_))
        ));
        assert_eq!(coordinator.state(), ReshardState::Failed);
        assert!(!storage.exists("staging").unwrap());
    }

    #[test]
    fn coordinator_flag_must_match_rank() {
        let config = tiny_config(2);
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        // Rank 0 of a single group claims not to coordinate.
        let comm = MockCommunicator::single();
        let role = StageRole {
            stage_index: 0,
            num_stages: 1,
            is_coordinator: false,
            writes_shard: true,
        };
        let mut coordinator = ReshardCoordinator::new(
            role,
            &comm,
            CheckpointAdapter::new(config.clone(), Device::Cpu),
            &storage,
            "staging",
        );
        let err = coordinator
            .load(&storage, "src", Convention::Native)
            .unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::Collective(DistributedError::CoordinatorMismatch {
                rank: 0,
                coordinator_rank: 0,
                is_coordinator: false,
            })
        ));
        assert_eq!(coordinator.state(), ReshardState::Failed);

        // Rank 1 claims to coordinate while rank 0 is configured.
        let comm = MockCommunicator::new(LocalProcessGroup::with_rank(1, 2));
        let mut coordinator = ReshardCoordinator::new(
            StageRole::pipeline(0, 2),
            &comm,
            CheckpointAdapter::new(config, Device::Cpu),
            &storage,
            "staging",
        );
        let shard = WeightSet::new();
        let err = coordinator
            .save(&shard, &storage, "out", Convention::Native)
            .unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::Collective(DistributedError::CoordinatorMismatch { rank: 1, .. })
        ));
        assert!(!storage.exists("staging").unwrap());
    }
}
