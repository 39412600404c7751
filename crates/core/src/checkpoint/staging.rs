use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use super::error::{FormatError, Result};
use crate::storage::{self, Storage, StorageError};

const AREA_PREFIX: &str = "pipeshard-";

/// Transient location holding one shard file per pipeline stage.
///
/// The identifier is the area's storage key, `{base}/pipeshard-{millis}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingArea {
    id: String,
}

impl StagingArea {
    /// Reserve a new area under `base`, named from the wall clock.
    pub fn create(staging: &dyn Storage, base: &str) -> Result<Self> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self::create_at(
            staging,
            storage::join_key(base, &format!("{AREA_PREFIX}{millis}")),
        )
    }

    pub(crate) fn create_at(staging: &dyn Storage, id: String) -> Result<Self> {
        let taken = match staging.list(&id) {
            Ok(keys) => !keys.is_empty() || staging.exists(&id)?,
            Err(StorageError::NotFound(_)) => false,
            Err(e) => return Err(e.into()),
        };
        if taken {
            return Err(FormatError::StagingExists(staging.describe(&id)).into());
        }
        debug!(staging = %staging.describe(&id), "created staging area");
        Ok(Self { id })
    }

    /// Rebuild an area from an identifier received over the wire.
    pub fn from_identifier(id: &str) -> std::result::Result<Self, FormatError> {
        let name = storage::file_name(id);
        let valid = name
            .strip_prefix(AREA_PREFIX)
            .is_some_and(|ts| !ts.is_empty() && ts.bytes().all(|b| b.is_ascii_digit()));
        if !valid {
            return Err(FormatError::InvalidStagingId(id.to_string()));
        }
        Ok(Self { id: id.to_string() })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Key of the shard file of `stage`.
    pub fn shard_key(&self, stage: usize) -> String {
        storage::join_key(&self.id, &format!("pipeline_{stage}.safetensors"))
    }

    /// Delete the area and everything in it.
    pub fn remove(&self, staging: &dyn Storage) -> Result<()> {
        staging.delete_prefix(&self.id)?;
        debug!(staging = %staging.describe(&self.id), "removed staging area");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointError;
    use crate::storage::LocalStorage;

    #[test]
    fn shard_keys_are_per_stage() {
        let area = StagingArea::from_identifier("shm/pipeshard-1700000000000").unwrap();
        assert_eq!(
            area.shard_key(3),
            "shm/pipeshard-1700000000000/pipeline_3.safetensors"
        );
    }

    #[test]
    fn rejects_foreign_identifiers() {
        for id in ["", "shm/", "shm/other-123", "pipeshard-", "pipeshard-12a"] {
            assert!(
                matches!(
                    StagingArea::from_identifier(id),
                    Err(FormatError::InvalidStagingId(_))
                ),
                "{id:?}"
            );
        }
    }

    #[test]
    fn create_refuses_existing_area() {
        let dir = tempfile::tempdir().unwrap();
        let staging = LocalStorage::new(dir.path());
        staging
            .write("pipeshard-42/pipeline_0.safetensors", b"x")
            .unwrap();

        let err = StagingArea::create_at(&staging, "pipeshard-42".to_string()).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::Format(FormatError::StagingExists(_))
        ));
    }

    #[test]
    fn create_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let staging = LocalStorage::new(dir.path());
        let area = StagingArea::create(&staging, "shm").unwrap();
        assert!(area.id().starts_with("shm/pipeshard-"));
        assert_eq!(StagingArea::from_identifier(area.id()).unwrap(), area);

        staging.write(&area.shard_key(0), b"x").unwrap();
        area.remove(&staging).unwrap();
        assert!(!staging.exists(&area.shard_key(0)).unwrap());
    }
}
