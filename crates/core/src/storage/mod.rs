//! Uniform read/write/list access to checkpoint storage.
//!
//! Two backends sit behind [`Storage`]:
//! - [`LocalStorage`] - a directory on the local filesystem
//! - [`ObjectStorage`] - a flat object store reached through an
//!   [`ObjectStoreClient`]; every object moves as one full in-memory buffer
//!
//! Keys are `/`-separated paths relative to the backend root.

mod error;
mod local;
mod object;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub use error::{Result, StorageError};
pub use local::LocalStorage;
pub use object::{InMemoryObjectStore, ObjectStorage, ObjectStoreClient};

use crate::checkpoint::FormatError;

/// Storage backend used by the checkpoint adapter and coordinator.
pub trait Storage: Send + Sync {
    /// Keys of the objects directly under `prefix`, sorted lexicographically.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Read a whole object.
    fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// Write a whole object, replacing any previous content.
    fn write(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Whether an object exists.
    fn exists(&self, key: &str) -> Result<bool>;

    /// Delete every object under `prefix`.
    fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// Path on the local filesystem, when the backend has one.
    fn local_path(&self, _key: &str) -> Option<PathBuf> {
        None
    }

    /// Human-readable location for log messages.
    fn describe(&self, key: &str) -> String;
}

/// Join a prefix and a name into a storage key.
pub fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Final path component of a key.
pub fn file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Which storage backend a checkpoint lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageProtocol {
    #[default]
    File,
    ObjectStore,
}

impl FromStr for StorageProtocol {
    type Err = FormatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" | "local" => Ok(Self::File),
            "s3" | "object" | "object-store" => Ok(Self::ObjectStore),
            other => Err(FormatError::UnknownToken {
                kind: "storage protocol",
                token: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for StorageProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => f.write_str("file"),
            Self::ObjectStore => f.write_str("s3"),
        }
    }
}
