use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::error::{Result, StorageError};
use super::Storage;

/// Storage rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> PathBuf {
        let key = key.trim_start_matches('/');
        if key.is_empty() {
            self.root.clone()
        } else {
            self.root.join(key)
        }
    }
}

/// Sibling temp file for `path`: the full file name plus `.partial`, so keys
/// that differ only by extension never share one.
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

impl Storage for LocalStorage {
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.path_of(prefix);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(dir.display().to_string()))
            }
            Err(e) => return Err(StorageError::io(dir.display().to_string(), e)),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(dir.display().to_string(), e))?;
            let is_file = entry
                .file_type()
                .map_err(|e| StorageError::io(entry.path().display().to_string(), e))?
                .is_file();
            if !is_file {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                keys.push(super::join_key(prefix, name));
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn read(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_of(key);
        fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(path.display().to_string()),
            _ => StorageError::io(path.display().to_string(), e),
        })
    }

    fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path_of(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StorageError::io(parent.display().to_string(), e))?;
        }
        // Write-then-rename so readers never observe a half-written file.
        let tmp = partial_path(&path);
        fs::write(&tmp, data).map_err(|e| StorageError::io(tmp.display().to_string(), e))?;
        fs::rename(&tmp, &path).map_err(|e| StorageError::io(path.display().to_string(), e))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_of(key).exists())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let path = self.path_of(prefix);
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(path.display().to_string(), e)),
        }
    }

    fn local_path(&self, key: &str) -> Option<PathBuf> {
        Some(self.path_of(key))
    }

    fn describe(&self, key: &str) -> String {
        self.path_of(key).display().to_string()
    }
}
