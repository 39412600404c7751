//! Discovery and decoding of the tensor files that make up a checkpoint.

use std::io::Write;

use candle_core::{Device, Tensor};
use tracing::debug;

use crate::checkpoint::hf_index::{HfIndex, INDEX_FILE};
use crate::checkpoint::{CheckpointError, Convention, FormatError, Result};
use crate::storage::{self, Storage, StorageError};

/// Keys of the tensor files of a checkpoint under `prefix`, in natural order.
///
/// Community checkpoints with an index sidecar use the files it names.
/// Otherwise every file with one of the convention's extensions is taken;
/// extensions are tried in preference order and the first that matches any
/// file wins, so a directory holding both `.safetensors` and `.bin` copies is
/// read once.
pub fn discover_sources(
    storage: &dyn Storage,
    prefix: &str,
    convention: Convention,
) -> Result<Vec<String>> {
    if convention == Convention::Community {
        let index_key = storage::join_key(prefix, INDEX_FILE);
        if storage.exists(&index_key)? {
            let index = HfIndex::parse(&storage.read(&index_key)?)?;
            let mut files: Vec<String> = index
                .files()
                .iter()
                .map(|f| storage::join_key(prefix, f))
                .collect();
            sort_naturally(&mut files);
            debug!(files = files.len(), "using checkpoint index");
            return non_empty(files, storage, prefix);
        }
    }

    let listed = storage.list(prefix)?;
    for ext in convention.source_extensions() {
        let mut files: Vec<String> = listed
            .iter()
            .filter(|k| has_extension(k, ext))
            .cloned()
            .collect();
        if !files.is_empty() {
            sort_naturally(&mut files);
            return Ok(files);
        }
    }
    non_empty(Vec::new(), storage, prefix)
}

fn non_empty(files: Vec<String>, storage: &dyn Storage, prefix: &str) -> Result<Vec<String>> {
    if files.is_empty() {
        return Err(FormatError::NoSourceFiles(storage.describe(prefix)).into());
    }
    Ok(files)
}

fn has_extension(key: &str, ext: &str) -> bool {
    storage::file_name(key)
        .rsplit_once('.')
        .is_some_and(|(stem, e)| !stem.is_empty() && e == ext)
}

/// Read all tensors of one file, in file order.
///
/// Safetensors are parsed from an in-memory buffer. PyTorch pickles need a
/// filesystem path, so remote pickles are spooled to a temporary file first.
pub fn read_tensor_file(
    storage: &dyn Storage,
    key: &str,
    device: &Device,
) -> Result<Vec<(String, Tensor)>> {
    if has_extension(key, "safetensors") {
        let data = storage.read(key)?;
        let mut tensors: Vec<(String, Tensor)> =
            candle_core::safetensors::load_buffer(&data, device)?
                .into_iter()
                .collect();
        tensors.sort_by(|a, b| a.0.cmp(&b.0));
        return Ok(tensors);
    }

    let tensors = match storage.local_path(key) {
        Some(path) => candle_core::pickle::read_all(&path)?,
        None => {
            let data = storage.read(key)?;
            let spool_err = |e: std::io::Error| StorageError::io("pickle spool file", e);
            let mut spool = tempfile::NamedTempFile::new().map_err(spool_err)?;
            spool.write_all(&data).map_err(spool_err)?;
            spool.flush().map_err(spool_err)?;
            debug!(key, bytes = data.len(), "spooled remote pickle");
            candle_core::pickle::read_all(spool.path())?
        }
    };
    tensors
        .into_iter()
        .map(|(name, t)| Ok((name, t.to_device(device)?)))
        .collect::<std::result::Result<_, CheckpointError>>()
}

/// Natural sort key: splits a filename into alternating text/numeric segments
/// so that "consolidated.2" sorts before "consolidated.10".
pub fn natural_sort_key(s: &str) -> Vec<std::result::Result<u64, String>> {
    let basename = storage::file_name(s);
    let mut parts = Vec::new();
    let mut chars = basename.chars().peekable();
    while let Some(&first) = chars.peek() {
        if first.is_ascii_digit() {
            let mut num = String::new();
            while let Some(c) = chars.next_if(|c| c.is_ascii_digit()) {
                num.push(c);
            }
            parts.push(Ok(num.parse::<u64>().unwrap_or(u64::MAX)));
        } else {
            let mut text = String::new();
            while let Some(c) = chars.next_if(|c| !c.is_ascii_digit()) {
                text.push(c);
            }
            parts.push(Err(text));
        }
    }
    parts
}

pub fn sort_naturally(keys: &mut [String]) {
    keys.sort_by_cached_key(|k| natural_sort_key(k));
}
