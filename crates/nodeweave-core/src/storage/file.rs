//! File-based storage.

use super::{BoxFuture, Storage, StorageError, StorageResult, StoredGraph, next_version};
use crate::graph::PortableGraph;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Stores each graph as a JSON file (`{"version": n, "graph": {...}}`) in a
/// directory.
pub struct FileStorage {
    /// Base directory for graph files.
    base_path: PathBuf,
    /// Serialises the read-check-write of `save` within this process.
    write_lock: Mutex<()>,
}

impl FileStorage {
    /// Create a new file storage with the given base directory.
    ///
    /// Creates the directory if it doesn't exist.
    pub fn new(base_path: PathBuf) -> StorageResult<Self> {
        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                StorageError::Io(format!("Failed to create storage directory: {}", e))
            })?;
        }
        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    /// Create file storage in the default location.
    ///
    /// On Linux: `~/.local/share/nodeweave/graphs/`
    /// On Windows: `%LOCALAPPDATA%\nodeweave\graphs\`
    pub fn default_location() -> StorageResult<Self> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| StorageError::Io("Could not determine home directory".to_string()))?;

        Self::new(base.join("nodeweave").join("graphs"))
    }

    /// Get the file path for a graph id.
    fn graph_path(&self, id: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", encode_id(id)))
    }

    /// Get the base path.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

/// Escape `id` into a file stem. Lowercase ASCII letters, digits and `-`
/// pass through; every other byte becomes `_xx` (lowercase hex), so distinct
/// ids never share a file, even on case-insensitive filesystems.
fn encode_id(id: &str) -> String {
    let mut stem = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'-' {
            stem.push(char::from(byte));
        } else {
            stem.push_str(&format!("_{:02x}", byte));
        }
    }
    stem
}

/// Inverse of [`encode_id`]. `None` for stems it could not have produced.
fn decode_id(stem: &str) -> Option<String> {
    let mut bytes = Vec::with_capacity(stem.len());
    let mut rest = stem.as_bytes();
    while let Some((&byte, tail)) = rest.split_first() {
        if byte == b'_' {
            let hex = std::str::from_utf8(tail.get(..2)?).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            rest = &tail[2..];
        } else {
            bytes.push(byte);
            rest = tail;
        }
    }
    let id = String::from_utf8(bytes).ok()?;
    (encode_id(&id) == stem).then_some(id)
}

fn read_stored(path: &Path, id: &str) -> StorageResult<Option<StoredGraph>> {
    if !path.exists() {
        return Ok(None);
    }
    let json = fs::read_to_string(path)
        .map_err(|e| StorageError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
    let stored: StoredGraph = serde_json::from_str(&json).map_err(|e| {
        StorageError::Deserialization(format!("Failed to parse graph '{}': {}", id, e))
    })?;
    Ok(Some(stored))
}

impl Storage for FileStorage {
    fn load(&self, id: &str) -> BoxFuture<'_, StorageResult<StoredGraph>> {
        let path = self.graph_path(id);
        let id = id.to_string();

        Box::pin(async move { read_stored(&path, &id)?.ok_or(StorageError::NotFound(id)) })
    }

    fn save(
        &self,
        id: &str,
        graph: &PortableGraph,
        expected_version: u64,
    ) -> BoxFuture<'_, StorageResult<u64>> {
        let path = self.graph_path(id);
        let id = id.to_string();
        let graph = graph.clone();

        Box::pin(async move {
            let _guard = self
                .write_lock
                .lock()
                .map_err(|e| StorageError::Other(format!("Lock error: {}", e)))?;

            let actual = read_stored(&path, &id)?.map_or(0, |stored| stored.version);
            let version = next_version(&id, expected_version, actual)?;

            let json = serde_json::to_string_pretty(&StoredGraph { version, graph })
                .map_err(|e| StorageError::Serialization(e.to_string()))?;

            // Write beside the target and rename so readers never see a torn file.
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, json).map_err(|e| {
                StorageError::Io(format!("Failed to write {}: {}", tmp.display(), e))
            })?;
            fs::rename(&tmp, &path).map_err(|e| {
                StorageError::Io(format!("Failed to replace {}: {}", path.display(), e))
            })?;

            log::debug!("saved graph '{}' at version {}", id, version);
            Ok(version)
        })
    }

    fn delete(&self, id: &str) -> BoxFuture<'_, StorageResult<()>> {
        let path = self.graph_path(id);
        let id = id.to_string();

        Box::pin(async move {
            if !path.exists() {
                return Err(StorageError::NotFound(id));
            }
            fs::remove_file(&path).map_err(|e| {
                StorageError::Io(format!("Failed to delete {}: {}", path.display(), e))
            })
        })
    }

    fn list(&self) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        let base = self.base_path.clone();

        Box::pin(async move {
            if !base.exists() {
                return Ok(vec![]);
            }

            let entries = fs::read_dir(&base)
                .map_err(|e| StorageError::Io(format!("Failed to read directory: {}", e)))?;

            let mut ids: Vec<String> = entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
                .filter_map(|path| {
                    let stem = path.file_stem()?.to_str()?;
                    let id = decode_id(stem);
                    if id.is_none() {
                        log::debug!("ignoring foreign file {}", path.display());
                    }
                    id
                })
                .collect();
            ids.sort();
            Ok(ids)
        })
    }

    fn exists(&self, id: &str) -> BoxFuture<'_, StorageResult<bool>> {
        let path = self.graph_path(id);
        Box::pin(async move { Ok(path.exists()) })
    }
}
