//! In-memory storage implementation.

use super::{BoxFuture, Storage, StorageError, StorageResult, StoredGraph, next_version};
use crate::graph::PortableGraph;
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory storage for testing and ephemeral servers.
#[derive(Default)]
pub struct MemoryStorage {
    graphs: RwLock<HashMap<String, StoredGraph>>,
}

impl MemoryStorage {
    /// Create a new empty memory storage.
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_error(e: impl std::fmt::Display) -> StorageError {
    StorageError::Other(format!("Lock error: {}", e))
}

impl Storage for MemoryStorage {
    fn load(&self, id: &str) -> BoxFuture<'_, StorageResult<StoredGraph>> {
        let id = id.to_string();
        Box::pin(async move {
            let graphs = self.graphs.read().map_err(lock_error)?;
            graphs.get(&id).cloned().ok_or(StorageError::NotFound(id))
        })
    }

    fn save(
        &self,
        id: &str,
        graph: &PortableGraph,
        expected_version: u64,
    ) -> BoxFuture<'_, StorageResult<u64>> {
        let id = id.to_string();
        let graph = graph.clone();
        Box::pin(async move {
            let mut graphs = self.graphs.write().map_err(lock_error)?;
            let actual = graphs.get(&id).map_or(0, |stored| stored.version);
            let version = next_version(&id, expected_version, actual)?;
            graphs.insert(id, StoredGraph { version, graph });
            Ok(version)
        })
    }

    fn delete(&self, id: &str) -> BoxFuture<'_, StorageResult<()>> {
        let id = id.to_string();
        Box::pin(async move {
            let mut graphs = self.graphs.write().map_err(lock_error)?;
            graphs
                .remove(&id)
                .map(|_| ())
                .ok_or(StorageError::NotFound(id))
        })
    }

    fn list(&self) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        Box::pin(async move {
            let graphs = self.graphs.read().map_err(lock_error)?;
            let mut ids: Vec<String> = graphs.keys().cloned().collect();
            ids.sort();
            Ok(ids)
        })
    }

    fn exists(&self, id: &str) -> BoxFuture<'_, StorageResult<bool>> {
        let id = id.to_string();
        Box::pin(async move {
            let graphs = self.graphs.read().map_err(lock_error)?;
            Ok(graphs.contains_key(&id))
        })
    }
}
