//! Periodic, version-aware saving of one graph.

use crate::graph::Graph;
use crate::storage::{FileStorage, Storage, StorageError, StorageResult};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default auto-save interval in seconds.
pub const DEFAULT_AUTOSAVE_INTERVAL_SECS: u64 = 30;

/// Tracks unsaved changes to a graph and writes them back to storage.
///
/// The manager remembers the version it last loaded or saved. When someone
/// else saved in between, [`save`](Self::save) fails with
/// [`StorageError::VersionConflict`] and the graph stays dirty; call
/// [`reload`](Self::reload) to fetch the newer graph and re-apply intent.
pub struct AutoSaveManager<S: Storage> {
    storage: Arc<S>,
    graph_id: String,
    interval: Duration,
    last_save: Option<Instant>,
    dirty: bool,
    /// Last version seen in storage; 0 before the first save.
    version: u64,
}

impl<S: Storage> AutoSaveManager<S> {
    /// Create a manager for `graph_id` with the given storage backend.
    pub fn new(storage: Arc<S>, graph_id: impl Into<String>) -> Self {
        Self {
            storage,
            graph_id: graph_id.into(),
            interval: Duration::from_secs(DEFAULT_AUTOSAVE_INTERVAL_SECS),
            last_save: None,
            dirty: false,
            version: 0,
        }
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    /// Version last loaded or saved.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Mark the graph as having unsaved changes.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Dirty and the interval has elapsed (or nothing was saved yet).
    pub fn should_save(&self) -> bool {
        if !self.dirty {
            return false;
        }
        match self.last_save {
            Some(last) => last.elapsed() >= self.interval,
            None => true,
        }
    }

    /// Save if needed. Returns true if a save was performed.
    pub async fn maybe_save(&mut self, graph: &Graph) -> StorageResult<bool> {
        if !self.should_save() {
            return Ok(false);
        }
        self.save(graph).await?;
        Ok(true)
    }

    /// Save immediately, returning the new version.
    pub async fn save(&mut self, graph: &Graph) -> StorageResult<u64> {
        let result = self
            .storage
            .save(&self.graph_id, &graph.to_portable(), self.version)
            .await;

        match result {
            Ok(version) => {
                self.version = version;
                self.last_save = Some(Instant::now());
                self.dirty = false;
                Ok(version)
            }
            Err(e) => {
                if let StorageError::VersionConflict { actual, .. } = &e {
                    log::warn!(
                        "graph '{}' was saved elsewhere (version {} > {})",
                        self.graph_id,
                        actual,
                        self.version
                    );
                }
                Err(e)
            }
        }
    }

    /// Load the stored graph, adopting its version.
    pub async fn load(&mut self) -> StorageResult<Graph> {
        let stored = self.storage.load(&self.graph_id).await?;
        let graph = Graph::from_portable(stored.graph)
            .map_err(|e| StorageError::Deserialization(e.to_string()))?;
        self.version = stored.version;
        self.dirty = false;
        self.last_save = Some(Instant::now());
        Ok(graph)
    }

    /// Fetch the latest persisted graph after a conflict.
    ///
    /// Unlike [`load`](Self::load) the dirty flag is kept: local intent has
    /// not been saved yet.
    pub async fn reload(&mut self) -> StorageResult<Graph> {
        let dirty = self.dirty;
        let graph = self.load().await?;
        self.dirty = dirty;
        Ok(graph)
    }

    pub async fn exists(&self) -> StorageResult<bool> {
        self.storage.exists(&self.graph_id).await
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }
}

impl AutoSaveManager<FileStorage> {
    /// Manager backed by [`FileStorage::default_location`].
    pub fn with_default_storage(graph_id: impl Into<String>) -> StorageResult<Self> {
        Ok(Self::new(Arc::new(FileStorage::default_location()?), graph_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Node, NodeKind};
    use crate::storage::{MemoryStorage, block_on};
    use kurbo::Point;

    fn graph_with(id: &str) -> Graph {
        Graph::new()
            .add_node(Node::new(id, NodeKind::Note, Point::ZERO))
            .unwrap()
    }

    #[test]
    fn test_autosave_manager_creation() {
        let manager = AutoSaveManager::new(Arc::new(MemoryStorage::new()), "g");

        assert!(!manager.is_dirty());
        assert!(!manager.should_save());
        assert_eq!(manager.version(), 0);
    }

    #[test]
    fn test_autosave_dirty_flag() {
        let mut manager = AutoSaveManager::new(Arc::new(MemoryStorage::new()), "g");

        manager.mark_dirty();
        assert!(manager.is_dirty());
        assert!(manager.should_save());

        manager.set_interval(Duration::from_secs(3600));
        assert!(block_on(manager.maybe_save(&graph_with("n"))).unwrap());
        // Dirty again but the interval has not elapsed.
        manager.mark_dirty();
        assert!(!block_on(manager.maybe_save(&graph_with("n"))).unwrap());
    }

    #[test]
    fn test_autosave_save_advances_version() {
        let mut manager = AutoSaveManager::new(Arc::new(MemoryStorage::new()), "g");

        manager.mark_dirty();
        assert_eq!(block_on(manager.save(&graph_with("n1"))).unwrap(), 1);
        assert!(!manager.is_dirty());
        assert_eq!(block_on(manager.save(&graph_with("n2"))).unwrap(), 2);
        assert_eq!(manager.version(), 2);
    }

    #[test]
    fn test_autosave_conflict_then_reload() {
        let storage = Arc::new(MemoryStorage::new());
        let mut alice = AutoSaveManager::new(storage.clone(), "g");
        let mut bob = AutoSaveManager::new(storage.clone(), "g");

        block_on(alice.save(&graph_with("from-alice"))).unwrap();
        block_on(bob.load()).unwrap();
        block_on(bob.save(&graph_with("from-bob"))).unwrap();

        alice.mark_dirty();
        let result = block_on(alice.save(&graph_with("alice-again")));
        assert!(matches!(result, Err(StorageError::VersionConflict { .. })));
        assert!(alice.is_dirty());

        let latest = block_on(alice.reload()).unwrap();
        assert!(latest.contains_node("from-bob"));
        assert_eq!(alice.version(), 2);
        assert!(alice.is_dirty());

        assert_eq!(block_on(alice.save(&graph_with("alice-again"))).unwrap(), 3);
    }

    #[test]
    fn test_autosave_load_missing() {
        let mut manager = AutoSaveManager::new(Arc::new(MemoryStorage::new()), "missing");
        assert!(!block_on(manager.exists()).unwrap());
        assert!(matches!(block_on(manager.load()), Err(StorageError::NotFound(_))));
    }
}
