//! Persistence contract for graphs.
//!
//! Every stored graph carries a version. Writers state the version they last
//! saw; a stale writer gets [`StorageError::VersionConflict`] instead of
//! silently overwriting a newer graph.

mod autosave;
mod file;
mod memory;

pub use autosave::{AutoSaveManager, DEFAULT_AUTOSAVE_INTERVAL_SECS};
pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::graph::PortableGraph;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Graph not found: {0}")]
    NotFound(String),
    #[error("Serialization failed: {0}")]
    Serialization(String),
    #[error("Deserialization failed: {0}")]
    Deserialization(String),
    #[error("Version conflict on '{id}': expected {expected}, found {actual}")]
    VersionConflict { id: String, expected: u64, actual: u64 },
    #[error("IO error: {0}")]
    Io(String),
    #[error("Storage error: {0}")]
    Other(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Boxed future returned by [`Storage`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A graph as persisted, with the version it was written at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredGraph {
    pub version: u64,
    pub graph: PortableGraph,
}

/// Trait for graph storage backends.
pub trait Storage: Send + Sync {
    /// Load a graph and its current version.
    fn load(&self, id: &str) -> BoxFuture<'_, StorageResult<StoredGraph>>;

    /// Save a graph, returning the new version.
    ///
    /// `expected_version` is the version the caller last loaded or saved,
    /// or 0 for a graph that has never been stored.
    fn save(
        &self,
        id: &str,
        graph: &PortableGraph,
        expected_version: u64,
    ) -> BoxFuture<'_, StorageResult<u64>>;

    /// Delete a graph.
    fn delete(&self, id: &str) -> BoxFuture<'_, StorageResult<()>>;

    /// List all stored graph ids.
    fn list(&self) -> BoxFuture<'_, StorageResult<Vec<String>>>;

    /// Check if a graph exists.
    fn exists(&self, id: &str) -> BoxFuture<'_, StorageResult<bool>>;
}

/// Check `expected` against the stored version and return the next one.
pub(crate) fn next_version(id: &str, expected: u64, actual: u64) -> StorageResult<u64> {
    if expected != actual {
        return Err(StorageError::VersionConflict {
            id: id.to_string(),
            expected,
            actual,
        });
    }
    Ok(actual + 1)
}

#[cfg(test)]
pub(crate) fn block_on<F: std::future::Future>(f: F) -> F::Output {
    // Storage futures never actually suspend; poll until ready.
    use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

    fn dummy_raw_waker() -> RawWaker {
        fn no_op(_: *const ()) {}
        fn clone(_: *const ()) -> RawWaker {
            dummy_raw_waker()
        }
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
        RawWaker::new(std::ptr::null(), &VTABLE)
    }

    let waker = unsafe { Waker::from_raw(dummy_raw_waker()) };
    let mut cx = Context::from_waker(&waker);
    let mut f = std::pin::pin!(f);

    loop {
        if let Poll::Ready(result) = f.as_mut().poll(&mut cx) {
            return result;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_version() {
        assert_eq!(next_version("g", 0, 0).unwrap(), 1);
        assert_eq!(next_version("g", 4, 4).unwrap(), 5);
        match next_version("g", 2, 3) {
            Err(StorageError::VersionConflict { id, expected, actual }) => {
                assert_eq!(id, "g");
                assert_eq!(expected, 2);
                assert_eq!(actual, 3);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_stored_graph_json_shape() {
        let stored = StoredGraph { version: 2, graph: PortableGraph::default() };
        let json = serde_json::to_string(&stored).unwrap();
        assert_eq!(json, r#"{"version":2,"graph":{"nodes":[],"edges":[]}}"#);
    }
}
