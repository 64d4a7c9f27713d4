//! NodeWeave Core Library
//!
//! Shared state engine for collaborative node-graph editing: an immutable
//! graph store, reversible commands with bounded undo/redo, diff-based
//! synchronisation between sessions, and user presence.

pub mod channel;
pub mod command;
pub mod config;
pub mod event;
pub mod graph;
pub mod history;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod transport;

pub use channel::{ChannelMessage, GraphChannel, SessionHandle, spawn_session};
pub use command::{Command, CommandError, NodeSnapshot};
pub use config::EngineConfig;
pub use event::{EventPayload, GraphEvent};
pub use graph::{Edge, Graph, GraphError, GraphResult, Metadata, Node, NodeKind, PortableGraph, Position};
pub use history::{History, HistoryError};
pub use presence::{PresenceEntry, PresenceEvent, PresenceTracker, PresenceUpdate};
pub use protocol::{ClientMessage, ServerMessage};
pub use session::{ErrorKind, RelayNotice, RemoteOutcome, Session, SessionError};
pub use storage::{AutoSaveManager, FileStorage, MemoryStorage, Storage, StorageError, StoredGraph};
pub use transport::{ConnectionState, RelayClient, TransportError, TransportEvent};
