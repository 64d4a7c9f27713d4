//! Messages exchanged with the relay server.
//!
//! JSON, tagged by `type`:
//! ```json
//! { "type": "join", "graph": "graph-id" }
//! { "type": "event", "event": { "event": "node_created", ... } }
//! { "type": "presence", "presence": { "user_id": "u1", ... } }
//! ```

use crate::event::GraphEvent;
use crate::graph::PortableGraph;
use crate::presence::PresenceEvent;
use serde::{Deserialize, Serialize};

/// Messages sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a graph room
    Join { graph: String },
    /// Leave the current room
    Leave,
    /// Graph diff from this session
    Event { event: GraphEvent },
    /// Presence update from this session
    Presence { presence: PresenceEvent },
    /// Presence removal (explicit leave of a user)
    PresenceLeft { user_id: String },
    /// Ask the server to persist the room's graph
    Save,
}

/// Messages received from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirm room join with the current state
    Joined {
        graph: String,
        peer_count: usize,
        snapshot: PortableGraph,
        version: u64,
        #[serde(default)]
        presence: Vec<PresenceEvent>,
    },
    /// Peer joined the room
    PeerJoined { peer_id: String },
    /// Peer left the room
    PeerLeft { peer_id: String },
    /// Graph diff from another peer
    Event { event: GraphEvent },
    /// Presence update from another peer
    Presence { presence: PresenceEvent },
    /// A user left or timed out
    PresenceLeft { user_id: String },
    /// Room persisted at this version
    Saved { version: u64 },
    /// Error message
    Error { message: String },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
