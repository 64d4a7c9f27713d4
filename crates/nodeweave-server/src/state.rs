//! Rooms and shared server state.
//!
//! A room holds a replica of its graph. Relayed events are applied to the
//! replica in the order they are broadcast, so new joiners get a snapshot
//! consistent with the event stream that follows it.

use dashmap::DashMap;
use nodeweave_core::event;
use nodeweave_core::session::now_ms;
use nodeweave_core::{
    EngineConfig, Graph, GraphError, GraphEvent, PresenceEvent, PresenceTracker, PresenceUpdate,
    ServerMessage, Storage, StorageError,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Sender used for messages that originate from the server itself.
pub const SERVER_ORIGIN: &str = "server";

/// A broadcast message tagged with the peer that caused it.
pub type Envelope = (String, ServerMessage);

/// Storage id for changes that lost a save race on close.
pub fn recovery_id(graph_id: &str, at_ms: u64) -> String {
    format!("{}.recovered-{}", graph_id, at_ms)
}

/// Room state
pub struct Room {
    tx: broadcast::Sender<Envelope>,
    /// Connected peer ids
    peers: HashSet<String>,
    /// Users announced by each peer, removed when the peer disconnects
    users: HashMap<String, HashSet<String>>,
    graph: Graph,
    presence: PresenceTracker,
    /// Version of the graph in storage
    version: u64,
    /// Replica as of the last load or save
    saved: Graph,
}

impl Room {
    fn new(graph: Graph, version: u64, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            peers: HashSet::new(),
            users: HashMap::new(),
            saved: graph.clone(),
            graph,
            presence: PresenceTracker::new(),
            version,
        }
    }

    fn is_dirty(&self) -> bool {
        self.graph != self.saved
    }

    fn broadcast(&self, from: &str, msg: ServerMessage) {
        let _ = self.tx.send((from.to_string(), msg));
    }
}

/// What a peer receives on joining.
pub struct JoinInfo {
    pub rx: broadcast::Receiver<Envelope>,
    pub message: ServerMessage,
}

/// Shared application state
pub struct AppState {
    rooms: DashMap<String, Room>,
    storage: Arc<dyn Storage>,
    engine: EngineConfig,
}

impl AppState {
    pub fn new(storage: Arc<dyn Storage>, engine: EngineConfig) -> Self {
        Self {
            rooms: DashMap::new(),
            storage,
            engine,
        }
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Load `graph_id` from storage unless the room is already open.
    async fn open_room(&self, graph_id: &str) -> Result<(), String> {
        if self.rooms.contains_key(graph_id) {
            return Ok(());
        }
        let (graph, version) = match self.storage.load(graph_id).await {
            Ok(stored) => {
                let graph = Graph::from_portable(stored.graph)
                    .map_err(|e| format!("Stored graph '{}' is invalid: {}", graph_id, e))?;
                (graph, stored.version)
            }
            Err(StorageError::NotFound(_)) => (Graph::new(), 0),
            Err(e) => return Err(format!("Failed to load graph '{}': {}", graph_id, e)),
        };
        info!("Opened room {} at version {}", graph_id, version);
        // A concurrent joiner may have opened it meanwhile; keep the first.
        self.rooms
            .entry(graph_id.to_string())
            .or_insert_with(|| Room::new(graph, version, self.engine.channel_capacity));
        Ok(())
    }

    /// Add a peer to a room, opening it first if needed.
    pub async fn join_room(&self, graph_id: &str, peer_id: &str) -> Result<JoinInfo, String> {
        self.open_room(graph_id).await?;
        let mut room = self
            .rooms
            .get_mut(graph_id)
            .ok_or_else(|| format!("Room {} closed while joining", graph_id))?;
        room.peers.insert(peer_id.to_string());
        let rx = room.tx.subscribe();
        let message = ServerMessage::Joined {
            graph: graph_id.to_string(),
            peer_count: room.peers.len(),
            snapshot: room.graph.to_portable(),
            version: room.version,
            presence: room.presence.list().iter().map(PresenceEvent::from).collect(),
        };
        room.broadcast(
            peer_id,
            ServerMessage::PeerJoined {
                peer_id: peer_id.to_string(),
            },
        );
        Ok(JoinInfo { rx, message })
    }

    /// Remove a peer, dropping the presence of the users it announced.
    ///
    /// When the last peer leaves, unsaved changes are persisted and the room
    /// is closed. A room whose changes could not be stored stays open.
    pub async fn leave_room(&self, graph_id: &str, peer_id: &str) {
        let emptied = {
            let Some(mut room) = self.rooms.get_mut(graph_id) else {
                return;
            };
            room.peers.remove(peer_id);
            for user_id in room.users.remove(peer_id).unwrap_or_default() {
                if room.presence.leave(&user_id).is_some() {
                    room.broadcast(peer_id, ServerMessage::PresenceLeft { user_id });
                }
            }
            room.broadcast(
                peer_id,
                ServerMessage::PeerLeft {
                    peer_id: peer_id.to_string(),
                },
            );
            room.peers.is_empty()
        };

        if emptied && self.persist_on_close(graph_id).await {
            if self.rooms.remove_if(graph_id, |_, room| room.peers.is_empty()).is_some() {
                info!("Closed room {}", graph_id);
            }
        }
    }

    /// Store an emptied room before it closes. Returns false when its
    /// changes are not stored anywhere.
    ///
    /// On a version conflict the replica is written under a fresh
    /// [`recovery_id`] and the stored graph is left alone.
    async fn persist_on_close(&self, graph_id: &str) -> bool {
        let actual = match self.save_room(graph_id).await {
            Ok(_) => return true,
            Err(StorageError::VersionConflict { actual, .. }) => actual,
            Err(e) => {
                warn!("Failed to save room {} on close, keeping it open: {}", graph_id, e);
                return false;
            }
        };

        let Some(graph) = self.rooms.get(graph_id).map(|room| room.graph.to_portable()) else {
            return true;
        };
        let recovered = recovery_id(graph_id, now_ms());
        match self.storage.save(&recovered, &graph, 0).await {
            Ok(_) => {
                warn!(
                    "Room {} conflicts with stored version {}; unsaved changes kept as {}",
                    graph_id, actual, recovered
                );
                true
            }
            Err(e) => {
                warn!("Failed to store recovery copy of room {}, keeping it open: {}", graph_id, e);
                false
            }
        }
    }

    /// Retry closing rooms left open without peers by a failed save.
    /// Returns how many closed.
    pub async fn close_idle_rooms(&self) -> usize {
        let idle: Vec<String> = self
            .rooms
            .iter()
            .filter(|room| room.peers.is_empty())
            .map(|room| room.key().clone())
            .collect();

        let mut closed = 0;
        for graph_id in idle {
            if self.persist_on_close(&graph_id).await
                && self.rooms.remove_if(&graph_id, |_, room| room.peers.is_empty()).is_some()
            {
                info!("Closed idle room {}", graph_id);
                closed += 1;
            }
        }
        closed
    }

    /// Apply an event to the room replica and relay it to the other peers.
    ///
    /// Events that do not apply are dropped, not relayed.
    pub fn relay_event(&self, graph_id: &str, peer_id: &str, event: GraphEvent) -> Result<(), GraphError> {
        let Some(mut room) = self.rooms.get_mut(graph_id) else {
            return Ok(());
        };
        match event::apply(&room.graph, &event.payload) {
            Ok(next) => {
                debug!(
                    "room {}: {} '{}' from {}",
                    graph_id,
                    event.payload.name(),
                    event.payload.entity_id(),
                    peer_id
                );
                room.graph = next;
                room.broadcast(peer_id, ServerMessage::Event { event });
                Ok(())
            }
            Err(e) => {
                warn!(
                    "room {}: dropped {} '{}' from {}: {}",
                    graph_id,
                    event.payload.name(),
                    event.payload.entity_id(),
                    peer_id,
                    e
                );
                Err(e)
            }
        }
    }

    /// Record a presence update and relay it.
    pub fn relay_presence(&self, graph_id: &str, peer_id: &str, presence: PresenceEvent) {
        let Some(mut room) = self.rooms.get_mut(graph_id) else {
            return;
        };
        room.users
            .entry(peer_id.to_string())
            .or_default()
            .insert(presence.user_id.clone());
        room.presence
            .update(&presence.user_id, PresenceUpdate::from(&presence), now_ms());
        room.broadcast(peer_id, ServerMessage::Presence { presence });
    }

    /// Remove a user's presence and relay the removal.
    pub fn relay_presence_left(&self, graph_id: &str, peer_id: &str, user_id: String) {
        let Some(mut room) = self.rooms.get_mut(graph_id) else {
            return;
        };
        if let Some(users) = room.users.get_mut(peer_id) {
            users.remove(&user_id);
        }
        room.presence.leave(&user_id);
        room.broadcast(peer_id, ServerMessage::PresenceLeft { user_id });
    }

    /// Persist the room replica. Returns the stored version.
    ///
    /// Nothing is written when the replica is unchanged since the last save.
    pub async fn save_room(&self, graph_id: &str) -> Result<u64, StorageError> {
        let (graph, version) = {
            let room = self
                .rooms
                .get(graph_id)
                .ok_or_else(|| StorageError::NotFound(graph_id.to_string()))?;
            if !room.is_dirty() {
                return Ok(room.version);
            }
            (room.graph.clone(), room.version)
        };

        let new_version = self.storage.save(graph_id, &graph.to_portable(), version).await?;
        info!("Saved room {} at version {}", graph_id, new_version);

        if let Some(mut room) = self.rooms.get_mut(graph_id) {
            room.version = new_version;
            room.saved = graph;
        }
        Ok(new_version)
    }

    /// Expire stale presence in every room and broadcast the removals.
    pub fn expire_presence(&self, now_ms: u64) -> usize {
        let mut expired = 0;
        for mut room in self.rooms.iter_mut() {
            let stale = room
                .presence
                .expire_stale(now_ms, self.engine.presence_timeout_ms);
            for user_id in stale {
                debug!("room {}: presence of {} expired", room.key(), user_id);
                for users in room.users.values_mut() {
                    users.remove(&user_id);
                }
                room.broadcast(SERVER_ORIGIN, ServerMessage::PresenceLeft { user_id });
                expired += 1;
            }
        }
        expired
    }
}
