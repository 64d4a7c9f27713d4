//! Per-session synchronization engine.
//!
//! A [`Session`] owns one local [`Graph`] and one [`History`]. Local commands
//! go through the history and their semantic diff is queued for broadcast.
//! Remote events are applied straight to the graph, never through the
//! history, so undo only ever reverts this session's own actions.
//!
//! Conflicts resolve last-writer-wins in arrival order. There is no vector
//! clock; two sessions may briefly disagree on the order of independent edits.

use crate::channel::ChannelMessage;
use crate::command::{Command, CommandError};
use crate::config::EngineConfig;
use crate::event::{self, GraphEvent};
use crate::graph::{Graph, GraphError, GraphResult, PortableGraph};
use crate::history::{History, HistoryError};
use crate::presence::{PresenceEntry, PresenceEvent, PresenceTracker, PresenceUpdate};
use crate::protocol::{ClientMessage, ServerMessage};
use kurbo::Point;
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// How far a remote timestamp may run ahead of the local wall clock.
pub const MAX_CLOCK_SKEW_MS: u64 = 60_000;

/// Session errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error("Session closed")]
    Closed,
}

/// Coarse classification for presenting a [`SessionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The local action failed validation.
    Rejected,
    /// Undo or redo with an empty stack.
    NothingToDo,
    /// The session actor is gone.
    Closed,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::History(HistoryError::NothingToUndo | HistoryError::NothingToRedo) => {
                ErrorKind::NothingToDo
            }
            SessionError::History(_) => ErrorKind::Rejected,
            SessionError::Closed => ErrorKind::Closed,
        }
    }
}

/// What happened to an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    /// The event was applied to the local graph.
    Applied,
    /// Our own publication came back; ignored.
    Echo,
    /// The event failed validation against the local graph; graph unchanged.
    Dropped(GraphError),
    /// A peer's presence changed.
    PresenceUpdated(String),
    /// A peer left.
    PresenceLeft(String),
}

/// Notifications produced while handling relay server messages.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayNotice {
    Joined {
        graph: String,
        peer_count: usize,
        version: u64,
    },
    PeerJoined {
        peer_id: String,
    },
    PeerLeft {
        peer_id: String,
    },
    Remote(RemoteOutcome),
    Saved {
        version: u64,
    },
    /// The relay sent a snapshot that failed validation.
    RejectedSnapshot(GraphError),
    Error {
        message: String,
    },
}

/// Snapshot of undo/redo availability for UI menus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistorySummary {
    pub can_undo: bool,
    pub can_redo: bool,
    pub next_undo: Option<String>,
    pub next_redo: Option<String>,
    pub past_count: usize,
    pub future_count: usize,
}

impl From<&History> for HistorySummary {
    fn from(history: &History) -> Self {
        Self {
            can_undo: history.can_undo(),
            can_redo: history.can_redo(),
            next_undo: history.next_undo_description(),
            next_redo: history.next_redo_description(),
            past_count: history.past_count(),
            future_count: history.future_count(),
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One session's view of a shared graph.
pub struct Session {
    session_id: String,
    graph: Graph,
    history: History,
    config: EngineConfig,
    /// This session's own presence.
    presence: PresenceEntry,
    /// Presence of other users.
    peers: PresenceTracker,
    /// Last logical timestamp issued or observed.
    clock: u64,
    /// Pending outgoing messages.
    outgoing: Vec<ChannelMessage>,
}

impl Session {
    /// Create a session with an empty graph.
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>, config: EngineConfig) -> Self {
        let user_id = user_id.into();
        Self {
            session_id: session_id.into(),
            graph: Graph::new(),
            history: History::new(config.history_limit),
            config,
            presence: PresenceEntry {
                display_name: user_id.clone(),
                color: String::from("#1971c2"),
                cursor: Point::ZERO,
                locked_node_ids: BTreeSet::new(),
                last_seen: 0,
                user_id,
            },
            peers: PresenceTracker::new(),
            clock: 0,
            outgoing: Vec::new(),
        }
    }

    /// Create a session with a random session id.
    pub fn with_random_id(user_id: impl Into<String>, config: EngineConfig) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), user_id, config)
    }

    pub fn id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.presence.user_id
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn history_summary(&self) -> HistorySummary {
        HistorySummary::from(&self.history)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Replace the local graph, e.g. with a snapshot loaded from storage.
    /// History is cleared since its commands refer to the old graph.
    pub fn load_portable(&mut self, data: PortableGraph) -> GraphResult<()> {
        self.graph = Graph::from_portable(data)?;
        self.history.clear();
        Ok(())
    }

    /// Clear undo/redo history.
    pub fn reset(&mut self) {
        self.history.clear();
    }

    // --- Local operations ---

    /// Execute a command locally and queue its diff.
    pub fn execute(&mut self, cmd: Command) -> Result<&Graph, SessionError> {
        let description = cmd.describe();
        let next = self.history.execute(cmd, &self.graph)?;
        log::debug!("session {}: {}", self.session_id, description);
        self.commit(next);
        Ok(&self.graph)
    }

    /// Undo the last local command and queue its diff.
    ///
    /// A partial restore is committed and broadcast before the error is
    /// returned.
    pub fn undo(&mut self) -> Result<&Graph, SessionError> {
        match self.history.undo(&self.graph) {
            Ok(next) => {
                self.commit(next);
                Ok(&self.graph)
            }
            Err(HistoryError::Command(CommandError::PartialRestore { node_id, graph, failed })) => {
                log::warn!(
                    "session {}: partial restore of '{}', {} edge(s) lost",
                    self.session_id,
                    node_id,
                    failed.len()
                );
                self.commit((*graph).clone());
                Err(HistoryError::Command(CommandError::PartialRestore { node_id, graph, failed }).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Redo the last undone command and queue its diff.
    pub fn redo(&mut self) -> Result<&Graph, SessionError> {
        let next = self.history.redo(&self.graph)?;
        self.commit(next);
        Ok(&self.graph)
    }

    fn commit(&mut self, next: Graph) {
        let payloads = event::diff(&self.graph, &next);
        self.graph = next;
        for payload in payloads {
            let timestamp = self.tick();
            let event = GraphEvent::new(payload, self.session_id.clone(), timestamp);
            log::debug!(
                "session {}: publish {} '{}'",
                self.session_id,
                event.payload.name(),
                event.payload.entity_id()
            );
            self.outgoing.push(ChannelMessage::Graph(event));
        }
    }

    /// Next logical timestamp: wall clock, but never behind anything seen.
    fn tick(&mut self) -> u64 {
        self.clock = now_ms().max(self.clock.saturating_add(1));
        self.clock
    }

    // --- Inbound ---

    /// Handle a message from the broadcast channel.
    ///
    /// Never fails: invalid remote events are logged and dropped.
    pub fn receive(&mut self, msg: &ChannelMessage) -> RemoteOutcome {
        match msg {
            ChannelMessage::Graph(event) => self.apply_remote(event),
            ChannelMessage::Presence { origin_session_id, presence } => {
                if *origin_session_id == self.session_id {
                    return RemoteOutcome::Echo;
                }
                self.apply_presence(presence)
            }
            ChannelMessage::PresenceLeft { origin_session_id, user_id } => {
                if *origin_session_id == self.session_id {
                    return RemoteOutcome::Echo;
                }
                self.peers.leave(user_id);
                RemoteOutcome::PresenceLeft(user_id.clone())
            }
        }
    }

    /// Apply a remote graph event, bypassing the history.
    pub fn apply_remote(&mut self, event: &GraphEvent) -> RemoteOutcome {
        if event.origin_session_id == self.session_id {
            return RemoteOutcome::Echo;
        }
        // Peers ahead of the local wall clock only pull it forward by a bounded skew.
        let observed = event.timestamp_ms.min(now_ms().saturating_add(MAX_CLOCK_SKEW_MS));
        self.clock = self.clock.max(observed);
        match event::apply(&self.graph, &event.payload) {
            Ok(next) => {
                log::debug!(
                    "session {}: applied {} '{}' from {}",
                    self.session_id,
                    event.payload.name(),
                    event.payload.entity_id(),
                    event.origin_session_id
                );
                self.graph = next;
                RemoteOutcome::Applied
            }
            Err(e) => {
                log::warn!(
                    "session {}: dropped {} '{}' from {}: {}",
                    self.session_id,
                    event.payload.name(),
                    event.payload.entity_id(),
                    event.origin_session_id,
                    e
                );
                RemoteOutcome::Dropped(e)
            }
        }
    }

    /// Record a peer's presence. Echo filtering is by session, so the same
    /// user in another session still shows up here.
    fn apply_presence(&mut self, presence: &PresenceEvent) -> RemoteOutcome {
        self.peers
            .update(&presence.user_id, PresenceUpdate::from(presence), now_ms());
        RemoteOutcome::PresenceUpdated(presence.user_id.clone())
    }

    /// Handle a JSON message from the relay server.
    pub fn handle_server_message(&mut self, json: &str) -> Option<RelayNotice> {
        match serde_json::from_str(json) {
            Ok(msg) => Some(self.handle_relay(msg)),
            Err(e) => {
                log::warn!("session {}: undecodable server message: {}", self.session_id, e);
                None
            }
        }
    }

    /// Route a decoded relay message into the session.
    pub fn handle_relay(&mut self, msg: ServerMessage) -> RelayNotice {
        match msg {
            ServerMessage::Joined {
                graph,
                peer_count,
                snapshot,
                version,
                presence,
            } => {
                if let Err(e) = self.load_portable(snapshot) {
                    log::warn!("session {}: rejected snapshot for {}: {}", self.session_id, graph, e);
                    return RelayNotice::RejectedSnapshot(e);
                }
                for entry in &presence {
                    self.apply_presence(entry);
                }
                self.announce();
                RelayNotice::Joined {
                    graph,
                    peer_count,
                    version,
                }
            }
            ServerMessage::PeerJoined { peer_id } => RelayNotice::PeerJoined { peer_id },
            ServerMessage::PeerLeft { peer_id } => RelayNotice::PeerLeft { peer_id },
            ServerMessage::Event { event } => RelayNotice::Remote(self.apply_remote(&event)),
            ServerMessage::Presence { presence } => RelayNotice::Remote(self.apply_presence(&presence)),
            ServerMessage::PresenceLeft { user_id } => {
                self.peers.leave(&user_id);
                RelayNotice::Remote(RemoteOutcome::PresenceLeft(user_id))
            }
            ServerMessage::Saved { version } => RelayNotice::Saved { version },
            ServerMessage::Error { message } => RelayNotice::Error { message },
        }
    }

    // --- Outbound ---

    /// Take pending outgoing messages (drains the queue).
    pub fn take_outgoing(&mut self) -> Vec<ChannelMessage> {
        std::mem::take(&mut self.outgoing)
    }

    /// Check if there are pending outgoing messages.
    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Drain the outbox as relay client messages.
    pub fn take_client_messages(&mut self) -> Vec<ClientMessage> {
        self.take_outgoing().into_iter().map(ClientMessage::from).collect()
    }

    /// Drain the outbox as encoded relay client messages.
    pub fn client_messages(&mut self) -> Vec<String> {
        self.take_client_messages()
            .into_iter()
            .filter_map(|msg| match msg.to_json() {
                Ok(json) => Some(json),
                Err(e) => {
                    log::warn!("session {}: failed to encode message: {}", self.session_id, e);
                    None
                }
            })
            .collect()
    }

    // --- Presence ---

    /// This session's own presence entry.
    pub fn presence(&self) -> &PresenceEntry {
        &self.presence
    }

    /// Presence of other users, ordered by user id.
    pub fn peers(&self) -> Vec<PresenceEntry> {
        self.peers.list()
    }

    /// User holding a lock on `node_id`, if any (including this session).
    pub fn locked_by(&self, node_id: &str) -> Option<&str> {
        if self.presence.locked_node_ids.contains(node_id) {
            return Some(self.presence.user_id.as_str());
        }
        self.peers.locked_by(node_id)
    }

    /// Broadcast the current local presence.
    pub fn announce(&mut self) {
        self.presence.last_seen = now_ms();
        self.outgoing.push(ChannelMessage::Presence {
            origin_session_id: self.session_id.clone(),
            presence: PresenceEvent::from(&self.presence),
        });
    }

    /// Broadcast that this session's user is leaving.
    pub fn depart(&mut self) {
        self.outgoing.push(ChannelMessage::PresenceLeft {
            origin_session_id: self.session_id.clone(),
            user_id: self.presence.user_id.clone(),
        });
    }

    pub fn set_user_info(&mut self, name: impl Into<String>, color: impl Into<String>) {
        self.presence.display_name = name.into();
        self.presence.color = color.into();
        self.announce();
    }

    pub fn set_cursor(&mut self, cursor: Point) {
        self.presence.cursor = cursor;
        self.announce();
    }

    /// Advisory lock on a node. Returns false if another user holds it.
    pub fn lock_node(&mut self, node_id: &str) -> bool {
        if self.peers.locked_by(node_id).is_some() {
            return false;
        }
        if self.presence.locked_node_ids.insert(node_id.to_string()) {
            self.announce();
        }
        true
    }

    /// Release a lock. Returns false if this session did not hold it.
    pub fn unlock_node(&mut self, node_id: &str) -> bool {
        let released = self.presence.locked_node_ids.remove(node_id);
        if released {
            self.announce();
        }
        released
    }

    /// Drop peers not heard from within the configured timeout.
    pub fn expire_stale(&mut self, now_ms: u64) -> Vec<String> {
        let expired = self.peers.expire_stale(now_ms, self.config.presence_timeout_ms);
        for user_id in &expired {
            log::warn!("session {}: presence of {} timed out", self.session_id, user_id);
        }
        expired
    }
}

impl From<ChannelMessage> for ClientMessage {
    fn from(msg: ChannelMessage) -> Self {
        match msg {
            ChannelMessage::Graph(event) => ClientMessage::Event { event },
            ChannelMessage::Presence { presence, .. } => ClientMessage::Presence { presence },
            ChannelMessage::PresenceLeft { user_id, .. } => ClientMessage::PresenceLeft { user_id },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;
    use crate::graph::{Edge, Node, NodeKind};

    fn session(id: &str) -> Session {
        Session::new(id, format!("user-{}", id), EngineConfig::default())
    }

    fn graph_events(msgs: Vec<ChannelMessage>) -> Vec<GraphEvent> {
        msgs.into_iter()
            .filter_map(|m| match m {
                ChannelMessage::Graph(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    fn relay(from: &mut Session, to: &mut Session) -> Vec<RemoteOutcome> {
        from.take_outgoing().iter().map(|m| to.receive(m)).collect()
    }

    fn seed(s: &mut Session) {
        s.execute(Command::create_node(Node::new("n1", NodeKind::Task, Point::new(100.0, 200.0))))
            .unwrap();
        s.execute(Command::create_node(Node::new("n2", NodeKind::Agent, Point::new(300.0, 400.0))))
            .unwrap();
        s.execute(Command::create_edge(Edge::new("e1", "n1", "out", "n2", "in")))
            .unwrap();
    }

    #[test]
    fn test_execute_publishes_diff() {
        let mut a = session("A");
        seed(&mut a);
        let events = graph_events(a.take_outgoing());
        let names: Vec<_> = events.iter().map(|e| e.payload.name()).collect();
        assert_eq!(names, vec!["node_created", "node_created", "edge_created"]);
        assert!(events.iter().all(|e| e.origin_session_id == "A"));
        assert!(events.windows(2).all(|w| w[0].timestamp_ms < w[1].timestamp_ms));
        assert!(!a.has_outgoing());
    }

    #[test]
    fn test_remote_events_converge_and_skip_history() {
        let mut a = session("A");
        let mut b = session("B");
        seed(&mut a);
        let outcomes = relay(&mut a, &mut b);
        assert!(outcomes.iter().all(|o| *o == RemoteOutcome::Applied));
        assert_eq!(a.graph(), b.graph());
        assert!(!b.history().can_undo());

        let n1 = a.graph().clone();
        a.execute(Command::delete_node(&n1, "n1")).unwrap();
        relay(&mut a, &mut b);
        assert_eq!(b.graph().node_count(), 1);
        assert_eq!(b.graph().edge_count(), 0);

        a.undo().unwrap();
        relay(&mut a, &mut b);
        assert_eq!(a.graph(), &n1);
        assert_eq!(b.graph(), &n1);
    }

    #[test]
    fn test_own_echo_ignored() {
        let mut a = session("A");
        seed(&mut a);
        let before = a.graph().clone();
        for msg in a.take_outgoing() {
            assert_eq!(a.receive(&msg), RemoteOutcome::Echo);
        }
        assert_eq!(a.graph(), &before);
    }

    #[test]
    fn test_invalid_remote_event_dropped() {
        let mut a = session("A");
        let before = a.graph().clone();
        let event = GraphEvent::new(
            EventPayload::NodeMoved {
                id: "n1".into(),
                position: Point::new(5.0, 5.0),
            },
            "B",
            1,
        );
        let outcome = a.receive(&ChannelMessage::Graph(event));
        assert_eq!(outcome, RemoteOutcome::Dropped(GraphError::NodeNotFound("n1".into())));
        assert_eq!(a.graph(), &before);
    }

    #[test]
    fn test_last_writer_wins_by_arrival() {
        let mut a = session("A");
        let mut b = session("B");
        seed(&mut a);
        relay(&mut a, &mut b);

        let ga = a.graph().clone();
        a.execute(Command::move_node(&ga, "n1", Point::new(1.0, 1.0))).unwrap();
        let gb = b.graph().clone();
        b.execute(Command::move_node(&gb, "n1", Point::new(2.0, 2.0))).unwrap();

        relay(&mut a, &mut b);
        relay(&mut b, &mut a);
        // Each side keeps whatever arrived last.
        assert_eq!(a.graph().get_node("n1").unwrap().position, Point::new(2.0, 2.0));
        assert_eq!(b.graph().get_node("n1").unwrap().position, Point::new(1.0, 1.0));
    }

    #[test]
    fn test_undo_only_reverts_local_actions() {
        let mut a = session("A");
        let mut b = session("B");
        seed(&mut a);
        relay(&mut a, &mut b);

        b.execute(Command::create_node(Node::new("b1", NodeKind::Note, Point::ZERO)))
            .unwrap();
        relay(&mut b, &mut a);
        assert!(a.graph().contains_node("b1"));

        a.undo().unwrap(); // removes e1, not b1
        assert!(a.graph().contains_node("b1"));
        assert!(!a.graph().contains_edge("e1"));
    }

    #[test]
    fn test_failed_local_command_publishes_nothing() {
        let mut a = session("A");
        let err = a
            .execute(Command::create_edge(Edge::new("e", "x", "out", "y", "in")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert!(!a.has_outgoing());
        assert_eq!(a.undo().unwrap_err().kind(), ErrorKind::NothingToDo);
    }

    #[test]
    fn test_partial_restore_committed_and_broadcast() {
        let mut a = session("A");
        let mut b = session("B");
        seed(&mut a);
        relay(&mut a, &mut b);

        let g = a.graph().clone();
        a.execute(Command::delete_node(&g, "n1")).unwrap();
        relay(&mut a, &mut b);

        // B deletes n2 so edge e1 can no longer be restored.
        let g = b.graph().clone();
        b.execute(Command::delete_node(&g, "n2")).unwrap();
        relay(&mut b, &mut a);

        let err = a.undo().unwrap_err();
        assert!(matches!(
            err,
            SessionError::History(HistoryError::Command(CommandError::PartialRestore { .. }))
        ));
        assert!(a.graph().contains_node("n1"));
        assert!(a.history().can_redo());
        relay(&mut a, &mut b);
        assert_eq!(a.graph(), b.graph());
    }

    #[test]
    fn test_presence_flow() {
        let mut a = session("A");
        let mut b = session("B");
        a.set_user_info("Ada", "#e03131");
        a.set_cursor(Point::new(10.0, 20.0));
        assert!(a.lock_node("n1"));
        relay(&mut a, &mut b);

        let peers = b.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].display_name, "Ada");
        assert_eq!(peers[0].cursor, Point::new(10.0, 20.0));
        assert_eq!(b.locked_by("n1"), Some("user-A"));
        assert!(!b.lock_node("n1"));

        assert!(a.unlock_node("n1"));
        assert!(!a.unlock_node("n1"));
        a.depart();
        let outcomes = relay(&mut a, &mut b);
        assert_eq!(outcomes.last(), Some(&RemoteOutcome::PresenceLeft("user-A".into())));
        assert!(b.peers().is_empty());
    }

    #[test]
    fn test_far_future_timestamp_does_not_poison_clock() {
        let mut a = session("A");
        seed(&mut a);
        a.take_outgoing();

        let event = GraphEvent::new(
            EventPayload::NodeMoved {
                id: "n1".into(),
                position: Point::new(5.0, 5.0),
            },
            "B",
            u64::MAX,
        );
        assert_eq!(a.receive(&ChannelMessage::Graph(event)), RemoteOutcome::Applied);

        let current = a.graph().clone();
        a.execute(Command::move_node(&current, "n1", Point::new(6.0, 6.0))).unwrap();
        a.undo().unwrap();
        a.redo().unwrap();

        let events = graph_events(a.take_outgoing());
        assert_eq!(events.len(), 3);
        let bound = now_ms() + MAX_CLOCK_SKEW_MS + 1_000;
        assert!(events.iter().all(|e| e.timestamp_ms < bound));
        assert!(events.windows(2).all(|w| w[0].timestamp_ms < w[1].timestamp_ms));
    }

    #[test]
    fn test_clock_saturates_at_max() {
        let mut a = session("A");
        a.clock = u64::MAX;
        assert_eq!(a.tick(), u64::MAX);
    }

    #[test]
    fn test_same_user_in_two_sessions_sees_each_other() {
        let mut tab1 = Session::new("tab-1", "ada", EngineConfig::default());
        let mut tab2 = Session::new("tab-2", "ada", EngineConfig::default());
        tab1.set_cursor(Point::new(3.0, 4.0));
        assert!(tab1.lock_node("n1"));

        let outcomes = relay(&mut tab1, &mut tab2);
        assert_eq!(outcomes.last(), Some(&RemoteOutcome::PresenceUpdated("ada".into())));
        let peers = tab2.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].cursor, Point::new(3.0, 4.0));
        assert_eq!(tab2.locked_by("n1"), Some("ada"));

        // The session's own messages are still echoes.
        tab2.announce();
        for msg in tab2.take_outgoing() {
            assert_eq!(tab2.receive(&msg), RemoteOutcome::Echo);
        }
    }

    #[test]
    fn test_expire_stale_peers() {
        let mut a = session("A");
        let mut b = session("B");
        a.announce();
        relay(&mut a, &mut b);
        assert_eq!(b.peers().len(), 1);

        let timeout = b.config().presence_timeout_ms;
        assert!(b.expire_stale(now_ms()).is_empty());
        assert_eq!(b.expire_stale(now_ms() + timeout + 1_000), vec!["user-A".to_string()]);
    }

    #[test]
    fn test_relay_messages() {
        let mut a = session("A");
        a.execute(Command::create_node(Node::new("n1", NodeKind::Task, Point::ZERO)))
            .unwrap();
        let out = a.client_messages();
        assert_eq!(out.len(), 1);
        assert!(out[0].contains("\"type\":\"event\""));
        assert!(out[0].contains("node_created"));

        let mut b = session("B");
        let joined = ServerMessage::Joined {
            graph: "g".into(),
            peer_count: 2,
            snapshot: a.graph().to_portable(),
            version: 4,
            presence: vec![],
        };
        let notice = b.handle_server_message(&joined.to_json().unwrap());
        assert_eq!(
            notice,
            Some(RelayNotice::Joined {
                graph: "g".into(),
                peer_count: 2,
                version: 4
            })
        );
        assert_eq!(b.graph(), a.graph());
        assert!(b.has_outgoing());

        let forwarded = ServerMessage::Event {
            event: GraphEvent::new(EventPayload::NodeDeleted { id: "zz".into() }, "A", 3),
        };
        assert!(matches!(
            b.handle_server_message(&forwarded.to_json().unwrap()),
            Some(RelayNotice::Remote(RemoteOutcome::Dropped(_)))
        ));
        assert_eq!(b.handle_server_message("not json"), None);
    }

    #[test]
    fn test_load_portable_clears_history() {
        let mut a = session("A");
        seed(&mut a);
        let snapshot = a.graph().to_portable();
        a.load_portable(snapshot).unwrap();
        assert!(!a.history().can_undo());
        assert_eq!(a.graph().node_count(), 2);
    }
}
