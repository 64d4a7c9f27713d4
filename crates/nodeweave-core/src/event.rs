//! Semantic graph diffs exchanged between sessions.
//!
//! Wire shape:
//! ```json
//! { "event": "node_moved", "origin_session_id": "a1", "timestamp_ms": 17,
//!   "payload": { "id": "n1", "position": { "x": 5.0, "y": 5.0 } } }
//! ```

use crate::graph::{Edge, Graph, GraphResult, Node, Position};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What changed in a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    NodeCreated { node: Node },
    /// Receivers cascade incident edges themselves.
    NodeDeleted { id: String },
    NodeMoved { id: String, position: Position },
    EdgeCreated { edge: Edge },
    EdgeDeleted { id: String },
}

impl EventPayload {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::NodeCreated { .. } => "node_created",
            EventPayload::NodeDeleted { .. } => "node_deleted",
            EventPayload::NodeMoved { .. } => "node_moved",
            EventPayload::EdgeCreated { .. } => "edge_created",
            EventPayload::EdgeDeleted { .. } => "edge_deleted",
        }
    }

    /// Id of the node or edge this payload is about.
    pub fn entity_id(&self) -> &str {
        match self {
            EventPayload::NodeCreated { node } => &node.id,
            EventPayload::EdgeCreated { edge } => &edge.id,
            EventPayload::NodeDeleted { id }
            | EventPayload::NodeMoved { id, .. }
            | EventPayload::EdgeDeleted { id } => id,
        }
    }
}

/// A diff tagged with its origin, as published on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEvent {
    #[serde(flatten)]
    pub payload: EventPayload,
    pub origin_session_id: String,
    pub timestamp_ms: u64,
}

impl GraphEvent {
    pub fn new(payload: EventPayload, origin_session_id: impl Into<String>, timestamp_ms: u64) -> Self {
        Self {
            payload,
            origin_session_id: origin_session_id.into(),
            timestamp_ms,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Compute the payloads that turn `before` into `after`.
///
/// Output order is safe to replay: node deletes, edge deletes, node creates,
/// edge creates, moves. Edges that disappear only because an endpoint node
/// was deleted are left to the receiver's cascade. A node whose kind or
/// metadata changed is sent as delete plus create.
pub fn diff(before: &Graph, after: &Graph) -> Vec<EventPayload> {
    let mut removed = BTreeSet::new();
    let mut created = Vec::new();
    let mut moved = Vec::new();

    for node in before.nodes() {
        match after.get_node(&node.id) {
            None => {
                removed.insert(node.id.as_str());
            }
            Some(now) if now.kind != node.kind || now.metadata != node.metadata => {
                removed.insert(node.id.as_str());
                created.push(EventPayload::NodeCreated { node: now.clone() });
            }
            Some(now) if now.position != node.position => moved.push(EventPayload::NodeMoved {
                id: now.id.clone(),
                position: now.position,
            }),
            Some(_) => {}
        }
    }
    for node in after.nodes() {
        if !before.contains_node(&node.id) {
            created.push(EventPayload::NodeCreated { node: node.clone() });
        }
    }

    let cascaded = |edge: &Edge| {
        removed.contains(edge.source_node_id.as_str()) || removed.contains(edge.target_node_id.as_str())
    };

    let mut payloads: Vec<EventPayload> = removed
        .iter()
        .map(|id| EventPayload::NodeDeleted { id: id.to_string() })
        .collect();
    payloads.extend(
        before
            .edges()
            .filter(|edge| !cascaded(*edge) && after.get_edge(&edge.id) != Some(*edge))
            .map(|edge| EventPayload::EdgeDeleted { id: edge.id.clone() }),
    );
    payloads.extend(created);
    payloads.extend(
        after
            .edges()
            .filter(|edge| cascaded(*edge) || before.get_edge(&edge.id) != Some(*edge))
            .map(|edge| EventPayload::EdgeCreated { edge: edge.clone() }),
    );
    payloads.extend(moved);
    payloads
}

/// Apply one payload through the graph store.
pub fn apply(graph: &Graph, payload: &EventPayload) -> GraphResult<Graph> {
    match payload {
        EventPayload::NodeCreated { node } => graph.add_node(node.clone()),
        EventPayload::NodeDeleted { id } => graph.delete_node(id),
        EventPayload::NodeMoved { id, position } => graph.move_node(id, *position),
        EventPayload::EdgeCreated { edge } => graph.add_edge(edge.clone()),
        EventPayload::EdgeDeleted { id } => graph.delete_edge(id),
    }
}

/// Apply payloads in order, stopping at the first failure.
pub fn apply_all(graph: &Graph, payloads: &[EventPayload]) -> GraphResult<Graph> {
    payloads.iter().try_fold(graph.clone(), |acc, payload| apply(&acc, payload))
}
