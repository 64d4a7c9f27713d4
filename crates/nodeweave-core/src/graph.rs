//! Immutable graph store.
//!
//! A [`Graph`] is a value: every mutator borrows the current graph and returns
//! a new one, leaving the input untouched whether the operation succeeds or
//! fails. Nodes and edges reference each other only by string id, so the
//! value stays free of reference cycles even when the logical graph has them.

use kurbo::Point;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Canvas position of a node.
pub type Position = Point;

/// Free-form node and edge metadata.
pub type Metadata = Map<String, Value>;

/// Graph store errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("Duplicate id: {0}")]
    DuplicateId(String),
    #[error("Node not found: {0}")]
    NodeNotFound(String),
    #[error("Edge not found: {0}")]
    EdgeNotFound(String),
    #[error("Source node '{node}' of edge '{edge}' not found")]
    SourceNotFound { edge: String, node: String },
    #[error("Target node '{node}' of edge '{edge}' not found")]
    TargetNotFound { edge: String, node: String },
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),
    #[error("Invalid portable format: {0}")]
    InvalidPortableFormat(String),
}

/// Result type for graph store operations.
pub type GraphResult<T> = Result<T, GraphError>;

/// Classification of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum NodeKind {
    Task,
    Agent,
    Trigger,
    Condition,
    Action,
    Note,
    /// User-defined kind, written as `custom:<name>`.
    Custom(String),
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Task => write!(f, "task"),
            NodeKind::Agent => write!(f, "agent"),
            NodeKind::Trigger => write!(f, "trigger"),
            NodeKind::Condition => write!(f, "condition"),
            NodeKind::Action => write!(f, "action"),
            NodeKind::Note => write!(f, "note"),
            NodeKind::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(NodeKind::Task),
            "agent" => Ok(NodeKind::Agent),
            "trigger" => Ok(NodeKind::Trigger),
            "condition" => Ok(NodeKind::Condition),
            "action" => Ok(NodeKind::Action),
            "note" => Ok(NodeKind::Note),
            s => match s.strip_prefix("custom:") {
                Some(name) if !name.is_empty() => Ok(NodeKind::Custom(name.to_string())),
                _ => Err(format!("Unknown node kind: {}", s)),
            },
        }
    }
}

impl From<NodeKind> for String {
    fn from(kind: NodeKind) -> Self {
        kind.to_string()
    }
}

impl TryFrom<String> for NodeKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A vertex of the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    pub position: Position,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Node {
    /// Create a node with empty metadata.
    pub fn new(id: impl Into<String>, kind: NodeKind, position: Position) -> Self {
        Self {
            id: id.into(),
            kind,
            position,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    fn validate(&self) -> GraphResult<()> {
        require_id("node", &self.id)?;
        if let NodeKind::Custom(name) = &self.kind {
            if name.trim().is_empty() {
                return Err(GraphError::InvalidSchema(format!(
                    "node '{}' has an empty custom kind",
                    self.id
                )));
            }
        }
        require_finite(&self.id, self.position)
    }
}

/// A directed connection between two node ports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Edge {
    pub id: String,
    pub source_node_id: String,
    pub source_port: String,
    pub target_node_id: String,
    pub target_port: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Edge {
    /// Create an edge with empty metadata.
    pub fn new(
        id: impl Into<String>,
        source_node_id: impl Into<String>,
        source_port: impl Into<String>,
        target_node_id: impl Into<String>,
        target_port: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_node_id: source_node_id.into(),
            source_port: source_port.into(),
            target_node_id: target_node_id.into(),
            target_port: target_port.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Whether either endpoint is `node_id`.
    pub fn touches(&self, node_id: &str) -> bool {
        self.source_node_id == node_id || self.target_node_id == node_id
    }

    fn validate(&self) -> GraphResult<()> {
        require_id("edge", &self.id)?;
        require_id("edge source", &self.source_node_id)?;
        require_id("edge target", &self.target_node_id)?;
        if self.source_port.trim().is_empty() || self.target_port.trim().is_empty() {
            return Err(GraphError::InvalidSchema(format!(
                "edge '{}' has an empty port name",
                self.id
            )));
        }
        Ok(())
    }
}

fn require_id(what: &str, id: &str) -> GraphResult<()> {
    if id.trim().is_empty() {
        return Err(GraphError::InvalidSchema(format!("{} id must not be empty", what)));
    }
    Ok(())
}

fn require_finite(id: &str, position: Position) -> GraphResult<()> {
    if !position.x.is_finite() || !position.y.is_finite() {
        return Err(GraphError::InvalidSchema(format!(
            "node '{}' has a non-finite position ({}, {})",
            id, position.x, position.y
        )));
    }
    Ok(())
}

/// Order-independent, JSON-friendly form of a graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortableGraph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

/// An immutable graph snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Graph {
    nodes: BTreeMap<String, Node>,
    edges: BTreeMap<String, Edge>,
}

impl Graph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a graph with `node` added.
    pub fn add_node(&self, node: Node) -> GraphResult<Graph> {
        node.validate()?;
        if self.nodes.contains_key(&node.id) {
            return Err(GraphError::DuplicateId(node.id));
        }
        let mut next = self.clone();
        next.nodes.insert(node.id.clone(), node);
        Ok(next)
    }

    /// Return a graph with `edge` added. Both endpoints must already exist.
    pub fn add_edge(&self, edge: Edge) -> GraphResult<Graph> {
        edge.validate()?;
        if self.edges.contains_key(&edge.id) {
            return Err(GraphError::DuplicateId(edge.id));
        }
        if !self.nodes.contains_key(&edge.source_node_id) {
            return Err(GraphError::SourceNotFound {
                edge: edge.id,
                node: edge.source_node_id,
            });
        }
        if !self.nodes.contains_key(&edge.target_node_id) {
            return Err(GraphError::TargetNotFound {
                edge: edge.id,
                node: edge.target_node_id,
            });
        }
        let mut next = self.clone();
        next.edges.insert(edge.id.clone(), edge);
        Ok(next)
    }

    /// Return a graph with node `id` at `position`.
    pub fn move_node(&self, id: &str, position: Position) -> GraphResult<Graph> {
        require_finite(id, position)?;
        if !self.nodes.contains_key(id) {
            return Err(GraphError::NodeNotFound(id.to_string()));
        }
        let mut next = self.clone();
        if let Some(node) = next.nodes.get_mut(id) {
            node.position = position;
        }
        Ok(next)
    }

    /// Return a graph without node `id` and without any edge touching it.
    pub fn delete_node(&self, id: &str) -> GraphResult<Graph> {
        if !self.nodes.contains_key(id) {
            return Err(GraphError::NodeNotFound(id.to_string()));
        }
        let mut next = self.clone();
        next.nodes.remove(id);
        next.edges.retain(|_, edge| !edge.touches(id));
        Ok(next)
    }

    /// Return a graph without edge `id`.
    pub fn delete_edge(&self, id: &str) -> GraphResult<Graph> {
        if !self.edges.contains_key(id) {
            return Err(GraphError::EdgeNotFound(id.to_string()));
        }
        let mut next = self.clone();
        next.edges.remove(id);
        Ok(next)
    }

    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get_edge(&self, id: &str) -> Option<&Edge> {
        self.edges.get(id)
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn contains_edge(&self, id: &str) -> bool {
        self.edges.contains_key(id)
    }

    /// Nodes ordered by id.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Edges ordered by id.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    /// Edges with `node_id` as source or target.
    pub fn incident_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.values().filter(move |edge| edge.touches(node_id))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    /// Export as plain node and edge lists.
    pub fn to_portable(&self) -> PortableGraph {
        PortableGraph {
            nodes: self.nodes.values().cloned().collect(),
            edges: self.edges.values().cloned().collect(),
        }
    }

    /// Rebuild a graph from portable lists, enforcing every graph invariant.
    ///
    /// Nodes are inserted first so edges may appear in any order relative to
    /// their endpoints.
    pub fn from_portable(data: PortableGraph) -> GraphResult<Graph> {
        let mut graph = Graph::new();
        for node in data.nodes {
            node.validate()?;
            if graph.nodes.contains_key(&node.id) {
                return Err(GraphError::DuplicateId(node.id));
            }
            graph.nodes.insert(node.id.clone(), node);
        }
        for edge in data.edges {
            graph = graph.add_edge(edge)?;
        }
        Ok(graph)
    }

    /// Rebuild a graph from untyped JSON.
    pub fn from_portable_value(value: &Value) -> GraphResult<Graph> {
        let data = PortableGraph::deserialize(value)
            .map_err(|e| GraphError::InvalidPortableFormat(e.to_string()))?;
        Self::from_portable(data)
    }

    /// Serialize to pretty JSON in portable form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.to_portable())
    }

    /// Deserialize from portable JSON.
    pub fn from_json(json: &str) -> GraphResult<Graph> {
        let data: PortableGraph = serde_json::from_str(json)
            .map_err(|e| GraphError::InvalidPortableFormat(e.to_string()))?;
        Self::from_portable(data)
    }
}


/// Generators for randomized graph tests.
#[cfg(test)]
pub(crate) mod strategies {
    use super::*;
    use proptest::prelude::*;

    /// Coordinates on a quarter-unit grid; they survive a JSON round trip exactly.
    pub fn position() -> impl Strategy<Value = Position> {
        (-20_000i32..20_000, -20_000i32..20_000)
            .prop_map(|(x, y)| Point::new(f64::from(x) / 4.0, f64::from(y) / 4.0))
    }

    pub fn kind() -> impl Strategy<Value = NodeKind> {
        prop_oneof![
            Just(NodeKind::Task),
            Just(NodeKind::Agent),
            Just(NodeKind::Trigger),
            Just(NodeKind::Condition),
            Just(NodeKind::Action),
            Just(NodeKind::Note),
            "[a-z]{1,8}".prop_map(NodeKind::Custom),
        ]
    }

    pub fn metadata() -> impl Strategy<Value = Metadata> {
        prop::collection::btree_map("[a-z]{1,6}", any::<i32>(), 0..3)
            .prop_map(|entries| entries.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
    }

    fn port() -> impl Strategy<Value = String> {
        "[a-z]{1,5}"
    }

    /// A valid graph of up to eight nodes. Edges pick endpoints by index, so
    /// self-loops and parallel edges show up too.
    pub fn graph() -> impl Strategy<Value = Graph> {
        let nodes = prop::collection::vec((kind(), position(), metadata()), 0..8);
        let edges = prop::collection::vec((any::<usize>(), any::<usize>(), port(), port(), metadata()), 0..12);
        (nodes, edges).prop_map(|(nodes, edges)| {
            let mut graph = Graph::new();
            for (i, (kind, position, metadata)) in nodes.into_iter().enumerate() {
                let node = Node::new(format!("n{}", i), kind, position).with_metadata(metadata);
                graph = graph.add_node(node).unwrap_or_else(|e| panic!("generated node rejected: {}", e));
            }
            let ids: Vec<String> = graph.nodes().map(|n| n.id.clone()).collect();
            if ids.is_empty() {
                return graph;
            }
            for (i, (from, to, out, inp, metadata)) in edges.into_iter().enumerate() {
                let edge = Edge::new(format!("e{}", i), &ids[from % ids.len()], out, &ids[to % ids.len()], inp)
                    .with_metadata(metadata);
                graph = graph.add_edge(edge).unwrap_or_else(|e| panic!("generated edge rejected: {}", e));
            }
            graph
        })
    }

    /// A graph together with one of its node ids.
    pub fn graph_with_node() -> impl Strategy<Value = (Graph, String)> {
        (graph(), any::<usize>()).prop_filter_map("graph has no nodes", |(graph, pick)| {
            let ids: Vec<String> = graph.nodes().map(|n| n.id.clone()).collect();
            let id = ids.get(pick % ids.len().max(1))?.clone();
            Some((graph, id))
        })
    }
}
