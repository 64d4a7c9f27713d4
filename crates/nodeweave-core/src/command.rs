//! Reversible graph mutations.
//!
//! Each [`Command`] carries whatever state it needs to be undone. The graph
//! store keeps no history, so deletes and moves capture their "before" state
//! when the command is constructed.

use crate::graph::{Edge, Graph, GraphError, Node, Position};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Command layer errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("No captured snapshot for '{0}'")]
    NoCapturedSnapshot(String),
    /// Undo of a node delete restored the node but not every captured edge.
    /// The partially restored graph is kept.
    #[error("Partially restored node '{node_id}': {} edge(s) could not be re-added", .failed.len())]
    PartialRestore {
        node_id: String,
        graph: Box<Graph>,
        failed: Vec<(String, GraphError)>,
    },
}

/// A node together with the edges it had when it was deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node: Node,
    pub edges: Vec<Edge>,
}

/// A reversible, self-describing graph mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    CreateNode {
        node: Node,
    },
    DeleteNode {
        node_id: String,
        snapshot: Option<NodeSnapshot>,
    },
    CreateEdge {
        edge: Edge,
    },
    DeleteEdge {
        edge_id: String,
        snapshot: Option<Edge>,
    },
    MoveNode {
        node_id: String,
        from: Option<Position>,
        to: Position,
    },
}

impl Command {
    pub fn create_node(node: Node) -> Self {
        Command::CreateNode { node }
    }

    /// Capture node `id` and its incident edges from `graph`.
    ///
    /// A missing node yields a command without snapshot; it fails on execute
    /// and on undo instead of inventing an empty node.
    pub fn delete_node(graph: &Graph, id: impl Into<String>) -> Self {
        let node_id = id.into();
        let snapshot = graph.get_node(&node_id).map(|node| NodeSnapshot {
            node: node.clone(),
            edges: graph.incident_edges(&node_id).cloned().collect(),
        });
        Command::DeleteNode { node_id, snapshot }
    }

    pub fn create_edge(edge: Edge) -> Self {
        Command::CreateEdge { edge }
    }

    pub fn delete_edge(graph: &Graph, id: impl Into<String>) -> Self {
        let edge_id = id.into();
        let snapshot = graph.get_edge(&edge_id).cloned();
        Command::DeleteEdge { edge_id, snapshot }
    }

    /// Capture the current position of node `id` so the move can be undone.
    pub fn move_node(graph: &Graph, id: impl Into<String>, to: Position) -> Self {
        let node_id = id.into();
        let from = graph.get_node(&node_id).map(|node| node.position);
        Command::MoveNode { node_id, from, to }
    }

    /// Apply the forward transformation.
    pub fn execute(&self, graph: &Graph) -> Result<Graph, CommandError> {
        match self {
            Command::CreateNode { node } => Ok(graph.add_node(node.clone())?),
            Command::DeleteNode { node_id, snapshot } => {
                if snapshot.is_none() && graph.contains_node(node_id) {
                    // Deleting without a snapshot could never be undone.
                    return Err(CommandError::NoCapturedSnapshot(node_id.clone()));
                }
                Ok(graph.delete_node(node_id)?)
            }
            Command::CreateEdge { edge } => Ok(graph.add_edge(edge.clone())?),
            Command::DeleteEdge { edge_id, .. } => Ok(graph.delete_edge(edge_id)?),
            Command::MoveNode { node_id, to, .. } => Ok(graph.move_node(node_id, *to)?),
        }
    }

    /// Apply the inverse transformation.
    pub fn undo(&self, graph: &Graph) -> Result<Graph, CommandError> {
        match self {
            Command::CreateNode { node } => Ok(graph.delete_node(&node.id)?),
            Command::DeleteNode { node_id, snapshot } => {
                let snapshot = snapshot
                    .as_ref()
                    .ok_or_else(|| CommandError::NoCapturedSnapshot(node_id.clone()))?;
                restore_node(graph, node_id, snapshot)
            }
            Command::CreateEdge { edge } => Ok(graph.delete_edge(&edge.id)?),
            Command::DeleteEdge { edge_id, snapshot } => {
                let edge = snapshot
                    .as_ref()
                    .ok_or_else(|| CommandError::NoCapturedSnapshot(edge_id.clone()))?;
                Ok(graph.add_edge(edge.clone())?)
            }
            Command::MoveNode { node_id, from, .. } => {
                let from = from.ok_or_else(|| CommandError::NoCapturedSnapshot(node_id.clone()))?;
                Ok(graph.move_node(node_id, from)?)
            }
        }
    }

    /// Human-readable label for menus and audit logs.
    pub fn describe(&self) -> String {
        match self {
            Command::CreateNode { node } => format!("Create {} node '{}'", node.kind, node.id),
            Command::DeleteNode { node_id, .. } => format!("Delete node '{}'", node_id),
            Command::CreateEdge { edge } => format!(
                "Connect '{}.{}' to '{}.{}'",
                edge.source_node_id, edge.source_port, edge.target_node_id, edge.target_port
            ),
            Command::DeleteEdge { edge_id, .. } => format!("Delete edge '{}'", edge_id),
            Command::MoveNode { node_id, to, .. } => {
                format!("Move node '{}' to ({}, {})", node_id, to.x, to.y)
            }
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Re-add a deleted node, then each captured edge independently.
fn restore_node(graph: &Graph, node_id: &str, snapshot: &NodeSnapshot) -> Result<Graph, CommandError> {
    let mut restored = graph.add_node(snapshot.node.clone())?;
    let mut failed = Vec::new();
    for edge in &snapshot.edges {
        match restored.add_edge(edge.clone()) {
            Ok(next) => restored = next,
            Err(e) => failed.push((edge.id.clone(), e)),
        }
    }
    if failed.is_empty() {
        Ok(restored)
    } else {
        Err(CommandError::PartialRestore {
            node_id: node_id.to_string(),
            graph: Box::new(restored),
            failed,
        })
    }
}


/// Generators for randomized command tests.
#[cfg(test)]
pub(crate) mod strategies {
    use super::*;
    use crate::graph::strategies::{kind, position};
    use crate::graph::NodeKind;
    use proptest::prelude::*;

    /// A command shape whose targets are resolved against a graph when built.
    #[derive(Debug, Clone)]
    pub enum Edit {
        CreateNode(NodeKind, Position),
        DeleteNode(usize),
        CreateEdge(usize, usize),
        DeleteEdge(usize),
        MoveNode(usize, Position),
        /// Targets an id the graph never has.
        MoveMissing(Position),
    }

    impl Edit {
        /// Build the command for `graph`. `step` keeps fresh ids unique
        /// across a sequence of edits.
        pub fn command(&self, graph: &Graph, step: usize) -> Command {
            let nodes: Vec<&str> = graph.nodes().map(|n| n.id.as_str()).collect();
            let edges: Vec<&str> = graph.edges().map(|e| e.id.as_str()).collect();

            match self {
                Edit::CreateNode(kind, at) => {
                    Command::create_node(Node::new(format!("new-n{}", step), kind.clone(), *at))
                }
                Edit::DeleteNode(i) => Command::delete_node(graph, pick(&nodes, *i)),
                Edit::CreateEdge(from, to) => Command::create_edge(Edge::new(
                    format!("new-e{}", step),
                    pick(&nodes, *from),
                    "out",
                    pick(&nodes, *to),
                    "in",
                )),
                Edit::DeleteEdge(i) => Command::delete_edge(graph, pick(&edges, *i)),
                Edit::MoveNode(i, to) => Command::move_node(graph, pick(&nodes, *i), *to),
                Edit::MoveMissing(to) => Command::move_node(graph, "missing", *to),
            }
        }
    }

    fn pick<'a>(ids: &[&'a str], i: usize) -> &'a str {
        ids.get(i % ids.len().max(1)).copied().unwrap_or("missing")
    }

    pub fn edit() -> impl Strategy<Value = Edit> {
        prop_oneof![
            (kind(), position()).prop_map(|(kind, at)| Edit::CreateNode(kind, at)),
            any::<usize>().prop_map(Edit::DeleteNode),
            (any::<usize>(), any::<usize>()).prop_map(|(from, to)| Edit::CreateEdge(from, to)),
            any::<usize>().prop_map(Edit::DeleteEdge),
            (any::<usize>(), position()).prop_map(|(i, to)| Edit::MoveNode(i, to)),
            position().prop_map(Edit::MoveMissing),
        ]
    }
}
