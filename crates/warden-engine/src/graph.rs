//! Dependency graphs of tasks with guarded edges.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef as _;
use petgraph::{Direction, algo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::task::{MetaTask, Task};

/// Controls whether a successor runs after a predecessor's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Guard {
    /// Successor runs only if the predecessor succeeded.
    OnSuccess,
    /// Successor runs once the predecessor reaches any terminal state.
    /// Reserved for cleanup that must survive upstream failure.
    OnCompletion,
}

/// Handle to one node of a task graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(NodeIndex);

/// One schedulable node of a task graph.
#[derive(Clone)]
pub enum TaskNode {
    /// A unit of work.
    Leaf(Arc<dyn Task>),
    /// A node that expands into a subgraph after running once.
    Meta(Arc<dyn MetaTask>),
}

impl TaskNode {
    /// The node's display name.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Leaf(task) => task.name(),
            Self::Meta(task) => task.name(),
        }
    }
}

/// Dependency graph of tasks, owned by exactly one job.
///
/// Nodes are never removed, so node handles stay valid across merges and
/// splices.
#[derive(Default)]
pub struct TaskGraph {
    graph: DiGraph<TaskNode, Guard>,
}

impl TaskGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an unconnected task node.
    pub fn add_task(&mut self, task: Arc<dyn Task>) -> NodeId {
        NodeId(self.graph.add_node(TaskNode::Leaf(task)))
    }

    /// Adds an unconnected expanding node.
    pub fn add_meta(&mut self, task: Arc<dyn MetaTask>) -> NodeId {
        NodeId(self.graph.add_node(TaskNode::Meta(task)))
    }

    /// Adds a guarded dependency edge.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, guard: Guard) {
        self.graph.add_edge(from.0, to.0, guard);
    }

    /// Adds `task` as a successor of every current terminal node.
    pub fn append_task(&mut self, task: Arc<dyn Task>, guard: Guard) -> NodeId {
        let terminals = self.terminal_indices();
        let node = self.graph.add_node(TaskNode::Leaf(task));
        for terminal in terminals {
            self.graph.add_edge(terminal, node, guard);
        }
        NodeId(node)
    }

    /// Adds an expanding node as a successor of every current terminal node.
    pub fn append_meta(&mut self, task: Arc<dyn MetaTask>, guard: Guard) -> NodeId {
        let terminals = self.terminal_indices();
        let node = self.graph.add_node(TaskNode::Meta(task));
        for terminal in terminals {
            self.graph.add_edge(terminal, node, guard);
        }
        NodeId(node)
    }

    /// Merges `other`, wiring its entry nodes as successors of the current
    /// terminal set and preserving its internal edges.
    pub fn append_graph(&mut self, other: Self, guard: Guard) {
        let terminals = self.terminal_indices();
        let entries = other.entry_indices();
        let remap = self.merge(other);
        for terminal in terminals {
            for entry in &entries {
                self.graph.add_edge(terminal, remap[entry], guard);
            }
        }
    }

    /// Whether the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Detect cycles (invalid graph)
    #[must_use]
    pub fn has_cycles(&self) -> bool {
        algo::is_cyclic_directed(&self.graph)
    }

    /// Names of every node, in insertion order.
    #[must_use]
    pub fn node_names(&self) -> Vec<String> {
        self.graph.node_weights().map(TaskNode::name).collect()
    }

    /// Finds the first node with the given name.
    #[must_use]
    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.graph
            .node_indices()
            .find(|&index| self.graph[index].name() == name)
            .map(NodeId)
    }

    /// Whether a directed path exists from `from` to `to`.
    #[must_use]
    pub fn has_path(&self, from: NodeId, to: NodeId) -> bool {
        algo::has_path_connecting(&self.graph, from.0, to.0, None)
    }

    pub(crate) fn node_ids(&self) -> Vec<NodeId> {
        self.graph.node_indices().map(NodeId).collect()
    }

    pub(crate) fn node(&self, node: NodeId) -> &TaskNode {
        &self.graph[node.0]
    }

    pub(crate) fn incoming(&self, node: NodeId) -> Vec<(NodeId, Guard)> {
        self.graph
            .edges_directed(node.0, Direction::Incoming)
            .map(|edge| (NodeId(edge.source()), *edge.weight()))
            .collect()
    }

    /// Splices `subgraph` in place of the already-finished node `at`.
    ///
    /// Entry nodes hang off `at`; terminal nodes feed `at`'s original
    /// successors under the original guards, so the successors now wait
    /// for the expanded work. An empty subgraph adds nothing and the
    /// original edges alone carry the outcome. Returns the spliced node
    /// handles.
    pub(crate) fn splice(&mut self, at: NodeId, subgraph: Self) -> Vec<NodeId> {
        let successors: Vec<(NodeIndex, Guard)> = self
            .graph
            .edges_directed(at.0, Direction::Outgoing)
            .map(|edge| (edge.target(), *edge.weight()))
            .collect();
        let entries = subgraph.entry_indices();
        let terminals = subgraph.terminal_indices();
        let remap = self.merge(subgraph);

        for entry in &entries {
            self.graph.add_edge(at.0, remap[entry], Guard::OnSuccess);
        }
        for terminal in &terminals {
            for (successor, guard) in &successors {
                self.graph.add_edge(remap[terminal], *successor, *guard);
            }
        }
        remap.values().map(|&index| NodeId(index)).collect()
    }

    fn merge(&mut self, other: Self) -> HashMap<NodeIndex, NodeIndex> {
        let (nodes, edges) = other.graph.into_nodes_edges();
        let mut remap = HashMap::new();
        for (position, node) in nodes.into_iter().enumerate() {
            let new_index = self.graph.add_node(node.weight);
            remap.insert(NodeIndex::new(position), new_index);
        }
        for edge in edges {
            let source = remap[&edge.source()];
            let target = remap[&edge.target()];
            self.graph.add_edge(source, target, edge.weight);
        }
        remap
    }

    fn entry_indices(&self) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&index| {
                self.graph
                    .edges_directed(index, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect()
    }

    fn terminal_indices(&self) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&index| {
                self.graph
                    .edges_directed(index, Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .collect()
    }
}
