//! Runtime graph representation of a workflow.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use super::edge::WorkflowEdge;
use super::id::NodeId;
use super::node::WorkflowNode;
use super::workflow::Workflow;
use crate::error::{EngineError, EngineResult};

/// A workflow graph over petgraph's `DiGraph`, with id-to-index maps for
/// stable external identifiers.
#[derive(Debug, Clone, Default)]
pub struct WorkflowGraph {
    /// The underlying directed graph.
    graph: DiGraph<WorkflowNode, WorkflowEdge>,
    /// Mapping from NodeId to petgraph's NodeIndex.
    node_indices: HashMap<NodeId, NodeIndex>,
    /// Reverse mapping from NodeIndex to NodeId.
    index_to_id: HashMap<NodeIndex, NodeId>,
}

impl WorkflowGraph {
    /// Builds a runtime graph from a workflow definition.
    ///
    /// Fails with [`EngineError::DuplicateNode`] when two nodes share an
    /// id and [`EngineError::DanglingReference`] when an edge endpoint
    /// references a missing node. Both are structural.
    pub fn from_workflow(workflow: &Workflow) -> EngineResult<Self> {
        let mut graph = Self::default();

        for node in &workflow.nodes {
            if graph.node_indices.contains_key(&node.id) {
                return Err(EngineError::DuplicateNode { node_id: node.id });
            }
            let index = graph.graph.add_node(node.clone());
            graph.node_indices.insert(node.id, index);
            graph.index_to_id.insert(index, node.id);
        }

        for edge in &workflow.edges {
            let source = *graph.node_indices.get(&edge.source).ok_or(
                EngineError::DanglingReference {
                    edge_id: edge.id,
                    node_id: edge.source,
                },
            )?;
            let target = *graph.node_indices.get(&edge.target).ok_or(
                EngineError::DanglingReference {
                    edge_id: edge.id,
                    node_id: edge.target,
                },
            )?;
            graph.graph.add_edge(source, target, edge.clone());
        }

        Ok(graph)
    }

    /// Returns the number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of edges in the graph.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns whether the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Returns a reference to a node.
    pub fn node(&self, id: NodeId) -> Option<&WorkflowNode> {
        let index = self.node_indices.get(&id)?;
        self.graph.node_weight(*index)
    }

    /// Returns whether a node exists.
    pub fn contains_node(&self, id: NodeId) -> bool {
        self.node_indices.contains_key(&id)
    }

    /// Returns an iterator over all nodes.
    pub fn nodes(&self) -> impl Iterator<Item = &WorkflowNode> {
        self.graph.node_weights()
    }

    /// Returns an iterator over all node ids.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.node_indices.keys().copied()
    }

    /// Returns edges targeting a node, disabled edges included.
    pub fn incoming_edges(&self, id: NodeId) -> impl Iterator<Item = &WorkflowEdge> {
        self.edges_directed(id, Direction::Incoming)
    }

    /// Returns edges originating from a node, disabled edges included.
    pub fn outgoing_edges(&self, id: NodeId) -> impl Iterator<Item = &WorkflowEdge> {
        self.edges_directed(id, Direction::Outgoing)
    }

    fn edges_directed(
        &self,
        id: NodeId,
        direction: Direction,
    ) -> impl Iterator<Item = &WorkflowEdge> {
        let index = self.node_indices.get(&id).copied();
        index
            .into_iter()
            .flat_map(move |index| self.graph.edges_directed(index, direction))
            .map(|edge_ref| edge_ref.weight())
    }

    /// Returns the direct upstream dependencies of a node: sources of its
    /// non-disabled incoming edges, deduplicated, in stable id order.
    pub fn dependencies(&self, id: NodeId) -> Vec<NodeId> {
        let mut deps: Vec<NodeId> = self
            .incoming_edges(id)
            .filter(|edge| !edge.disabled)
            .map(|edge| edge.source)
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }

    /// Returns the direct downstream dependents of a node.
    pub fn dependents(&self, id: NodeId) -> Vec<NodeId> {
        let mut deps: Vec<NodeId> = self
            .outgoing_edges(id)
            .filter(|edge| !edge.disabled)
            .map(|edge| edge.target)
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }

    /// Returns nodes with no non-disabled incoming edges.
    pub fn roots(&self) -> Vec<NodeId> {
        let mut roots: Vec<NodeId> = self
            .node_ids()
            .filter(|id| self.dependencies(*id).is_empty())
            .collect();
        roots.sort();
        roots
    }

    pub(crate) fn index_of(&self, id: NodeId) -> Option<NodeIndex> {
        self.node_indices.get(&id).copied()
    }

    pub(crate) fn id_of(&self, index: NodeIndex) -> Option<NodeId> {
        self.index_to_id.get(&index).copied()
    }

    pub(crate) fn inner(&self) -> &DiGraph<WorkflowNode, WorkflowEdge> {
        &self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::edge::WorkflowEdge;
    use crate::graph::id::ProgramId;
    use crate::graph::node::WorkflowNode;

    fn node() -> WorkflowNode {
        WorkflowNode::program(ProgramId::new())
    }

    #[test]
    fn test_from_workflow_builds_maps() {
        let mut workflow = Workflow::new("demo");
        let a = workflow.add_node(node());
        let b = workflow.add_node(node());
        workflow.connect(a, b);

        let graph = WorkflowGraph::from_workflow(&workflow).unwrap();
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.dependencies(b), vec![a]);
        assert_eq!(graph.dependents(a), vec![b]);
        assert_eq!(graph.roots(), {
            let mut roots = vec![a];
            roots.sort();
            roots
        });
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut workflow = Workflow::new("demo");
        let duplicated = node();
        workflow.add_node(duplicated.clone());
        workflow.add_node(duplicated);

        let err = WorkflowGraph::from_workflow(&workflow).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateNode { .. }));
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let mut workflow = Workflow::new("demo");
        let a = workflow.add_node(node());
        workflow.add_edge(WorkflowEdge::data(a, NodeId::new()));

        let err = WorkflowGraph::from_workflow(&workflow).unwrap_err();
        assert!(matches!(err, EngineError::DanglingReference { .. }));
    }

    #[test]
    fn test_disabled_edges_excluded_from_dependencies() {
        let mut workflow = Workflow::new("demo");
        let a = workflow.add_node(node());
        let b = workflow.add_node(node());
        let mut edge = WorkflowEdge::data(a, b);
        edge.disabled = true;
        workflow.add_edge(edge);

        let graph = WorkflowGraph::from_workflow(&workflow).unwrap();
        assert!(graph.dependencies(b).is_empty());
    }
}
