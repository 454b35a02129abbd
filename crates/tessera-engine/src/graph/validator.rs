//! Workflow graph validation and phase layering.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::graph::NodeIndex;

use super::graph::WorkflowGraph;
use super::id::NodeId;
use super::plan::ExecutionPlan;
use super::workflow::Workflow;
use crate::error::{EngineError, EngineResult};

/// Validates a workflow and computes its execution plan.
///
/// Checks, in order: duplicate node ids and dangling edge endpoints
/// (while building the runtime graph), cycles, then layers the DAG into
/// phases. All failures are structural; execution never starts on a
/// workflow that fails here.
pub fn validate(workflow: &Workflow) -> EngineResult<ExecutionPlan> {
    let graph = WorkflowGraph::from_workflow(workflow)?;
    plan(&graph)
}

/// Computes the execution plan for an already-built runtime graph.
pub fn plan(graph: &WorkflowGraph) -> EngineResult<ExecutionPlan> {
    detect_cycles(graph)?;
    Ok(layer(graph))
}

/// DFS vertex state for cycle detection.
#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Cycle detection via depth-first search with recursion-stack coloring.
///
/// Disabled edges participate: a cycle is a definition defect regardless
/// of which edges are currently active. On failure the reported path is
/// one closed walk through the cycle.
fn detect_cycles(graph: &WorkflowGraph) -> EngineResult<()> {
    let inner = graph.inner();
    let mut colors: HashMap<NodeIndex, Color> =
        inner.node_indices().map(|i| (i, Color::White)).collect();
    let mut stack: Vec<NodeIndex> = Vec::new();

    for start in inner.node_indices() {
        if colors[&start] == Color::White {
            visit(graph, start, &mut colors, &mut stack)?;
        }
    }
    Ok(())
}

fn visit(
    graph: &WorkflowGraph,
    index: NodeIndex,
    colors: &mut HashMap<NodeIndex, Color>,
    stack: &mut Vec<NodeIndex>,
) -> EngineResult<()> {
    colors.insert(index, Color::Gray);
    stack.push(index);

    for next in graph.inner().neighbors_directed(index, Direction::Outgoing) {
        match colors[&next] {
            Color::Gray => {
                // Found a back edge; slice the recursion stack from the
                // first occurrence to report the closed walk.
                let from = stack.iter().position(|i| *i == next).unwrap_or(0);
                let mut path: Vec<NodeId> =
                    stack[from..].iter().filter_map(|i| graph.id_of(*i)).collect();
                if let Some(id) = graph.id_of(next) {
                    path.push(id);
                }
                return Err(EngineError::CyclicGraph { path });
            }
            Color::White => visit(graph, next, colors, stack)?,
            Color::Black => {}
        }
    }

    stack.pop();
    colors.insert(index, Color::Black);
    Ok(())
}

/// Layers the DAG into phases by longest path from a source.
///
/// A node's phase is one past the maximum phase of its dependencies
/// (only non-disabled edges count as dependencies). Ties within a phase
/// break by ascending priority, then node id.
fn layer(graph: &WorkflowGraph) -> ExecutionPlan {
    let mut phase_of: HashMap<NodeId, usize> = HashMap::new();
    let mut remaining: Vec<NodeId> = graph.node_ids().collect();

    // Quadratic relaxation is fine at workflow scale; every pass settles
    // at least one node because the graph is acyclic.
    while !remaining.is_empty() {
        let mut settled = Vec::new();
        for id in &remaining {
            let deps = graph.dependencies(*id);
            if deps.iter().all(|dep| phase_of.contains_key(dep)) {
                let phase = deps
                    .iter()
                    .map(|dep| phase_of[dep] + 1)
                    .max()
                    .unwrap_or(0);
                settled.push((*id, phase));
            }
        }
        for (id, phase) in &settled {
            phase_of.insert(*id, *phase);
        }
        remaining.retain(|id| !phase_of.contains_key(id));
        if settled.is_empty() {
            // Unreachable on a cycle-checked graph.
            break;
        }
    }

    let phase_count = phase_of.values().map(|p| p + 1).max().unwrap_or(0);
    let mut phases: Vec<Vec<NodeId>> = vec![Vec::new(); phase_count];
    for (id, phase) in &phase_of {
        phases[*phase].push(*id);
    }
    for phase in &mut phases {
        phase.sort_by_key(|id| {
            let priority = graph.node(*id).map(|n| n.execution.priority).unwrap_or(0);
            (priority, *id)
        });
    }

    ExecutionPlan::new(phases)
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
    fn test_linear_plan() {
        let mut workflow = Workflow::new("linear");
        let a = workflow.add_node(node());
        let b = workflow.add_node(node());
        let c = workflow.add_node(node());
        workflow.connect(a, b);
        workflow.connect(b, c);

        let plan = validate(&workflow).unwrap();
        assert_eq!(plan.phases(), &[vec![a], vec![b], vec![c]]);
    }

    #[test]
    fn test_diamond_plan() {
        let mut workflow = Workflow::new("diamond");
        let a = workflow.add_node(node());
        let b = workflow.add_node(node());
        let c = workflow.add_node(node());
        let d = workflow.add_node(node());
        workflow.connect(a, b);
        workflow.connect(a, c);
        workflow.connect(b, d);
        workflow.connect(c, d);

        let plan = validate(&workflow).unwrap();
        assert_eq!(plan.phase_count(), 3);
        assert_eq!(plan.phase_of(a), Some(0));
        assert_eq!(plan.phase_of(b), Some(1));
        assert_eq!(plan.phase_of(c), Some(1));
        assert_eq!(plan.phase_of(d), Some(2));
    }

    #[test]
    fn test_cycle_rejected_with_path() {
        let mut workflow = Workflow::new("cyclic");
        let a = workflow.add_node(node());
        let b = workflow.add_node(node());
        let c = workflow.add_node(node());
        workflow.connect(a, b);
        workflow.connect(b, c);
        workflow.connect(c, a);

        match validate(&workflow).unwrap_err() {
            EngineError::CyclicGraph { path } => {
                assert!(path.len() >= 3);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("expected CyclicGraph, got {other}"),
        }
    }

    #[test]
    fn test_self_loop_rejected() {
        let mut workflow = Workflow::new("loop");
        let a = workflow.add_node(node());
        workflow.add_edge(WorkflowEdge::data(a, a));

        assert!(matches!(
            validate(&workflow).unwrap_err(),
            EngineError::CyclicGraph { .. }
        ));
    }

    #[test]
    fn test_priority_breaks_ties_within_phase() {
        let mut workflow = Workflow::new("prio");
        let low = workflow.add_node(node().with_priority(5));
        let high = workflow.add_node(node().with_priority(1));

        let plan = validate(&workflow).unwrap();
        assert_eq!(plan.phases()[0], vec![high, low]);
    }

    #[test]
    fn test_plan_covers_every_node_once() {
        let mut workflow = Workflow::new("cover");
        let ids: Vec<_> = (0..6).map(|_| workflow.add_node(node())).collect();
        workflow.connect(ids[0], ids[2]);
        workflow.connect(ids[1], ids[2]);
        workflow.connect(ids[2], ids[3]);
        workflow.connect(ids[2], ids[4]);
        workflow.connect(ids[4], ids[5]);

        let plan = validate(&workflow).unwrap();
        assert_eq!(plan.node_count(), 6);
        let mut seen: Vec<_> = plan.node_ids().collect();
        seen.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(seen, expected);
    }
}
