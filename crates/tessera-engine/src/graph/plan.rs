//! Execution plan: topological phases of mutually independent nodes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::id::NodeId;

/// The run-order computed from a validated workflow graph.
///
/// Each phase is a list of node ids whose dependencies lie entirely in
/// prior phases; nodes within a phase are mutually independent and are
/// candidates for parallel dispatch. Within a phase, nodes are ordered by
/// ascending priority, then by node id, so the plan is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    phases: Vec<Vec<NodeId>>,
    #[serde(skip)]
    phase_index: HashMap<NodeId, usize>,
}

impl ExecutionPlan {
    /// Builds a plan from already-ordered phases.
    pub(crate) fn new(phases: Vec<Vec<NodeId>>) -> Self {
        let phase_index = phases
            .iter()
            .enumerate()
            .flat_map(|(i, phase)| phase.iter().map(move |id| (*id, i)))
            .collect();
        Self {
            phases,
            phase_index,
        }
    }

    /// Returns the phases in dispatch order.
    pub fn phases(&self) -> &[Vec<NodeId>] {
        &self.phases
    }

    /// Returns the number of phases.
    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    /// Returns the total number of nodes across all phases.
    pub fn node_count(&self) -> usize {
        self.phases.iter().map(Vec::len).sum()
    }

    /// Returns the phase index of a node, if it is part of the plan.
    pub fn phase_of(&self, id: NodeId) -> Option<usize> {
        self.phase_index.get(&id).copied()
    }

    /// Returns an iterator over all planned node ids, in dispatch order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.phases.iter().flatten().copied()
    }
}
