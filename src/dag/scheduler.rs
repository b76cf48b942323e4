//! Dependency scheduler for computing execution order and managing node states.
//!
//! The scheduler is a pure, synchronous, in-memory structure. It is used twice:
//! once at fleet level (one node per issue) and once per issue to validate the
//! implementation task plan. Callers that share it between tasks must funnel all
//! mutations through a single owner.

use crate::dag::builder::{DagBuilder, NodeGraph, NodeIndex, NodeSpec};
use crate::errors::DagError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Status of a node in the DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Node is waiting to run
    #[default]
    Pending,
    /// Node is ready to run (dependencies satisfied)
    Ready,
    /// Node is currently running
    Running,
    /// Node completed successfully
    Completed,
    /// Node failed
    Failed,
    /// A dependency failed; the node will never run
    Blocked,
}

impl NodeStatus {
    /// Check if the node is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Blocked)
    }

    /// Check if the node completed successfully.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// A node in the DAG with its current status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkNode {
    pub id: String,
    pub dependencies: Vec<String>,
    pub status: NodeStatus,
}

/// Counts of nodes per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSummary {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
}

/// The dependency scheduler.
#[derive(Debug, Clone, Default)]
pub struct DependencyScheduler {
    graph: NodeGraph,
    statuses: Vec<NodeStatus>,
    completed: HashSet<NodeIndex>,
}

impl DependencyScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a scheduler from a full node list, allowing forward references.
    pub fn from_nodes(nodes: Vec<NodeSpec>) -> Result<Self, DagError> {
        let graph = DagBuilder::new(nodes).build()?;
        let statuses = vec![NodeStatus::Pending; graph.len()];
        Ok(Self {
            graph,
            statuses,
            completed: HashSet::new(),
        })
    }

    /// Add a node whose dependencies already exist in the graph.
    ///
    /// A node added after one of its dependencies has failed starts out blocked.
    pub fn add_node(&mut self, id: &str, dependencies: &[String]) -> Result<(), DagError> {
        let index = self.graph.insert(id, dependencies)?;
        let blocked = self
            .graph
            .dependencies(index)
            .iter()
            .any(|&dep| matches!(self.statuses[dep], NodeStatus::Failed | NodeStatus::Blocked));
        self.statuses.push(if blocked {
            NodeStatus::Blocked
        } else {
            NodeStatus::Pending
        });
        Ok(())
    }

    /// Add a dependency edge between two existing nodes.
    pub fn add_dependency(&mut self, id: &str, dependency: &str) -> Result<(), DagError> {
        self.graph.add_edge(id, dependency)?;
        let (Some(index), Some(dep)) = (self.graph.get_index(id), self.graph.get_index(dependency))
        else {
            return Ok(());
        };
        if matches!(self.statuses[dep], NodeStatus::Failed | NodeStatus::Blocked)
            && !self.statuses[index].is_terminal()
        {
            self.block_from(dep);
        }
        Ok(())
    }

    /// Get the number of nodes.
    pub fn len(&self) -> usize {
        self.graph.len()
    }

    /// Check if the scheduler has no nodes.
    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    /// Current status of a node.
    pub fn status(&self, id: &str) -> Option<NodeStatus> {
        self.graph.get_index(id).map(|i| self.statuses[i])
    }

    /// Snapshot a node with its dependencies and status.
    pub fn node(&self, id: &str) -> Option<WorkNode> {
        let index = self.graph.get_index(id)?;
        Some(WorkNode {
            id: id.to_string(),
            dependencies: self
                .graph
                .dependencies(index)
                .iter()
                .filter_map(|&d| self.graph.id(d).map(str::to_string))
                .collect(),
            status: self.effective_status(index),
        })
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> Vec<WorkNode> {
        self.graph
            .ids()
            .iter()
            .filter_map(|id| self.node(id))
            .collect()
    }

    /// Direct dependents of a node.
    pub fn dependents(&self, id: &str) -> Vec<String> {
        self.graph
            .get_index(id)
            .map(|i| {
                self.graph
                    .dependents(i)
                    .iter()
                    .filter_map(|&d| self.graph.id(d).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Pending nodes whose dependencies have all completed, in insertion order.
    pub fn ready_nodes(&self) -> Vec<String> {
        (0..self.graph.len())
            .filter(|&i| self.is_ready(i))
            .filter_map(|i| self.graph.id(i).map(str::to_string))
            .collect()
    }

    /// Nodes that were blocked by an upstream failure, in insertion order.
    pub fn blocked_nodes(&self) -> Vec<String> {
        self.ids_with_status(NodeStatus::Blocked)
    }

    /// Nodes that failed, in insertion order.
    pub fn failed_nodes(&self) -> Vec<String> {
        self.ids_with_status(NodeStatus::Failed)
    }

    /// Mark a node as running.
    pub fn mark_running(&mut self, id: &str) -> Result<(), DagError> {
        let index = self.index(id)?;
        if !self.statuses[index].is_terminal() {
            self.statuses[index] = NodeStatus::Running;
        }
        Ok(())
    }

    /// Mark a node as completed. Completing an already completed node is a no-op.
    ///
    /// A failed node stays failed; blocked nodes are left alone.
    pub fn mark_completed(&mut self, id: &str) -> Result<(), DagError> {
        let index = self.index(id)?;
        match self.statuses[index] {
            NodeStatus::Blocked | NodeStatus::Completed => return Ok(()),
            NodeStatus::Failed => return Err(self.invalid_transition(index, NodeStatus::Completed)),
            _ => {}
        }
        self.statuses[index] = NodeStatus::Completed;
        self.completed.insert(index);
        Ok(())
    }

    /// Mark a node as failed and block every direct and transitive dependent.
    ///
    /// A completed node stays completed; blocked nodes are left alone.
    pub fn mark_failed(&mut self, id: &str) -> Result<(), DagError> {
        let index = self.index(id)?;
        match self.statuses[index] {
            NodeStatus::Blocked | NodeStatus::Failed => return Ok(()),
            NodeStatus::Completed => return Err(self.invalid_transition(index, NodeStatus::Failed)),
            _ => {}
        }
        self.statuses[index] = NodeStatus::Failed;
        self.completed.remove(&index);
        self.block_from(index);
        Ok(())
    }

    fn invalid_transition(&self, index: NodeIndex, to: NodeStatus) -> DagError {
        DagError::InvalidTransition {
            node: self.graph.id(index).map(str::to_string).unwrap_or_default(),
            from: self.statuses[index],
            to,
        }
    }

    /// True once no node is pending, ready or running.
    pub fn is_complete(&self) -> bool {
        self.statuses.iter().all(NodeStatus::is_terminal)
    }

    /// Counts of nodes per status.
    pub fn summary(&self) -> SchedulerSummary {
        let mut summary = SchedulerSummary::default();
        for status in &self.statuses {
            match status {
                NodeStatus::Pending | NodeStatus::Ready => summary.pending += 1,
                NodeStatus::Running => summary.running += 1,
                NodeStatus::Completed => summary.completed += 1,
                NodeStatus::Failed => summary.failed += 1,
                NodeStatus::Blocked => summary.blocked += 1,
            }
        }
        summary
    }

    /// Compute execution waves - groups of nodes that can run in parallel.
    ///
    /// Returns a list of waves, where each wave lists node ids that can be
    /// executed once all previous waves complete. Only structure is considered,
    /// not current statuses.
    pub fn compute_waves(&self) -> Vec<Vec<String>> {
        let mut waves = Vec::new();
        let mut completed: HashSet<NodeIndex> = HashSet::new();

        loop {
            let ready: Vec<NodeIndex> = (0..self.graph.len())
                .filter(|i| !completed.contains(i))
                .filter(|&i| self.graph.dependencies_satisfied(i, &completed))
                .collect();

            if ready.is_empty() {
                break;
            }

            completed.extend(ready.iter().copied());
            waves.push(
                ready
                    .into_iter()
                    .filter_map(|i| self.graph.id(i).map(str::to_string))
                    .collect(),
            );
        }

        waves
    }

    fn index(&self, id: &str) -> Result<NodeIndex, DagError> {
        self.graph
            .get_index(id)
            .ok_or_else(|| DagError::UnknownNode(id.to_string()))
    }

    fn is_ready(&self, index: NodeIndex) -> bool {
        matches!(self.statuses[index], NodeStatus::Pending | NodeStatus::Ready)
            && self.graph.dependencies_satisfied(index, &self.completed)
    }

    fn effective_status(&self, index: NodeIndex) -> NodeStatus {
        if self.is_ready(index) {
            NodeStatus::Ready
        } else {
            self.statuses[index]
        }
    }

    fn ids_with_status(&self, status: NodeStatus) -> Vec<String> {
        self.statuses
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == status)
            .filter_map(|(i, _)| self.graph.id(i).map(str::to_string))
            .collect()
    }

    fn block_from(&mut self, index: NodeIndex) {
        for dependent in self.graph.transitive_dependents(index) {
            if !self.statuses[dependent].is_terminal() {
                self.statuses[dependent] = NodeStatus::Blocked;
            }
        }
    }
}
