//! DAG builder for constructing dependency graphs from work nodes.
//!
//! The builder takes a list of node specs with their dependencies and constructs
//! a directed acyclic graph (DAG) that can be used for scheduling. The graph can
//! also grow one node or one edge at a time; every mutation is validated before
//! anything is written, so a rejected mutation leaves the graph untouched.

use crate::errors::DagError;
use std::collections::{HashMap, HashSet, VecDeque};

/// Index into the node list.
pub type NodeIndex = usize;

/// A node id plus the ids it depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub id: String,
    pub dependencies: Vec<String>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, dependencies: Vec<String>) -> Self {
        Self {
            id: id.into(),
            dependencies,
        }
    }
}

/// A directed acyclic graph of work nodes.
#[derive(Debug, Clone, Default)]
pub struct NodeGraph {
    /// Node ids in insertion order
    ids: Vec<String>,
    /// Map from node id to index
    index_map: HashMap<String, NodeIndex>,
    /// Forward edges: index -> nodes that depend on it
    forward_edges: Vec<Vec<NodeIndex>>,
    /// Reverse edges: index -> nodes it depends on
    reverse_edges: Vec<Vec<NodeIndex>>,
}

impl NodeGraph {
    /// Get the number of nodes in the graph.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Get the index for a node id.
    pub fn get_index(&self, id: &str) -> Option<NodeIndex> {
        self.index_map.get(id).copied()
    }

    /// Get a node id by its index.
    pub fn id(&self, index: NodeIndex) -> Option<&str> {
        self.ids.get(index).map(String::as_str)
    }

    /// All node ids in insertion order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Get nodes that depend on the given node (forward edges).
    pub fn dependents(&self, index: NodeIndex) -> &[NodeIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Get nodes that the given node depends on (reverse edges).
    pub fn dependencies(&self, index: NodeIndex) -> &[NodeIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Check if all dependencies of a node are satisfied.
    pub fn dependencies_satisfied(&self, index: NodeIndex, completed: &HashSet<NodeIndex>) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| completed.contains(dep))
    }

    /// All direct and transitive dependents of `index`, breadth-first.
    pub fn transitive_dependents(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut seen: HashSet<NodeIndex> = HashSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<NodeIndex> = self.dependents(index).iter().copied().collect();

        while let Some(next) = queue.pop_front() {
            if !seen.insert(next) {
                continue;
            }
            order.push(next);
            queue.extend(self.dependents(next).iter().copied());
        }

        order
    }

    /// Insert a new node whose dependencies must already exist.
    pub fn insert(&mut self, id: &str, dependencies: &[String]) -> Result<NodeIndex, DagError> {
        if self.index_map.contains_key(id) {
            return Err(DagError::DuplicateNode(id.to_string()));
        }

        let mut dep_indices = Vec::with_capacity(dependencies.len());
        for dep in dependencies {
            if dep == id {
                return Err(DagError::CyclicDependency {
                    nodes: vec![id.to_string()],
                });
            }
            let dep_idx = self.get_index(dep).ok_or_else(|| DagError::DependencyResolution {
                node: id.to_string(),
                dependency: dep.clone(),
            })?;
            if !dep_indices.contains(&dep_idx) {
                dep_indices.push(dep_idx);
            }
        }

        let index = self.ids.len();
        self.ids.push(id.to_string());
        self.index_map.insert(id.to_string(), index);
        self.forward_edges.push(Vec::new());
        self.reverse_edges.push(dep_indices.clone());
        for dep_idx in dep_indices {
            self.forward_edges[dep_idx].push(index);
        }

        Ok(index)
    }

    /// Add a dependency edge `node` -> `dependency` between existing nodes.
    ///
    /// Fails without mutating the graph if the edge would close a cycle.
    pub fn add_edge(&mut self, node: &str, dependency: &str) -> Result<(), DagError> {
        let node_idx = self
            .get_index(node)
            .ok_or_else(|| DagError::UnknownNode(node.to_string()))?;
        let dep_idx = self
            .get_index(dependency)
            .ok_or_else(|| DagError::DependencyResolution {
                node: node.to_string(),
                dependency: dependency.to_string(),
            })?;

        if self.reverse_edges[node_idx].contains(&dep_idx) {
            return Ok(());
        }

        // The new edge closes a cycle iff `dependency` already (transitively) depends on `node`.
        if node_idx == dep_idx || self.transitive_dependents(node_idx).contains(&dep_idx) {
            let mut nodes = vec![node.to_string(), dependency.to_string()];
            nodes.dedup();
            return Err(DagError::CyclicDependency { nodes });
        }

        self.forward_edges[dep_idx].push(node_idx);
        self.reverse_edges[node_idx].push(dep_idx);
        Ok(())
    }
}

/// Builder for constructing node graphs from a full node list.
///
/// Unlike [`NodeGraph::insert`], nodes may reference dependencies declared later
/// in the list.
pub struct DagBuilder {
    nodes: Vec<NodeSpec>,
}

impl DagBuilder {
    /// Create a new builder with the given nodes.
    pub fn new(nodes: Vec<NodeSpec>) -> Self {
        Self { nodes }
    }

    /// Build the node graph.
    ///
    /// This validates the graph structure:
    /// - Node ids must be unique
    /// - All dependencies must reference existing nodes
    /// - No cycles are allowed
    pub fn build(self) -> Result<NodeGraph, DagError> {
        let mut index_map = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if index_map.contains_key(&node.id) {
                return Err(DagError::DuplicateNode(node.id.clone()));
            }
            index_map.insert(node.id.clone(), i);
        }

        let mut forward_edges: Vec<Vec<NodeIndex>> = vec![Vec::new(); self.nodes.len()];
        let mut reverse_edges: Vec<Vec<NodeIndex>> = vec![Vec::new(); self.nodes.len()];

        for (to_idx, node) in self.nodes.iter().enumerate() {
            for dep in &node.dependencies {
                let from_idx = *index_map
                    .get(dep)
                    .ok_or_else(|| DagError::DependencyResolution {
                        node: node.id.clone(),
                        dependency: dep.clone(),
                    })?;

                if reverse_edges[to_idx].contains(&from_idx) {
                    continue;
                }
                // from_idx must complete before to_idx
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = NodeGraph {
            ids: self.nodes.into_iter().map(|n| n.id).collect(),
            index_map,
            forward_edges,
            reverse_edges,
        };

        Self::validate_no_cycles(&graph)?;

        Ok(graph)
    }

    /// Validate that the graph has no cycles using Kahn's algorithm.
    fn validate_no_cycles(graph: &NodeGraph) -> Result<(), DagError> {
        let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(|deps| deps.len()).collect();

        let mut queue: Vec<NodeIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;

            for &dependent in graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != graph.len() {
            let nodes: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .filter_map(|(i, _)| graph.id(i).map(str::to_string))
                .collect();

            return Err(DagError::CyclicDependency { nodes });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, deps: Vec<&str>) -> NodeSpec {
        NodeSpec::new(id, deps.into_iter().map(String::from).collect())
    }

    #[test]
    fn test_build_simple_graph() {
        let nodes = vec![
            node("1", vec![]),
            node("2", vec!["1"]),
            node("3", vec!["1"]),
            node("4", vec!["2", "3"]),
        ];

        let graph = DagBuilder::new(nodes).build().unwrap();

        assert_eq!(graph.len(), 4);
        assert!(graph.dependencies(0).is_empty());
        assert_eq!(graph.dependents(0), &[1, 2]);
        assert_eq!(graph.dependencies(3), &[1, 2]);
        assert!(graph.dependents(3).is_empty());
    }

    #[test]
    fn test_forward_references_allowed_in_bulk_build() {
        let nodes = vec![node("2", vec!["1"]), node("1", vec![])];
        let graph = DagBuilder::new(nodes).build().unwrap();
        assert_eq!(graph.dependencies(0), &[1]);
    }

    #[test]
    fn test_cycle_detection() {
        let nodes = vec![
            node("1", vec!["3"]),
            node("2", vec!["1"]),
            node("3", vec!["2"]),
        ];

        let err = DagBuilder::new(nodes).build().unwrap_err();
        match err {
            DagError::CyclicDependency { nodes } => assert_eq!(nodes.len(), 3),
            other => panic!("Expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_dependency() {
        let err = DagBuilder::new(vec![node("1", vec!["nonexistent"])])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("nonexistent"));
        assert!(matches!(err, DagError::DependencyResolution { .. }));
    }

    #[test]
    fn test_duplicate_node_id() {
        let err = DagBuilder::new(vec![node("1", vec![]), node("1", vec![])])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_empty_graph() {
        let graph = DagBuilder::new(vec![]).build().unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn test_insert_rejects_self_dependency() {
        let mut graph = NodeGraph::default();
        let err = graph.insert("1", &["1".to_string()]).unwrap_err();
        assert!(matches!(err, DagError::CyclicDependency { .. }));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_add_edge_closing_cycle_leaves_graph_unchanged() {
        let mut graph = NodeGraph::default();
        graph.insert("a", &[]).unwrap();
        graph.insert("b", &["a".to_string()]).unwrap();
        graph.insert("c", &["b".to_string()]).unwrap();

        let err = graph.add_edge("a", "c").unwrap_err();
        assert!(matches!(err, DagError::CyclicDependency { .. }));
        assert!(graph.dependencies(0).is_empty());
        assert!(graph.dependents(2).is_empty());
    }

    #[test]
    fn test_transitive_dependents_breadth_first() {
        let nodes = vec![
            node("1", vec![]),
            node("2", vec!["1"]),
            node("3", vec!["2"]),
            node("4", vec!["1"]),
        ];
        let graph = DagBuilder::new(nodes).build().unwrap();
        assert_eq!(graph.transitive_dependents(0), vec![1, 3, 2]);
    }

    #[test]
    fn test_dependencies_satisfied() {
        let nodes = vec![
            node("1", vec![]),
            node("2", vec!["1"]),
            node("3", vec!["1", "2"]),
        ];

        let graph = DagBuilder::new(nodes).build().unwrap();
        let mut completed = HashSet::new();

        assert!(graph.dependencies_satisfied(0, &completed));
        assert!(!graph.dependencies_satisfied(1, &completed));

        completed.insert(0);
        assert!(graph.dependencies_satisfied(1, &completed));
        assert!(!graph.dependencies_satisfied(2, &completed));

        completed.insert(1);
        assert!(graph.dependencies_satisfied(2, &completed));
    }
}
