use clinshield_core::{NodeId, Record};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Payload and attributes of one graph node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeData {
    pub resource_type: String,
    /// Record id, or the display name of a display-name entity.
    pub key: String,
    /// Whether the node stands for a display-name entity.
    pub display: bool,
    pub payload: Option<Record>,
    pub synthetic: bool,
}

impl NodeData {
    pub fn record(record: Record) -> Self {
        Self {
            resource_type: record.resource_type().to_string(),
            key: record.id().unwrap_or_default().to_string(),
            display: false,
            payload: Some(record),
            synthetic: false,
        }
    }

    /// A referenced record that is not part of the input.
    pub fn external(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            key: id.into(),
            display: false,
            payload: None,
            synthetic: false,
        }
    }

    pub fn display_entity(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            key: name.into(),
            display: true,
            payload: None,
            synthetic: false,
        }
    }

    pub fn synthetic(record: Record) -> Self {
        Self {
            synthetic: true,
            ..Self::record(record)
        }
    }

    /// Id of this node inside the graph.
    pub fn node_id(&self) -> NodeId {
        if self.display {
            display_node_id(&self.resource_type, &self.key)
        } else {
            record_node_id(&self.resource_type, &self.key)
        }
    }
}

pub fn record_node_id(resource_type: &str, id: &str) -> NodeId {
    format!("{}/{}", resource_type, id)
}

pub fn display_node_id(resource_type: &str, name: &str) -> NodeId {
    format!("{}?display={}", resource_type, name)
}

/// Undirected graph of records and the references between them.
#[derive(Debug, Clone, Default)]
pub struct ReferenceGraph {
    nodes: BTreeMap<NodeId, NodeData>,
    adjacency: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

impl ReferenceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: &str) -> Option<&NodeData> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut NodeData> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&NodeId, &NodeData)> {
        self.nodes.iter()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(BTreeSet::len).sum::<usize>() / 2
    }

    pub fn resource_type(&self, id: &str) -> Option<&str> {
        self.nodes.get(id).map(|n| n.resource_type.as_str())
    }

    /// Ids of all nodes of `resource_type`, sorted.
    pub fn nodes_of_type(&self, resource_type: &str) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, data)| data.resource_type == resource_type)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn neighbors(&self, id: &str) -> impl Iterator<Item = &NodeId> {
        self.adjacency.get(id).into_iter().flatten()
    }

    pub fn degree(&self, id: &str) -> usize {
        self.adjacency.get(id).map_or(0, BTreeSet::len)
    }

    pub fn has_edge(&self, a: &str, b: &str) -> bool {
        self.adjacency.get(a).is_some_and(|n| n.contains(b))
    }

    /// Every edge once, as an ordered pair.
    pub fn edges(&self) -> BTreeSet<(NodeId, NodeId)> {
        self.adjacency
            .iter()
            .flat_map(|(a, neighbors)| {
                neighbors
                    .iter()
                    .filter(move |b| a < *b)
                    .map(move |b| (a.clone(), b.clone()))
            })
            .collect()
    }

    pub fn isolated_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .keys()
            .filter(|id| self.degree(id) == 0)
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> GraphSummary {
        let mut types: BTreeMap<String, usize> = BTreeMap::new();
        for data in self.nodes.values() {
            *types.entry(data.resource_type.clone()).or_insert(0) += 1;
        }
        GraphSummary {
            nodes: self.node_count(),
            edges: self.edge_count(),
            synthetic: self.nodes.values().filter(|n| n.synthetic).count(),
            types,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphSummary {
    pub nodes: usize,
    pub edges: usize,
    pub synthetic: usize,
    pub types: BTreeMap<String, usize>,
}

/// Structural edits applied by the calibrators.
///
/// Every operation reports whether it changed the graph. Schema validity is
/// the caller's concern.
pub trait GraphMutation {
    fn graph(&self) -> &ReferenceGraph;

    /// Fails if `id` is already present.
    fn add_node(&mut self, id: NodeId, data: NodeData) -> bool;

    /// Removes the node and all its edges.
    fn remove_node(&mut self, id: &str) -> bool;

    /// Fails for self-loops, unknown endpoints and existing edges.
    fn add_edge(&mut self, a: &str, b: &str) -> bool;

    fn remove_edge(&mut self, a: &str, b: &str) -> bool;
}

impl GraphMutation for ReferenceGraph {
    fn graph(&self) -> &ReferenceGraph {
        self
    }

    fn add_node(&mut self, id: NodeId, data: NodeData) -> bool {
        if self.nodes.contains_key(&id) {
            return false;
        }
        self.adjacency.insert(id.clone(), BTreeSet::new());
        self.nodes.insert(id, data);
        true
    }

    fn remove_node(&mut self, id: &str) -> bool {
        if self.nodes.remove(id).is_none() {
            return false;
        }
        if let Some(neighbors) = self.adjacency.remove(id) {
            for neighbor in neighbors {
                if let Some(back) = self.adjacency.get_mut(&neighbor) {
                    back.remove(id);
                }
            }
        }
        true
    }

    fn add_edge(&mut self, a: &str, b: &str) -> bool {
        if a == b || !self.contains(a) || !self.contains(b) || self.has_edge(a, b) {
            return false;
        }
        self.adjacency.entry(a.to_string()).or_default().insert(b.to_string());
        self.adjacency.entry(b.to_string()).or_default().insert(a.to_string());
        true
    }

    fn remove_edge(&mut self, a: &str, b: &str) -> bool {
        let removed = self.adjacency.get_mut(a).is_some_and(|n| n.remove(b));
        if removed {
            if let Some(back) = self.adjacency.get_mut(b) {
                back.remove(a);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> ReferenceGraph {
        let mut graph = ReferenceGraph::new();
        for id in ["a", "b", "c"] {
            graph.add_node(
                record_node_id("Patient", id),
                NodeData::external("Patient", id),
            );
        }
        graph.add_edge("Patient/a", "Patient/b");
        graph.add_edge("Patient/b", "Patient/c");
        graph.add_edge("Patient/c", "Patient/a");
        graph
    }

    #[test]
    fn test_edges_are_undirected_and_unique() {
        let mut graph = triangle();
        assert_eq!(graph.edge_count(), 3);
        assert!(graph.has_edge("Patient/b", "Patient/a"));
        assert!(!graph.add_edge("Patient/b", "Patient/a"));
        assert!(!graph.add_edge("Patient/a", "Patient/a"));
        assert!(!graph.add_edge("Patient/a", "Patient/missing"));
        assert_eq!(graph.edges().len(), 3);
    }

    #[test]
    fn test_remove_node_drops_incident_edges() {
        let mut graph = triangle();
        assert!(graph.remove_node("Patient/a"));
        assert!(!graph.remove_node("Patient/a"));
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.degree("Patient/b"), 1);
        assert!(graph.neighbors("Patient/b").all(|n| n == "Patient/c"));
    }

    #[test]
    fn test_remove_edge_and_isolated_nodes() {
        let mut graph = triangle();
        assert!(graph.remove_edge("Patient/a", "Patient/b"));
        assert!(!graph.remove_edge("Patient/a", "Patient/b"));
        assert!(graph.remove_edge("Patient/c", "Patient/a"));
        assert_eq!(graph.isolated_nodes(), vec!["Patient/a".to_string()]);
    }

    #[test]
    fn test_node_ids() {
        let display = NodeData::display_entity("Practitioner", "Dr. Who");
        assert_eq!(display.node_id(), "Practitioner?display=Dr. Who");
        assert_eq!(NodeData::external("Patient", "p1").node_id(), "Patient/p1");
    }
}
