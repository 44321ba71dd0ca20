//! Synthesis of placeholder records used to add structure to the graph.

use crate::graph::{record_node_id, GraphMutation, NodeData};
use crate::schema::SchemaGraph;
use clinshield_core::{generate_unique_id, FieldShape, NodeId, Record, PLACEHOLDER};
use rand::seq::IndexedRandom;
use rand::Rng;
use std::collections::BTreeMap;
use tracing::trace;

/// Creates synthetic nodes of schema-compatible types.
pub struct DummyFactory<'a> {
    schema: &'a SchemaGraph,
    shapes: &'a BTreeMap<String, FieldShape>,
    primary_type: &'a str,
    display_types: &'a [String],
}

impl<'a> DummyFactory<'a> {
    pub fn new(
        schema: &'a SchemaGraph,
        shapes: &'a BTreeMap<String, FieldShape>,
        primary_type: &'a str,
        display_types: &'a [String],
    ) -> Self {
        Self {
            schema,
            shapes,
            primary_type,
            display_types,
        }
    }

    /// A random type that may connect to every anchor type. The primary type
    /// and display-name entity types are never chosen.
    pub fn pick_type<R: Rng + ?Sized>(&self, anchors: &[&str], rng: &mut R) -> Option<String> {
        let candidates: Vec<&str> = self
            .schema
            .compatible_types(anchors)
            .into_iter()
            .filter(|t| *t != self.primary_type && !self.display_types.iter().any(|d| d == t))
            .collect();
        candidates.choose(rng).map(|t| t.to_string())
    }

    /// Placeholder record of `resource_type` with a fresh id.
    pub fn record<G: GraphMutation, R: Rng + ?Sized>(
        &self,
        graph: &G,
        resource_type: &str,
        rng: &mut R,
    ) -> Record {
        let id = generate_unique_id(rng, |candidate| {
            graph.graph().contains(&record_node_id(resource_type, candidate))
        });
        match self.shapes.get(resource_type) {
            Some(shape) => shape.placeholder_record(resource_type, &id, PLACEHOLDER),
            None => Record::new(resource_type, id),
        }
    }

    /// Adds a synthetic node able to connect to all `anchors`' types.
    /// Returns its id, or `None` when no type fits.
    pub fn spawn<G: GraphMutation, R: Rng + ?Sized>(
        &self,
        graph: &mut G,
        anchors: &[&str],
        rng: &mut R,
    ) -> Option<NodeId> {
        let anchor_types: Vec<String> = anchors
            .iter()
            .filter_map(|a| graph.graph().resource_type(a).map(str::to_string))
            .collect();
        let anchor_types: Vec<&str> = anchor_types.iter().map(String::as_str).collect();
        let resource_type = self.pick_type(&anchor_types, rng)?;
        let record = self.record(graph, &resource_type, rng);
        let data = NodeData::synthetic(record);
        let id = data.node_id();
        if !graph.add_node(id.clone(), data) {
            return None;
        }
        trace!(node = %id, "Spawned dummy node");
        Some(id)
    }

    /// Spawns a dummy and connects it to `node`. The dummy is removed again
    /// if the edge cannot be made.
    pub fn attach<G: GraphMutation, R: Rng + ?Sized>(
        &self,
        graph: &mut G,
        node: &str,
        rng: &mut R,
    ) -> Option<NodeId> {
        let dummy = self.spawn(graph, &[node], rng)?;
        let valid = self.schema.is_valid_connection(graph.graph(), node, &dummy);
        if valid && graph.add_edge(node, &dummy) {
            Some(dummy)
        } else {
            graph.remove_node(&dummy);
            None
        }
    }
}
