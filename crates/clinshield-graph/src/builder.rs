//! Turning record batches into a reference graph and back.

use crate::graph::{record_node_id, GraphMutation, NodeData, ReferenceGraph};
use crate::schema::SchemaGraph;
use clinshield_core::{Record, RecordBatch};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Builds the graph of `records`.
///
/// Every record becomes a node carrying its payload. Each reference the
/// schema governs becomes an edge: display-name entity types connect to a
/// node keyed by the reference's `display` text, other types to the target
/// record's node (created without payload if the target is not in the input).
pub fn build_graph(
    records: impl IntoIterator<Item = Record>,
    schema: &SchemaGraph,
    display_types: &[String],
) -> ReferenceGraph {
    let mut graph = ReferenceGraph::new();
    let mut pending = Vec::new();

    for record in records {
        let Some(id) = record.id().map(str::to_string) else {
            warn!(resource = %record.resource_type(), "Record without id left out of the graph");
            continue;
        };
        let node_id = record_node_id(record.resource_type(), &id);
        let links = outbound_links(&record, schema, display_types);

        if !graph.add_node(node_id.clone(), NodeData::record(record)) {
            warn!(node = %node_id, "Duplicate record id, keeping the first");
            continue;
        }
        pending.push((node_id, links));
    }

    for (source, links) in pending {
        for target in links {
            let target_id = target.node_id();
            if !graph.contains(&target_id) {
                graph.add_node(target_id.clone(), target);
            }
            graph.add_edge(&source, &target_id);
        }
    }

    debug!(
        nodes = graph.node_count(),
        edges = graph.edge_count(),
        "Built reference graph"
    );
    graph
}

fn outbound_links(
    record: &Record,
    schema: &SchemaGraph,
    display_types: &[String],
) -> Vec<NodeData> {
    let own_type = record.resource_type();
    record
        .references()
        .into_iter()
        .filter(|(_, reference)| schema.governs(own_type, &reference.resource_type))
        .filter_map(|(route, reference)| {
            if display_types.contains(&reference.resource_type) {
                let name = record.sibling_display(&route)?;
                Some(NodeData::display_entity(reference.resource_type, name))
            } else {
                let id = reference.id()?.to_string();
                Some(NodeData::external(reference.resource_type, id))
            }
        })
        .collect()
}

/// Regroups node payloads by resource type, synthetic records included.
pub fn materialize(graph: &ReferenceGraph) -> Vec<RecordBatch> {
    let mut by_type: BTreeMap<String, Vec<Record>> = BTreeMap::new();
    for (_, data) in graph.nodes() {
        if let Some(payload) = &data.payload {
            by_type
                .entry(data.resource_type.clone())
                .or_default()
                .push(payload.clone());
        }
    }
    by_type
        .into_iter()
        .map(|(resource_type, records)| {
            RecordBatch::new(format!("{}.json", resource_type), resource_type, records)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encounter(id: &str, patient: &str, doctor: &str) -> Record {
        Record::from_json(&json!({
            "resourceType": "Encounter",
            "id": id,
            "subject": { "reference": format!("Patient/{}", patient) },
            "participant": [{ "individual": { "reference": "Practitioner?identifier=x", "display": doctor } }],
            "serviceProvider": { "reference": "Organization/o1" }
        }))
        .unwrap()
    }

    fn patient(id: &str) -> Record {
        Record::from_json(&json!({ "resourceType": "Patient", "id": id })).unwrap()
    }

    #[test]
    fn test_build_connects_governed_references() {
        let displays = vec!["Practitioner".to_string()];
        let records = vec![
            encounter("e1", "p1", "Dr. A"),
            encounter("e2", "p1", "Dr. A"),
            encounter("e3", "p2", "Dr. B"),
            patient("p1"),
        ];
        let schema = SchemaGraph::new(BTreeMap::from([(
            "Encounter".to_string(),
            BTreeMap::from([
                ("Patient".to_string(), "references to Patient".to_string()),
                ("Practitioner".to_string(), "Practitioner".to_string()),
            ]),
        )]));
        let graph = build_graph(records, &schema, &displays);

        // 3 encounters, 2 patients, 2 practitioners; Organization is ungoverned
        assert_eq!(graph.node_count(), 7);
        assert_eq!(graph.edge_count(), 6);
        assert_eq!(graph.degree("Patient/p1"), 2);
        assert_eq!(graph.degree("Practitioner?display=Dr. A"), 2);
        assert!(graph.node("Patient/p1").unwrap().payload.is_some());
        assert!(graph.node("Patient/p2").unwrap().payload.is_none());
        assert!(!graph.contains("Organization/o1"));

        let batches = materialize(&graph);
        let types: Vec<_> = batches.iter().map(|b| b.resource_type.as_str()).collect();
        assert_eq!(types, vec!["Encounter", "Patient"]);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[0].name, "Encounter.json");
    }
}
