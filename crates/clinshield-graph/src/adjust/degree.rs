use super::{
    connect_outward, degree_batch_size, drop_random_edge, partition_by_mean, weighted_sample,
    AdjustContext, Direction,
};
use crate::graph::GraphMutation;
use clinshield_core::NodeId;
use rand::Rng;
use tracing::debug;

const RAISE_FACTOR: f64 = 0.2;
const LOWER_FACTOR: f64 = 0.8;

/// Moves the mean degree of the primary nodes one batch in `direction`.
///
/// Raising connects low-degree nodes to non-primary nodes, lowering drops a
/// random edge from each high-degree node.
pub fn adjust_degree<G: GraphMutation, R: Rng + ?Sized>(
    graph: &mut G,
    ctx: &AdjustContext<'_>,
    direction: Direction,
    rng: &mut R,
) -> usize {
    let degrees: Vec<(NodeId, f64)> = graph
        .graph()
        .nodes_of_type(ctx.primary_type)
        .into_iter()
        .map(|id| {
            let degree = graph.graph().degree(&id) as f64;
            (id, degree)
        })
        .collect();
    let eligible = partition_by_mean(&degrees, direction);
    let factor = match direction {
        Direction::Raise => RAISE_FACTOR,
        Direction::Lower => LOWER_FACTOR,
    };
    let batch = degree_batch_size(eligible.len(), factor);
    let selected = weighted_sample(eligible, batch, rng);

    let mut edits = 0;
    for node in &selected {
        let applied = match direction {
            Direction::Raise => connect_outward(graph, node, ctx, rng),
            Direction::Lower => drop_random_edge(graph, node, rng),
        };
        edits += usize::from(applied);
    }
    debug!(?direction, selected = selected.len(), edits, "Degree adjustment");
    edits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::DummyFactory;
    use crate::graph::{NodeData, ReferenceGraph};
    use crate::metrics::degree_distribution;
    use crate::schema::SchemaGraph;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeMap;

    fn schema() -> SchemaGraph {
        SchemaGraph::new(BTreeMap::from([(
            "Encounter".to_string(),
            BTreeMap::from([("Patient".to_string(), "references to Patient".to_string())]),
        )]))
    }

    #[test]
    fn test_lower_removes_edges_from_busy_nodes() {
        let schema = schema();
        let shapes = BTreeMap::new();
        let displays = Vec::new();
        let ctx = AdjustContext {
            schema: &schema,
            dummies: DummyFactory::new(&schema, &shapes, "Patient", &displays),
            primary_type: "Patient",
            max_clustering_batch: 100,
        };

        let mut graph = ReferenceGraph::new();
        graph.add_node("Patient/busy".into(), NodeData::external("Patient", "busy"));
        graph.add_node("Patient/calm".into(), NodeData::external("Patient", "calm"));
        for i in 0..5 {
            let id = format!("Encounter/e{}", i);
            graph.add_node(id.clone(), NodeData::external("Encounter", format!("e{}", i)));
            graph.add_edge("Patient/busy", &id);
        }
        let subset = graph.nodes_of_type("Patient");
        let before = degree_distribution(&graph, &subset);

        let mut rng = StdRng::seed_from_u64(2);
        let edits = adjust_degree(&mut graph, &ctx, Direction::Lower, &mut rng);
        assert_eq!(edits, 1);
        assert_eq!(graph.degree("Patient/busy"), 4);
        assert!(degree_distribution(&graph, &subset) < before);
    }
}
