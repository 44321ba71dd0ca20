use super::{
    connect_outward, degree_batch_size, drop_random_edge, partition_by_mean, weighted_sample,
    AdjustContext, Direction,
};
use crate::graph::GraphMutation;
use crate::metrics::node_centrality;
use clinshield_core::NodeId;
use rand::Rng;
use tracing::debug;

const BATCH_FACTOR: f64 = 0.5;

/// Moves the mean degree centrality one batch in `direction`, weighting nodes
/// by how far their centrality sits from the mean.
pub fn adjust_centrality<G: GraphMutation, R: Rng + ?Sized>(
    graph: &mut G,
    ctx: &AdjustContext<'_>,
    direction: Direction,
    rng: &mut R,
) -> usize {
    let primary = graph.graph().nodes_of_type(ctx.primary_type);
    let total = primary.len();
    let scores: Vec<(NodeId, f64)> = primary
        .into_iter()
        .map(|id| {
            let centrality = node_centrality(graph.graph(), total, &id);
            (id, centrality)
        })
        .collect();
    let eligible = partition_by_mean(&scores, direction);
    let batch = degree_batch_size(eligible.len(), BATCH_FACTOR);

    let mut edits = 0;
    for node in weighted_sample(eligible, batch, rng) {
        let applied = match direction {
            Direction::Raise => connect_outward(graph, &node, ctx, rng),
            Direction::Lower => drop_random_edge(graph, &node, rng),
        };
        edits += usize::from(applied);
    }
    debug!(?direction, batch, edits, "Centrality adjustment");
    edits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::DummyFactory;
    use crate::graph::{NodeData, ReferenceGraph};
    use crate::metrics::degree_centrality;
    use crate::schema::SchemaGraph;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeMap;

    #[test]
    fn test_raise_without_targets_spawns_one_shared_dummy() {
        let schema = SchemaGraph::new(BTreeMap::from([(
            "Encounter".to_string(),
            BTreeMap::from([("Patient".to_string(), "references to Patient".to_string())]),
        )]));
        let shapes = BTreeMap::new();
        let displays = Vec::new();
        let ctx = AdjustContext {
            schema: &schema,
            dummies: DummyFactory::new(&schema, &shapes, "Patient", &displays),
            primary_type: "Patient",
            max_clustering_batch: 100,
        };
        let mut graph = ReferenceGraph::new();
        for i in 0..4 {
            let id = format!("p{}", i);
            graph.add_node(format!("Patient/{}", id), NodeData::external("Patient", id));
        }
        let subset = graph.nodes_of_type("Patient");

        let mut rng = StdRng::seed_from_u64(6);
        let edits = adjust_centrality(&mut graph, &ctx, Direction::Raise, &mut rng);
        // all four share the mean, so the batch is half of them
        assert_eq!(edits, 2);
        // the second patient links to the dummy spawned for the first
        assert_eq!(graph.summary().synthetic, 1);
        assert_eq!(graph.edge_count(), 2);
        assert!(degree_centrality(&graph, &subset) > 0.0);
    }
}
