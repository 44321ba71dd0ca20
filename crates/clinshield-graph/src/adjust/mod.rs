//! Metric-specific edit strategies. Each call performs one batch of edits
//! and returns how many were applied.

pub mod centrality;
pub mod clustering;
pub mod degree;

pub use centrality::adjust_centrality;
pub use clustering::adjust_clustering;
pub use degree::adjust_degree;

use crate::dummy::DummyFactory;
use crate::graph::GraphMutation;
use crate::schema::SchemaGraph;
use clinshield_core::NodeId;
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;
use rand::seq::IndexedRandom;
use rand::Rng;

const MIN_WEIGHT: f64 = 1e-6;
const MAX_DEGREE_BATCH: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Raise,
    Lower,
}

/// Everything an adjuster needs besides the graph itself.
pub struct AdjustContext<'a> {
    pub schema: &'a SchemaGraph,
    pub dummies: DummyFactory<'a>,
    pub primary_type: &'a str,
    pub max_clustering_batch: usize,
}

/// `min(max(1, floor(factor * eligible)), 20)`
pub(crate) fn degree_batch_size(eligible: usize, factor: f64) -> usize {
    ((factor * eligible as f64) as usize).max(1).min(MAX_DEGREE_BATCH)
}

/// Draws up to `count` distinct nodes, each with probability proportional to
/// its weight. Weights are floored so that no node is unreachable.
pub(crate) fn weighted_sample<R: Rng + ?Sized>(
    mut pool: Vec<(NodeId, f64)>,
    count: usize,
    rng: &mut R,
) -> Vec<NodeId> {
    let mut chosen = Vec::with_capacity(count.min(pool.len()));
    while chosen.len() < count && !pool.is_empty() {
        let weights = pool.iter().map(|(_, w)| w.max(MIN_WEIGHT));
        let index = match WeightedIndex::new(weights) {
            Ok(dist) => dist.sample(rng),
            Err(_) => rng.random_range(0..pool.len()),
        };
        chosen.push(pool.swap_remove(index).0);
    }
    chosen
}

/// Nodes on the requested side of the mean, weighted by their distance from
/// it. Falls back to every node with uniform weight when that side is empty.
pub(crate) fn partition_by_mean(scores: &[(NodeId, f64)], direction: Direction) -> Vec<(NodeId, f64)> {
    if scores.is_empty() {
        return Vec::new();
    }
    let mean = scores.iter().map(|(_, s)| s).sum::<f64>() / scores.len() as f64;
    let side: Vec<(NodeId, f64)> = scores
        .iter()
        .filter_map(|(id, score)| {
            let distance = match direction {
                Direction::Raise => mean - score,
                Direction::Lower => score - mean,
            };
            (distance > 0.0).then(|| (id.clone(), distance))
        })
        .collect();
    if side.is_empty() {
        scores.iter().map(|(id, _)| (id.clone(), 1.0)).collect()
    } else {
        side
    }
}

/// Connects `node` to a random non-primary node it may link to and is not
/// yet linked to. Without any such node a dummy is attached instead.
pub(crate) fn connect_outward<G: GraphMutation, R: Rng + ?Sized>(
    graph: &mut G,
    node: &str,
    ctx: &AdjustContext<'_>,
    rng: &mut R,
) -> bool {
    let candidates: Vec<NodeId> = {
        let g = graph.graph();
        g.nodes()
            .filter(|(id, data)| {
                data.resource_type != ctx.primary_type
                    && id.as_str() != node
                    && !g.has_edge(node, id)
                    && ctx.schema.is_valid_connection(g, node, id)
            })
            .map(|(id, _)| id.clone())
            .collect()
    };
    match candidates.choose(rng) {
        Some(target) => graph.add_edge(node, target),
        None => ctx.dummies.attach(graph, node, rng).is_some(),
    }
}

/// Removes one random edge of `node`.
pub(crate) fn drop_random_edge<G: GraphMutation, R: Rng + ?Sized>(
    graph: &mut G,
    node: &str,
    rng: &mut R,
) -> bool {
    let neighbors: Vec<NodeId> = graph.graph().neighbors(node).cloned().collect();
    match neighbors.choose(rng) {
        Some(neighbor) => graph.remove_edge(node, neighbor),
        None => false,
    }
}
