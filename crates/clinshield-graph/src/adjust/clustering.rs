use super::{AdjustContext, Direction};
use crate::graph::GraphMutation;
use clinshield_core::NodeId;
use rand::seq::{IndexedRandom, SliceRandom};
use rand::Rng;
use tracing::{debug, trace};

const SPARSE_THRESHOLD: f64 = 0.01;
const SPARSE_SCALE: f64 = 1000.0;
const DENSE_SCALE: f64 = 100.0;
const DUMMY_NEIGHBOR_LINKS: usize = 2;

/// Edits attempted in one clustering round.
pub(crate) fn clustering_batch_size(deviation: f64, eligible: usize, current: f64, cap: usize) -> usize {
    let scale = if current < SPARSE_THRESHOLD {
        SPARSE_SCALE
    } else {
        DENSE_SCALE
    };
    ((deviation.abs() * eligible as f64 * scale) as usize)
        .max(1)
        .min(cap.max(1))
}

/// Moves the mean clustering coefficient one batch in `direction`.
///
/// Raising closes open triangles around random primary nodes, or grows one
/// from a dummy node. Lowering opens closed triangles, or removes a node when
/// there are none.
pub fn adjust_clustering<G: GraphMutation, R: Rng + ?Sized>(
    graph: &mut G,
    ctx: &AdjustContext<'_>,
    direction: Direction,
    deviation: f64,
    current: f64,
    rng: &mut R,
) -> usize {
    let primary = graph.graph().nodes_of_type(ctx.primary_type);
    if primary.is_empty() {
        return 0;
    }
    let batch = clustering_batch_size(deviation, primary.len(), current, ctx.max_clustering_batch);

    let mut edits = 0;
    for _ in 0..batch {
        let Some(node) = primary.choose(rng) else {
            break;
        };
        if !graph.graph().contains(node) {
            continue;
        }
        let applied = match direction {
            Direction::Raise => close_triangle(graph, node, ctx, rng),
            Direction::Lower => open_triangle(graph, node, ctx, rng),
        };
        edits += usize::from(applied);
    }
    debug!(?direction, batch, edits, "Clustering adjustment");
    edits
}

fn close_triangle<G: GraphMutation, R: Rng + ?Sized>(
    graph: &mut G,
    node: &str,
    ctx: &AdjustContext<'_>,
    rng: &mut R,
) -> bool {
    let neighbors: Vec<NodeId> = graph.graph().neighbors(node).cloned().collect();
    for (i, a) in neighbors.iter().enumerate() {
        for b in &neighbors[i + 1..] {
            let g = graph.graph();
            if !g.has_edge(a, b) && ctx.schema.is_valid_connection(g, a, b) {
                return graph.add_edge(a, b);
            }
        }
    }
    grow_dummy_triangle(graph, node, neighbors, ctx, rng)
}

/// Attaches a dummy to `node` and up to two of its neighbors. The dummy is
/// discarded unless at least one triangle closes.
fn grow_dummy_triangle<G: GraphMutation, R: Rng + ?Sized>(
    graph: &mut G,
    node: &str,
    mut neighbors: Vec<NodeId>,
    ctx: &AdjustContext<'_>,
    rng: &mut R,
) -> bool {
    if neighbors.is_empty() {
        return false;
    }
    let Some(dummy) = ctx.dummies.attach(graph, node, rng) else {
        return false;
    };
    neighbors.shuffle(rng);
    let mut linked = 0;
    for neighbor in &neighbors {
        if linked == DUMMY_NEIGHBOR_LINKS {
            break;
        }
        if ctx.schema.is_valid_connection(graph.graph(), &dummy, neighbor)
            && graph.add_edge(&dummy, neighbor)
        {
            linked += 1;
        }
    }
    if linked == 0 {
        graph.remove_node(&dummy);
        trace!(node = %node, "Dummy closed no triangle, discarded");
        return false;
    }
    true
}

fn open_triangle<G: GraphMutation, R: Rng + ?Sized>(
    graph: &mut G,
    node: &str,
    ctx: &AdjustContext<'_>,
    rng: &mut R,
) -> bool {
    let triangles: Vec<(NodeId, NodeId)> = {
        let g = graph.graph();
        let neighbors: Vec<&NodeId> = g.neighbors(node).collect();
        let mut closed = Vec::new();
        for (i, a) in neighbors.iter().enumerate() {
            for b in &neighbors[i + 1..] {
                if g.has_edge(a, b) {
                    closed.push(((*a).clone(), (*b).clone()));
                }
            }
        }
        closed
    };

    if let Some((a, b)) = triangles.choose(rng) {
        let edges = [(node, a.as_str()), (node, b.as_str()), (a.as_str(), b.as_str())];
        return match edges.choose(rng) {
            Some((x, y)) => graph.remove_edge(x, y),
            None => false,
        };
    }

    let victim = {
        let g = graph.graph();
        let synthetic: Vec<&NodeId> = g
            .nodes()
            .filter(|(_, data)| data.synthetic)
            .map(|(id, _)| id)
            .collect();
        let pool = if synthetic.is_empty() {
            g.nodes()
                .filter(|(_, data)| data.resource_type != ctx.primary_type)
                .map(|(id, _)| id)
                .collect()
        } else {
            synthetic
        };
        pool.choose(rng).map(|id| (*id).clone())
    };
    match victim {
        Some(id) => graph.remove_node(&id),
        None => false,
    }
}
