//! Structural metrics of the primary-entity subset and their noised targets.

use crate::graph::ReferenceGraph;
use clinshield_core::{GraphMetricsConfig, MetricSettings, NodeId, Result, ValueRange};
use clinshield_privacy::laplace_noise;
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Clustering is noised on a scale 1000 times larger than it is measured on.
const CLUSTERING_SCALE: f64 = 1000.0;
/// Bound on the noise added to the centrality target.
const CENTRALITY_NOISE_BOUND: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphMetric {
    DegreeCentrality,
    DegreeDistribution,
    ClusteringCoefficient,
}

impl GraphMetric {
    /// Order in which out-of-band metrics are corrected.
    pub const PRIORITY: [GraphMetric; 3] = [
        GraphMetric::DegreeCentrality,
        GraphMetric::DegreeDistribution,
        GraphMetric::ClusteringCoefficient,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            GraphMetric::DegreeCentrality => "degree_centrality",
            GraphMetric::DegreeDistribution => "degree_distribution",
            GraphMetric::ClusteringCoefficient => "clustering_coefficient",
        }
    }

    fn settings(&self, config: &GraphMetricsConfig) -> MetricSettings {
        match self {
            GraphMetric::DegreeCentrality => config.degree_centrality,
            GraphMetric::DegreeDistribution => config.degree_distribution,
            GraphMetric::ClusteringCoefficient => config.clustering_coefficient,
        }
    }
}

impl fmt::Display for GraphMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Mean degree over `subset`.
pub fn degree_distribution(graph: &ReferenceGraph, subset: &[NodeId]) -> f64 {
    if subset.is_empty() {
        return 0.0;
    }
    subset.iter().map(|n| graph.degree(n)).sum::<usize>() as f64 / subset.len() as f64
}

/// `degree / (|subset| - 1)` of one node.
pub fn node_centrality(graph: &ReferenceGraph, subset_len: usize, node: &str) -> f64 {
    if subset_len <= 1 {
        return 0.0;
    }
    graph.degree(node) as f64 / (subset_len - 1) as f64
}

/// Mean degree centrality over `subset`.
pub fn degree_centrality(graph: &ReferenceGraph, subset: &[NodeId]) -> f64 {
    if subset.len() <= 1 {
        return 0.0;
    }
    subset
        .iter()
        .map(|n| node_centrality(graph, subset.len(), n))
        .sum::<f64>()
        / subset.len() as f64
}

/// Local clustering coefficient against the whole graph.
pub fn local_clustering(graph: &ReferenceGraph, node: &str) -> f64 {
    let neighbors: Vec<&NodeId> = graph.neighbors(node).collect();
    let k = neighbors.len();
    if k < 2 {
        return 0.0;
    }
    let mut links = 0usize;
    for (i, a) in neighbors.iter().enumerate() {
        for b in &neighbors[i + 1..] {
            if graph.has_edge(a, b) {
                links += 1;
            }
        }
    }
    2.0 * links as f64 / (k * (k - 1)) as f64
}

/// Mean local clustering coefficient over `subset`.
pub fn clustering_coefficient(graph: &ReferenceGraph, subset: &[NodeId]) -> f64 {
    if subset.is_empty() {
        return 0.0;
    }
    subset.iter().map(|n| local_clustering(graph, n)).sum::<f64>() / subset.len() as f64
}

/// All three metrics at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GraphMetrics {
    pub degree_centrality: f64,
    pub degree_distribution: f64,
    pub clustering_coefficient: f64,
}

impl GraphMetrics {
    pub fn measure(graph: &ReferenceGraph, primary_type: &str) -> Self {
        let subset = graph.nodes_of_type(primary_type);
        Self {
            degree_centrality: degree_centrality(graph, &subset),
            degree_distribution: degree_distribution(graph, &subset),
            clustering_coefficient: clustering_coefficient(graph, &subset),
        }
    }

    pub fn get(&self, metric: GraphMetric) -> f64 {
        match metric {
            GraphMetric::DegreeCentrality => self.degree_centrality,
            GraphMetric::DegreeDistribution => self.degree_distribution,
            GraphMetric::ClusteringCoefficient => self.clustering_coefficient,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricTarget {
    pub target: f64,
    pub tolerance: f64,
    pub band: ValueRange,
}

/// Noised target band of every metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricTargets {
    targets: BTreeMap<GraphMetric, MetricTarget>,
}

impl MetricTargets {
    pub fn new(targets: BTreeMap<GraphMetric, MetricTarget>) -> Self {
        Self { targets }
    }

    /// Targets from one measurement of the original graph.
    ///
    /// `target = max(0, measured + Laplace(sensitivity / epsilon))`.
    /// Clustering is noised on a x1000 scale and centrality noise is bounded.
    pub fn noised<R: Rng + ?Sized>(
        measured: &GraphMetrics,
        config: &GraphMetricsConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let mut targets = BTreeMap::new();
        for metric in GraphMetric::PRIORITY {
            let settings = metric.settings(config);
            let noise = laplace_noise(settings.sensitivity / settings.epsilon, rng)?;
            let value = measured.get(metric);
            let target = match metric {
                GraphMetric::ClusteringCoefficient => {
                    (value * CLUSTERING_SCALE + noise).max(0.0) / CLUSTERING_SCALE
                }
                GraphMetric::DegreeCentrality => {
                    (value + noise.clamp(-CENTRALITY_NOISE_BOUND, CENTRALITY_NOISE_BOUND)).max(0.0)
                }
                GraphMetric::DegreeDistribution => (value + noise).max(0.0),
            };
            targets.insert(
                metric,
                MetricTarget {
                    target,
                    tolerance: settings.tolerance,
                    band: ValueRange::around(target, settings.tolerance),
                },
            );
        }
        Ok(Self { targets })
    }

    pub fn get(&self, metric: GraphMetric) -> Option<&MetricTarget> {
        self.targets.get(&metric)
    }

    pub fn deviation(&self, metric: GraphMetric, value: f64) -> f64 {
        self.get(metric).map_or(0.0, |t| t.band.deviation(value))
    }

    pub fn all_within(&self, current: &GraphMetrics) -> bool {
        GraphMetric::PRIORITY
            .iter()
            .all(|m| self.deviation(*m, current.get(*m)) == 0.0)
    }

    /// Metric to correct next.
    ///
    /// An out-of-band centrality always wins. Otherwise the metric furthest
    /// outside its band, earlier priority breaking ties. `None` when all are
    /// within their bands.
    pub fn select(&self, current: &GraphMetrics) -> Option<GraphMetric> {
        let mut chosen: Option<(GraphMetric, f64)> = None;
        for metric in GraphMetric::PRIORITY {
            let deviation = self.deviation(metric, current.get(metric));
            if deviation <= 0.0 {
                continue;
            }
            if metric == GraphMetric::PRIORITY[0] {
                return Some(metric);
            }
            if chosen.map_or(true, |(_, best)| deviation > best) {
                chosen = Some((metric, deviation));
            }
        }
        chosen.map(|(metric, _)| metric)
    }
}

/// Share of edges added or removed relative to the original edge count.
pub fn distortion_index(
    original: &BTreeSet<(NodeId, NodeId)>,
    current: &BTreeSet<(NodeId, NodeId)>,
) -> f64 {
    if original.is_empty() {
        return 0.0;
    }
    let added = current.difference(original).count();
    let removed = original.difference(current).count();
    (added + removed) as f64 / original.len() as f64
}
