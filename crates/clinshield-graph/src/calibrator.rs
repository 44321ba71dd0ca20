//! Round-based calibration of the reference graph towards noised metric
//! targets.

use crate::adjust::{adjust_centrality, adjust_clustering, adjust_degree, AdjustContext, Direction};
use crate::dummy::DummyFactory;
use crate::graph::GraphMutation;
use crate::metrics::{distortion_index, GraphMetric, GraphMetrics, MetricTargets};
use crate::schema::SchemaGraph;
use clinshield_core::{derive_node_shapes, FieldShape, GraphConfig, NodeId, Record, Result};
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every metric sits inside its band.
    Converged,
    /// A round made no edit.
    Stalled,
    /// `max_rounds` was reached.
    RoundLimit,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphReport {
    pub rounds: usize,
    pub stop_reason: StopReason,
    pub initial: GraphMetrics,
    #[serde(rename = "final")]
    pub final_metrics: GraphMetrics,
    pub targets: MetricTargets,
    pub distortion_index: f64,
    pub nodes_added: usize,
    pub nodes_removed: usize,
    pub edges_added: usize,
    pub edges_removed: usize,
    pub isolated_removed: usize,
}

impl GraphReport {
    pub fn converged(&self) -> bool {
        self.stop_reason == StopReason::Converged
    }
}

pub struct GraphCalibrator {
    config: GraphConfig,
    schema: SchemaGraph,
    shapes: BTreeMap<String, FieldShape>,
}

impl GraphCalibrator {
    pub fn new(config: GraphConfig, schema: SchemaGraph, shapes: BTreeMap<String, FieldShape>) -> Self {
        Self {
            config,
            schema,
            shapes,
        }
    }

    /// Uses the configured schema and node shapes, deriving whichever is
    /// missing from `records`.
    pub fn from_records<'a>(
        config: GraphConfig,
        records: impl IntoIterator<Item = &'a Record> + Clone,
    ) -> Self {
        let schema = match &config.schema {
            Some(links) => SchemaGraph::new(links.clone()),
            None => SchemaGraph::derive(
                records.clone(),
                config.schema_sample_size,
                &config.display_types,
            ),
        };
        let shapes = match &config.node_shapes {
            Some(shapes) => shapes.clone(),
            None => derive_node_shapes(records),
        };
        Self::new(config, schema, shapes)
    }

    pub fn schema(&self) -> &SchemaGraph {
        &self.schema
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Edits `graph` until its metrics fall inside the noised target bands,
    /// a round makes no edit, or the round cap is hit.
    pub fn calibrate<G: GraphMutation, R: Rng + ?Sized>(
        &self,
        graph: &mut G,
        rng: &mut R,
    ) -> Result<GraphReport> {
        let primary = self.config.primary_type.as_str();
        let original_nodes: BTreeSet<NodeId> = graph.graph().node_ids().cloned().collect();
        let original_edges = graph.graph().edges();

        let initial = GraphMetrics::measure(graph.graph(), primary);
        let targets = MetricTargets::noised(&initial, &self.config.metrics, rng)?;
        info!(
            primary = %primary,
            nodes = original_nodes.len(),
            edges = original_edges.len(),
            "Starting graph calibration"
        );

        let ctx = AdjustContext {
            schema: &self.schema,
            dummies: DummyFactory::new(
                &self.schema,
                &self.shapes,
                primary,
                &self.config.display_types,
            ),
            primary_type: primary,
            max_clustering_batch: self.config.max_clustering_batch,
        };

        let mut rounds = 0;
        let stop_reason = loop {
            let current = GraphMetrics::measure(graph.graph(), primary);
            let Some(metric) = targets.select(&current) else {
                break StopReason::Converged;
            };
            if rounds >= self.config.max_rounds {
                warn!(
                    rounds,
                    metric = %metric,
                    "Graph calibration hit the round cap"
                );
                break StopReason::RoundLimit;
            }

            let value = current.get(metric);
            let target = targets.get(metric).map_or(value, |t| t.target);
            let direction = if value < target {
                Direction::Raise
            } else {
                Direction::Lower
            };
            let edits = match metric {
                GraphMetric::DegreeCentrality => adjust_centrality(graph, &ctx, direction, rng),
                GraphMetric::DegreeDistribution => adjust_degree(graph, &ctx, direction, rng),
                GraphMetric::ClusteringCoefficient => {
                    let deviation = targets.deviation(metric, value);
                    adjust_clustering(graph, &ctx, direction, deviation, value, rng)
                }
            };
            rounds += 1;
            debug!(round = rounds, metric = %metric, value, target, ?direction, edits, "Graph round");

            if edits == 0 {
                break StopReason::Stalled;
            }
        };

        let isolated_removed = if self.config.remove_isolated {
            remove_isolated(graph)
        } else {
            0
        };

        let final_metrics = GraphMetrics::measure(graph.graph(), primary);
        let final_nodes: BTreeSet<NodeId> = graph.graph().node_ids().cloned().collect();
        let final_edges = graph.graph().edges();
        let report = GraphReport {
            rounds,
            stop_reason,
            initial,
            final_metrics,
            distortion_index: distortion_index(&original_edges, &final_edges),
            nodes_added: final_nodes.difference(&original_nodes).count(),
            nodes_removed: original_nodes.difference(&final_nodes).count(),
            edges_added: final_edges.difference(&original_edges).count(),
            edges_removed: original_edges.difference(&final_edges).count(),
            targets,
            isolated_removed,
        };
        info!(
            rounds,
            stop = ?report.stop_reason,
            distortion = report.distortion_index,
            nodes_added = report.nodes_added,
            nodes_removed = report.nodes_removed,
            "Graph calibration finished"
        );
        Ok(report)
    }
}

/// Drops every node without edges. Returns how many were removed.
pub fn remove_isolated<G: GraphMutation>(graph: &mut G) -> usize {
    let isolated = graph.graph().isolated_nodes();
    isolated
        .iter()
        .filter(|id| graph.remove_node(id))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeData, ReferenceGraph};
    use clinshield_core::{GraphMetricsConfig, MetricSettings};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn schema() -> SchemaGraph {
        SchemaGraph::new(BTreeMap::from([(
            "Encounter".to_string(),
            BTreeMap::from([("Patient".to_string(), "references to Patient".to_string())]),
        )]))
    }

    fn patients_with_encounters() -> ReferenceGraph {
        let mut graph = ReferenceGraph::new();
        for i in 0..6 {
            let patient = format!("Patient/p{}", i);
            let encounter = format!("Encounter/e{}", i);
            graph.add_node(patient.clone(), NodeData::external("Patient", format!("p{}", i)));
            graph.add_node(encounter.clone(), NodeData::external("Encounter", format!("e{}", i)));
            graph.add_edge(&patient, &encounter);
        }
        graph
    }

    #[test]
    fn test_wide_tolerances_converge_immediately() {
        let loose = MetricSettings {
            epsilon: 1.0,
            sensitivity: 0.0001,
            tolerance: 1_000.0,
        };
        let config = GraphConfig {
            metrics: GraphMetricsConfig {
                degree_centrality: loose,
                degree_distribution: loose,
                clustering_coefficient: loose,
            },
            ..GraphConfig::default()
        };
        let calibrator = GraphCalibrator::new(config, schema(), BTreeMap::new());
        let mut graph = patients_with_encounters();
        let before = graph.edges();

        let mut rng = StdRng::seed_from_u64(1);
        let report = calibrator.calibrate(&mut graph, &mut rng).unwrap();
        assert!(report.converged());
        assert_eq!(report.rounds, 0);
        assert_eq!(graph.edges(), before);
        assert_eq!(report.distortion_index, 0.0);
    }

    #[test]
    fn test_round_cap_stops_the_loop() {
        let loose = MetricSettings {
            epsilon: 1.0,
            sensitivity: 0.0001,
            tolerance: 1_000.0,
        };
        // a zero-width band is never hit exactly
        let exact = MetricSettings {
            tolerance: 0.0,
            ..loose
        };
        let config = GraphConfig {
            max_rounds: 0,
            metrics: GraphMetricsConfig {
                degree_centrality: loose,
                degree_distribution: exact,
                clustering_coefficient: loose,
            },
            ..GraphConfig::default()
        };
        let calibrator = GraphCalibrator::new(config, schema(), BTreeMap::new());
        let mut graph = patients_with_encounters();
        let before = graph.edges();

        let mut rng = StdRng::seed_from_u64(8);
        let report = calibrator.calibrate(&mut graph, &mut rng).unwrap();
        assert_eq!(report.stop_reason, StopReason::RoundLimit);
        assert_eq!(report.rounds, 0);
        assert_eq!(graph.edges(), before);
    }

    #[test]
    fn test_remove_isolated() {
        let mut graph = patients_with_encounters();
        graph.add_node("Patient/alone".into(), NodeData::external("Patient", "alone"));
        assert_eq!(remove_isolated(&mut graph), 1);
        assert!(!graph.contains("Patient/alone"));
        assert_eq!(graph.node_count(), 12);
    }
}
