//! The anonymization run: field calibration, graph calibration, repair and
//! optional identifier remapping.

use anyhow::{Context, Result};
use clinshield_core::{AnonymizerConfig, IdMapping, Record, RecordBatch, SeedSource};
use clinshield_graph::{
    build_graph, materialize, repair, GraphCalibrator, GraphReport, MutationKind, MutationTiming,
    OperationStats, RepairSummary, TimedGraph,
};
use clinshield_privacy::{
    calibrate_batches, calibrate_resources, generalize_batch, CategoricalReport, NumericReport,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{info, info_span};

/// Everything a run reports.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub seed: u64,
    pub batches: usize,
    pub records_in: usize,
    pub records_out: usize,
    pub numeric: Vec<NumericReport>,
    pub categorical: Vec<CategoricalReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<RepairSummary>,
    pub remapped_ids: usize,
    pub stage_millis: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TimingLog {
    pub stats: BTreeMap<MutationKind, OperationStats>,
    pub mutations: Vec<MutationTiming>,
    /// Mutations counted in `stats` but past the per-call log limit
    pub dropped: usize,
}

pub struct RunOutcome {
    pub batches: Vec<RecordBatch>,
    pub report: RunReport,
    pub timings: TimingLog,
}

pub struct Pipeline<'a> {
    config: &'a AnonymizerConfig,
    seeds: SeedSource,
    skip_graph: bool,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a AnonymizerConfig, skip_graph: bool) -> Self {
        Self {
            config,
            seeds: SeedSource::from_config(config.calibration.seed),
            skip_graph,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seeds.master()
    }

    pub fn run(&self, mut batches: Vec<RecordBatch>) -> Result<RunOutcome> {
        let pipeline = &self.config.pipeline;
        let records_in: usize = batches.iter().map(RecordBatch::len).sum();
        let mut stage_millis = BTreeMap::new();
        let mut timings = TimingLog::default();
        info!(seed = self.seed(), batches = batches.len(), records = records_in, "Starting run");

        let numeric = timed_stage(&mut stage_millis, "numeric", || {
            if pipeline.numeric {
                calibrate_batches(&mut batches, self.config, &self.seeds)
            } else {
                self.generalize_only(&mut batches);
                Vec::new()
            }
        });

        let categorical = timed_stage(&mut stage_millis, "categorical", || {
            if pipeline.categorical {
                calibrate_resources(&mut batches, self.config, &self.seeds)
            } else {
                Vec::new()
            }
        });

        let mut graph_report = None;
        let mut repair_summary = None;
        if pipeline.graph && !self.skip_graph {
            let (next, report, summary, log) =
                timed_stage(&mut stage_millis, "graph", || self.graph_stage(batches))?;
            batches = next;
            graph_report = Some(report);
            repair_summary = Some(summary);
            timings = log;
        }

        let remapped_ids = if pipeline.remap_ids {
            timed_stage(&mut stage_millis, "remap_ids", || self.remap_ids(&mut batches))
        } else {
            0
        };

        let report = RunReport {
            seed: self.seed(),
            batches: batches.len(),
            records_in,
            records_out: batches.iter().map(RecordBatch::len).sum(),
            numeric,
            categorical,
            graph: graph_report,
            repair: repair_summary,
            remapped_ids,
            stage_millis,
        };
        info!(
            records_in = report.records_in,
            records_out = report.records_out,
            "Run finished"
        );
        Ok(RunOutcome {
            batches,
            report,
            timings,
        })
    }

    fn generalize_only(&self, batches: &mut [RecordBatch]) {
        for batch in batches.iter_mut() {
            if let Some(rules) = self.config.generalization.get(&batch.resource_type) {
                generalize_batch(batch, rules);
            }
        }
    }

    fn graph_stage(
        &self,
        batches: Vec<RecordBatch>,
    ) -> Result<(Vec<RecordBatch>, GraphReport, RepairSummary, TimingLog)> {
        let _span = info_span!("graph").entered();
        let graph_config = &self.config.graph;
        let records: Vec<Record> = batches.into_iter().flat_map(|b| b.records).collect();

        let calibrator = GraphCalibrator::from_records(graph_config.clone(), records.iter());
        let graph = build_graph(records, calibrator.schema(), &graph_config.display_types);

        let mut timed = TimedGraph::new(graph);
        let mut rng = self.seeds.rng_for("graph");
        let report = calibrator
            .calibrate(&mut timed, &mut rng)
            .context("Graph calibration failed")?;
        let log = TimingLog {
            stats: timed.stats(),
            mutations: timed.timings().to_vec(),
            dropped: timed.dropped(),
        };

        let mut graph = timed.into_inner();
        let summary = repair(&mut graph, calibrator.schema(), &graph_config.display_types);
        Ok((materialize(&graph), report, summary, log))
    }

    fn remap_ids(&self, batches: &mut [RecordBatch]) -> usize {
        let mut rng = self.seeds.rng_for("ids");
        let mut mapping = IdMapping::new();
        for record in batches.iter().flat_map(|b| &b.records) {
            if let Some(id) = record.id() {
                mapping.map_id(id, &mut rng);
            }
        }
        for record in batches.iter_mut().flat_map(|b| &mut b.records) {
            mapping.apply(record);
        }
        info!(ids = mapping.len(), "Remapped record identifiers");
        mapping.len()
    }
}

fn timed_stage<T>(millis: &mut BTreeMap<String, u64>, stage: &str, run: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let result = run();
    let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    millis.insert(stage.to_string(), elapsed);
    result
}
