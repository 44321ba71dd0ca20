//! Per-operation timing of graph mutations.

use crate::graph::{GraphMutation, NodeData, ReferenceGraph};
use clinshield_core::NodeId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    AddNode,
    RemoveNode,
    AddEdge,
    RemoveEdge,
}

#[derive(Debug, Clone, Serialize)]
pub struct MutationTiming {
    pub operation: MutationKind,
    pub micros: u64,
    pub applied: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationStats {
    pub calls: usize,
    pub applied: usize,
    pub total_micros: u64,
}

/// Per-call entries kept by [`TimedGraph::new`].
pub const DEFAULT_TIMING_LIMIT: usize = 100_000;

/// Wraps a graph and records how long every mutation took.
///
/// Aggregated [`OperationStats`] cover every call. The per-call log stops
/// growing at its limit; later calls only count towards `dropped`.
#[derive(Debug, Clone)]
pub struct TimedGraph<G> {
    inner: G,
    timings: Vec<MutationTiming>,
    stats: BTreeMap<MutationKind, OperationStats>,
    limit: usize,
    dropped: usize,
}

impl<G: GraphMutation> TimedGraph<G> {
    pub fn new(inner: G) -> Self {
        Self::with_limit(inner, DEFAULT_TIMING_LIMIT)
    }

    /// Keeps at most `limit` per-call entries. A limit of 0 keeps stats only.
    pub fn with_limit(inner: G, limit: usize) -> Self {
        Self {
            inner,
            timings: Vec::new(),
            stats: BTreeMap::new(),
            limit,
            dropped: 0,
        }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    pub fn into_inner(self) -> G {
        self.inner
    }

    pub fn timings(&self) -> &[MutationTiming] {
        &self.timings
    }

    /// Calls that happened after the per-call log was full.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn stats(&self) -> BTreeMap<MutationKind, OperationStats> {
        self.stats.clone()
    }

    fn timed(&mut self, operation: MutationKind, op: impl FnOnce(&mut G) -> bool) -> bool {
        let start = Instant::now();
        let applied = op(&mut self.inner);
        let micros = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
        trace!(?operation, applied, micros, "graph mutation");

        let entry = self.stats.entry(operation).or_default();
        entry.calls += 1;
        entry.applied += usize::from(applied);
        entry.total_micros = entry.total_micros.saturating_add(micros);

        if self.timings.len() < self.limit {
            self.timings.push(MutationTiming {
                operation,
                micros,
                applied,
            });
        } else {
            self.dropped += 1;
        }
        applied
    }
}

impl<G: GraphMutation> GraphMutation for TimedGraph<G> {
    fn graph(&self) -> &ReferenceGraph {
        self.inner.graph()
    }

    fn add_node(&mut self, id: NodeId, data: NodeData) -> bool {
        self.timed(MutationKind::AddNode, |g| g.add_node(id, data))
    }

    fn remove_node(&mut self, id: &str) -> bool {
        self.timed(MutationKind::RemoveNode, |g| g.remove_node(id))
    }

    fn add_edge(&mut self, a: &str, b: &str) -> bool {
        self.timed(MutationKind::AddEdge, |g| g.add_edge(a, b))
    }

    fn remove_edge(&mut self, a: &str, b: &str) -> bool {
        self.timed(MutationKind::RemoveEdge, |g| g.remove_edge(a, b))
    }
}
