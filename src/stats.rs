//! Stats (ambient)
//!
//! A read-only snapshot of every component's counters, grounded in
//! `api/stats.py`'s aggregate status shape. There is no HTTP surface here
//! (serving it is out of scope) — this is the struct an operator-facing
//! endpoint would serialize, left as a plain, loggable value.

use crate::aggregator::AggregatorStats;
use crate::lifecycle::PipelineController;
use crate::worker::WorkerStatus;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub workers: Vec<WorkerStatus>,
    pub aggregator: AggregatorStats,
    pub open_aggregations: usize,
    pub active_connections: usize,
}

impl PipelineController {
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            workers: self.worker_statuses(),
            aggregator: self.aggregator().stats(),
            open_aggregations: self.aggregator().open_entry_count(),
            active_connections: self.registry.len(),
        }
    }
}
