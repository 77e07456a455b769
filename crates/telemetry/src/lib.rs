//! Observe-only bookkeeping for statement execution.
//!
//! Nothing in this crate can fail a statement. Sinks return errors so that
//! the caller can log them, and the caller never does anything else with
//! them.

pub mod audit;
pub mod digest;
pub mod format;
pub mod metrics;
pub mod phases;
pub mod slow_log;
pub mod summary;

pub use audit::{AuditEvent, AuditSink, MemoryAudit};
pub use digest::{Digest, normalize_sql, plan_digest, sql_digest};
pub use format::{flatten_query, format_sql};
pub use metrics::{HistogramSnapshot, InMemoryMetrics, Metric, MetricsSink, NoopMetrics};
pub use phases::{Phase, PhaseDurations, internal_flag};
pub use slow_log::{
    MemorySlowLog, SlowLogSink, SlowQueryInfo, SlowQueryItems, SlowQueryRing, TracingSlowLog,
    dedup_index_names,
};
pub use summary::{StmtExecInfo, StmtSummaryByDigest, StmtSummaryEntry};

use common::Config;
use std::sync::Arc;

/// Every sink a statement reports to.
#[derive(Clone)]
pub struct Observers {
    pub metrics: Arc<dyn MetricsSink>,
    pub slow_log: Arc<dyn SlowLogSink>,
    pub slow_queries: Arc<SlowQueryRing>,
    pub summary: Arc<StmtSummaryByDigest>,
    pub audit: Vec<Arc<dyn AuditSink>>,
}

impl Observers {
    /// Metrics discarded, slow log through `tracing`, no auditors.
    pub fn new(config: &Config) -> Self {
        Self {
            metrics: Arc::new(NoopMetrics),
            slow_log: Arc::new(TracingSlowLog),
            slow_queries: Arc::new(SlowQueryRing::new(config.slow_query_ring_capacity)),
            summary: Arc::new(StmtSummaryByDigest::from_config(config)),
            audit: Vec::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_slow_log(mut self, slow_log: Arc<dyn SlowLogSink>) -> Self {
        self.slow_log = slow_log;
        self
    }

    pub fn with_audit(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit.push(sink);
        self
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("summary_entries", &self.summary.len())
            .field("slow_queries", &self.slow_queries.len())
            .field("audit_sinks", &self.audit.len())
            .finish()
    }
}
