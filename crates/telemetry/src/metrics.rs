//! Metric sink contract and an in-memory implementation.
//!
//! Sinks are append-only from the executor's point of view: nothing on the
//! execution path ever reads a metric back.

use dashmap::DashMap;

/// Histograms and counters emitted by statement execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Labels: phase name, internal flag.
    ExecPhaseDuration,
    /// Labels: "general" | "internal".
    SessionExecuteRunDuration,
    /// Labels: none. Value: retries of a statement that retried at least once.
    StatementPessimisticRetryCount,
    /// Labels: none. Value: keys locked by one statement.
    StatementLockKeysCount,
    /// Labels: none. Value: seconds from lock start until deadlock was reported.
    StatementDeadlockDetectDuration,
    /// Labels: "general" | "internal".
    QueryProcDuration,
    /// Labels: "general" | "internal".
    CopProcDuration,
    /// Labels: "general" | "internal".
    CopWaitDuration,
    /// Labels: error label.
    StatementErrors,
}

impl Metric {
    pub fn name(self) -> &'static str {
        match self {
            Metric::ExecPhaseDuration => "executor_phase_duration_seconds",
            Metric::SessionExecuteRunDuration => "session_execute_run_duration_seconds",
            Metric::StatementPessimisticRetryCount => "statement_pessimistic_retry_count",
            Metric::StatementLockKeysCount => "statement_lock_keys_count",
            Metric::StatementDeadlockDetectDuration => "statement_deadlock_detect_duration_seconds",
            Metric::QueryProcDuration => "slow_query_process_duration_seconds",
            Metric::CopProcDuration => "slow_query_cop_process_duration_seconds",
            Metric::CopWaitDuration => "slow_query_cop_wait_duration_seconds",
            Metric::StatementErrors => "statement_errors_total",
        }
    }
}

/// Concurrency-safe destination for observations.
pub trait MetricsSink: Send + Sync {
    fn observe(&self, metric: Metric, labels: &[&str], value: f64);

    fn inc(&self, metric: Metric, labels: &[&str]) {
        self.observe(metric, labels, 1.0);
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn observe(&self, _metric: Metric, _labels: &[&str], _value: f64) {}
}

/// Summary of the observations recorded for one series.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl HistogramSnapshot {
    fn record(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }
}

type SeriesKey = (Metric, Vec<String>);

/// Keeps count/sum/min/max per labelled series.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    series: DashMap<SeriesKey, HistogramSnapshot>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, metric: Metric, labels: &[&str]) -> Option<HistogramSnapshot> {
        let key = (metric, labels.iter().map(|l| l.to_string()).collect());
        self.series.get(&key).map(|entry| *entry.value())
    }

    /// Number of observations across every series of `metric`.
    pub fn total_count(&self, metric: Metric) -> u64 {
        self.series
            .iter()
            .filter(|entry| entry.key().0 == metric)
            .map(|entry| entry.value().count)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn observe(&self, metric: Metric, labels: &[&str], value: f64) {
        let key = (metric, labels.iter().map(|l| l.to_string()).collect());
        self.series.entry(key).or_default().record(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_tracks_count_sum_and_bounds() {
        let metrics = InMemoryMetrics::new();
        metrics.observe(Metric::StatementLockKeysCount, &[], 3.0);
        metrics.observe(Metric::StatementLockKeysCount, &[], 1.0);

        let snap = metrics.snapshot(Metric::StatementLockKeysCount, &[]).unwrap();
        assert_eq!(snap.count, 2);
        assert_eq!(snap.sum, 4.0);
        assert_eq!(snap.min, 1.0);
        assert_eq!(snap.max, 3.0);
    }

    #[test]
    fn labels_split_series() {
        let metrics = InMemoryMetrics::new();
        metrics.inc(Metric::StatementErrors, &["deadlock"]);
        metrics.inc(Metric::StatementErrors, &["cancelled"]);
        metrics.inc(Metric::StatementErrors, &["deadlock"]);

        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics.total_count(Metric::StatementErrors), 3);
        assert_eq!(
            metrics
                .snapshot(Metric::StatementErrors, &["deadlock"])
                .map(|s| s.count),
            Some(2)
        );
    }

    #[test]
    fn metric_names_are_stable() {
        assert_eq!(
            Metric::ExecPhaseDuration.name(),
            "executor_phase_duration_seconds"
        );
    }
}
