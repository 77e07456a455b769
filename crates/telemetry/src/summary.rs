//! Statement summary aggregated by normalized-statement digest.

use common::ExecDetails;
use dashmap::DashMap;
use serde::Serialize;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, SystemTime},
};

/// Facts about one finished statement, handed to the summary.
#[derive(Clone, Debug, Serialize)]
pub struct StmtExecInfo {
    pub schema_name: String,
    pub original_sql: String,
    pub normalized_sql: String,
    pub digest: String,
    pub prev_sql: String,
    pub prev_sql_digest: String,
    pub plan: String,
    pub plan_digest: String,
    pub user: String,
    pub total_latency: Duration,
    pub parse_latency: Duration,
    pub compile_latency: Duration,
    pub exec_detail: ExecDetails,
    pub mem_max: i64,
    pub disk_max: i64,
    pub start_time: SystemTime,
    pub is_internal: bool,
    pub succeed: bool,
    pub prepared: bool,
    pub exec_retry_count: u32,
    pub exec_retry_time: Duration,
    pub result_rows: u64,
    pub affected_rows: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SummaryKey {
    schema_name: String,
    digest: String,
    plan_digest: String,
    prev_digest: String,
}

/// Aggregated view of every execution sharing a key.
#[derive(Clone, Debug, Serialize)]
pub struct StmtSummaryEntry {
    pub schema_name: String,
    pub digest: String,
    pub normalized_sql: String,
    pub plan_digest: String,
    pub prev_sql: String,
    pub sample_sql: String,
    pub sample_plan: String,
    pub exec_count: u64,
    pub sum_errors: u64,
    pub sum_latency: Duration,
    pub max_latency: Duration,
    pub min_latency: Duration,
    pub sum_compile_latency: Duration,
    pub sum_retries: u64,
    pub sum_retry_time: Duration,
    pub max_retries: u32,
    pub sum_result_rows: u64,
    pub sum_affected_rows: u64,
    pub sum_lock_keys: u64,
    pub max_mem: i64,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
}

impl StmtSummaryEntry {
    fn new(info: &StmtExecInfo) -> Self {
        Self {
            schema_name: info.schema_name.clone(),
            digest: info.digest.clone(),
            normalized_sql: info.normalized_sql.clone(),
            plan_digest: info.plan_digest.clone(),
            prev_sql: info.prev_sql.clone(),
            sample_sql: info.original_sql.clone(),
            sample_plan: info.plan.clone(),
            exec_count: 0,
            sum_errors: 0,
            sum_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
            min_latency: Duration::MAX,
            sum_compile_latency: Duration::ZERO,
            sum_retries: 0,
            sum_retry_time: Duration::ZERO,
            max_retries: 0,
            sum_result_rows: 0,
            sum_affected_rows: 0,
            sum_lock_keys: 0,
            max_mem: 0,
            first_seen: info.start_time,
            last_seen: info.start_time,
        }
    }

    fn add(&mut self, info: &StmtExecInfo) {
        self.exec_count += 1;
        if !info.succeed {
            self.sum_errors += 1;
        }
        self.sum_latency += info.total_latency;
        self.max_latency = self.max_latency.max(info.total_latency);
        self.min_latency = self.min_latency.min(info.total_latency);
        self.sum_compile_latency += info.compile_latency;
        self.sum_retries += u64::from(info.exec_retry_count);
        self.sum_retry_time += info.exec_retry_time;
        self.max_retries = self.max_retries.max(info.exec_retry_count);
        self.sum_result_rows += info.result_rows;
        self.sum_affected_rows += info.affected_rows;
        if let Some(lock) = &info.exec_detail.lock_keys_detail {
            self.sum_lock_keys += lock.lock_keys;
        }
        self.max_mem = self.max_mem.max(info.mem_max);
        self.first_seen = self.first_seen.min(info.start_time);
        self.last_seen = self.last_seen.max(info.start_time);
    }

    pub fn avg_latency(&self) -> Duration {
        if self.exec_count == 0 {
            return Duration::ZERO;
        }
        let avg = self.sum_latency.as_nanos() / u128::from(self.exec_count);
        Duration::from_nanos(u64::try_from(avg).unwrap_or(u64::MAX))
    }
}

/// Concurrent map of summaries. Once `max_entries` keys exist, statements
/// with new keys are dropped and counted in `evicted`.
#[derive(Debug)]
pub struct StmtSummaryByDigest {
    enabled: bool,
    enabled_internal: bool,
    max_entries: usize,
    entries: DashMap<SummaryKey, StmtSummaryEntry>,
    evicted: AtomicU64,
}

impl StmtSummaryByDigest {
    pub fn new(enabled: bool, enabled_internal: bool, max_entries: usize) -> Self {
        Self {
            enabled,
            enabled_internal,
            max_entries,
            entries: DashMap::new(),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &common::Config) -> Self {
        Self::new(
            config.stmt_summary_enabled,
            config.stmt_summary_internal,
            config.stmt_summary_max_entries,
        )
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn enabled_internal(&self) -> bool {
        self.enabled_internal
    }

    pub fn add_statement(&self, info: &StmtExecInfo) {
        let key = SummaryKey {
            schema_name: info.schema_name.clone(),
            digest: info.digest.clone(),
            plan_digest: info.plan_digest.clone(),
            prev_digest: info.prev_sql_digest.clone(),
        };
        if let Some(mut entry) = self.entries.get_mut(&key) {
            entry.add(info);
            return;
        }
        if self.entries.len() >= self.max_entries {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.entries
            .entry(key)
            .or_insert_with(|| StmtSummaryEntry::new(info))
            .add(info);
    }

    /// Entry for `digest` in `schema`, merged across plan and prev digests.
    pub fn get(&self, schema: &str, digest: &str) -> Option<StmtSummaryEntry> {
        let mut found: Option<StmtSummaryEntry> = None;
        for entry in self.entries.iter() {
            if entry.key().schema_name != schema || entry.key().digest != digest {
                continue;
            }
            let value = entry.value();
            match &mut found {
                None => found = Some(value.clone()),
                Some(acc) => {
                    acc.exec_count += value.exec_count;
                    acc.sum_errors += value.sum_errors;
                    acc.sum_latency += value.sum_latency;
                    acc.max_latency = acc.max_latency.max(value.max_latency);
                    acc.min_latency = acc.min_latency.min(value.min_latency);
                    acc.sum_retries += value.sum_retries;
                    acc.max_retries = acc.max_retries.max(value.max_retries);
                    acc.sum_result_rows += value.sum_result_rows;
                }
            }
        }
        found
    }

    pub fn entries(&self) -> Vec<StmtSummaryEntry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sql_digest;

    fn info(sql: &str, latency_ms: u64, retries: u32) -> StmtExecInfo {
        let (normalized, digest) = sql_digest(sql);
        StmtExecInfo {
            schema_name: "test".into(),
            original_sql: sql.into(),
            normalized_sql: normalized,
            digest: digest.to_string(),
            prev_sql: String::new(),
            prev_sql_digest: String::new(),
            plan: String::new(),
            plan_digest: String::new(),
            user: "root".into(),
            total_latency: Duration::from_millis(latency_ms),
            parse_latency: Duration::ZERO,
            compile_latency: Duration::ZERO,
            exec_detail: ExecDetails::default(),
            mem_max: 0,
            disk_max: 0,
            start_time: SystemTime::now(),
            is_internal: false,
            succeed: true,
            prepared: false,
            exec_retry_count: retries,
            exec_retry_time: Duration::ZERO,
            result_rows: 1,
            affected_rows: 0,
        }
    }

    #[test]
    fn same_digest_aggregates() {
        let summary = StmtSummaryByDigest::new(true, false, 10);
        let a = info("select * from t where id = 1", 10, 0);
        let b = info("select * from t where id = 2", 30, 2);
        summary.add_statement(&a);
        summary.add_statement(&b);

        assert_eq!(summary.len(), 1);
        let entry = summary.get("test", &a.digest).unwrap();
        assert_eq!(entry.exec_count, 2);
        assert_eq!(entry.min_latency, Duration::from_millis(10));
        assert_eq!(entry.max_latency, Duration::from_millis(30));
        assert_eq!(entry.avg_latency(), Duration::from_millis(20));
        assert_eq!(entry.sum_retries, 2);
        assert_eq!(entry.sample_sql, "select * from t where id = 1");
    }

    #[test]
    fn average_survives_counts_past_u32() {
        let summary = StmtSummaryByDigest::new(true, false, 10);
        let a = info("select * from t where id = 1", 10, 0);
        summary.add_statement(&a);
        let mut entry = summary.get("test", &a.digest).unwrap();
        entry.exec_count = 1 << 32;
        entry.sum_latency = Duration::from_secs(3 << 32);
        assert_eq!(entry.avg_latency(), Duration::from_secs(3));
    }

    #[test]
    fn full_map_drops_new_keys() {
        let summary = StmtSummaryByDigest::new(true, false, 1);
        summary.add_statement(&info("select 1", 1, 0));
        summary.add_statement(&info("update t set v = 1", 1, 0));
        summary.add_statement(&info("select 2", 1, 0));

        assert_eq!(summary.len(), 1);
        assert_eq!(summary.evicted(), 1);
        assert_eq!(summary.entries()[0].exec_count, 2);
    }

    #[test]
    fn failures_are_counted() {
        let summary = StmtSummaryByDigest::new(true, false, 10);
        let mut failed = info("delete from t", 5, 0);
        failed.succeed = false;
        summary.add_statement(&failed);
        assert_eq!(summary.get("test", &failed.digest).unwrap().sum_errors, 1);
    }
}
