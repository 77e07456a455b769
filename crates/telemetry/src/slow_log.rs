//! Slow-query records, their text rendering, and where they go.

use common::{ExecDetails, LockKeysDetails, format_duration};
use parking_lot::Mutex;
use serde::Serialize;
use std::{collections::VecDeque, fmt::Write as _, time::Duration};

/// Everything the slow log knows about one finished statement.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SlowQueryItems {
    pub txn_ts: u64,
    pub sql: String,
    pub digest: String,
    pub time_total: Duration,
    pub time_parse: Duration,
    pub time_compile: Duration,
    pub time_build: Duration,
    pub time_open: Duration,
    pub time_next: Duration,
    pub time_lock: Duration,
    pub index_names: String,
    pub exec_detail: ExecDetails,
    pub mem_max: i64,
    pub disk_max: i64,
    pub succ: bool,
    pub plan: String,
    pub plan_digest: String,
    pub prepared: bool,
    pub has_more_results: bool,
    pub result_rows: u64,
    pub exec_retry_count: u32,
    pub exec_retry_time: Duration,
    pub is_explicit_txn: bool,
    pub is_internal: bool,
    pub prev_stmt: Option<String>,
    pub write_sql_resp_total: Duration,
    pub kv_total: Duration,
    pub pd_total: Duration,
    pub backoff_total: Duration,
    pub user: String,
    pub db: String,
    pub conn_id: u64,
}

fn secs(d: Duration) -> String {
    format!("{:.9}", d.as_secs_f64())
}

impl SlowQueryItems {
    /// Multi-line `# Key: value` rendering, ending with the statement text.
    pub fn format(&self) -> String {
        let mut buf = String::new();
        let mut field = |key: &str, value: &dyn std::fmt::Display| {
            let _ = writeln!(buf, "# {key}: {value}");
        };

        field("Txn_start_ts", &self.txn_ts);
        if !self.user.is_empty() {
            field("User", &self.user);
        }
        field("Conn_ID", &self.conn_id);
        field("Query_time", &secs(self.time_total));
        field("Parse_time", &secs(self.time_parse));
        field("Compile_time", &secs(self.time_compile));
        field("Build_time", &secs(self.time_build));
        field("Open_time", &secs(self.time_open));
        field("Next_time", &secs(self.time_next));
        field("Lock_time", &secs(self.time_lock));
        if self.exec_retry_count > 0 {
            field("Exec_retry_count", &self.exec_retry_count);
            field("Exec_retry_time", &secs(self.exec_retry_time));
        }
        if let Some(lock) = &self.exec_detail.lock_keys_detail {
            field("LockKeys_time", &secs(lock.total_time));
            field("Lock_keys", &lock.lock_keys);
        }
        if let Some(commit) = &self.exec_detail.commit_detail {
            field("Prewrite_time", &secs(commit.prewrite_time));
            field("Commit_time", &secs(commit.commit_time));
            field("Write_keys", &commit.write_keys);
            field("Write_size", &commit.write_size);
        }
        if !self.db.is_empty() {
            field("DB", &self.db);
        }
        if !self.index_names.is_empty() {
            field("Index_names", &self.index_names);
        }
        field("Is_internal", &self.is_internal);
        if !self.digest.is_empty() {
            field("Digest", &self.digest);
        }
        field("Mem_max", &self.mem_max);
        field("Disk_max", &self.disk_max);
        field("Prepared", &self.prepared);
        field("Has_more_results", &self.has_more_results);
        field("KV_total", &secs(self.kv_total));
        field("PD_total", &secs(self.pd_total));
        field("Backoff_total", &secs(self.backoff_total));
        field("Write_sql_response_total", &secs(self.write_sql_resp_total));
        field("Result_rows", &self.result_rows);
        field("Succ", &self.succ);
        field("IsExplicitTxn", &self.is_explicit_txn);
        if !self.plan.is_empty() {
            field("Plan", &self.plan);
        }
        if !self.plan_digest.is_empty() {
            field("Plan_digest", &self.plan_digest);
        }
        if let Some(prev) = &self.prev_stmt {
            field("Prev_stmt", prev);
        }

        buf.push_str(&self.sql);
        if !self.sql.ends_with(';') {
            buf.push(';');
        }
        buf
    }

    /// Compact one-line summary for structured logs.
    pub fn headline(&self) -> String {
        format!(
            "slow query: {} in {} (retries: {})",
            self.digest,
            format_duration(self.time_total),
            self.exec_retry_count
        )
    }
}

/// Record kept in the in-memory "recent slow queries" view.
#[derive(Clone, Debug, Serialize)]
pub struct SlowQueryInfo {
    pub sql: String,
    pub digest: String,
    pub duration: Duration,
    pub succ: bool,
    pub conn_id: u64,
    pub txn_ts: u64,
    pub user: String,
    pub db: String,
    pub table_ids: String,
    pub index_names: String,
    pub internal: bool,
    pub lock_keys: Option<LockKeysDetails>,
}

/// Destination for rendered slow-log entries.
pub trait SlowLogSink: Send + Sync {
    fn write(&self, items: &SlowQueryItems, rendered: &str) -> anyhow::Result<()>;
}

/// Writes the rendered entry through `tracing` on the `slow_query` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSlowLog;

impl SlowLogSink for TracingSlowLog {
    fn write(&self, items: &SlowQueryItems, rendered: &str) -> anyhow::Result<()> {
        tracing::warn!(
            target: "slow_query",
            digest = %items.digest,
            retries = items.exec_retry_count,
            "{rendered}"
        );
        Ok(())
    }
}

/// Keeps rendered entries in memory.
#[derive(Debug, Default)]
pub struct MemorySlowLog {
    entries: Mutex<Vec<(SlowQueryItems, String)>>,
}

impl MemorySlowLog {
    pub fn entries(&self) -> Vec<SlowQueryItems> {
        self.entries.lock().iter().map(|(i, _)| i.clone()).collect()
    }

    pub fn rendered(&self) -> Vec<String> {
        self.entries.lock().iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl SlowLogSink for MemorySlowLog {
    fn write(&self, items: &SlowQueryItems, rendered: &str) -> anyhow::Result<()> {
        self.entries
            .lock()
            .push((items.clone(), rendered.to_string()));
        Ok(())
    }
}

/// Bounded ring of the most recent statements over the slow threshold.
#[derive(Debug)]
pub struct SlowQueryRing {
    capacity: usize,
    entries: Mutex<VecDeque<SlowQueryInfo>>,
}

impl SlowQueryRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, info: SlowQueryInfo) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(info);
    }

    /// Newest first.
    pub fn recent(&self, n: usize) -> Vec<SlowQueryInfo> {
        self.entries.lock().iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Join index names in first-seen order with duplicates removed: `[a,b]`.
pub fn dedup_index_names(names: &[String]) -> String {
    if names.is_empty() {
        return String::new();
    }
    let mut seen = hashbrown::HashSet::new();
    let unique: Vec<&str> = names
        .iter()
        .filter(|name| seen.insert(name.as_str()))
        .map(String::as_str)
        .collect();
    format!("[{}]", unique.join(","))
}
