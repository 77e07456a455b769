//! Execution detail records filled by the transaction layer and the client
//! layer, read back when a statement finishes.

use serde::Serialize;
use std::time::Duration;

/// Phase timings of a transaction commit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CommitDetails {
    pub prewrite_time: Duration,
    pub commit_time: Duration,
    pub get_commit_ts_time: Duration,
    pub get_latest_ts_time: Duration,
    pub local_latch_time: Duration,
    pub wait_prewrite_binlog_time: Duration,
    pub write_keys: u64,
    pub write_size: u64,
}

/// Statistics of one lock-acquisition call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LockKeysDetails {
    pub total_time: Duration,
    pub lock_keys: u64,
    pub regions: u64,
    pub retry_count: u64,
    pub backoff_time: Duration,
}

impl LockKeysDetails {
    /// Fold another call's statistics into this one.
    pub fn merge(&mut self, other: &LockKeysDetails) {
        self.total_time += other.total_time;
        self.lock_keys += other.lock_keys;
        self.regions += other.regions;
        self.retry_count += other.retry_count;
        self.backoff_time += other.backoff_time;
    }
}

/// Per-statement storage-side details.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ExecDetails {
    pub commit_detail: Option<CommitDetails>,
    pub lock_keys_detail: Option<LockKeysDetails>,
    pub process_time: Duration,
    pub wait_time: Duration,
    pub backoff_time: Duration,
    pub processed_keys: u64,
}

impl ExecDetails {
    pub fn merge_lock_keys(&mut self, details: &LockKeysDetails) {
        self.lock_keys_detail
            .get_or_insert_with(LockKeysDetails::default)
            .merge(details);
    }
}

/// Timings accumulated outside the executor (response writing, KV waits).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StmtExecDetails {
    pub write_sql_resp_duration: Duration,
    pub wait_kv_resp_duration: Duration,
    pub wait_pd_resp_duration: Duration,
    pub backoff_duration: Duration,
}
