//! Session, session variables, and the per-statement context.

use crate::{
    ast::{StmtKind, StmtNode},
    plan::PlanRef,
    txn::{Transaction, TxnContext, TxnManager},
};
use common::{ExecDetails, LockKeysDetails, MemoryTracker, TableId};
use hashbrown::HashSet;
use std::{
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};
use telemetry::Digest;
use types::Value;

/// Scheduling priority handed to the storage layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Priority {
    #[default]
    NoPriority,
    Low,
    Normal,
    High,
}

/// Client protocol command that carried the statement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Command {
    #[default]
    Query,
    Execute,
    Fetch,
    Sleep,
}

/// What `SHOW PROCESSLIST` shows for the connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessInfo {
    pub sql: String,
    pub start: SystemTime,
    pub command: Command,
    pub max_execution_time: Option<Duration>,
    pub stmt_type: String,
}

/// Replay state for auto-generated values of a retried statement.
#[derive(Clone, Debug, Default)]
pub struct RetryInfo {
    pub auto_inc_ids: Vec<i64>,
    offset: usize,
}

impl RetryInfo {
    /// Next recorded id, replayed in order on every attempt.
    pub fn next_auto_inc_id(&mut self) -> Option<i64> {
        let id = self.auto_inc_ids.get(self.offset).copied();
        if id.is_some() {
            self.offset += 1;
        }
        id
    }

    pub fn reset_offset(&mut self) {
        self.offset = 0;
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// State owned by one statement, rebuilt by `Session::begin_statement`.
#[derive(Debug)]
pub struct StmtContext {
    pub stmt_kind: Option<StmtKind>,
    pub stmt_type: String,
    pub original_sql: String,
    pub in_insert_stmt: bool,
    pub in_update_stmt: bool,
    pub in_delete_stmt: bool,
    pub priority: Priority,
    pub plan: Option<PlanRef>,
    pub mem_tracker: Arc<MemoryTracker>,
    pub disk_tracker: Arc<MemoryTracker>,
    pub mem_quota_query: Option<i64>,
    pub max_execution_time: Option<Duration>,
    pub index_names: Vec<String>,
    pub table_ids: Vec<TableId>,
    /// Tables named by `LOCK TABLES`; restricts which keys are locked.
    pub lock_table_ids: HashSet<TableId>,
    pub lock_keys_count: usize,
    pub is_staleness: bool,
    found_rows: u64,
    affected_rows: u64,
    exec_details: ExecDetails,
    sql_digest: Option<(String, Digest)>,
    plan_digest: Option<(String, Digest)>,
}

impl Default for StmtContext {
    fn default() -> Self {
        Self {
            stmt_kind: None,
            stmt_type: String::new(),
            original_sql: String::new(),
            in_insert_stmt: false,
            in_update_stmt: false,
            in_delete_stmt: false,
            priority: Priority::NoPriority,
            plan: None,
            mem_tracker: MemoryTracker::new("statement memory"),
            disk_tracker: MemoryTracker::new("statement disk"),
            mem_quota_query: None,
            max_execution_time: None,
            index_names: Vec::new(),
            table_ids: Vec::new(),
            lock_table_ids: HashSet::new(),
            lock_keys_count: 0,
            is_staleness: false,
            found_rows: 0,
            affected_rows: 0,
            exec_details: ExecDetails::default(),
            sql_digest: None,
            plan_digest: None,
        }
    }
}

impl StmtContext {
    pub fn for_stmt(
        node: &StmtNode,
        mem_parent: &Arc<MemoryTracker>,
        disk_parent: &Arc<MemoryTracker>,
    ) -> Self {
        let kind = node.effective_kind();
        Self {
            stmt_kind: Some(node.kind),
            original_sql: node.text.clone(),
            in_insert_stmt: matches!(kind, StmtKind::Insert | StmtKind::Replace),
            in_update_stmt: kind == StmtKind::Update,
            in_delete_stmt: kind == StmtKind::Delete,
            mem_tracker: MemoryTracker::child_of("statement memory", mem_parent),
            disk_tracker: MemoryTracker::child_of("statement disk", disk_parent),
            ..Self::default()
        }
    }

    pub fn found_rows(&self) -> u64 {
        self.found_rows
    }

    pub fn add_found_rows(&mut self, rows: u64) {
        self.found_rows += rows;
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn add_affected_rows(&mut self, rows: u64) {
        self.affected_rows += rows;
    }

    pub fn exec_details(&self) -> &ExecDetails {
        &self.exec_details
    }

    pub fn exec_details_mut(&mut self) -> &mut ExecDetails {
        &mut self.exec_details
    }

    pub fn merge_lock_keys_details(&mut self, details: &LockKeysDetails) {
        self.exec_details.merge_lock_keys(details);
    }

    /// Normalized text and digest of `original_sql`, computed once.
    pub fn sql_digest(&mut self) -> (String, Digest) {
        self.sql_digest
            .get_or_insert_with(|| telemetry::sql_digest(&self.original_sql))
            .clone()
    }

    /// Normalized plan and its digest; empty when no plan is set.
    pub fn plan_digest(&mut self) -> Option<(String, Digest)> {
        if self.plan_digest.is_none() {
            let plan = self.plan.as_ref()?;
            self.plan_digest = Some(telemetry::plan_digest(&plan.explain()));
        }
        self.plan_digest.clone()
    }

    pub fn set_plan(&mut self, plan: PlanRef) {
        self.plan = Some(plan);
        self.plan_digest = None;
    }

    /// Clear what a failed attempt accumulated; the next attempt runs in
    /// the same statement.
    pub fn reset_for_retry(&mut self) {
        self.found_rows = 0;
        self.affected_rows = 0;
        self.exec_details = ExecDetails::default();
        self.table_ids.clear();
        self.index_names.clear();
    }
}

/// Variables of one connection.
#[derive(Debug)]
pub struct SessionVars {
    pub connection_id: u64,
    pub user: Option<String>,
    pub current_db: String,
    /// Internal statement issued by the server itself.
    pub in_restricted_sql: bool,
    /// Non-zero when reads are pinned to a historical timestamp.
    pub snapshot_ts: u64,
    pub low_resolution_tso: bool,
    pub enable_redact_log: bool,
    pub lock_wait_timeout: Option<Duration>,
    pub max_execution_time: Option<Duration>,
    pub command: Command,
    pub prepared_params: Vec<Value>,
    pub non_lockable_tables: HashSet<TableId>,
    pub start_time: Instant,
    pub start_system_time: SystemTime,
    pub duration_parse: Duration,
    pub duration_compile: Duration,
    pub prev_stmt: String,
    prev_stmt_digest: String,
    pub last_found_rows: u64,
    pub stmt_ctx: StmtContext,
    pub txn_ctx: TxnContext,
    pub retry_info: RetryInfo,
}

impl SessionVars {
    pub fn new(connection_id: u64) -> Self {
        Self {
            connection_id,
            user: None,
            current_db: String::new(),
            in_restricted_sql: false,
            snapshot_ts: 0,
            low_resolution_tso: false,
            enable_redact_log: false,
            lock_wait_timeout: None,
            max_execution_time: None,
            command: Command::Query,
            prepared_params: Vec::new(),
            non_lockable_tables: HashSet::new(),
            start_time: Instant::now(),
            start_system_time: SystemTime::now(),
            duration_parse: Duration::ZERO,
            duration_compile: Duration::ZERO,
            prev_stmt: String::new(),
            prev_stmt_digest: String::new(),
            last_found_rows: 0,
            stmt_ctx: StmtContext::default(),
            txn_ctx: TxnContext::default(),
            retry_info: RetryInfo::default(),
        }
    }

    pub fn prev_stmt_digest(&self) -> &str {
        &self.prev_stmt_digest
    }

    pub fn set_prev_stmt_digest(&mut self, digest: impl Into<String>) {
        self.prev_stmt_digest = digest.into();
    }

    /// `" [arguments: 1, 'a']"` for prepared executions, empty otherwise.
    pub fn prepared_params_text(&self) -> String {
        if self.prepared_params.is_empty() {
            return String::new();
        }
        let args: Vec<String> = self
            .prepared_params
            .iter()
            .map(|value| match value {
                Value::Text(s) => format!("'{s}'"),
                other => other.to_string(),
            })
            .collect();
        format!(" [arguments: {}]", args.join(", "))
    }
}

/// One client connection: its variables, its transaction, and the
/// session-wide usage trackers statement trackers attach to.
pub struct Session {
    pub vars: SessionVars,
    txn: Option<Arc<dyn Transaction>>,
    txn_manager: Arc<dyn TxnManager>,
    process_info: Option<ProcessInfo>,
    mem_global: Arc<MemoryTracker>,
    disk_global: Arc<MemoryTracker>,
}

impl Session {
    pub fn new(connection_id: u64, txn_manager: Arc<dyn TxnManager>) -> Self {
        Self {
            vars: SessionVars::new(connection_id),
            txn: None,
            txn_manager,
            process_info: None,
            mem_global: MemoryTracker::new("session memory"),
            disk_global: MemoryTracker::new("session disk"),
        }
    }

    /// Attach an active transaction.
    pub fn begin_txn(&mut self, txn: Arc<dyn Transaction>, pessimistic: bool) {
        self.vars.txn_ctx = TxnContext::new(txn.start_ts(), pessimistic);
        self.txn = Some(txn);
    }

    pub fn end_txn(&mut self) {
        self.txn = None;
        self.vars.txn_ctx = TxnContext::default();
    }

    pub fn txn(&self) -> Option<Arc<dyn Transaction>> {
        self.txn.clone()
    }

    /// Start ts of the active transaction, 0 when there is none.
    pub fn txn_start_ts(&self) -> u64 {
        self.txn
            .as_ref()
            .filter(|txn| txn.valid())
            .map_or(0, |txn| txn.start_ts())
    }

    pub fn txn_manager(&self) -> Arc<dyn TxnManager> {
        Arc::clone(&self.txn_manager)
    }

    /// Reset the statement context for `node` and restart the statement clock.
    ///
    /// The previous statement's trackers are detached first, so a statement
    /// that never finalized cannot keep its bytes charged to the session.
    pub fn begin_statement(&mut self, node: &StmtNode) {
        self.vars.stmt_ctx.mem_tracker.detach();
        self.vars.stmt_ctx.disk_tracker.detach();
        self.vars.stmt_ctx = StmtContext::for_stmt(node, &self.mem_global, &self.disk_global);
        self.vars.start_time = Instant::now();
        self.vars.start_system_time = SystemTime::now();
    }

    pub fn stmt_rollback(&self) {
        if let Some(txn) = &self.txn {
            txn.stmt_rollback();
        }
    }

    pub fn set_process_info(&mut self, info: ProcessInfo) {
        self.process_info = Some(info);
    }

    pub fn process_info(&self) -> Option<&ProcessInfo> {
        self.process_info.as_ref()
    }

    pub fn mem_tracker(&self) -> &Arc<MemoryTracker> {
        &self.mem_global
    }

    pub fn disk_tracker(&self) -> &Arc<MemoryTracker> {
        &self.disk_global
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("connection_id", &self.vars.connection_id)
            .field("txn_start_ts", &self.txn_start_ts())
            .finish()
    }
}
