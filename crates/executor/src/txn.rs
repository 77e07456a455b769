//! Contracts of the transaction manager and the pessimistic lock client,
//! plus the key filtering applied before every lock request.

use crate::{
    context::ExecContext,
    plan::InfoSchema,
    session::{SessionVars, StmtContext},
};
use common::{CommitDetails, DbError, DbResult, LockKeysDetails, TableId};
use hashbrown::HashSet;
use std::{
    fmt,
    time::{Duration, Instant},
};

/// Row key: owning table plus the encoded handle.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub table_id: TableId,
    pub handle: Vec<u8>,
}

impl Key {
    pub fn new(table_id: TableId, handle: impl Into<Vec<u8>>) -> Self {
        Self {
            table_id,
            handle: handle.into(),
        }
    }

    pub fn from_int(table_id: TableId, handle: i64) -> Self {
        Self::new(table_id, handle.to_be_bytes())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}_r", self.table_id)?;
        for byte in &self.handle {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Parameters of one lock-acquisition call. The lock client fills `details`.
#[derive(Clone, Debug)]
pub struct LockCtx {
    pub for_update_ts: u64,
    pub lock_wait_timeout: Duration,
    pub keys_count: usize,
    pub wait_start: Instant,
    pub details: Option<LockKeysDetails>,
}

impl LockCtx {
    pub fn new(for_update_ts: u64, lock_wait_timeout: Duration, keys_count: usize) -> Self {
        Self {
            for_update_ts,
            lock_wait_timeout,
            keys_count,
            wait_start: Instant::now(),
            details: None,
        }
    }
}

/// Where in the statement lifecycle an error was observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StmtErrorPoint {
    AfterQuery,
    AfterPessimisticLock,
}

/// The manager's verdict after a statement error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetryReady,
    Fatal,
}

/// Issues timestamps and decides what happens after a statement error.
pub trait TxnManager: Send + Sync {
    fn stmt_read_ts(&self) -> DbResult<u64>;

    fn stmt_for_update_ts(&self) -> DbResult<u64>;

    fn on_stmt_error_for_next_action(
        &self,
        point: StmtErrorPoint,
        err: &DbError,
    ) -> DbResult<RetryDecision>;

    /// A retry is about to begin; refresh timestamps and internal views.
    fn on_stmt_retry(&self, ctx: &ExecContext) -> DbResult<()>;

    /// Schema the transaction currently reads.
    fn info_schema(&self) -> InfoSchema;
}

/// A pessimistic transaction as seen by the statement executor.
pub trait Transaction: Send + Sync {
    fn start_ts(&self) -> u64;

    fn valid(&self) -> bool;

    /// Keys touched by the statement that still need row locks.
    fn keys_need_to_lock(&self) -> DbResult<Vec<Key>>;

    /// Acquire locks, waiting up to `lock_ctx.lock_wait_timeout`. Must return
    /// `DbError::Cancelled` promptly once `ctx` is cancelled.
    fn lock_keys(&self, ctx: &ExecContext, lock_ctx: &mut LockCtx, keys: &[Key]) -> DbResult<()>;

    /// Discard the statement's buffered mutations.
    fn stmt_rollback(&self);

    fn commit_details(&self) -> Option<CommitDetails> {
        None
    }
}

/// Transaction-scoped state kept by the session.
#[derive(Clone, Debug, Default)]
pub struct TxnContext {
    pub start_ts: u64,
    pub is_pessimistic: bool,
    pub is_explicit: bool,
    locked_keys: HashSet<Key>,
}

impl TxnContext {
    pub fn new(start_ts: u64, is_pessimistic: bool) -> Self {
        Self {
            start_ts,
            is_pessimistic,
            ..Self::default()
        }
    }

    /// Deduplicate `keys` and drop the ones this transaction already holds.
    pub fn collect_unlocked_keys(&self, keys: Vec<Key>) -> Vec<Key> {
        let mut seen = HashSet::with_capacity(keys.len());
        keys.into_iter()
            .filter(|key| !self.locked_keys.contains(key) && seen.insert(key.clone()))
            .collect()
    }

    pub fn record_locked(&mut self, keys: &[Key]) {
        self.locked_keys.extend(keys.iter().cloned());
    }

    pub fn is_locked(&self, key: &Key) -> bool {
        self.locked_keys.contains(key)
    }

    pub fn locked_count(&self) -> usize {
        self.locked_keys.len()
    }
}

/// Temporary and system tables are never locked.
pub fn filter_non_lockable_keys(vars: &SessionVars, keys: Vec<Key>) -> Vec<Key> {
    if vars.non_lockable_tables.is_empty() {
        return keys;
    }
    keys.into_iter()
        .filter(|key| !vars.non_lockable_tables.contains(&key.table_id))
        .collect()
}

/// Under `LOCK TABLES`, only keys of the listed tables take row locks.
pub fn filter_lock_table_keys(stmt_ctx: &StmtContext, keys: Vec<Key>) -> Vec<Key> {
    if stmt_ctx.lock_table_ids.is_empty() {
        return keys;
    }
    keys.into_iter()
        .filter(|key| stmt_ctx.lock_table_ids.contains(&key.table_id))
        .collect()
}
