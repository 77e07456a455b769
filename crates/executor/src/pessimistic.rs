//! Pessimistic-lock retry: `SELECT ... FOR UPDATE` buffering, DML key
//! locking, and the shared recovery step that rebuilds the executor after a
//! lock conflict.

use crate::{
    close_quietly,
    context::ExecContext,
    new_first_chunk,
    session::StmtContext,
    stmt::{ExecStmt, Outcome},
    txn::{filter_lock_table_keys, filter_non_lockable_keys, LockCtx, RetryDecision, StmtErrorPoint},
    Executor,
};
use common::{DbError, DbResult, ErrorKind, ReadOnlyReason, Row};
use std::time::Instant;
use telemetry::{Metric, Phase};

/// How a statement running in a pessimistic transaction takes its row locks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockPath {
    /// Rows are read under locks taken by the executor and buffered; a lock
    /// conflict re-runs the whole read.
    SelectForUpdate,
    /// The statement is driven to completion, then the keys it touched are
    /// locked through the transaction.
    PessimisticDml,
}

impl LockPath {
    /// `SelectForUpdate` only for a locking tree outside INSERT, UPDATE and
    /// DELETE. A DML statement whose sub-select locks rows still takes the
    /// DML path: its own writes decide which keys get locked.
    pub fn classify(has_lock: bool, stmt_ctx: &StmtContext) -> Self {
        let in_dml = stmt_ctx.in_insert_stmt || stmt_ctx.in_update_stmt || stmt_ctx.in_delete_stmt;
        if has_lock && !in_dml {
            LockPath::SelectForUpdate
        } else {
            LockPath::PessimisticDml
        }
    }
}

fn translate_deadlock(err: DbError) -> DbError {
    if err.kind() == ErrorKind::Deadlock {
        DbError::Deadlock
    } else {
        err
    }
}

impl ExecStmt<'_> {
    /// Run a locking read until one attempt completes without a lock
    /// conflict, returning that attempt's rows.
    pub(crate) fn handle_pessimistic_select_for_update(
        &mut self,
        ctx: &ExecContext,
        mut e: Box<dyn Executor>,
    ) -> DbResult<Outcome> {
        if self.sctx.vars.snapshot_ts != 0 {
            close_quietly(e.as_mut());
            return Err(DbError::ReadOnlyViolation(ReadOnlyReason::SnapshotTs));
        }
        loop {
            match self.run_pessimistic_select_for_update(ctx, e.as_mut()) {
                Ok(rows) => {
                    return Ok(Outcome::Buffered {
                        schema: e.schema().clone(),
                        chunk_sizes: e.chunk_sizes(),
                        rows,
                    });
                }
                Err(err) => e = self.handle_pessimistic_lock_error(ctx, err)?,
            }
        }
    }

    /// Drain `e` into memory; `e` is closed whatever happens.
    fn run_pessimistic_select_for_update(
        &mut self,
        ctx: &ExecContext,
        e: &mut dyn Executor,
    ) -> DbResult<Vec<Row>> {
        let tracker = self.sctx.vars.stmt_ctx.mem_tracker.clone();
        let max_chunk_size = self.services.config.max_chunk_size;
        let mut rows = Vec::new();
        let mut consumed = 0i64;
        let mut batch = new_first_chunk(e);
        let result = loop {
            if let Err(err) = self.next(ctx, e, &mut batch) {
                break Err(err);
            }
            if batch.is_empty() {
                break Ok(());
            }
            let bytes = batch.mem_usage() as i64;
            consumed += bytes;
            if let Err(err) = tracker.consume(bytes) {
                break Err(err);
            }
            rows.extend(batch.rows());
            batch = batch.renew(max_chunk_size);
        };
        close_quietly(e);
        match result {
            Ok(()) => Ok(rows),
            Err(err) => {
                // Release what the failed attempt held; the retry starts over.
                let _ = tracker.consume(-consumed);
                Err(err)
            }
        }
    }

    /// Drive a statement without client-visible rows, then lock the keys it
    /// touched. Lock conflicts from either step rebuild the executor and run
    /// it again.
    ///
    /// Returns the (closed or still streamable) executor of the final attempt.
    pub(crate) fn handle_pessimistic_dml(
        &mut self,
        ctx: &ExecContext,
        mut e: Box<dyn Executor>,
    ) -> DbResult<Box<dyn Executor>> {
        let txn = self.sctx.txn();
        loop {
            let lock_start = Instant::now();
            let wrapped = e.caps().no_delay_target;
            let driven = self.drive_no_delay(ctx, e.as_mut());

            // The drive itself may activate a lazily started transaction.
            let read_only = matches!(driven, Err(DbError::ReadOnlyViolation(_)));
            let Some(txn) = txn.as_ref().filter(|txn| txn.valid() && !read_only) else {
                if let Err(err) = driven {
                    if wrapped {
                        close_quietly(e.as_mut());
                    }
                    return Err(err);
                }
                return Ok(e);
            };
            if let Err(err) = driven {
                e = self.retry_after_lock_error(ctx, e, wrapped, err, lock_start)?;
                continue;
            }

            let keys = match txn.keys_need_to_lock() {
                Ok(keys) => keys,
                Err(err) => {
                    if wrapped {
                        close_quietly(e.as_mut());
                    }
                    return Err(err);
                }
            };
            let vars = &self.sctx.vars;
            let keys = vars.txn_ctx.collect_unlocked_keys(keys);
            let keys = filter_non_lockable_keys(vars, keys);
            let keys = filter_lock_table_keys(&vars.stmt_ctx, keys);
            if keys.is_empty() {
                return Ok(e);
            }

            let for_update_ts = match self.sctx.txn_manager().stmt_for_update_ts() {
                Ok(ts) => ts,
                Err(err) => {
                    if wrapped {
                        close_quietly(e.as_mut());
                    }
                    return Err(err);
                }
            };
            let wait = vars
                .lock_wait_timeout
                .unwrap_or(self.services.config.lock_wait_timeout);
            let mut lock_ctx = LockCtx::new(for_update_ts, wait, keys.len());

            let start = Instant::now();
            let locked = txn.lock_keys(ctx, &mut lock_ctx, &keys);
            self.phases.add(Phase::Lock, start.elapsed());

            let stmt_ctx = &mut self.sctx.vars.stmt_ctx;
            stmt_ctx.lock_keys_count += keys.len();
            if let Some(details) = &lock_ctx.details {
                stmt_ctx.merge_lock_keys_details(details);
            }
            match locked {
                Ok(()) => {
                    self.sctx.vars.txn_ctx.record_locked(&keys);
                    return Ok(e);
                }
                Err(err) => e = self.retry_after_lock_error(ctx, e, wrapped, err, lock_start)?,
            }
        }
    }

    /// Run the statement's no-delay part: the inner target of a wrapper such
    /// as `EXPLAIN ANALYZE`, or `e` itself.
    fn drive_no_delay(&mut self, ctx: &ExecContext, e: &mut dyn Executor) -> DbResult<()> {
        match e.no_delay_target() {
            Some(target) => self.handle_no_delay_executor(ctx, target),
            None => self.handle_no_delay_executor(ctx, e),
        }
    }

    fn retry_after_lock_error(
        &mut self,
        ctx: &ExecContext,
        mut old: Box<dyn Executor>,
        wrapped: bool,
        err: DbError,
        lock_start: Instant,
    ) -> DbResult<Box<dyn Executor>> {
        if wrapped {
            close_quietly(old.as_mut());
        }
        drop(old);
        self.handle_pessimistic_lock_error(ctx, err).inspect_err(|err| {
            if matches!(err, DbError::Deadlock) {
                self.services.observers.metrics.observe(
                    Metric::StatementDeadlockDetectDuration,
                    &[],
                    lock_start.elapsed().as_secs_f64(),
                );
            }
        })
    }

    /// Decide whether a lock error is retried and, if so, prepare the next
    /// attempt: a rebuilt, opened executor with the statement's buffered
    /// writes rolled back.
    ///
    /// The transaction manager judges every error first. Deadlocks,
    /// cancellation and resource exhaustion are then fatal whatever its
    /// verdict, and errors that are not lock conflicts are returned
    /// unchanged.
    pub(crate) fn handle_pessimistic_lock_error(
        &mut self,
        ctx: &ExecContext,
        lock_err: DbError,
    ) -> DbResult<Box<dyn Executor>> {
        let manager = self.sctx.txn_manager();
        let verdict =
            manager.on_stmt_error_for_next_action(StmtErrorPoint::AfterPessimisticLock, &lock_err);
        if lock_err.is_terminal() || !lock_err.is_lock_conflict() {
            return Err(translate_deadlock(lock_err));
        }
        if verdict.map_err(translate_deadlock)? != RetryDecision::RetryReady {
            return Err(translate_deadlock(lock_err));
        }
        self.prepare_retry(ctx, lock_err).map_err(translate_deadlock)
    }

    fn prepare_retry(&mut self, ctx: &ExecContext, lock_err: DbError) -> DbResult<Box<dyn Executor>> {
        let manager = self.sctx.txn_manager();

        let max_retries = self.services.config.max_retry_count;
        if self.retry_count >= max_retries {
            return Err(DbError::RetryBudgetExceeded { max_retries });
        }
        self.retry_count += 1;
        self.retry_start = Some(Instant::now());

        manager.on_stmt_retry(ctx)?;
        let for_update_ts = manager.stmt_for_update_ts()?;
        tracing::debug!(
            conn = self.sctx.vars.connection_id,
            retry = self.retry_count,
            for_update_ts,
            error = %lock_err,
            "pessimistic statement retry"
        );

        self.phases.fold_for_retry();
        if manager.info_schema().version != self.info_schema.version {
            self.rebuild_plan()?;
        }
        let mut e = self.build_executor()?;

        self.sctx.stmt_rollback();
        self.sctx.vars.stmt_ctx.reset_for_retry();
        self.sctx.vars.retry_info.reset_offset();

        self.open_executor(ctx, e.as_mut())?;
        Ok(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{StmtKind, StmtNode};
    use common::MemoryTracker;

    fn stmt_ctx(kind: StmtKind) -> StmtContext {
        let mem = MemoryTracker::new("mem");
        let disk = MemoryTracker::new("disk");
        StmtContext::for_stmt(&StmtNode::new(kind, "stmt"), &mem, &disk)
    }

    #[test]
    fn locking_select_takes_select_for_update_path() {
        assert_eq!(
            LockPath::classify(true, &stmt_ctx(StmtKind::Select)),
            LockPath::SelectForUpdate
        );
    }

    #[test]
    fn dml_with_locking_subselect_takes_dml_path() {
        for kind in [
            StmtKind::Insert,
            StmtKind::Replace,
            StmtKind::Update,
            StmtKind::Delete,
        ] {
            assert_eq!(
                LockPath::classify(true, &stmt_ctx(kind)),
                LockPath::PessimisticDml,
                "{kind}"
            );
        }
    }

    #[test]
    fn trees_without_lock_take_dml_path() {
        assert_eq!(
            LockPath::classify(false, &stmt_ctx(StmtKind::Select)),
            LockPath::PessimisticDml
        );
    }

    #[test]
    fn only_deadlock_kinds_are_translated() {
        let raw = DbError::KvDeadlock {
            lock_ts: 1,
            lock_key: "k".into(),
            deadlock_key_hash: 7,
        };
        assert!(matches!(translate_deadlock(raw), DbError::Deadlock));
        assert!(matches!(
            translate_deadlock(DbError::LockWaitTimeout),
            DbError::LockWaitTimeout
        ));
    }
}
