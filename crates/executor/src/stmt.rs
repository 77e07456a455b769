//! `ExecStmt`: one statement from compile to close.

use crate::{
    ast::StmtNode,
    close_quietly,
    context::ExecContext,
    new_first_chunk,
    panic::recover,
    pessimistic::LockPath,
    plan::{FieldName, InfoSchema, PlanKind, PlanRef},
    record_set::{BufferedRecordSet, ExecutorRecordSet, RecordSet},
    services::ExecServices,
    session::{Priority, ProcessInfo, Session},
    Executor,
};
use common::{
    ChunkSizes, DbError, DbResult, ReadOnlyReason, Row, RowBatch, Schema, StmtExecDetails,
};
use parking_lot::Mutex;
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::{Instant, SystemTime},
};
use telemetry::{Metric, Phase, PhaseDurations};

/// How `exec` left the statement.
pub(crate) enum Outcome {
    /// Ran to completion; nothing goes back to the client.
    Handled,
    Stream {
        executor: Box<dyn Executor>,
        txn_start_ts: u64,
    },
    /// Rows of a `SELECT ... FOR UPDATE` collected by the attempt that
    /// acquired every lock.
    Buffered {
        schema: Schema,
        chunk_sizes: ChunkSizes,
        rows: Vec<Row>,
    },
}

/// A compiled statement and the state of its execution.
///
/// Exactly one `ExecStmt` exists per statement. Pessimistic retries mutate it
/// in place, so the retry counter and phase timings accumulate across
/// attempts. Result sets borrow it mutably and finalize it on close.
pub struct ExecStmt<'s> {
    pub(crate) sctx: &'s mut Session,
    pub(crate) services: Arc<ExecServices>,
    pub(crate) info_schema: InfoSchema,
    pub(crate) plan: PlanRef,
    pub(crate) text: String,
    pub(crate) stmt_node: StmtNode,
    pub(crate) output_names: Vec<FieldName>,
    pub(crate) lower_priority: bool,
    pub(crate) is_prepared: bool,
    pub(crate) lock_path: LockPath,
    pub(crate) retry_count: u32,
    pub(crate) retry_start: Option<Instant>,
    pub(crate) phases: PhaseDurations,
    pub(crate) finalized: bool,
    pub(crate) stmt_details: Option<Arc<Mutex<StmtExecDetails>>>,
}

impl<'s> ExecStmt<'s> {
    /// Start the statement on `sctx` and plan it against the schema the
    /// transaction currently reads.
    pub fn compile(
        sctx: &'s mut Session,
        services: Arc<ExecServices>,
        node: StmtNode,
    ) -> DbResult<Self> {
        let start = Instant::now();
        sctx.begin_statement(&node);
        let info_schema = sctx.txn_manager().info_schema();
        let (plan, output_names) = services.planner.optimize(&*sctx, &info_schema, &node)?;
        sctx.vars.duration_compile = start.elapsed();
        sctx.vars.stmt_ctx.set_plan(Arc::clone(&plan));
        Ok(Self::new(sctx, services, info_schema, plan, node, output_names))
    }

    /// Wrap an already planned statement.
    pub fn new(
        sctx: &'s mut Session,
        services: Arc<ExecServices>,
        info_schema: InfoSchema,
        plan: PlanRef,
        stmt_node: StmtNode,
        output_names: Vec<FieldName>,
    ) -> Self {
        Self {
            sctx,
            services,
            info_schema,
            plan,
            text: stmt_node.text.clone(),
            stmt_node,
            output_names,
            lower_priority: false,
            is_prepared: false,
            lock_path: LockPath::PessimisticDml,
            retry_count: 0,
            retry_start: None,
            phases: PhaseDurations::default(),
            finalized: false,
            stmt_details: None,
        }
    }

    /// Run at low priority unless the session already chose one.
    pub fn with_lower_priority(mut self, lower: bool) -> Self {
        self.lower_priority = lower;
        self
    }

    pub fn plan(&self) -> &PlanRef {
        &self.plan
    }

    pub fn output_names(&self) -> &[FieldName] {
        &self.output_names
    }

    pub fn info_schema(&self) -> InfoSchema {
        self.info_schema
    }

    pub fn original_text(&self) -> &str {
        &self.text
    }

    pub fn session(&self) -> &Session {
        &*self.sctx
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn phases(&self) -> &PhaseDurations {
        &self.phases
    }

    pub fn lock_path(&self) -> LockPath {
        self.lock_path
    }

    pub fn is_prepared(&self) -> bool {
        self.is_prepared
    }

    pub fn is_read_only(&self) -> bool {
        self.stmt_node.is_read_only()
    }

    /// Plan the statement again against the transaction's current schema.
    /// Returns the schema version the new plan was built on.
    pub fn rebuild_plan(&mut self) -> DbResult<i64> {
        self.info_schema = self.sctx.txn_manager().info_schema();
        let (plan, names) =
            self.services
                .planner
                .optimize(&*self.sctx, &self.info_schema, &self.stmt_node)?;
        self.output_names = names;
        self.plan = Arc::clone(&plan);
        self.sctx.vars.stmt_ctx.set_plan(plan);
        Ok(self.info_schema.version)
    }

    /// Text for logs: the digest text when redaction is on, the secure form
    /// of sensitive statements, otherwise the SQL with its prepared arguments.
    pub fn text_to_log(&mut self) -> String {
        let vars = &mut self.sctx.vars;
        if vars.enable_redact_log {
            return vars.stmt_ctx.sql_digest().0;
        }
        if self.stmt_node.is_sensitive() {
            return self.stmt_node.secure_text().to_string();
        }
        format!(
            "{}{}",
            vars.stmt_ctx.original_sql,
            vars.prepared_params_text()
        )
    }

    /// Build, open and run the statement.
    ///
    /// Returns `None` when the statement ran to completion here (DML, `DO`,
    /// `SET`); the statement is finalized before returning. Otherwise the
    /// returned record set finalizes it when closed.
    pub fn exec(&mut self, ctx: &ExecContext) -> DbResult<Option<Box<dyn RecordSet + '_>>> {
        self.stmt_details = Some(ctx.shared_details());
        let result = catch_unwind(AssertUnwindSafe(|| self.exec_inner(ctx)));
        if result.is_err() {
            // Out-of-memory panics unwind past `finalize`.
            self.detach_trackers();
        }
        let result = recover(result, || self.text_to_log());
        self.observe_exit();

        match result {
            Ok(Outcome::Handled) => {
                let txn_ts = self.sctx.vars.txn_ctx.start_ts;
                self.finalize(txn_ts, None, false);
                Ok(None)
            }
            Ok(Outcome::Stream {
                executor,
                txn_start_ts,
            }) => Ok(Some(Box::new(ExecutorRecordSet::new(
                self,
                executor,
                txn_start_ts,
            )))),
            Ok(Outcome::Buffered {
                schema,
                chunk_sizes,
                rows,
            }) => Ok(Some(Box::new(BufferedRecordSet::new(
                self,
                schema,
                chunk_sizes,
                rows,
            )))),
            Err(err) => {
                self.services
                    .observers
                    .metrics
                    .inc(Metric::StatementErrors, &[err.label()]);
                let txn_ts = self.sctx.vars.txn_ctx.start_ts;
                self.finalize(txn_ts, Some(&err), false);
                Err(err)
            }
        }
    }

    /// Fast path for a single-row lookup: read at the statement read ts with
    /// high priority, skip lock handling and no-delay classification.
    pub fn point_get(&mut self, ctx: &ExecContext) -> DbResult<Box<dyn RecordSet + '_>> {
        self.stmt_details = Some(ctx.shared_details());
        match self.open_point_get(ctx) {
            Ok((executor, read_ts)) => Ok(Box::new(ExecutorRecordSet::new(
                self, executor, read_ts,
            ))),
            Err(err) => {
                self.finalize(0, Some(&err), false);
                Err(err)
            }
        }
    }

    fn open_point_get(&mut self, ctx: &ExecContext) -> DbResult<(Box<dyn Executor>, u64)> {
        if self.plan.kind() != PlanKind::PointGet {
            return Err(DbError::Build(format!(
                "point get on a {:?} plan",
                self.plan.kind()
            )));
        }
        let read_ts = self.sctx.txn_manager().stmt_read_ts()?;
        self.sctx.vars.stmt_ctx.priority = Priority::High;
        let outcome = self
            .services
            .builder
            .build(&*self.sctx, &self.info_schema, &self.plan)?;
        let mut executor = outcome.executor;
        self.open_executor(ctx, executor.as_mut())?;
        Ok((executor, read_ts))
    }

    fn exec_inner(&mut self, ctx: &ExecContext) -> DbResult<Outcome> {
        ctx.check()?;
        if let Some(quota) = self.sctx.vars.stmt_ctx.mem_quota_query {
            self.sctx.vars.stmt_ctx.mem_tracker.set_bytes_limit(quota);
        }

        let mut e = self.build_executor()?;
        self.open_executor(ctx, e.as_mut())?;
        self.set_process_info();

        let is_pessimistic = self.sctx.vars.txn_ctx.is_pessimistic;
        if is_pessimistic && self.lock_path == LockPath::SelectForUpdate {
            return self.handle_pessimistic_select_for_update(ctx, e);
        }
        match self.handle_no_delay(ctx, e, is_pessimistic)? {
            None => Ok(Outcome::Handled),
            Some(executor) => Ok(Outcome::Stream {
                executor,
                txn_start_ts: self.sctx.txn_start_ts(),
            }),
        }
    }

    /// Build the executor tree for the current plan, resolving an
    /// `EXECUTE` to the prepared statement behind it.
    pub(crate) fn build_executor(&mut self) -> DbResult<Box<dyn Executor>> {
        let start = Instant::now();
        let kind = self.plan.kind();
        let vars = &mut self.sctx.vars;
        if kind != PlanKind::Execute
            && vars.stmt_ctx.priority == Priority::NoPriority
            && self.lower_priority
        {
            vars.stmt_ctx.priority = Priority::Low;
        }
        if kind == PlanKind::Analyze && vars.in_restricted_sql {
            vars.stmt_ctx.priority = Priority::Low;
        }

        let built = self
            .services
            .builder
            .build(&*self.sctx, &self.info_schema, &self.plan);
        self.phases.add(Phase::Build, start.elapsed());
        let outcome = built?;

        if let Some(target) = outcome.prepared {
            let stmt_ctx = &mut self.sctx.vars.stmt_ctx;
            stmt_ctx.original_sql = target.query_text;
            stmt_ctx.set_plan(Arc::clone(&target.plan));
            if target.lower_priority {
                stmt_ctx.priority = Priority::Low;
            }
            self.output_names = target.output_names;
            self.is_prepared = true;
            self.plan = target.plan;
        }
        self.lock_path = LockPath::classify(outcome.has_lock, &self.sctx.vars.stmt_ctx);
        Ok(outcome.executor)
    }

    /// Open `e`; a tree that failed to open is closed before returning.
    pub(crate) fn open_executor(
        &mut self,
        ctx: &ExecContext,
        e: &mut dyn Executor,
    ) -> DbResult<()> {
        let start = Instant::now();
        let result = e.open(ctx);
        self.phases.add(Phase::Open, start.elapsed());
        if result.is_err() {
            close_quietly(e);
        }
        result
    }

    pub(crate) fn next(
        &mut self,
        ctx: &ExecContext,
        e: &mut dyn Executor,
        batch: &mut RowBatch,
    ) -> DbResult<()> {
        let start = Instant::now();
        let result = crate::next(ctx, e, batch);
        self.phases.add(Phase::Next, start.elapsed());
        result
    }

    /// Run statements without client-visible rows to completion.
    ///
    /// Returns the executor to stream when there is still output for the
    /// client (`EXPLAIN ANALYZE` of a DML), `None` when the statement is done.
    fn handle_no_delay(
        &mut self,
        ctx: &ExecContext,
        mut e: Box<dyn Executor>,
        is_pessimistic: bool,
    ) -> DbResult<Option<Box<dyn Executor>>> {
        let caps = e.caps();
        if caps.no_delay_target {
            if is_pessimistic {
                return self.handle_pessimistic_dml(ctx, e).map(Some);
            }
            let driven = match e.no_delay_target() {
                Some(target) => self.handle_no_delay_executor(ctx, target),
                None => Ok(()),
            };
            if let Err(err) = driven {
                close_quietly(e.as_mut());
                return Err(err);
            }
            return Ok(Some(e));
        }

        if e.schema().is_empty() {
            if is_pessimistic {
                self.handle_pessimistic_dml(ctx, e)?;
            } else {
                self.handle_no_delay_executor(ctx, e.as_mut())?;
            }
            return Ok(None);
        }
        if caps.calculate_no_delay {
            self.handle_no_delay_executor(ctx, e.as_mut())?;
            return Ok(None);
        }
        Ok(Some(e))
    }

    /// Drive `e` with a single `next`, then close it and report to the
    /// auditors whatever the outcome.
    pub(crate) fn handle_no_delay_executor(
        &mut self,
        ctx: &ExecContext,
        e: &mut dyn Executor,
    ) -> DbResult<()> {
        let result = self.drive_once(ctx, e);
        close_quietly(e);
        self.log_audit(result.as_ref().err().map(ToString::to_string));
        result
    }

    fn drive_once(&mut self, ctx: &ExecContext, e: &mut dyn Executor) -> DbResult<()> {
        if e.caps().is_write {
            let vars = &self.sctx.vars;
            if vars.snapshot_ts != 0 {
                return Err(DbError::ReadOnlyViolation(ReadOnlyReason::SnapshotTs));
            }
            if vars.low_resolution_tso {
                return Err(DbError::ReadOnlyViolation(ReadOnlyReason::LowResolutionTs));
            }
        }
        let mut batch = new_first_chunk(e);
        self.next(ctx, e, &mut batch)
    }

    fn set_process_info(&mut self) {
        let sql = if self.plan.kind() == PlanKind::Simple && self.stmt_node.is_sensitive() {
            self.stmt_node.secure_text().to_string()
        } else {
            self.text.clone()
        };
        let vars = &mut self.sctx.vars;
        if vars.stmt_ctx.stmt_type.is_empty() {
            vars.stmt_ctx.stmt_type = self.stmt_node.label().to_string();
        }
        let info = ProcessInfo {
            sql,
            start: SystemTime::now(),
            command: vars.command,
            max_execution_time: vars.stmt_ctx.max_execution_time.or(vars.max_execution_time),
            stmt_type: vars.stmt_ctx.stmt_type.clone(),
        };
        self.sctx.set_process_info(info);
    }

    fn observe_exit(&self) {
        let metrics = &self.services.observers.metrics;
        if self.retry_count > 0 {
            metrics.observe(
                Metric::StatementPessimisticRetryCount,
                &[],
                f64::from(self.retry_count),
            );
        }
        let lock_keys = self.sctx.vars.stmt_ctx.lock_keys_count;
        if lock_keys > 0 {
            metrics.observe(Metric::StatementLockKeysCount, &[], lock_keys as f64);
        }
    }
}
