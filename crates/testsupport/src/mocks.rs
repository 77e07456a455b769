//! Scriptable collaborators for driving `ExecStmt` end to end: an operator
//! with injectable failures, a fixed planner, a builder that hands out a
//! fresh tree per attempt, and a transaction manager and transaction whose
//! lock outcomes are scripted step by step.

use common::{
    ChunkSizes, CommitDetails, DbError, DbResult, LockKeysDetails, Row, RowBatch, Schema,
    SchemaColumn,
};
use executor::{
    session::Priority, BuildOutcome, ExecCaps, ExecContext, Executor, ExecutorBuilder, FieldName,
    InfoSchema, Key, LockCtx, Plan, PlanKind, PlanRef, Planner, PreparedTarget, RetryDecision,
    Session, StmtErrorPoint, StmtNode, Transaction, TxnManager,
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use types::SqlType;

/// Open/next/close counters shared by every executor a builder hands out.
#[derive(Clone, Debug, Default)]
pub struct Probe {
    opens: Arc<AtomicUsize>,
    nexts: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl Probe {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn nexts(&self) -> usize {
        self.nexts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Trees opened but not closed yet.
    pub fn open_trees(&self) -> usize {
        self.opens().saturating_sub(self.closes())
    }
}

/// What a scripted `next` call does once the rows run out, or instead of
/// producing rows.
enum Step {
    Fail(DbError),
    Panic(String),
}

/// Operator that emits fixed rows and follows a failure script.
///
/// Failures are attached to a `next` call index (0-based) and consumed
/// once. Rows are emitted bounded by the batch's fill target.
pub struct ScriptedExecutor {
    rows: VecDeque<Row>,
    schema: Schema,
    caps: ExecCaps,
    chunk_sizes: ChunkSizes,
    steps: Vec<(usize, Step)>,
    open_error: Option<DbError>,
    close_error: Option<DbError>,
    next_delay: Duration,
    on_next: Option<Box<dyn FnMut()>>,
    calls: usize,
    probe: Probe,
}

impl ScriptedExecutor {
    /// Integer columns named `columns`; an empty slice gives an empty schema.
    pub fn new(rows: Vec<Row>, columns: &[&str]) -> Self {
        Self {
            rows: rows.into(),
            schema: Schema::new(
                columns
                    .iter()
                    .map(|name| SchemaColumn::new(*name, SqlType::Int))
                    .collect(),
            ),
            caps: ExecCaps::default(),
            chunk_sizes: ChunkSizes::default(),
            steps: Vec::new(),
            open_error: None,
            close_error: None,
            next_delay: Duration::ZERO,
            on_next: None,
            calls: 0,
            probe: Probe::default(),
        }
    }

    /// A side-effect-only operator (DML) with an empty schema.
    pub fn dml() -> Self {
        Self::new(Vec::new(), &[]).writing()
    }

    pub fn with_probe(mut self, probe: &Probe) -> Self {
        self.probe = probe.clone();
        self
    }

    /// Fail the `call`-th `next` with `error`.
    pub fn fail_at(mut self, call: usize, error: DbError) -> Self {
        self.steps.push((call, Step::Fail(error)));
        self
    }

    /// Panic on the `call`-th `next`.
    pub fn panic_at(mut self, call: usize, message: impl Into<String>) -> Self {
        self.steps.push((call, Step::Panic(message.into())));
        self
    }

    pub fn with_open_error(mut self, error: DbError) -> Self {
        self.open_error = Some(error);
        self
    }

    pub fn with_close_error(mut self, error: DbError) -> Self {
        self.close_error = Some(error);
        self
    }

    pub fn with_chunk_sizes(mut self, sizes: ChunkSizes) -> Self {
        self.chunk_sizes = sizes;
        self
    }

    /// Sleep this long in every `next`.
    pub fn with_next_delay(mut self, delay: Duration) -> Self {
        self.next_delay = delay;
        self
    }

    /// Run `hook` at the start of every `next`.
    pub fn on_next(mut self, hook: impl FnMut() + 'static) -> Self {
        self.on_next = Some(Box::new(hook));
        self
    }

    pub fn writing(mut self) -> Self {
        self.caps.is_write = true;
        self
    }

    pub fn calculate_no_delay(mut self) -> Self {
        self.caps.calculate_no_delay = true;
        self
    }

    pub fn boxed(self) -> Box<dyn Executor> {
        Box::new(self)
    }
}

impl Executor for ScriptedExecutor {
    fn open(&mut self, _ctx: &ExecContext) -> DbResult<()> {
        if let Some(err) = self.open_error.take() {
            return Err(err);
        }
        self.probe.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn next(&mut self, _ctx: &ExecContext, batch: &mut RowBatch) -> DbResult<()> {
        self.probe.nexts.fetch_add(1, Ordering::SeqCst);
        let call = self.calls;
        self.calls += 1;
        if !self.next_delay.is_zero() {
            thread::sleep(self.next_delay);
        }
        if let Some(hook) = self.on_next.as_mut() {
            hook();
        }
        if let Some(pos) = self.steps.iter().position(|(at, _)| *at == call) {
            match self.steps.swap_remove(pos).1 {
                Step::Fail(err) => return Err(err),
                Step::Panic(message) => panic!("{message}"),
            }
        }
        while !batch.is_full() {
            let Some(row) = self.rows.pop_front() else {
                break;
            };
            batch.append_row(&row)?;
        }
        Ok(())
    }

    fn close(&mut self) -> DbResult<()> {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        match self.close_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn caps(&self) -> ExecCaps {
        self.caps
    }

    fn chunk_sizes(&self) -> ChunkSizes {
        self.chunk_sizes
    }
}

/// A plan node carrying just what execution inspects.
#[derive(Debug, Clone)]
pub struct MockPlan {
    id: u64,
    kind: PlanKind,
    schema: Schema,
    no_delay: bool,
    children: Vec<PlanRef>,
    explain: String,
}

static NEXT_PLAN_ID: AtomicU64 = AtomicU64::new(1);

impl MockPlan {
    pub fn new(kind: PlanKind, columns: &[&str]) -> Self {
        Self {
            id: NEXT_PLAN_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            schema: Schema::new(
                columns
                    .iter()
                    .map(|name| SchemaColumn::new(*name, SqlType::Int))
                    .collect(),
            ),
            no_delay: false,
            children: Vec::new(),
            explain: format!("{kind:?}"),
        }
    }

    pub fn select(columns: &[&str]) -> Self {
        Self::new(PlanKind::Select, columns)
    }

    /// INSERT/UPDATE/DELETE-style plan without output columns.
    pub fn dml(kind: PlanKind) -> Self {
        Self::new(kind, &[])
    }

    pub fn no_delay(mut self) -> Self {
        self.no_delay = true;
        self
    }

    pub fn with_child(mut self, child: PlanRef) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_explain(mut self, explain: impl Into<String>) -> Self {
        self.explain = explain.into();
        self
    }

    pub fn into_ref(self) -> PlanRef {
        Arc::new(self)
    }
}

impl Plan for MockPlan {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind(&self) -> PlanKind {
        self.kind
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn children(&self) -> &[PlanRef] {
        &self.children
    }

    fn calculate_no_delay(&self) -> bool {
        self.no_delay
    }

    fn explain(&self) -> String {
        self.explain.clone()
    }
}

/// Always returns the same plan; remembers the schema versions it planned
/// against.
pub struct MockPlanner {
    plan: PlanRef,
    names: Vec<FieldName>,
    versions: Mutex<Vec<i64>>,
    error: Mutex<Option<DbError>>,
}

impl MockPlanner {
    pub fn new(plan: PlanRef, names: Vec<FieldName>) -> Self {
        Self {
            plan,
            names,
            versions: Mutex::new(Vec::new()),
            error: Mutex::new(None),
        }
    }

    /// Output names derived from the plan schema.
    pub fn for_plan(plan: PlanRef) -> Self {
        let names = plan
            .schema()
            .columns
            .iter()
            .map(|column| FieldName::qualified("t", column.name.clone()))
            .collect();
        Self::new(plan, names)
    }

    /// Fail the next `optimize` call.
    pub fn fail_next(&self, error: DbError) {
        *self.error.lock() = Some(error);
    }

    pub fn calls(&self) -> usize {
        self.versions.lock().len()
    }

    pub fn versions(&self) -> Vec<i64> {
        self.versions.lock().clone()
    }
}

impl Planner for MockPlanner {
    fn optimize(
        &self,
        _sctx: &Session,
        info_schema: &InfoSchema,
        _stmt: &StmtNode,
    ) -> DbResult<(PlanRef, Vec<FieldName>)> {
        self.versions.lock().push(info_schema.version);
        if let Some(err) = self.error.lock().take() {
            return Err(err);
        }
        Ok((Arc::clone(&self.plan), self.names.clone()))
    }
}

type Factory = dyn Fn(usize) -> Box<dyn Executor> + Send + Sync;

/// Builds a fresh tree per call from a factory that receives the attempt
/// number (0 for the first build).
pub struct MockBuilder {
    factory: Box<Factory>,
    has_lock: bool,
    prepared: Option<PreparedTarget>,
    errors: Mutex<VecDeque<(usize, DbError)>>,
    builds: AtomicUsize,
    priorities: Mutex<Vec<Priority>>,
}

impl MockBuilder {
    pub fn new(factory: impl Fn(usize) -> Box<dyn Executor> + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            has_lock: false,
            prepared: None,
            errors: Mutex::new(VecDeque::new()),
            builds: AtomicUsize::new(0),
            priorities: Mutex::new(Vec::new()),
        }
    }

    /// The tree takes row locks (`FOR UPDATE`).
    pub fn with_lock(mut self) -> Self {
        self.has_lock = true;
        self
    }

    /// Report every build as the resolution of an `EXECUTE`.
    pub fn with_prepared(mut self, target: PreparedTarget) -> Self {
        self.prepared = Some(target);
        self
    }

    /// Fail the `attempt`-th build.
    pub fn fail_at(self, attempt: usize, error: DbError) -> Self {
        self.errors.lock().push_back((attempt, error));
        self
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Statement priority seen by each build, in order.
    pub fn priorities(&self) -> Vec<Priority> {
        self.priorities.lock().clone()
    }
}

impl ExecutorBuilder for MockBuilder {
    fn build(
        &self,
        sctx: &Session,
        _info_schema: &InfoSchema,
        _plan: &PlanRef,
    ) -> DbResult<BuildOutcome> {
        let attempt = self.builds.fetch_add(1, Ordering::SeqCst);
        self.priorities.lock().push(sctx.vars.stmt_ctx.priority);
        {
            let mut errors = self.errors.lock();
            if let Some(pos) = errors.iter().position(|(at, _)| *at == attempt) {
                if let Some((_, err)) = errors.remove(pos) {
                    return Err(err);
                }
            }
        }
        let mut outcome = BuildOutcome::new((self.factory)(attempt)).with_lock(self.has_lock);
        if let Some(target) = &self.prepared {
            outcome = outcome.with_prepared(target.clone());
        }
        Ok(outcome)
    }
}

/// Timestamps and retry verdicts for one transaction.
///
/// `stmt_for_update_ts` advances on every retry notification so each
/// attempt observes a distinct for-update timestamp.
pub struct MockTxnManager {
    read_ts: u64,
    for_update_ts: AtomicU64,
    schema_version: AtomicI64,
    verdict: Mutex<RetryDecision>,
    retry_error: Mutex<Option<DbError>>,
    retries: AtomicUsize,
    decisions: Mutex<Vec<(StmtErrorPoint, String)>>,
}

impl MockTxnManager {
    pub fn new(read_ts: u64) -> Self {
        Self {
            read_ts,
            for_update_ts: AtomicU64::new(read_ts),
            schema_version: AtomicI64::new(1),
            verdict: Mutex::new(RetryDecision::RetryReady),
            retry_error: Mutex::new(None),
            retries: AtomicUsize::new(0),
            decisions: Mutex::new(Vec::new()),
        }
    }

    pub fn set_verdict(&self, verdict: RetryDecision) {
        *self.verdict.lock() = verdict;
    }

    /// Fail the next `on_stmt_retry`.
    pub fn fail_next_retry(&self, error: DbError) {
        *self.retry_error.lock() = Some(error);
    }

    /// Simulate a DDL committed by another session.
    pub fn bump_schema(&self) -> i64 {
        self.schema_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Number of `on_stmt_retry` notifications.
    pub fn retries(&self) -> usize {
        self.retries.load(Ordering::SeqCst)
    }

    /// Errors the manager was asked to judge, rendered.
    pub fn decisions(&self) -> Vec<(StmtErrorPoint, String)> {
        self.decisions.lock().clone()
    }
}

impl TxnManager for MockTxnManager {
    fn stmt_read_ts(&self) -> DbResult<u64> {
        Ok(self.read_ts)
    }

    fn stmt_for_update_ts(&self) -> DbResult<u64> {
        Ok(self.for_update_ts.load(Ordering::SeqCst))
    }

    fn on_stmt_error_for_next_action(
        &self,
        point: StmtErrorPoint,
        err: &DbError,
    ) -> DbResult<RetryDecision> {
        self.decisions.lock().push((point, err.to_string()));
        Ok(*self.verdict.lock())
    }

    fn on_stmt_retry(&self, ctx: &ExecContext) -> DbResult<()> {
        ctx.check()?;
        if let Some(err) = self.retry_error.lock().take() {
            return Err(err);
        }
        self.retries.fetch_add(1, Ordering::SeqCst);
        self.for_update_ts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn info_schema(&self) -> InfoSchema {
        InfoSchema::new(self.schema_version.load(Ordering::SeqCst))
    }
}

/// Outcome of one `lock_keys` call.
#[derive(Debug)]
pub enum LockStep {
    Grant,
    Fail(DbError),
    /// Wait until the context is cancelled or the lock wait times out.
    Block,
}

/// One `lock_keys` call as the transaction saw it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockCall {
    pub keys: Vec<Key>,
    pub for_update_ts: u64,
    pub lock_wait_timeout: Duration,
}

/// Pessimistic transaction whose lock outcomes follow a script. Calls past
/// the end of the script are granted.
pub struct MockTransaction {
    start_ts: u64,
    valid: AtomicBool,
    keys: Mutex<Vec<Key>>,
    keys_error: Mutex<Option<DbError>>,
    script: Mutex<VecDeque<LockStep>>,
    calls: Mutex<Vec<LockCall>>,
    rollbacks: AtomicUsize,
    commit: Option<CommitDetails>,
}

impl MockTransaction {
    pub fn new(start_ts: u64) -> Self {
        Self {
            start_ts,
            valid: AtomicBool::new(true),
            keys: Mutex::new(Vec::new()),
            keys_error: Mutex::new(None),
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            rollbacks: AtomicUsize::new(0),
            commit: None,
        }
    }

    /// A transaction object that has not been activated yet.
    pub fn invalid(start_ts: u64) -> Self {
        Self {
            valid: AtomicBool::new(false),
            ..Self::new(start_ts)
        }
    }

    /// Make the transaction valid, as the first write of a lazily started
    /// transaction does.
    pub fn activate(&self) {
        self.valid.store(true, Ordering::SeqCst);
    }

    pub fn with_commit_details(mut self, details: CommitDetails) -> Self {
        self.commit = Some(details);
        self
    }

    /// Keys every statement reports as needing locks.
    pub fn set_keys(&self, keys: Vec<Key>) {
        *self.keys.lock() = keys;
    }

    pub fn fail_keys_need_to_lock(&self, error: DbError) {
        *self.keys_error.lock() = Some(error);
    }

    pub fn push_step(&self, step: LockStep) {
        self.script.lock().push_back(step);
    }

    pub fn lock_calls(&self) -> Vec<LockCall> {
        self.calls.lock().clone()
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    fn block(ctx: &ExecContext, timeout: Duration) -> DbResult<()> {
        let start = Instant::now();
        loop {
            ctx.check()?;
            if start.elapsed() >= timeout {
                return Err(DbError::LockWaitTimeout);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Transaction for MockTransaction {
    fn start_ts(&self) -> u64 {
        self.start_ts
    }

    fn valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn keys_need_to_lock(&self) -> DbResult<Vec<Key>> {
        if let Some(err) = self.keys_error.lock().take() {
            return Err(err);
        }
        Ok(self.keys.lock().clone())
    }

    fn lock_keys(&self, ctx: &ExecContext, lock_ctx: &mut LockCtx, keys: &[Key]) -> DbResult<()> {
        self.calls.lock().push(LockCall {
            keys: keys.to_vec(),
            for_update_ts: lock_ctx.for_update_ts,
            lock_wait_timeout: lock_ctx.lock_wait_timeout,
        });
        let step = self.script.lock().pop_front().unwrap_or(LockStep::Grant);
        let result = match step {
            LockStep::Grant => Ok(()),
            LockStep::Fail(err) => Err(err),
            LockStep::Block => Self::block(ctx, lock_ctx.lock_wait_timeout),
        };
        lock_ctx.details = Some(LockKeysDetails {
            total_time: lock_ctx.wait_start.elapsed(),
            lock_keys: keys.len() as u64,
            regions: 1,
            ..LockKeysDetails::default()
        });
        result
    }

    fn stmt_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
    }

    fn commit_details(&self) -> Option<CommitDetails> {
        self.commit.clone()
    }
}
