//! Lock-conflict retry of DML and `SELECT ... FOR UPDATE` inside pessimistic
//! transactions.

use common::{Config, DbError, DbResult, ErrorKind, ReadOnlyReason, Row, TableId};
use executor::{
    ExecContext, ExecServices, ExecStmt, InfoSchema, LockPath, PlanKind, RetryDecision, Session,
    StmtErrorPoint, StmtKind, StmtNode,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use telemetry::{Metric, Phase, PhaseDurations};
use testsupport::{
    prelude::*,
    proptest_generators::{arb_conflict, arb_conflict_run},
};

const UPDATE: &str = "update t set v = v + 1 where id < 3";
const SELECT_FOR_UPDATE: &str = "select id, v from t where id < 5 for update";

fn update_node() -> StmtNode {
    StmtNode::new(StmtKind::Update, UPDATE)
}

fn dml_builder(probe: &Probe) -> Arc<MockBuilder> {
    let probe = probe.clone();
    Arc::new(MockBuilder::new(move |_| {
        ScriptedExecutor::dml().with_probe(&probe).boxed()
    }))
}

fn dml_services(env: &TestEnv, builder: Arc<MockBuilder>) -> Arc<ExecServices> {
    let plan = MockPlan::dml(PlanKind::Update).into_ref();
    env.services_from(Arc::new(MockPlanner::for_plan(plan)), builder)
}

/// What a no-delay statement left behind, captured before the session is
/// released.
struct Run {
    result: DbResult<()>,
    retry_count: u32,
    phases: PhaseDurations,
    lock_path: LockPath,
}

fn run(
    session: &mut Session,
    services: Arc<ExecServices>,
    node: StmtNode,
    ctx: &ExecContext,
) -> Run {
    let mut stmt = ExecStmt::compile(session, services, node).expect("compile");
    let result = stmt
        .exec(ctx)
        .map(|rs| assert!(rs.is_none(), "no-delay statement returned a record set"));
    Run {
        result,
        retry_count: stmt.retry_count(),
        phases: *stmt.phases(),
        lock_path: stmt.lock_path(),
    }
}

fn sfu_services(env: &TestEnv, conflicts: usize, probe: &Probe) -> Arc<ExecServices> {
    let plan = MockPlan::select(&["id", "v"]).into_ref();
    let probe = probe.clone();
    let builder = MockBuilder::new(move |attempt| {
        let exec = ScriptedExecutor::new(pair_rows(5), &["id", "v"]).with_probe(&probe);
        let exec = if attempt < conflicts {
            exec.fail_at(1, errors::write_conflict("t1_r03"))
        } else {
            exec
        };
        exec.boxed()
    })
    .with_lock();
    env.services(MockPlanner::for_plan(plan), builder)
}

fn select_for_update(
    session: &mut Session,
    services: Arc<ExecServices>,
    ctx: &ExecContext,
) -> DbResult<(Vec<Row>, u32)> {
    let node = StmtNode::new(StmtKind::Select, SELECT_FOR_UPDATE).for_update();
    let mut stmt = ExecStmt::compile(session, services, node)?;
    let rows = {
        let mut rs = stmt.exec(ctx)?.expect("locking read returns rows");
        let rows = drain(rs.as_mut(), ctx)?;
        rs.close()?;
        rows
    };
    assert_eq!(stmt.lock_path(), LockPath::SelectForUpdate);
    Ok((rows, stmt.retry_count()))
}

#[test]
fn dml_without_keys_finishes_in_one_attempt() {
    let env = TestEnv::new();
    let probe = Probe::default();
    let builder = dml_builder(&probe);
    let mut session = env.pessimistic_session();

    let run = run(
        &mut session,
        dml_services(&env, builder.clone()),
        update_node(),
        &ExecContext::new(),
    );

    assert!(run.result.is_ok());
    assert_eq!(run.retry_count, 0);
    assert_eq!(run.lock_path, LockPath::PessimisticDml);
    assert!(env.txn.lock_calls().is_empty());
    assert_eq!(builder.builds(), 1);
    assert_eq!((probe.opens(), probe.nexts(), probe.closes()), (1, 1, 1));
    assert_eq!(env.txn.rollbacks(), 0);
}

#[test]
fn lock_conflicts_are_retried_until_locked() {
    let env = TestEnv::new();
    env.txn.set_keys(int_keys(1, &[1, 2]));
    for err in errors::lock_conflicts(3) {
        env.txn.push_step(LockStep::Fail(err));
    }
    let probe = Probe::default();
    let builder = dml_builder(&probe);
    let mut session = env.pessimistic_session();

    let run = run(
        &mut session,
        dml_services(&env, builder.clone()),
        update_node(),
        &ExecContext::new(),
    );

    assert!(run.result.is_ok());
    assert_eq!(run.retry_count, 3);
    assert_eq!(builder.builds(), 4);
    assert_eq!(env.txn.rollbacks(), 3);
    assert_eq!(env.txn_manager.retries(), 3);
    assert_eq!(probe.open_trees(), 0);

    let for_update_ts: Vec<u64> = env
        .txn
        .lock_calls()
        .iter()
        .map(|call| call.for_update_ts)
        .collect();
    assert_eq!(for_update_ts, vec![400, 401, 402, 403]);
    assert!(env
        .txn_manager
        .decisions()
        .iter()
        .all(|(point, _)| *point == StmtErrorPoint::AfterPessimisticLock));
    assert_eq!(session.vars.txn_ctx.locked_count(), 2);
    assert_eq!(
        env.metrics
            .snapshot(Metric::StatementPessimisticRetryCount, &[])
            .map(|s| s.sum),
        Some(3.0)
    );
}

#[test]
fn retry_budget_exhaustion_reports_limit_error() {
    let env = TestEnv::with_config(
        Config::builder()
            .max_retry_count(2)
            .force_slow_log(true)
            .build(),
    );
    env.txn.set_keys(int_keys(1, &[1]));
    for err in errors::lock_conflicts(3) {
        env.txn.push_step(LockStep::Fail(err));
    }
    let mut session = env.pessimistic_session();

    let run = run(
        &mut session,
        dml_services(&env, dml_builder(&Probe::default())),
        update_node(),
        &ExecContext::new(),
    );

    assert!(matches!(
        run.result,
        Err(DbError::RetryBudgetExceeded { max_retries: 2 })
    ));
    assert_eq!(run.retry_count, 2);
    assert_eq!(env.txn.lock_calls().len(), 3);
    assert_eq!(
        env.metrics
            .snapshot(Metric::StatementErrors, &["retry_limit"])
            .map(|s| s.count),
        Some(1)
    );
}

#[test]
fn deadlock_is_never_retried() {
    let env = TestEnv::new();
    env.txn.set_keys(int_keys(1, &[1]));
    env.txn.push_step(LockStep::Fail(errors::kv_deadlock()));
    let builder = dml_builder(&Probe::default());
    let mut session = env.pessimistic_session();

    let run = run(
        &mut session,
        dml_services(&env, builder.clone()),
        update_node(),
        &ExecContext::new(),
    );

    assert!(matches!(run.result, Err(DbError::Deadlock)));
    assert_eq!(run.retry_count, 0);
    assert_eq!(builder.builds(), 1);
    assert_eq!(env.txn_manager.decisions().len(), 1);
    assert_eq!(env.txn_manager.retries(), 0);
    assert_eq!(
        env.metrics
            .total_count(Metric::StatementDeadlockDetectDuration),
        1
    );
    assert_eq!(
        env.metrics
            .snapshot(Metric::StatementErrors, &["deadlock"])
            .map(|s| s.count),
        Some(1)
    );
}

#[test]
fn manager_verdict_keeps_original_error() {
    let env = TestEnv::new();
    env.txn.set_keys(int_keys(1, &[1]));
    env.txn
        .push_step(LockStep::Fail(errors::write_conflict("t1_r01")));
    env.txn_manager.set_verdict(RetryDecision::Fatal);
    let mut session = env.pessimistic_session();

    let run = run(
        &mut session,
        dml_services(&env, dml_builder(&Probe::default())),
        update_node(),
        &ExecContext::new(),
    );

    assert_error_kind(run.result, ErrorKind::LockConflict);
    assert_eq!(run.retry_count, 0);
    assert_eq!(env.txn_manager.decisions().len(), 1);
}

#[test]
fn non_lock_errors_are_judged_but_not_retried() {
    let env = TestEnv::new();
    env.txn.set_keys(int_keys(1, &[1]));
    let builder = Arc::new(MockBuilder::new(|_| {
        ScriptedExecutor::dml()
            .fail_at(0, DbError::Storage("region unavailable".into()))
            .boxed()
    }));
    let mut session = env.pessimistic_session();

    let run = run(
        &mut session,
        dml_services(&env, builder),
        update_node(),
        &ExecContext::new(),
    );

    assert_error_contains(run.result, "region unavailable");
    let decisions = env.txn_manager.decisions();
    assert_eq!(decisions.len(), 1);
    assert!(decisions[0].1.contains("region unavailable"));
    assert_eq!(env.txn_manager.retries(), 0);
    assert!(env.txn.lock_calls().is_empty());
}

#[test]
fn dml_locks_keys_of_a_transaction_it_activates() {
    let txn = MockTransaction::invalid(START_TS);
    txn.set_keys(int_keys(1, &[1, 2]));
    let env = TestEnv::with_txn(Config::builder().force_slow_log(true).build(), txn);
    let activated = env.txn.clone();
    let builder = Arc::new(MockBuilder::new(move |_| {
        let txn = activated.clone();
        ScriptedExecutor::dml().on_next(move || txn.activate()).boxed()
    }));
    let mut session = env.pessimistic_session();

    let run = run(
        &mut session,
        dml_services(&env, builder),
        update_node(),
        &ExecContext::new(),
    );

    assert!(run.result.is_ok());
    let calls = env.txn.lock_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].keys, int_keys(1, &[1, 2]));
    assert_eq!(session.vars.txn_ctx.locked_count(), 2);
}

#[test]
fn dml_in_a_transaction_that_stays_inactive_takes_no_locks() {
    let txn = MockTransaction::invalid(START_TS);
    txn.set_keys(int_keys(1, &[1]));
    let env = TestEnv::with_txn(Config::builder().force_slow_log(true).build(), txn);
    let probe = Probe::default();
    let mut session = env.pessimistic_session();

    let run = run(
        &mut session,
        dml_services(&env, dml_builder(&probe)),
        update_node(),
        &ExecContext::new(),
    );

    assert!(run.result.is_ok());
    assert!(env.txn.lock_calls().is_empty());
    assert_eq!(probe.closes(), 1);
}

#[test]
fn failing_retry_notification_aborts_the_loop() {
    let env = TestEnv::new();
    env.txn.set_keys(int_keys(1, &[1]));
    env.txn.push_step(LockStep::Fail(DbError::LockWaitTimeout));
    env.txn_manager
        .fail_next_retry(DbError::Storage("pd unreachable".into()));
    let builder = dml_builder(&Probe::default());
    let mut session = env.pessimistic_session();

    let run = run(
        &mut session,
        dml_services(&env, builder.clone()),
        update_node(),
        &ExecContext::new(),
    );

    assert_error_contains(run.result, "pd unreachable");
    assert_eq!(builder.builds(), 1);
}

#[test]
fn snapshot_session_rejects_writes_before_locking() {
    let env = TestEnv::new();
    env.txn.set_keys(int_keys(1, &[1]));
    let probe = Probe::default();
    let mut session = env.pessimistic_session();
    session.vars.snapshot_ts = 90;

    let run = run(
        &mut session,
        dml_services(&env, dml_builder(&probe)),
        update_node(),
        &ExecContext::new(),
    );

    assert!(matches!(
        run.result,
        Err(DbError::ReadOnlyViolation(ReadOnlyReason::SnapshotTs))
    ));
    assert_eq!(probe.nexts(), 0);
    assert_eq!(probe.closes(), 1);
    assert!(env.txn.lock_calls().is_empty());
    assert!(env.txn_manager.decisions().is_empty());
}

#[test]
fn cancellation_interrupts_lock_wait() {
    let env = TestEnv::new();
    env.txn.set_keys(int_keys(1, &[1]));
    env.txn.push_step(LockStep::Block);
    let probe = Probe::default();
    let mut session = env.pessimistic_session();
    let ctx = ExecContext::new();
    let canceller = ctx.clone();
    let killer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        canceller.cancel();
    });

    let start = Instant::now();
    let run = run(
        &mut session,
        dml_services(&env, dml_builder(&probe)),
        update_node(),
        &ctx,
    );
    killer.join().unwrap();

    assert!(matches!(run.result, Err(DbError::Cancelled)));
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(run.retry_count, 0);
    assert_eq!(probe.open_trees(), 0);
}

#[test]
fn lock_wait_timeout_is_retried_with_session_timeout() {
    let env = TestEnv::new();
    env.txn.set_keys(int_keys(1, &[1]));
    env.txn.push_step(LockStep::Block);
    let mut session = env.pessimistic_session();
    session.vars.lock_wait_timeout = Some(Duration::from_millis(10));

    let run = run(
        &mut session,
        dml_services(&env, dml_builder(&Probe::default())),
        update_node(),
        &ExecContext::new(),
    );

    assert!(run.result.is_ok());
    assert_eq!(run.retry_count, 1);
    let calls = env.txn.lock_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].lock_wait_timeout, Duration::from_millis(10));
}

#[test]
fn config_lock_wait_timeout_applies_without_session_override() {
    let env = TestEnv::with_config(
        Config::builder()
            .lock_wait_timeout(Duration::from_secs(3))
            .build(),
    );
    env.txn.set_keys(int_keys(1, &[1]));
    let mut session = env.pessimistic_session();

    let run = run(
        &mut session,
        dml_services(&env, dml_builder(&Probe::default())),
        update_node(),
        &ExecContext::new(),
    );

    assert!(run.result.is_ok());
    assert_eq!(
        env.txn.lock_calls()[0].lock_wait_timeout,
        Duration::from_secs(3)
    );
}

#[test]
fn keys_already_locked_are_not_locked_again() {
    let env = TestEnv::new();
    env.txn.set_keys(int_keys(1, &[1, 2]));
    let mut session = env.pessimistic_session();

    for _ in 0..2 {
        let run = run(
            &mut session,
            dml_services(&env, dml_builder(&Probe::default())),
            update_node(),
            &ExecContext::new(),
        );
        assert!(run.result.is_ok());
    }

    assert_eq!(env.txn.lock_calls().len(), 1);
}

#[test]
fn non_lockable_tables_are_skipped() {
    let env = TestEnv::new();
    env.txn.set_keys(int_keys(1, &[1, 2]));
    let mut session = env.pessimistic_session();
    session.vars.non_lockable_tables.insert(TableId(1));

    let run = run(
        &mut session,
        dml_services(&env, dml_builder(&Probe::default())),
        update_node(),
        &ExecContext::new(),
    );

    assert!(run.result.is_ok());
    assert!(env.txn.lock_calls().is_empty());
}

#[test]
fn lock_details_are_merged_into_the_statement() {
    let env = TestEnv::new();
    env.txn.set_keys(int_keys(1, &[1, 2, 3]));
    let mut session = env.pessimistic_session();

    let run = run(
        &mut session,
        dml_services(&env, dml_builder(&Probe::default())),
        update_node(),
        &ExecContext::new(),
    );

    assert!(run.result.is_ok());
    let stmt_ctx = &session.vars.stmt_ctx;
    assert_eq!(stmt_ctx.lock_keys_count, 3);
    assert_eq!(
        stmt_ctx
            .exec_details()
            .lock_keys_detail
            .as_ref()
            .map(|d| d.lock_keys),
        Some(3)
    );
    assert_eq!(
        env.metrics
            .snapshot(Metric::StatementLockKeysCount, &[])
            .map(|s| s.sum),
        Some(3.0)
    );
}

#[test]
fn schema_change_replans_before_rebuild() {
    let env = TestEnv::new();
    env.txn.set_keys(int_keys(1, &[1]));
    env.txn
        .push_step(LockStep::Fail(errors::write_conflict("t1_r01")));
    let manager = env.txn_manager.clone();
    let builder = Arc::new(MockBuilder::new(move |attempt| {
        if attempt == 0 {
            manager.bump_schema();
        }
        ScriptedExecutor::dml().boxed()
    }));
    let planner = Arc::new(MockPlanner::for_plan(
        MockPlan::dml(PlanKind::Update).into_ref(),
    ));
    let services = env.services_from(planner.clone(), builder);
    let mut session = env.pessimistic_session();

    let mut stmt = ExecStmt::compile(&mut session, services, update_node()).unwrap();
    assert!(stmt.exec(&ExecContext::new()).unwrap().is_none());

    assert_eq!(planner.versions(), vec![1, 2]);
    assert_eq!(stmt.info_schema(), InfoSchema::new(2));
    assert_eq!(stmt.retry_count(), 1);
}

#[test]
fn dml_with_locking_subselect_takes_dml_path() {
    let env = TestEnv::new();
    env.txn.set_keys(int_keys(1, &[1]));
    let builder = Arc::new(MockBuilder::new(|_| ScriptedExecutor::dml().boxed()).with_lock());
    let mut session = env.pessimistic_session();

    let run = run(
        &mut session,
        dml_services(&env, builder),
        StmtNode::new(
            StmtKind::Update,
            "update t set v = 1 where id in (select id from s for update)",
        ),
        &ExecContext::new(),
    );

    assert!(run.result.is_ok());
    assert_eq!(run.lock_path, LockPath::PessimisticDml);
    assert_eq!(env.txn.lock_calls().len(), 1);
}

#[test]
fn select_for_update_returns_rows_of_final_attempt() {
    let ctx = ExecContext::new();

    let clean_env = TestEnv::new();
    let mut clean_session = clean_env.pessimistic_session();
    let (expected, clean_retries) = select_for_update(
        &mut clean_session,
        sfu_services(&clean_env, 0, &Probe::default()),
        &ctx,
    )
    .unwrap();
    assert_eq!(clean_retries, 0);

    let env = TestEnv::new();
    let probe = Probe::default();
    let mut session = env.pessimistic_session();
    let (rows, retries) =
        select_for_update(&mut session, sfu_services(&env, 1, &probe), &ctx).unwrap();

    assert_eq!(rows, expected);
    assert_eq!(rows, pair_rows(5));
    assert_eq!(retries, 1);
    assert_eq!(probe.open_trees(), 0);
    assert_eq!(env.txn.rollbacks(), 1);
    assert!(session.vars.stmt_ctx.mem_tracker.is_detached());
    assert_eq!(
        session.mem_tracker().consumed(),
        0,
        "detached tracker returned its bytes"
    );
}

#[test]
fn select_for_update_under_snapshot_is_a_user_error() {
    let env = TestEnv::new();
    let probe = Probe::default();
    let mut session = env.pessimistic_session();
    session.vars.snapshot_ts = 12;

    let result = select_for_update(&mut session, sfu_services(&env, 0, &probe), &ExecContext::new());

    assert!(matches!(
        result,
        Err(DbError::ReadOnlyViolation(ReadOnlyReason::SnapshotTs))
    ));
    assert_eq!(probe.open_trees(), 0);
    assert!(env.txn_manager.decisions().is_empty());
}

#[test]
fn locking_select_outside_pessimistic_txn_streams() {
    let env = TestEnv::new();
    let probe = Probe::default();
    let mut session = env.optimistic_session();
    let node = StmtNode::new(StmtKind::Select, SELECT_FOR_UPDATE).for_update();
    let ctx = ExecContext::new();

    let mut stmt = ExecStmt::compile(&mut session, sfu_services(&env, 0, &probe), node).unwrap();
    {
        let mut rs = stmt.exec(&ctx).unwrap().expect("rows");
        assert_eq!(probe.nexts(), 0, "streaming starts lazily");
        assert_eq!(drain(rs.as_mut(), &ctx).unwrap(), pair_rows(5));
    }
    assert_eq!(probe.closes(), 1);
}

#[test]
fn memory_quota_stops_select_for_update() {
    let env = TestEnv::new();
    let plan = MockPlan::select(&["id", "v"]).into_ref();
    let services = sfu_services(&env, 0, &Probe::default());
    let node = StmtNode::new(StmtKind::Select, SELECT_FOR_UPDATE).for_update();
    let mut session = env.pessimistic_session();
    session.begin_statement(&node);
    session.vars.stmt_ctx.mem_quota_query = Some(1);

    let mut stmt = ExecStmt::new(&mut session, services, InfoSchema::new(1), plan, node, Vec::new());
    let result = stmt.exec(&ExecContext::new()).map(|rs| rs.is_some());

    assert_error_kind(result, ErrorKind::ResourceExceeded);
    assert_eq!(stmt.retry_count(), 0);
    assert_eq!(stmt.session().vars.stmt_ctx.mem_tracker.consumed(), 0);
}

const DELAY: Duration = Duration::from_millis(15);

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn retries_fold_prior_attempt_phases(conflicts in arb_conflict_run(4)) {
        let env = TestEnv::new();
        env.txn.set_keys(int_keys(1, &[1]));
        for kind in &conflicts {
            env.txn.push_step(LockStep::Fail(kind.to_error()));
        }
        let n = conflicts.len();
        let builder = Arc::new(MockBuilder::new(move |attempt| {
            let exec = ScriptedExecutor::dml();
            let exec = if attempt < n { exec.with_next_delay(DELAY) } else { exec };
            exec.boxed()
        }));
        let mut session = env.pessimistic_session();

        let run = run(&mut session, dml_services(&env, builder), update_node(), &ExecContext::new());

        prop_assert!(run.result.is_ok());
        prop_assert_eq!(run.retry_count as usize, n);
        prop_assert!(run.phases.prior(Phase::Next) >= DELAY * n as u32);
        prop_assert!(run.phases.current(Phase::Next) < DELAY);
    }

    #[test]
    fn exhausted_budget_stops_at_the_limit(max_retries in 0u32..4, kind in arb_conflict()) {
        let env = TestEnv::with_config(Config::builder().max_retry_count(max_retries).build());
        env.txn.set_keys(int_keys(1, &[1]));
        for _ in 0..=max_retries {
            env.txn.push_step(LockStep::Fail(kind.to_error()));
        }
        let mut session = env.pessimistic_session();

        let run = run(
            &mut session,
            dml_services(&env, dml_builder(&Probe::default())),
            update_node(),
            &ExecContext::new(),
        );

        prop_assert_eq!(run.retry_count, max_retries);
        let budget_error = matches!(
            run.result,
            Err(DbError::RetryBudgetExceeded { max_retries: m }) if m == max_retries
        );
        prop_assert!(budget_error);
    }
}
