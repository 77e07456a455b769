//! A ready-to-run statement environment: configuration, recording sinks, a
//! scripted transaction and the services `ExecStmt` needs.

use crate::mocks::{MockBuilder, MockPlanner, MockTransaction, MockTxnManager};
use common::Config;
use executor::{ExecServices, ExecutorBuilder, Planner, Session, Transaction, TxnManager};
use std::sync::Arc;
use telemetry::{InMemoryMetrics, MemoryAudit, MemorySlowLog, Observers};

pub const START_TS: u64 = 400;
pub const CONN_ID: u64 = 7;

/// Everything a statement test inspects after the fact.
///
/// # Example
///
/// ```no_run
/// use testsupport::prelude::*;
/// use executor::{ExecContext, ExecStmt, PlanKind, StmtKind, StmtNode};
///
/// let env = TestEnv::new();
/// let plan = MockPlan::dml(PlanKind::Update).into_ref();
/// let services = env.services(
///     MockPlanner::for_plan(plan),
///     MockBuilder::new(|_| ScriptedExecutor::dml().boxed()),
/// );
/// let mut session = env.pessimistic_session();
/// let mut stmt = ExecStmt::compile(
///     &mut session,
///     services,
///     StmtNode::new(StmtKind::Update, "update t set v = 1"),
/// )
/// .unwrap();
/// assert!(stmt.exec(&ExecContext::new()).unwrap().is_none());
/// ```
pub struct TestEnv {
    pub config: Config,
    pub txn_manager: Arc<MockTxnManager>,
    pub txn: Arc<MockTransaction>,
    pub metrics: Arc<InMemoryMetrics>,
    pub slow_log: Arc<MemorySlowLog>,
    pub audit: Arc<MemoryAudit>,
    observers: Observers,
}

impl TestEnv {
    /// Slow log forced on so every statement leaves a record.
    pub fn new() -> Self {
        Self::with_config(Config::builder().force_slow_log(true).build())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_txn(config, MockTransaction::new(START_TS))
    }

    pub fn with_txn(config: Config, txn: MockTransaction) -> Self {
        let metrics = Arc::new(InMemoryMetrics::new());
        let slow_log = Arc::new(MemorySlowLog::default());
        let audit = Arc::new(MemoryAudit::default());
        let observers = Observers::new(&config)
            .with_metrics(metrics.clone())
            .with_slow_log(slow_log.clone())
            .with_audit(audit.clone());
        Self {
            config,
            txn_manager: Arc::new(MockTxnManager::new(START_TS)),
            txn: Arc::new(txn),
            metrics,
            slow_log,
            audit,
            observers,
        }
    }

    pub fn observers(&self) -> &Observers {
        &self.observers
    }

    pub fn services(&self, planner: MockPlanner, builder: MockBuilder) -> Arc<ExecServices> {
        self.services_from(Arc::new(planner), Arc::new(builder))
    }

    /// Services over shared collaborators, for tests that inspect them.
    pub fn services_from(
        &self,
        planner: Arc<dyn Planner>,
        builder: Arc<dyn ExecutorBuilder>,
    ) -> Arc<ExecServices> {
        Arc::new(
            ExecServices::new(self.config.clone(), planner, builder)
                .with_observers(self.observers.clone()),
        )
    }

    /// A session inside an explicit pessimistic transaction.
    pub fn pessimistic_session(&self) -> Session {
        self.session_in_txn(true)
    }

    /// A session inside an explicit optimistic transaction.
    pub fn optimistic_session(&self) -> Session {
        self.session_in_txn(false)
    }

    /// A session with no transaction attached.
    pub fn autocommit_session(&self) -> Session {
        let mut session = Session::new(CONN_ID, self.manager());
        session.vars.user = Some("app".into());
        session.vars.current_db = "shop".into();
        session
    }

    fn session_in_txn(&self, pessimistic: bool) -> Session {
        let mut session = self.autocommit_session();
        let txn: Arc<dyn Transaction> = self.txn.clone();
        session.begin_txn(txn, pessimistic);
        session.vars.txn_ctx.is_explicit = true;
        session
    }

    fn manager(&self) -> Arc<dyn TxnManager> {
        self.txn_manager.clone()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
