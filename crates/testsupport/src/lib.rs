//! Test support for the statement executor workspace.
//!
//! This crate provides:
//! - scriptable collaborators (operator, planner, builder, transaction
//!   manager, pessimistic transaction)
//! - [`TestEnv`](env::TestEnv), which wires them to recording sinks
//! - fixtures, assertion helpers and proptest strategies
//!
//! # Example Usage
//!
//! ```no_run
//! use testsupport::prelude::*;
//! use executor::{ExecContext, ExecStmt, PlanKind, StmtKind, StmtNode};
//!
//! init_tracing();
//! let env = TestEnv::new();
//! env.txn.set_keys(int_keys(1, &[1, 2]));
//! env.txn.push_step(LockStep::Fail(errors::write_conflict("t1_r01")));
//!
//! let plan = MockPlan::dml(PlanKind::Update).into_ref();
//! let services = env.services(
//!     MockPlanner::for_plan(plan),
//!     MockBuilder::new(|_| ScriptedExecutor::dml().boxed()),
//! );
//! let mut session = env.pessimistic_session();
//! let mut stmt = ExecStmt::compile(
//!     &mut session,
//!     services,
//!     StmtNode::new(StmtKind::Update, "update t set v = v + 1"),
//! )
//! .unwrap();
//! assert!(stmt.exec(&ExecContext::new()).unwrap().is_none());
//! assert_eq!(stmt.retry_count(), 1);
//! ```

pub mod assertions;
pub mod env;
pub mod fixtures;
pub mod macros;
pub mod mocks;
pub mod proptest_generators;

use std::sync::Once;

/// Route `tracing` output to the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Convenient re-exports for common testing patterns.
pub mod prelude {
    pub use crate::assertions::*;
    pub use crate::env::*;
    pub use crate::fixtures::*;
    pub use crate::init_tracing;
    pub use crate::mocks::*;
}
