//! Statement execution adapter: turns a compiled plan into a running
//! executor tree and a result set, under pessimistic-lock retry.
//!
//! Executors follow a Volcano-style cursor contract with columnar batches.
//! `ExecStmt` owns one statement from compile to close and decides how the
//! tree is run:
//!
//! ```text
//! StmtNode ──compile──▶ ExecStmt
//!                          │ exec()
//!                          ▼
//!                build ─▶ open ─┬─ SELECT .. FOR UPDATE  ─▶ buffered rows ─▶ BufferedRecordSet
//!                               ├─ no result (DML, DO)   ─▶ drive once, lock keys, retry
//!                               └─ query                 ─▶ ExecutorRecordSet (streaming)
//!                                                                │ close()
//!                                                                ▼
//!                                          slow log · statement summary · audit · metrics
//! ```
//!
//! # Example
//!
//! ```ignore
//! use executor::{ExecContext, ExecStmt};
//!
//! let mut stmt = ExecStmt::compile(&mut session, services.clone(), node)?;
//! if let Some(mut rs) = stmt.exec(&ExecContext::new())? {
//!     let mut batch = rs.new_batch(None);
//!     loop {
//!         rs.next(&ctx, &mut batch)?;
//!         if batch.is_empty() {
//!             break;
//!         }
//!     }
//!     rs.close()?;
//! }
//! ```

#[cfg(test)]
mod tests {
    pub mod helpers;

    use super::*;
    use common::{DbError, Row};
    use helpers::{int_rows, MockExecutor};
    use pretty_assertions::assert_eq;
    use types::Value;

    #[test]
    fn next_resets_the_batch_before_pulling() {
        let mut exec = MockExecutor::new(int_rows(&[1, 2]), &["id"]);
        let ctx = ExecContext::new();
        let mut batch = new_first_chunk(&exec);
        batch.append_row(&Row::new(vec![Value::Int(99)])).unwrap();

        next(&ctx, &mut exec, &mut batch).unwrap();
        assert_eq!(
            batch.rows().collect::<Vec<_>>(),
            int_rows(&[1, 2]),
            "stale rows must be discarded"
        );
    }

    #[test]
    fn next_leaves_an_empty_batch_on_error() {
        let mut exec = MockExecutor::new(int_rows(&[1]), &["id"])
            .with_next_error(DbError::Executor("boom".into()));
        let ctx = ExecContext::new();
        let mut batch = new_first_chunk(&exec);

        assert!(next(&ctx, &mut exec, &mut batch).is_err());
        assert!(batch.is_empty());
    }

    #[test]
    fn next_observes_cancellation_before_the_operator() {
        let mut exec = MockExecutor::new(int_rows(&[1]), &["id"]);
        let probe = exec.probe();
        let ctx = ExecContext::new();
        ctx.cancel();
        let mut batch = new_first_chunk(&exec);

        assert!(matches!(
            next(&ctx, &mut exec, &mut batch),
            Err(DbError::Cancelled)
        ));
        assert_eq!(probe.nexts(), 0);
    }

    #[test]
    fn first_chunk_follows_the_operator_sizes() {
        let exec = MockExecutor::new(vec![], &["a", "b"]).with_chunk_sizes(ChunkSizes {
            init_cap: 4,
            max: 8,
        });
        let batch = new_first_chunk(&exec);
        assert_eq!(batch.num_cols(), 2);
        assert_eq!(batch.capacity(), 4);
        assert_eq!(batch.max_chunk_size(), 8);
    }

    #[test]
    fn close_quietly_swallows_errors() {
        let mut exec = MockExecutor::new(vec![], &["id"])
            .with_close_error(DbError::Executor("close failed".into()));
        let probe = exec.probe();
        close_quietly(&mut exec);
        assert_eq!(probe.closes(), 1);
    }
}

pub mod ast;
pub mod builder;
pub mod context;
pub mod explain;
mod finish;
mod panic;
mod pessimistic;
pub mod plan;
pub mod project;
pub mod record_set;
pub mod services;
pub mod session;
mod stmt;
pub mod txn;

pub use ast::{StmtKind, StmtNode};
pub use builder::{BuildOutcome, ExecutorBuilder, PreparedTarget};
pub use context::ExecContext;
pub use explain::ExplainAnalyzeExec;
pub use panic::PANIC_MEMORY_EXCEED;
pub use pessimistic::LockPath;
pub use plan::{FieldName, InfoSchema, Plan, PlanKind, PlanRef, Planner};
pub use project::ProjectionExec;
pub use record_set::{RecordSet, ResultField};
pub use services::ExecServices;
pub use session::{Session, SessionVars, StmtContext};
pub use stmt::ExecStmt;
pub use txn::{Key, LockCtx, RetryDecision, StmtErrorPoint, Transaction, TxnManager};

use common::{ChunkSizes, DbResult, RowBatch, Schema};

/// Static facts about an executor tree that drive how a statement runs it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecCaps {
    /// The tree writes data; rejected under a read-only snapshot.
    pub is_write: bool,
    /// A projection evaluated only for its side effects.
    pub calculate_no_delay: bool,
    /// `no_delay_target` will hand out an inner executor.
    pub no_delay_target: bool,
}

/// Volcano-style cursor over columnar batches.
///
/// `next` fills the batch it is given; leaving it empty signals the end of
/// data. Operators may return partial batches on any call. `close` is called
/// exactly once per successful `open`, including after errors.
pub trait Executor {
    fn open(&mut self, ctx: &ExecContext) -> DbResult<()>;

    /// Append the next rows to `batch`, which the caller has already reset.
    fn next(&mut self, ctx: &ExecContext, batch: &mut RowBatch) -> DbResult<()>;

    fn close(&mut self) -> DbResult<()>;

    fn schema(&self) -> &Schema;

    fn caps(&self) -> ExecCaps {
        ExecCaps::default()
    }

    fn chunk_sizes(&self) -> ChunkSizes {
        ChunkSizes::default()
    }

    /// For wrappers such as `EXPLAIN ANALYZE`: the inner executor that must
    /// be run to completion before this one produces output.
    fn no_delay_target(&mut self) -> Option<&mut dyn Executor> {
        None
    }
}

/// Pull one batch from `e`.
///
/// Checks cancellation and the deadline first, resets `batch`, and leaves it
/// empty if the operator fails.
pub fn next(ctx: &ExecContext, e: &mut dyn Executor, batch: &mut RowBatch) -> DbResult<()> {
    ctx.check()?;
    batch.reset();
    if let Err(err) = e.next(ctx, batch) {
        batch.reset();
        return Err(err);
    }
    Ok(())
}

/// A batch shaped for `e`'s output, sized by its chunk policy.
pub fn new_first_chunk(e: &dyn Executor) -> RowBatch {
    RowBatch::with_sizes(e.schema().len(), e.chunk_sizes())
}

/// Close `e`, logging instead of returning a failure.
pub(crate) fn close_quietly(e: &mut dyn Executor) {
    if let Err(err) = e.close() {
        tracing::warn!(error = %err, "close executor failed");
    }
}
