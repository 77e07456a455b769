//! Builder: constructs executor trees from physical plans.

use crate::{
    plan::{FieldName, InfoSchema, PlanRef},
    session::Session,
    Executor,
};
use common::DbResult;

/// What a build produced.
pub struct BuildOutcome {
    pub executor: Box<dyn Executor>,
    /// The tree contains an operator that takes row locks (`FOR UPDATE`).
    pub has_lock: bool,
    /// Set when the plan was an `EXECUTE` and the builder resolved the
    /// prepared statement behind it; `executor` is then the prepared tree.
    pub prepared: Option<PreparedTarget>,
}

impl BuildOutcome {
    pub fn new(executor: Box<dyn Executor>) -> Self {
        Self {
            executor,
            has_lock: false,
            prepared: None,
        }
    }

    pub fn with_lock(mut self, has_lock: bool) -> Self {
        self.has_lock = has_lock;
        self
    }

    pub fn with_prepared(mut self, target: PreparedTarget) -> Self {
        self.prepared = Some(target);
        self
    }
}

/// The prepared statement an `EXECUTE` resolved to.
#[derive(Clone, Debug)]
pub struct PreparedTarget {
    pub plan: PlanRef,
    pub output_names: Vec<FieldName>,
    pub query_text: String,
    pub lower_priority: bool,
}

/// Builds an executor tree from a plan.
///
/// Implementations must not leave anything open on error.
pub trait ExecutorBuilder: Send + Sync {
    fn build(
        &self,
        sctx: &Session,
        info_schema: &InfoSchema,
        plan: &PlanRef,
    ) -> DbResult<BuildOutcome>;
}
