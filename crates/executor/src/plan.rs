//! Contracts of the planner collaborator.

use crate::{ast::StmtNode, session::Session};
use common::{DbResult, Schema};
use std::{fmt, sync::Arc};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PlanKind {
    Select,
    Insert,
    Update,
    Delete,
    Projection,
    PointGet,
    BatchPointGet,
    TableDual,
    Set,
    Simple,
    /// `EXECUTE` of a prepared statement; resolved by the builder.
    Execute,
    Analyze,
    Explain,
    Other,
}

/// Physical plan produced by the planner.
pub trait Plan: fmt::Debug + Send + Sync {
    fn id(&self) -> u64;

    fn kind(&self) -> PlanKind;

    fn schema(&self) -> &Schema;

    fn children(&self) -> &[PlanRef] {
        &[]
    }

    /// A projection evaluated for its side effects only (`DO`).
    fn calculate_no_delay(&self) -> bool {
        false
    }

    /// Indented tree rendering, one operator per line.
    fn explain(&self) -> String;
}

pub type PlanRef = Arc<dyn Plan>;

/// Output column naming as resolved by the planner.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldName {
    pub db_name: String,
    pub tbl_name: String,
    pub orig_tbl_name: String,
    pub col_name: String,
    pub orig_col_name: String,
}

impl FieldName {
    pub fn column(name: impl Into<String>) -> Self {
        Self {
            col_name: name.into(),
            ..Self::default()
        }
    }

    pub fn qualified(table: impl Into<String>, name: impl Into<String>) -> Self {
        let table = table.into();
        Self {
            tbl_name: table.clone(),
            orig_tbl_name: table,
            col_name: name.into(),
            ..Self::default()
        }
    }
}

/// Schema snapshot a plan was built against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InfoSchema {
    pub version: i64,
}

impl InfoSchema {
    pub fn new(version: i64) -> Self {
        Self { version }
    }
}

pub trait Planner: Send + Sync {
    fn optimize(
        &self,
        sctx: &Session,
        info_schema: &InfoSchema,
        stmt: &StmtNode,
    ) -> DbResult<(PlanRef, Vec<FieldName>)>;
}

/// Plans cheap enough that per-statement instrumentation is skipped.
pub fn is_fast_plan(plan: &dyn Plan) -> bool {
    let plan = match (plan.kind(), plan.children()) {
        (PlanKind::Projection, [child]) => child.as_ref(),
        _ => plan,
    };
    matches!(
        plan.kind(),
        PlanKind::PointGet | PlanKind::TableDual | PlanKind::Set
    )
}

/// A plan whose rows never reach the client.
pub fn is_no_result_plan(plan: &dyn Plan) -> bool {
    plan.schema().is_empty() || plan.calculate_no_delay()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SchemaColumn;
    use types::SqlType;

    #[derive(Debug)]
    struct Node {
        kind: PlanKind,
        schema: Schema,
        no_delay: bool,
        children: Vec<PlanRef>,
    }

    impl Plan for Node {
        fn id(&self) -> u64 {
            1
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
            format!("{:?}", self.kind)
        }
    }

    fn node(kind: PlanKind, children: Vec<PlanRef>) -> Node {
        Node {
            kind,
            schema: Schema::new(vec![SchemaColumn::new("a", SqlType::Int)]),
            no_delay: false,
            children,
        }
    }

    #[test]
    fn fast_plans_look_through_one_projection() {
        assert!(is_fast_plan(&node(PlanKind::PointGet, vec![])));
        let point: PlanRef = Arc::new(node(PlanKind::PointGet, vec![]));
        assert!(is_fast_plan(&node(PlanKind::Projection, vec![point])));
        let select: PlanRef = Arc::new(node(PlanKind::Select, vec![]));
        assert!(!is_fast_plan(&node(PlanKind::Projection, vec![select])));
    }

    #[test]
    fn do_projection_has_no_result() {
        let mut plan = node(PlanKind::Projection, vec![]);
        assert!(!is_no_result_plan(&plan));
        plan.no_delay = true;
        assert!(is_no_result_plan(&plan));
        plan.no_delay = false;
        plan.schema = Schema::empty();
        assert!(is_no_result_plan(&plan));
    }
}
