//! `EXPLAIN ANALYZE`: runs the wrapped statement, then reports the plan.

use crate::{context::ExecContext, new_first_chunk, ExecCaps, Executor};
use common::{DbResult, Row, RowBatch, Schema, SchemaColumn};
use std::time::{Duration, Instant};
use types::{SqlType, Value};

/// Wraps the executor of the analyzed statement.
///
/// A target without output columns (DML, `DO`) is driven by the statement
/// runner before this operator produces anything; see
/// [`Executor::no_delay_target`]. A target with output columns is drained
/// here and its rows are counted, never returned.
pub struct ExplainAnalyzeExec {
    target: Box<dyn Executor>,
    explain: String,
    schema: Schema,
    executed: bool,
    act_rows: u64,
    elapsed: Duration,
    lines: Option<std::vec::IntoIter<Row>>,
}

impl ExplainAnalyzeExec {
    pub fn new(target: Box<dyn Executor>, explain: impl Into<String>) -> Self {
        Self {
            target,
            explain: explain.into(),
            schema: Schema::new(vec![
                SchemaColumn::new("operator", SqlType::Text),
                SchemaColumn::new("act_rows", SqlType::Int),
                SchemaColumn::new("execution_info", SqlType::Text),
            ]),
            executed: false,
            act_rows: 0,
            elapsed: Duration::ZERO,
            lines: None,
        }
    }

    fn drain_target(&mut self, ctx: &ExecContext) -> DbResult<()> {
        let start = Instant::now();
        let mut batch = new_first_chunk(self.target.as_ref());
        let result = loop {
            if let Err(e) = crate::next(ctx, self.target.as_mut(), &mut batch) {
                break Err(e);
            }
            if batch.is_empty() {
                break Ok(());
            }
            self.act_rows += batch.num_rows() as u64;
        };
        self.elapsed += start.elapsed();
        let closed = self.target.close();
        self.executed = true;
        result.and(closed)
    }

    fn render(&self) -> Vec<Row> {
        self.explain
            .lines()
            .enumerate()
            .map(|(idx, line)| {
                let (rows, info) = if idx == 0 {
                    (
                        Value::Int(self.act_rows as i64),
                        Value::Text(format!("time:{}", common::format_duration(self.elapsed))),
                    )
                } else {
                    (Value::Null, Value::Text(String::new()))
                };
                Row::new(vec![Value::Text(line.to_string()), rows, info])
            })
            .collect()
    }
}

impl Executor for ExplainAnalyzeExec {
    fn open(&mut self, ctx: &ExecContext) -> DbResult<()> {
        self.target.open(ctx)
    }

    fn next(&mut self, ctx: &ExecContext, batch: &mut RowBatch) -> DbResult<()> {
        if !self.executed && !self.target.schema().is_empty() {
            self.drain_target(ctx)?;
        }
        if self.lines.is_none() {
            self.lines = Some(self.render().into_iter());
        }
        let Some(lines) = self.lines.as_mut() else {
            return Ok(());
        };
        while !batch.is_full() {
            match lines.next() {
                Some(row) => batch.append_row(&row)?,
                None => break,
            }
        }
        Ok(())
    }

    fn close(&mut self) -> DbResult<()> {
        if self.executed {
            return Ok(());
        }
        self.executed = true;
        self.target.close()
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn caps(&self) -> ExecCaps {
        ExecCaps {
            is_write: self.target.caps().is_write,
            calculate_no_delay: false,
            no_delay_target: !self.executed && self.target.schema().is_empty(),
        }
    }

    /// Hands out the target once; the caller drives and closes it.
    fn no_delay_target(&mut self) -> Option<&mut dyn Executor> {
        if self.executed || !self.target.schema().is_empty() {
            return None;
        }
        self.executed = true;
        Some(self.target.as_mut())
    }
}

impl std::fmt::Debug for ExplainAnalyzeExec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExplainAnalyzeExec")
            .field("executed", &self.executed)
            .field("act_rows", &self.act_rows)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::helpers::{int_rows, MockExecutor};
    use pretty_assertions::assert_eq;

    #[test]
    fn drains_target_with_rows_and_reports_count() {
        let target = MockExecutor::new(int_rows(&[1, 2, 3]), &["id"]);
        let probe = target.probe();
        let mut exec = ExplainAnalyzeExec::new(Box::new(target), "Projection\n  TableScan");
        let ctx = ExecContext::new();
        exec.open(&ctx).unwrap();
        assert!(exec.no_delay_target().is_none());

        let mut batch = new_first_chunk(&exec);
        crate::next(&ctx, &mut exec, &mut batch).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.row(0).unwrap().values[1], Value::Int(3));
        assert_eq!(batch.row(1).unwrap().values[1], Value::Null);
        assert_eq!(probe.closes(), 1);

        crate::next(&ctx, &mut exec, &mut batch).unwrap();
        assert!(batch.is_empty());
        exec.close().unwrap();
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn empty_schema_target_is_handed_out_once() {
        let target = MockExecutor::new(vec![], &[]);
        let mut exec = ExplainAnalyzeExec::new(Box::new(target), "Insert");
        assert!(exec.caps().no_delay_target);
        assert!(exec.no_delay_target().is_some());
        assert!(!exec.caps().no_delay_target);
        assert!(exec.no_delay_target().is_none());
    }
}
