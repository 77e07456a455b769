//! Result sets handed to the client layer.

use crate::{
    close_quietly,
    context::ExecContext,
    new_first_chunk,
    panic::recover,
    plan::FieldName,
    stmt::ExecStmt,
    Executor,
};
use common::{ChunkAllocator, ChunkSizes, DbResult, Row, RowBatch, Schema};
use std::panic::{catch_unwind, AssertUnwindSafe};
use types::SqlType;

/// Longest column alias sent to clients, in bytes.
pub const MAX_ALIAS_IDENTIFIER_LEN: usize = 256;

/// Column metadata as the client protocol reports it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultField {
    pub column_name: String,
    pub column_as_name: String,
    /// The planner had no original column name; `column_name` is the alias.
    pub empty_org_name: bool,
    pub table_name: String,
    pub table_as_name: String,
    pub db_name: String,
    pub ty: SqlType,
}

fn truncate_alias(name: &mut String) {
    if name.len() <= MAX_ALIAS_IDENTIFIER_LEN {
        return;
    }
    let mut cut = MAX_ALIAS_IDENTIFIER_LEN;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    name.truncate(cut);
}

/// Pair each schema column with its planner name. Qualified columns without
/// a database take `default_db`.
pub fn result_fields(schema: &Schema, names: &[FieldName], default_db: &str) -> Vec<ResultField> {
    schema
        .columns
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let fallback;
            let name = match names.get(idx) {
                Some(name) => name,
                None => {
                    fallback = FieldName::column(column.name.clone());
                    &fallback
                }
            };
            let db_name = if name.db_name.is_empty() && !name.tbl_name.is_empty() {
                default_db.to_string()
            } else {
                name.db_name.clone()
            };
            let empty_org_name = name.orig_col_name.is_empty();
            let column_name = if empty_org_name {
                name.col_name.clone()
            } else {
                name.orig_col_name.clone()
            };
            let mut column_as_name = name.col_name.clone();
            truncate_alias(&mut column_as_name);
            ResultField {
                column_name,
                column_as_name,
                empty_org_name,
                table_name: name.orig_tbl_name.clone(),
                table_as_name: name.tbl_name.clone(),
                db_name,
                ty: column.ty,
            }
        })
        .collect()
}

/// Cursor over a statement's output as the client layer sees it.
///
/// `close` finalizes the statement (slow log, summary, audit, trackers)
/// exactly once, however many times it is called.
pub trait RecordSet {
    fn fields(&mut self) -> &[ResultField];

    /// Fill `batch` with the next rows; an empty batch means no more data.
    fn next(&mut self, ctx: &ExecContext, batch: &mut RowBatch) -> DbResult<()>;

    /// A batch shaped for this result, from `alloc` when one is given.
    fn new_batch(&self, alloc: Option<&dyn ChunkAllocator>) -> RowBatch;

    fn close(&mut self) -> DbResult<()>;

    /// Called after a cursor fetch returned rows to the client.
    fn on_fetch_returned(&mut self) {}
}

/// Streams rows straight from the executor tree.
pub struct ExecutorRecordSet<'a, 's> {
    stmt: &'a mut ExecStmt<'s>,
    executor: Box<dyn Executor>,
    txn_start_ts: u64,
    fields: Option<Vec<ResultField>>,
    last_err: Option<String>,
    closed: bool,
}

impl<'a, 's> ExecutorRecordSet<'a, 's> {
    pub(crate) fn new(stmt: &'a mut ExecStmt<'s>, executor: Box<dyn Executor>, txn_start_ts: u64) -> Self {
        Self {
            stmt,
            executor,
            txn_start_ts,
            fields: None,
            last_err: None,
            closed: false,
        }
    }
}

impl RecordSet for ExecutorRecordSet<'_, '_> {
    fn fields(&mut self) -> &[ResultField] {
        let Self {
            stmt,
            executor,
            fields,
            ..
        } = self;
        fields.get_or_insert_with(|| {
            result_fields(
                executor.schema(),
                &stmt.output_names,
                &stmt.sctx.vars.current_db,
            )
        })
    }

    fn next(&mut self, ctx: &ExecContext, batch: &mut RowBatch) -> DbResult<()> {
        let Self { stmt, executor, .. } = self;
        let result = catch_unwind(AssertUnwindSafe(|| stmt.next(ctx, executor.as_mut(), batch)));
        if let Err(err) = recover(result, || stmt.text_to_log()) {
            self.last_err = Some(err.to_string());
            return Err(err);
        }

        let vars = &mut self.stmt.sctx.vars;
        if batch.is_empty() {
            vars.last_found_rows = vars.stmt_ctx.found_rows();
        } else {
            vars.stmt_ctx.add_found_rows(batch.num_rows() as u64);
        }
        Ok(())
    }

    fn new_batch(&self, alloc: Option<&dyn ChunkAllocator>) -> RowBatch {
        match alloc {
            None => new_first_chunk(self.executor.as_ref()),
            Some(alloc) => {
                let sizes = self.executor.chunk_sizes();
                alloc.alloc(self.executor.schema().len(), sizes.init_cap, sizes.max)
            }
        }
    }

    fn close(&mut self) -> DbResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.executor.close();
        self.stmt
            .close_record_set(self.txn_start_ts, self.last_err.take());
        result
    }

    fn on_fetch_returned(&mut self) {
        let succ = self.last_err.is_none();
        self.stmt.log_slow_query(self.txn_start_ts, succ, true);
    }
}

impl Drop for ExecutorRecordSet<'_, '_> {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            close_quietly(self.executor.as_mut());
            self.stmt
                .close_record_set(self.txn_start_ts, self.last_err.take());
        }
    }
}

/// Rows already produced by a `SELECT ... FOR UPDATE` attempt.
pub struct BufferedRecordSet<'a, 's> {
    stmt: &'a mut ExecStmt<'s>,
    schema: Schema,
    chunk_sizes: ChunkSizes,
    rows: Vec<Row>,
    cursor: usize,
    fields: Option<Vec<ResultField>>,
    closed: bool,
}

impl<'a, 's> BufferedRecordSet<'a, 's> {
    pub(crate) fn new(
        stmt: &'a mut ExecStmt<'s>,
        schema: Schema,
        chunk_sizes: ChunkSizes,
        rows: Vec<Row>,
    ) -> Self {
        Self {
            stmt,
            schema,
            chunk_sizes,
            rows,
            cursor: 0,
            fields: None,
            closed: false,
        }
    }
}

impl RecordSet for BufferedRecordSet<'_, '_> {
    fn fields(&mut self) -> &[ResultField] {
        let Self {
            stmt,
            schema,
            fields,
            ..
        } = self;
        fields.get_or_insert_with(|| {
            result_fields(schema, &stmt.output_names, &stmt.sctx.vars.current_db)
        })
    }

    fn next(&mut self, ctx: &ExecContext, batch: &mut RowBatch) -> DbResult<()> {
        ctx.check()?;
        batch.reset();
        while self.cursor < self.rows.len() && !batch.is_full() {
            batch.append_row(&self.rows[self.cursor])?;
            self.cursor += 1;
        }
        Ok(())
    }

    fn new_batch(&self, alloc: Option<&dyn ChunkAllocator>) -> RowBatch {
        let sizes = self.chunk_sizes;
        match alloc {
            None => RowBatch::with_sizes(self.schema.len(), sizes),
            Some(alloc) => alloc.alloc(self.schema.len(), sizes.init_cap, sizes.max),
        }
    }

    fn close(&mut self) -> DbResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let txn_ts = self.stmt.sctx.vars.txn_ctx.start_ts;
        self.stmt.close_record_set(txn_ts, None);
        Ok(())
    }
}

impl Drop for BufferedRecordSet<'_, '_> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
